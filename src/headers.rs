// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Codestream header structures and their bit-level decoders.

use crate::bit_reader::BitReader;
use crate::fields::{
    Bits, BitsOffset, Dist, Val, read_enum, read_extensions, read_f16, read_u32, read_u64, unpack_signed,
};
use crate::{Error, Result, ToUsize, TryVec};
use zencodec::Orientation;

const MAX_PREVIEW_DIM: u32 = 4096;
/// Group edge for VarDCT frames; modular frames use `128 << group_size_shift`.
const VARDCT_GROUP_DIM: u32 = 256;
const FLAG_USE_DC_FRAME: u64 = 32;

/// Outcome of decoding a header against input that may be incomplete.
pub(crate) enum Peek<T> {
    Ready { value: T, bits: u64 },
    NeedMoreInput,
}

/// Decodes one header starting `bit_pos` bits into `data`.
///
/// The read runs on a private reader; nothing is committed unless every bit
/// it needed was present. A read that ran past the end is reported as
/// [`Peek::NeedMoreInput`] even if it also produced an error, since the
/// error may be an artifact of the zero bits substituted past the end.
pub(crate) fn read_header<T>(
    data: &[u8],
    bit_pos: u64,
    read: impl FnOnce(&mut BitReader<'_>) -> Result<T>,
) -> Result<Peek<T>> {
    let mut reader = BitReader::at(data, bit_pos);
    let result = read(&mut reader);
    let bits = reader.total_bits_consumed();
    if !reader.close() {
        return Ok(Peek::NeedMoreInput);
    }
    Ok(Peek::Ready { value: result?, bits })
}

fn ratio_width(ratio: u32, ysize: u32) -> Result<u32> {
    let (num, den) = match ratio {
        1 => (1, 1),
        2 => (12, 10),
        3 => (4, 3),
        4 => (3, 2),
        5 => (16, 9),
        6 => (5, 4),
        _ => (2, 1),
    };
    u32::try_from(u64::from(ysize) * num / den).map_err(|_| Error::InvalidData("image width overflow"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeHeader {
    pub xsize: u32,
    pub ysize: u32,
}

impl SizeHeader {
    const DIM: [Dist; 4] = [BitsOffset(9, 1), BitsOffset(13, 1), BitsOffset(18, 1), BitsOffset(30, 1)];

    pub(crate) fn read(reader: &mut BitReader<'_>) -> Result<Self> {
        let small = reader.read_bool();
        let dim = |reader: &mut BitReader<'_>| -> Result<u32> {
            if small { Ok((reader.read_u32(5) + 1) * 8) } else { read_u32(reader, Self::DIM) }
        };
        let ysize = dim(reader)?;
        let ratio = reader.read_u32(3);
        let xsize = if ratio == 0 { dim(reader)? } else { ratio_width(ratio, ysize)? };
        Ok(Self { xsize, ysize })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreviewHeader {
    pub xsize: u32,
    pub ysize: u32,
}

impl PreviewHeader {
    const DIM_DIV8: [Dist; 4] = [Val(16), Val(32), BitsOffset(5, 1), BitsOffset(9, 33)];
    const DIM: [Dist; 4] = [BitsOffset(6, 1), BitsOffset(8, 65), BitsOffset(10, 321), BitsOffset(12, 1345)];

    pub(crate) fn read(reader: &mut BitReader<'_>) -> Result<Self> {
        let div8 = reader.read_bool();
        let dim = |reader: &mut BitReader<'_>| -> Result<u32> {
            if div8 { Ok(read_u32(reader, Self::DIM_DIV8)? * 8) } else { read_u32(reader, Self::DIM) }
        };
        let ysize = dim(reader)?;
        let ratio = reader.read_u32(3);
        let xsize = if ratio == 0 { dim(reader)? } else { ratio_width(ratio, ysize)? };
        if xsize > MAX_PREVIEW_DIM || ysize > MAX_PREVIEW_DIM {
            return Err(Error::InvalidData("preview dimensions too large"));
        }
        Ok(Self { xsize, ysize })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnimationHeader {
    pub tps_numerator: u32,
    pub tps_denominator: u32,
    pub num_loops: u32,
    pub have_timecodes: bool,
}

impl AnimationHeader {
    pub(crate) fn read(reader: &mut BitReader<'_>) -> Result<Self> {
        let tps_numerator = read_u32(reader, [Val(100), Val(1000), BitsOffset(10, 1), BitsOffset(30, 1)])?;
        let tps_denominator = read_u32(reader, [Val(1), Val(1001), BitsOffset(8, 1), BitsOffset(10, 1)])?;
        let num_loops = read_u32(reader, [Val(0), Bits(3), Bits(16), Bits(32)])?;
        let have_timecodes = reader.read_bool();
        Ok(Self { tps_numerator, tps_denominator, num_loops, have_timecodes })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitDepth {
    pub floating_point_sample: bool,
    pub bits_per_sample: u32,
    pub exponent_bits_per_sample: u32,
}

impl Default for BitDepth {
    fn default() -> Self {
        Self { floating_point_sample: false, bits_per_sample: 8, exponent_bits_per_sample: 0 }
    }
}

impl BitDepth {
    pub(crate) fn read(reader: &mut BitReader<'_>) -> Result<Self> {
        let floating_point_sample = reader.read_bool();
        if !floating_point_sample {
            let bits_per_sample = read_u32(reader, [Val(8), Val(10), Val(12), BitsOffset(6, 1)])?;
            if !(1..=31).contains(&bits_per_sample) {
                return Err(Error::InvalidData("invalid integer bit depth"));
            }
            return Ok(Self { floating_point_sample, bits_per_sample, exponent_bits_per_sample: 0 });
        }
        let bits_per_sample = read_u32(reader, [Val(32), Val(16), Val(24), BitsOffset(6, 1)])?;
        let exponent_bits_per_sample = reader.read_u32(4) + 1;
        if !(2..=8).contains(&exponent_bits_per_sample) {
            return Err(Error::InvalidData("invalid float exponent bits"));
        }
        let mantissa_bits = bits_per_sample.checked_sub(exponent_bits_per_sample + 1).unwrap_or(0);
        if !(2..=23).contains(&mantissa_bits) {
            return Err(Error::InvalidData("invalid float mantissa bits"));
        }
        Ok(Self { floating_point_sample, bits_per_sample, exponent_bits_per_sample })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtraChannelType {
    Alpha,
    Depth,
    SpotColor,
    SelectionMask,
    Black,
    Cfa,
    Thermal,
    Unknown,
    Optional,
}

impl ExtraChannelType {
    fn from_raw(value: u32) -> Result<Self> {
        Ok(match value {
            0 => Self::Alpha,
            1 => Self::Depth,
            2 => Self::SpotColor,
            3 => Self::SelectionMask,
            4 => Self::Black,
            5 => Self::Cfa,
            6 => Self::Thermal,
            15 => Self::Unknown,
            16 => Self::Optional,
            _ => return Err(Error::InvalidData("invalid extra channel type")),
        })
    }
}

#[derive(Debug)]
pub struct ExtraChannelInfo {
    pub channel_type: ExtraChannelType,
    pub bit_depth: BitDepth,
    pub dim_shift: u32,
    name: TryVec<u8>,
    pub alpha_associated: bool,
    pub spot_color: [f32; 4],
    pub cfa_channel: u32,
}

impl ExtraChannelInfo {
    fn default_alpha() -> Self {
        Self {
            channel_type: ExtraChannelType::Alpha,
            bit_depth: BitDepth::default(),
            dim_shift: 0,
            name: TryVec::new(),
            alpha_associated: false,
            spot_color: [0.0; 4],
            cfa_channel: 1,
        }
    }

    pub(crate) fn read(reader: &mut BitReader<'_>) -> Result<Self> {
        if reader.read_bool() {
            return Ok(Self::default_alpha());
        }
        let channel_type = ExtraChannelType::from_raw(read_enum(reader)?)?;
        let bit_depth = BitDepth::read(reader)?;
        let dim_shift = read_u32(reader, [Val(0), Val(3), Val(4), BitsOffset(3, 1)])?;
        let name = read_name(reader)?;
        let alpha_associated = channel_type == ExtraChannelType::Alpha && reader.read_bool();
        let mut spot_color = [0.0; 4];
        if channel_type == ExtraChannelType::SpotColor {
            for c in &mut spot_color {
                *c = read_f16(reader)?;
            }
        }
        let cfa_channel = if channel_type == ExtraChannelType::Cfa {
            read_u32(reader, [Val(1), Bits(2), BitsOffset(4, 3), BitsOffset(8, 19)])?
        } else {
            1
        };
        Ok(Self { channel_type, bit_depth, dim_shift, name, alpha_associated, spot_color, cfa_channel })
    }

    pub fn name(&self) -> &str {
        std::str::from_utf8(&self.name).unwrap_or_default()
    }
}

/// Length-prefixed UTF-8 name shared by extra channels and frames.
fn read_name(reader: &mut BitReader<'_>) -> Result<TryVec<u8>> {
    let len = read_u32(reader, [Val(0), Bits(4), BitsOffset(5, 16), BitsOffset(10, 48)])?;
    let mut name = TryVec::with_capacity(len.to_usize())?;
    for _ in 0..len {
        name.push(reader.read(8) as u8)?;
    }
    if std::str::from_utf8(&name).is_err() {
        return Err(Error::InvalidData("name is not valid UTF-8"));
    }
    Ok(name)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorSpace {
    Rgb,
    Gray,
    Xyb,
    Unknown,
}

/// Chromaticity coordinate scaled by 10^6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CustomXy {
    pub x: i32,
    pub y: i32,
}

impl CustomXy {
    fn read(reader: &mut BitReader<'_>) -> Result<Self> {
        const ENC: [Dist; 4] =
            [Bits(19), BitsOffset(19, 524_288), BitsOffset(20, 1_048_576), BitsOffset(21, 2_097_152)];
        let x = unpack_signed(read_u32(reader, ENC)?);
        let y = unpack_signed(read_u32(reader, ENC)?);
        Ok(Self { x, y })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WhitePoint {
    D65,
    Custom(CustomXy),
    E,
    Dci,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Primaries {
    Srgb,
    Custom { red: CustomXy, green: CustomXy, blue: CustomXy },
    Bt2100,
    P3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferFunction {
    Bt709,
    Unknown,
    Linear,
    Srgb,
    Pq,
    Dci,
    Hlg,
    /// Reciprocal gamma scaled by 10^7.
    Gamma(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderingIntent {
    Perceptual,
    Relative,
    Saturation,
    Absolute,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColorEncoding {
    /// The actual encoding is an ICC profile stored after the image metadata.
    pub want_icc: bool,
    pub color_space: ColorSpace,
    pub white_point: WhitePoint,
    pub primaries: Primaries,
    pub transfer_function: TransferFunction,
    pub rendering_intent: RenderingIntent,
}

impl Default for ColorEncoding {
    fn default() -> Self {
        Self::srgb(false)
    }
}

impl ColorEncoding {
    pub fn srgb(gray: bool) -> Self {
        Self {
            want_icc: false,
            color_space: if gray { ColorSpace::Gray } else { ColorSpace::Rgb },
            white_point: WhitePoint::D65,
            primaries: Primaries::Srgb,
            transfer_function: TransferFunction::Srgb,
            rendering_intent: RenderingIntent::Relative,
        }
    }

    pub fn linear_srgb(gray: bool) -> Self {
        Self { transfer_function: TransferFunction::Linear, ..Self::srgb(gray) }
    }

    pub fn is_gray(&self) -> bool {
        self.color_space == ColorSpace::Gray
    }

    pub(crate) fn read(reader: &mut BitReader<'_>) -> Result<Self> {
        let mut encoding = Self::default();
        if reader.read_bool() {
            return Ok(encoding);
        }
        encoding.want_icc = reader.read_bool();
        encoding.color_space = match read_enum(reader)? {
            0 => ColorSpace::Rgb,
            1 => ColorSpace::Gray,
            2 => ColorSpace::Xyb,
            3 => ColorSpace::Unknown,
            _ => return Err(Error::InvalidData("invalid color space")),
        };
        if encoding.want_icc {
            return Ok(encoding);
        }
        if encoding.color_space != ColorSpace::Xyb {
            encoding.white_point = match read_enum(reader)? {
                1 => WhitePoint::D65,
                2 => WhitePoint::Custom(CustomXy::read(reader)?),
                10 => WhitePoint::E,
                11 => WhitePoint::Dci,
                _ => return Err(Error::InvalidData("invalid white point")),
            };
        }
        if encoding.color_space != ColorSpace::Xyb && encoding.color_space != ColorSpace::Gray {
            encoding.primaries = match read_enum(reader)? {
                1 => Primaries::Srgb,
                2 => Primaries::Custom {
                    red: CustomXy::read(reader)?,
                    green: CustomXy::read(reader)?,
                    blue: CustomXy::read(reader)?,
                },
                9 => Primaries::Bt2100,
                11 => Primaries::P3,
                _ => return Err(Error::InvalidData("invalid primaries")),
            };
        }
        encoding.transfer_function = if reader.read_bool() {
            let gamma = reader.read_u32(24);
            if gamma == 0 || gamma > 10_000_000 {
                return Err(Error::InvalidData("invalid gamma"));
            }
            TransferFunction::Gamma(gamma)
        } else {
            match read_enum(reader)? {
                1 => TransferFunction::Bt709,
                2 => TransferFunction::Unknown,
                8 => TransferFunction::Linear,
                13 => TransferFunction::Srgb,
                16 => TransferFunction::Pq,
                17 => TransferFunction::Dci,
                18 => TransferFunction::Hlg,
                _ => return Err(Error::InvalidData("invalid transfer function")),
            }
        };
        encoding.rendering_intent = match read_enum(reader)? {
            0 => RenderingIntent::Perceptual,
            1 => RenderingIntent::Relative,
            2 => RenderingIntent::Saturation,
            3 => RenderingIntent::Absolute,
            _ => return Err(Error::InvalidData("invalid rendering intent")),
        };
        Ok(encoding)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ToneMapping {
    pub intensity_target: f32,
    pub min_nits: f32,
    pub relative_to_max_display: bool,
    pub linear_below: f32,
}

impl Default for ToneMapping {
    fn default() -> Self {
        Self { intensity_target: 255.0, min_nits: 0.0, relative_to_max_display: false, linear_below: 0.0 }
    }
}

impl ToneMapping {
    fn read(reader: &mut BitReader<'_>) -> Result<Self> {
        if reader.read_bool() {
            return Ok(Self::default());
        }
        let intensity_target = read_f16(reader)?;
        let min_nits = read_f16(reader)?;
        let relative_to_max_display = reader.read_bool();
        let linear_below = read_f16(reader)?;
        if intensity_target <= 0.0 || min_nits < 0.0 || min_nits > intensity_target {
            return Err(Error::InvalidData("invalid tone mapping"));
        }
        Ok(Self { intensity_target, min_nits, relative_to_max_display, linear_below })
    }
}

/// Image-wide metadata following the size header.
#[derive(Debug)]
pub struct ImageMetadata {
    pub orientation: Orientation,
    pub intrinsic_size: Option<SizeHeader>,
    pub preview: Option<PreviewHeader>,
    pub animation: Option<AnimationHeader>,
    pub bit_depth: BitDepth,
    pub modular_16_bit_buffer_sufficient: bool,
    pub extra_channels: TryVec<ExtraChannelInfo>,
    pub xyb_encoded: bool,
    pub color_encoding: ColorEncoding,
    pub tone_mapping: ToneMapping,
    pub extensions: u64,
}

impl Default for ImageMetadata {
    fn default() -> Self {
        Self {
            orientation: Orientation::Identity,
            intrinsic_size: None,
            preview: None,
            animation: None,
            bit_depth: BitDepth::default(),
            modular_16_bit_buffer_sufficient: true,
            extra_channels: TryVec::new(),
            xyb_encoded: true,
            color_encoding: ColorEncoding::default(),
            tone_mapping: ToneMapping::default(),
            extensions: 0,
        }
    }
}

impl ImageMetadata {
    pub(crate) fn read(reader: &mut BitReader<'_>) -> Result<Self> {
        let mut metadata = Self::default();
        if reader.read_bool() {
            return Ok(metadata);
        }
        let extra_fields = reader.read_bool();
        if extra_fields {
            metadata.orientation = Orientation::from_exif(reader.read(3) as u8 + 1)
                .ok_or(Error::InvalidData("invalid orientation"))?;
            if reader.read_bool() {
                metadata.intrinsic_size = Some(SizeHeader::read(reader)?);
            }
            if reader.read_bool() {
                metadata.preview = Some(PreviewHeader::read(reader)?);
            }
            if reader.read_bool() {
                metadata.animation = Some(AnimationHeader::read(reader)?);
            }
        }
        metadata.bit_depth = BitDepth::read(reader)?;
        metadata.modular_16_bit_buffer_sufficient = reader.read_bool();
        let num_extra_channels = read_u32(reader, [Val(0), Val(1), BitsOffset(4, 2), BitsOffset(12, 1)])?;
        for _ in 0..num_extra_channels {
            metadata.extra_channels.push(ExtraChannelInfo::read(reader)?)?;
            if !reader.all_reads_within_bounds() {
                // The result is discarded; don't keep allocating for a truncated count.
                return Ok(metadata);
            }
        }
        metadata.xyb_encoded = reader.read_bool();
        metadata.color_encoding = ColorEncoding::read(reader)?;
        if extra_fields {
            metadata.tone_mapping = ToneMapping::read(reader)?;
        }
        metadata.extensions = read_extensions(reader)?;
        Ok(metadata)
    }

    pub fn have_preview(&self) -> bool {
        self.preview.is_some()
    }

    pub fn have_animation(&self) -> bool {
        self.animation.is_some()
    }

    pub(crate) fn alpha_channel(&self) -> Option<&ExtraChannelInfo> {
        self.extra_channels.iter().find(|ec| ec.channel_type == ExtraChannelType::Alpha)
    }
}

/// Skips the upsampling weights and opsin matrix that follow the metadata.
pub(crate) fn read_transform_data(reader: &mut BitReader<'_>, xyb_encoded: bool) -> Result<()> {
    if reader.read_bool() {
        return Ok(());
    }
    if xyb_encoded && !reader.read_bool() {
        // inverse matrix, opsin biases, quant biases
        for _ in 0..9 + 3 + 4 {
            read_f16(reader)?;
        }
    }
    let custom_weights_mask = reader.read(3);
    for (bit, count) in [(1, 15), (2, 55), (4, 210)] {
        if custom_weights_mask & bit != 0 {
            for _ in 0..count {
                read_f16(reader)?;
            }
        }
    }
    Ok(())
}

/// Length of the encoded ICC stream; the caller then aligns to a byte.
pub(crate) fn read_icc_length(reader: &mut BitReader<'_>) -> Result<u64> {
    let len = read_u64(reader)?;
    reader.jump_to_byte_boundary()?;
    Ok(len)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Regular,
    Dc,
    ReferenceOnly,
    SkipProgressive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameEncoding {
    VarDct,
    Modular,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlendMode {
    Replace,
    Add,
    Blend,
    AlphaWeightedAdd,
    Mul,
}

/// Frame geometry in pixels and groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameDimensions {
    /// Size after upsampling, as composited.
    pub xsize_upsampled: u32,
    pub ysize_upsampled: u32,
    /// Size of the coded planes.
    pub xsize: u32,
    pub ysize: u32,
    pub group_dim: u32,
    pub xsize_groups: u64,
    pub ysize_groups: u64,
    pub num_groups: u64,
    pub xsize_dc_groups: u64,
    pub ysize_dc_groups: u64,
    pub num_dc_groups: u64,
}

impl FrameDimensions {
    fn new(xsize_upsampled: u32, ysize_upsampled: u32, upsampling: u32, group_dim: u32) -> Self {
        let xsize = xsize_upsampled.div_ceil(upsampling);
        let ysize = ysize_upsampled.div_ceil(upsampling);
        let xsize_groups = u64::from(xsize.div_ceil(group_dim));
        let ysize_groups = u64::from(ysize.div_ceil(group_dim));
        let dc_group_dim = group_dim * 8;
        let xsize_dc_groups = u64::from(xsize.div_ceil(dc_group_dim));
        let ysize_dc_groups = u64::from(ysize.div_ceil(dc_group_dim));
        Self {
            xsize_upsampled,
            ysize_upsampled,
            xsize,
            ysize,
            group_dim,
            xsize_groups,
            ysize_groups,
            num_groups: xsize_groups * ysize_groups,
            xsize_dc_groups,
            ysize_dc_groups,
            num_dc_groups: xsize_dc_groups * ysize_dc_groups,
        }
    }
}

/// Context a frame header is parsed against.
#[derive(Clone, Copy)]
pub(crate) struct FrameHeaderContext<'a> {
    pub metadata: &'a ImageMetadata,
    /// Image size, or preview size for the preview frame.
    pub xsize: u32,
    pub ysize: u32,
    pub is_preview: bool,
}

#[derive(Debug)]
pub struct FrameHeader {
    pub frame_type: FrameType,
    pub encoding: FrameEncoding,
    pub flags: u64,
    pub do_ycbcr: bool,
    pub upsampling: u32,
    pub group_size_shift: u32,
    pub num_passes: u32,
    pub dc_level: u32,
    pub custom_size_or_origin: bool,
    pub x0: i32,
    pub y0: i32,
    pub blend_mode: BlendMode,
    pub blend_source: u32,
    pub duration: u32,
    pub timecode: u32,
    pub is_last: bool,
    pub save_as_reference: u32,
    pub save_before_color_transform: bool,
    name: TryVec<u8>,
    pub extensions: u64,
    pub is_preview: bool,
    pub dimensions: FrameDimensions,
}

impl FrameHeader {
    const POSITION: [Dist; 4] = [Bits(8), BitsOffset(11, 256), BitsOffset(14, 2304), BitsOffset(30, 18688)];
    const UPSAMPLING: [Dist; 4] = [Val(1), Val(2), Val(4), Val(8)];

    pub(crate) fn read(reader: &mut BitReader<'_>, ctx: FrameHeaderContext<'_>) -> Result<Self> {
        let metadata = ctx.metadata;
        let mut header = Self {
            frame_type: FrameType::Regular,
            encoding: FrameEncoding::VarDct,
            flags: 0,
            do_ycbcr: false,
            upsampling: 1,
            group_size_shift: 1,
            num_passes: 1,
            dc_level: 0,
            custom_size_or_origin: false,
            x0: 0,
            y0: 0,
            blend_mode: BlendMode::Replace,
            blend_source: 0,
            duration: 0,
            timecode: 0,
            is_last: true,
            save_as_reference: 0,
            save_before_color_transform: false,
            name: TryVec::new(),
            extensions: 0,
            is_preview: ctx.is_preview,
            dimensions: FrameDimensions::default(),
        };
        let mut xsize = ctx.xsize;
        let mut ysize = ctx.ysize;

        if !reader.read_bool() {
            header.frame_type = match reader.read(2) {
                0 => FrameType::Regular,
                1 => FrameType::Dc,
                2 => FrameType::ReferenceOnly,
                _ => FrameType::SkipProgressive,
            };
            header.encoding = if reader.read_bool() { FrameEncoding::Modular } else { FrameEncoding::VarDct };
            header.flags = read_u64(reader)?;
            if !metadata.xyb_encoded {
                header.do_ycbcr = reader.read_bool();
            }
            if header.flags & FLAG_USE_DC_FRAME == 0 {
                if header.do_ycbcr {
                    // chroma subsampling mode per channel
                    reader.skip_bits(3 * 2);
                }
                header.upsampling = read_u32(reader, Self::UPSAMPLING)?;
                for _ in 0..metadata.extra_channels.len() {
                    read_u32(reader, Self::UPSAMPLING)?;
                }
            }
            if header.encoding == FrameEncoding::Modular {
                header.group_size_shift = reader.read_u32(2);
            }
            if header.encoding == FrameEncoding::VarDct && metadata.xyb_encoded {
                // x and b quant matrix scales
                reader.skip_bits(3 + 3);
            }
            if header.frame_type != FrameType::ReferenceOnly {
                header.num_passes = read_passes(reader)?;
            }
            if header.frame_type == FrameType::Dc {
                header.dc_level = read_u32(reader, [Val(1), Val(2), Val(3), Val(4)])?;
            } else {
                header.custom_size_or_origin = reader.read_bool();
            }
            let displayed = matches!(header.frame_type, FrameType::Regular | FrameType::SkipProgressive);
            if header.custom_size_or_origin {
                if displayed {
                    header.x0 = unpack_signed(read_u32(reader, Self::POSITION)?);
                    header.y0 = unpack_signed(read_u32(reader, Self::POSITION)?);
                }
                xsize = read_u32(reader, Self::POSITION)?;
                ysize = read_u32(reader, Self::POSITION)?;
            }
            let full_frame = !header.custom_size_or_origin
                || (header.x0 <= 0
                    && header.y0 <= 0
                    && i64::from(xsize) + i64::from(header.x0) >= i64::from(ctx.xsize)
                    && i64::from(ysize) + i64::from(header.y0) >= i64::from(ctx.ysize));
            if displayed {
                let num_extra_channels = metadata.extra_channels.len();
                (header.blend_mode, header.blend_source) = read_blending_info(reader, num_extra_channels, full_frame)?;
                for _ in 0..num_extra_channels {
                    read_blending_info(reader, num_extra_channels, full_frame)?;
                }
                if let (Some(animation), false) = (&metadata.animation, ctx.is_preview) {
                    header.duration = read_u32(reader, [Val(0), Val(1), Bits(8), Bits(32)])?;
                    if animation.have_timecodes {
                        header.timecode = reader.read_u32(32);
                    }
                }
                header.is_last = reader.read_bool();
            } else {
                header.is_last = false;
            }
            if header.frame_type != FrameType::Dc && !header.is_last {
                header.save_as_reference = reader.read_u32(2);
            }
            if header.frame_type == FrameType::ReferenceOnly
                || (full_frame
                    && displayed
                    && header.blend_mode == BlendMode::Replace
                    && (header.duration == 0 || header.save_as_reference != 0)
                    && !header.is_last)
            {
                header.save_before_color_transform = reader.read_bool();
            }
            header.name = read_name(reader)?;
            skip_loop_filter(reader, header.encoding == FrameEncoding::Modular)?;
            header.extensions = read_extensions(reader)?;
        }

        if header.frame_type == FrameType::Dc {
            let shift = 3 * header.dc_level;
            xsize = xsize.div_ceil(1 << shift);
            ysize = ysize.div_ceil(1 << shift);
        }
        if xsize == 0 || ysize == 0 {
            return Err(Error::InvalidData("empty frame"));
        }
        let group_dim = match header.encoding {
            FrameEncoding::VarDct => VARDCT_GROUP_DIM,
            FrameEncoding::Modular => 128 << header.group_size_shift,
        };
        header.dimensions = FrameDimensions::new(xsize, ysize, header.upsampling, group_dim);
        Ok(header)
    }

    /// Whether a later frame may read this one from a storage slot.
    pub fn can_be_referenced(&self) -> bool {
        !self.is_last && self.frame_type != FrameType::Dc && (self.duration == 0 || self.save_as_reference != 0)
    }

    /// Bitmask of storage slots this frame is saved into.
    pub fn saved_as(&self) -> u8 {
        if self.frame_type == FrameType::Dc {
            1 << (4 + self.dc_level - 1)
        } else if self.can_be_referenced() {
            1 << self.save_as_reference
        } else {
            0
        }
    }

    /// A frame that completes what is shown at one point in time.
    pub fn is_last_of_still(&self) -> bool {
        self.is_last || self.duration > 0
    }

    pub fn name(&self) -> &str {
        std::str::from_utf8(&self.name).unwrap_or_default()
    }

    pub(crate) fn num_toc_entries(&self) -> Result<u64> {
        let dims = &self.dimensions;
        if dims.num_groups == 1 && self.num_passes == 1 {
            return Ok(1);
        }
        dims.num_groups
            .checked_mul(u64::from(self.num_passes))
            .and_then(|ac| ac.checked_add(dims.num_dc_groups + 2))
            .ok_or(Error::InvalidData("too many frame sections"))
    }
}

fn read_passes(reader: &mut BitReader<'_>) -> Result<u32> {
    let num_passes = read_u32(reader, [Val(1), Val(2), Val(3), BitsOffset(3, 4)])?;
    if num_passes != 1 {
        let num_downsample = read_u32(reader, [Val(0), Val(1), Val(2), BitsOffset(1, 3)])?;
        if num_downsample >= num_passes {
            return Err(Error::InvalidData("too many downsampled passes"));
        }
        // per-pass coefficient shift
        reader.skip_bits(2 * u64::from(num_passes - 1));
        for _ in 0..num_downsample {
            read_u32(reader, [Val(1), Val(2), Val(4), Val(8)])?;
        }
        for _ in 0..num_downsample {
            let last_pass = read_u32(reader, [Val(0), Val(1), Val(2), Bits(3)])?;
            if last_pass >= num_passes {
                return Err(Error::InvalidData("invalid last pass"));
            }
        }
    }
    Ok(num_passes)
}

fn read_blending_info(reader: &mut BitReader<'_>, num_extra_channels: usize, full_frame: bool) -> Result<(BlendMode, u32)> {
    let mode = match read_u32(reader, [Val(0), Val(1), Val(2), BitsOffset(2, 3)])? {
        0 => BlendMode::Replace,
        1 => BlendMode::Add,
        2 => BlendMode::Blend,
        3 => BlendMode::AlphaWeightedAdd,
        4 => BlendMode::Mul,
        _ => return Err(Error::InvalidData("invalid blend mode")),
    };
    if num_extra_channels > 0 {
        if matches!(mode, BlendMode::Blend | BlendMode::AlphaWeightedAdd) {
            // alpha channel index
            read_u32(reader, [Val(0), Val(1), Val(2), BitsOffset(3, 3)])?;
        }
        if matches!(mode, BlendMode::Blend | BlendMode::AlphaWeightedAdd | BlendMode::Mul) {
            // clamp
            reader.read_bool();
        }
    }
    let source = if mode != BlendMode::Replace || !full_frame { reader.read_u32(2) } else { 0 };
    Ok((mode, source))
}

/// Restoration filter parameters only matter to pixel reconstruction.
fn skip_loop_filter(reader: &mut BitReader<'_>, modular: bool) -> Result<()> {
    let skip_f16 = |reader: &mut BitReader<'_>, count: usize| -> Result<()> {
        for _ in 0..count {
            read_f16(reader)?;
        }
        Ok(())
    };
    if reader.read_bool() {
        return Ok(());
    }
    let gab = reader.read_bool();
    if gab && reader.read_bool() {
        skip_f16(reader, 6)?;
    }
    let epf_iters = reader.read(2);
    if epf_iters > 0 {
        if !modular && reader.read_bool() {
            skip_f16(reader, 8)?;
        }
        if reader.read_bool() {
            skip_f16(reader, 3 + 2)?;
        }
        if reader.read_bool() {
            if !modular {
                skip_f16(reader, 1)?;
            }
            skip_f16(reader, 3)?;
        }
        if modular {
            skip_f16(reader, 1)?;
        }
    }
    read_extensions(reader)?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TocEntry {
    /// Offset from the first byte after the TOC.
    pub offset: u64,
    pub size: u64,
}

/// Byte layout of a frame's sections.
#[derive(Debug)]
pub struct Toc {
    pub entries: TryVec<TocEntry>,
    /// Sum of all section sizes.
    pub total_size: u64,
}

impl Toc {
    pub(crate) fn read(reader: &mut BitReader<'_>, num_entries: u64) -> Result<Self> {
        const SIZE: [Dist; 4] =
            [Bits(10), BitsOffset(14, 1024), BitsOffset(22, 17408), BitsOffset(30, 4_211_712)];
        if reader.read_bool() {
            return Err(Error::Unsupported("permuted TOC"));
        }
        reader.jump_to_byte_boundary()?;
        let mut entries = TryVec::new();
        let mut offset = 0u64;
        for _ in 0..num_entries {
            let size = u64::from(read_u32(reader, SIZE)?);
            if !reader.all_reads_within_bounds() {
                return Ok(Self { entries, total_size: offset });
            }
            entries.push(TocEntry { offset, size })?;
            offset = offset.checked_add(size).ok_or(Error::InvalidData("TOC size overflow"))?;
        }
        reader.jump_to_byte_boundary()?;
        Ok(Self { entries, total_size: offset })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bit_reader::BitWriter;

    fn small_size(w: &mut BitWriter, xsize: u32, ysize: u32) {
        w.write_bool(true);
        w.write(u64::from(ysize / 8 - 1), 5);
        w.write(0, 3);
        w.write(u64::from(xsize / 8 - 1), 5);
    }

    #[test]
    fn size_header_forms() {
        let mut w = BitWriter::new();
        small_size(&mut w, 64, 32);
        // large form, height 300, 16:9 ratio
        w.write_bool(false);
        w.write(0, 2);
        w.write(299, 9);
        w.write(5, 3);
        let bytes = w.finish();
        let mut r = BitReader::new(&bytes);
        assert_eq!(SizeHeader::read(&mut r).unwrap(), SizeHeader { xsize: 64, ysize: 32 });
        assert_eq!(SizeHeader::read(&mut r).unwrap(), SizeHeader { xsize: 533, ysize: 300 });
        assert!(r.close());
    }

    #[test]
    fn preview_limit() {
        let mut w = BitWriter::new();
        w.write_bool(false);
        w.write(3, 2);
        w.write(4096 - 1345 + 1, 12);
        w.write(1, 3);
        let bytes = w.finish();
        let mut r = BitReader::new(&bytes);
        assert!(PreviewHeader::read(&mut r).is_err());
    }

    #[test]
    fn all_default_metadata() {
        let mut r = BitReader::new(&[0x01]);
        let metadata = ImageMetadata::read(&mut r).unwrap();
        assert!(metadata.xyb_encoded);
        assert_eq!(metadata.color_encoding, ColorEncoding::srgb(false));
        assert_eq!(metadata.bit_depth.bits_per_sample, 8);
        assert_eq!(metadata.orientation, Orientation::Identity);
        assert!(r.close());
    }

    #[test]
    fn hand_encoded_bytes() {
        // 8x8 small size header followed by all-default metadata
        let mut r = BitReader::new(&[0x41, 0x02]);
        assert_eq!(SizeHeader::read(&mut r).unwrap(), SizeHeader { xsize: 8, ysize: 8 });
        assert!(ImageMetadata::read(&mut r).unwrap().xyb_encoded);
        assert_eq!(r.total_bits_consumed(), 15);
        assert!(r.close());

        // extra fields with EXIF orientation 6, everything else default
        let mut r = BitReader::new(&[0x16, 0xc8, 0x01]);
        let metadata = ImageMetadata::read(&mut r).unwrap();
        assert_eq!(metadata.orientation, Orientation::Rotate90);
        assert!(metadata.modular_16_bit_buffer_sufficient);
        assert_eq!(metadata.color_encoding, ColorEncoding::srgb(false));
        assert_eq!(r.total_bits_consumed(), 19);
        assert!(r.close());
    }

    #[test]
    fn truncated_header_needs_more_input() {
        let mut w = BitWriter::new();
        small_size(&mut w, 64, 32);
        let bytes = w.finish();
        assert!(matches!(read_header(&bytes[..1], 0, SizeHeader::read).unwrap(), Peek::NeedMoreInput));
        match read_header(&bytes, 0, SizeHeader::read).unwrap() {
            Peek::Ready { value, bits } => {
                assert_eq!(value.xsize, 64);
                assert_eq!(bits, 14);
            },
            Peek::NeedMoreInput => panic!("complete header"),
        }
    }

    #[test]
    fn invalid_enum_is_fatal_when_in_bounds() {
        let mut w = BitWriter::new();
        w.write_bool(false); // not all_default
        w.write_bool(false); // want_icc
        w.write(3, 2); // color space via BitsOffset(6, 18)
        w.write(0, 6);
        w.write(0, 8);
        let bytes = w.finish();
        assert!(read_header(&bytes, 0, ColorEncoding::read).is_err());
    }

    #[test]
    fn saved_as_slots() {
        let metadata = ImageMetadata::default();
        let ctx = FrameHeaderContext { metadata: &metadata, xsize: 64, ysize: 64, is_preview: false };
        let mut r = BitReader::new(&[0x01]);
        let mut header = FrameHeader::read(&mut r, ctx).unwrap();
        assert!(header.is_last);
        assert_eq!(header.saved_as(), 0);
        assert_eq!(header.num_toc_entries().unwrap(), 1);

        header.is_last = false;
        header.save_as_reference = 2;
        assert_eq!(header.saved_as(), 1 << 2);
        header.frame_type = FrameType::Dc;
        header.dc_level = 2;
        assert_eq!(header.saved_as(), 1 << 5);
    }

    #[test]
    fn toc_entries() {
        let mut w = BitWriter::new();
        w.write_bool(false);
        w.zero_pad_to_byte();
        w.write(0, 2);
        w.write(5, 10);
        w.write(1, 2);
        w.write(0, 14);
        w.zero_pad_to_byte();
        let bytes = w.finish();
        let mut r = BitReader::new(&bytes);
        let toc = Toc::read(&mut r, 2).unwrap();
        assert_eq!(&toc.entries[..], &[TocEntry { offset: 0, size: 5 }, TocEntry { offset: 5, size: 1024 }]);
        assert_eq!(toc.total_size, 1029);
        assert!(r.close());
    }
}
