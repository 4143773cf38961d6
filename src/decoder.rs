// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The incremental decoder.
//!
//! [`Decoder::process`] is driven repeatedly with whatever input is at hand.
//! Each call makes as much progress as the input allows and returns a
//! [`Status`]: either a subscribed event, a request for more input or an
//! output buffer, or [`Status::Success`] once the last frame has been handled.

use enough::{Stop, Unstoppable};
use log::{debug, trace, warn};
use zencodec::Orientation;

use crate::backend::{FrameBackend, FrameContext, FrameDecoder};
use crate::container::{BoxScanner, InputMode, Scan, Signature, signature_check};
use crate::frame_deps::FrameDependencies;
use crate::headers::{
    AnimationHeader, ColorEncoding, ColorSpace, ExtraChannelInfo, FrameHeader, FrameHeaderContext, FrameType,
    ImageMetadata, Peek, PreviewHeader, SizeHeader, Toc, read_header, read_icc_length, read_transform_data,
};
use crate::output::{BufferSlot, ImageOut, OutputChannels, OutputRequest, PixelFormat, PixelSink, RowCallback};
use crate::sections::{ParallelRunner, Sections, SequentialRunner};
use crate::{Error, Result, ToU64, TryVec};

/// Bits taken by the codestream signature.
const SIGNATURE_BITS: u64 = 16;

/// Informative events a caller can subscribe to, as a bit set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Events(u32);

impl Events {
    pub const NONE: Self = Self(0);
    pub const BASIC_INFO: Self = Self(0x40);
    pub const EXTENSIONS: Self = Self(0x80);
    pub const COLOR_ENCODING: Self = Self(0x100);
    pub const PREVIEW_IMAGE: Self = Self(0x200);
    pub const FRAME: Self = Self(0x400);
    pub const FULL_IMAGE: Self = Self(0x1000);
    pub const JPEG_RECONSTRUCTION: Self = Self(0x2000);

    /// Low bits are reserved for non-event statuses and refused by
    /// [`Decoder::subscribe_events`].
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }
}

impl std::ops::BitOr for Events {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl std::ops::BitAnd for Events {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

/// Outcome of one [`Decoder::process`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// The final frame has been handled. Further calls are an error.
    Success,
    /// Call again with the unconsumed input followed by more bytes.
    NeedMoreInput,
    NeedPreviewOutBuffer,
    NeedImageOutBuffer,
    BasicInfo,
    Extensions,
    ColorEncoding,
    PreviewImage,
    /// A displayed frame header is available through [`Decoder::frame_header`].
    Frame,
    FullImage,
    JpegReconstruction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderStage {
    Inited,
    Started,
    Finished,
    Error,
}

/// Progress within the current frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStage {
    Header,
    Toc,
    Full,
    FullOutput,
}

/// Selects between the profile the image was encoded with and the one
/// pixels are delivered in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorProfileTarget {
    Original,
    Data,
}

/// Limits that bound the work and memory a hostile file can cost.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct DecodeConfig {
    /// Largest allowed image or frame, in pixels.
    ///
    /// Default: 1 << 30
    pub max_pixels: Option<u64>,

    /// Total frame pixels the decoder may reconstruct per session.
    ///
    /// Default: 5 << 30
    pub max_decoded_pixels: Option<u64>,

    /// Largest amount of codestream the decoder copies into its own buffer.
    ///
    /// Default: 1 GB
    pub max_codestream_buffer: Option<u64>,

    /// Most frames (including non-displayed ones) a codestream may hold.
    ///
    /// Default: 100_000
    pub max_frames: Option<u32>,
}

impl Default for DecodeConfig {
    fn default() -> Self {
        Self {
            max_pixels: Some(1 << 30),
            max_decoded_pixels: Some(5 << 30),
            max_codestream_buffer: Some(1_000_000_000),
            max_frames: Some(100_000),
        }
    }
}

impl DecodeConfig {
    /// No limits at all. Only use this for trusted input.
    pub fn unlimited() -> Self {
        Self { max_pixels: None, max_decoded_pixels: None, max_codestream_buffer: None, max_frames: None }
    }

    /// Also bounds the decoded pixel total to five times this.
    pub fn with_max_pixels(mut self, limit: u64) -> Self {
        self.max_pixels = Some(limit);
        self.max_decoded_pixels = Some(limit.saturating_mul(5));
        self
    }

    pub fn with_max_decoded_pixels(mut self, limit: u64) -> Self {
        self.max_decoded_pixels = Some(limit);
        self
    }

    pub fn with_max_codestream_buffer(mut self, limit: u64) -> Self {
        self.max_codestream_buffer = Some(limit);
        self
    }

    pub fn with_max_frames(mut self, limit: u32) -> Self {
        self.max_frames = Some(limit);
        self
    }
}

/// Image-wide properties, available once [`Status::BasicInfo`] was reached.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BasicInfo {
    pub have_container: bool,
    /// Dimensions after orientation, unless orientation is kept.
    pub xsize: u32,
    pub ysize: u32,
    pub bits_per_sample: u32,
    pub exponent_bits_per_sample: u32,
    pub intensity_target: f32,
    pub min_nits: f32,
    pub relative_to_max_display: bool,
    pub linear_below: f32,
    pub uses_original_profile: bool,
    pub preview: Option<PreviewHeader>,
    pub animation: Option<AnimationHeader>,
    /// [`Orientation::Identity`] unless orientation is kept.
    pub orientation: Orientation,
    pub num_color_channels: u32,
    pub num_extra_channels: u32,
    pub alpha_bits: u32,
    pub alpha_exponent_bits: u32,
    pub alpha_premultiplied: bool,
}

impl BasicInfo {
    pub fn have_preview(&self) -> bool {
        self.preview.is_some()
    }

    pub fn have_animation(&self) -> bool {
        self.animation.is_some()
    }
}

/// Timing of the frame announced by [`Status::Frame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    /// In ticks of the animation header's time base.
    pub duration: u32,
    pub timecode: u32,
    pub name_length: usize,
    pub is_last: bool,
}

/// Caller buffer receiving a reconstructed JPEG file.
#[derive(Debug)]
pub struct JpegOutput {
    pub data: TryVec<u8>,
    /// Bytes of `data` written so far.
    pub len: usize,
}

#[derive(Debug)]
struct ImageHeaders {
    size: SizeHeader,
    metadata: ImageMetadata,
    /// Codestream bit position right after the image metadata.
    header_bits: u64,
}

#[derive(Debug)]
struct ParsedFrame {
    header: FrameHeader,
    toc: Toc,
    /// Offset of the first section from the frame start.
    sections_begin: u64,
    /// Header, TOC and all sections.
    size: u64,
}

/// Everything that describes progress through one stream.
struct Session<F> {
    stage: DecoderStage,
    /// Subscribed events not yet delivered.
    events: Events,
    got_signature: bool,
    scanner: BoxScanner,
    mode: InputMode,

    image: Option<ImageHeaders>,
    got_all_headers: bool,
    post_headers: bool,
    got_preview_image: bool,
    icc: Option<TryVec<u8>>,
    output_encoding: ColorEncoding,
    jpeg_data: Option<TryVec<u8>>,

    /// Codestream offset of the current frame.
    frame_start: u64,
    frame_size: u64,
    frame_stage: FrameStage,
    frame: Option<ParsedFrame>,
    frame_decoder: Option<F>,
    sections: Option<Sections>,
    is_last_total: bool,
    is_last_of_still: bool,
    skip_frames: usize,
    skipping_frame: bool,
    internal_frames: usize,
    external_frames: usize,
    decoded_pixels: u64,

    preview_out: Option<BufferSlot>,
    image_out: Option<ImageOut>,
    extra_out: TryVec<Option<BufferSlot>>,
    jpeg_out: Option<JpegOutput>,
}

impl<F> Session<F> {
    fn new(events: Events) -> Self {
        Self {
            stage: DecoderStage::Inited,
            events,
            got_signature: false,
            scanner: BoxScanner::new(false),
            mode: InputMode::Direct,
            image: None,
            got_all_headers: false,
            post_headers: false,
            got_preview_image: false,
            icc: None,
            output_encoding: ColorEncoding::default(),
            jpeg_data: None,
            frame_start: 0,
            frame_size: 0,
            frame_stage: FrameStage::Header,
            frame: None,
            frame_decoder: None,
            sections: None,
            is_last_total: false,
            is_last_of_still: false,
            skip_frames: 0,
            skipping_frame: false,
            internal_frames: 0,
            external_frames: 0,
            decoded_pixels: 0,
            preview_out: None,
            image_out: None,
            extra_out: TryVec::new(),
            jpeg_out: None,
        }
    }
}

fn runner(runner: &Option<Box<dyn ParallelRunner>>) -> &dyn ParallelRunner {
    runner.as_deref().unwrap_or(&SequentialRunner)
}

/// Where `pos` falls in `data`, which starts at codestream offset `base`.
/// `None` when those bytes haven't arrived yet.
fn offset_in(data: &[u8], base: u64, pos: u64) -> Result<Option<usize>> {
    let rel = pos.checked_sub(base).ok_or(Error::InvalidData("position before retained input"))?;
    if rel >= data.len().to_u64() {
        return Ok(None);
    }
    Ok(Some(usize::try_from(rel)?))
}

/// Incremental JPEG XL decoder.
///
/// Pixel reconstruction is delegated to `B`; everything up to complete frame
/// sections (container, headers, TOC, frame skipping, output buffers) is
/// handled here.
pub struct Decoder<B: FrameBackend> {
    backend: B,
    config: DecodeConfig,
    runner: Option<Box<dyn ParallelRunner>>,
    keep_orientation: bool,
    events_wanted: Events,
    /// Survives [`Decoder::rewind`], so later skips can elide more frames.
    deps: FrameDependencies,
    session: Session<B::Frame>,
}

impl<B: FrameBackend> Decoder<B> {
    pub fn new(backend: B) -> Self {
        Self::with_config(backend, DecodeConfig::default())
    }

    pub fn with_config(backend: B, config: DecodeConfig) -> Self {
        Self {
            backend,
            config,
            runner: None,
            keep_orientation: false,
            events_wanted: Events::NONE,
            deps: FrameDependencies::default(),
            session: Session::new(Events::NONE),
        }
    }

    pub fn config(&self) -> &DecodeConfig {
        &self.config
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn stage(&self) -> DecoderStage {
        self.session.stage
    }

    pub fn frame_stage(&self) -> FrameStage {
        self.session.frame_stage
    }

    /// Forgets the stream, keeping subscriptions, orientation handling,
    /// limits and the parallel runner.
    pub fn reset(&mut self) {
        self.rewind();
        self.deps = FrameDependencies::default();
    }

    /// Restarts at the beginning of the same stream. Frame dependency history
    /// is kept, so skipping after a rewind can elide more frames.
    pub fn rewind(&mut self) {
        self.session = Session::new(self.events_wanted);
    }

    pub fn subscribe_events(&mut self, events: Events) -> Result<()> {
        if self.session.stage != DecoderStage::Inited {
            return Err(Error::Api("must subscribe to events before starting"));
        }
        if events.bits() & 63 != 0 {
            return Err(Error::Api("can only subscribe to informative events"));
        }
        self.events_wanted = events;
        self.session.events = events;
        Ok(())
    }

    /// When set, pixels are delivered in stored order and [`BasicInfo`]
    /// reports the stored orientation and dimensions.
    pub fn set_keep_orientation(&mut self, keep: bool) -> Result<()> {
        if self.session.stage != DecoderStage::Inited {
            return Err(Error::Api("must set keep_orientation before starting"));
        }
        self.keep_orientation = keep;
        Ok(())
    }

    pub fn set_parallel_runner(&mut self, runner: Box<dyn ParallelRunner>) -> Result<()> {
        if self.runner.is_some() {
            return Err(Error::Api("parallel runner already set"));
        }
        self.runner = Some(runner);
        Ok(())
    }

    /// Skips the next `amount` displayed frames. Skips accumulate.
    pub fn skip_frames(&mut self, amount: usize) -> Result<()> {
        self.session.skip_frames = self.session.skip_frames.saturating_add(amount);
        let target = self.session.external_frames.saturating_add(self.session.skip_frames);
        self.deps.plan_skip(target)
    }

    pub fn process(&mut self, input: &mut &[u8]) -> Result<Status> {
        self.process_with_stop(input, &Unstoppable)
    }

    /// Like [`Self::process`], checking `stop` between units of work.
    ///
    /// Consumed bytes are removed from the front of `input`; whatever is
    /// left must be passed again, followed by new data.
    pub fn process_with_stop(&mut self, input: &mut &[u8], stop: &(dyn Stop + Sync)) -> Result<Status> {
        match self.session.stage {
            DecoderStage::Error => return Err(Error::Api("decoder is in error state, reset it")),
            DecoderStage::Finished => return Err(Error::Api("decoding already finished, reset it")),
            DecoderStage::Inited => self.session.stage = DecoderStage::Started,
            DecoderStage::Started => {},
        }
        let result = self.process_input(input, stop);
        match &result {
            Ok(status) => trace!("process: {status:?}"),
            Err(err) => {
                warn!("decoding failed: {err}");
                self.session.stage = DecoderStage::Error;
            },
        }
        result
    }

    fn process_input(&mut self, input: &mut &[u8], stop: &(dyn Stop + Sync)) -> Result<Status> {
        if !self.session.got_signature {
            match signature_check(input) {
                Signature::Invalid => return Err(Error::InvalidData("not a JPEG XL file")),
                Signature::NotEnoughBytes => return Ok(Status::NeedMoreInput),
                Signature::Container => self.session.scanner = BoxScanner::new(true),
                Signature::Codestream => {},
            }
            self.session.got_signature = true;
        }
        let mut mode = std::mem::replace(&mut self.session.mode, InputMode::Direct);
        let result = self.process_with_mode(input, &mut mode, stop);
        self.session.mode = mode;
        result
    }

    fn process_with_mode(
        &mut self,
        input: &mut &[u8],
        mode: &mut InputMode,
        stop: &(dyn Stop + Sync),
    ) -> Result<Status> {
        let limit = self.config.max_codestream_buffer;
        let collect_jpeg = self.events_wanted.contains(Events::JPEG_RECONSTRUCTION);
        let csize = loop {
            match self.session.scanner.scan(input, mode, collect_jpeg, limit)? {
                Scan::Codestream(n) => break n,
                Scan::NeedMoreInput => return Ok(Status::NeedMoreInput),
                Scan::JpegReconstruction => {
                    self.session.jpeg_data = self.session.scanner.take_jpeg_data();
                    if self.session.events.contains(Events::JPEG_RECONSTRUCTION) {
                        self.session.events.remove(Events::JPEG_RECONSTRUCTION);
                        return Ok(Status::JpegReconstruction);
                    }
                },
            }
        };

        if let InputMode::Buffered(buffer) = mode {
            buffer.append(&input[..csize], limit)?;
            self.session.scanner.advance(input, csize);
            if self.session.got_all_headers && self.session.got_preview_image {
                buffer.discard_before(self.session.frame_start)?;
            }
            return self.process_codestream(buffer.bytes(), buffer.start(), stop);
        }

        let status = self.process_codestream(&input[..csize], 0, stop)?;
        // Progress beyond this point needs bytes past the end of the input or
        // of the current codestream part, so keep what we have.
        if status == Status::NeedMoreInput && (self.session.image.is_some() || csize < input.len()) {
            mode.start_buffering(&input[..csize], limit)?;
            self.session.scanner.advance(input, csize);
            if !input.is_empty() {
                // The rest may hold the next codestream part.
                return self.process_with_mode(input, mode, stop);
            }
        }
        Ok(status)
    }

    /// Runs the codestream state machine on `data`, which holds codestream
    /// bytes from offset `base` on.
    fn process_codestream(&mut self, data: &[u8], base: u64, stop: &(dyn Stop + Sync)) -> Result<Status> {
        if self.session.image.is_none() {
            if let Some(status) = self.read_basic_info(data)? {
                return Ok(status);
            }
        }
        if self.take_event(Events::BASIC_INFO) {
            return Ok(Status::BasicInfo);
        }

        if !self.session.got_all_headers {
            if let Some(status) = self.read_all_headers(data, base)? {
                return Ok(status);
            }
        }
        let have_extensions = self.session.image.as_ref().is_some_and(|image| image.metadata.extensions != 0);
        if self.take_event(Events::EXTENSIONS) && have_extensions {
            return Ok(Status::Extensions);
        }
        if self.take_event(Events::COLOR_ENCODING) {
            return Ok(Status::ColorEncoding);
        }
        self.session.post_headers = true;

        if !self.session.got_preview_image {
            if let Some(status) = self.process_preview(data, base, stop)? {
                return Ok(status);
            }
        }

        self.process_frames(data, base, stop)
    }

    /// Clears `event` from the pending set, returning whether it was pending.
    fn take_event(&mut self, event: Events) -> bool {
        let pending = self.session.events.contains(event);
        self.session.events.remove(event);
        pending
    }

    fn read_basic_info(&mut self, data: &[u8]) -> Result<Option<Status>> {
        match signature_check(data) {
            Signature::NotEnoughBytes => return Ok(Some(Status::NeedMoreInput)),
            Signature::Container => return Err(Error::InvalidData("nested container")),
            Signature::Invalid => return Err(Error::InvalidData("invalid codestream signature")),
            Signature::Codestream => {},
        }
        let peek = read_header(data, SIGNATURE_BITS, |reader| {
            let size = SizeHeader::read(reader)?;
            let metadata = ImageMetadata::read(reader)?;
            Ok((size, metadata))
        })?;
        let Peek::Ready { value: (size, metadata), bits } = peek else {
            return Ok(Some(Status::NeedMoreInput));
        };
        if let Some(max) = self.config.max_pixels {
            if u64::from(size.xsize) * u64::from(size.ysize) > max {
                return Err(Error::ResourceLimitExceeded("image is too large"));
            }
        }
        debug!(
            "basic info: {}x{}, {} extra channels, orientation {:?}, preview {}, animation {}",
            size.xsize,
            size.ysize,
            metadata.extra_channels.len(),
            metadata.orientation,
            metadata.have_preview(),
            metadata.have_animation()
        );
        self.session.extra_out.clear();
        self.session.extra_out.resize_with(metadata.extra_channels.len(), || None)?;
        self.session.image = Some(ImageHeaders { size, metadata, header_bits: bits });
        Ok(None)
    }

    fn read_all_headers(&mut self, data: &[u8], base: u64) -> Result<Option<Status>> {
        let Some(image) = self.session.image.as_ref() else {
            return Err(Error::Api("basic info missing"));
        };
        let xyb_encoded = image.metadata.xyb_encoded;
        let want_icc = image.metadata.color_encoding.want_icc;
        let gray = image.metadata.color_encoding.is_gray();
        let bit_pos = image.header_bits;
        if base != 0 {
            return Err(Error::Api("headers were discarded before being read"));
        }
        let peek = read_header(data, bit_pos, |reader| {
            read_transform_data(reader, xyb_encoded)?;
            if want_icc {
                return Ok(Some(read_icc_length(reader)?));
            }
            reader.jump_to_byte_boundary()?;
            Ok(None)
        })?;
        let Peek::Ready { value: icc_len, bits } = peek else {
            return Ok(Some(Status::NeedMoreInput));
        };
        let mut end = bits / 8;
        if let Some(len) = icc_len {
            let icc_start = end;
            end = end.checked_add(len).ok_or(Error::InvalidData("ICC profile size overflow"))?;
            if end > data.len().to_u64() {
                return Ok(Some(Status::NeedMoreInput));
            }
            let encoded = &data[usize::try_from(icc_start)?..usize::try_from(end)?];
            let icc = self.backend.decompress_icc(encoded)?;
            debug!("ICC profile: {} bytes stored, {} bytes expanded", len, icc.len());
            self.session.icc = Some(icc);
        }
        self.session.frame_start = end;
        self.session.output_encoding = ColorEncoding::linear_srgb(gray);
        self.session.got_all_headers = true;
        Ok(None)
    }

    /// Parses the header and TOC of the frame starting at `data[pos..]`.
    /// `None` when more bytes are needed.
    fn parse_frame(&self, data: &[u8], pos: usize, is_preview: bool) -> Result<Option<ParsedFrame>> {
        let Some(image) = self.session.image.as_ref() else {
            return Err(Error::Api("basic info missing"));
        };
        let (xsize, ysize) = match (is_preview, &image.metadata.preview) {
            (true, Some(preview)) => (preview.xsize, preview.ysize),
            (true, None) => return Err(Error::InvalidData("image has no preview")),
            (false, _) => (image.size.xsize, image.size.ysize),
        };
        let ctx = FrameHeaderContext { metadata: &image.metadata, xsize, ysize, is_preview };
        let max_pixels = self.config.max_pixels;
        let peek = read_header(&data[pos..], 0, |reader| {
            let header = FrameHeader::read(reader, ctx)?;
            if let Some(max) = max_pixels {
                let dims = &header.dimensions;
                if u64::from(dims.xsize_upsampled) * u64::from(dims.ysize_upsampled) > max {
                    return Err(Error::ResourceLimitExceeded("frame is too large"));
                }
            }
            let toc = Toc::read(reader, header.num_toc_entries()?)?;
            Ok((header, toc))
        })?;
        let Peek::Ready { value: (header, toc), bits } = peek else {
            return Ok(None);
        };
        let sections_begin = bits / 8;
        let size = sections_begin.checked_add(toc.total_size).ok_or(Error::InvalidData("frame size overflow"))?;
        Ok(Some(ParsedFrame { header, toc, sections_begin, size }))
    }

    /// Dimensions of the full image as delivered.
    fn output_size(&self, xsize: u32, ysize: u32) -> (u32, u32) {
        if self.undo_orientation().swaps_axes() { (ysize, xsize) } else { (xsize, ysize) }
    }

    /// Orientation output writers must undo.
    fn undo_orientation(&self) -> Orientation {
        match (&self.session.image, self.keep_orientation) {
            (Some(image), false) => image.metadata.orientation,
            _ => Orientation::Identity,
        }
    }

    fn process_preview(&mut self, data: &[u8], base: u64, stop: &(dyn Stop + Sync)) -> Result<Option<Status>> {
        let have_preview = self.session.image.as_ref().is_some_and(|image| image.metadata.have_preview());
        let parse_preview =
            self.session.events.intersects(Events::PREVIEW_IMAGE | Events::FRAME | Events::FULL_IMAGE);
        if !have_preview || !parse_preview {
            self.session.got_preview_image = true;
            return Ok(None);
        }
        let Some(pos) = offset_in(data, base, self.session.frame_start)? else {
            return Ok(Some(Status::NeedMoreInput));
        };
        let Some(parsed) = self.parse_frame(data, pos, true)? else {
            return Ok(Some(Status::NeedMoreInput));
        };
        let end = pos.to_u64() + parsed.size;
        if end > data.len().to_u64() {
            return Ok(Some(Status::NeedMoreInput));
        }
        let want_preview = self.session.events.contains(Events::PREVIEW_IMAGE);
        if want_preview {
            if !self.session.preview_out.as_ref().is_some_and(BufferSlot::is_pending) {
                return Ok(Some(Status::NeedPreviewOutBuffer));
            }
            self.decode_preview(&parsed, &data[pos..usize::try_from(end)?], stop)?;
        }
        self.session.frame_start += parsed.size;
        self.session.got_preview_image = true;
        if want_preview {
            self.session.events.remove(Events::PREVIEW_IMAGE);
            return Ok(Some(Status::PreviewImage));
        }
        Ok(None)
    }

    fn decode_preview(&mut self, parsed: &ParsedFrame, frame_data: &[u8], stop: &(dyn Stop + Sync)) -> Result<()> {
        let Some(image) = self.session.image.as_ref() else {
            return Err(Error::Api("basic info missing"));
        };
        let Some(preview) = image.metadata.preview else {
            return Err(Error::InvalidData("image has no preview"));
        };
        let output_encoding = ColorEncoding::linear_srgb(image.metadata.color_encoding.is_gray());
        let ctx = FrameContext {
            metadata: &image.metadata,
            header: &parsed.header,
            toc: &parsed.toc,
            is_preview: true,
            output_encoding: &output_encoding,
            jpeg_data: None,
        };
        let mut frame = self.backend.init_frame(&ctx)?;
        let mut sections = Sections::new(&parsed.toc, &parsed.header, parsed.size, parsed.sections_begin)?;
        sections.set_input(parsed.size);
        sections.process(&frame, frame_data, runner(&self.runner), stop)?;
        frame.finalize()?;

        let orientation = self.undo_orientation();
        let (xsize, ysize) = self.output_size(preview.xsize, preview.ysize);
        let Some(slot) = self.session.preview_out.as_mut() else {
            return Err(Error::Api("no preview out buffer set"));
        };
        let stride = slot.format.row_size(xsize, slot.format.num_channels)?;
        frame.write_image(OutputRequest {
            format: slot.format,
            channels: OutputChannels::Color,
            orientation,
            xsize,
            ysize,
            stride,
            sink: PixelSink::Buffer(&mut slot.data),
        })?;
        slot.written = true;
        debug!("preview {}x{} written", xsize, ysize);
        Ok(())
    }

    fn process_frames(&mut self, data: &[u8], base: u64, stop: &(dyn Stop + Sync)) -> Result<Status> {
        loop {
            if !self.session.events.intersects(Events::FULL_IMAGE | Events::FRAME) {
                break;
            }
            if self.session.frame_stage == FrameStage::Header && self.session.is_last_total {
                break;
            }

            if self.session.frame_stage == FrameStage::Header {
                if let Some(status) = self.frame_header_stage(data, base)? {
                    return Ok(status);
                }
                if self.session.frame_stage == FrameStage::Header {
                    continue;
                }
            }

            if self.session.frame_stage == FrameStage::Toc {
                if let Some(status) = self.toc_stage(data, base)? {
                    return Ok(status);
                }
            }

            if self.session.frame_stage == FrameStage::Full {
                if let Some(status) = self.full_stage(data, base, stop)? {
                    return Ok(status);
                }
            }

            let mut return_full_image = false;
            if self.session.frame_stage == FrameStage::FullOutput {
                return_full_image = self.full_output_stage()?;
            }

            self.session.frame_decoder = None;
            self.session.sections = None;
            self.session.frame = None;
            self.session.frame_stage = FrameStage::Header;
            self.session.frame_start += self.session.frame_size;
            if return_full_image && !self.session.skipping_frame {
                return Ok(Status::FullImage);
            }
        }

        self.session.stage = DecoderStage::Finished;
        Ok(Status::Success)
    }

    fn frame_header_stage(&mut self, data: &[u8], base: u64) -> Result<Option<Status>> {
        let Some(pos) = offset_in(data, base, self.session.frame_start)? else {
            return Ok(Some(Status::NeedMoreInput));
        };
        let Some(parsed) = self.parse_frame(data, pos, false)? else {
            return Ok(Some(Status::NeedMoreInput));
        };
        if let Some(max) = self.config.max_frames {
            if self.session.internal_frames >= max as usize {
                return Err(Error::ResourceLimitExceeded("too many frames"));
            }
        }

        let s = &mut self.session;
        let header = &parsed.header;
        let internal = s.internal_frames;
        let external = s.external_frames;
        s.is_last_total = header.is_last;
        s.is_last_of_still = header.is_last_of_still();
        if s.is_last_of_still {
            s.external_frames += 1;
        }
        s.internal_frames += 1;
        s.frame_size = parsed.size;
        s.frame_stage = FrameStage::Toc;
        s.skipping_frame = s.skip_frames > 0;
        if s.skipping_frame && s.is_last_of_still {
            s.skip_frames -= 1;
        }
        self.deps.record_frame(internal, external, header.saved_as())?;
        debug!(
            "frame {internal} (displayed {external}): {:?} {:?} {}x{}, {} bytes, duration {}{}",
            header.frame_type,
            header.encoding,
            header.dimensions.xsize_upsampled,
            header.dimensions.ysize_upsampled,
            parsed.size,
            header.duration,
            if header.is_last { ", last" } else { "" }
        );

        if s.skipping_frame {
            let referenceable = (header.can_be_referenced() || header.frame_type == FrameType::Dc)
                && self.deps.is_required(internal);
            if !referenceable {
                trace!("eliding skipped frame {internal}");
                s.frame_stage = FrameStage::Header;
                s.frame_start += s.frame_size;
                return Ok(None);
            }
        }

        let announce = s.events.contains(Events::FRAME) && s.is_last_of_still && !s.skipping_frame;
        s.frame = Some(parsed);
        if announce {
            return Ok(Some(Status::Frame));
        }
        Ok(None)
    }

    fn toc_stage(&mut self, data: &[u8], base: u64) -> Result<Option<Status>> {
        if offset_in(data, base, self.session.frame_start)?.is_none() {
            return Ok(Some(Status::NeedMoreInput));
        }
        let (Some(image), Some(frame)) = (self.session.image.as_ref(), self.session.frame.as_ref()) else {
            return Err(Error::Api("frame header missing"));
        };
        let sections = Sections::new(&frame.toc, &frame.header, frame.size, frame.sections_begin)?;
        if !self.session.events.contains(Events::FULL_IMAGE) {
            return Ok(None);
        }

        let dims = &frame.header.dimensions;
        self.session.decoded_pixels =
            self.session.decoded_pixels.saturating_add(u64::from(dims.xsize) * u64::from(dims.ysize));
        if let Some(max) = self.config.max_decoded_pixels {
            if self.session.decoded_pixels > max {
                return Err(Error::ResourceLimitExceeded("too many pixels decoded"));
            }
        }

        let ctx = FrameContext {
            metadata: &image.metadata,
            header: &frame.header,
            toc: &frame.toc,
            is_preview: false,
            output_encoding: &self.session.output_encoding,
            jpeg_data: self.session.jpeg_data.as_deref(),
        };
        let decoder = self.backend.init_frame(&ctx)?;
        self.session.frame_decoder = Some(decoder);
        self.session.sections = Some(sections);
        self.session.frame_stage = FrameStage::Full;
        Ok(None)
    }

    fn full_stage(&mut self, data: &[u8], base: u64, stop: &(dyn Stop + Sync)) -> Result<Option<Status>> {
        let s = &self.session;
        let has_image_out = s.image_out.as_ref().is_some_and(ImageOut::is_pending);
        let has_jpeg_out = s.jpeg_out.is_some() && s.jpeg_data.is_some();
        if s.events.contains(Events::FULL_IMAGE)
            && !has_image_out
            && !has_jpeg_out
            && s.is_last_of_still
            && !s.skipping_frame
        {
            return Ok(Some(Status::NeedImageOutBuffer));
        }

        let Some(pos) = offset_in(data, base, self.session.frame_start)? else {
            return Ok(Some(Status::NeedMoreInput));
        };
        let (Some(frame), Some(sections)) = (self.session.frame_decoder.as_mut(), self.session.sections.as_mut())
        else {
            return Err(Error::Api("frame decoder missing"));
        };
        let frame_data = &data[pos..];
        sections.set_input(frame_data.len().to_u64());
        sections.process(&*frame, frame_data, runner(&self.runner), stop)?;
        if !sections.all_done() {
            return Ok(Some(Status::NeedMoreInput));
        }
        let internal = self.session.internal_frames - 1;
        self.deps.set_references(internal, frame.references());
        frame.finalize()?;
        self.session.frame_stage = FrameStage::FullOutput;
        Ok(None)
    }

    /// Delivers a finished frame. Returns whether [`Status::FullImage`] is due.
    fn full_output_stage(&mut self) -> Result<bool> {
        if !self.session.is_last_of_still {
            return Ok(false);
        }
        let return_full_image = self.take_event(Events::FULL_IMAGE);
        self.session.events.insert(self.events_wanted & (Events::FULL_IMAGE | Events::FRAME));
        if self.session.skipping_frame {
            return Ok(return_full_image);
        }

        let Some(image) = self.session.image.as_ref() else {
            return Err(Error::Api("basic info missing"));
        };
        let orientation = self.undo_orientation();
        let (xsize, ysize) = self.output_size(image.size.xsize, image.size.ysize);
        let s = &mut self.session;
        let Some(frame) = s.frame_decoder.as_mut() else {
            return Err(Error::Api("frame decoder missing"));
        };

        if let (Some(out), Some(jpeg_data)) = (s.jpeg_out.as_mut(), s.jpeg_data.as_deref()) {
            let written = frame.reconstruct_jpeg(jpeg_data, &mut out.data[out.len..])?;
            out.len = (out.len + written).min(out.data.len());
            debug!("reconstructed {written} JPEG bytes");
        } else if return_full_image && s.image_out.as_ref().is_some_and(ImageOut::is_pending) {
            if let Some(image_out) = s.image_out.as_mut() {
                let format = image_out.format();
                let stride = format.row_size(xsize, format.num_channels)?;
                let sink = match image_out {
                    ImageOut::Buffer(slot) => {
                        slot.written = true;
                        PixelSink::Buffer(&mut slot.data)
                    },
                    ImageOut::Callback { callback, .. } => PixelSink::Rows(&mut **callback),
                };
                frame.write_image(OutputRequest {
                    format,
                    channels: OutputChannels::Color,
                    orientation,
                    xsize,
                    ysize,
                    stride,
                    sink,
                })?;
            }
            for (index, slot) in s.extra_out.iter_mut().enumerate() {
                let Some(slot) = slot.as_mut().filter(|slot| slot.is_pending()) else {
                    continue;
                };
                let stride = slot.format.row_size(xsize, 1)?;
                frame.write_image(OutputRequest {
                    format: slot.format,
                    channels: OutputChannels::Extra(index),
                    orientation,
                    xsize,
                    ysize,
                    stride,
                    sink: PixelSink::Buffer(&mut slot.data),
                })?;
                slot.written = true;
            }
        }
        Ok(return_full_image)
    }

    fn image(&self) -> Result<&ImageHeaders> {
        self.session.image.as_ref().ok_or(Error::Api("basic info not available yet"))
    }

    /// How many bytes of input to gather before the basic info is likely
    /// to be decodable. Zero once it has been decoded.
    pub fn size_hint_basic_info(&self) -> usize {
        if self.session.image.is_some() { 0 } else { self.session.scanner.size_hint() }
    }

    pub fn basic_info(&self) -> Result<BasicInfo> {
        let image = self.image()?;
        let meta = &image.metadata;
        let mut xsize = image.size.xsize;
        let mut ysize = image.size.ysize;
        let mut orientation = meta.orientation;
        if !self.keep_orientation {
            if orientation.swaps_axes() {
                (xsize, ysize) = (ysize, xsize);
            }
            orientation = Orientation::Identity;
        }
        let alpha = meta.alpha_channel();
        Ok(BasicInfo {
            have_container: self.session.scanner.have_container(),
            xsize,
            ysize,
            bits_per_sample: meta.bit_depth.bits_per_sample,
            exponent_bits_per_sample: meta.bit_depth.exponent_bits_per_sample,
            intensity_target: meta.tone_mapping.intensity_target,
            min_nits: meta.tone_mapping.min_nits,
            relative_to_max_display: meta.tone_mapping.relative_to_max_display,
            linear_below: meta.tone_mapping.linear_below,
            uses_original_profile: !meta.xyb_encoded,
            preview: meta.preview,
            animation: meta.animation,
            orientation,
            num_color_channels: if meta.color_encoding.is_gray() { 1 } else { 3 },
            num_extra_channels: u32::try_from(meta.extra_channels.len())?,
            alpha_bits: alpha.map_or(0, |alpha| alpha.bit_depth.bits_per_sample),
            alpha_exponent_bits: alpha.map_or(0, |alpha| alpha.bit_depth.exponent_bits_per_sample),
            alpha_premultiplied: alpha.is_some_and(|alpha| alpha.alpha_associated),
        })
    }

    pub fn extra_channel_info(&self, index: usize) -> Result<&ExtraChannelInfo> {
        self.image()?.metadata.extra_channels.get(index).ok_or(Error::Api("invalid extra channel index"))
    }

    pub fn extra_channel_name(&self, index: usize) -> Result<&str> {
        Ok(self.extra_channel_info(index)?.name())
    }

    fn encoding_for(&self, target: ColorProfileTarget) -> Result<&ColorEncoding> {
        if !self.session.got_all_headers {
            return Err(Error::Api("color encoding not available yet"));
        }
        let meta = &self.image()?.metadata;
        Ok(match target {
            ColorProfileTarget::Data if meta.xyb_encoded => &self.session.output_encoding,
            _ => &meta.color_encoding,
        })
    }

    /// The color profile as a structured encoding; unavailable when the
    /// image only carries an ICC profile.
    pub fn color_as_encoded_profile(&self, target: ColorProfileTarget) -> Result<ColorEncoding> {
        let encoding = self.encoding_for(target)?;
        if encoding.want_icc {
            return Err(Error::Unsupported("color profile is only available as ICC"));
        }
        Ok(*encoding)
    }

    /// The embedded ICC profile, after [`FrameBackend::decompress_icc`].
    pub fn icc_profile(&self, target: ColorProfileTarget) -> Result<&[u8]> {
        let encoding = self.encoding_for(target)?;
        if !encoding.want_icc {
            return Err(Error::Unsupported("generating an ICC profile from an encoded profile"));
        }
        if matches!(encoding.color_space, ColorSpace::Unknown | ColorSpace::Xyb) {
            return Err(Error::Unsupported("no ICC profile for this color space"));
        }
        self.session.icc.as_deref().ok_or(Error::InvalidData("ICC profile missing"))
    }

    pub fn icc_profile_size(&self, target: ColorProfileTarget) -> Result<usize> {
        Ok(self.icc_profile(target)?.len())
    }

    /// Requests a different color encoding for XYB-encoded pixels. Only
    /// possible between [`Status::ColorEncoding`] and the next process call.
    pub fn set_preferred_color_profile(&mut self, encoding: ColorEncoding) -> Result<()> {
        if !self.session.got_all_headers {
            return Err(Error::Api("color info not yet available"));
        }
        if self.session.post_headers {
            return Err(Error::Api("too late to set the color encoding"));
        }
        let image = self.image()?;
        if image.metadata.color_encoding.is_gray() != encoding.is_gray() {
            return Err(Error::Api("number of color channels mismatch"));
        }
        if matches!(encoding.color_space, ColorSpace::Unknown | ColorSpace::Xyb) {
            return Err(Error::Api("only RGB or grayscale output supported"));
        }
        if encoding.want_icc {
            return Err(Error::Api("preferred profile must be an encoded profile"));
        }
        self.session.output_encoding = encoding;
        Ok(())
    }

    /// 4 × float32, little endian, unaligned.
    pub fn default_pixel_format(&self) -> Result<PixelFormat> {
        self.image()?;
        Ok(PixelFormat::default())
    }

    fn image_is_gray(&self) -> Result<bool> {
        Ok(self.image()?.metadata.color_encoding.is_gray())
    }

    pub fn preview_out_buffer_size(&self, format: &PixelFormat) -> Result<usize> {
        let preview = self.image()?.metadata.preview.ok_or(Error::Api("image has no preview"))?;
        format.check_for_image(self.image_is_gray()?)?;
        let (xsize, ysize) = self.output_size(preview.xsize, preview.ysize);
        format.buffer_size(xsize, ysize, format.num_channels)
    }

    pub fn set_preview_out_buffer(&mut self, format: PixelFormat, buffer: TryVec<u8>) -> Result<()> {
        if !self.events_wanted.contains(Events::PREVIEW_IMAGE) || self.session.got_preview_image {
            return Err(Error::Api("no preview out buffer needed at this time"));
        }
        let min_size = self.preview_out_buffer_size(&format)?;
        self.session.preview_out = Some(BufferSlot::new(format, buffer, min_size)?);
        Ok(())
    }

    /// Hands back the preview buffer, written or not.
    pub fn take_preview_out_buffer(&mut self) -> Option<TryVec<u8>> {
        self.session.preview_out.take().map(|slot| slot.data)
    }

    pub fn image_out_buffer_size(&self, format: &PixelFormat) -> Result<usize> {
        let image = self.image()?;
        format.check_for_image(self.image_is_gray()?)?;
        let (xsize, ysize) = self.output_size(image.size.xsize, image.size.ysize);
        format.buffer_size(xsize, ysize, format.num_channels)
    }

    /// Sets where the next displayed frame is written. Needed once per frame.
    pub fn set_image_out_buffer(&mut self, format: PixelFormat, buffer: TryVec<u8>) -> Result<()> {
        if !self.events_wanted.contains(Events::FULL_IMAGE) {
            return Err(Error::Api("no image out buffer needed at this time"));
        }
        if let Some(ImageOut::Callback { .. }) = self.session.image_out {
            return Err(Error::Api("cannot change from image out callback to image out buffer"));
        }
        let min_size = self.image_out_buffer_size(&format)?;
        self.session.image_out = Some(ImageOut::Buffer(BufferSlot::new(format, buffer, min_size)?));
        Ok(())
    }

    /// Delivers every following frame row by row instead of into a buffer.
    pub fn set_image_out_callback(&mut self, format: PixelFormat, callback: RowCallback) -> Result<()> {
        if !self.events_wanted.contains(Events::FULL_IMAGE) {
            return Err(Error::Api("no image out callback needed at this time"));
        }
        if let Some(ImageOut::Buffer(slot)) = &self.session.image_out {
            if slot.is_pending() {
                return Err(Error::Api("cannot change from image out buffer to image out callback"));
            }
        }
        format.check_for_image(self.image_is_gray()?)?;
        self.session.image_out = Some(ImageOut::Callback { format, callback });
        Ok(())
    }

    /// Hands back the image buffer, written or not.
    pub fn take_image_out_buffer(&mut self) -> Option<TryVec<u8>> {
        match self.session.image_out.take() {
            Some(ImageOut::Buffer(slot)) => Some(slot.data),
            other => {
                self.session.image_out = other;
                None
            },
        }
    }

    pub fn extra_channel_buffer_size(&self, format: &PixelFormat, index: usize) -> Result<usize> {
        let image = self.image()?;
        if index >= image.metadata.extra_channels.len() {
            return Err(Error::Api("invalid extra channel index"));
        }
        format.check()?;
        let (xsize, ysize) = self.output_size(image.size.xsize, image.size.ysize);
        format.buffer_size(xsize, ysize, 1)
    }

    /// Sets a buffer for one extra channel of the next displayed frame.
    pub fn set_extra_channel_buffer(&mut self, format: PixelFormat, buffer: TryVec<u8>, index: usize) -> Result<()> {
        if !self.events_wanted.contains(Events::FULL_IMAGE) {
            return Err(Error::Api("no extra channel buffer needed at this time"));
        }
        let min_size = self.extra_channel_buffer_size(&format, index)?;
        let slot = BufferSlot::new(format, buffer, min_size)?;
        match self.session.extra_out.get_mut(index) {
            Some(entry) => *entry = Some(slot),
            None => return Err(Error::Api("invalid extra channel index")),
        }
        Ok(())
    }

    pub fn take_extra_channel_buffer(&mut self, index: usize) -> Option<TryVec<u8>> {
        self.session.extra_out.get_mut(index)?.take().map(|slot| slot.data)
    }

    /// Sets the buffer a reconstructed JPEG file is written to.
    pub fn set_jpeg_buffer(&mut self, data: TryVec<u8>) -> Result<()> {
        if self.session.jpeg_out.is_some() {
            return Err(Error::Api("JPEG output buffer already set"));
        }
        self.session.jpeg_out = Some(JpegOutput { data, len: 0 });
        Ok(())
    }

    pub fn release_jpeg_buffer(&mut self) -> Option<JpegOutput> {
        self.session.jpeg_out.take()
    }

    fn current_frame(&self) -> Result<&FrameHeader> {
        match &self.session.frame {
            Some(frame) if self.session.frame_stage != FrameStage::Header => Ok(&frame.header),
            _ => Err(Error::Api("no frame header available")),
        }
    }

    pub fn frame_header(&self) -> Result<FrameInfo> {
        let header = self.current_frame()?;
        Ok(FrameInfo {
            duration: header.duration,
            timecode: header.timecode,
            name_length: header.name().len(),
            is_last: header.is_last,
        })
    }

    pub fn frame_name(&self) -> Result<&str> {
        Ok(self.current_frame()?.name())
    }

    /// Renders the partially decoded current frame into the image buffer.
    pub fn flush_image(&mut self) -> Result<()> {
        if self.session.frame_stage != FrameStage::Full
            || !self.session.sections.as_ref().is_some_and(Sections::any_done)
        {
            return Err(Error::Api("no partially decoded frame to flush"));
        }
        let image = self.image()?;
        let orientation = self.undo_orientation();
        let (xsize, ysize) = self.output_size(image.size.xsize, image.size.ysize);
        let s = &mut self.session;
        let (Some(frame), Some(ImageOut::Buffer(slot))) = (s.frame_decoder.as_mut(), s.image_out.as_mut()) else {
            return Err(Error::Api("flushing needs an image out buffer"));
        };
        let stride = slot.format.row_size(xsize, slot.format.num_channels)?;
        frame.flush(OutputRequest {
            format: slot.format,
            channels: OutputChannels::Color,
            orientation,
            xsize,
            ysize,
            stride,
            sink: PixelSink::Buffer(&mut slot.data),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::DataType;
    use crate::sections::{Section, SectionStatus};

    struct NoPixels;

    struct NoFrame;

    impl FrameDecoder for NoFrame {
        fn decode_section(&self, _section: &Section<'_>) -> Result<SectionStatus> {
            Ok(SectionStatus::Done)
        }

        fn references(&self) -> u8 {
            0
        }

        fn finalize(&mut self) -> Result<()> {
            Ok(())
        }

        fn write_image(&mut self, _request: OutputRequest<'_>) -> Result<()> {
            Ok(())
        }
    }

    impl FrameBackend for NoPixels {
        type Frame = NoFrame;

        fn init_frame(&mut self, _ctx: &FrameContext<'_>) -> Result<NoFrame> {
            Ok(NoFrame)
        }
    }

    /// 8x8 codestream: all-default metadata, one all-default frame with a
    /// single empty section.
    const TINY: [u8; 7] = [0xff, 0x0a, 0x41, 0x06, 0x01, 0x00, 0x00];

    #[test]
    fn events_bits() {
        let events = Events::BASIC_INFO | Events::FRAME;
        assert!(events.contains(Events::FRAME));
        assert!(!events.contains(Events::FULL_IMAGE));
        assert!(events.intersects(Events::FRAME | Events::FULL_IMAGE));
        assert_eq!(events.bits(), 0x440);
        let mut events = events;
        events.remove(Events::BASIC_INFO);
        assert_eq!(events, Events::FRAME);
    }

    #[test]
    fn config_builders() {
        let config = DecodeConfig::default().with_max_pixels(100);
        assert_eq!(config.max_pixels, Some(100));
        assert_eq!(config.max_decoded_pixels, Some(500));
        assert_eq!(DecodeConfig::unlimited().max_frames, None);
    }

    #[test]
    fn subscriptions_only_before_start() {
        let mut decoder = Decoder::new(NoPixels);
        assert!(decoder.subscribe_events(Events::from_bits(1)).is_err());
        decoder.subscribe_events(Events::BASIC_INFO).unwrap();
        let mut input = &TINY[..1];
        assert_eq!(decoder.process(&mut input).unwrap(), Status::NeedMoreInput);
        assert!(decoder.subscribe_events(Events::FRAME).is_err());
        assert!(decoder.set_keep_orientation(true).is_err());
        decoder.reset();
        decoder.subscribe_events(Events::FRAME).unwrap();
    }

    #[test]
    fn tiny_codestream() {
        let mut decoder = Decoder::new(NoPixels);
        decoder.subscribe_events(Events::BASIC_INFO | Events::FRAME).unwrap();
        assert!(decoder.basic_info().is_err());
        let mut input = &TINY[..];
        assert_eq!(decoder.process(&mut input).unwrap(), Status::BasicInfo);
        let info = decoder.basic_info().unwrap();
        assert_eq!((info.xsize, info.ysize), (8, 8));
        assert!(!info.have_container);
        assert_eq!(decoder.size_hint_basic_info(), 0);
        assert_eq!(decoder.default_pixel_format().unwrap(), PixelFormat::default());
        assert_eq!(decoder.process(&mut input).unwrap(), Status::Frame);
        assert!(decoder.frame_header().unwrap().is_last);
        assert_eq!(decoder.process(&mut input).unwrap(), Status::Success);
        assert_eq!(decoder.stage(), DecoderStage::Finished);
        assert!(decoder.process(&mut input).is_err());
    }

    #[test]
    fn errors_are_sticky() {
        let mut decoder = Decoder::new(NoPixels);
        let mut input = &b"\xff\x00"[..];
        assert!(decoder.process(&mut input).is_err());
        assert_eq!(decoder.stage(), DecoderStage::Error);
        let mut input = &TINY[..];
        assert!(matches!(decoder.process(&mut input), Err(Error::Api(_))));
        decoder.reset();
        decoder.subscribe_events(Events::FRAME).unwrap();
        assert_eq!(decoder.process(&mut input).unwrap(), Status::Frame);
    }

    #[test]
    fn image_too_large() {
        let mut decoder = Decoder::with_config(NoPixels, DecodeConfig::default().with_max_pixels(63));
        decoder.subscribe_events(Events::BASIC_INFO).unwrap();
        let mut input = &TINY[..];
        assert!(matches!(decoder.process(&mut input), Err(Error::ResourceLimitExceeded(_))));
    }

    #[test]
    fn buffer_setters_check_state() {
        let mut decoder = Decoder::new(NoPixels);
        decoder.subscribe_events(Events::BASIC_INFO | Events::FULL_IMAGE).unwrap();
        let format = PixelFormat::new(3, DataType::U8);
        assert!(decoder.set_image_out_buffer(format, TryVec::new()).is_err());
        let mut input = &TINY[..];
        assert_eq!(decoder.process(&mut input).unwrap(), Status::BasicInfo);
        assert_eq!(decoder.image_out_buffer_size(&format).unwrap(), 8 * 8 * 3);
        assert!(matches!(
            decoder.set_image_out_buffer(format, TryVec::new()),
            Err(Error::OutputTooSmall { needed: 192, provided: 0 })
        ));
        assert!(decoder.set_preview_out_buffer(format, TryVec::new()).is_err());
        assert!(decoder.extra_channel_buffer_size(&format, 0).is_err());
        assert!(decoder.set_jpeg_buffer(TryVec::new()).is_ok());
        assert!(decoder.set_jpeg_buffer(TryVec::new()).is_err());
        assert_eq!(decoder.release_jpeg_buffer().map(|out| out.len), Some(0));
    }

    #[test]
    fn color_profile_window() {
        let mut decoder = Decoder::new(NoPixels);
        decoder.subscribe_events(Events::COLOR_ENCODING | Events::FRAME).unwrap();
        let srgb = ColorEncoding::srgb(false);
        assert!(decoder.set_preferred_color_profile(srgb).is_err());
        let mut input = &TINY[..];
        assert_eq!(decoder.process(&mut input).unwrap(), Status::ColorEncoding);
        assert_eq!(decoder.color_as_encoded_profile(ColorProfileTarget::Original).unwrap(), srgb);
        assert!(decoder.icc_profile(ColorProfileTarget::Original).is_err());
        assert!(decoder.set_preferred_color_profile(ColorEncoding::srgb(true)).is_err());
        decoder.set_preferred_color_profile(srgb).unwrap();
        assert_eq!(decoder.color_as_encoded_profile(ColorProfileTarget::Data).unwrap(), srgb);
        assert_eq!(decoder.process(&mut input).unwrap(), Status::Frame);
        assert!(decoder.set_preferred_color_profile(srgb).is_err());
    }
}
