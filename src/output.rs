// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Caller-facing pixel formats and the sinks decoded pixels are written to.

use zencodec::Orientation;

use crate::{Error, Result, ToU64, TryVec};

/// Sample type of an output buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Boolean,
    U8,
    U16,
    U32,
    F32,
    F16,
}

impl DataType {
    pub fn bits(self) -> usize {
        match self {
            Self::Boolean => 1,
            Self::U8 => 8,
            Self::U16 | Self::F16 => 16,
            Self::U32 | Self::F32 => 32,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endianness {
    Native,
    Little,
    Big,
}

/// Layout of an output buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelFormat {
    /// 1 (gray), 2 (gray + alpha), 3 (RGB) or 4 (RGBA).
    pub num_channels: u32,
    pub data_type: DataType,
    pub endianness: Endianness,
    /// Row stride is rounded up to a multiple of this; 0 or 1 packs rows.
    pub align: usize,
}

impl Default for PixelFormat {
    fn default() -> Self {
        Self { num_channels: 4, data_type: DataType::F32, endianness: Endianness::Little, align: 0 }
    }
}

impl PixelFormat {
    pub fn new(num_channels: u32, data_type: DataType) -> Self {
        Self { num_channels, data_type, endianness: Endianness::Native, align: 0 }
    }

    pub fn with_endianness(mut self, endianness: Endianness) -> Self {
        self.endianness = endianness;
        self
    }

    pub fn with_align(mut self, align: usize) -> Self {
        self.align = align;
        self
    }

    /// Whether multi-byte samples are stored little endian on this target.
    pub fn is_little_endian(&self) -> bool {
        match self.endianness {
            Endianness::Little => true,
            Endianness::Big => false,
            Endianness::Native => cfg!(target_endian = "little"),
        }
    }

    /// Rejects formats no output path supports.
    pub(crate) fn check(&self) -> Result<()> {
        if self.num_channels == 0 || self.num_channels > 4 {
            return Err(Error::Api("output needs 1 to 4 channels"));
        }
        match self.data_type {
            DataType::Boolean => Err(Error::Unsupported("boolean output")),
            DataType::U32 => Err(Error::Unsupported("uint32 output")),
            _ => Ok(()),
        }
    }

    /// Like [`Self::check`], also refusing gray output of a color image.
    pub(crate) fn check_for_image(&self, image_is_gray: bool) -> Result<()> {
        self.check()?;
        if self.num_channels < 3 && !image_is_gray {
            return Err(Error::Api("grayscale output not possible for color image"));
        }
        Ok(())
    }

    /// Bytes per row of `xsize` pixels of `num_channels` samples.
    pub(crate) fn row_size(&self, xsize: u32, num_channels: u32) -> Result<usize> {
        let bits = u64::from(xsize)
            .checked_mul(u64::from(num_channels))
            .and_then(|n| n.checked_mul(self.data_type.bits().to_u64()))
            .ok_or(Error::InvalidData("row size overflow"))?;
        let mut row = usize::try_from(bits.div_ceil(8))?;
        if self.align > 1 {
            row = row
                .div_ceil(self.align)
                .checked_mul(self.align)
                .ok_or(Error::InvalidData("row size overflow"))?;
        }
        Ok(row)
    }

    /// Minimum buffer size for a `xsize` × `ysize` image.
    pub(crate) fn buffer_size(&self, xsize: u32, ysize: u32, num_channels: u32) -> Result<usize> {
        self.row_size(xsize, num_channels)?
            .checked_mul(usize::try_from(ysize)?)
            .ok_or(Error::InvalidData("buffer size overflow"))
    }
}

/// Receives rows of a full image as `(x, y, num_pixels, samples)`.
pub type RowCallback = Box<dyn FnMut(usize, usize, usize, &[u8]) + Send>;

/// Which planes of a frame a write covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputChannels {
    /// Color channels, plus alpha when the format has 2 or 4 channels.
    Color,
    /// A single extra channel, by index.
    Extra(usize),
}

/// Destination of converted pixels.
pub enum PixelSink<'a> {
    Buffer(&'a mut [u8]),
    Rows(&'a mut (dyn FnMut(usize, usize, usize, &[u8]) + Send)),
}

/// Everything a frame decoder needs to convert its pixels for the caller.
pub struct OutputRequest<'a> {
    pub format: PixelFormat,
    pub channels: OutputChannels,
    /// Orientation to undo while writing; [`Orientation::Identity`] writes stored order.
    pub orientation: Orientation,
    /// Output dimensions, after orientation.
    pub xsize: u32,
    pub ysize: u32,
    pub stride: usize,
    pub sink: PixelSink<'a>,
}

/// A caller buffer the decoder fills once.
#[derive(Debug)]
pub(crate) struct BufferSlot {
    pub format: PixelFormat,
    pub data: TryVec<u8>,
    pub written: bool,
}

impl BufferSlot {
    pub(crate) fn new(format: PixelFormat, data: TryVec<u8>, min_size: usize) -> Result<Self> {
        if data.len() < min_size {
            return Err(Error::OutputTooSmall { needed: min_size, provided: data.len() });
        }
        Ok(Self { format, data, written: false })
    }

    pub(crate) fn is_pending(&self) -> bool {
        !self.written
    }
}

/// Full-image destination: a buffer or a row callback, never both.
pub(crate) enum ImageOut {
    Buffer(BufferSlot),
    Callback { format: PixelFormat, callback: RowCallback },
}

impl ImageOut {
    pub(crate) fn format(&self) -> PixelFormat {
        match self {
            Self::Buffer(slot) => slot.format,
            Self::Callback { format, .. } => *format,
        }
    }

    /// Whether pixels of the next frame still have somewhere to go.
    pub(crate) fn is_pending(&self) -> bool {
        match self {
            Self::Buffer(slot) => slot.is_pending(),
            Self::Callback { .. } => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_sizes() {
        let rgb8 = PixelFormat::new(3, DataType::U8);
        assert_eq!(rgb8.row_size(5, 3).unwrap(), 15);
        assert_eq!(rgb8.with_align(4).row_size(5, 3).unwrap(), 16);
        assert_eq!(rgb8.with_align(1).row_size(5, 3).unwrap(), 15);
        let f16 = PixelFormat::new(1, DataType::F16);
        assert_eq!(f16.buffer_size(3, 2, 1).unwrap(), 12);
        assert_eq!(PixelFormat::default().buffer_size(2, 2, 4).unwrap(), 64);
    }

    #[test]
    fn endianness() {
        let format = PixelFormat::new(1, DataType::U16);
        assert!(format.with_endianness(Endianness::Little).is_little_endian());
        assert!(!format.with_endianness(Endianness::Big).is_little_endian());
        assert_eq!(format.is_little_endian(), cfg!(target_endian = "little"));
    }

    #[test]
    fn huge_rows_do_not_wrap() {
        let format = PixelFormat::new(4, DataType::F32);
        assert!(format.buffer_size(u32::MAX, u32::MAX, 4).is_err());
    }

    #[test]
    fn rejected_formats() {
        assert!(PixelFormat::new(5, DataType::U8).check().is_err());
        assert!(PixelFormat::new(0, DataType::U8).check().is_err());
        assert!(matches!(PixelFormat::new(1, DataType::Boolean).check(), Err(Error::Unsupported(_))));
        assert!(matches!(PixelFormat::new(3, DataType::U32).check(), Err(Error::Unsupported(_))));
        assert!(PixelFormat::new(2, DataType::U8).check_for_image(false).is_err());
        assert!(PixelFormat::new(2, DataType::U8).check_for_image(true).is_ok());
    }

    #[test]
    fn small_buffer_is_refused() {
        let mut data = TryVec::new();
        data.resize_with(3, || 0u8).unwrap();
        let err = BufferSlot::new(PixelFormat::default(), data, 4).unwrap_err();
        assert!(matches!(err, Error::OutputTooSmall { needed: 4, provided: 3 }));
    }
}
