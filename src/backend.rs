// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Pixel reconstruction is delegated to a [`FrameBackend`].
//!
//! The decoder parses every header and the TOC itself, then creates one
//! [`FrameDecoder`] per frame it needs pixels for and feeds it complete
//! sections. Sections of one batch may be decoded concurrently, so
//! [`FrameDecoder::decode_section`] takes `&self`.

use crate::headers::{ColorEncoding, FrameHeader, ImageMetadata, Toc};
use crate::output::OutputRequest;
use crate::sections::{Section, SectionStatus};
use crate::{Error, Result, TryVec};

/// What a new frame decoder gets to know about its frame.
pub struct FrameContext<'a> {
    pub metadata: &'a ImageMetadata,
    pub header: &'a FrameHeader,
    pub toc: &'a Toc,
    pub is_preview: bool,
    /// Color encoding pixels should be converted to on output.
    pub output_encoding: &'a ColorEncoding,
    /// Contents of the JPEG reconstruction box, when one was collected.
    pub jpeg_data: Option<&'a [u8]>,
}

pub trait FrameBackend {
    type Frame: FrameDecoder;

    fn init_frame(&mut self, ctx: &FrameContext<'_>) -> Result<Self::Frame>;

    /// Expands the encoded ICC profile stored after the image metadata.
    ///
    /// The default treats the stored bytes as the profile itself.
    fn decompress_icc(&mut self, encoded: &[u8]) -> Result<TryVec<u8>> {
        let mut icc = TryVec::with_capacity(encoded.len())?;
        icc.extend_from_slice(encoded)?;
        Ok(icc)
    }
}

/// Reconstructs the pixels of one frame.
pub trait FrameDecoder: Sync {
    fn decode_section(&self, section: &Section<'_>) -> Result<SectionStatus>;

    /// Storage slots the frame read from, as a bitmask. Only meaningful once
    /// every section has been decoded.
    fn references(&self) -> u8;

    /// Called once after the last section, before any output.
    fn finalize(&mut self) -> Result<()>;

    fn write_image(&mut self, request: OutputRequest<'_>) -> Result<()>;

    /// Renders whatever has been decoded so far.
    fn flush(&mut self, _request: OutputRequest<'_>) -> Result<()> {
        Err(Error::Unsupported("flushing a partial frame"))
    }

    /// Writes the reconstructed JPEG file into `out`, returning its length.
    fn reconstruct_jpeg(&mut self, _jpeg_data: &[u8], _out: &mut [u8]) -> Result<usize> {
        Err(Error::Unsupported("JPEG reconstruction"))
    }
}
