#![deny(unsafe_code)]
//! Incremental decoder for JPEG XL bitstreams.
//!
//! The decoder accepts arbitrarily fragmented input, detects and unwraps the
//! optional ISOBMFF-style container, parses the codestream headers, tracks
//! which frames must be reconstructed when frames are skipped, and hands
//! complete frame sections to a [`FrameBackend`] for pixel reconstruction.
//!
//! This crate is written entirely in safe Rust code.

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use fallible_collections::TryReserveError;
use std::convert::TryInto as _;

mod backend;
mod bit_reader;
mod boxes;
mod container;
mod decoder;
mod fields;
mod frame_deps;
mod headers;
mod output;
mod sections;

pub use crate::backend::{FrameBackend, FrameContext, FrameDecoder};
pub use crate::container::{Signature, signature_check};
pub use crate::decoder::{
    BasicInfo, ColorProfileTarget, DecodeConfig, Decoder, DecoderStage, Events, FrameInfo, FrameStage,
    JpegOutput, Status,
};
pub use crate::frame_deps::NUM_STORAGE_SLOTS;
pub use crate::headers::{
    AnimationHeader, BitDepth, BlendMode, ColorEncoding, ColorSpace, CustomXy, ExtraChannelInfo, ExtraChannelType,
    FrameDimensions, FrameEncoding, FrameHeader, FrameType, ImageMetadata, PreviewHeader, Primaries,
    RenderingIntent, SizeHeader, Toc, TocEntry, ToneMapping, TransferFunction, WhitePoint,
};
pub use crate::output::{DataType, Endianness, OutputChannels, OutputRequest, PixelFormat, PixelSink, RowCallback};
#[cfg(feature = "rayon")]
pub use crate::sections::RayonRunner;
pub use crate::sections::{ParallelRunner, Section, SectionKind, SectionStatus, SequentialRunner};

pub use enough::{Stop, StopReason, Unstoppable};
pub use zencodec::Orientation;

/// Library version as `major * 1_000_000 + minor * 1_000 + patch`.
pub fn version() -> u32 {
    const fn parse(s: &str) -> u32 {
        let bytes = s.as_bytes();
        let mut value = 0;
        let mut i = 0;
        while i < bytes.len() {
            value = value * 10 + (bytes[i] - b'0') as u32;
            i += 1;
        }
        value
    }
    parse(env!("CARGO_PKG_VERSION_MAJOR")) * 1_000_000
        + parse(env!("CARGO_PKG_VERSION_MINOR")) * 1_000
        + parse(env!("CARGO_PKG_VERSION_PATCH"))
}

/// A trait to indicate a type can be infallibly converted to `u64`.
/// This should only be implemented for infallible conversions, so only unsigned types are valid.
pub(crate) trait ToU64 {
    fn to_u64(self) -> u64;
}

/// Statically verify that the platform `usize` can fit within a `u64`.
/// If the size won't fit on the given platform, this will fail at compile time, but if a type
/// which can fail `TryInto<usize>` is used, it may panic.
impl ToU64 for usize {
    fn to_u64(self) -> u64 {
        const _: () = assert!(std::mem::size_of::<usize>() <= std::mem::size_of::<u64>());
        self.try_into().ok().unwrap()
    }
}

/// A trait to indicate a type can be infallibly converted to `usize`.
/// This should only be implemented for infallible conversions, so only unsigned types are valid.
pub(crate) trait ToUsize {
    fn to_usize(self) -> usize;
}

/// Statically verify that the given type can fit within a `usize`.
/// If the size won't fit on the given platform, this will fail at compile time, but if a type
/// which can fail `TryInto<usize>` is used, it may panic.
macro_rules! impl_to_usize_from {
    ( $from_type:ty ) => {
        impl ToUsize for $from_type {
            fn to_usize(self) -> usize {
                const _: () = assert!(std::mem::size_of::<$from_type>() <= std::mem::size_of::<usize>());
                self.try_into().ok().unwrap()
            }
        }
    };
}

impl_to_usize_from!(u8);
impl_to_usize_from!(u16);
impl_to_usize_from!(u32);

#[doc(hidden)]
pub type TryVec<T> = fallible_collections::TryVec<T>;

// To ensure we don't use stdlib allocating types by accident
#[allow(dead_code)]
struct Vec;
#[allow(dead_code)]
struct Box;
#[allow(dead_code)]
struct HashMap;
#[allow(dead_code)]
struct String;

/// Describes decoder failures.
///
/// Every variant is fatal when returned from [`Decoder::process`]: the decoder
/// moves to [`DecoderStage::Error`] and must be reset before further use.
/// Transient conditions ("need more input", "need an output buffer") are
/// reported as a [`Status`] instead.
#[derive(Debug)]
pub enum Error {
    /// Parse error caused by corrupt or malformed data.
    InvalidData(&'static str),
    /// Valid data using a feature this decoder does not handle.
    Unsupported(&'static str),
    /// The API was used out of order or with invalid arguments.
    Api(&'static str),
    /// A caller-provided output buffer cannot hold the requested pixels.
    OutputTooSmall { needed: usize, provided: usize },
    /// Out of memory
    OutOfMemory,
    /// Resource limit exceeded during decoding
    ResourceLimitExceeded(&'static str),
    /// Operation was stopped/cancelled
    Stopped(enough::StopReason),
    /// The frame backend failed to reconstruct a section.
    SectionDecode(&'static str),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            Self::InvalidData(s) | Self::Unsupported(s) | Self::Api(s) | Self::ResourceLimitExceeded(s) => s,
            Self::SectionDecode(s) => return write!(f, "section decode failed: {s}"),
            Self::OutputTooSmall { needed, provided } => {
                return write!(f, "output buffer too small: need {needed} bytes, got {provided}");
            },
            Self::OutOfMemory => "OOM",
            Self::Stopped(reason) => return write!(f, "Stopped: {}", reason),
        };
        f.write_str(msg)
    }
}

impl std::error::Error for Error {}

impl From<std::string::FromUtf8Error> for Error {
    fn from(_: std::string::FromUtf8Error) -> Self {
        Self::InvalidData("invalid utf8")
    }
}

impl From<std::num::TryFromIntError> for Error {
    fn from(_: std::num::TryFromIntError) -> Self {
        Self::InvalidData("integer conversion failed")
    }
}

impl From<TryReserveError> for Error {
    fn from(_: TryReserveError) -> Self {
        Self::OutOfMemory
    }
}

impl From<enough::StopReason> for Error {
    fn from(reason: enough::StopReason) -> Self {
        Self::Stopped(reason)
    }
}

/// Result shorthand using our Error enum.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[test]
fn version_matches_manifest() {
    let v = version();
    assert_eq!(v / 1_000_000, env!("CARGO_PKG_VERSION_MAJOR").parse::<u32>().unwrap());
    assert_eq!(v % 1_000, env!("CARGO_PKG_VERSION_PATCH").parse::<u32>().unwrap());
}

#[test]
fn error_display() {
    assert_eq!(Error::InvalidData("invalid box size").to_string(), "invalid box size");
    assert_eq!(
        Error::OutputTooSmall { needed: 12, provided: 4 }.to_string(),
        "output buffer too small: need 12 bytes, got 4"
    );
}
