// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Container box types and box header parsing.

use byteorder::{BigEndian, ByteOrder as _};
use std::fmt;

use crate::{Error, Result};

macro_rules! box_database {
    ($($(#[$attr:meta])* $boxenum:ident $boxtype:literal),*,) => {
        #[derive(Clone, Copy, PartialEq, Eq)]
        pub(crate) enum BoxType {
            $($(#[$attr])* $boxenum),*,
            UnknownBox(u32),
        }

        impl From<u32> for BoxType {
            fn from(t: u32) -> BoxType {
                use self::BoxType::*;
                match t {
                    $($boxtype => $boxenum),*,
                    _ => UnknownBox(t),
                }
            }
        }

        impl From<BoxType> for u32 {
            fn from(b: BoxType) -> u32 {
                use self::BoxType::*;
                match b {
                    $($boxenum => $boxtype),*,
                    UnknownBox(t) => t,
                }
            }
        }

        impl fmt::Debug for BoxType {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let fourcc: FourCC = From::from(*self);
                fmt::Debug::fmt(&fourcc, f)
            }
        }
    }
}

box_database!(
    /// Container signature, parsed as an ordinary box.
    SignatureBox                0x4a58_4c20, // "JXL "
    FileTypeBox                 0x6674_7970, // "ftyp"
    CodestreamBox               0x6a78_6c63, // "jxlc"
    /// One part of a split codestream, prefixed by a 4-byte index.
    PartialCodestreamBox        0x6a78_6c70, // "jxlp"
    JpegReconstructionBox       0x6a62_7264, // "jbrd"
    ExifBox                     0x4578_6966, // "Exif"
    XmlBox                      0x786d_6c20, // "xml "
    JumbfBox                    0x6a75_6d62, // "jumb"
    LevelBox                    0x6a78_6c6c, // "jxll"
);

#[derive(Default, PartialEq, Eq, Clone, Copy)]
pub(crate) struct FourCC {
    pub value: [u8; 4],
}

impl From<u32> for FourCC {
    fn from(number: u32) -> FourCC {
        FourCC { value: number.to_be_bytes() }
    }
}

impl From<BoxType> for FourCC {
    fn from(t: BoxType) -> FourCC {
        let box_num: u32 = Into::into(t);
        From::from(box_num)
    }
}

impl fmt::Debug for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.value) {
            Ok(s) => f.write_str(s),
            Err(_) => fmt::Debug::fmt(&self.value, f),
        }
    }
}

/// Each box begins with a header giving the length of the whole box and a
/// four-byte type.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BoxHeader {
    pub name: BoxType,
    /// Size of the box in bytes including this header; `None` extends to end of file.
    pub size: Option<u64>,
    /// Length of the header itself.
    pub offset: u64,
}

impl BoxHeader {
    /// 4-byte size + 4-byte type
    pub const MIN_SIZE: u64 = 8;
    /// 4-byte size + 4-byte type + 8-byte size
    pub const MIN_LARGE_SIZE: u64 = 16;

    /// Bytes of box content after the header, if bounded.
    pub fn contents_size(&self) -> Option<u64> {
        self.size.map(|size| size - self.offset)
    }
}

/// Parses a box header from the start of `data`.
///
/// Returns `Ok(None)` when `data` is too short to hold the whole header; a
/// size field smaller than the header it belongs to is fatal.
pub(crate) fn read_box_header(data: &[u8]) -> Result<Option<BoxHeader>> {
    if data.len() < BoxHeader::MIN_SIZE as usize {
        return Ok(None);
    }
    let size32 = BigEndian::read_u32(&data[0..4]);
    let name = BoxType::from(BigEndian::read_u32(&data[4..8]));
    let (size, offset) = match size32 {
        // valid only for the last box; extends to end of file
        0 => (None, BoxHeader::MIN_SIZE),
        1 => {
            if data.len() < BoxHeader::MIN_LARGE_SIZE as usize {
                return Ok(None);
            }
            let size64 = BigEndian::read_u64(&data[8..16]);
            if size64 < BoxHeader::MIN_LARGE_SIZE {
                return Err(Error::InvalidData("malformed wide size"));
            }
            (Some(size64), BoxHeader::MIN_LARGE_SIZE)
        },
        _ => {
            if u64::from(size32) < BoxHeader::MIN_SIZE {
                return Err(Error::InvalidData("malformed size"));
            }
            (Some(u64::from(size32)), BoxHeader::MIN_SIZE)
        },
    };
    Ok(Some(BoxHeader { name, size, offset }))
}

/// Index field at the start of a `jxlp` box body. The top bit marks the last part.
pub(crate) fn read_part_index(data: &[u8]) -> Option<(u32, bool)> {
    let index = BigEndian::read_u32(data.get(..4)?);
    Some((index & 0x7fff_ffff, index & 0x8000_0000 != 0))
}

#[test]
fn box_type_names() {
    assert_eq!(BoxType::from(u32::from_be_bytes(*b"jxlp")), BoxType::PartialCodestreamBox);
    assert_eq!(format!("{:?}", BoxType::CodestreamBox), "jxlc");
    assert_eq!(format!("{:?}", BoxType::from(0x7878_7878)), "xxxx");
}

#[test]
fn header_sizes() {
    let mut data = [0u8; 16];
    data[..8].copy_from_slice(b"\0\0\0\x14jxlc");
    let header = read_box_header(&data).unwrap().unwrap();
    assert_eq!(header.name, BoxType::CodestreamBox);
    assert_eq!(header.size, Some(20));
    assert_eq!(header.contents_size(), Some(12));

    data[..8].copy_from_slice(b"\0\0\0\0jxlc");
    assert_eq!(read_box_header(&data).unwrap().unwrap().size, None);

    data[..8].copy_from_slice(b"\0\0\0\x07jxlc");
    assert!(read_box_header(&data).is_err());
}

#[test]
fn wide_size_smaller_than_header_is_fatal() {
    let mut data = [0u8; 16];
    data[..8].copy_from_slice(b"\0\0\0\x01jxlc");
    data[8..].copy_from_slice(&15u64.to_be_bytes());
    assert!(read_box_header(&data).is_err());
    // Same header missing its wide size asks for more input instead.
    assert!(read_box_header(&data[..12]).unwrap().is_none());
}

#[test]
fn part_index() {
    assert_eq!(read_part_index(&[0x80, 0, 0, 2]), Some((2, true)));
    assert_eq!(read_part_index(&[0, 0, 0, 1]), Some((1, false)));
    assert_eq!(read_part_index(&[0, 0]), None);
}
