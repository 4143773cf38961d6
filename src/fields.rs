// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Variable-length field encodings shared by all codestream headers.

use crate::bit_reader::BitReader;
use crate::{Error, Result};

/// One of the four alternatives of a `U32` field, chosen by a 2-bit selector.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Dist {
    Val(u32),
    Bits(u8),
    BitsOffset(u8, u32),
}

pub(crate) use Dist::{Bits, BitsOffset, Val};

pub(crate) fn read_u32(reader: &mut BitReader<'_>, dists: [Dist; 4]) -> Result<u32> {
    let selector = reader.read(2) as usize;
    match dists[selector] {
        Val(v) => Ok(v),
        Bits(n) => Ok(reader.read_u32(n)),
        BitsOffset(n, offset) => reader
            .read_u32(n)
            .checked_add(offset)
            .ok_or(Error::InvalidData("U32 field overflow")),
    }
}

pub(crate) fn read_u64(reader: &mut BitReader<'_>) -> Result<u64> {
    match reader.read(2) {
        0 => Ok(0),
        1 => Ok(1 + reader.read(4)),
        2 => Ok(17 + reader.read(8)),
        _ => {
            let mut value = reader.read(12);
            let mut shift = 12;
            while reader.read_bool() {
                if shift == 60 {
                    value |= reader.read(4) << shift;
                    break;
                }
                value |= reader.read(8) << shift;
                shift += 8;
            }
            Ok(value)
        },
    }
}

/// IEEE half-precision value. Infinities and NaN are rejected.
pub(crate) fn read_f16(reader: &mut BitReader<'_>) -> Result<f32> {
    let bits = reader.read(16) as u32;
    let sign = bits >> 15;
    let biased_exp = (bits >> 10) & 0x1f;
    let mantissa = bits & 0x3ff;
    if biased_exp == 31 {
        return Err(Error::InvalidData("F16 infinity or NaN"));
    }
    let magnitude = if biased_exp == 0 {
        mantissa as f32 / 1024.0 * (-14f32).exp2()
    } else {
        (1.0 + mantissa as f32 / 1024.0) * (biased_exp as f32 - 15.0).exp2()
    };
    Ok(if sign != 0 { -magnitude } else { magnitude })
}

/// Raw enumerator value; callers map it to their enum and reject unknown values.
pub(crate) fn read_enum(reader: &mut BitReader<'_>) -> Result<u32> {
    let value = read_u32(reader, [Val(0), Val(1), BitsOffset(4, 2), BitsOffset(6, 18)])?;
    if value >= 64 {
        return Err(Error::InvalidData("enum value out of range"));
    }
    Ok(value)
}

pub(crate) fn unpack_signed(value: u32) -> i32 {
    if value & 1 == 0 { (value >> 1) as i32 } else { -(((value >> 1) + 1) as i64) as i32 }
}

/// Reads the extension bitmask and skips the payload of every set extension.
pub(crate) fn read_extensions(reader: &mut BitReader<'_>) -> Result<u64> {
    let extensions = read_u64(reader)?;
    let mut total_bits = 0u64;
    for bit in 0..64 {
        if extensions & (1 << bit) != 0 {
            let bits = read_u64(reader)?;
            total_bits = total_bits.checked_add(bits).ok_or(Error::InvalidData("extension size overflow"))?;
        }
    }
    reader.skip_bits(total_bits);
    Ok(extensions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bit_reader::BitWriter;

    #[test]
    fn u32_selectors() {
        let mut w = BitWriter::new();
        w.write(0, 2);
        w.write(1, 2);
        w.write(2, 2);
        w.write(0b101, 3);
        w.write(3, 2);
        w.write(7, 4);
        let bytes = w.finish();
        let dists = [Val(8), Val(10), Bits(3), BitsOffset(4, 100)];
        let mut r = BitReader::new(&bytes);
        assert_eq!(read_u32(&mut r, dists).unwrap(), 8);
        assert_eq!(read_u32(&mut r, dists).unwrap(), 10);
        assert_eq!(read_u32(&mut r, dists).unwrap(), 5);
        assert_eq!(read_u32(&mut r, dists).unwrap(), 107);
        assert!(r.close());
    }

    #[test]
    fn u32_offset_overflow() {
        let mut w = BitWriter::new();
        w.write(3, 2);
        w.write(u64::from(u32::MAX), 32);
        let bytes = w.finish();
        let mut r = BitReader::new(&bytes);
        assert!(read_u32(&mut r, [Val(0), Val(0), Val(0), BitsOffset(32, 1)]).is_err());
    }

    #[test]
    fn u64_forms() {
        let mut w = BitWriter::new();
        w.write(1, 2);
        w.write(15, 4);
        w.write(2, 2);
        w.write(255, 8);
        w.write(3, 2);
        w.write(0xabc, 12);
        w.write_bool(true);
        w.write(0x12, 8);
        w.write_bool(false);
        let bytes = w.finish();
        let mut r = BitReader::new(&bytes);
        assert_eq!(read_u64(&mut r).unwrap(), 16);
        assert_eq!(read_u64(&mut r).unwrap(), 272);
        assert_eq!(read_u64(&mut r).unwrap(), 0x12abc);
        assert!(r.close());
    }

    #[test]
    fn f16_values() {
        let mut w = BitWriter::new();
        w.write(0x3c00, 16);
        w.write(0xc000, 16);
        w.write(0x0001, 16);
        w.write(0x7c00, 16);
        let bytes = w.finish();
        let mut r = BitReader::new(&bytes);
        assert_eq!(read_f16(&mut r).unwrap(), 1.0);
        assert_eq!(read_f16(&mut r).unwrap(), -2.0);
        assert_eq!(read_f16(&mut r).unwrap(), (-24f32).exp2());
        assert!(read_f16(&mut r).is_err());
    }

    #[test]
    fn signed_unpacking() {
        assert_eq!(unpack_signed(0), 0);
        assert_eq!(unpack_signed(1), -1);
        assert_eq!(unpack_signed(2), 1);
        assert_eq!(unpack_signed(3), -2);
        assert_eq!(unpack_signed(u32::MAX), i32::MIN);
    }

    #[test]
    fn extensions_are_skipped() {
        let mut w = BitWriter::new();
        // extensions = 0b101 via the 4-bit form (value 5 = 1 + 4)
        w.write(1, 2);
        w.write(4, 4);
        // bit 0 payload: 3 bits, bit 2 payload: 5 bits
        w.write(1, 2);
        w.write(2, 4);
        w.write(1, 2);
        w.write(4, 4);
        w.write(0, 8);
        w.write(0b11, 2);
        let bytes = w.finish();
        let mut r = BitReader::new(&bytes);
        assert_eq!(read_extensions(&mut r).unwrap(), 0b101);
        assert_eq!(r.read(2), 0b11);
        assert!(r.close());
    }
}
