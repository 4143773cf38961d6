// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bit reader that tolerates reading past the end of its span.
//!
//! Headers are parsed speculatively against whatever input has arrived so
//! far. Reads beyond the span yield zero bits and are tallied, so a parse
//! that ran off the end can be told apart from one that found bad data.

use bitstream_io::{BitRead, LittleEndian};

use crate::{Error, Result, ToU64};

pub(crate) struct BitReader<'a> {
    inner: bitstream_io::BitReader<&'a [u8], LittleEndian>,
    /// Bits left in the span.
    remaining: u64,
    consumed: u64,
    /// Bits requested after the span was exhausted.
    overrun: u64,
}

impl<'a> BitReader<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self {
            inner: bitstream_io::BitReader::endian(data, LittleEndian),
            remaining: data.len().to_u64().saturating_mul(8),
            consumed: 0,
            overrun: 0,
        }
    }

    /// Reader over `data` positioned `bits` bits in.
    pub(crate) fn at(data: &'a [u8], bits: u64) -> Self {
        let mut reader = Self::new(data);
        reader.skip_bits(bits);
        reader
    }

    /// Reads `bits` (at most 64) LSB-first. Out-of-span bits read as zero.
    pub(crate) fn read(&mut self, bits: u8) -> u64 {
        debug_assert!(bits <= 64);
        if bits == 0 {
            return 0;
        }
        if self.overrun == 0 && u64::from(bits) <= self.remaining {
            if let Ok(value) = self.inner.read::<u64>(u32::from(bits)) {
                self.remaining -= u64::from(bits);
                self.consumed += u64::from(bits);
                return value;
            }
        }
        self.overrun += u64::from(bits);
        0
    }

    pub(crate) fn read_u32(&mut self, bits: u8) -> u32 {
        debug_assert!(bits <= 32);
        self.read(bits) as u32
    }

    pub(crate) fn read_bool(&mut self) -> bool {
        self.read(1) != 0
    }

    pub(crate) fn skip_bits(&mut self, bits: u64) {
        if self.overrun == 0 && bits <= self.remaining {
            let mut left = bits;
            while left > 0 {
                let step = left.min(u64::from(u32::MAX)) as u32;
                if self.inner.skip(step).is_err() {
                    break;
                }
                left -= u64::from(step);
            }
            if left == 0 {
                self.remaining -= bits;
                self.consumed += bits;
                return;
            }
        }
        self.overrun = self.overrun.saturating_add(bits);
    }

    pub(crate) fn total_bits_consumed(&self) -> u64 {
        self.consumed.saturating_add(self.overrun)
    }

    /// Skips to the next byte boundary. The skipped bits must be zero.
    pub(crate) fn jump_to_byte_boundary(&mut self) -> Result<()> {
        let pad = ((8 - self.total_bits_consumed() % 8) % 8) as u8;
        if self.read(pad) != 0 {
            return Err(Error::InvalidData("nonzero padding bits"));
        }
        Ok(())
    }

    pub(crate) fn all_reads_within_bounds(&self) -> bool {
        self.overrun == 0
    }

    /// Consumes the reader, reporting whether every read stayed inside the span.
    pub(crate) fn close(self) -> bool {
        self.all_reads_within_bounds()
    }
}

/// LSB-first writer used to assemble test bitstreams.
#[cfg(test)]
pub(crate) struct BitWriter {
    bytes: std::vec::Vec<u8>,
    bits: u64,
}

#[cfg(test)]
impl BitWriter {
    pub(crate) fn new() -> Self {
        Self { bytes: std::vec::Vec::new(), bits: 0 }
    }

    pub(crate) fn write(&mut self, value: u64, bits: u8) {
        for i in 0..bits {
            if self.bits % 8 == 0 {
                self.bytes.push(0);
            }
            let bit = ((value >> i) & 1) as u8;
            let last = self.bytes.len() - 1;
            self.bytes[last] |= bit << (self.bits % 8);
            self.bits += 1;
        }
    }

    pub(crate) fn write_bool(&mut self, value: bool) {
        self.write(u64::from(value), 1);
    }

    pub(crate) fn zero_pad_to_byte(&mut self) {
        while self.bits % 8 != 0 {
            self.write(0, 1);
        }
    }

    pub(crate) fn finish(self) -> std::vec::Vec<u8> {
        self.bytes
    }
}

#[test]
fn reads_lsb_first() {
    let mut reader = BitReader::new(&[0b1011_0010, 0xff, 0x34, 0x12]);
    assert_eq!(reader.read(1), 0);
    assert_eq!(reader.read(3), 0b001);
    assert_eq!(reader.read(4), 0b1011);
    assert_eq!(reader.read(8), 0xff);
    // multi-byte fields take their low bits from the earlier byte
    assert_eq!(reader.read(16), 0x1234);
    assert!(reader.close());
}

#[test]
fn overrun_reads_zero_and_is_counted() {
    let mut reader = BitReader::new(&[0xff]);
    assert_eq!(reader.read(4), 0xf);
    assert_eq!(reader.read(8), 0);
    assert_eq!(reader.total_bits_consumed(), 12);
    assert!(!reader.all_reads_within_bounds());
    // Once past the end, remaining in-span bits are not handed out either.
    assert_eq!(reader.read(2), 0);
    assert_eq!(reader.total_bits_consumed(), 14);
    assert!(!reader.close());
}

#[test]
fn zero_bit_read() {
    let mut reader = BitReader::new(&[]);
    assert_eq!(reader.read(0), 0);
    assert!(reader.close());
}

#[test]
fn skip_beyond_span() {
    let mut reader = BitReader::new(&[0; 2]);
    reader.skip_bits(u64::MAX);
    assert_eq!(reader.total_bits_consumed(), u64::MAX);
    assert!(!reader.all_reads_within_bounds());

    let mut reader = BitReader::at(&[0xf0], 4);
    assert_eq!(reader.read(4), 0xf);
    assert!(reader.close());
}

#[test]
fn padding_must_be_zero() {
    let mut w = BitWriter::new();
    w.write(0b101, 3);
    w.zero_pad_to_byte();
    w.write(0xa5, 8);
    let bytes = w.finish();
    assert_eq!(bytes, [0b101, 0xa5]);
    let mut reader = BitReader::new(&bytes);
    assert_eq!(reader.read(3), 0b101);
    reader.jump_to_byte_boundary().unwrap();
    assert_eq!(reader.total_bits_consumed(), 8);
    assert_eq!(reader.read(8), 0xa5);

    let mut reader = BitReader::new(&[0b1000_0001]);
    reader.read(1);
    assert!(reader.jump_to_byte_boundary().is_err());
}
