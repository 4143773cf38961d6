// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Synthetic streams and a frame backend that checks what it is fed.
#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use zenjxl_decode::{
    FrameBackend, FrameContext, FrameDecoder, OutputChannels, OutputRequest, PixelSink, Result, Section,
    SectionStatus, TryVec,
};

/// LSB-first bit writer matching the decoder's bit reader.
#[derive(Default)]
pub struct BitWriter {
    bytes: Vec<u8>,
    bits: u64,
}

impl BitWriter {
    pub fn write(&mut self, value: u64, bits: u8) {
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

    pub fn bool(&mut self, value: bool) {
        self.write(u64::from(value), 1);
    }

    pub fn pad(&mut self) {
        while self.bits % 8 != 0 {
            self.write(0, 1);
        }
    }

    pub fn u64(&mut self, value: u64) {
        match value {
            0 => self.write(0, 2),
            1..=16 => {
                self.write(1, 2);
                self.write(value - 1, 4);
            },
            17..=272 => {
                self.write(2, 2);
                self.write(value - 17, 8);
            },
            _ => panic!("test U64 values stay below 273"),
        }
    }

    pub fn bytes(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.write(u64::from(b), 8);
        }
    }

    pub fn finish(mut self) -> Vec<u8> {
        self.pad();
        self.bytes
    }
}

/// Image-level header fields a test can vary.
#[derive(Clone)]
pub struct Image {
    /// Multiples of 8, at most 256.
    pub xsize: u32,
    pub ysize: u32,
    /// Exif orientation, 1 to 8.
    pub orientation: u16,
    /// Side of a square preview, at most 64.
    pub preview: Option<u32>,
    pub animation: bool,
    pub alpha: bool,
    pub icc: Option<Vec<u8>>,
    pub extensions: bool,
}

impl Default for Image {
    fn default() -> Self {
        Self { xsize: 64, ysize: 64, orientation: 1, preview: None, animation: false, alpha: false, icc: None, extensions: false }
    }
}

/// One frame of a synthetic codestream.
#[derive(Clone)]
pub struct Frame {
    /// 0 regular, 2 reference-only.
    pub frame_type: u64,
    pub duration: u32,
    pub is_last: bool,
    pub save_as_reference: u64,
    pub name: &'static str,
    /// Storage slots the frame's pixels are computed from.
    pub references: u8,
    pub payload: u8,
}

impl Frame {
    pub fn still(payload: u8) -> Self {
        Self { frame_type: 0, duration: 0, is_last: true, save_as_reference: 0, name: "", references: 0, payload }
    }

    pub fn animated(payload: u8, duration: u32) -> Self {
        Self { duration, is_last: false, ..Self::still(payload) }
    }

    pub fn last(mut self) -> Self {
        self.is_last = true;
        self
    }

    pub fn saved_as(mut self, slot: u64) -> Self {
        self.save_as_reference = slot;
        self
    }

    pub fn reading(mut self, slots: u8) -> Self {
        self.references = slots;
        self
    }
}

fn write_u32_dim_small(w: &mut BitWriter, xsize: u32, ysize: u32) {
    w.bool(true);
    w.write(u64::from(ysize / 8 - 1), 5);
    w.write(0, 3);
    w.write(u64::from(xsize / 8 - 1), 5);
}

fn write_metadata(w: &mut BitWriter, image: &Image) {
    let extra_fields = image.orientation != 1 || image.preview.is_some() || image.animation;
    let all_default = !extra_fields && !image.alpha && image.icc.is_none() && !image.extensions;
    w.bool(all_default);
    if all_default {
        return;
    }
    w.bool(extra_fields);
    if extra_fields {
        w.write(u64::from(image.orientation - 1), 3);
        // no intrinsic size
        w.bool(false);
        w.bool(image.preview.is_some());
        if let Some(side) = image.preview {
            // not div8, DIM selector 0, square ratio
            w.bool(false);
            w.write(0, 2);
            w.write(u64::from(side - 1), 6);
            w.write(1, 3);
        }
        w.bool(image.animation);
        if image.animation {
            // 100/1 ticks per second, loop forever, no timecodes
            w.write(0, 2);
            w.write(0, 2);
            w.write(0, 2);
            w.bool(false);
        }
    }
    // 8-bit integer samples
    w.bool(false);
    w.write(0, 2);
    // modular 16-bit buffers suffice
    w.bool(true);
    if image.alpha {
        w.write(1, 2);
        w.bool(true);
    } else {
        w.write(0, 2);
    }
    // xyb encoded
    w.bool(true);
    if image.icc.is_some() {
        w.bool(false);
        w.bool(true);
        w.write(0, 2);
    } else {
        w.bool(true);
    }
    if extra_fields {
        w.bool(true);
    }
    if image.extensions {
        // extension 0 with an 8-bit payload
        w.u64(1);
        w.u64(8);
        w.write(0xa5, 8);
    } else {
        w.u64(0);
    }
}

fn write_frame_header(w: &mut BitWriter, image: &Image, frame: &Frame) {
    w.bool(false);
    w.write(frame.frame_type, 2);
    // modular
    w.bool(true);
    // flags
    w.u64(0);
    // upsampling 1, also per extra channel
    w.write(0, 2);
    if image.alpha {
        w.write(0, 2);
    }
    // 128-pixel groups
    w.write(0, 2);
    let reference_only = frame.frame_type == 2;
    if !reference_only {
        // one pass
        w.write(0, 2);
    }
    // no custom size or origin
    w.bool(false);
    if !reference_only {
        // replace blending, also per extra channel
        w.write(0, 2);
        if image.alpha {
            w.write(0, 2);
        }
        if image.animation {
            match frame.duration {
                0 => w.write(0, 2),
                1 => w.write(1, 2),
                d if d < 256 => {
                    w.write(2, 2);
                    w.write(u64::from(d), 8);
                },
                d => {
                    w.write(3, 2);
                    w.write(u64::from(d), 32);
                },
            }
        }
        w.bool(frame.is_last);
    }
    let is_last = frame.is_last && !reference_only;
    if !is_last {
        w.write(frame.save_as_reference, 2);
    }
    let duration = if image.animation { frame.duration } else { 0 };
    if reference_only || ((duration == 0 || frame.save_as_reference != 0) && !is_last) {
        // save before color transform
        w.bool(false);
    }
    let name = frame.name.as_bytes();
    match name.len() {
        0 => w.write(0, 2),
        n if n < 16 => {
            w.write(1, 2);
            w.write(n as u64, 4);
        },
        n => {
            assert!(n < 48);
            w.write(2, 2);
            w.write(n as u64 - 16, 5);
        },
    }
    w.bytes(name);
    // default loop filter
    w.bool(true);
    w.u64(0);
}

/// Number of sections of a frame of `xsize` × `ysize` with 128-pixel groups.
pub fn num_sections(xsize: u32, ysize: u32) -> usize {
    let groups = (xsize.div_ceil(128) * ysize.div_ceil(128)) as usize;
    if groups == 1 { 1 } else { groups + 3 }
}

/// Section contents: `[references, payload, id]`, checked by [`TestFrame`].
fn write_frame(out: &mut Vec<u8>, image: &Image, frame: &Frame, xsize: u32, ysize: u32) {
    let mut w = BitWriter::default();
    write_frame_header(&mut w, image, frame);
    // TOC, not permuted
    w.bool(false);
    w.pad();
    let n = num_sections(xsize, ysize);
    for _ in 0..n {
        w.write(0, 2);
        w.write(3, 10);
    }
    out.extend_from_slice(&w.finish());
    for id in 0..n {
        out.extend_from_slice(&[frame.references, frame.payload, id as u8]);
    }
}

/// A bare codestream holding `frames`.
pub fn codestream(image: &Image, frames: &[Frame]) -> Vec<u8> {
    let mut w = BitWriter::default();
    w.bytes(&[0xff, 0x0a]);
    write_u32_dim_small(&mut w, image.xsize, image.ysize);
    write_metadata(&mut w, image);
    // default transform data
    w.bool(true);
    if let Some(icc) = &image.icc {
        w.u64(icc.len() as u64);
    }
    let mut out = w.finish();
    if let Some(icc) = &image.icc {
        out.extend_from_slice(icc);
    }
    if let Some(side) = image.preview {
        let preview = Frame { is_last: true, ..Frame::still(0x77) };
        let preview_image = Image { animation: false, ..image.clone() };
        write_frame(&mut out, &preview_image, &preview, side, side);
    }
    for frame in frames {
        write_frame(&mut out, image, frame, image.xsize, image.ysize);
    }
    out
}

pub fn boxed(name: &[u8; 4], body: &[u8]) -> Vec<u8> {
    let mut out = ((body.len() + 8) as u32).to_be_bytes().to_vec();
    out.extend_from_slice(name);
    out.extend_from_slice(body);
    out
}

pub fn partial(index: u32, last: bool, body: &[u8]) -> Vec<u8> {
    let mut contents = (index | if last { 0x8000_0000 } else { 0 }).to_be_bytes().to_vec();
    contents.extend_from_slice(body);
    boxed(b"jxlp", &contents)
}

/// Signature box and `ftyp`, followed by `boxes`.
pub fn container(boxes: &[Vec<u8>]) -> Vec<u8> {
    let mut out = vec![0, 0, 0, 0x0c, b'J', b'X', b'L', b' ', 0x0d, 0x0a, 0x87, 0x0a];
    out.extend_from_slice(&boxed(b"ftyp", b"jxl \0\0\0\0jxl "));
    for b in boxes {
        out.extend_from_slice(b);
    }
    out
}

/// What the frame decoders have done so far.
#[derive(Debug, Default)]
pub struct Log {
    /// Payload of every frame whose sections were all decoded.
    pub decoded: Vec<u8>,
    /// Section ids in decode order, per frame.
    pub sections: Vec<Vec<usize>>,
    pub slots: [u8; 8],
    /// Dimensions and orientation of every color write.
    pub writes: Vec<(u32, u32, zenjxl_decode::Orientation)>,
}

/// Backend whose pixels are one byte per frame: the payload mixed with
/// every storage slot the frame reads.
#[derive(Clone, Default)]
pub struct TestBackend {
    pub log: Arc<Mutex<Log>>,
}

impl TestBackend {
    /// Forgets slot contents, as a fresh decode of the stream would.
    pub fn clear_slots(&self) {
        self.log.lock().unwrap().slots = [0; 8];
    }

    pub fn decoded(&self) -> Vec<u8> {
        self.log.lock().unwrap().decoded.clone()
    }
}

pub struct TestFrame {
    log: Arc<Mutex<Log>>,
    saved_as: u8,
    num_sections: usize,
    seen: Mutex<Vec<usize>>,
    contents: Mutex<Option<(u8, u8)>>,
    value: u8,
}

impl FrameBackend for TestBackend {
    type Frame = TestFrame;

    fn init_frame(&mut self, ctx: &FrameContext<'_>) -> Result<TestFrame> {
        Ok(TestFrame {
            log: self.log.clone(),
            saved_as: if ctx.is_preview { 0 } else { ctx.header.saved_as() },
            num_sections: ctx.toc.entries.len(),
            seen: Mutex::new(Vec::new()),
            contents: Mutex::new(None),
            value: 0,
        })
    }
}

impl FrameDecoder for TestFrame {
    fn decode_section(&self, section: &Section<'_>) -> Result<SectionStatus> {
        let data = section.data;
        if data.len() != 3 || usize::from(data[2]) != section.id || section.id >= self.num_sections {
            return Err(zenjxl_decode::Error::SectionDecode("section bytes misplaced"));
        }
        *self.contents.lock().unwrap() = Some((data[0], data[1]));
        self.seen.lock().unwrap().push(section.id);
        Ok(SectionStatus::Done)
    }

    fn references(&self) -> u8 {
        self.contents.lock().unwrap().map_or(0, |(references, _)| references)
    }

    fn finalize(&mut self) -> Result<()> {
        let (references, payload) = self.contents.lock().unwrap().unwrap_or_default();
        let mut log = self.log.lock().unwrap();
        let mut value = payload;
        for slot in 0..8 {
            if references & (1 << slot) != 0 {
                value = value.wrapping_add(log.slots[slot].rotate_left(slot as u32 + 1));
            }
        }
        for slot in 0..8 {
            if self.saved_as & (1 << slot) != 0 {
                log.slots[slot] = value;
            }
        }
        log.decoded.push(payload);
        let seen = std::mem::take(&mut *self.seen.lock().unwrap());
        log.sections.push(seen);
        self.value = value;
        Ok(())
    }

    fn write_image(&mut self, request: OutputRequest<'_>) -> Result<()> {
        let fill = match request.channels {
            OutputChannels::Color => {
                self.log.lock().unwrap().writes.push((request.xsize, request.ysize, request.orientation));
                self.value
            },
            OutputChannels::Extra(index) => self.value ^ 0x80 ^ index as u8,
        };
        let row = vec![fill; request.stride];
        match request.sink {
            PixelSink::Buffer(buffer) => {
                for chunk in buffer.chunks_mut(request.stride).take(request.ysize as usize) {
                    chunk.fill(fill);
                }
            },
            PixelSink::Rows(callback) => {
                for y in 0..request.ysize as usize {
                    callback(0, y, request.xsize as usize, &row);
                }
            },
        }
        Ok(())
    }

    fn reconstruct_jpeg(&mut self, jpeg_data: &[u8], out: &mut [u8]) -> Result<usize> {
        if out.len() < jpeg_data.len() {
            return Err(zenjxl_decode::Error::OutputTooSmall { needed: jpeg_data.len(), provided: out.len() });
        }
        out[..jpeg_data.len()].copy_from_slice(jpeg_data);
        Ok(jpeg_data.len())
    }
}

pub fn buffer(len: usize) -> TryVec<u8> {
    TryVec::from(vec![0u8; len])
}
