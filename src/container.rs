// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Signature detection and extraction of codestream bytes from container boxes.

use log::{debug, trace};

use crate::boxes::{BoxHeader, BoxType, read_box_header, read_part_index};
use crate::{Error, Result, ToU64, TryVec};

const CODESTREAM_SIGNATURE: [u8; 2] = [0xff, 0x0a];
const CONTAINER_SIGNATURE: [u8; 12] = [0, 0, 0, 0x0c, b'J', b'X', b'L', b' ', 0x0d, 0x0a, 0x87, 0x0a];

/// Bytes before the codestream in a typical container (signature, `ftyp`
/// and a codestream box header) plus a worst-case basic info header.
pub(crate) const INITIAL_BASIC_INFO_SIZE_HINT: usize = 48 + 50;

/// What the leading bytes of a file identify it as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signature {
    /// Too few bytes to tell; every byte so far matched a valid signature.
    NotEnoughBytes,
    Invalid,
    /// A bare codestream.
    Codestream,
    /// A codestream wrapped in container boxes.
    Container,
}

pub fn signature_check(data: &[u8]) -> Signature {
    let Some(&first) = data.first() else {
        return Signature::NotEnoughBytes;
    };
    if first == CODESTREAM_SIGNATURE[0] {
        return match data.get(1) {
            None => Signature::NotEnoughBytes,
            Some(&b) if b == CODESTREAM_SIGNATURE[1] => Signature::Codestream,
            Some(_) => Signature::Invalid,
        };
    }
    let n = data.len().min(CONTAINER_SIGNATURE.len());
    if data[..n] != CONTAINER_SIGNATURE[..n] {
        return Signature::Invalid;
    }
    if n < CONTAINER_SIGNATURE.len() { Signature::NotEnoughBytes } else { Signature::Container }
}

/// Owned copy of codestream bytes, used once input can no longer be read in place.
#[derive(Debug, Default)]
pub(crate) struct CodestreamBuffer {
    data: TryVec<u8>,
    /// Codestream offset of `data[0]`.
    start: u64,
}

impl CodestreamBuffer {
    pub(crate) fn append(&mut self, bytes: &[u8], limit: Option<u64>) -> Result<()> {
        if let Some(limit) = limit {
            if self.data.len().to_u64() + bytes.len().to_u64() > limit {
                return Err(Error::ResourceLimitExceeded("codestream buffer limit exceeded"));
            }
        }
        self.data.extend_from_slice(bytes)?;
        Ok(())
    }

    pub(crate) fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub(crate) fn start(&self) -> u64 {
        self.start
    }

    /// Drops every byte before codestream offset `pos`.
    pub(crate) fn discard_before(&mut self, pos: u64) -> Result<()> {
        let Some(n) = pos.checked_sub(self.start).and_then(|n| usize::try_from(n).ok()) else {
            return Ok(());
        };
        if n == 0 || n > self.data.len() {
            return Ok(());
        }
        let mut kept = TryVec::with_capacity(self.data.len() - n)?;
        kept.extend_from_slice(&self.data[n..])?;
        self.data = kept;
        self.start = pos;
        trace!("discarded {n} codestream bytes, buffer now starts at {pos}");
        Ok(())
    }
}

/// Where codestream bytes are read from.
#[derive(Debug)]
pub(crate) enum InputMode {
    /// In place from the caller's input; nothing has been copied.
    Direct,
    /// From an owned buffer. Once entered, never left until reset.
    Buffered(CodestreamBuffer),
}

impl InputMode {
    /// Switches to buffered mode, seeding the buffer with `initial`.
    pub(crate) fn start_buffering(&mut self, initial: &[u8], limit: Option<u64>) -> Result<()> {
        if let Self::Direct = self {
            let mut buffer = CodestreamBuffer::default();
            buffer.append(initial, limit)?;
            debug!("switching to buffered input with {} codestream bytes", initial.len());
            *self = Self::Buffered(buffer);
        }
        Ok(())
    }
}

/// Result of one scanning step over the caller's input.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Scan {
    /// The next `n` bytes of input are codestream.
    Codestream(usize),
    NeedMoreInput,
    /// A JPEG reconstruction box has been fully collected.
    JpegReconstruction,
}

/// File offsets of the codestream box being read.
#[derive(Debug, Clone, Copy)]
struct CodestreamPart {
    begin: u64,
    /// `None` when the box extends to the end of the file.
    end: Option<u64>,
}

#[derive(Debug)]
struct JpegBox {
    data: TryVec<u8>,
    remaining: u64,
}

/// Walks container boxes across input chunks, handing out codestream bytes.
#[derive(Debug)]
pub(crate) struct BoxScanner {
    have_container: bool,
    /// File offset of the first byte of the caller's current input.
    file_pos: u64,
    /// End offset of a box whose remaining contents are being skipped.
    skip_until: Option<u64>,
    part: Option<CodestreamPart>,
    last_part_seen: bool,
    jpeg_box: Option<JpegBox>,
    jpeg_data: Option<TryVec<u8>>,
    size_hint: Option<usize>,
}

impl BoxScanner {
    pub(crate) fn new(have_container: bool) -> Self {
        Self {
            have_container,
            file_pos: 0,
            skip_until: None,
            part: None,
            last_part_seen: false,
            jpeg_box: None,
            jpeg_data: None,
            size_hint: None,
        }
    }

    pub(crate) fn have_container(&self) -> bool {
        self.have_container
    }

    /// Bytes from the start of the current input likely needed to reach the basic info.
    pub(crate) fn size_hint(&self) -> usize {
        self.size_hint.unwrap_or(INITIAL_BASIC_INFO_SIZE_HINT)
    }

    pub(crate) fn take_jpeg_data(&mut self) -> Option<TryVec<u8>> {
        self.jpeg_data.take()
    }

    pub(crate) fn advance(&mut self, input: &mut &[u8], n: usize) {
        *input = &input[n..];
        self.file_pos += n.to_u64();
    }

    /// Whether the front of the input is a codestream part read in place,
    /// which must be handed out before boxes after it are consumed.
    fn holds_part_in_place(&self, mode: &InputMode) -> bool {
        matches!(mode, InputMode::Direct) && self.part.is_some()
    }

    /// Drops the first `n` input bytes, first copying out any codestream
    /// bytes among them that have not been consumed yet.
    fn consume_through(
        &mut self,
        input: &mut &[u8],
        n: usize,
        mode: &mut InputMode,
        limit: Option<u64>,
    ) -> Result<()> {
        if let (InputMode::Direct, Some(part)) = (&*mode, self.part) {
            let dropped_end = self.file_pos + n.to_u64();
            if part.begin < dropped_end {
                let begin = (part.begin - self.file_pos) as usize;
                let end = part.end.map_or(n, |end| end.min(dropped_end).saturating_sub(self.file_pos) as usize);
                mode.start_buffering(&input[begin..end], limit)?;
            }
        }
        self.advance(input, n);
        Ok(())
    }

    /// Advances past container structure at the front of `input`.
    ///
    /// Bytes belonging to skipped boxes are consumed. In buffered mode the
    /// codestream bytes of completed parts are appended to the buffer; in
    /// direct mode they stay at the front of `input`, where
    /// [`Scan::Codestream`] says how many there are.
    pub(crate) fn scan(
        &mut self,
        input: &mut &[u8],
        mode: &mut InputMode,
        collect_jpeg: bool,
        limit: Option<u64>,
    ) -> Result<Scan> {
        if !self.have_container {
            return Ok(Scan::Codestream(input.len()));
        }

        if let Some(end) = self.skip_until {
            let remaining = end - self.file_pos;
            if input.len().to_u64() < remaining {
                self.advance(input, input.len());
                return Ok(Scan::NeedMoreInput);
            }
            self.advance(input, remaining as usize);
            self.skip_until = None;
        }

        if let Some(jpeg) = &mut self.jpeg_box {
            let n = input.len().min(usize::try_from(jpeg.remaining).unwrap_or(usize::MAX));
            jpeg.data.extend_from_slice(&input[..n])?;
            jpeg.remaining -= n.to_u64();
            let done = jpeg.remaining == 0;
            self.advance(input, n);
            if !done {
                return Ok(Scan::NeedMoreInput);
            }
            self.jpeg_data = self.jpeg_box.take().map(|jpeg| jpeg.data);
            return Ok(Scan::JpegReconstruction);
        }

        // Finish the current part so the next box header can be parsed.
        if !self.last_part_seen {
            if let (Some(CodestreamPart { end: Some(end), .. }), InputMode::Buffered(buffer)) = (self.part, &mut *mode) {
                if self.file_pos < end && end - self.file_pos <= input.len().to_u64() {
                    let n = (end - self.file_pos) as usize;
                    buffer.append(&input[..n], limit)?;
                    self.advance(input, n);
                }
            }
        }

        let file_pos = self.file_pos;
        let needs_box = !self.last_part_seen && self.part.is_none_or(|part| part.end.is_some_and(|end| file_pos >= end));
        if needs_box {
            let mut pos = 0;
            while pos < input.len() {
                let box_start = pos;
                let Some(header) = read_box_header(&input[pos..])? else {
                    if self.holds_part_in_place(mode) {
                        break;
                    }
                    self.size_hint = Some(INITIAL_BASIC_INFO_SIZE_HINT + pos + BoxHeader::MIN_LARGE_SIZE as usize);
                    return Ok(Scan::NeedMoreInput);
                };
                let box_file_start = self.file_pos + box_start.to_u64();
                let box_end = match header.size {
                    Some(size) => Some(box_file_start.checked_add(size).ok_or(Error::InvalidData("box size overflow"))?),
                    None => None,
                };
                match header.name {
                    BoxType::CodestreamBox | BoxType::PartialCodestreamBox => {
                        let mut contents = header.contents_size();
                        pos += header.offset as usize;
                        let last = if header.name == BoxType::PartialCodestreamBox {
                            if contents.is_some_and(|size| size < 4) {
                                return Err(Error::InvalidData("jxlp box too small to contain index"));
                            }
                            let Some((index, last)) = read_part_index(&input[pos..]) else {
                                self.size_hint = Some(INITIAL_BASIC_INFO_SIZE_HINT + pos + 4);
                                return Ok(Scan::NeedMoreInput);
                            };
                            trace!("codestream part {index}{}", if last { " (last)" } else { "" });
                            pos += 4;
                            contents = contents.map(|size| size - 4);
                            last
                        } else {
                            true
                        };
                        if !last && contents.is_none() {
                            return Err(Error::InvalidData(
                                "final box has unbounded size, but is a non-final codestream box",
                            ));
                        }
                        if let (InputMode::Direct, Some(previous)) = (&*mode, self.part) {
                            // A second part: the codestream is no longer contiguous in the input.
                            let begin = (previous.begin - self.file_pos) as usize;
                            let end = previous.end.map_or(box_start, |end| (end - self.file_pos) as usize);
                            mode.start_buffering(&input[begin..end], limit)?;
                        }
                        self.last_part_seen |= last;
                        let begin = self.file_pos + pos.to_u64();
                        self.part = Some(CodestreamPart { begin, end: contents.map(|size| begin + size) });
                        let available = input.len() - pos;
                        let in_input = match contents {
                            Some(size) => available.min(usize::try_from(size).unwrap_or(usize::MAX)),
                            None => available,
                        };
                        match mode {
                            InputMode::Buffered(buffer) => {
                                buffer.append(&input[pos..pos + in_input], limit)?;
                                self.advance(input, pos + in_input);
                                pos = 0;
                            },
                            InputMode::Direct => {
                                self.advance(input, pos);
                                pos = in_input;
                            },
                        }
                        if self.last_part_seen {
                            break;
                        }
                    },
                    BoxType::JpegReconstructionBox if collect_jpeg => {
                        let Some(contents) = header.contents_size() else {
                            return Err(Error::InvalidData("unbounded JPEG reconstruction box"));
                        };
                        if limit.is_some_and(|limit| contents > limit) {
                            return Err(Error::ResourceLimitExceeded("JPEG reconstruction box too large"));
                        }
                        self.consume_through(input, pos + header.offset as usize, mode, limit)?;
                        self.jpeg_box = Some(JpegBox { data: TryVec::new(), remaining: contents });
                        return self.scan(input, mode, collect_jpeg, limit);
                    },
                    name => {
                        let Some(size) = header.size else {
                            if self.part.is_none() {
                                return Err(Error::InvalidData("didn't find any codestream box"));
                            }
                            break;
                        };
                        if name != BoxType::SignatureBox {
                            debug!("skipping {name:?} box ({size} bytes)");
                        }
                        if (input.len() - box_start).to_u64() < size {
                            if self.holds_part_in_place(mode) {
                                break;
                            }
                            self.skip_until = box_end;
                            self.size_hint =
                                Some(INITIAL_BASIC_INFO_SIZE_HINT.saturating_add(usize::try_from(size).unwrap_or(usize::MAX)));
                            let len = input.len();
                            self.consume_through(input, len, mode, limit)?;
                            return Ok(Scan::NeedMoreInput);
                        }
                        pos = box_start + size as usize;
                        if matches!(mode, InputMode::Buffered(_)) || self.part.is_none() {
                            self.advance(input, pos);
                            pos = 0;
                        }
                    },
                }
            }
        }

        let csize = match self.part {
            Some(CodestreamPart { end: Some(end), .. }) => match end.checked_sub(self.file_pos) {
                Some(left) => input.len().min(usize::try_from(left).unwrap_or(usize::MAX)),
                None => 0,
            },
            _ => input.len(),
        };
        Ok(Scan::Codestream(csize))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn boxed(name: &[u8; 4], body: &[u8]) -> std::vec::Vec<u8> {
        let mut out = ((body.len() + 8) as u32).to_be_bytes().to_vec();
        out.extend_from_slice(name);
        out.extend_from_slice(body);
        out
    }

    fn part(index: u32, last: bool, body: &[u8]) -> std::vec::Vec<u8> {
        let mut contents = (index | if last { 0x8000_0000 } else { 0 }).to_be_bytes().to_vec();
        contents.extend_from_slice(body);
        boxed(b"jxlp", &contents)
    }

    fn file(boxes: &[std::vec::Vec<u8>]) -> std::vec::Vec<u8> {
        let mut out = CONTAINER_SIGNATURE.to_vec();
        out.extend_from_slice(&boxed(b"ftyp", b"jxl \0\0\0\0jxl "));
        for b in boxes {
            out.extend_from_slice(b);
        }
        out
    }

    /// Runs the scanner the way the decoder does in buffered mode, collecting the codestream.
    fn collect(data: &[u8], chunk: usize) -> std::vec::Vec<u8> {
        let mut scanner = BoxScanner::new(true);
        let mut mode = InputMode::Buffered(CodestreamBuffer::default());
        let mut pending: std::vec::Vec<u8> = std::vec::Vec::new();
        for piece in data.chunks(chunk) {
            pending.extend_from_slice(piece);
            let mut input = &pending[..];
            loop {
                match scanner.scan(&mut input, &mut mode, false, None).unwrap() {
                    Scan::Codestream(n) => {
                        if let InputMode::Buffered(buffer) = &mut mode {
                            buffer.append(&input[..n], None).unwrap();
                        }
                        scanner.advance(&mut input, n);
                        if n == 0 {
                            break;
                        }
                    },
                    Scan::NeedMoreInput => break,
                    Scan::JpegReconstruction => {},
                }
            }
            pending = input.to_vec();
        }
        match mode {
            InputMode::Buffered(buffer) => buffer.bytes().to_vec(),
            InputMode::Direct => unreachable!(),
        }
    }

    #[test]
    fn signatures() {
        assert_eq!(signature_check(&[]), Signature::NotEnoughBytes);
        assert_eq!(signature_check(&[0xff]), Signature::NotEnoughBytes);
        assert_eq!(signature_check(&[0xff, 0x0a]), Signature::Codestream);
        assert_eq!(signature_check(&[0xff, 0xd8]), Signature::Invalid);
        assert_eq!(signature_check(&CONTAINER_SIGNATURE[..5]), Signature::NotEnoughBytes);
        assert_eq!(signature_check(&CONTAINER_SIGNATURE), Signature::Container);
        assert_eq!(signature_check(b"\0\0\0\x0cJXL!"), Signature::Invalid);
        assert_eq!(signature_check(b"GIF89a"), Signature::Invalid);
    }

    #[test]
    fn single_codestream_box() {
        let data = file(&[boxed(b"Exif", &[1; 7]), boxed(b"jxlc", b"codestream")]);
        assert_eq!(collect(&data, data.len()), b"codestream");
        assert_eq!(collect(&data, 1), b"codestream");
    }

    #[test]
    fn split_parts_reassemble() {
        let data = file(&[
            part(0, false, b"code"),
            boxed(b"xml ", b"<x/>"),
            part(1, false, b"str"),
            part(2, true, b"eam"),
        ]);
        for chunk in [1, 3, 7, data.len()] {
            assert_eq!(collect(&data, chunk), b"codestream", "chunk {chunk}");
        }
    }

    #[test]
    fn direct_mode_leaves_codestream_in_place() {
        let data = file(&[boxed(b"jxlc", b"codestream"), boxed(b"xml ", b"<x/>")]);
        let mut scanner = BoxScanner::new(true);
        let mut mode = InputMode::Direct;
        let mut input = &data[..];
        assert_eq!(scanner.scan(&mut input, &mut mode, false, None).unwrap(), Scan::Codestream(10));
        assert_eq!(&input[..10], b"codestream");
        assert!(matches!(mode, InputMode::Direct));
    }

    #[test]
    fn second_part_forces_buffering() {
        let data = file(&[part(0, false, b"ab"), part(1, true, b"cd")]);
        let mut scanner = BoxScanner::new(true);
        let mut mode = InputMode::Direct;
        let mut input = &data[..];
        assert_eq!(scanner.scan(&mut input, &mut mode, false, None).unwrap(), Scan::Codestream(0));
        match &mode {
            InputMode::Buffered(buffer) => assert_eq!(buffer.bytes(), b"abcd"),
            InputMode::Direct => panic!("expected buffered input"),
        }
    }

    #[test]
    fn direct_part_is_handed_out_before_partial_box() {
        let data = file(&[part(0, false, b"ab"), boxed(b"xml ", b"<long body>")]);
        // cut inside the next box body, then inside its header
        for cut in [data.len() - 3, data.len() - 15] {
            let mut scanner = BoxScanner::new(true);
            let mut mode = InputMode::Direct;
            let mut input = &data[..cut];
            assert_eq!(scanner.scan(&mut input, &mut mode, false, None).unwrap(), Scan::Codestream(2), "cut {cut}");
            assert_eq!(&input[..2], b"ab");
            assert!(matches!(mode, InputMode::Direct));

            // once the part is buffered, the partial box is consumed as before
            mode.start_buffering(&input[..2], None).unwrap();
            scanner.advance(&mut input, 2);
            assert_eq!(scanner.scan(&mut input, &mut mode, false, None).unwrap(), Scan::NeedMoreInput);
            match &mode {
                InputMode::Buffered(buffer) => assert_eq!(buffer.bytes(), b"ab"),
                InputMode::Direct => panic!("expected buffered input"),
            }
        }
    }

    #[test]
    fn malformed_boxes_are_fatal() {
        let mut wide = file(&[]);
        wide.extend_from_slice(b"\0\0\0\x01jxlc");
        wide.extend_from_slice(&8u64.to_be_bytes());
        let mut scanner = BoxScanner::new(true);
        let mut mode = InputMode::Direct;
        assert!(scanner.scan(&mut &wide[..], &mut mode, false, None).is_err());

        let tiny = file(&[boxed(b"jxlp", &[0, 0])]);
        let mut scanner = BoxScanner::new(true);
        assert!(scanner.scan(&mut &tiny[..], &mut InputMode::Direct, false, None).is_err());

        let mut unbounded = file(&[]);
        unbounded.extend_from_slice(b"\0\0\0\0jxlp\0\0\0\0");
        let mut scanner = BoxScanner::new(true);
        assert!(scanner.scan(&mut &unbounded[..], &mut InputMode::Direct, false, None).is_err());

        let mut overflow = file(&[]);
        overflow.extend_from_slice(b"\0\0\0\x01xml ");
        overflow.extend_from_slice(&u64::MAX.to_be_bytes());
        let mut scanner = BoxScanner::new(true);
        assert!(scanner.scan(&mut &overflow[..], &mut InputMode::Direct, false, None).is_err());
    }

    #[test]
    fn jpeg_box_is_collected_when_requested() {
        let data = file(&[boxed(b"jbrd", b"jpeg"), boxed(b"jxlc", b"cs")]);
        let mut scanner = BoxScanner::new(true);
        let mut mode = InputMode::Direct;
        let mut input = &data[..];
        assert_eq!(scanner.scan(&mut input, &mut mode, true, None).unwrap(), Scan::JpegReconstruction);
        assert_eq!(&scanner.take_jpeg_data().unwrap()[..], b"jpeg");
        assert_eq!(scanner.scan(&mut input, &mut mode, true, None).unwrap(), Scan::Codestream(2));
    }

    #[test]
    fn jpeg_box_respects_buffer_limit() {
        let data = file(&[boxed(b"jbrd", &[0; 32]), boxed(b"jxlc", b"cs")]);
        let mut scanner = BoxScanner::new(true);
        let mut input = &data[..];
        let result = scanner.scan(&mut input, &mut InputMode::Direct, true, Some(16));
        assert!(matches!(result, Err(Error::ResourceLimitExceeded(_))));

        let mut scanner = BoxScanner::new(true);
        let mut input = &data[..];
        let result = scanner.scan(&mut input, &mut InputMode::Direct, true, Some(32));
        assert_eq!(result.unwrap(), Scan::JpegReconstruction);
    }

    #[test]
    fn buffer_limit() {
        let mut buffer = CodestreamBuffer::default();
        buffer.append(&[0; 8], Some(10)).unwrap();
        assert!(matches!(buffer.append(&[0; 3], Some(10)), Err(Error::ResourceLimitExceeded(_))));
        buffer.discard_before(6).unwrap();
        assert_eq!(buffer.bytes().len(), 2);
        assert_eq!(buffer.start(), 6);
    }
}
