// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

#![no_main]

//! Drives the decoder over arbitrary input in small chunks, answering every
//! buffer request, with a backend that accepts any section.

use libfuzzer_sys::fuzz_target;
use zenjxl_decode::{
    DataType, DecodeConfig, Decoder, Events, FrameBackend, FrameContext, FrameDecoder, OutputRequest, PixelFormat,
    Result, Section, SectionStatus, Status, TryVec,
};

struct Blank;

impl FrameBackend for Blank {
    type Frame = Blank;

    fn init_frame(&mut self, _ctx: &FrameContext<'_>) -> Result<Blank> {
        Ok(Blank)
    }
}

impl FrameDecoder for Blank {
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

fuzz_target!(|data: &[u8]| {
    let Some((&chunk, data)) = data.split_first() else {
        return;
    };
    let chunk = usize::from(chunk.max(1));
    let config = DecodeConfig::default().with_max_pixels(1 << 20).with_max_frames(64);
    let mut decoder = Decoder::with_config(Blank, config);
    let events = Events::BASIC_INFO
        | Events::EXTENSIONS
        | Events::COLOR_ENCODING
        | Events::PREVIEW_IMAGE
        | Events::FRAME
        | Events::FULL_IMAGE;
    if decoder.subscribe_events(events).is_err() {
        return;
    }
    let format = PixelFormat::new(4, DataType::U8);
    let mut pending = Vec::new();
    let mut offered = 0;
    loop {
        let mut input = &pending[..];
        let status = match decoder.process(&mut input) {
            Ok(status) => status,
            Err(_) => return,
        };
        let consumed = pending.len() - input.len();
        pending.drain(..consumed);
        let answered = match status {
            Status::NeedMoreInput if offered < data.len() => {
                let end = (offered + chunk).min(data.len());
                pending.extend_from_slice(&data[offered..end]);
                offered = end;
                Ok(())
            },
            Status::NeedMoreInput | Status::Success => return,
            Status::NeedImageOutBuffer => decoder
                .image_out_buffer_size(&format)
                .and_then(|size| decoder.set_image_out_buffer(format, TryVec::from(vec![0; size]))),
            Status::NeedPreviewOutBuffer => decoder
                .preview_out_buffer_size(&format)
                .and_then(|size| decoder.set_preview_out_buffer(format, TryVec::from(vec![0; size]))),
            Status::BasicInfo => decoder.basic_info().map(drop),
            Status::Frame => decoder.frame_header().map(drop),
            _ => Ok(()),
        };
        if answered.is_err() {
            return;
        }
    }
});
