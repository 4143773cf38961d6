// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

#![no_main]

//! Headers only, one shot, under tight limits. Checks that every limit
//! fails cleanly instead of allocating.

use libfuzzer_sys::fuzz_target;
use zenjxl_decode::{
    DecodeConfig, Decoder, Events, FrameBackend, FrameContext, FrameDecoder, OutputRequest, Result, Section,
    SectionStatus, Status,
};

struct Refuse;

impl FrameBackend for Refuse {
    type Frame = Refuse;

    fn init_frame(&mut self, _ctx: &FrameContext<'_>) -> Result<Refuse> {
        Err(zenjxl_decode::Error::Unsupported("pixels"))
    }
}

impl FrameDecoder for Refuse {
    fn decode_section(&self, _section: &Section<'_>) -> Result<SectionStatus> {
        Ok(SectionStatus::Skipped)
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
    let config = DecodeConfig::default()
        .with_max_pixels(4096)
        .with_max_frames(8)
        .with_max_codestream_buffer(4096);
    let mut decoder = Decoder::with_config(Refuse, config);
    if decoder.subscribe_events(Events::BASIC_INFO | Events::COLOR_ENCODING | Events::FRAME).is_err() {
        return;
    }
    let mut input = data;
    for _ in 0..64 {
        match decoder.process(&mut input) {
            Ok(Status::Success | Status::NeedMoreInput) | Err(_) => return,
            Ok(_) => {},
        }
    }
});
