// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Which frames must be reconstructed when frames are skipped.

use log::trace;

use crate::{Error, Result, TryVec};

/// Reference storage slots a frame can be saved into.
pub const NUM_STORAGE_SLOTS: usize = 8;
/// References of a frame whose sections haven't been decoded yet.
pub(crate) const UNKNOWN_REFERENCES: u8 = 0xff;

/// Internal frames that `index` and any frame after it may depend on.
///
/// `saved_as[i]` is the slot mask frame `i` is stored into and
/// `references[i]` the slot mask it reads from. Frames after `index` are not
/// known yet, so every slot occupied at `index` is taken as needed. The
/// result never contains `index` itself.
pub(crate) fn frame_dependencies(index: usize, saved_as: &[u8], references: &[u8]) -> Result<TryVec<usize>> {
    if saved_as.len() != references.len() || index >= saved_as.len() {
        return Err(Error::Api("frame index outside of known frames"));
    }
    let num_frames = saved_as.len();

    // storage[s][i]: last frame saved into slot s at or before frame i
    let mut storage: [TryVec<Option<usize>>; NUM_STORAGE_SLOTS] = Default::default();
    for (slot, frames) in storage.iter_mut().enumerate() {
        *frames = TryVec::with_capacity(num_frames)?;
        let mut id = None;
        for &saved in saved_as {
            if saved & (1 << slot) != 0 {
                id = Some(frames.len());
            }
            frames.push(id)?;
        }
    }

    let mut result = TryVec::new();
    let mut seen = TryVec::with_capacity(index + 1)?;
    seen.resize_with(index + 1, || false)?;
    let mut stack = TryVec::new();
    stack.push(index)?;
    seen[index] = true;

    for frames in &storage {
        if let Some(frame) = frames[index] {
            if !seen[frame] {
                seen[frame] = true;
                stack.push(frame)?;
                result.push(frame)?;
            }
        }
    }

    while let Some(frame) = stack.pop() {
        // the first frame cannot have references
        if frame == 0 {
            continue;
        }
        for (slot, frames) in storage.iter().enumerate() {
            if references[frame] & (1 << slot) == 0 {
                continue;
            }
            if let Some(referenced) = frames[frame - 1] {
                if !seen[referenced] {
                    seen[referenced] = true;
                    stack.push(referenced)?;
                    result.push(referenced)?;
                }
            }
        }
    }
    Ok(result)
}

/// Per-frame history kept across rewinds.
#[derive(Debug, Default)]
pub(crate) struct FrameDependencies {
    saved_as: TryVec<u8>,
    references: TryVec<u8>,
    external_to_internal: TryVec<usize>,
    /// Empty unless a skip is pending; then `false` marks frames that may be elided.
    required: TryVec<bool>,
}

impl FrameDependencies {
    /// Records a frame header the first time its indices are reached.
    pub(crate) fn record_frame(&mut self, internal: usize, external: usize, saved_as: u8) -> Result<()> {
        if external >= self.external_to_internal.len() {
            self.external_to_internal.push(internal)?;
        }
        if internal >= self.saved_as.len() {
            self.saved_as.push(saved_as)?;
            self.references.push(UNKNOWN_REFERENCES)?;
        }
        Ok(())
    }

    /// Stores the slots a decoded frame actually read from.
    pub(crate) fn set_references(&mut self, internal: usize, references: u8) {
        if let Some(slot) = self.references.get_mut(internal) {
            *slot = references;
        }
    }

    /// Whether a skipped frame may still be needed by a later frame.
    pub(crate) fn is_required(&self, internal: usize) -> bool {
        self.required.get(internal).copied().unwrap_or(true)
    }

    /// Recomputes the required set for a skip landing on external frame `target`.
    pub(crate) fn plan_skip(&mut self, target: usize) -> Result<()> {
        self.required.clear();
        let Some(&internal) = self.external_to_internal.get(target) else {
            return Ok(());
        };
        if internal >= self.saved_as.len() {
            return Ok(());
        }
        let deps = frame_dependencies(internal, &self.saved_as, &self.references)?;
        self.required.resize_with(internal + 1, || false)?;
        for dep in deps.iter().copied() {
            self.required[dep] = true;
        }
        trace!("skip to frame {target} (internal {internal}) needs {} earlier frames", deps.len());
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn known_frames(&self) -> usize {
        self.saved_as.len()
    }
}
