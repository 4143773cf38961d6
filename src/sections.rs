// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-frame section bookkeeping and batch dispatch to a [`ParallelRunner`].

use std::sync::OnceLock;

use enough::Stop;
use log::{debug, trace};

use crate::backend::FrameDecoder;
use crate::headers::{FrameHeader, Toc, TocEntry};
use crate::{Error, Result, ToU64, TryVec};

/// What part of a frame a section codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionKind {
    /// The whole frame, when it has a single group and pass.
    All,
    DcGlobal,
    DcGroup(u64),
    AcGlobal,
    AcGroup { group: u64, pass: u32 },
}

/// One complete section of a frame, as handed to a [`FrameDecoder`].
#[derive(Debug, Clone, Copy)]
pub struct Section<'a> {
    /// Index in TOC order.
    pub id: usize,
    pub kind: SectionKind,
    pub data: &'a [u8],
}

/// Outcome of decoding one section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionStatus {
    Done,
    /// Not decoded yet; the section is offered again in a later batch.
    Skipped,
}

/// Runs a batch of independent tasks, possibly concurrently.
///
/// `run` returns once every task has finished or one has failed.
pub trait ParallelRunner: Send + Sync {
    fn run(&self, num_tasks: usize, task: &(dyn Fn(usize) -> Result<()> + Sync)) -> Result<()>;
}

/// Runs tasks one after another on the calling thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct SequentialRunner;

impl ParallelRunner for SequentialRunner {
    fn run(&self, num_tasks: usize, task: &(dyn Fn(usize) -> Result<()> + Sync)) -> Result<()> {
        (0..num_tasks).try_for_each(|i| task(i))
    }
}

/// Runs tasks on the global rayon thread pool.
#[cfg(feature = "rayon")]
#[derive(Debug, Default, Clone, Copy)]
pub struct RayonRunner;

#[cfg(feature = "rayon")]
impl ParallelRunner for RayonRunner {
    fn run(&self, num_tasks: usize, task: &(dyn Fn(usize) -> Result<()> + Sync)) -> Result<()> {
        use rayon::prelude::*;
        (0..num_tasks).into_par_iter().try_for_each(|i| task(i))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Not all bytes have arrived.
    Waiting,
    Received,
    Done,
}

/// Tracks which sections of the current frame have arrived and been decoded.
#[derive(Debug)]
pub(crate) struct Sections {
    entries: TryVec<TocEntry>,
    states: TryVec<State>,
    /// Offset of the first section from the frame start.
    sections_begin: u64,
    num_dc_groups: u64,
    num_groups: u64,
    num_done: usize,
}

impl Sections {
    /// Fails if any section ends past `frame_size` or its bounds overflow.
    pub(crate) fn new(toc: &Toc, header: &FrameHeader, frame_size: u64, sections_begin: u64) -> Result<Self> {
        let mut entries = TryVec::with_capacity(toc.entries.len())?;
        let mut states = TryVec::with_capacity(toc.entries.len())?;
        for entry in toc.entries.iter().copied() {
            let end = sections_begin
                .checked_add(entry.offset)
                .and_then(|begin| begin.checked_add(entry.size))
                .ok_or(Error::InvalidData("section out of bounds"))?;
            if end > frame_size {
                return Err(Error::InvalidData("section out of bounds"));
            }
            entries.push(entry)?;
            states.push(State::Waiting)?;
        }
        Ok(Self {
            entries,
            states,
            sections_begin,
            num_dc_groups: header.dimensions.num_dc_groups,
            num_groups: header.dimensions.num_groups,
            num_done: 0,
        })
    }

    pub(crate) fn len(&self) -> usize {
        self.states.len()
    }

    pub(crate) fn kind(&self, id: usize) -> SectionKind {
        if self.len() == 1 {
            return SectionKind::All;
        }
        let id = id.to_u64();
        let ac_global = 1 + self.num_dc_groups;
        if id == 0 {
            SectionKind::DcGlobal
        } else if id < ac_global {
            SectionKind::DcGroup(id - 1)
        } else if id == ac_global {
            SectionKind::AcGlobal
        } else {
            let index = id - ac_global - 1;
            let groups = self.num_groups.max(1);
            SectionKind::AcGroup { group: index % groups, pass: (index / groups) as u32 }
        }
    }

    fn id_of(&self, kind: SectionKind) -> usize {
        let id = match kind {
            SectionKind::All | SectionKind::DcGlobal => 0,
            SectionKind::DcGroup(group) => 1 + group,
            SectionKind::AcGlobal => 1 + self.num_dc_groups,
            SectionKind::AcGroup { group, pass } => 2 + self.num_dc_groups + u64::from(pass) * self.num_groups + group,
        };
        id as usize
    }

    fn is_done(&self, kind: SectionKind) -> bool {
        self.states.get(self.id_of(kind)) == Some(&State::Done)
    }

    /// Whether every section `id` builds on has been decoded.
    fn prerequisites_done(&self, id: usize) -> bool {
        match self.kind(id) {
            SectionKind::All | SectionKind::DcGlobal => true,
            SectionKind::DcGroup(_) => self.is_done(SectionKind::DcGlobal),
            SectionKind::AcGlobal => (0..=self.num_dc_groups as usize).all(|dc| self.states[dc] == State::Done),
            SectionKind::AcGroup { group, pass } => {
                self.is_done(SectionKind::AcGlobal)
                    && (pass == 0 || self.is_done(SectionKind::AcGroup { group, pass: pass - 1 }))
            },
        }
    }

    /// Marks sections whose bytes lie within the first `available` bytes of the frame.
    pub(crate) fn set_input(&mut self, available: u64) {
        for (entry, state) in self.entries.iter().zip(self.states.iter_mut()) {
            if *state == State::Waiting && self.sections_begin + entry.offset + entry.size <= available {
                *state = State::Received;
            }
        }
    }

    pub(crate) fn all_done(&self) -> bool {
        self.num_done == self.len()
    }

    pub(crate) fn any_done(&self) -> bool {
        self.num_done > 0
    }

    fn all_received(&self) -> bool {
        self.states.iter().all(|&state| state != State::Waiting)
    }

    /// Decodes every received section whose prerequisites are met, in
    /// batches, until no further section can be decoded.
    ///
    /// `frame_data` starts at the frame start. Fails if every section has
    /// arrived but some can never complete.
    pub(crate) fn process<F: FrameDecoder>(
        &mut self,
        frame: &F,
        frame_data: &[u8],
        runner: &dyn ParallelRunner,
        stop: &(dyn Stop + Sync),
    ) -> Result<()> {
        loop {
            stop.check()?;
            let mut batch = TryVec::new();
            for id in 0..self.len() {
                if self.states[id] == State::Received && self.prerequisites_done(id) {
                    batch.push(id)?;
                }
            }
            if batch.is_empty() {
                break;
            }
            let mut statuses = TryVec::with_capacity(batch.len())?;
            statuses.resize_with(batch.len(), OnceLock::new)?;
            {
                let this = &*self;
                let task = |i: usize| -> Result<()> {
                    stop.check()?;
                    let id = batch[i];
                    let entry = this.entries[id];
                    let begin = usize::try_from(this.sections_begin + entry.offset)?;
                    let end = begin + usize::try_from(entry.size)?;
                    let section = Section { id, kind: this.kind(id), data: &frame_data[begin..end] };
                    trace!("decoding section {id} {:?} ({} bytes)", section.kind, section.data.len());
                    let status = frame.decode_section(&section)?;
                    let _ = statuses[i].set(status);
                    Ok(())
                };
                runner.run(batch.len(), &task)?;
            }
            let mut progress = false;
            for (&id, status) in batch.iter().zip(statuses.iter()) {
                if status.get() == Some(&SectionStatus::Done) {
                    self.states[id] = State::Done;
                    self.num_done += 1;
                    progress = true;
                }
            }
            if !progress {
                break;
            }
        }
        if self.all_received() && !self.all_done() {
            debug!("{} of {} sections could not be decoded", self.len() - self.num_done, self.len());
            return Err(Error::SectionDecode("frame sections never completed"));
        }
        Ok(())
    }
}
