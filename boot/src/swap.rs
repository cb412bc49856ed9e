//! The swap executor and its recovery procedure.
//!
//! [`Swap`] is the caller-facing entry point: a bootloader constructs one
//! from its two flash handles at boot, calls [`Swap::startup`], and treats
//! whatever comes back as the final word on whether an upgrade happened.
//! There is no global or static state here -- everything lives in the
//! `Swap` value itself, borrowed from the caller's own flash handles for
//! exactly as long as `startup` runs.

use storage::{Flash, PageState, ReadFlash};

use crate::fingerprint::{Bound, Fingerprints};
use crate::plan::{self, WorkItem, WorkList};
use crate::status::{Phase, StatusTrailer};
use crate::{Error, PageHasher, Sha256Truncated, PAGE_SIZE};

/// Where `performWork` should resume: which of the two work lists (0 =
/// Slide, 1 = Swap) and which step within it.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Resume {
    pub work_idx: usize,
    pub step_idx: usize,
}

/// Write the magic constant into slot 1's trailer, marking an upgrade as
/// requested. This is the only precondition `Swap::startup` needs to do
/// anything at all; without it, `startup` is a no-op.
pub fn request_upgrade<F: Flash>(slot1: &mut F) -> Result<(), Error> {
    let trailer = StatusTrailer::new(slot1.capacity());
    trailer.write_magic(slot1)
}

/// Ties slot 0 (primary) and slot 1 (secondary, and home of the status
/// trailer) together with the in-memory state a swap needs: the
/// fingerprint arrays, the current prefix, and a scratch page buffer.
pub struct Swap<'f, F0, F1>
where
    F0: Flash,
    F1: Flash,
{
    slot0: &'f mut F0,
    slot1: &'f mut F1,
    sizes: [usize; 2],
    prefix: [u8; 4],
    fingerprints: Fingerprints,
    trailer: StatusTrailer,
    tmp: [u8; PAGE_SIZE],
}

impl<'f, F0, F1> Swap<'f, F0, F1>
where
    F0: Flash,
    F1: Flash,
{
    /// Borrow both slot handles for the duration of a boot. `sizes` is the
    /// caller's best current knowledge of each slot's image size (derived
    /// from whatever image metadata the bootloader parses); on recovery,
    /// `startup` instead trusts the sizes already persisted in the
    /// trailer, which may differ if the caller's own parsing changed
    /// between boots.
    pub fn init(
        slot0: &'f mut F0,
        slot1: &'f mut F1,
        sizes: [usize; 2],
        prefix: [u8; 4],
    ) -> Swap<'f, F0, F1> {
        let trailer = StatusTrailer::new(slot1.capacity());
        let fingerprints = Fingerprints::new(prefix);
        Swap {
            slot0,
            slot1,
            sizes,
            prefix,
            fingerprints,
            trailer,
            tmp: [0u8; PAGE_SIZE],
        }
    }

    /// Run the swap to completion (or determine there is nothing to do),
    /// recovering from wherever an earlier, interrupted attempt left off.
    /// Returns once the trailer reads `Done` or once it is established
    /// that no upgrade was requested.
    pub fn startup(&mut self) -> Result<(), Error> {
        let mut phase = self.trailer.scan(self.slot1)?;
        let mut retries = 0u32;

        loop {
            log::debug!("swap startup: entering phase {phase:?}");
            match phase {
                Phase::Unknown | Phase::Done => return Ok(()),
                Phase::Request => {
                    self.fingerprints.set_prefix(self.prefix);
                    self.fingerprints
                        .compute(0, self.slot0, self.sizes[0], &mut self.tmp)?;
                    self.fingerprints
                        .compute(1, self.slot1, self.sizes[1], &mut self.tmp)?;
                    let bound0 = Bound::new(self.sizes[0]);
                    let bound1 = Bound::new(self.sizes[1]);
                    self.trailer.start_status(
                        self.slot1,
                        &self.fingerprints,
                        &bound0,
                        &bound1,
                        Phase::Slide,
                    )?;

                    match self.run_from(Resume { work_idx: 0, step_idx: 0 }, true) {
                        Ok(()) => return Ok(()),
                        Err(Error::HashCollision) => {
                            retries += 1;
                            log::warn!("hash collision running a fresh plan, retry {retries}/{}", crate::MAX_COLLISION_RETRIES);
                            if retries > crate::MAX_COLLISION_RETRIES {
                                return Err(Error::HashCollision);
                            }
                            self.prefix = bump_prefix(self.prefix);
                            self.trailer.write_magic(self.slot1)?;
                            phase = Phase::Request;
                        }
                        Err(e) => return Err(e),
                    }
                }
                Phase::Slide | Phase::Swap => {
                    let sizes = self.trailer.load_status(self.slot1, &mut self.fingerprints)?;
                    self.sizes = sizes;
                    self.prefix = self.fingerprints.prefix();

                    let resume = match self.recover(phase) {
                        Ok(resume) => resume,
                        Err(Error::HashCollision) => {
                            retries += 1;
                            log::warn!("hash collision rebuilding the recovery plan for {phase:?}, retry {retries}/{}", crate::MAX_COLLISION_RETRIES);
                            if retries > crate::MAX_COLLISION_RETRIES {
                                return Err(Error::HashCollision);
                            }
                            self.prefix = bump_prefix(self.prefix);
                            self.trailer.write_magic(self.slot1)?;
                            phase = Phase::Request;
                            continue;
                        }
                        Err(e) => return Err(e),
                    };
                    log::debug!("recovery resumes at work list {}, step {}", resume.work_idx, resume.step_idx);

                    match self.run_from(resume, false) {
                        Ok(()) => return Ok(()),
                        Err(Error::HashCollision) => {
                            retries += 1;
                            log::warn!("hash collision resuming {phase:?}, retry {retries}/{}", crate::MAX_COLLISION_RETRIES);
                            if retries > crate::MAX_COLLISION_RETRIES {
                                return Err(Error::HashCollision);
                            }
                            self.prefix = bump_prefix(self.prefix);
                            self.trailer.write_magic(self.slot1)?;
                            phase = Phase::Request;
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
        }
    }

    /// Rebuild both work lists (always deterministic from sizes and
    /// recorded fingerprints) and run from `resume.work_idx` /
    /// `resume.step_idx` onward, advancing the trailer's phase between
    /// lists and to `Done` once both are finished. Before the first step
    /// of either list executes, the trailer must already name that phase
    /// (enforced by callers: `Request` writes `Slide` before any step
    /// runs here, and this function writes `Swap` before entering the
    /// swap list).
    fn run_from(&mut self, resume: Resume, initial: bool) -> Result<(), Error> {
        let bound0 = Bound::new(self.sizes[0]);
        let bound1 = Bound::new(self.sizes[1]);
        let slide = plan::build_slide(self.slot0, self.slot1, &self.fingerprints, &bound0, initial)?;
        let swap = plan::build_swap(
            self.slot0,
            self.slot1,
            &self.fingerprints,
            &bound0,
            &bound1,
            initial,
        )?;
        let lists: [WorkList; 2] = [slide, swap];

        for work_idx in resume.work_idx..2 {
            let start_step = if work_idx == resume.work_idx {
                resume.step_idx
            } else {
                0
            };
            for item in lists[work_idx].iter().skip(start_step) {
                self.execute(item)?;
            }
            if work_idx == 0 {
                self.trailer.update_status(self.slot1, Phase::Swap)?;
            }
        }
        self.trailer.update_status(self.slot1, Phase::Done)?;
        Ok(())
    }

    fn execute(&mut self, item: &WorkItem) -> Result<(), Error> {
        log::debug!(
            "swap step: {}/{} -> {}/{} ({} bytes)",
            item.src_slot,
            item.src_page,
            item.dest_slot,
            item.dest_page,
            item.size
        );
        self.erase(item.dest_slot, item.dest_page)?;
        let got = self.read_and_hash(item.src_slot, item.src_page, item.size)?;
        if got != item.fingerprint {
            log::error!("fingerprint mismatch executing swap step, source page changed under us");
            return Err(Error::HashCollision);
        }
        self.write(item.dest_slot, item.dest_page, item.size)?;
        Ok(())
    }

    /// Determine where an interrupted list left off: the first step whose
    /// destination page is not yet written with the expected content,
    /// then back up one step if that step's source page is still intact
    /// (so it can be safely re-executed in case the destination write
    /// started but never finished).
    fn recover(&mut self, phase: Phase) -> Result<Resume, Error> {
        let work_idx = match phase {
            Phase::Slide => 0,
            Phase::Swap => 1,
            _ => unreachable!("recover is only called for Slide or Swap"),
        };
        let bound0 = Bound::new(self.sizes[0]);
        let bound1 = Bound::new(self.sizes[1]);
        let slide = plan::build_slide(self.slot0, self.slot1, &self.fingerprints, &bound0, false)?;
        let swap = plan::build_swap(
            self.slot0,
            self.slot1,
            &self.fingerprints,
            &bound0,
            &bound1,
            false,
        )?;
        let lists: [WorkList; 2] = [slide, swap];
        let list = &lists[work_idx];

        let mut i = 0;
        while i < list.len() {
            let item = &list[i];
            if self.state(item.dest_slot, item.dest_page)? != PageState::Written {
                break;
            }
            if self.read_and_hash(item.dest_slot, item.dest_page, item.size)? != item.fingerprint {
                break;
            }
            i += 1;
        }

        if i > 0 {
            let prev = &list[i - 1];
            let source_intact = self.state(prev.src_slot, prev.src_page)? == PageState::Written
                && self.read_and_hash(prev.src_slot, prev.src_page, prev.size)? == prev.fingerprint;
            if source_intact {
                log::debug!(
                    "recover {phase:?}: step {} looked done but its source page is still intact, backing up to re-run it",
                    i - 1
                );
                i -= 1;
            }
        }

        Ok(Resume {
            work_idx,
            step_idx: i,
        })
    }

    fn state(&mut self, slot: usize, page: usize) -> Result<PageState, Error> {
        let offset = page * PAGE_SIZE;
        Ok(match slot {
            0 => self.slot0.state(offset)?,
            1 => self.slot1.state(offset)?,
            _ => unreachable!("only two slots exist"),
        })
    }

    fn read_and_hash(
        &mut self,
        slot: usize,
        page: usize,
        size: usize,
    ) -> Result<crate::Fingerprint, Error> {
        self.read(slot, page, size)?;
        let mut hasher = Sha256Truncated::new(self.fingerprints.prefix());
        hasher.update(&self.tmp[..size]);
        Ok(hasher.finish())
    }

    fn erase(&mut self, slot: usize, page: usize) -> Result<(), Error> {
        let offset = page * PAGE_SIZE;
        match slot {
            0 => self.slot0.erase(offset, offset + PAGE_SIZE)?,
            1 => self.slot1.erase(offset, offset + PAGE_SIZE)?,
            _ => unreachable!("only two slots exist"),
        }
        Ok(())
    }

    fn read(&mut self, slot: usize, page: usize, size: usize) -> Result<(), Error> {
        let offset = page * PAGE_SIZE;
        match slot {
            0 => self.slot0.read(offset, &mut self.tmp[..size])?,
            1 => self.slot1.read(offset, &mut self.tmp[..size])?,
            _ => unreachable!("only two slots exist"),
        }
        Ok(())
    }

    /// Pages are written whole regardless of how much of the last page is
    /// real content: a driver's write alignment applies to the full page,
    /// not to an image's trailing partial length, so any padding beyond
    /// `size` is zeroed before the page goes out.
    fn write(&mut self, slot: usize, page: usize, size: usize) -> Result<(), Error> {
        let offset = page * PAGE_SIZE;
        self.tmp[size..].fill(0);
        match slot {
            0 => self.slot0.write(offset, &self.tmp)?,
            1 => self.slot1.write(offset, &self.tmp)?,
            _ => unreachable!("only two slots exist"),
        }
        Ok(())
    }
}

fn bump_prefix(prefix: [u8; 4]) -> [u8; 4] {
    u32::from_le_bytes(prefix).wrapping_add(1).to_le_bytes()
}
