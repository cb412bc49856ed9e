//! The persistent status trailer.
//!
//! The trailer lives in the tail of slot 1 and records enough state to
//! resume an interrupted swap: which phase it reached, the two slots'
//! image sizes, the prefix fingerprints were keyed with, and the
//! fingerprints themselves. It occupies the last two pages of slot 1 (the
//! "ult" and "penult" pages) in an A/B arrangement plus, when the combined
//! page count of both images exceeds what fits inline, a run of spill hash
//! pages immediately below them.
//!
//! A/B: exactly one of the two trailer pages holds a valid, magic-tagged
//! record at any time outside the narrow window between writing a new one
//! and erasing the old one. `update_status` always writes the new record
//! before erasing the old, so a reset mid-update leaves one readable
//! record behind -- worst case, the one from before the update.

use asraw::{AsMutRaw, AsRaw};
use storage::{Flash, PageState, ReadFlash};

use crate::fingerprint::{linear_get, linear_set, Bound, Fingerprint, Fingerprints};
use crate::{hash, Error, HASHES_PER_HASH_PAGE, HASHES_PER_LAST_PAGE, PAGE_SIZE};

/// 2-byte alignment word (0x0200, little-endian) followed by a 14-byte
/// magic constant. Written only to the last page's final 16 bytes; its
/// presence is the sole signal that a swap has been requested.
const MAGIC: [u8; 16] = [
    0x00, 0x02, 0x3e, 0x04, 0xec, 0x53, 0xa0, 0x40, 0x45, 0x39, 0x4a, 0x6e, 0x00, 0xd5, 0xa2, 0xb3,
];

/// How far the status machine has progressed.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u8)]
pub enum Phase {
    /// No upgrade requested; the slots are in their resting state.
    Unknown = 0,
    /// `request_upgrade` has written the magic but nothing else yet.
    Request = 1,
    /// Slot 0 is being slid down by one page.
    Slide = 2,
    /// Slot 0 and slot 1's remaining content is being exchanged.
    Swap = 3,
    /// The swap has completed.
    Done = 4,
}

impl Phase {
    fn from_u8(v: u8) -> Option<Phase> {
        match v {
            0 => Some(Phase::Unknown),
            1 => Some(Phase::Request),
            2 => Some(Phase::Slide),
            3 => Some(Phase::Swap),
            4 => Some(Phase::Done),
            _ => None,
        }
    }
}

/// The trailer's last page: fixed at exactly `PAGE_SIZE` (512) bytes.
/// Field order is chosen so every multi-byte field lands on its natural
/// alignment boundary, keeping `#[repr(C)]` free of inserted padding
/// without resorting to `packed`.
#[derive(Debug, Default)]
#[repr(C)]
struct LastPage {
    hashes: [[u8; 4]; HASHES_PER_LAST_PAGE],
    sizes: [u32; 2],
    /// Reserved for encryption keys; encryption is out of scope here, so
    /// this is always zero.
    keys: [[u8; 16]; 2],
    prefix: [u8; 4],
    seq: u32,
    phase: u8,
    swap_info: u8,
    copy_done: u8,
    image_ok: u8,
    hash: [u8; 4],
    magic: [u8; 16],
}

impl AsRaw for LastPage {}
unsafe impl AsMutRaw for LastPage {}

const LAST_PAGE_HASHED_LEN: usize = 492;

/// A spill hash page: fingerprints that did not fit inline in
/// [`LastPage`], each page holding `HASHES_PER_HASH_PAGE` of them plus its
/// own integrity tag.
#[derive(Debug, Default)]
#[repr(C)]
struct HashPage {
    hashes: [[u8; 4]; HASHES_PER_HASH_PAGE],
    hash: [u8; 4],
}

impl AsRaw for HashPage {}
unsafe impl AsMutRaw for HashPage {}

const HASH_PAGE_HASHED_LEN: usize = HASHES_PER_HASH_PAGE * 4;

struct Layout {
    ult: usize,
    penult: usize,
}

impl Layout {
    fn new(capacity: usize) -> Layout {
        Layout {
            ult: capacity - PAGE_SIZE,
            penult: capacity - 2 * PAGE_SIZE,
        }
    }

    /// Spill page `index` (0 nearest `penult`) sits at decreasing
    /// addresses below it.
    fn spill_page(&self, index: usize) -> usize {
        self.penult - (index + 1) * PAGE_SIZE
    }
}

enum Candidate {
    /// Magic present but the integrity hash does not match: a torn write,
    /// or one caught mid `start_status`/`update_status`.
    MagicOnly,
    Valid { phase: Phase, seq: u32 },
}

/// Reads, writes, and recovers the status trailer at the tail of a single
/// flash region (slot 1).
pub struct StatusTrailer {
    layout: Layout,
}

impl StatusTrailer {
    pub fn new(slot1_capacity: usize) -> StatusTrailer {
        StatusTrailer {
            layout: Layout::new(slot1_capacity),
        }
    }

    fn read_last_page<F: Flash>(&self, flash: &mut F, offset: usize) -> Result<LastPage, Error> {
        let mut buf = [0u8; PAGE_SIZE];
        flash.read(offset, &mut buf)?;
        let mut page = LastPage::default();
        page.as_mut_raw().copy_from_slice(&buf);
        Ok(page)
    }

    fn read_candidate<F: Flash>(
        &self,
        flash: &mut F,
        offset: usize,
    ) -> Result<Option<Candidate>, Error> {
        if flash.state(offset)? != PageState::Written {
            return Ok(None);
        }
        let page = self.read_last_page(flash, offset)?;
        if page.magic != MAGIC {
            return Ok(None);
        }
        let digest = hash::calc(&page.as_raw()[..LAST_PAGE_HASHED_LEN]);
        if digest.0 != page.hash {
            log::warn!("trailer candidate at {offset} failed its integrity check, treating as a torn write");
            return Ok(Some(Candidate::MagicOnly));
        }
        let phase = Phase::from_u8(page.phase).ok_or_else(|| {
            log::error!("trailer candidate at {offset} names phase byte {} out of range", page.phase);
            Error::StateError
        })?;
        Ok(Some(Candidate::Valid {
            phase,
            seq: page.seq,
        }))
    }

    /// Write a page containing only the magic constant to the ult
    /// position, leaving the rest of the trailer erased. This is the
    /// precondition `Swap::startup` looks for to begin a Request phase.
    pub fn write_magic<F: Flash>(&self, flash: &mut F) -> Result<(), Error> {
        flash.erase(self.layout.penult, self.layout.penult + 2 * PAGE_SIZE)?;
        let mut page = LastPage::default();
        page.magic = MAGIC;
        flash.write(self.layout.ult, page.as_raw())?;
        Ok(())
    }

    /// Determine the swap's current phase by reading both trailer pages.
    /// Neither valid: `Unknown`. One valid: its phase. Both valid: the
    /// lower sequence number's phase (the higher one is the record an
    /// interrupted `update_status` was in the middle of writing). Magic
    /// present with no valid integrity hash on either side: `Request`.
    pub fn scan<F: Flash>(&self, flash: &mut F) -> Result<Phase, Error> {
        let ult = self.read_candidate(flash, self.layout.ult)?;
        let penult = self.read_candidate(flash, self.layout.penult)?;

        use Candidate::*;
        Ok(match (ult, penult) {
            (None, None) => Phase::Unknown,
            (Some(MagicOnly), None)
            | (None, Some(MagicOnly))
            | (Some(MagicOnly), Some(MagicOnly)) => Phase::Request,
            (Some(Valid { phase, .. }), None) => phase,
            (None, Some(Valid { phase, .. })) => phase,
            (Some(Valid { phase, .. }), Some(MagicOnly)) => phase,
            (Some(MagicOnly), Some(Valid { phase, .. })) => phase,
            (Some(Valid { phase: pa, seq: sa }), Some(Valid { phase: pb, seq: sb })) => {
                if sa <= sb {
                    pa
                } else {
                    pb
                }
            }
        })
    }

    /// Materialize a fresh trailer: spill hash pages first (each durable
    /// before the next is started), then the last page with the first
    /// `HASHES_PER_LAST_PAGE` fingerprints, sizes, prefix, and `phase`.
    /// Leaves `penult` erased and the new record at `ult`, seq 1.
    pub fn start_status<F: Flash>(
        &self,
        flash: &mut F,
        fingerprints: &Fingerprints,
        bound0: &Bound,
        bound1: &Bound,
        phase: Phase,
    ) -> Result<(), Error> {
        let total = bound0.count + bound1.count;
        let extra = total.saturating_sub(HASHES_PER_LAST_PAGE);
        let spill_pages = div_ceil(extra, HASHES_PER_HASH_PAGE);

        for i in 0..spill_pages {
            let base = HASHES_PER_LAST_PAGE + i * HASHES_PER_HASH_PAGE;
            let count = (total - base).min(HASHES_PER_HASH_PAGE);
            let mut page = HashPage::default();
            for j in 0..count {
                page.hashes[j] = linear_get(fingerprints, bound0, base + j).0;
            }
            let digest = hash::calc(&page.as_raw()[..HASH_PAGE_HASHED_LEN]);
            page.hash = digest.0;

            let offset = self.layout.spill_page(i);
            flash.erase(offset, offset + PAGE_SIZE)?;
            flash.write(offset, page.as_raw())?;
        }

        log::debug!("status trailer: starting phase {phase:?}, seq 1, {total} fingerprints ({spill_pages} spill pages)");
        let mut last = LastPage::default();
        for j in 0..HASHES_PER_LAST_PAGE.min(total) {
            last.hashes[j] = linear_get(fingerprints, bound0, j).0;
        }
        last.sizes = [bound0.size as u32, bound1.size as u32];
        last.prefix = fingerprints.prefix();
        last.seq = 1;
        last.phase = phase as u8;
        let digest = hash::calc(&last.as_raw()[..LAST_PAGE_HASHED_LEN]);
        last.hash = digest.0;
        last.magic = MAGIC;

        flash.erase(self.layout.penult, self.layout.penult + 2 * PAGE_SIZE)?;
        flash.write(self.layout.ult, last.as_raw())?;
        Ok(())
    }

    /// Advance to `new_phase`: write a bumped-sequence record into
    /// whichever trailer page currently holds the valid one's counterpart
    /// (i.e. the erased one), then erase the page that held the previous
    /// record. Fails with `StateError` if neither page holds a valid
    /// record to advance from.
    pub fn update_status<F: Flash>(&self, flash: &mut F, new_phase: Phase) -> Result<(), Error> {
        let ult = self.read_candidate(flash, self.layout.ult)?;
        let penult = self.read_candidate(flash, self.layout.penult)?;

        let (old_offset, new_offset, seq) = match (ult, penult) {
            (Some(Candidate::Valid { seq, .. }), _) => (self.layout.ult, self.layout.penult, seq),
            (_, Some(Candidate::Valid { seq, .. })) => (self.layout.penult, self.layout.ult, seq),
            _ => {
                log::error!("update_status to {new_phase:?} called with no valid trailer record present");
                return Err(Error::StateError);
            }
        };

        log::debug!("status trailer: phase {new_phase:?}, seq {}", seq.wrapping_add(1));
        let mut last = self.read_last_page(flash, old_offset)?;
        last.seq = seq.wrapping_add(1);
        last.phase = new_phase as u8;
        let digest = hash::calc(&last.as_raw()[..LAST_PAGE_HASHED_LEN]);
        last.hash = digest.0;

        flash.write(new_offset, last.as_raw())?;
        flash.erase(old_offset, old_offset + PAGE_SIZE)?;
        Ok(())
    }

    /// Inverse of `start_status`: restores sizes and prefix from whichever
    /// trailer page currently holds the freshest valid record, then fills
    /// `fingerprints` from the last page and any spill hash pages,
    /// checking each spill page's own integrity tag along the way.
    pub fn load_status<F: Flash>(
        &self,
        flash: &mut F,
        fingerprints: &mut Fingerprints,
    ) -> Result<[usize; 2], Error> {
        let ult = self.read_candidate(flash, self.layout.ult)?;
        let penult = self.read_candidate(flash, self.layout.penult)?;

        let offset = match (ult, penult) {
            (Some(Candidate::Valid { seq: sa, .. }), Some(Candidate::Valid { seq: sb, .. })) => {
                if sa <= sb {
                    self.layout.ult
                } else {
                    self.layout.penult
                }
            }
            (Some(Candidate::Valid { .. }), _) => self.layout.ult,
            (_, Some(Candidate::Valid { .. })) => self.layout.penult,
            _ => {
                log::error!("load_status found no valid trailer record on either page");
                return Err(Error::CorruptTrailer);
            }
        };

        let last = self.read_last_page(flash, offset)?;
        let sizes = [last.sizes[0] as usize, last.sizes[1] as usize];
        fingerprints.set_prefix(last.prefix);

        let bound0 = Bound::new(sizes[0]);
        let total = bound0.count + Bound::new(sizes[1]).count;

        for j in 0..HASHES_PER_LAST_PAGE.min(total) {
            linear_set(fingerprints, &bound0, j, Fingerprint(last.hashes[j]));
        }

        let extra = total.saturating_sub(HASHES_PER_LAST_PAGE);
        let spill_pages = div_ceil(extra, HASHES_PER_HASH_PAGE);
        for i in 0..spill_pages {
            let base = HASHES_PER_LAST_PAGE + i * HASHES_PER_HASH_PAGE;
            let count = (total - base).min(HASHES_PER_HASH_PAGE);
            let spill_offset = self.layout.spill_page(i);

            let mut buf = [0u8; PAGE_SIZE];
            flash.read(spill_offset, &mut buf)?;
            let mut page = HashPage::default();
            page.as_mut_raw().copy_from_slice(&buf);

            let digest = hash::calc(&page.as_raw()[..HASH_PAGE_HASHED_LEN]);
            if digest.0 != page.hash {
                log::error!("spill hash page at {spill_offset} failed its integrity check");
                return Err(Error::CorruptTrailer);
            }
            for j in 0..count {
                linear_set(fingerprints, &bound0, base + j, Fingerprint(page.hashes[j]));
            }
        }

        Ok(sizes)
    }
}

fn div_ceil(a: usize, b: usize) -> usize {
    (a + b - 1) / b
}

const _: () = assert!(core::mem::size_of::<LastPage>() == PAGE_SIZE);
const _: () = assert!(core::mem::size_of::<HashPage>() == PAGE_SIZE);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_page_and_hash_page_are_exactly_one_page() {
        assert_eq!(core::mem::size_of::<LastPage>(), PAGE_SIZE);
        assert_eq!(core::mem::size_of::<HashPage>(), PAGE_SIZE);
    }

    #[test]
    fn phase_round_trips_through_u8() {
        for phase in [
            Phase::Unknown,
            Phase::Request,
            Phase::Slide,
            Phase::Swap,
            Phase::Done,
        ] {
            assert_eq!(Phase::from_u8(phase as u8), Some(phase));
        }
        assert_eq!(Phase::from_u8(5), None);
    }

    #[test]
    fn corrupted_fingerprint_forces_request() {
        let mut flash = simflash::SimFlash::new(PAGE_SIZE, PAGE_SIZE, 4);
        let trailer = StatusTrailer::new(flash.capacity());
        let mut fingerprints = Fingerprints::new([0; 4]);
        fingerprints.set(0, 0, Fingerprint([1, 2, 3, 4]));
        let bound0 = Bound::new(PAGE_SIZE);
        let bound1 = Bound::new(PAGE_SIZE);
        trailer
            .start_status(&mut flash, &fingerprints, &bound0, &bound1, Phase::Slide)
            .unwrap();
        assert_eq!(trailer.scan(&mut flash).unwrap(), Phase::Slide);

        let mut page = trailer.read_last_page(&mut flash, trailer.layout.ult).unwrap();
        page.hashes[0][0] ^= 0xff;
        let offset = trailer.layout.ult;
        flash.erase(offset, offset + PAGE_SIZE).unwrap();
        flash.write(offset, page.as_raw()).unwrap();

        assert_eq!(trailer.scan(&mut flash).unwrap(), Phase::Request);
    }

    #[test]
    fn lower_sequence_number_wins_on_tie_break() {
        let mut flash = simflash::SimFlash::new(PAGE_SIZE, PAGE_SIZE, 4);
        let trailer = StatusTrailer::new(flash.capacity());

        let mut low = LastPage::default();
        low.seq = 5;
        low.phase = Phase::Slide as u8;
        low.magic = MAGIC;
        low.hash = hash::calc(&low.as_raw()[..LAST_PAGE_HASHED_LEN]).0;

        let mut high = LastPage::default();
        high.seq = 6;
        high.phase = Phase::Swap as u8;
        high.magic = MAGIC;
        high.hash = hash::calc(&high.as_raw()[..LAST_PAGE_HASHED_LEN]).0;

        flash.write(trailer.layout.ult, low.as_raw()).unwrap();
        flash.write(trailer.layout.penult, high.as_raw()).unwrap();

        assert_eq!(trailer.scan(&mut flash).unwrap(), Phase::Slide);
    }
}
