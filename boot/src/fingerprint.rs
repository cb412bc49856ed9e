//! Per-page content fingerprints and the size bookkeeping built from them.

use storage::{Flash, ReadFlash};

use crate::hash::{PageHasher, Sha256Truncated};
use crate::{Error, MAX_PAGES, PAGE_SIZE};

/// A 4-byte keyed hash of one page's content.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub struct Fingerprint(pub [u8; 4]);

/// The page geometry implied by a single slot's image size: how many pages
/// it spans, and the length of its last, possibly partial, page.
#[derive(Debug, Copy, Clone)]
pub struct Bound {
    pub size: usize,
    pub count: usize,
    pub partial: usize,
}

impl Bound {
    pub fn new(size: usize) -> Bound {
        assert!(size > 0, "an image must have a nonzero size");
        let count = (size + PAGE_SIZE - 1) / PAGE_SIZE;
        let partial = ((size - 1) % PAGE_SIZE) + 1;
        Bound {
            size,
            count,
            partial,
        }
    }

    /// The byte length of page `page`: `PAGE_SIZE` for every page but the
    /// last, which may be partial.
    pub fn get_size(&self, page: usize) -> usize {
        if page + 1 == self.count {
            self.partial
        } else {
            PAGE_SIZE
        }
    }
}

/// The per-slot fingerprint arrays and the prefix that keyed them.
///
/// Storage is bounded and zero-initialized: unused trailing entries, past
/// each slot's own page count, read back as the default all-zero
/// fingerprint through [`Fingerprints::get`]. That is load-bearing for
/// [`crate::plan`]'s swap builder, which probes one page beyond slot 0's
/// last valid index as part of its skip check -- including the case where
/// slot 0 is exactly `MAX_PAGES` pages long and the probe lands one past
/// the array itself, which `get` also treats as "never matches" rather
/// than indexing out of bounds.
pub struct Fingerprints {
    hashes: [[Fingerprint; MAX_PAGES]; 2],
    prefix: [u8; 4],
}

impl Fingerprints {
    pub fn new(prefix: [u8; 4]) -> Fingerprints {
        Fingerprints {
            hashes: [[Fingerprint::default(); MAX_PAGES]; 2],
            prefix,
        }
    }

    pub fn prefix(&self) -> [u8; 4] {
        self.prefix
    }

    pub fn set_prefix(&mut self, prefix: [u8; 4]) {
        self.prefix = prefix;
    }

    /// Reads past a slot's real page count (including past `MAX_PAGES`
    /// itself, which the swap builder's one-page lookahead can reach when a
    /// slot is exactly full) come back as the default, "never matches"
    /// fingerprint rather than panicking.
    pub fn get(&self, slot: usize, page: usize) -> Fingerprint {
        self.hashes[slot].get(page).copied().unwrap_or_default()
    }

    pub fn set(&mut self, slot: usize, page: usize, fp: Fingerprint) {
        self.hashes[slot][page] = fp;
    }

    /// Read slot `slot`'s `size` bytes page by page from `flash`, feeding
    /// each page's content into a hasher keyed by the current prefix, and
    /// store the resulting fingerprints.
    pub fn compute<F: Flash>(
        &mut self,
        slot: usize,
        flash: &mut F,
        size: usize,
        tmp: &mut [u8; PAGE_SIZE],
    ) -> Result<(), Error> {
        let bound = Bound::new(size);
        if bound.count > MAX_PAGES {
            return Err(Error::Overflow);
        }
        for page in 0..bound.count {
            let count = bound.get_size(page);
            flash.read(page * PAGE_SIZE, &mut tmp[..count])?;
            let mut hasher = Sha256Truncated::new(self.prefix);
            hasher.update(&tmp[..count]);
            self.hashes[slot][page] = hasher.finish();
        }
        Ok(())
    }
}

/// Map a linear index over the concatenated fingerprint stream (slot 0's
/// pages followed by slot 1's) to the `(slot, page)` it names. This
/// ordering is the canonical one used both inline in the trailer's last
/// page and in its spill hash pages.
pub fn linear_get(fingerprints: &Fingerprints, bound0: &Bound, idx: usize) -> Fingerprint {
    if idx < bound0.count {
        fingerprints.get(0, idx)
    } else {
        fingerprints.get(1, idx - bound0.count)
    }
}

pub fn linear_set(fingerprints: &mut Fingerprints, bound0: &Bound, idx: usize, fp: Fingerprint) {
    if idx < bound0.count {
        fingerprints.set(0, idx, fp);
    } else {
        fingerprints.set(1, idx - bound0.count, fp);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bound_exact_multiple() {
        let b = Bound::new(1024);
        assert_eq!(b.count, 2);
        assert_eq!(b.partial, PAGE_SIZE);
        assert_eq!(b.get_size(0), PAGE_SIZE);
        assert_eq!(b.get_size(1), PAGE_SIZE);
    }

    #[test]
    fn bound_partial_last_page() {
        let b = Bound::new(2 * PAGE_SIZE + 7);
        assert_eq!(b.count, 3);
        assert_eq!(b.partial, 7);
        assert_eq!(b.get_size(0), PAGE_SIZE);
        assert_eq!(b.get_size(1), PAGE_SIZE);
        assert_eq!(b.get_size(2), 7);
    }

    #[test]
    fn unused_slots_read_as_default() {
        let fingerprints = Fingerprints::new([0; 4]);
        assert_eq!(fingerprints.get(0, MAX_PAGES - 1), Fingerprint::default());
    }
}
