//! The swap planner: deterministic, idempotent page-move lists.
//!
//! `build_slide` and `build_swap` are pure functions of sizes and recorded
//! fingerprints; called again with the same inputs they produce the same
//! work list, which is what lets recovery rebuild a list instead of
//! persisting one. The only place either function touches flash is the
//! non-initial (recovery) path, where a fingerprint collision must be
//! resolved by an actual byte comparison before the builder trusts a skip.

use storage::{Flash, ReadFlash};

use crate::fingerprint::{Bound, Fingerprint, Fingerprints};
use crate::{Error, MAX_PAGES, PAGE_SIZE};

/// One page-granular move: copy `size` bytes from `(src_slot, src_page)`
/// to `(dest_slot, dest_page)`. Executing it must leave the destination
/// page's first `size` bytes hashing, under the current prefix, to
/// `fingerprint`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct WorkItem {
    pub src_slot: usize,
    pub src_page: usize,
    pub dest_slot: usize,
    pub dest_page: usize,
    pub size: usize,
    pub fingerprint: Fingerprint,
}

pub type WorkList = heapless::Vec<WorkItem, MAX_PAGES>;

fn push(list: &mut WorkList, item: WorkItem) -> Result<(), Error> {
    list.push(item).map_err(|_| Error::Overflow)
}

fn read_page<F0, F1>(
    slot0: &mut F0,
    slot1: &mut F1,
    slot: usize,
    page: usize,
    buf: &mut [u8],
) -> Result<(), Error>
where
    F0: Flash,
    F1: Flash,
{
    let offset = page * PAGE_SIZE;
    match slot {
        0 => slot0.read(offset, buf)?,
        1 => slot1.read(offset, buf)?,
        _ => unreachable!("only two slots exist"),
    }
    Ok(())
}

/// Compare the first `size` bytes of two physical pages directly. Called
/// only when two recorded fingerprints are equal but the planner is on the
/// non-initial path and cannot take that equality on faith: a collision
/// under the current prefix would otherwise cause a step to be silently
/// skipped when it shouldn't be.
fn validate_same<F0, F1>(
    slot0: &mut F0,
    slot1: &mut F1,
    a: (usize, usize),
    b: (usize, usize),
    size: usize,
) -> Result<bool, Error>
where
    F0: Flash,
    F1: Flash,
{
    let mut buf_a = [0u8; PAGE_SIZE];
    let mut buf_b = [0u8; PAGE_SIZE];
    read_page(slot0, slot1, a.0, a.1, &mut buf_a[..size])?;
    read_page(slot0, slot1, b.0, b.1, &mut buf_b[..size])?;
    Ok(buf_a[..size] == buf_b[..size])
}

/// Resolve a fingerprint-equality skip candidate into a definite
/// skip/don't-skip decision. On the initial path (fresh fingerprints just
/// computed from current flash content) equal fingerprints are trusted
/// outright. On the non-initial path a byte comparison is required; if it
/// disagrees with the fingerprint match, that is an actual hash collision.
fn resolve_skip<F0, F1>(
    slot0: &mut F0,
    slot1: &mut F1,
    initial: bool,
    a: (usize, usize),
    b: (usize, usize),
    size: usize,
) -> Result<bool, Error>
where
    F0: Flash,
    F1: Flash,
{
    if initial {
        return Ok(true);
    }
    if validate_same(slot0, slot1, a, b, size)? {
        Ok(true)
    } else {
        Err(Error::HashCollision)
    }
}

/// Slide slot 0 down by one page, freeing its first page so the Swap
/// phase has somewhere to land slot 1's first page.
pub fn build_slide<F0, F1>(
    slot0: &mut F0,
    slot1: &mut F1,
    hashes: &Fingerprints,
    bound0: &Bound,
    initial: bool,
) -> Result<WorkList, Error>
where
    F0: Flash,
    F1: Flash,
{
    if bound0.count > MAX_PAGES {
        return Err(Error::Overflow);
    }
    let mut list = WorkList::new();
    let mut p = bound0.count;
    while p >= 1 {
        let size = bound0.get_size(p - 1);
        let src_fp = hashes.get(0, p - 1);

        let skip = p < bound0.count
            && src_fp == hashes.get(0, p)
            && resolve_skip(slot0, slot1, initial, (0, p - 1), (0, p), size)?;

        if !skip {
            push(
                &mut list,
                WorkItem {
                    src_slot: 0,
                    src_page: p - 1,
                    dest_slot: 0,
                    dest_page: p,
                    size,
                    fingerprint: src_fp,
                },
            )?;
        }
        p -= 1;
    }
    Ok(list)
}

/// Swap the two slots' remaining content: slot 1's pages move into slot 0,
/// and slot 0's (already-slid) pages move into slot 1.
pub fn build_swap<F0, F1>(
    slot0: &mut F0,
    slot1: &mut F1,
    hashes: &Fingerprints,
    bound0: &Bound,
    bound1: &Bound,
    initial: bool,
) -> Result<WorkList, Error>
where
    F0: Flash,
    F1: Flash,
{
    if bound0.count > MAX_PAGES || bound1.count > MAX_PAGES {
        return Err(Error::Overflow);
    }
    let mut list = WorkList::new();
    let mut p = 0;
    while p < bound0.count.max(bound1.count) {
        if p < bound1.count {
            let src_fp = hashes.get(1, p);
            let skip = p < bound0.count
                && src_fp == hashes.get(0, p)
                && resolve_skip(slot0, slot1, initial, (1, p), (0, p), bound1.get_size(p))?;
            if !skip {
                push(
                    &mut list,
                    WorkItem {
                        src_slot: 1,
                        src_page: p,
                        dest_slot: 0,
                        dest_page: p,
                        size: bound1.get_size(p),
                        fingerprint: src_fp,
                    },
                )?;
            }
        }
        if p < bound0.count {
            let src_fp = hashes.get(0, p);
            let check_fp = hashes.get(0, p + 1);
            let skip = p < bound1.count
                && check_fp == hashes.get(1, p)
                && resolve_skip(slot0, slot1, initial, (0, p + 1), (1, p), bound0.get_size(p))?;
            if !skip {
                push(
                    &mut list,
                    WorkItem {
                        src_slot: 0,
                        src_page: p + 1,
                        dest_slot: 1,
                        dest_page: p,
                        size: bound0.get_size(p),
                        fingerprint: src_fp,
                    },
                )?;
            }
        }
        p += 1;
    }
    Ok(list)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PAGE_SIZE;

    struct NullFlash;

    impl storage::ReadFlash for NullFlash {
        fn read_size(&self) -> usize {
            1
        }
        fn read(&mut self, _offset: usize, _bytes: &mut [u8]) -> storage::Result<()> {
            unreachable!("initial planning never reads flash")
        }
        fn capacity(&self) -> usize {
            usize::MAX
        }
    }

    impl storage::Flash for NullFlash {
        fn write_size(&self) -> usize {
            1
        }
        fn erase_size(&self) -> usize {
            1
        }
        fn erase(&mut self, _from: usize, _to: usize) -> storage::Result<()> {
            unreachable!()
        }
        fn write(&mut self, _offset: usize, _bytes: &[u8]) -> storage::Result<()> {
            unreachable!()
        }
        fn state(&self, _offset: usize) -> storage::Result<storage::PageState> {
            unreachable!()
        }
    }

    #[test]
    fn slide_moves_every_page_up_by_one() {
        let mut fingerprints = Fingerprints::new([0; 4]);
        fingerprints.set(0, 0, Fingerprint([1, 0, 0, 0]));
        fingerprints.set(0, 1, Fingerprint([2, 0, 0, 0]));
        fingerprints.set(0, 2, Fingerprint([3, 0, 0, 0]));
        let bound0 = Bound::new(2 * PAGE_SIZE + 7);

        let mut slot0 = NullFlash;
        let mut slot1 = NullFlash;
        let list = build_slide(&mut slot0, &mut slot1, &fingerprints, &bound0, true).unwrap();

        assert_eq!(list.len(), 3);
        assert_eq!(list[0].src_page, 2);
        assert_eq!(list[0].dest_page, 3);
        assert_eq!(list[0].size, 7);
        assert_eq!(list[2].src_page, 0);
        assert_eq!(list[2].dest_page, 1);
        assert_eq!(list[2].size, PAGE_SIZE);
    }

    #[test]
    fn swap_builds_reciprocal_moves() {
        let mut fingerprints = Fingerprints::new([0; 4]);
        fingerprints.set(0, 0, Fingerprint([1, 0, 0, 0]));
        fingerprints.set(0, 1, Fingerprint([2, 0, 0, 0]));
        fingerprints.set(1, 0, Fingerprint([9, 0, 0, 0]));
        let bound0 = Bound::new(PAGE_SIZE + 1);
        let bound1 = Bound::new(1);

        let mut slot0 = NullFlash;
        let mut slot1 = NullFlash;
        let list =
            build_swap(&mut slot0, &mut slot1, &fingerprints, &bound0, &bound1, true).unwrap();

        assert_eq!(list.len(), 2);
        assert_eq!(list[0].src_slot, 1);
        assert_eq!(list[0].dest_slot, 0);
        assert_eq!(list[1].src_slot, 0);
        assert_eq!(list[1].src_page, 1);
        assert_eq!(list[1].dest_slot, 1);
        assert_eq!(list[1].dest_page, 0);
    }

    /// S4 -- when two slot-0 pages already carry the same fingerprint, the
    /// slide step that would have moved one onto the other is pointless
    /// and the planner leaves it out of the list.
    #[test]
    fn slide_skips_pages_already_identical() {
        let mut fingerprints = Fingerprints::new([0; 4]);
        fingerprints.set(0, 0, Fingerprint([1, 0, 0, 0]));
        fingerprints.set(0, 1, Fingerprint([9, 9, 9, 9]));
        fingerprints.set(0, 2, Fingerprint([9, 9, 9, 9]));
        let bound0 = Bound::new(3 * PAGE_SIZE);

        let mut slot0 = NullFlash;
        let mut slot1 = NullFlash;
        let list = build_slide(&mut slot0, &mut slot1, &fingerprints, &bound0, true).unwrap();

        assert_eq!(list.len(), 2);
        assert!(!list.iter().any(|item| item.src_page == 1 && item.dest_page == 2));
    }

    /// Slot 0 at exactly `MAX_PAGES` pages makes the swap builder's skip
    /// check look one page past the fingerprint array's last real index --
    /// still in bounds as far as the image is concerned, since `MAX_PAGES`
    /// itself is a legitimate page count, but out of bounds for the backing
    /// array. This must come back as "never matches", not a panic.
    #[test]
    fn swap_handles_a_slot_exactly_at_max_pages() {
        let fingerprints = Fingerprints::new([0; 4]);
        let bound0 = Bound::new(MAX_PAGES * PAGE_SIZE);
        let bound1 = Bound::new(PAGE_SIZE);
        let mut slot0 = NullFlash;
        let mut slot1 = NullFlash;
        let list =
            build_swap(&mut slot0, &mut slot1, &fingerprints, &bound0, &bound1, true).unwrap();
        assert_eq!(list.len(), 255);
    }

    #[test]
    fn work_list_overflow_is_fatal() {
        let fingerprints = Fingerprints::new([0; 4]);
        let bound0 = Bound::new((MAX_PAGES + 1) * PAGE_SIZE);
        let mut slot0 = NullFlash;
        let mut slot1 = NullFlash;
        let err = build_slide(&mut slot0, &mut slot1, &fingerprints, &bound0, true).unwrap_err();
        assert_eq!(err, Error::Overflow);
    }
}
