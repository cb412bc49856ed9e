//! End-to-end swap scenarios against `simflash`, standing in for what used
//! to be exercised through full signed images: content is addressed by
//! fingerprint here too, so plain pseudo-random pages serve just as well.

use boot::{request_upgrade, Bound, ReadFlash, Swap, HASHES_PER_HASH_PAGE, HASHES_PER_LAST_PAGE, PAGE_SIZE};
use simflash::{GenBuilder, SimFlash};

/// Page slots needed below slot 1's trailer for `total` fingerprints.
fn spill_pages(total: usize) -> usize {
    let extra = total.saturating_sub(HASHES_PER_LAST_PAGE);
    (extra + HASHES_PER_HASH_PAGE - 1) / HASHES_PER_HASH_PAGE
}

struct Fixture {
    flash0: SimFlash,
    flash1: SimFlash,
    image_a: Vec<u8>,
    image_b: Vec<u8>,
}

/// Install image A (seed 1) into slot 0 and image B (seed 2) into slot 1,
/// sized so both the image area and the trailer (including any spill hash
/// pages) fit comfortably within each region.
fn install(size_a: usize, size_b: usize) -> Fixture {
    let bound0 = Bound::new(size_a);
    let bound1 = Bound::new(size_b);

    let sectors0 = (bound0.count + 1).max(bound1.count) + 2;
    let sectors1 = bound0.count.max(bound1.count) + 2 + spill_pages(bound0.count + bound1.count) + 2;

    let mut flash0 = SimFlash::new(PAGE_SIZE, PAGE_SIZE, sectors0);
    let mut flash1 = SimFlash::new(PAGE_SIZE, PAGE_SIZE, sectors1);

    let image_a = GenBuilder::default().seed(1).size(size_a).build().data;
    let image_b = GenBuilder::default().seed(2).size(size_b).build().data;

    flash0.install(&image_a, 0).unwrap();
    flash1.install(&image_b, 0).unwrap();
    flash0.reset_steps();
    flash1.reset_steps();

    Fixture {
        flash0,
        flash1,
        image_a,
        image_b,
    }
}

fn verify_images(fx: &mut Fixture, expect_a: &[u8], expect_b: &[u8]) {
    let mut out = vec![0u8; expect_b.len()];
    fx.flash0.read(0, &mut out).unwrap();
    assert_eq!(out, expect_b, "slot 0 should hold the new image");

    let mut out = vec![0u8; expect_a.len()];
    fx.flash1.read(0, &mut out).unwrap();
    assert_eq!(out, expect_a, "slot 1 should hold the old image");
}

/// S1 -- a small, page-misaligned pair of images swaps cleanly.
#[test]
fn small_images_swap_cleanly() {
    let size_a = 2 * PAGE_SIZE + 7;
    let size_b = PAGE_SIZE + 511;
    let mut fx = install(size_a, size_b);

    request_upgrade(&mut fx.flash1).unwrap();
    let mut swap = Swap::init(&mut fx.flash0, &mut fx.flash1, [size_a, size_b], [0; 4]);
    swap.startup().unwrap();

    let (image_a, image_b) = (fx.image_a.clone(), fx.image_b.clone());
    verify_images(&mut fx, &image_a, &image_b);
}

/// S2 -- large enough that the fingerprint list spills past the trailer's
/// last page into spill hash pages.
#[test]
fn large_images_exercise_spill_pages() {
    let size_a = 112 * PAGE_SIZE + 7;
    let size_b = 105 * PAGE_SIZE + 511;
    let mut fx = install(size_a, size_b);

    request_upgrade(&mut fx.flash1).unwrap();
    let mut swap = Swap::init(&mut fx.flash0, &mut fx.flash1, [size_a, size_b], [0; 4]);
    swap.startup().unwrap();

    let (image_a, image_b) = (fx.image_a.clone(), fx.image_b.clone());
    verify_images(&mut fx, &image_a, &image_b);
}

/// S3 -- recovery totality. Interrupt the swap after every possible
/// destructive operation count and confirm a second `startup()` call always
/// finishes the job.
#[test]
fn interrupted_swap_always_recovers() {
    let size_a = 2 * PAGE_SIZE + 7;
    let size_b = PAGE_SIZE + 511;

    let total_steps = {
        let mut fx = install(size_a, size_b);
        request_upgrade(&mut fx.flash1).unwrap();
        let mut swap = Swap::init(&mut fx.flash0, &mut fx.flash1, [size_a, size_b], [0; 4]);
        swap.startup().unwrap();
        fx.flash0.steps() + fx.flash1.steps()
    };

    for k in 1..=total_steps {
        let mut fx = install(size_a, size_b);
        request_upgrade(&mut fx.flash1).unwrap();
        fx.flash0.set_limit(k);
        fx.flash1.set_limit(k);

        let first = {
            let mut swap = Swap::init(&mut fx.flash0, &mut fx.flash1, [size_a, size_b], [0; 4]);
            swap.startup()
        };

        if first.is_err() {
            fx.flash0.clear_limit();
            fx.flash1.clear_limit();
            let mut swap = Swap::init(&mut fx.flash0, &mut fx.flash1, [size_a, size_b], [0; 4]);
            swap.startup()
                .unwrap_or_else(|e| panic!("recovery failed after interruption at step {k}: {e:?}"));
        }

        let (image_a, image_b) = (fx.image_a.clone(), fx.image_b.clone());
        verify_images(&mut fx, &image_a, &image_b);
    }
}

/// Running `startup()` again once a swap has already completed (trailer at
/// `Done`) is a no-op: the trailer only ever records one upgrade at a time.
#[test]
fn startup_without_request_is_a_no_op() {
    let size_a = PAGE_SIZE;
    let size_b = PAGE_SIZE;
    let mut fx = install(size_a, size_b);

    let mut swap = Swap::init(&mut fx.flash0, &mut fx.flash1, [size_a, size_b], [0; 4]);
    swap.startup().unwrap();

    let mut out = vec![0u8; size_a];
    fx.flash0.read(0, &mut out).unwrap();
    assert_eq!(out, fx.image_a);
}
