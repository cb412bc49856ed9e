//! Test image generation.
//!
//! The swap engine addresses content by fingerprint, not by parsing an
//! image format, so test images only need to be distinguishable and
//! reproducible -- not real signed firmware. A seeded PRNG gives both: the
//! same seed and size always produce the same bytes, which is what lets
//! `build_slide`/`build_swap`'s determinism actually be exercised across
//! repeated runs of the same scenario.

use rand::RngCore;
use rand::SeedableRng;
use rand_xoshiro::Xoshiro256Plus;

pub struct GeneratedImage {
    pub data: Vec<u8>,
}

pub struct GenBuilder {
    size: usize,
    seed: u64,
}

impl Default for GenBuilder {
    fn default() -> Self {
        GenBuilder {
            size: 76_137,
            seed: 1,
        }
    }
}

impl GenBuilder {
    pub fn size(&mut self, size: usize) -> &mut Self {
        self.size = size;
        self
    }

    pub fn seed(&mut self, seed: u64) -> &mut Self {
        self.seed = seed;
        self
    }

    pub fn build(&self) -> GeneratedImage {
        let mut rng = Xoshiro256Plus::seed_from_u64(self.seed);
        let mut data = vec![0u8; self.size];
        rng.fill_bytes(&mut data);
        GeneratedImage { data }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_same_bytes() {
        let a = GenBuilder::default().seed(42).size(1024).build();
        let b = GenBuilder::default().seed(42).size(1024).build();
        assert_eq!(a.data, b.data);
    }

    #[test]
    fn different_seed_different_bytes() {
        let a = GenBuilder::default().seed(1).size(1024).build();
        let b = GenBuilder::default().seed(2).size(1024).build();
        assert_ne!(a.data, b.data);
    }
}
