//! Keyed page hashing.
//!
//! Exposes a small [`PageHasher`] abstraction so the choice of underlying
//! primitive is a single configuration point independent of the planner and
//! the trailer. The production implementation truncates SHA-256: changing
//! the prefix deterministically changes every fingerprint derived from it,
//! which is the only property the rest of the crate relies on.

use sha2::{Digest, Sha256};

use crate::fingerprint::Fingerprint;

const DIGEST_LENGTH: usize = 4;

/// A keyed hasher producing a 4-byte page fingerprint.
pub trait PageHasher {
    fn new(prefix: [u8; 4]) -> Self;
    fn update(&mut self, bytes: &[u8]);
    fn finish(self) -> Fingerprint;
}

/// SHA-256, keyed by hashing the prefix first, truncated to its leading
/// four bytes.
pub struct Sha256Truncated {
    inner: Sha256,
}

impl PageHasher for Sha256Truncated {
    fn new(prefix: [u8; 4]) -> Sha256Truncated {
        let mut inner = Sha256::new();
        inner.update(prefix);
        Sha256Truncated { inner }
    }

    fn update(&mut self, bytes: &[u8]) {
        self.inner.update(bytes);
    }

    fn finish(self) -> Fingerprint {
        let digest = self.inner.finalize();
        let mut out = [0u8; DIGEST_LENGTH];
        out.copy_from_slice(&digest[..DIGEST_LENGTH]);
        Fingerprint(out)
    }
}

/// Hash of an arbitrary byte slice under an all-zero prefix, used for the
/// trailer's own integrity check. Kept textually separate from the keyed
/// per-page hasher above even though it shares an implementation: the
/// prefix is never meant to key trailer integrity, only page content.
pub fn calc(data: &[u8]) -> Fingerprint {
    let mut hasher = Sha256Truncated::new([0; 4]);
    hasher.update(data);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn different_prefix_changes_fingerprint() {
        let mut a = Sha256Truncated::new([0, 0, 0, 0]);
        a.update(b"page content");
        let mut b = Sha256Truncated::new([1, 0, 0, 0]);
        b.update(b"page content");
        assert_ne!(a.finish(), b.finish());
    }

    #[test]
    fn same_input_same_fingerprint() {
        let mut a = Sha256Truncated::new([7, 7, 7, 7]);
        a.update(b"page content");
        let mut b = Sha256Truncated::new([7, 7, 7, 7]);
        b.update(b"page content");
        assert_eq!(a.finish(), b.finish());
    }
}
