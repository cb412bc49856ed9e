//! A power-fail safe image-swap engine for a firmware update bootloader.
//!
//! Exchanges the contents of two flash slots page by page so that, after a
//! successful swap, the primary slot holds what was previously staged in
//! the secondary slot and vice versa. Interruption at any point (crash,
//! reset, power loss) during any flash erase or write is recoverable on the
//! next boot: a persistent status trailer in the tail of the secondary slot
//! records enough state for the swap to resume exactly where it left off.
//!
//! The crate is organized leaf-first, matching the dependency order of the
//! engine itself: [`fingerprint`] derives per-page content fingerprints,
//! [`plan`] turns two fingerprint arrays into ordered page moves, [`status`]
//! persists and recovers the swap's phase, and [`swap`] ties the three
//! together into the executor and recovery procedure the bootloader calls.

#![cfg_attr(not(any(feature = "std", test)), no_std)]

mod error;
mod fingerprint;
mod hash;
mod plan;
mod status;
mod swap;

pub use error::Error;
pub use fingerprint::{Bound, Fingerprint, Fingerprints};
pub use hash::{PageHasher, Sha256Truncated};
pub use plan::{WorkItem, WorkList};
pub use status::{Phase, StatusTrailer};
pub use swap::{request_upgrade, Resume, Swap};

pub use storage::{Flash, PageState, ReadFlash};

/// Page size assumed for both slots. The status trailer's wire layout (110
/// inline fingerprints in the last page, 127 per spill page) is derived
/// directly from this value, so it is a single crate-wide constant rather
/// than a per-call parameter. Both slots must share it; swapping across
/// heterogeneous page geometries is out of scope.
pub const PAGE_SIZE: usize = 512;

/// Upper bound on the number of pages in a single slot's image. Sizes the
/// fixed-capacity storage used for fingerprints and work lists; no heap
/// allocation is used anywhere in this crate.
pub const MAX_PAGES: usize = 256;

/// Number of page fingerprints stored inline in the trailer's last page.
pub const HASHES_PER_LAST_PAGE: usize = 110;

/// Number of page fingerprints stored in each spill hash page.
pub const HASHES_PER_HASH_PAGE: usize = 127;

/// How many times `Swap::startup` will bump the prefix and restart from
/// `Request` before giving up on a hash collision. Exceeding this returns
/// `Error::HashCollision` to the caller (bootloader exit code 2).
pub const MAX_COLLISION_RETRIES: u32 = 8;
