//! The engine's error type.

use core::fmt;

/// Everything that can go wrong while planning, persisting, or executing a
/// swap.
#[derive(Copy, Clone, Eq, PartialEq)]
pub enum Error {
    /// The underlying flash driver reported an error.
    Flash(storage::Error),
    /// Two pages recorded the same fingerprint under the current prefix but
    /// a byte-level comparison showed their content actually differs.
    /// `Swap::startup` bumps the prefix and restarts from `Request`; this
    /// variant only escapes to the caller once `MAX_COLLISION_RETRIES` is
    /// exhausted.
    HashCollision,
    /// The status trailer's two candidate pages were both unreadable:
    /// neither carried a valid integrity hash, yet at least one looked
    /// like it should have (e.g. a spill hash page failed its own
    /// integrity check after the last page pointed at it).
    CorruptTrailer,
    /// A trailer scan produced a phase byte or page-state combination that
    /// does not correspond to any phase this engine writes.
    StateError,
    /// A work list needed more entries than `MAX_PAGES` provides. Fatal at
    /// plan-build time; raising `MAX_PAGES` is the only remedy.
    Overflow,
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Flash(e) => f.debug_tuple("Flash").field(e).finish(),
            Error::HashCollision => write!(f, "HashCollision"),
            Error::CorruptTrailer => write!(f, "CorruptTrailer"),
            Error::StateError => write!(f, "StateError"),
            Error::Overflow => write!(f, "Overflow"),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}

impl From<storage::Error> for Error {
    fn from(e: storage::Error) -> Error {
        Error::Flash(e)
    }
}
