//! Error taxonomy for the metadata engine.
//!
//! Every fallible operation returns [`CdsResult`]. Requests additionally
//! carry a sticky copy of the first failure they observed; see the
//! pipeline module.

use core::fmt;

// ============================================================================
// Error Type
// ============================================================================

/// Errors produced by the metadata engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CdsError {
    /// No free physical blocks remain
    NoSpace,
    /// A block number or slot was outside its valid range
    OutOfRange,
    /// A metadata page failed validation on load
    BadPage,
    /// A mapping entry decoded to an impossible location
    BadMapping,
    /// A compressed fragment had an invalid slot, offset, or size
    InvalidFragment,
    /// A journal block or entry failed validation during replay
    CorruptJournal,
    /// The instance is in read-only mode; writes are refused
    ReadOnly,
    /// The instance is suspending or shut down; new work is refused
    ShuttingDown,
    /// The supplied configuration was rejected
    BadConfiguration,
    /// The deduplication index did not answer in time
    Timeout,
    /// The backing device reported an I/O failure
    Io,
}

impl CdsError {
    /// Short static description.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoSpace => "out of physical space",
            Self::OutOfRange => "block number out of range",
            Self::BadPage => "metadata page failed validation",
            Self::BadMapping => "invalid block mapping",
            Self::InvalidFragment => "invalid compressed fragment",
            Self::CorruptJournal => "journal corrupted",
            Self::ReadOnly => "instance is read-only",
            Self::ShuttingDown => "instance is shutting down",
            Self::BadConfiguration => "invalid configuration",
            Self::Timeout => "dedupe index timed out",
            Self::Io => "I/O error",
        }
    }

    /// Errors that latch the whole instance into read-only mode when seen
    /// on a live metadata path.
    #[inline]
    pub fn is_read_only_trigger(&self) -> bool {
        matches!(self, Self::BadPage | Self::CorruptJournal | Self::Io)
    }

    /// Errors that are expected under back-pressure or races and never
    /// indicate damage.
    #[inline]
    pub fn is_benign(&self) -> bool {
        matches!(self, Self::NoSpace | Self::Timeout | Self::ShuttingDown)
    }
}

impl fmt::Display for CdsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result alias used throughout the engine.
pub type CdsResult<T> = Result<T, CdsError>;

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn test_read_only_triggers() {
        assert!(CdsError::BadPage.is_read_only_trigger());
        assert!(CdsError::Io.is_read_only_trigger());
        assert!(!CdsError::NoSpace.is_read_only_trigger());
        assert!(!CdsError::Timeout.is_read_only_trigger());
    }

    #[test]
    fn test_display() {
        assert_eq!(CdsError::NoSpace.as_str(), "out of physical space");
        assert_eq!(CdsError::ReadOnly.to_string(), "instance is read-only");
    }
}
