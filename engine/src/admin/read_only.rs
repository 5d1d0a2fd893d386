//! Read-only mode: a one-way latch with listener fan-out.
//!
//! Once any metadata path sees damage (bad page on a live path, corrupt
//! journal, metadata write failure), the whole instance latches into
//! read-only mode: new writes fail with `ReadOnly`, reads continue, and
//! the latch is persisted in the super block at the next opportunity.

use alloc::string::String;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};
use spin::Mutex;

use crate::core::CdsError;

// ============================================================================
// Read-Only Notifier
// ============================================================================

/// The latch plus its notification fan-out.
pub struct ReadOnlyNotifier {
    latched: AtomicBool,
    /// First error that tripped the latch
    cause: Mutex<Option<CdsError>>,
    /// Registered listener names, notified once on entry
    listeners: Mutex<Vec<String>>,
    notified: AtomicBool,
}

impl ReadOnlyNotifier {
    /// Unlatched notifier.
    pub fn new() -> Self {
        Self {
            latched: AtomicBool::new(false),
            cause: Mutex::new(None),
            listeners: Mutex::new(Vec::new()),
            notified: AtomicBool::new(false),
        }
    }

    /// Register a component for entry notification.
    pub fn register_listener(&self, name: &str) {
        self.listeners.lock().push(String::from(name));
    }

    /// Latch into read-only mode. Only the first caller's error is
    /// recorded; every registered listener is notified exactly once.
    pub fn enter(&self, error: CdsError, context: &str) {
        if self.latched.swap(true, Ordering::AcqRel) {
            return;
        }
        *self.cause.lock() = Some(error);
        log::error!("entering read-only mode from {context}: {error}");
        if !self.notified.swap(true, Ordering::AcqRel) {
            for listener in self.listeners.lock().iter() {
                log::warn!("read-only notification delivered to {listener}");
            }
        }
    }

    /// Has the latch tripped?
    #[inline]
    pub fn is_read_only(&self) -> bool {
        self.latched.load(Ordering::Acquire)
    }

    /// The error that tripped the latch.
    pub fn cause(&self) -> Option<CdsError> {
        *self.cause.lock()
    }

    /// Restore a persisted latch at load time.
    pub fn latch_from_disk(&self) {
        self.latched.store(true, Ordering::Release);
    }
}

impl Default for ReadOnlyNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_way_latch_keeps_first_cause() {
        let notifier = ReadOnlyNotifier::new();
        assert!(!notifier.is_read_only());
        notifier.enter(CdsError::BadPage, "block map");
        notifier.enter(CdsError::Io, "journal");
        assert!(notifier.is_read_only());
        assert_eq!(notifier.cause(), Some(CdsError::BadPage));
    }

    #[test]
    fn test_latch_from_disk() {
        let notifier = ReadOnlyNotifier::new();
        notifier.latch_from_disk();
        assert!(notifier.is_read_only());
        assert_eq!(notifier.cause(), None);
    }
}
