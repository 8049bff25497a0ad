//! Per-family speculative profile.
//!
//! A family starts lean: readonly, with a single-slot attached set. Each
//! speculative failure fattens the profile for every later attempt of the family.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use tracing::debug;

/// Backing storage of the attached set, from cheapest to most general.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum StorageKind {
    Mono = 0,
    FixedArray = 1,
    Map = 2,
}

impl StorageKind {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => StorageKind::Mono,
            1 => StorageKind::FixedArray,
            _ => StorageKind::Map,
        }
    }

    fn next(self) -> Self {
        match self {
            StorageKind::Mono => StorageKind::FixedArray,
            _ => StorageKind::Map,
        }
    }
}

/// Learned shape of a transaction family.
#[derive(Debug)]
pub struct SpeculativeProfile {
    family: String,
    readonly: AtomicBool,
    storage: AtomicU8,
}

impl SpeculativeProfile {
    /// Lean profile used when speculation is enabled.
    pub fn lean(family: impl Into<String>) -> Self {
        Self {
            family: family.into(),
            readonly: AtomicBool::new(true),
            storage: AtomicU8::new(StorageKind::Mono as u8),
        }
    }

    /// Profile that never needs to restart.
    pub fn fat(family: impl Into<String>) -> Self {
        Self {
            family: family.into(),
            readonly: AtomicBool::new(false),
            storage: AtomicU8::new(StorageKind::Map as u8),
        }
    }

    pub fn family(&self) -> &str {
        &self.family
    }

    pub fn is_readonly(&self) -> bool {
        self.readonly.load(Ordering::Acquire)
    }

    pub fn storage(&self) -> StorageKind {
        StorageKind::from_u8(self.storage.load(Ordering::Acquire))
    }

    /// The family wrote: later attempts start as update transactions.
    pub fn mark_update(&self) {
        if self.readonly.swap(false, Ordering::AcqRel) {
            debug!(family = %self.family, "speculative profile upgraded to update transaction");
        }
    }

    /// The attached set overflowed `seen`: later attempts start one size up.
    pub fn grow_storage(&self, seen: StorageKind) {
        let next = seen.next();
        let previous = self.storage.fetch_max(next as u8, Ordering::AcqRel);
        if previous < next as u8 {
            debug!(family = %self.family, storage = ?next, "speculative profile grew attached set");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lean_profile_grows_monotonically() {
        let profile = SpeculativeProfile::lean("f");
        assert!(profile.is_readonly());
        assert_eq!(profile.storage(), StorageKind::Mono);

        profile.grow_storage(StorageKind::Mono);
        assert_eq!(profile.storage(), StorageKind::FixedArray);

        // A stale attempt that still ran with Mono does not shrink it back.
        profile.grow_storage(StorageKind::Mono);
        assert_eq!(profile.storage(), StorageKind::FixedArray);

        profile.grow_storage(StorageKind::FixedArray);
        assert_eq!(profile.storage(), StorageKind::Map);
        profile.grow_storage(StorageKind::Map);
        assert_eq!(profile.storage(), StorageKind::Map);
    }

    #[test]
    fn test_mark_update_is_sticky() {
        let profile = SpeculativeProfile::lean("f");
        profile.mark_update();
        profile.mark_update();
        assert!(!profile.is_readonly());
    }

    #[test]
    fn test_fat_profile() {
        let profile = SpeculativeProfile::fat("f");
        assert!(!profile.is_readonly());
        assert_eq!(profile.storage(), StorageKind::Map);
    }
}
