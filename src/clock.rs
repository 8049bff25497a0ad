use crossbeam_utils::CachePadded;
use std::sync::atomic::{AtomicU64, Ordering};

/// Version assigned to objects created outside of a transaction.
/// The clock starts here, so such objects are visible to every transaction.
pub const INITIAL_VERSION: u64 = 1;

/// How commits obtain their version.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum ClockMode {
    /// Every tick increments the counter; commits are totally ordered.
    #[default]
    Strict,
    /// A tick that loses the CAS race adopts the winner's value.
    /// Independent commits may share a version, which lowers contention on the counter.
    Relaxed,
}

/// Process-wide version clock.
///
/// Readers take `current()` as their snapshot, committers `tick()` once per
/// commit while holding all commit locks.
pub struct VersionClock {
    value: CachePadded<AtomicU64>,
    mode: ClockMode,
}

impl VersionClock {
    pub fn new(mode: ClockMode) -> Self {
        Self::with_initial(mode, INITIAL_VERSION)
    }

    pub fn with_initial(mode: ClockMode, initial: u64) -> Self {
        Self {
            value: CachePadded::new(AtomicU64::new(initial.max(INITIAL_VERSION))),
            mode,
        }
    }

    pub fn mode(&self) -> ClockMode {
        self.mode
    }

    /// Current version. May be stale the instant it's read.
    #[inline]
    pub fn current(&self) -> u64 {
        self.value.load(Ordering::SeqCst)
    }

    /// Fresh version, strictly greater than any value observed before the call.
    pub fn tick(&self) -> u64 {
        match self.mode {
            ClockMode::Strict => self.value.fetch_add(1, Ordering::SeqCst) + 1,
            ClockMode::Relaxed => {
                let current = self.value.load(Ordering::SeqCst);
                match self.value.compare_exchange(
                    current,
                    current + 1,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                ) {
                    Ok(_) => current + 1,
                    // Someone else advanced it past `current`, share their version.
                    Err(advanced) => advanced,
                }
            }
        }
    }
}

impl Default for VersionClock {
    fn default() -> Self {
        Self::new(ClockMode::Strict)
    }
}

impl std::fmt::Debug for VersionClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VersionClock")
            .field("value", &self.current())
            .field("mode", &self.mode)
            .finish()
    }
}
