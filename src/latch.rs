use parking_lot::{Condvar, Mutex};
use std::time::Instant;

/// Result of waiting on a [`Latch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AwaitOutcome {
    /// The latch was opened, or its era moved on.
    Opened,
    /// The deadline passed before the latch opened.
    TimedOut,
    /// The wait was interrupted.
    Interrupted,
}

#[derive(Debug)]
struct LatchState {
    era: u64,
    open: bool,
    interrupted: bool,
}

/// Single-use wake primitive used by blocking retries.
///
/// A latch is reused across wait episodes by bumping its era in [`Latch::reset`].
/// Listeners registered in an older era can no longer open it.
#[derive(Debug)]
pub struct Latch {
    state: Mutex<LatchState>,
    cond: Condvar,
}

impl Default for Latch {
    fn default() -> Self {
        Self::new()
    }
}

impl Latch {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LatchState {
                era: 0,
                open: false,
                interrupted: false,
            }),
            cond: Condvar::new(),
        }
    }

    /// Current era.
    pub fn era(&self) -> u64 {
        self.state.lock().era
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }

    /// Whether a listener of `era` can no longer do anything: the latch was
    /// opened or moved on to a later era.
    pub(crate) fn is_spent(&self, era: u64) -> bool {
        let state = self.state.lock();
        state.era != era || state.open
    }

    /// Close the latch and start a new era. Returns the new era.
    /// A pending interrupt survives the reset.
    pub fn reset(&self) -> u64 {
        let mut state = self.state.lock();
        state.era += 1;
        state.open = false;
        state.era
    }

    /// Open the latch if it is still in `expected_era`.
    pub fn open(&self, expected_era: u64) {
        let mut state = self.state.lock();
        if state.era != expected_era || state.open {
            return;
        }
        state.open = true;
        self.cond.notify_all();
    }

    /// Interrupt the current or next wait.
    pub fn interrupt(&self) {
        let mut state = self.state.lock();
        state.interrupted = true;
        self.cond.notify_all();
    }

    /// Block until the latch is opened or leaves `expected_era`.
    ///
    /// Without `deadline` the wait is unbounded. A non-interruptible wait
    /// consumes interrupts and keeps waiting.
    pub fn await_open(
        &self,
        expected_era: u64,
        deadline: Option<Instant>,
        interruptible: bool,
    ) -> AwaitOutcome {
        let mut state = self.state.lock();
        loop {
            if state.era != expected_era || state.open {
                return AwaitOutcome::Opened;
            }
            if state.interrupted {
                state.interrupted = false;
                if interruptible {
                    return AwaitOutcome::Interrupted;
                }
            }
            match deadline {
                None => self.cond.wait(&mut state),
                Some(deadline) => {
                    if self.cond.wait_until(&mut state, deadline).timed_out() {
                        if state.era != expected_era || state.open {
                            return AwaitOutcome::Opened;
                        }
                        return AwaitOutcome::TimedOut;
                    }
                }
            }
        }
    }
}
