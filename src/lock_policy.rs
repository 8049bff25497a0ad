use crossbeam_utils::Backoff;
use std::sync::Arc;
use tracing::trace;

use crate::object::{LockMode, ObjectHandle};

/// One lock the commit needs, in the mode it needs it.
#[derive(Clone)]
pub struct LockRequest {
    pub object: Arc<dyn ObjectHandle>,
    pub mode: LockMode,
}

impl LockRequest {
    pub fn new(object: Arc<dyn ObjectHandle>, mode: LockMode) -> Self {
        Self { object, mode }
    }
}

impl std::fmt::Debug for LockRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockRequest")
            .field("object", &self.object.id())
            .field("mode", &self.mode)
            .finish()
    }
}

/// Strategy for locking the commit set.
///
/// `requests` arrive sorted by object id, which every transaction shares, so
/// two commits never wait on each other in opposite order. On `false` no lock
/// taken by this call may remain held.
pub trait CommitLockPolicy: Send + Sync {
    fn try_acquire_all(&self, requests: &[LockRequest], owner: u64) -> bool;
}

/// Release every request up to (excluding) `end`.
pub fn release_acquired(requests: &[LockRequest], end: usize, owner: u64) {
    for request in &requests[..end] {
        request.object.release_lock(owner);
    }
}

/// Zero spin, zero retry: unwind and report failure on the first miss.
#[derive(Debug, Default, Clone, Copy)]
pub struct FailFast;

impl CommitLockPolicy for FailFast {
    fn try_acquire_all(&self, requests: &[LockRequest], owner: u64) -> bool {
        for (idx, request) in requests.iter().enumerate() {
            if !request.object.try_acquire_lock(owner, request.mode) {
                trace!(owner, object = request.object.id(), "commit lock contended");
                release_acquired(requests, idx, owner);
                return false;
            }
        }
        true
    }
}

/// Busy-wait on contended locks using a budget of spin credits shared by the
/// whole attempt. When the budget runs out every lock is released and the
/// attempt starts over, up to `attempts` times.
#[derive(Debug, Clone, Copy)]
pub struct SpinAndRetry {
    spin_credits: u32,
    attempts: u32,
}

impl SpinAndRetry {
    pub fn new(spin_credits: u32, attempts: u32) -> Self {
        Self {
            spin_credits,
            attempts: attempts.max(1),
        }
    }
}

impl Default for SpinAndRetry {
    fn default() -> Self {
        Self::new(16, 3)
    }
}

impl CommitLockPolicy for SpinAndRetry {
    fn try_acquire_all(&self, requests: &[LockRequest], owner: u64) -> bool {
        let pause = Backoff::new();
        'attempt: for attempt in 0..self.attempts {
            let mut credits = self.spin_credits;
            for (idx, request) in requests.iter().enumerate() {
                let spin = Backoff::new();
                while !request.object.try_acquire_lock(owner, request.mode) {
                    if credits == 0 {
                        trace!(owner, attempt, object = request.object.id(), "spin credits exhausted");
                        release_acquired(requests, idx, owner);
                        pause.snooze();
                        continue 'attempt;
                    }
                    credits -= 1;
                    spin.spin();
                }
            }
            return true;
        }
        false
    }
}
