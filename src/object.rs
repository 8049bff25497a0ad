use crossbeam_epoch::{self as epoch, Atomic, Owned};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;

use crate::errors::StmError;
use crate::latch::Latch;
use crate::listeners::Listeners;
use crate::tranlocal::{Tracked, Tranlocal};

/// Creation sequence of transactional objects. Also the commit lock order.
static OBJECT_IDS: AtomicU64 = AtomicU64::new(1);

const MODE_BITS: u64 = 2;
const MODE_MASK: u64 = (1 << MODE_BITS) - 1;

/// Lock modes of a transactional object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LockMode {
    /// Write-intent lock: blocks other committers, readers continue.
    Write = 1,
    /// Commit lock: additionally blocks readers.
    Exclusive = 2,
}

impl LockMode {
    fn from_bits(bits: u64) -> Option<Self> {
        match bits {
            1 => Some(LockMode::Write),
            2 => Some(LockMode::Exclusive),
            _ => None,
        }
    }
}

/// Outcome of registering a waiter on an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// The object already moved past the observed version; don't block.
    OpenedImmediately,
    /// The latch will be opened by the next commit touching the object.
    Registered,
    /// Nothing to wait on (never committed).
    NotApplicable,
}

/// Type-erased view of a transactional object, used for commit locking and blocking.
pub trait ObjectHandle: Send + Sync {
    /// Unique id, increasing in creation order.
    fn id(&self) -> u64;

    /// Try to lock the object for `owner`. Returns `false` on contention.
    ///
    /// Not reentrant, except that an owner holding `Write` may upgrade to
    /// `Exclusive`, and asking again for a mode already held succeeds.
    fn try_acquire_lock(&self, owner: u64, mode: LockMode) -> bool;

    /// Release the lock if `expected_owner` still holds it. Never fails.
    fn release_lock(&self, expected_owner: u64);

    /// Current lock holder and mode.
    fn lock_state(&self) -> Option<(u64, LockMode)>;

    /// Version of the published record, `0` when never committed.
    fn published_version(&self) -> u64;

    /// Register `latch` to be opened once the object moves past `observed_version`.
    fn register_waiter(&self, latch: &Arc<Latch>, era: u64, observed_version: u64)
    -> Registration;
}

/// Shared state of one transactional object.
pub(crate) struct ObjectCore<T> {
    id: u64,
    /// `0` when free, otherwise `owner << MODE_BITS | mode`.
    lock: AtomicU64,
    published: Atomic<Arc<Tranlocal<T>>>,
    waiters: Listeners,
}

impl<T: Tracked> ObjectCore<T> {
    fn new(published: Option<Tranlocal<T>>) -> Self {
        let published = match published {
            Some(record) => Atomic::new(Arc::new(record)),
            None => Atomic::null(),
        };
        Self {
            id: OBJECT_IDS.fetch_add(1, Ordering::Relaxed),
            lock: AtomicU64::new(0),
            published,
            waiters: Listeners::new(),
        }
    }

    #[inline]
    fn decode(word: u64) -> Option<(u64, LockMode)> {
        if word == 0 {
            return None;
        }
        LockMode::from_bits(word & MODE_MASK).map(|mode| (word >> MODE_BITS, mode))
    }

    #[inline]
    fn encode(owner: u64, mode: LockMode) -> u64 {
        debug_assert!(owner > 0 && owner < (1 << (64 - MODE_BITS)));
        (owner << MODE_BITS) | mode as u64
    }

    /// Fails when someone else holds the commit lock.
    #[inline]
    fn check_readable(&self, reader: u64) -> Result<(), StmError> {
        match Self::decode(self.lock.load(Ordering::Acquire)) {
            Some((owner, LockMode::Exclusive)) if owner != reader => Err(StmError::ReadConflict {
                object: self.id,
                owner,
            }),
            _ => Ok(()),
        }
    }

    /// Current published record, `None` before construction.
    ///
    /// The lock is checked before and after the load so a record that is
    /// being replaced by a committing transaction is never handed out.
    pub(crate) fn read_published(
        &self,
        reader: u64,
    ) -> Result<Option<Arc<Tranlocal<T>>>, StmError> {
        self.check_readable(reader)?;
        let record = self.load_published();
        self.check_readable(reader)?;
        Ok(record)
    }

    /// Unchecked load of the published record.
    pub(crate) fn load_published(&self) -> Option<Arc<Tranlocal<T>>> {
        let guard = epoch::pin();
        let shared = self.published.load(Ordering::SeqCst, &guard);
        // SAFETY: the guard keeps the pointee alive until the Arc is cloned.
        unsafe { shared.as_ref() }.map(Arc::clone)
    }

    /// Whether `record` is still the published record.
    pub(crate) fn is_published(&self, record: Option<&Arc<Tranlocal<T>>>) -> bool {
        let guard = epoch::pin();
        let shared = self.published.load(Ordering::SeqCst, &guard);
        match (unsafe { shared.as_ref() }, record) {
            (Some(current), Some(record)) => Arc::ptr_eq(current, record),
            (None, None) => true,
            _ => false,
        }
    }

    /// Install `draft` as the committed record at `version` and wake the waiters.
    ///
    /// Must be called while holding the commit lock.
    pub(crate) fn publish(&self, draft: Tranlocal<T>, version: u64) -> Arc<Tranlocal<T>> {
        debug_assert!(matches!(
            Self::decode(self.lock.load(Ordering::Relaxed)),
            Some((_, LockMode::Exclusive))
        ));

        let record = Arc::new(draft.freeze(version));
        let guard = epoch::pin();
        let old = self
            .published
            .swap(Owned::new(Arc::clone(&record)), Ordering::SeqCst, &guard);
        if !old.is_null() {
            // SAFETY: the old record is unreachable from the object after the swap.
            unsafe { guard.defer_destroy(old) };
        }

        // Waiters are opened after the swap, so a woken transaction sees the new record.
        let woken = if self.waiters.is_empty() {
            0
        } else {
            self.waiters.open_all()
        };
        trace!(object = self.id, version, woken, "published");
        record
    }
}

impl<T: Tracked> ObjectHandle for ObjectCore<T> {
    #[inline]
    fn id(&self) -> u64 {
        self.id
    }

    fn try_acquire_lock(&self, owner: u64, mode: LockMode) -> bool {
        let wanted = Self::encode(owner, mode);
        let mut current = self.lock.load(Ordering::Acquire);
        loop {
            match Self::decode(current) {
                None => {}
                Some((holder, held)) if holder == owner => {
                    if held >= mode {
                        return true;
                    }
                    // Write -> Exclusive upgrade falls through to the CAS.
                }
                Some(_) => return false,
            }
            match self.lock.compare_exchange_weak(
                current,
                wanted,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    fn release_lock(&self, expected_owner: u64) {
        let mut current = self.lock.load(Ordering::Acquire);
        loop {
            match Self::decode(current) {
                Some((holder, _)) if holder == expected_owner => {}
                _ => return,
            }
            match self
                .lock
                .compare_exchange_weak(current, 0, Ordering::Release, Ordering::Acquire)
            {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    fn lock_state(&self) -> Option<(u64, LockMode)> {
        Self::decode(self.lock.load(Ordering::Acquire))
    }

    fn published_version(&self) -> u64 {
        self.load_published()
            .map(|record| record.write_version())
            .unwrap_or(0)
    }

    fn register_waiter(
        &self,
        latch: &Arc<Latch>,
        era: u64,
        observed_version: u64,
    ) -> Registration {
        let current = self.published_version();
        if current == 0 {
            return Registration::NotApplicable;
        }
        if current != observed_version {
            return Registration::OpenedImmediately;
        }

        self.waiters.push(Arc::clone(latch), era);

        // A writer may have published between the check and the push. It either
        // saw our node (and opened it) or we see its record now.
        if self.published_version() != observed_version {
            self.waiters.open_all();
            return Registration::OpenedImmediately;
        }
        Registration::Registered
    }
}

impl<T> Drop for ObjectCore<T> {
    fn drop(&mut self) {
        // SAFETY: `&mut self` means no reader can hold the published pointer.
        unsafe {
            let guard = epoch::unprotected();
            let current = self.published.load(Ordering::Relaxed, guard);
            if !current.is_null() {
                drop(current.into_owned());
            }
        }
    }
}

/// Handle to a transactional object holding a value of type `T`.
///
/// Cloning the handle is cheap and refers to the same object.
pub struct TxnObject<T> {
    pub(crate) core: Arc<ObjectCore<T>>,
}

impl<T> Clone for TxnObject<T> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl<T: Tracked> TxnObject<T> {
    /// Object with committed state at `version`.
    pub(crate) fn committed(value: T, version: u64) -> Self {
        Self {
            core: Arc::new(ObjectCore::new(Some(Tranlocal::published(value, version)))),
        }
    }

    /// Object without committed state; must be constructed by a transaction.
    pub(crate) fn unborn() -> Self {
        Self {
            core: Arc::new(ObjectCore::new(None)),
        }
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.core.id
    }

    /// Version of the committed record, `0` before construction.
    pub fn version(&self) -> u64 {
        self.core.published_version()
    }

    /// Holder of the lock, if any.
    pub fn lock_owner(&self) -> Option<u64> {
        self.core.lock_state().map(|(owner, _)| owner)
    }

    pub fn is_locked(&self) -> bool {
        self.core.lock_state().is_some()
    }

    /// Whether a transaction committed state for this object.
    pub fn is_committed(&self) -> bool {
        self.version() != 0
    }

    /// Non-transactional read of the committed value.
    ///
    /// Waits out a concurrent commit of this object instead of failing.
    pub fn atomic_get(&self) -> Option<T> {
        let backoff = crossbeam_utils::Backoff::new();
        loop {
            match self.core.read_published(0) {
                Ok(record) => return record.map(|record| record.value().clone()),
                Err(_) => backoff.snooze(),
            }
        }
    }

    /// Type-erased handle.
    pub fn handle(&self) -> Arc<dyn ObjectHandle> {
        self.core.clone()
    }
}

impl<T: Tracked> fmt::Debug for TxnObject<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TxnObject")
            .field("id", &self.core.id)
            .field("version", &self.version())
            .field("lock", &self.core.lock_state())
            .finish()
    }
}
