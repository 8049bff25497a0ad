use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, trace};

use crate::Stm;
use crate::attached::{AttachedSet, Entry, Slot, SlotState};
use crate::clock::ClockMode;
use crate::config::{IsolationLevel, TxnConfig};
use crate::errors::StmError;
use crate::latch::{AwaitOutcome, Latch};
use crate::lock_policy::{LockRequest, release_acquired};
use crate::object::{LockMode, ObjectHandle, Registration, TxnObject};
use crate::speculative::{SpeculativeProfile, StorageKind};
use crate::tranlocal::{Tracked, Tranlocal};

/// Transaction ids double as lock owners, so `0` is never handed out.
static TXN_IDS: AtomicU64 = AtomicU64::new(1);

type Hook = Box<dyn FnOnce() + Send>;

/// Lifecycle of a transaction attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnStatus {
    Active,
    /// Commit locks are held and validated; only commit or abort may follow.
    Prepared,
    Committed,
    Aborted,
}

impl TxnStatus {
    pub fn is_alive(self) -> bool {
        matches!(self, TxnStatus::Active | TxnStatus::Prepared)
    }
}

/// Wakes a transaction blocked in a retry from another thread.
#[derive(Clone)]
pub struct InterruptHandle {
    latch: Arc<Latch>,
}

impl InterruptHandle {
    /// Interruptible transactions fail with [`StmError::RetryInterrupted`],
    /// others ignore the interrupt and keep waiting.
    pub fn interrupt(&self) {
        self.latch.interrupt();
    }
}

impl fmt::Debug for InterruptHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterruptHandle").finish_non_exhaustive()
    }
}

/// A transaction over transactional objects.
///
/// Objects are opened for read, write, construction or commuting write;
/// every opened object stays attached until the attempt ends. Nothing is
/// visible to other transactions before [`Transaction::commit`], and no object
/// lock is held outside of prepare/commit.
pub struct Transaction<'a> {
    stm: &'a Stm,
    id: u64,
    status: TxnStatus,
    /// Clock value at the start of the attempt.
    read_version: u64,
    attempt: u32,
    config: Arc<TxnConfig>,
    profile: Arc<SpeculativeProfile>,
    readonly: bool,
    attached: AttachedSet,
    /// Objects locked by prepare, released on commit or abort.
    locked: Vec<Arc<dyn ObjectHandle>>,
    abort_only: bool,
    post_commit_hooks: Vec<Hook>,
    post_rollback_hooks: Vec<Hook>,
    /// Reads made without read tracking. Only the last one is kept, unless a
    /// relaxed clock needs them for revalidation.
    untracked: Vec<Box<dyn Entry>>,
    latch: Arc<Latch>,
    /// End of the blocking budget, shared by all attempts.
    deadline: Option<Instant>,
}

impl<'a> Transaction<'a> {
    pub(crate) fn new(
        stm: &'a Stm,
        config: Arc<TxnConfig>,
        profile: Arc<SpeculativeProfile>,
    ) -> Self {
        let deadline = config
            .timeout
            .and_then(|timeout| Instant::now().checked_add(timeout));
        let speculative_profile = config.speculative.then(|| Arc::clone(&profile));
        let mut txn = Self {
            stm,
            id: 0,
            status: TxnStatus::Active,
            read_version: 0,
            attempt: 1,
            attached: AttachedSet::new(
                StorageKind::Mono,
                config.max_array_size,
                speculative_profile,
            ),
            config,
            profile,
            readonly: false,
            locked: Vec::new(),
            abort_only: false,
            post_commit_hooks: Vec::new(),
            post_rollback_hooks: Vec::new(),
            untracked: Vec::new(),
            latch: Arc::new(Latch::new()),
            deadline,
        };
        txn.begin_attempt();
        txn
    }

    fn begin_attempt(&mut self) {
        self.id = TXN_IDS.fetch_add(1, Ordering::Relaxed);
        self.status = TxnStatus::Active;
        self.read_version = self.stm.clock().current();
        self.abort_only = false;
        self.untracked.clear();
        self.readonly = match self.config.readonly {
            Some(readonly) => readonly,
            None => self.config.speculative && self.profile.is_readonly(),
        };
        let storage = if self.config.speculative {
            self.profile.storage()
        } else {
            StorageKind::FixedArray
        };
        self.attached.reset(storage);
    }

    /// Start the next attempt: fresh id and snapshot, same configuration.
    pub(crate) fn restart(&mut self) {
        if self.status.is_alive() {
            self.abort_quietly();
        }
        self.attempt += 1;
        self.begin_attempt();
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn status(&self) -> TxnStatus {
        self.status
    }

    #[inline]
    pub fn read_version(&self) -> u64 {
        self.read_version
    }

    /// 1-based attempt number.
    #[inline]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn config(&self) -> &TxnConfig {
        &self.config
    }

    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    pub fn is_abort_only(&self) -> bool {
        self.abort_only
    }

    /// Number of attached objects.
    pub fn attached_count(&self) -> usize {
        self.attached.len()
    }

    pub fn interrupt_handle(&self) -> InterruptHandle {
        InterruptHandle {
            latch: Arc::clone(&self.latch),
        }
    }

    fn ensure_active(&self) -> Result<(), StmError> {
        if self.status == TxnStatus::Active {
            Ok(())
        } else {
            Err(StmError::DeadTransaction {
                txn: self.id,
                status: self.status,
            })
        }
    }

    fn ensure_writable(&mut self, object: u64) -> Result<(), StmError> {
        if !self.readonly {
            return Ok(());
        }
        if self.config.readonly == Some(true) || !self.config.speculative {
            return Err(StmError::ReadonlyViolation {
                family: self.config.family.clone(),
                object,
            });
        }
        // Started readonly on speculation only: restart as an update transaction.
        self.profile.mark_update();
        Err(StmError::SpeculativeFailure)
    }

    fn slot_at<T: Tracked>(&mut self, idx: usize) -> Result<&mut Slot<T>, StmError> {
        let entry = self.attached.at_mut(idx);
        let object = entry.object_id();
        entry
            .as_any_mut()
            .downcast_mut::<Slot<T>>()
            .ok_or(StmError::TypeMismatch { object })
    }

    /// Read the published record and check it against the snapshot.
    fn load_checked<T: Tracked>(
        &mut self,
        obj: &TxnObject<T>,
    ) -> Result<Option<Arc<Tranlocal<T>>>, StmError> {
        let record = obj.core.read_published(self.id)?;
        if let Some(record) = &record {
            self.check_snapshot(obj.id(), record.write_version())?;
        }
        Ok(record)
    }

    fn check_snapshot(&self, object: u64, version: u64) -> Result<(), StmError> {
        if !self.config.isolation.reads_snapshot() {
            return Ok(());
        }
        let stale = StmError::StaleRead {
            object,
            version,
            read_version: self.read_version,
        };
        if version > self.read_version {
            debug!(txn = self.id, object, version, read_version = self.read_version, "stale read");
            return Err(stale);
        }
        // A relaxed clock hands the same version to independent commits, so a
        // record at our read version may have been published after we started.
        if version == self.read_version && self.stm.clock().mode() == ClockMode::Relaxed {
            let observed = self
                .attached
                .iter()
                .chain(self.untracked.iter().map(|e| &**e));
            for entry in observed {
                if entry.object_id() != object && !self.still_current(entry) {
                    debug!(txn = self.id, object, "read set changed under relaxed clock");
                    return Err(stale);
                }
            }
        }
        Ok(())
    }

    /// Whether `entry` still matches the published record and no other
    /// transaction is halfway through publishing over it.
    fn still_current(&self, entry: &dyn Entry) -> bool {
        if entry.validate().is_err() {
            return false;
        }
        !matches!(
            entry.handle().lock_state(),
            Some((owner, LockMode::Exclusive)) if owner != self.id
        )
    }

    /// Open `obj` for reading and return its value as seen by this transaction.
    ///
    /// Under [`IsolationLevel::ReadCommitted`] a cached read is refreshed to the
    /// latest committed record; other levels keep returning the cached record.
    pub fn open_for_read<T: Tracked>(&mut self, obj: &TxnObject<T>) -> Result<&T, StmError> {
        self.ensure_active()?;
        let id = obj.id();

        if let Some(idx) = self.attached.position(id) {
            let (commute, read) = {
                let slot = self.slot_at::<T>(idx)?;
                (
                    slot.is_commute(),
                    matches!(slot.state, SlotState::Read(_)),
                )
            };
            if commute {
                let fixated = self.load_checked(obj)?;
                self.slot_at::<T>(idx)?.upgrade_to_write(fixated)?;
            } else if read && self.config.isolation == IsolationLevel::ReadCommitted {
                if let Some(latest) = obj.core.read_published(self.id)? {
                    self.slot_at::<T>(idx)?.state = SlotState::Read(latest);
                }
            }
            return self
                .slot_at::<T>(idx)?
                .value()
                .ok_or(StmError::UncommittedRead { object: id });
        }

        let Some(record) = self.load_checked(obj)? else {
            return Err(StmError::UncommittedRead { object: id });
        };

        if !self.config.read_tracking {
            if self.stm.clock().mode() == ClockMode::Strict {
                self.untracked.clear();
            }
            self.untracked.push(Box::new(Slot::new(
                Arc::clone(&obj.core),
                SlotState::Read(record),
            )));
            return self
                .untracked
                .last()
                .and_then(|entry| entry.as_any().downcast_ref::<Slot<T>>())
                .and_then(|slot| slot.value())
                .ok_or(StmError::TypeMismatch { object: id });
        }

        let idx = self.attached.push(Box::new(Slot::new(
            Arc::clone(&obj.core),
            SlotState::Read(record),
        )))?;
        self.slot_at::<T>(idx)?
            .value()
            .ok_or(StmError::UncommittedRead { object: id })
    }

    /// Clone of the value of `obj` as seen by this transaction.
    pub fn read<T: Tracked>(&mut self, obj: &TxnObject<T>) -> Result<T, StmError> {
        self.open_for_read(obj).cloned()
    }

    /// Open `obj` for writing and return the mutable draft.
    pub fn open_for_write<T: Tracked>(&mut self, obj: &TxnObject<T>) -> Result<&mut T, StmError> {
        self.ensure_active()?;
        let id = obj.id();
        self.ensure_writable(id)?;

        let idx = match self.attached.position(id) {
            Some(idx) => idx,
            None => {
                let Some(record) = self.load_checked(obj)? else {
                    return Err(StmError::UncommittedRead { object: id });
                };
                self.attached.push(Box::new(Slot::new(
                    Arc::clone(&obj.core),
                    SlotState::Read(record),
                )))?
            }
        };

        let fixated = if self.slot_at::<T>(idx)?.is_commute() {
            self.load_checked(obj)?
        } else {
            None
        };
        self.slot_at::<T>(idx)?.upgrade_to_write(fixated)
    }

    /// Attach the initial draft of an object that was never committed.
    pub fn open_for_construction<T: Tracked>(
        &mut self,
        obj: &TxnObject<T>,
        value: T,
    ) -> Result<&mut T, StmError> {
        self.ensure_active()?;
        let id = obj.id();
        self.ensure_writable(id)?;

        if obj.is_committed() || self.attached.position(id).is_some() {
            return Err(StmError::AlreadyConstructed { object: id });
        }
        let idx = self.attached.push(Box::new(Slot::new(
            Arc::clone(&obj.core),
            SlotState::Write(Tranlocal::constructing(value)),
        )))?;
        self.slot_at::<T>(idx)?.upgrade_to_write(None)
    }

    /// Create a new object whose first value is published by this transaction.
    pub fn new_object<T: Tracked>(&mut self, value: T) -> Result<TxnObject<T>, StmError> {
        let obj = TxnObject::unborn();
        self.open_for_construction(&obj, value)?;
        Ok(obj)
    }

    /// Queue `f` to be applied to the value of `obj` at commit.
    ///
    /// No read dependency is created, so concurrent commuting writers do not
    /// conflict. Reading or writing the object later in this transaction
    /// applies the pending functions right away.
    pub fn open_for_commuting_write<T, F>(&mut self, obj: &TxnObject<T>, f: F) -> Result<(), StmError>
    where
        T: Tracked,
        F: Fn(&mut T) + Send + Sync + 'static,
    {
        self.ensure_active()?;
        let id = obj.id();
        self.ensure_writable(id)?;

        match self.attached.position(id) {
            Some(idx) => {
                let slot = self.slot_at::<T>(idx)?;
                if let SlotState::Commute(pending) = &mut slot.state {
                    pending.push(Arc::new(f));
                } else {
                    f(slot.upgrade_to_write(None)?);
                }
            }
            None => {
                if !obj.is_committed() {
                    return Err(StmError::UncommittedRead { object: id });
                }
                self.attached.push(Box::new(Slot::new(
                    Arc::clone(&obj.core),
                    SlotState::Commute(vec![Arc::new(f)]),
                )))?;
            }
        }
        Ok(())
    }

    /// Request a blocking retry: the attempt ends and the transaction runs
    /// again once one of the objects it read changes.
    pub fn retry<R>(&mut self) -> Result<R, StmError> {
        self.ensure_active()?;
        if !self.config.read_tracking {
            return Err(StmError::NoRetryPossible {
                reason: "read tracking is disabled",
            });
        }
        if !self.config.blocking_allowed {
            return Err(StmError::NoRetryPossible {
                reason: "blocking is not allowed",
            });
        }
        if self.attached.is_empty() {
            return Err(StmError::NoRetryPossible {
                reason: "nothing was read",
            });
        }
        Err(StmError::Retry)
    }

    /// Run `first`; if it requests a retry, undo its writes and run `second`.
    ///
    /// Reads made by `first` stay tracked, so when both alternatives retry the
    /// transaction waits on everything either of them read.
    pub fn or_else<R, F, G>(&mut self, first: F, second: G) -> Result<R, StmError>
    where
        F: FnOnce(&mut Self) -> Result<R, StmError>,
        G: FnOnce(&mut Self) -> Result<R, StmError>,
    {
        self.ensure_active()?;
        let snapshots = self.attached.snapshot();
        match first(self) {
            Err(StmError::Retry) => {
                trace!(txn = self.id, "first alternative retried, running second");
                self.attached.restore(snapshots);
                second(self)
            }
            other => other,
        }
    }

    /// Make every later commit of this attempt fail with [`StmError::AbortOnly`].
    pub fn set_abort_only(&mut self) -> Result<(), StmError> {
        if !self.status.is_alive() {
            return Err(StmError::DeadTransaction {
                txn: self.id,
                status: self.status,
            });
        }
        self.abort_only = true;
        Ok(())
    }

    /// Schedule a side effect to run only if this attempt commits.
    ///
    /// Runs after all locks are released.
    pub fn on_commit<F>(&mut self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.post_commit_hooks.push(Box::new(f));
    }

    /// Schedule a side effect to run only if this attempt aborts, including
    /// when the transaction is dropped without committing.
    pub fn on_rollback<F>(&mut self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.post_rollback_hooks.push(Box::new(f));
    }

    /// Lock and validate everything commit needs, moving to `Prepared`.
    ///
    /// On failure the attempt is aborted and no lock remains held.
    pub fn prepare(&mut self) -> Result<(), StmError> {
        match self.status {
            TxnStatus::Active => {}
            TxnStatus::Prepared => return Ok(()),
            status => {
                return Err(StmError::DeadTransaction {
                    txn: self.id,
                    status,
                });
            }
        }
        if self.abort_only {
            self.abort_quietly();
            return Err(StmError::AbortOnly { txn: self.id });
        }
        if let Err(err) = self.lock_and_validate() {
            debug!(txn = self.id, attempt = self.attempt, error = %err, "prepare failed");
            self.abort_quietly();
            return Err(err);
        }
        self.status = TxnStatus::Prepared;
        Ok(())
    }

    fn lock_and_validate(&mut self) -> Result<(), StmError> {
        let dirty_check = self.config.dirty_check;
        // A transaction that writes nothing read a consistent snapshot and is done.
        if !self.attached.iter().any(|e| e.needs_write(dirty_check)) {
            return Ok(());
        }

        let lock_reads = self.config.isolation == IsolationLevel::Serializable;
        let mut requests: Vec<LockRequest> = self
            .attached
            .iter()
            .filter_map(|entry| {
                entry
                    .commit_lock(dirty_check, lock_reads)
                    .map(|mode| LockRequest::new(entry.handle(), mode))
            })
            .collect();
        requests.sort_by_key(|request| request.object.id());

        if !self.config.lock_policy.try_acquire_all(&requests, self.id) {
            // Policies unwind on failure; release again so a faulty one can't leak.
            release_acquired(&requests, requests.len(), self.id);
            return Err(StmError::LockNotAcquired { txn: self.id });
        }
        self.locked = requests.into_iter().map(|request| request.object).collect();

        for entry in self.attached.iter() {
            if entry.commit_lock(dirty_check, lock_reads).is_some() {
                entry.validate()?;
            }
        }
        // Commuting functions run against the locked records, before the clock
        // ticks. A failing function leaves nothing published.
        for entry in self.attached.iter_mut() {
            entry.fixate()?;
        }
        Ok(())
    }

    /// Commit the transaction.
    ///
    /// Committing twice is a no-op; committing an aborted transaction fails.
    pub fn commit(&mut self) -> Result<(), StmError> {
        match self.status {
            TxnStatus::Committed => return Ok(()),
            TxnStatus::Aborted => {
                return Err(StmError::DeadTransaction {
                    txn: self.id,
                    status: TxnStatus::Aborted,
                });
            }
            TxnStatus::Active => self.prepare()?,
            TxnStatus::Prepared => {
                if self.abort_only {
                    self.abort_quietly();
                    return Err(StmError::AbortOnly { txn: self.id });
                }
            }
        }

        let dirty_check = self.config.dirty_check;
        if self.attached.iter().any(|e| e.needs_write(dirty_check)) {
            let version = self.stm.clock().tick();
            let mut written = 0usize;
            for entry in self.attached.iter_mut() {
                if entry.needs_write(dirty_check) {
                    entry.publish(version);
                    written += 1;
                }
            }
            trace!(txn = self.id, version, written, "committed");
        }

        self.release_locks();
        self.status = TxnStatus::Committed;
        self.attached.clear();
        self.post_rollback_hooks.clear();
        for hook in std::mem::take(&mut self.post_commit_hooks) {
            hook();
        }
        Ok(())
    }

    /// Abort the transaction. Aborting twice is a no-op.
    pub fn abort(&mut self) -> Result<(), StmError> {
        match self.status {
            TxnStatus::Aborted => Ok(()),
            TxnStatus::Committed => Err(StmError::DeadTransaction {
                txn: self.id,
                status: TxnStatus::Committed,
            }),
            TxnStatus::Active | TxnStatus::Prepared => {
                self.abort_quietly();
                Ok(())
            }
        }
    }

    pub(crate) fn abort_quietly(&mut self) {
        if !self.status.is_alive() {
            return;
        }
        self.release_locks();
        self.attached.clear();
        self.untracked.clear();
        self.status = TxnStatus::Aborted;
        self.post_commit_hooks.clear();
        trace!(txn = self.id, attempt = self.attempt, "aborted");
        for hook in std::mem::take(&mut self.post_rollback_hooks) {
            hook();
        }
    }

    fn release_locks(&mut self) {
        for object in self.locked.drain(..) {
            object.release_lock(self.id);
        }
    }

    /// Block until an object this attempt observed is changed by a commit.
    ///
    /// Returns right away when one already moved past the observed version.
    pub(crate) fn await_change(&mut self) -> Result<(), StmError> {
        if let (Some(deadline), Some(timeout)) = (self.deadline, self.config.timeout) {
            if Instant::now() >= deadline {
                return Err(StmError::RetryTimeout {
                    waited_ms: timeout.as_millis(),
                });
            }
        }
        let era = self.latch.reset();
        let mut registered = 0usize;
        for entry in self.attached.iter() {
            let Some(version) = entry.observed_version() else {
                continue;
            };
            match entry.handle().register_waiter(&self.latch, era, version) {
                Registration::OpenedImmediately => {
                    debug!(txn = self.id, object = entry.object_id(), "retry woken before blocking");
                    return Ok(());
                }
                Registration::Registered => registered += 1,
                Registration::NotApplicable => {}
            }
        }
        if registered == 0 {
            return Err(StmError::NoRetryPossible {
                reason: "no committed object to wait on",
            });
        }

        debug!(txn = self.id, registered, "blocking retry");
        let started = Instant::now();
        match self
            .latch
            .await_open(era, self.deadline, self.config.interruptible)
        {
            AwaitOutcome::Opened => Ok(()),
            AwaitOutcome::TimedOut => Err(StmError::RetryTimeout {
                waited_ms: started.elapsed().as_millis(),
            }),
            AwaitOutcome::Interrupted => Err(StmError::RetryInterrupted),
        }
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        self.abort_quietly();
    }
}

impl fmt::Debug for Transaction<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("family", &self.config.family)
            .field("status", &self.status)
            .field("read_version", &self.read_version)
            .field("attempt", &self.attempt)
            .field("readonly", &self.readonly)
            .field("attached", &self.attached.len())
            .field("storage", &self.attached.kind())
            .finish()
    }
}

/// Shortcuts for the common operations on a single object.
impl<T: Tracked> TxnObject<T> {
    pub fn get(&self, tx: &mut Transaction<'_>) -> Result<T, StmError> {
        tx.read(self)
    }

    pub fn set(&self, tx: &mut Transaction<'_>, value: T) -> Result<(), StmError> {
        *tx.open_for_write(self)? = value;
        Ok(())
    }

    /// Replace the value with `f(value)` and return the new value.
    pub fn alter<F>(&self, tx: &mut Transaction<'_>, f: F) -> Result<T, StmError>
    where
        F: FnOnce(T) -> T,
    {
        let draft = tx.open_for_write(self)?;
        let next = f(draft.clone());
        *draft = next.clone();
        Ok(next)
    }

    /// Set a new value and return the previous one.
    pub fn get_and_set(&self, tx: &mut Transaction<'_>, value: T) -> Result<T, StmError> {
        let draft = tx.open_for_write(self)?;
        Ok(std::mem::replace(draft, value))
    }

    pub fn commute<F>(&self, tx: &mut Transaction<'_>, f: F) -> Result<(), StmError>
    where
        F: Fn(&mut T) + Send + Sync + 'static,
    {
        tx.open_for_commuting_write(self, f)
    }

    /// Block (retry) until `predicate` holds for the value.
    pub fn await_until<P>(&self, tx: &mut Transaction<'_>, predicate: P) -> Result<(), StmError>
    where
        P: FnOnce(&T) -> bool,
    {
        if predicate(tx.open_for_read(self)?) {
            Ok(())
        } else {
            tx.retry()
        }
    }

    /// Read through the transaction bound to the current thread.
    pub fn ambient_get(&self) -> Result<T, StmError> {
        crate::context::with_current(|tx| tx.read(self))
    }

    /// Write through the transaction bound to the current thread.
    pub fn ambient_set(&self, value: T) -> Result<(), StmError> {
        crate::context::with_current(|tx| self.set(tx, value))
    }
}
