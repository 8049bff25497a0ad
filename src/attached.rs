//! The attached set: every object a transaction opened, with its staging state.
//!
//! Entries are type-erased behind [`Entry`] so one transaction can hold objects
//! of different value types. Storage starts as a single slot, grows to a
//! linear-scan array and finally to a hash-indexed array, depending on the
//! family's [`SpeculativeProfile`].

use foldhash::HashMap;
use std::any::Any;
use std::mem;
use std::sync::Arc;

use crate::errors::StmError;
use crate::object::{LockMode, ObjectCore, ObjectHandle};
use crate::speculative::{SpeculativeProfile, StorageKind};
use crate::tranlocal::{Tracked, Tranlocal};

/// Deferred, order-independent update of a commuting write.
pub(crate) type CommuteFn<T> = Arc<dyn Fn(&mut T) + Send + Sync>;

/// Staging state of one attached object.
pub(crate) enum SlotState<T> {
    /// Frozen record the transaction read.
    Read(Arc<Tranlocal<T>>),
    /// Mutable draft. Without origin it constructs the object.
    Write(Tranlocal<T>),
    /// Pending commuting functions; no read dependency yet.
    Commute(Vec<CommuteFn<T>>),
}

pub(crate) struct Slot<T> {
    pub(crate) core: Arc<ObjectCore<T>>,
    pub(crate) state: SlotState<T>,
}

enum SlotSnapshot<T> {
    Read,
    Write(T),
    Commute(Vec<CommuteFn<T>>),
}

/// Type-erased attached object.
pub(crate) trait Entry: Any {
    fn object_id(&self) -> u64;

    fn handle(&self) -> Arc<dyn ObjectHandle>;

    /// Lock mode needed at commit, `None` when the entry needs no lock.
    fn commit_lock(&self, dirty_check: bool, lock_reads: bool) -> Option<LockMode>;

    /// Whether commit publishes this entry.
    fn needs_write(&self, dirty_check: bool) -> bool;

    /// Whether the record this entry depends on is still the published one.
    fn validate(&self) -> Result<(), StmError>;

    /// Version of the record the transaction saw, for blocking registration.
    fn observed_version(&self) -> Option<u64>;

    /// Apply pending commuting functions to the record published now, turning
    /// them into a draft. Caller holds the exclusive commit lock.
    fn fixate(&mut self) -> Result<(), StmError>;

    /// Publish the staged state at `version`. Caller holds the commit lock and
    /// has fixated the entry; no user code runs here.
    fn publish(&mut self, version: u64);

    fn snapshot(&self) -> Box<dyn Any>;

    /// Roll back to `snapshot` (taken by [`Entry::snapshot`]), or to the state
    /// before the entry was attached when `None`. Returns `false` when the entry
    /// should be detached.
    fn restore(&mut self, snapshot: Option<Box<dyn Any>>) -> bool;

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Tracked> Slot<T> {
    pub(crate) fn new(core: Arc<ObjectCore<T>>, state: SlotState<T>) -> Self {
        Self { core, state }
    }

    /// Draft to write through, converting a read or a commuting write.
    ///
    /// Pending commuting functions are applied on top of `fixated`, the
    /// record the transaction now depends on.
    pub(crate) fn upgrade_to_write(
        &mut self,
        fixated: Option<Arc<Tranlocal<T>>>,
    ) -> Result<&mut T, StmError> {
        let object = self.core.id();
        let state = mem::replace(&mut self.state, SlotState::Commute(Vec::new()));
        let draft = match state {
            SlotState::Write(draft) => draft,
            SlotState::Read(record) => record.clone_for_update(),
            SlotState::Commute(pending) => {
                let Some(origin) = fixated else {
                    self.state = SlotState::Commute(pending);
                    return Err(StmError::UncommittedRead { object });
                };
                let mut draft = origin.clone_for_update();
                for f in &pending {
                    f(draft.value_mut());
                }
                draft
            }
        };
        self.state = SlotState::Write(draft);
        let SlotState::Write(draft) = &mut self.state else {
            unreachable!("state was just set to a draft");
        };
        Ok(draft.value_mut())
    }

    pub(crate) fn value(&self) -> Option<&T> {
        match &self.state {
            SlotState::Read(record) => Some(record.value()),
            SlotState::Write(draft) => Some(draft.value()),
            SlotState::Commute(_) => None,
        }
    }

    pub(crate) fn is_commute(&self) -> bool {
        matches!(self.state, SlotState::Commute(_))
    }
}

impl<T: Tracked> Entry for Slot<T> {
    fn object_id(&self) -> u64 {
        self.core.id()
    }

    fn handle(&self) -> Arc<dyn ObjectHandle> {
        self.core.clone()
    }

    fn commit_lock(&self, dirty_check: bool, lock_reads: bool) -> Option<LockMode> {
        if self.needs_write(dirty_check) {
            Some(LockMode::Exclusive)
        } else if lock_reads && !self.is_commute() {
            Some(LockMode::Write)
        } else {
            None
        }
    }

    fn needs_write(&self, dirty_check: bool) -> bool {
        match &self.state {
            SlotState::Read(_) => false,
            SlotState::Write(draft) => !dirty_check || draft.is_dirty(),
            SlotState::Commute(pending) => !pending.is_empty(),
        }
    }

    fn validate(&self) -> Result<(), StmError> {
        let current = match &self.state {
            SlotState::Read(record) => self.core.is_published(Some(record)),
            SlotState::Write(draft) => self.core.is_published(draft.origin()),
            // Commuting writes have no read dependency, but need a record to apply to.
            SlotState::Commute(_) => {
                return match self.core.load_published() {
                    Some(_) => Ok(()),
                    None => Err(StmError::UncommittedRead {
                        object: self.core.id(),
                    }),
                };
            }
        };
        if current {
            Ok(())
        } else {
            Err(StmError::WriteConflict {
                object: self.core.id(),
            })
        }
    }

    fn observed_version(&self) -> Option<u64> {
        match &self.state {
            SlotState::Read(record) => Some(record.write_version()),
            SlotState::Write(draft) => draft.origin().map(|origin| origin.write_version()),
            SlotState::Commute(_) => None,
        }
    }

    fn fixate(&mut self) -> Result<(), StmError> {
        if !self.is_commute() {
            return Ok(());
        }
        let current = self.core.load_published();
        self.upgrade_to_write(current).map(|_| ())
    }

    fn publish(&mut self, version: u64) {
        let state = mem::replace(&mut self.state, SlotState::Commute(Vec::new()));
        let draft = match state {
            SlotState::Write(draft) => draft,
            other => {
                debug_assert!(
                    matches!(other, SlotState::Read(_)),
                    "commuting write published before fixation"
                );
                self.state = other;
                return;
            }
        };
        let record = self.core.publish(draft, version);
        self.state = SlotState::Read(record);
    }

    fn snapshot(&self) -> Box<dyn Any> {
        let snapshot = match &self.state {
            SlotState::Read(_) => SlotSnapshot::<T>::Read,
            SlotState::Write(draft) => SlotSnapshot::Write(draft.take_snapshot()),
            SlotState::Commute(pending) => SlotSnapshot::Commute(pending.clone()),
        };
        Box::new(snapshot)
    }

    fn restore(&mut self, snapshot: Option<Box<dyn Any>>) -> bool {
        let snapshot = snapshot
            .and_then(|s| s.downcast::<SlotSnapshot<T>>().ok())
            .map(|s| *s);
        match snapshot {
            Some(SlotSnapshot::Write(value)) => {
                if let SlotState::Write(draft) = &mut self.state {
                    draft.restore(value);
                }
                true
            }
            Some(SlotSnapshot::Commute(pending)) => {
                self.state = SlotState::Commute(pending);
                true
            }
            Some(SlotSnapshot::Read) | None => {
                // Written since: fall back to the record that was read, if any.
                let origin = match &self.state {
                    SlotState::Read(_) => return true,
                    SlotState::Write(draft) => draft.origin().cloned(),
                    SlotState::Commute(_) => None,
                };
                match origin {
                    Some(origin) => {
                        self.state = SlotState::Read(origin);
                        true
                    }
                    None => false,
                }
            }
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Attached objects of one transaction, indexed by object id.
pub(crate) struct AttachedSet {
    entries: Vec<Box<dyn Entry>>,
    index: Option<HashMap<u64, usize>>,
    kind: StorageKind,
    array_limit: usize,
    /// Present when the family sizes its storage speculatively.
    profile: Option<Arc<SpeculativeProfile>>,
}

impl AttachedSet {
    pub(crate) fn new(
        kind: StorageKind,
        array_limit: usize,
        profile: Option<Arc<SpeculativeProfile>>,
    ) -> Self {
        let mut set = Self {
            entries: Vec::new(),
            index: None,
            kind: StorageKind::Mono,
            array_limit: array_limit.max(1),
            profile,
        };
        set.switch_to(kind);
        set
    }

    pub(crate) fn kind(&self) -> StorageKind {
        self.kind
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn capacity(&self) -> usize {
        match self.kind {
            StorageKind::Mono => 1,
            StorageKind::FixedArray => self.array_limit,
            StorageKind::Map => usize::MAX,
        }
    }

    fn switch_to(&mut self, kind: StorageKind) {
        self.kind = kind;
        if kind == StorageKind::Map {
            let index = self
                .entries
                .iter()
                .enumerate()
                .map(|(idx, entry)| (entry.object_id(), idx))
                .collect();
            self.index = Some(index);
        } else {
            self.index = None;
        }
    }

    /// Position of the entry for `object`.
    pub(crate) fn position(&self, object: u64) -> Option<usize> {
        match &self.index {
            Some(index) => index.get(&object).copied(),
            None => self.entries.iter().position(|e| e.object_id() == object),
        }
    }

    pub(crate) fn at_mut(&mut self, idx: usize) -> &mut Box<dyn Entry> {
        &mut self.entries[idx]
    }

    /// Attach a new entry and return its position.
    ///
    /// When the storage is full a speculative family fails with
    /// [`StmError::SpeculativeFailure`] after growing its profile; otherwise the
    /// storage grows in place.
    pub(crate) fn push(&mut self, entry: Box<dyn Entry>) -> Result<usize, StmError> {
        debug_assert!(self.position(entry.object_id()).is_none());
        if self.entries.len() >= self.capacity() {
            if let Some(profile) = &self.profile {
                profile.grow_storage(self.kind);
                return Err(StmError::SpeculativeFailure);
            }
            let next = match self.kind {
                StorageKind::Mono if self.array_limit > 1 => StorageKind::FixedArray,
                _ => StorageKind::Map,
            };
            self.switch_to(next);
        }
        let idx = self.entries.len();
        if let Some(index) = &mut self.index {
            index.insert(entry.object_id(), idx);
        }
        self.entries.push(entry);
        Ok(idx)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &dyn Entry> {
        self.entries.iter().map(|e| &**e)
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut Box<dyn Entry>> {
        self.entries.iter_mut()
    }

    /// Snapshots of every entry, keyed by object id.
    pub(crate) fn snapshot(&self) -> HashMap<u64, Box<dyn Any>> {
        self.entries
            .iter()
            .map(|e| (e.object_id(), e.snapshot()))
            .collect()
    }

    /// Roll every entry back to `snapshots`; entries attached since are
    /// detached unless they only read.
    pub(crate) fn restore(&mut self, mut snapshots: HashMap<u64, Box<dyn Any>>) {
        self.entries
            .retain_mut(|entry| entry.restore(snapshots.remove(&entry.object_id())));
        let kind = self.kind;
        self.switch_to(kind);
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
        if let Some(index) = &mut self.index {
            index.clear();
        }
    }

    /// Clear and adopt a (possibly grown) storage kind for the next attempt.
    pub(crate) fn reset(&mut self, kind: StorageKind) {
        self.clear();
        self.switch_to(kind);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::TxnObject;

    fn read_entry(obj: &TxnObject<i64>) -> Box<dyn Entry> {
        let record = obj.core.load_published().unwrap();
        Box::new(Slot::new(obj.core.clone(), SlotState::Read(record)))
    }

    fn write_entry(obj: &TxnObject<i64>, value: i64) -> Box<dyn Entry> {
        let mut draft = obj.core.load_published().unwrap().clone_for_update();
        *draft.value_mut() = value;
        Box::new(Slot::new(obj.core.clone(), SlotState::Write(draft)))
    }

    #[test]
    fn test_non_speculative_set_grows_in_place() {
        let objects: Vec<_> = (0..5).map(|i| TxnObject::committed(i, 1)).collect();
        let mut set = AttachedSet::new(StorageKind::Mono, 2, None);

        for obj in &objects {
            set.push(read_entry(obj)).unwrap();
        }
        assert_eq!(set.kind(), StorageKind::Map);
        assert_eq!(set.len(), 5);
        for obj in &objects {
            let idx = set.position(obj.id()).unwrap();
            assert_eq!(set.at_mut(idx).object_id(), obj.id());
        }
    }

    #[test]
    fn test_speculative_overflow_grows_profile() {
        let a = TxnObject::committed(1i64, 1);
        let b = TxnObject::committed(2i64, 1);
        let profile = Arc::new(SpeculativeProfile::lean("overflow"));
        let mut set = AttachedSet::new(StorageKind::Mono, 4, Some(profile.clone()));

        set.push(read_entry(&a)).unwrap();
        assert!(matches!(
            set.push(read_entry(&b)),
            Err(StmError::SpeculativeFailure)
        ));
        assert_eq!(profile.storage(), StorageKind::FixedArray);

        set.reset(profile.storage());
        set.push(read_entry(&a)).unwrap();
        set.push(read_entry(&b)).unwrap();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_commit_lock_modes() {
        let obj = TxnObject::committed(1i64, 1);
        let read = read_entry(&obj);
        assert_eq!(read.commit_lock(true, false), None);
        assert_eq!(read.commit_lock(true, true), Some(LockMode::Write));

        // Writing the same value is not a write when dirty checking.
        let same = write_entry(&obj, 1);
        assert!(!same.needs_write(true));
        assert!(same.needs_write(false));
        assert_eq!(same.commit_lock(false, false), Some(LockMode::Exclusive));

        let changed = write_entry(&obj, 2);
        assert_eq!(changed.commit_lock(true, false), Some(LockMode::Exclusive));
    }

    #[test]
    fn test_validate_detects_newer_record() {
        let obj = TxnObject::committed(1i64, 1);
        let read = read_entry(&obj);
        assert!(read.validate().is_ok());

        let mut other = write_entry(&obj, 5);
        assert!(obj.core.try_acquire_lock(42, LockMode::Exclusive));
        other.publish(2);
        obj.core.release_lock(42);

        assert!(matches!(
            read.validate(),
            Err(StmError::WriteConflict { .. })
        ));
        assert_eq!(read.observed_version(), Some(1));
        assert_eq!(other.observed_version(), Some(2));
    }

    #[test]
    fn test_restore_rolls_back_drafts_and_detaches_new_entries() {
        let a = TxnObject::committed(1i64, 1);
        let b = TxnObject::committed(2i64, 1);
        let c: TxnObject<i64> = TxnObject::unborn();
        let mut set = AttachedSet::new(StorageKind::Map, 4, None);

        let idx = set.push(write_entry(&a, 10)).unwrap();
        let snapshots = set.snapshot();

        // Changes made after the snapshot.
        let slot = set.at_mut(idx).as_any_mut().downcast_mut::<Slot<i64>>().unwrap();
        *slot.upgrade_to_write(None).unwrap() = 11;
        set.push(write_entry(&b, 20)).unwrap();
        set.push(Box::new(Slot::new(
            c.core.clone(),
            SlotState::Write(Tranlocal::constructing(3)),
        )))
        .unwrap();

        set.restore(snapshots);
        assert_eq!(set.len(), 2);
        assert!(set.position(c.id()).is_none());

        let idx = set.position(a.id()).unwrap();
        let slot = set.at_mut(idx).as_any_mut().downcast_mut::<Slot<i64>>().unwrap();
        assert_eq!(slot.value(), Some(&10));

        // `b` is still tracked, but only as a read.
        let idx = set.position(b.id()).unwrap();
        assert!(!set.at_mut(idx).needs_write(false));
        assert_eq!(set.at_mut(idx).observed_version(), Some(1));
    }
}
