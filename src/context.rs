//! Thread-local slot for the ambient transaction.
//!
//! Only [`TransactionFactory::execute`](crate::TransactionFactory::execute)
//! binds a transaction here; the explicit `&mut Transaction` API never does.

use std::cell::Cell;
use std::marker::PhantomData;
use std::ptr;

use crate::errors::StmError;
use crate::transaction::Transaction;

thread_local! {
    static CURRENT: Cell<*mut ()> = const { Cell::new(ptr::null_mut()) };
}

/// Keeps a transaction bound to the current thread until dropped.
pub(crate) struct Bound<'t> {
    previous: *mut (),
    _txn: PhantomData<&'t mut ()>,
}

/// Bind `txn` as the ambient transaction of this thread.
pub(crate) fn bind<'t>(txn: &'t mut Transaction<'_>) -> Bound<'t> {
    let raw = txn as *mut Transaction<'_> as *mut ();
    let previous = CURRENT.with(|slot| slot.replace(raw));
    Bound {
        previous,
        _txn: PhantomData,
    }
}

impl Drop for Bound<'_> {
    fn drop(&mut self) {
        CURRENT.with(|slot| slot.set(self.previous));
    }
}

/// Whether a transaction is bound to the current thread.
pub fn has_current() -> bool {
    CURRENT.with(|slot| !slot.get().is_null())
}

/// Unbind the ambient transaction, if any. The binding scope restores it when it ends.
pub fn clear() {
    CURRENT.with(|slot| slot.set(ptr::null_mut()));
}

/// Run `f` with the ambient transaction.
///
/// The slot is empty while `f` runs, so a nested call fails with
/// [`StmError::NoTransaction`] instead of aliasing the transaction.
pub fn with_current<R, F>(f: F) -> Result<R, StmError>
where
    F: FnOnce(&mut Transaction<'_>) -> Result<R, StmError>,
{
    let raw = CURRENT.with(|slot| slot.replace(ptr::null_mut()));
    if raw.is_null() {
        return Err(StmError::NoTransaction);
    }

    struct Restore(*mut ());
    impl Drop for Restore {
        fn drop(&mut self) {
            CURRENT.with(|slot| slot.set(self.0));
        }
    }
    let _restore = Restore(raw);

    // SAFETY: `raw` was stored by `bind` from a live `&mut Transaction` whose
    // borrow is held by the `Bound` guard, and the slot is emptied while lent out.
    let txn = unsafe { &mut *(raw as *mut Transaction<'_>) };
    f(txn)
}
