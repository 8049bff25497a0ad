use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned, Shared};
use std::sync::Arc;
use std::sync::atomic::Ordering;

use crate::latch::Latch;

/// A registered waiter: the latch to open and the era it was registered in.
struct ListenerNode {
    latch: Arc<Latch>,
    era: u64,
    next: Atomic<ListenerNode>,
}

impl ListenerNode {
    /// No wait can be served by this node anymore.
    fn is_stale(&self) -> bool {
        Arc::strong_count(&self.latch) == 1 || self.latch.is_spent(self.era)
    }
}

/// Prepend-only list of waiters attached to one transactional object.
///
/// Registration CASes a new head in; a committing writer swaps the whole list
/// out and opens every latch. Nodes are immutable once linked, and drained nodes
/// are retired through the epoch collector. Registration also pops stale nodes
/// off the head, so an object that is never written again does not collect
/// one node per wait episode.
pub(crate) struct Listeners {
    head: Atomic<ListenerNode>,
}

impl Listeners {
    pub(crate) fn new() -> Self {
        Self {
            head: Atomic::null(),
        }
    }

    /// Prepend a waiter.
    pub(crate) fn push(&self, latch: Arc<Latch>, era: u64) {
        let guard = epoch::pin();
        self.prune_stale_head(&guard);
        let mut node = Owned::new(ListenerNode {
            latch,
            era,
            next: Atomic::null(),
        });
        loop {
            let head = self.head.load(Ordering::Acquire, &guard);
            node.next.store(head, Ordering::Relaxed);
            match self
                .head
                .compare_exchange(head, node, Ordering::SeqCst, Ordering::Acquire, &guard)
            {
                Ok(_) => return,
                Err(err) => node = err.new,
            }
        }
    }

    /// Pop stale nodes off the head until a live one, or a concurrent push or
    /// drain, is found.
    fn prune_stale_head(&self, guard: &Guard) {
        loop {
            let head = self.head.load(Ordering::Acquire, guard);
            let Some(node) = (unsafe { head.as_ref() }) else {
                return;
            };
            if !node.is_stale() {
                return;
            }
            let next = node.next.load(Ordering::Acquire, guard);
            if self
                .head
                .compare_exchange(head, next, Ordering::SeqCst, Ordering::Acquire, guard)
                .is_err()
            {
                return;
            }
            // SAFETY: the CAS unlinked the node; a drain can only reach it
            // through the head, which no longer points at it.
            unsafe { guard.defer_destroy(head) };
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        let guard = epoch::pin();
        self.head.load(Ordering::SeqCst, &guard).is_null()
    }

    /// Detach the whole list and open every latch on it. Returns how many were opened.
    pub(crate) fn open_all(&self) -> usize {
        let guard = epoch::pin();
        let mut current = self.head.swap(Shared::null(), Ordering::SeqCst, &guard);
        let mut opened = 0;
        while let Some(node) = unsafe { current.as_ref() } {
            node.latch.open(node.era);
            opened += 1;
            let next = node.next.load(Ordering::Acquire, &guard);
            // SAFETY: the swap made this thread the only owner of the detached chain.
            unsafe { guard.defer_destroy(current) };
            current = next;
        }
        opened
    }
}

impl Drop for Listeners {
    fn drop(&mut self) {
        // SAFETY: `&mut self` means no other thread can observe the list anymore.
        unsafe {
            let guard = epoch::unprotected();
            let mut current = self.head.load(Ordering::Relaxed, guard);
            while !current.is_null() {
                let next = current.deref().next.load(Ordering::Relaxed, guard);
                drop(current.into_owned());
                current = next;
            }
        }
    }
}
