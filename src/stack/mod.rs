/*!
 * Lock-Free Stack
 * Reference RCU client: CAS loops under reader locks, deferred node reclaim
 *
 * Every operation wraps its pointer work in a read-side critical section.
 * The reader lock is what defeats the ABA problem on the head CAS: if the
 * head still equals the value loaded at the top of the loop, the node was
 * never popped and destroyed in between, because destruction waits for a
 * grace period and this thread's critical section holds the grace period
 * open. Popped nodes go to the embedded [`Collector`]; nothing frees a
 * node on the pop path itself.
 */

use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

use crossbeam_utils::CachePadded;

use crate::rcu::RcuManager;
use crate::reclaim::{Collector, Reclaimable};

struct StackNode<T> {
    /// Successor while linked; intake link once discarded.
    next: AtomicPtr<StackNode<T>>,
    value: T,
}

impl<T: Send + Sync + 'static> Reclaimable for StackNode<T> {
    fn reclaim_next(&self) -> &AtomicPtr<Self> {
        &self.next
    }
}

/// A lock-free stack protected by RCU.
///
/// Push, pop, and lookup are non-blocking CAS loops. Nodes removed by
/// [`pop`](Self::pop) are handed to a background reclaimer and destroyed
/// only after a grace period, so concurrent traversals never observe freed
/// memory.
///
/// Every thread that touches the stack (including the constructor's
/// caller) must be registered with the manager passed to
/// [`new`](Self::new), and the manager must be process-registered.
pub struct RcuStack<T: Clone + Send + Sync + 'static> {
    head: CachePadded<AtomicPtr<StackNode<T>>>,
    collector: Collector<StackNode<T>>,
    manager: RcuManager,
}

impl<T: Clone + Send + Sync + 'static> RcuStack<T> {
    pub fn new(manager: RcuManager) -> Self {
        Self {
            head: CachePadded::new(AtomicPtr::new(ptr::null_mut())),
            collector: Collector::new(manager.clone()),
            manager,
        }
    }

    /// Push a value onto the stack.
    pub fn push(&self, value: T) {
        let node = Box::into_raw(Box::new(StackNode {
            next: AtomicPtr::new(ptr::null_mut()),
            value,
        }));

        loop {
            let guard = self.manager.read_guard();
            let head = self.head.load(Ordering::Acquire);
            // SAFETY: the node is not yet published; this thread owns it.
            unsafe { (*node).next.store(head, Ordering::Relaxed) };
            let pushed = self
                .head
                .compare_exchange_weak(head, node, Ordering::Release, Ordering::Relaxed)
                .is_ok();
            drop(guard);
            if pushed {
                return;
            }
        }
    }

    /// Pop the most recently pushed value, or `None` when empty.
    pub fn pop(&self) -> Option<T> {
        loop {
            let guard = self.manager.read_guard();
            let head = self.head.load(Ordering::Acquire);
            if head.is_null() {
                return None;
            }
            // SAFETY: the reader lock keeps `head` alive even if another
            // thread pops it concurrently.
            let next = unsafe { (*head).next.load(Ordering::Relaxed) };
            let popped = self
                .head
                .compare_exchange_weak(head, next, Ordering::Release, Ordering::Relaxed)
                .is_ok();
            drop(guard);
            if popped {
                // This thread now exclusively owns the detachment; readers
                // may still be traversing the node, so the value is cloned
                // out rather than moved and destruction is deferred.
                let value = unsafe { (*head).value.clone() };
                // SAFETY: detached by the CAS above, owned by this thread.
                unsafe { self.collector.discard(head) };
                return Some(value);
            }
        }
    }

    /// Whether `value` is currently on the stack.
    ///
    /// The whole traversal runs in one read-side critical section; entries
    /// pushed or popped concurrently may or may not be observed.
    pub fn contains(&self, value: &T) -> bool
    where
        T: PartialEq,
    {
        let _guard = self.manager.read_guard();
        let mut cursor = self.head.load(Ordering::Acquire);
        while !cursor.is_null() {
            // SAFETY: reachable nodes are not destroyed while the guard is
            // live.
            let node = unsafe { &*cursor };
            if node.value == *value {
                return true;
            }
            cursor = node.next.load(Ordering::Acquire);
        }
        false
    }

    /// Total nodes destroyed by the embedded reclaimer so far.
    pub fn reclaimed(&self) -> u64 {
        self.collector.reclaimed()
    }
}

impl<T: Clone + Send + Sync + 'static> Drop for RcuStack<T> {
    fn drop(&mut self) {
        // Exclusive access: no reader can exist once we hold &mut self.
        // Nodes still linked are freed directly; nodes already discarded
        // belong to the collector, which drains when its field drops.
        let mut node = self.head.swap(ptr::null_mut(), Ordering::Relaxed);
        while !node.is_null() {
            // SAFETY: the list is unshared here and each node was allocated
            // with Box::new in push.
            let next = unsafe { (*node).next.load(Ordering::Relaxed) };
            drop(unsafe { Box::from_raw(node) });
            node = next;
        }
    }
}
