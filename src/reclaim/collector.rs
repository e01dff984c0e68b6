/*!
 * Deferred Reclaimer
 * Background destruction of nodes detached from RCU-protected structures
 *
 * # Design
 *
 * Producers push detached nodes onto a Treiber-style intake stack threaded
 * through an atomic link embedded in the node itself. A dedicated worker
 * thread repeatedly captures the entire intake list, waits out one grace
 * period for the whole batch, and only then destroys the nodes. The intake
 * CAS loops run under reader locks, which is what makes them ABA-safe: a
 * head pointer that was popped and re-pushed would first have to be
 * destroyed, and destruction cannot happen while any reader lock is held.
 *
 * # Layout
 *
 * The intake head and the stop flag sit on their own cache lines so that
 * the hot producer path does not false-share with shutdown state.
 */

use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_utils::CachePadded;
use log::{debug, info, warn};

use crate::rcu::RcuManager;

/// A node the collector can destroy.
///
/// Implementors embed one atomic self-link the collector may use freely
/// once the node has been discarded. A pointer-graph node can reuse its
/// existing link field; after detachment the structure no longer owns it.
pub trait Reclaimable: Send + 'static {
    /// The intake link. Only the collector touches it after `discard`.
    fn reclaim_next(&self) -> &AtomicPtr<Self>
    where
        Self: Sized;
}

/// Configuration for a [`Collector`].
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// Worker sleep between empty intake checks.
    pub poll_interval: Duration,
    /// Name of the worker thread.
    pub thread_name: String,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1),
            thread_name: "rcu-reclaimer".into(),
        }
    }
}

struct CollectorShared<T: Reclaimable> {
    /// Head of the intake stack. Multi-producer, single-consumer.
    intake: CachePadded<AtomicPtr<T>>,
    /// Set once by `join`; observed by the worker at the top of each cycle.
    stop: CachePadded<AtomicBool>,
    reclaimed: AtomicU64,
    manager: RcuManager,
    poll_interval: Duration,
}

impl<T: Reclaimable> CollectorShared<T> {
    /// Push one detached node onto the intake stack.
    ///
    /// Runs under a reader lock so an equal head pointer in the CAS implies
    /// an identical intake list, not a freed-and-reallocated node.
    fn push(&self, node: *mut T) {
        loop {
            let guard = self.manager.read_guard();
            let head = self.intake.load(Ordering::Acquire);
            // SAFETY: the caller of discard transferred ownership; no other
            // thread writes this node's link until it reaches the worker.
            unsafe { (*node).reclaim_next().store(head, Ordering::Relaxed) };
            let pushed = self
                .intake
                .compare_exchange_weak(head, node, Ordering::Release, Ordering::Relaxed)
                .is_ok();
            drop(guard);
            if pushed {
                return;
            }
        }
    }

    /// Detach the entire intake list, leaving the stack empty.
    fn capture(&self) -> *mut T {
        loop {
            let guard = self.manager.read_guard();
            let head = self.intake.load(Ordering::Acquire);
            if head.is_null() {
                return ptr::null_mut();
            }
            let captured = self
                .intake
                .compare_exchange(head, ptr::null_mut(), Ordering::AcqRel, Ordering::Relaxed)
                .is_ok();
            drop(guard);
            if captured {
                return head;
            }
        }
    }
}

/// Destroy every node on a captured intake list.
///
/// # Safety
///
/// `node` must be the head of a list captured from the intake stack after a
/// grace period has elapsed since every node on it was discarded, so that
/// no reader can still reference any of them. Each node must have been
/// allocated with `Box::new`.
unsafe fn destroy_list<T: Reclaimable>(mut node: *mut T) -> u64 {
    let mut destroyed = 0;
    while !node.is_null() {
        let next = (*node).reclaim_next().load(Ordering::Relaxed);
        drop(Box::from_raw(node));
        node = next;
        destroyed += 1;
    }
    destroyed
}

fn worker_loop<T: Reclaimable>(shared: Arc<CollectorShared<T>>) {
    // The worker is itself a reader: its intake CAS loops need the same
    // ABA protection as the producers'.
    shared.manager.register_thread();
    debug!("reclaimer worker started");

    loop {
        let stopping = shared.stop.load(Ordering::Acquire);

        let batch = shared.capture();
        if batch.is_null() {
            if stopping {
                break;
            }
            thread::sleep(shared.poll_interval);
            continue;
        }

        shared.manager.synchronize();
        // SAFETY: every node on the batch was unreachable before the grace
        // period above began.
        let destroyed = unsafe { destroy_list(batch) };
        shared.reclaimed.fetch_add(destroyed, Ordering::Relaxed);

        if stopping {
            break;
        }
    }

    shared.manager.unregister_thread();
    info!(
        "reclaimer worker stopped ({} nodes reclaimed)",
        shared.reclaimed.load(Ordering::Relaxed)
    );
}

/// Asynchronous reclaimer for one node type.
///
/// Producers hand detached nodes to [`discard`](Self::discard); a
/// background worker batches them, waits one grace period per batch, and
/// destroys them. Dropping the collector (or calling
/// [`join`](Self::join)) drains the remaining intake with a final grace
/// period before the worker exits.
pub struct Collector<T: Reclaimable> {
    shared: Arc<CollectorShared<T>>,
    worker: Option<JoinHandle<()>>,
}

impl<T: Reclaimable> Collector<T> {
    /// Spawn a collector whose worker registers with `manager`.
    ///
    /// The manager must already be process-registered; the worker calls
    /// [`RcuManager::synchronize`] for every batch.
    pub fn new(manager: RcuManager) -> Self {
        Self::with_config(manager, CollectorConfig::default())
    }

    pub fn with_config(manager: RcuManager, config: CollectorConfig) -> Self {
        let shared = Arc::new(CollectorShared {
            intake: CachePadded::new(AtomicPtr::new(ptr::null_mut())),
            stop: CachePadded::new(AtomicBool::new(false)),
            reclaimed: AtomicU64::new(0),
            manager,
            poll_interval: config.poll_interval,
        });

        let worker = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name(config.thread_name)
                .spawn(move || worker_loop(shared))
                .expect("failed to spawn reclaimer worker")
        };

        Self {
            shared,
            worker: Some(worker),
        }
    }

    /// Hand a detached node to the collector.
    ///
    /// The calling thread must be registered with the collector's manager.
    /// The node is destroyed after a grace period that begins no earlier
    /// than this call; until then concurrent readers may still traverse it.
    ///
    /// # Safety
    ///
    /// `node` must point to a `Box`-allocated value the caller owns and has
    /// detached from every shared structure. This call is a move: the
    /// caller must not touch the node afterwards.
    pub unsafe fn discard(&self, node: *mut T) {
        debug_assert!(!node.is_null());
        self.shared.push(node);
    }

    /// Total nodes destroyed so far.
    pub fn reclaimed(&self) -> u64 {
        self.shared.reclaimed.load(Ordering::Relaxed)
    }

    /// Stop the worker and wait for it to drain the intake.
    ///
    /// No `discard` may run concurrently with or after this call. Calling
    /// `join` twice is a no-op; dropping the collector joins implicitly.
    pub fn join(&mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(worker) = self.worker.take() {
            self.shared.stop.store(true, Ordering::Release);
            if worker.join().is_err() {
                warn!("reclaimer worker panicked during shutdown");
            }
        }
    }
}

impl<T: Reclaimable> Drop for Collector<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountedNode {
        link: AtomicPtr<CountedNode>,
        live: Arc<AtomicUsize>,
    }

    impl CountedNode {
        fn new(live: &Arc<AtomicUsize>) -> *mut Self {
            live.fetch_add(1, Ordering::Relaxed);
            Box::into_raw(Box::new(Self {
                link: AtomicPtr::new(ptr::null_mut()),
                live: Arc::clone(live),
            }))
        }
    }

    impl Drop for CountedNode {
        fn drop(&mut self) {
            self.live.fetch_sub(1, Ordering::Relaxed);
        }
    }

    impl Reclaimable for CountedNode {
        fn reclaim_next(&self) -> &AtomicPtr<Self> {
            &self.link
        }
    }

    fn ready_manager() -> RcuManager {
        let rcu = RcuManager::new();
        rcu.register_process().expect("membarrier unavailable");
        rcu
    }

    #[test]
    fn test_join_drains_intake() {
        let rcu = ready_manager();
        rcu.register_thread();
        let mut collector = Collector::new(rcu.clone());

        let live = Arc::new(AtomicUsize::new(0));
        for _ in 0..100 {
            unsafe { collector.discard(CountedNode::new(&live)) };
        }

        collector.join();
        assert_eq!(live.load(Ordering::Relaxed), 0);
        assert_eq!(collector.reclaimed(), 100);
        rcu.unregister_thread();
    }

    #[test]
    fn test_drop_is_join() {
        let rcu = ready_manager();
        rcu.register_thread();
        let live = Arc::new(AtomicUsize::new(0));
        {
            let collector = Collector::new(rcu.clone());
            for _ in 0..32 {
                unsafe { collector.discard(CountedNode::new(&live)) };
            }
        }
        assert_eq!(live.load(Ordering::Relaxed), 0);
        rcu.unregister_thread();
    }
}
