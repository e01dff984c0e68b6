/*!
 * RCU Manager
 * Reader registration, fence-free critical sections, and `synchronize`
 *
 * # Design
 *
 * Each registered thread owns a single packed counter word (see
 * `core::types`): the low 63 bits hold the read-lock nesting depth, the top
 * bit holds a snapshot of the global grace-period phase taken on outermost
 * entry. Readers mutate their counter with plain relaxed loads and stores
 * only. Writers toggle the phase bit of a global word and poll every
 * registered counter until each thread is either quiescent or provably
 * inside a critical section that began after the toggle.
 *
 * # Performance
 *
 * - `read_lock`/`read_unlock`: one thread-local access plus two relaxed
 *   atomic operations, no read-modify-write, no fence.
 * - `synchronize`: two process-wide barriers, two phase flips, and a
 *   bounded number of 1 ms polls per registered reader. Writers serialize
 *   on the registry mutex.
 */

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use log::{info, trace, warn};
use parking_lot::Mutex;

use crate::core::types::{is_quiescent, nesting, phase, GLOBAL_WORD_INIT, GRACE_PHASE_BIT};
use crate::membarrier;

use super::config::RcuConfig;
use super::guard::ReadGuard;
use super::registry::{ReaderEntry, Registry};

/// Polls of a single reader before logging a stall warning.
const STALL_WARN_POLLS: u32 = 1_000;

thread_local! {
    static THREAD_SLOT: ThreadSlot = const {
        ThreadSlot {
            counter: AtomicU64::new(0),
            registration: RefCell::new(None),
        }
    };
}

/// Per-thread reader state.
///
/// `counter` is the packed word observed by `synchronize`; `registration`
/// records which manager the thread is registered with and where its
/// registry slot is.
struct ThreadSlot {
    counter: AtomicU64,
    registration: RefCell<Option<Registration>>,
}

struct Registration {
    inner: Arc<ManagerInner>,
    index: usize,
}

impl Drop for ThreadSlot {
    fn drop(&mut self) {
        // A thread that exits while still registered would leave a dangling
        // counter pointer in the registry. Remove it here, before the
        // thread-local storage is released.
        if let Some(registration) = self.registration.borrow_mut().take() {
            debug_assert!(
                is_quiescent(self.counter.load(Ordering::Relaxed)),
                "thread exited while holding read locks"
            );
            warn!(
                "thread exited while registered with RCU; removing slot {}",
                registration.index
            );
            registration.inner.registry.lock().remove(registration.index);
        }
    }
}

struct ManagerInner {
    /// Serializes registration, deregistration, and `synchronize`.
    registry: Mutex<Registry>,
    /// Phase in the top bit, constant 1 in the low bit. Written only under
    /// the registry mutex; read lock-free by readers.
    grace_period: AtomicU64,
    process_ready: AtomicBool,
    grace_periods_completed: AtomicU64,
    barriers_issued: AtomicU64,
    config: RcuConfig,
}

/// Userspace RCU synchronization manager.
///
/// The manager is a cheap cloneable handle; clones share the same registry
/// and grace-period state.
///
/// # Usage
///
/// ```no_run
/// use rcu_sync::RcuManager;
///
/// let rcu = RcuManager::new();
/// rcu.register_process().expect("membarrier unavailable");
/// rcu.register_thread();
///
/// rcu.read_lock();
/// // traverse shared pointers...
/// rcu.read_unlock();
///
/// rcu.synchronize(); // wait until every reader has passed a quiescent state
/// rcu.unregister_thread();
/// ```
#[derive(Clone)]
pub struct RcuManager {
    inner: Arc<ManagerInner>,
}

/// Counters exported for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RcuStats {
    /// Completed `synchronize` calls.
    pub grace_periods: u64,
    /// Process-wide barriers issued (two per grace period).
    pub barriers: u64,
}

impl RcuManager {
    pub fn new() -> Self {
        Self::with_config(RcuConfig::default())
    }

    pub fn with_config(config: RcuConfig) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                registry: Mutex::new(Registry::new()),
                grace_period: AtomicU64::new(GLOBAL_WORD_INIT),
                process_ready: AtomicBool::new(false),
                grace_periods_completed: AtomicU64::new(0),
                barriers_issued: AtomicU64::new(0),
                config,
            }),
        }
    }

    /// Register the calling process for expedited process-wide barriers.
    ///
    /// Must succeed before any call to [`synchronize`](Self::synchronize).
    /// On failure the platform cannot run this RCU scheme at all and the
    /// rest of the API must not be used.
    pub fn register_process(&self) -> Result<(), crate::core::errors::RcuError> {
        membarrier::probe_process()?;
        self.inner.process_ready.store(true, Ordering::Release);
        info!("RCU process registration complete");
        Ok(())
    }

    /// Add the calling thread to the reader registry.
    ///
    /// The thread must not already be registered (with any manager).
    pub fn register_thread(&self) {
        THREAD_SLOT.with(|slot| {
            let mut registration = slot.registration.borrow_mut();
            debug_assert!(registration.is_none(), "thread is already registered");

            let mut registry = self.inner.registry.lock();
            slot.counter.store(0, Ordering::Relaxed);
            let index = registry.insert(ReaderEntry::new(&slot.counter));
            drop(registry);

            *registration = Some(Registration {
                inner: Arc::clone(&self.inner),
                index,
            });
            trace!(
                "registered reader thread {:?} in slot {index}",
                thread::current().name()
            );
        });
    }

    /// Remove the calling thread from the reader registry.
    ///
    /// The thread must be registered and must not hold any read locks. A
    /// thread may re-register later.
    pub fn unregister_thread(&self) {
        THREAD_SLOT.with(|slot| {
            debug_assert!(
                is_quiescent(slot.counter.load(Ordering::Relaxed)),
                "cannot unregister while read locks are held"
            );

            let registration = slot.registration.borrow_mut().take();
            debug_assert!(registration.is_some(), "thread is not registered");
            if let Some(registration) = registration {
                debug_assert!(
                    Arc::ptr_eq(&registration.inner, &self.inner),
                    "thread is registered with a different manager"
                );
                registration.inner.registry.lock().remove(registration.index);
                trace!(
                    "unregistered reader thread {:?} from slot {}",
                    thread::current().name(),
                    registration.index
                );
            }
        });
    }

    /// Enter a read-side critical section.
    ///
    /// Critical sections nest arbitrarily. The call never blocks and issues
    /// no fence and no atomic read-modify-write; from the calling thread's
    /// point of view it is two plain memory operations.
    ///
    /// Undefined if the thread is not registered (asserted in debug builds).
    #[inline]
    pub fn read_lock(&self) {
        THREAD_SLOT.with(|slot| {
            #[cfg(debug_assertions)]
            self.assert_registered_here(slot);

            let counter = slot.counter.load(Ordering::Relaxed);
            if is_quiescent(counter) {
                // Outermost entry. The global word carries a 1 in its low
                // bit, so this single store sets nesting to 1 and records
                // the phase snapshot at once.
                let global = self.inner.grace_period.load(Ordering::Relaxed);
                slot.counter.store(global, Ordering::Relaxed);
            } else {
                slot.counter.store(counter + 1, Ordering::Relaxed);
            }
        });
    }

    /// Leave a read-side critical section.
    ///
    /// Must pair with a previous [`read_lock`](Self::read_lock) on the same
    /// thread; unbalanced calls corrupt the counter (asserted in debug
    /// builds).
    #[inline]
    pub fn read_unlock(&self) {
        THREAD_SLOT.with(|slot| {
            let counter = slot.counter.load(Ordering::Relaxed);
            debug_assert!(
                !is_quiescent(counter),
                "read_unlock without a matching read_lock"
            );
            slot.counter.store(counter - 1, Ordering::Relaxed);
        });
    }

    /// Enter a read-side critical section, ended when the guard drops.
    #[inline]
    pub fn read_guard(&self) -> ReadGuard<'_> {
        ReadGuard::new(self)
    }

    /// Block until every registered reader has passed through a quiescent
    /// state since this call began.
    ///
    /// After `synchronize` returns, memory made unreachable before the call
    /// can be freed: no reader can still hold a reference to it.
    ///
    /// Must not be called from inside a read-side critical section (the
    /// wait could never finish). Writers serialize on the registry mutex,
    /// so concurrent callers drain one at a time.
    pub fn synchronize(&self) {
        debug_assert!(
            self.inner.process_ready.load(Ordering::Acquire),
            "register_process must succeed before synchronize"
        );
        #[cfg(debug_assertions)]
        THREAD_SLOT.with(|slot| {
            debug_assert!(
                is_quiescent(slot.counter.load(Ordering::Relaxed)),
                "synchronize called inside a read-side critical section"
            );
        });

        let registry = self.inner.registry.lock();

        // Force every reader's earlier unfenced stores (including the
        // snapshot store in read_lock) to be ordered before the flips
        // below.
        self.all_threads_barrier();

        // One flip is not enough: a reader whose snapshot happens to equal
        // the new phase may have taken it during a previous grace period,
        // since the phase is a single bit. After a second flip, any active
        // reader with a matching snapshot must have entered its critical
        // section after the first flip, hence after this call began.
        self.flip_and_wait(&registry);
        self.flip_and_wait(&registry);

        // Order the readers' loads before anything the caller does after
        // we return.
        self.all_threads_barrier();
        drop(registry);

        self.inner
            .grace_periods_completed
            .fetch_add(1, Ordering::Relaxed);
        trace!("grace period complete");
    }

    /// Number of currently registered reader threads.
    pub fn registered_readers(&self) -> usize {
        self.inner.registry.lock().len()
    }

    /// Diagnostic counters.
    pub fn stats(&self) -> RcuStats {
        RcuStats {
            grace_periods: self.inner.grace_periods_completed.load(Ordering::Relaxed),
            barriers: self.inner.barriers_issued.load(Ordering::Relaxed),
        }
    }

    fn all_threads_barrier(&self) {
        membarrier::all_threads_barrier();
        self.inner.barriers_issued.fetch_add(1, Ordering::Relaxed);
    }

    /// Toggle the grace-period phase and wait for every registered reader
    /// to be quiescent or to carry the new phase snapshot.
    fn flip_and_wait(&self, registry: &Registry) {
        let flipped = self.inner.grace_period.load(Ordering::Relaxed) ^ GRACE_PHASE_BIT;
        self.inner.grace_period.store(flipped, Ordering::Relaxed);

        let poll_interval = self.inner.config.poll_interval;
        for entry in registry.iter() {
            let mut polls = 0u32;
            loop {
                let observed = entry.counter().load(Ordering::Relaxed);
                if is_quiescent(observed) || phase(observed) == phase(flipped) {
                    break;
                }
                polls += 1;
                if polls % STALL_WARN_POLLS == 0 {
                    warn!(
                        "reader thread {:?} has stalled a grace period for {:?} (nesting {})",
                        entry.thread().name(),
                        poll_interval * polls,
                        nesting(observed)
                    );
                }
                thread::sleep(poll_interval);
            }
        }
    }

    #[cfg(debug_assertions)]
    fn assert_registered_here(&self, slot: &ThreadSlot) {
        let registration = slot.registration.borrow();
        match registration.as_ref() {
            Some(registration) => debug_assert!(
                Arc::ptr_eq(&registration.inner, &self.inner),
                "thread is registered with a different manager"
            ),
            None => panic!("reader operation on an unregistered thread"),
        }
    }

    /// Test-only view of the calling thread's counter word.
    #[cfg(test)]
    fn current_counter() -> u64 {
        THREAD_SLOT.with(|slot| slot.counter.load(Ordering::Relaxed))
    }
}

impl Default for RcuManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RcuManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RcuManager")
            .field("registered_readers", &self.registered_readers())
            .field("stats", &self.stats())
            .finish()
    }
}
