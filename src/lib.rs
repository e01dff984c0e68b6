/*!
 * rcu-sync
 * Userspace read-copy-update with fence-free readers
 *
 * Readers enter and leave critical sections with plain loads and stores on a
 * thread-local counter: no atomic read-modify-write, no memory fence. All
 * cross-thread ordering is pushed onto writers, which use the kernel's
 * process-wide `membarrier(2)` barrier to force every thread through a full
 * fence before and after waiting out a grace period.
 *
 * The crate ships three layers:
 * - [`RcuManager`]: thread registry, reader fast paths, and the blocking
 *   grace-period wait (`synchronize`).
 * - [`Collector`]: a background reclaimer that batches detached nodes,
 *   waits one grace period per batch, and destroys them.
 * - [`RcuStack`]: a lock-free stack built on the two layers above, using
 *   reader locks for ABA protection on its CAS loops.
 */

pub mod core;
pub mod membarrier;
pub mod rcu;
pub mod reclaim;
pub mod stack;

pub use crate::core::errors::RcuError;
pub use crate::rcu::{RcuConfig, RcuManager, RcuStats, ReadGuard};
pub use crate::reclaim::{Collector, CollectorConfig, Reclaimable};
pub use crate::stack::RcuStack;
