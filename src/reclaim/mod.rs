/*!
 * Deferred Reclamation
 * Lock-free intake of detached nodes and a grace-period-batching destroyer
 */

mod collector;

pub use collector::{Collector, CollectorConfig, Reclaimable};
