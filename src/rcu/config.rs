/*!
 * RCU Configuration
 * Tuning knobs for the grace-period wait
 */

use std::time::Duration;

/// Configuration for an [`RcuManager`].
///
/// [`RcuManager`]: super::RcuManager
#[derive(Debug, Clone)]
pub struct RcuConfig {
    /// Sleep between polls of a still-active reader during `synchronize`.
    pub poll_interval: Duration,
}

impl Default for RcuConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1),
        }
    }
}

impl RcuConfig {
    /// Configuration for tests that want `synchronize` to spin tighter.
    pub const fn fast_poll() -> Self {
        Self {
            poll_interval: Duration::from_micros(100),
        }
    }
}
