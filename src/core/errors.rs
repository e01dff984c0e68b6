/*!
 * Error Types
 * Centralized error handling with thiserror
 */

use thiserror::Error;

/// Errors surfaced by process registration.
///
/// These all describe one condition: the host kernel cannot deliver the
/// process-wide expedited barrier the reader fast paths depend on. They are
/// reported once, from [`RcuManager::register_process`], and are fatal to
/// the rest of the API; a caller that receives one must not use RCU on this
/// system.
///
/// Everything else in the crate is a programmer contract (reader operations
/// from an unregistered thread, unbalanced lock/unlock pairs) and is
/// enforced with `debug_assert!` rather than a runtime error value.
///
/// [`RcuManager::register_process`]: crate::RcuManager::register_process
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RcuError {
    #[error("membarrier capability query failed (errno {0})")]
    QueryFailed(i32),

    #[error("kernel does not support required membarrier command: {0}")]
    CommandUnsupported(&'static str),

    #[error("membarrier registration failed (errno {0})")]
    RegistrationFailed(i32),

    #[error("process-wide memory barriers are not available on this platform")]
    UnsupportedPlatform,
}
