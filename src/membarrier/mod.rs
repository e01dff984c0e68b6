/*!
 * Process-Wide Memory Barrier
 * Wrapper over the Linux `membarrier(2)` expedited barrier
 *
 * The syscall is asymmetric: the caller pays for one syscall and an IPI
 * round, and every other thread in the process executes a full memory
 * fence at a point ordered after the call. That asymmetry is what lets the
 * reader fast paths run without any fence of their own.
 *
 * Three commands are used:
 * - `MEMBARRIER_CMD_QUERY` returns a bitmask of supported commands (or a
 *   negative errno).
 * - `MEMBARRIER_CMD_REGISTER_PRIVATE_EXPEDITED` records the process's
 *   intent to issue expedited barriers; it must precede the first barrier.
 * - `MEMBARRIER_CMD_PRIVATE_EXPEDITED` delivers the barrier to every
 *   thread of the calling process.
 */

#[cfg(target_os = "linux")]
use log::debug;

use crate::core::errors::RcuError;

#[cfg(target_os = "linux")]
fn membarrier(cmd: libc::c_int) -> libc::c_long {
    // SAFETY: membarrier takes a command and a flags word, no pointers;
    // invalid commands fail with EINVAL.
    unsafe { libc::syscall(libc::SYS_membarrier, cmd, 0) }
}

#[cfg(target_os = "linux")]
fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(-1)
}

/// Probe for expedited membarrier support and register the process.
///
/// Queries the supported command set, requires both the registration and
/// the expedited barrier commands, registers intent, and then issues one
/// test barrier. The kernel guarantees that if the expedited barrier can
/// ever fail it fails on first use, so a successful probe removes error
/// handling from every later [`all_threads_barrier`] call.
///
/// Calling this more than once is harmless; each call re-issues the test
/// barrier.
#[cfg(target_os = "linux")]
pub fn probe_process() -> Result<(), RcuError> {
    let supported = membarrier(libc::MEMBARRIER_CMD_QUERY);
    if supported < 0 {
        return Err(RcuError::QueryFailed(last_errno()));
    }

    let required = (libc::MEMBARRIER_CMD_REGISTER_PRIVATE_EXPEDITED
        | libc::MEMBARRIER_CMD_PRIVATE_EXPEDITED) as libc::c_long;
    if supported & required != required {
        return Err(RcuError::CommandUnsupported("private expedited"));
    }

    if membarrier(libc::MEMBARRIER_CMD_REGISTER_PRIVATE_EXPEDITED) < 0 {
        return Err(RcuError::RegistrationFailed(last_errno()));
    }

    if membarrier(libc::MEMBARRIER_CMD_PRIVATE_EXPEDITED) < 0 {
        return Err(RcuError::RegistrationFailed(last_errno()));
    }

    debug!("membarrier probe succeeded (supported commands 0x{supported:x})");
    Ok(())
}

/// Force every thread in the process through a full memory fence.
///
/// Must be preceded by a successful [`probe_process`]; after that the call
/// cannot fail and the result is ignored.
#[cfg(target_os = "linux")]
#[inline]
pub fn all_threads_barrier() {
    membarrier(libc::MEMBARRIER_CMD_PRIVATE_EXPEDITED);
}

#[cfg(not(target_os = "linux"))]
pub fn probe_process() -> Result<(), RcuError> {
    Err(RcuError::UnsupportedPlatform)
}

#[cfg(not(target_os = "linux"))]
pub fn all_threads_barrier() {
    unreachable!("all_threads_barrier requires a successful probe_process");
}
