//! Exit status reporting.

use corral_common::constants::DRIVER_FAILURE_EXIT_CODE;
use serde::Serialize;

/// How a container's init process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExitStatus {
    /// Exit code; `128 + n` when killed by signal `n`, `-1` when the driver
    /// failed before an exit status was observed.
    pub exit_code: i32,
    /// Whether the kernel OOM killer fired inside the container.
    pub oom_killed: bool,
    /// Whether the process was terminated by a signal.
    pub signaled: bool,
}

impl ExitStatus {
    /// Status reported when the driver itself failed.
    #[must_use]
    pub const fn driver_failure() -> Self {
        Self {
            exit_code: DRIVER_FAILURE_EXIT_CODE,
            oom_killed: false,
            signaled: false,
        }
    }

    /// Builds a status from a reaped process.
    #[must_use]
    pub fn from_process(status: std::process::ExitStatus, oom_killed: bool) -> Self {
        let (exit_code, signaled) = decode_exit_status(status);
        Self {
            exit_code,
            oom_killed,
            signaled,
        }
    }
}

/// Maps a process wait status to `(exit_code, signaled)`.
///
/// Normal exits report their code, signal deaths report `128 + signal`.
#[cfg(unix)]
#[must_use]
pub fn decode_exit_status(status: std::process::ExitStatus) -> (i32, bool) {
    use std::os::unix::process::ExitStatusExt;

    if let Some(code) = status.code() {
        return (code, false);
    }
    match status.signal() {
        Some(signal) => (128 + signal, true),
        None => (DRIVER_FAILURE_EXIT_CODE, false),
    }
}

/// Maps a process wait status to `(exit_code, signaled)`.
#[cfg(not(unix))]
#[must_use]
pub fn decode_exit_status(status: std::process::ExitStatus) -> (i32, bool) {
    (status.code().unwrap_or(DRIVER_FAILURE_EXIT_CODE), false)
}
