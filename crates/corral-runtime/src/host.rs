//! Host facilities the driver consults outside any one container.

use corral_common::error::{CorralError, Result};
use nix::sys::signal::Signal;
use nix::unistd::Pid;

/// Machine-wide queries and process signaling.
///
/// The driver reaches the host only through this trait, which lets tests
/// simulate pid reuse and record delivered signals.
pub trait Host: Send + Sync {
    /// Total physical memory in bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be read.
    fn machine_memory(&self) -> Result<u64>;

    /// Cumulative host CPU time in nanoseconds.
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be read.
    fn system_cpu_usage(&self) -> Result<u64>;

    /// Start time of `pid`, or `None` if no such process exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the process exists but cannot be inspected.
    fn process_start_time(&self, pid: i32) -> Result<Option<u64>>;

    /// Sends `signal` to `pid`.
    ///
    /// # Errors
    ///
    /// Returns an error if delivery fails.
    fn signal(&self, pid: i32, signal: Signal) -> Result<()>;
}

/// The running Linux host.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinuxHost;

impl Host for LinuxHost {
    fn machine_memory(&self) -> Result<u64> {
        corral_core::proc::machine_memory()
    }

    fn system_cpu_usage(&self) -> Result<u64> {
        corral_core::proc::system_cpu_usage()
    }

    fn process_start_time(&self, pid: i32) -> Result<Option<u64>> {
        corral_core::proc::process_start_time(pid)
    }

    fn signal(&self, pid: i32, signal: Signal) -> Result<()> {
        tracing::debug!(pid, %signal, "signaling process");
        nix::sys::signal::kill(Pid::from_raw(pid), signal).map_err(|e| CorralError::Process {
            pid,
            message: format!("sending {signal}: {e}"),
        })
    }
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;

    #[test]
    fn signals_reach_own_process() {
        let pid = i32::try_from(std::process::id()).unwrap();
        // SIGCONT is harmless to a running process.
        LinuxHost.signal(pid, Signal::SIGCONT).unwrap();
        assert!(LinuxHost.process_start_time(pid).unwrap().is_some());
    }

    #[test]
    fn signaling_missing_process_fails() {
        let err = LinuxHost.signal(i32::MAX, Signal::SIGTERM).unwrap_err();
        assert!(matches!(err, CorralError::Process { pid, .. } if pid == i32::MAX));
    }
}
