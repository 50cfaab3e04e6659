//! Host process and machine information read from `/proc`.

use corral_common::error::{CorralError, Result};
use serde::Serialize;

/// Traffic counters of one network interface.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InterfaceStats {
    /// Interface name as seen inside the namespace.
    pub name: String,
    /// Bytes received.
    pub rx_bytes: u64,
    /// Packets received.
    pub rx_packets: u64,
    /// Receive errors.
    pub rx_errors: u64,
    /// Received packets dropped.
    pub rx_dropped: u64,
    /// Bytes sent.
    pub tx_bytes: u64,
    /// Packets sent.
    pub tx_packets: u64,
    /// Transmit errors.
    pub tx_errors: u64,
    /// Outgoing packets dropped.
    pub tx_dropped: u64,
}

/// Total physical memory of the machine in bytes.
///
/// # Errors
///
/// Returns an error if `/proc/meminfo` cannot be read.
#[cfg(target_os = "linux")]
pub fn machine_memory() -> Result<u64> {
    use procfs::Current;

    let meminfo = procfs::Meminfo::current().map_err(|e| CorralError::Unsupported {
        message: format!("reading /proc/meminfo: {e}"),
    })?;
    tracing::debug!(mem_total = meminfo.mem_total, "machine memory");
    Ok(meminfo.mem_total)
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error, `/proc` requires Linux.
#[cfg(not(target_os = "linux"))]
pub fn machine_memory() -> Result<u64> {
    Err(linux_required())
}

/// Start time of `pid` in clock ticks since boot, or `None` when no such
/// process exists.
///
/// Together with the pid this identifies a process instance: a recycled pid
/// has a different start time.
///
/// # Errors
///
/// Returns an error if the process exists but its `stat` file cannot be
/// parsed or read.
#[cfg(target_os = "linux")]
pub fn process_start_time(pid: i32) -> Result<Option<u64>> {
    match procfs::process::Process::new(pid).and_then(|p| p.stat()) {
        Ok(stat) => Ok(Some(stat.starttime)),
        Err(procfs::ProcError::NotFound(_)) => Ok(None),
        Err(e) => Err(CorralError::Process {
            pid,
            message: format!("reading start time: {e}"),
        }),
    }
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error, `/proc` requires Linux.
#[cfg(not(target_os = "linux"))]
pub fn process_start_time(_pid: i32) -> Result<Option<u64>> {
    Err(linux_required())
}

/// Cumulative CPU time of the whole host in nanoseconds.
///
/// # Errors
///
/// Returns an error if `/proc/stat` cannot be read.
#[cfg(target_os = "linux")]
pub fn system_cpu_usage() -> Result<u64> {
    use procfs::CurrentSI;

    let kstat = procfs::KernelStats::current().map_err(|e| CorralError::Unsupported {
        message: format!("reading /proc/stat: {e}"),
    })?;
    let t = &kstat.total;
    let ticks = t.user
        + t.nice
        + t.system
        + t.idle
        + t.iowait.unwrap_or(0)
        + t.irq.unwrap_or(0)
        + t.softirq.unwrap_or(0)
        + t.steal.unwrap_or(0);
    Ok(ticks_to_nanos(ticks, clock_ticks()))
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error, `/proc` requires Linux.
#[cfg(not(target_os = "linux"))]
pub fn system_cpu_usage() -> Result<u64> {
    Err(linux_required())
}

/// Network interface counters visible to `pid`, excluding loopback.
///
/// # Errors
///
/// Returns an error if `/proc/<pid>/net/dev` cannot be read, for example
/// because the process has exited.
#[cfg(target_os = "linux")]
pub fn network_interfaces(pid: i32) -> Result<Vec<InterfaceStats>> {
    let devices = procfs::process::Process::new(pid)
        .and_then(|p| p.dev_status())
        .map_err(|e| CorralError::Process {
            pid,
            message: format!("reading net/dev: {e}"),
        })?;
    let mut interfaces: Vec<InterfaceStats> = devices
        .into_values()
        .filter(|dev| dev.name != "lo")
        .map(|dev| InterfaceStats {
            name: dev.name,
            rx_bytes: dev.recv_bytes,
            rx_packets: dev.recv_packets,
            rx_errors: dev.recv_errs,
            rx_dropped: dev.recv_drop,
            tx_bytes: dev.sent_bytes,
            tx_packets: dev.sent_packets,
            tx_errors: dev.sent_errs,
            tx_dropped: dev.sent_drop,
        })
        .collect();
    interfaces.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(interfaces)
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error, `/proc` requires Linux.
#[cfg(not(target_os = "linux"))]
pub fn network_interfaces(_pid: i32) -> Result<Vec<InterfaceStats>> {
    Err(linux_required())
}

/// Direct children of `pid`'s main thread. An exited process has none.
///
/// # Errors
///
/// Returns an error if the kernel does not expose the children list.
#[cfg(target_os = "linux")]
pub fn child_pids(pid: i32) -> Result<Vec<i32>> {
    let path = format!("/proc/{pid}/task/{pid}/children");
    match std::fs::read_to_string(&path) {
        Ok(content) => Ok(parse_pid_list(&content)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(CorralError::io(path, e)),
    }
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error, `/proc` requires Linux.
#[cfg(not(target_os = "linux"))]
pub fn child_pids(_pid: i32) -> Result<Vec<i32>> {
    Err(linux_required())
}

fn parse_pid_list(content: &str) -> Vec<i32> {
    content
        .split_whitespace()
        .filter_map(|pid| pid.parse().ok())
        .collect()
}

#[cfg(target_os = "linux")]
fn clock_ticks() -> u64 {
    match procfs::ticks_per_second() {
        0 => 100,
        ticks => ticks,
    }
}

const fn ticks_to_nanos(ticks: u64, per_second: u64) -> u64 {
    ticks.saturating_mul(1_000_000_000 / per_second)
}

#[cfg(not(target_os = "linux"))]
fn linux_required() -> CorralError {
    CorralError::Unsupported {
        message: "Linux required for native container operations".into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticks_convert_at_user_hz() {
        assert_eq!(ticks_to_nanos(250, 100), 2_500_000_000);
    }

    #[test]
    fn pid_list_skips_garbage() {
        assert_eq!(parse_pid_list("12 34 \n"), vec![12, 34]);
        assert!(parse_pid_list("").is_empty());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn own_process_has_a_start_time() {
        let pid = i32::try_from(std::process::id()).expect("pid fits");
        let start = process_start_time(pid).expect("read");
        assert!(start.is_some());
        assert_eq!(process_start_time(pid).expect("read again"), start);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn missing_process_has_no_start_time() {
        // Above the kernel's pid_max ceiling, so never allocated.
        assert_eq!(process_start_time(i32::MAX).expect("read"), None);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn system_cpu_usage_is_monotonic() {
        let first = system_cpu_usage().expect("read /proc/stat");
        assert!(first > 0);
        assert!(system_cpu_usage().expect("read again") >= first);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn machine_memory_is_nonzero() {
        assert!(machine_memory().expect("meminfo") > 0);
    }
}
