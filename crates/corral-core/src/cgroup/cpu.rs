//! CPU resource control via cgroups v2.
//!
//! Manages `cpu.weight` and `cpuset.cpus`, and reads `cpu.stat`.

use std::path::Path;

use corral_common::error::Result;

use super::stats::{CpuStats, CpuUsage, ThrottlingData};
use super::{parse_flat_keyed, read_control, write_control};

/// Converts cgroup v1 CPU shares (2-262144) to a cgroup v2 weight (1-10000).
///
/// A value of 0 means "not set" and converts to 0.
#[must_use]
pub const fn shares_to_weight(shares: u64) -> u64 {
    if shares == 0 {
        return 0;
    }
    let shares = if shares < 2 { 2 } else if shares > 262_144 { 262_144 } else { shares };
    1 + ((shares - 2) * 9999) / 262_142
}

/// Sets the CPU weight for a cgroup from v1-style shares.
///
/// # Errors
///
/// Returns an error if writing to `cpu.weight` fails.
pub fn set_cpu_shares(cgroup_path: &Path, shares: u64) -> Result<()> {
    let weight = shares_to_weight(shares);
    write_control(cgroup_path, "cpu.weight", &weight.to_string())?;
    tracing::debug!(shares, weight, "CPU weight set");
    Ok(())
}

/// Pins the cgroup to the given CPU list (`0-3,6`).
///
/// # Errors
///
/// Returns an error if writing to `cpuset.cpus` fails.
pub fn set_cpuset_cpus(cgroup_path: &Path, cpus: &str) -> Result<()> {
    write_control(cgroup_path, "cpuset.cpus", cpus)?;
    tracing::debug!(cpus, "cpuset pinned");
    Ok(())
}

/// Reads `cpu.stat` and converts its microsecond counters to nanoseconds.
///
/// # Errors
///
/// Returns an error if `cpu.stat` cannot be read.
pub fn read_stats(cgroup_path: &Path) -> Result<CpuStats> {
    let content = read_control(cgroup_path, "cpu.stat")?;
    Ok(parse_cpu_stat(&content))
}

fn parse_cpu_stat(content: &str) -> CpuStats {
    let values = parse_flat_keyed(content);
    let usec = |key: &str| values.get(key).copied().unwrap_or(0).saturating_mul(1000);
    let count = |key: &str| values.get(key).copied().unwrap_or(0);
    CpuStats {
        usage: CpuUsage {
            total: usec("usage_usec"),
            per_core: Vec::new(),
            kernel: usec("system_usec"),
            user: usec("user_usec"),
        },
        throttling: ThrottlingData {
            periods: count("nr_periods"),
            throttled_periods: count("nr_throttled"),
            throttled_time: usec("throttled_usec"),
        },
    }
}
