//! Memory resource control via cgroups v2.
//!
//! Manages `memory.max` and reads `memory.current`, `memory.peak`,
//! `memory.events` and `memory.stat`.

use std::path::Path;

use corral_common::error::Result;

use super::stats::MemoryStats;
use super::{parse_flat_keyed, read_control, write_control};

/// Sets the hard memory limit for a cgroup.
///
/// # Errors
///
/// Returns an error if writing to `memory.max` fails.
pub fn set_memory_max(cgroup_path: &Path, bytes: u64) -> Result<()> {
    write_control(cgroup_path, "memory.max", &bytes.to_string())?;
    tracing::debug!(bytes, "memory max limit set");
    Ok(())
}

/// Reads the memory counters of a cgroup.
///
/// A cgroup without the memory controller enabled has no `memory.current`;
/// that reads as zeroed statistics. `memory.peak` only exists on newer
/// kernels; a missing file reports 0.
///
/// # Errors
///
/// Returns an error if a memory control file exists but cannot be read.
pub fn read_stats(cgroup_path: &Path) -> Result<MemoryStats> {
    if !cgroup_path.join("memory.current").exists() {
        return Ok(MemoryStats::default());
    }
    let usage = parse_single(&read_control(cgroup_path, "memory.current")?);
    let max_usage = read_optional(cgroup_path, "memory.peak")?.map_or(0, |c| parse_single(&c));
    let limit = read_optional(cgroup_path, "memory.max")?.map_or(0, |c| parse_single(&c));
    let events = read_optional(cgroup_path, "memory.events")?
        .map(|c| parse_flat_keyed(&c))
        .unwrap_or_default();
    let stats = read_optional(cgroup_path, "memory.stat")?
        .map(|c| parse_flat_keyed(&c))
        .unwrap_or_default();
    Ok(MemoryStats {
        usage,
        max_usage,
        fail_count: events.get("max").copied().unwrap_or(0),
        limit,
        stats,
    })
}

/// Returns how many processes of the cgroup the OOM killer has killed.
///
/// # Errors
///
/// Returns an error if `memory.events` cannot be read.
pub fn oom_kill_count(cgroup_path: &Path) -> Result<u64> {
    let events = parse_flat_keyed(&read_control(cgroup_path, "memory.events")?);
    Ok(events.get("oom_kill").copied().unwrap_or(0))
}

fn read_optional(cgroup_path: &Path, file: &str) -> Result<Option<String>> {
    if cgroup_path.join(file).exists() {
        read_control(cgroup_path, file).map(Some)
    } else {
        Ok(None)
    }
}

/// Parses a single-value control file; `max` means unlimited and reads as 0.
fn parse_single(content: &str) -> u64 {
    content.trim().parse().unwrap_or(0)
}
