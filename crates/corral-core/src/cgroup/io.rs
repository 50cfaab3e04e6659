//! Block I/O accounting via cgroups v2.
//!
//! Reads `io.stat`. The unified hierarchy only reports byte and operation
//! counts; the remaining blkio series stay empty.

use std::path::Path;

use corral_common::error::Result;

use super::read_control;
use super::stats::{BlkioEntry, BlkioStats};

/// Reads `io.stat` for a cgroup.
///
/// A cgroup without the io controller enabled has no `io.stat`; that reads
/// as empty statistics.
///
/// # Errors
///
/// Returns an error if `io.stat` exists but cannot be read.
pub fn read_stats(cgroup_path: &Path) -> Result<BlkioStats> {
    if !cgroup_path.join("io.stat").exists() {
        return Ok(BlkioStats::default());
    }
    Ok(parse_io_stat(&read_control(cgroup_path, "io.stat")?))
}

fn parse_io_stat(content: &str) -> BlkioStats {
    let mut stats = BlkioStats::default();
    for line in content.lines() {
        let mut fields = line.split_whitespace();
        let Some((major, minor)) = fields.next().and_then(parse_device) else {
            continue;
        };
        for field in fields {
            let Some((key, value)) = field.split_once('=') else {
                continue;
            };
            let Ok(value) = value.parse::<u64>() else {
                continue;
            };
            let (series, op) = match key {
                "rbytes" => (&mut stats.service_bytes, "Read"),
                "wbytes" => (&mut stats.service_bytes, "Write"),
                "dbytes" => (&mut stats.service_bytes, "Discard"),
                "rios" => (&mut stats.serviced, "Read"),
                "wios" => (&mut stats.serviced, "Write"),
                "dios" => (&mut stats.serviced, "Discard"),
                _ => continue,
            };
            series.push(BlkioEntry {
                major,
                minor,
                op: op.to_string(),
                value,
            });
        }
    }
    stats
}

fn parse_device(device: &str) -> Option<(u64, u64)> {
    let (major, minor) = device.split_once(':')?;
    Some((major.parse().ok()?, minor.parse().ok()?))
}
