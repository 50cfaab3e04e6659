//! Normalized resource statistics.
//!
//! [`normalize`] turns whatever the backend reports into one stable record.
//! Field names are part of the serialized form consumers depend on.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use corral_core::cgroup::stats::{BlkioEntry, CgroupStats};
use corral_core::proc::InterfaceStats;

use crate::backend::RawStats;

/// Point-in-time resource usage of one container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceStats {
    /// When the sample was taken.
    pub read: DateTime<Utc>,
    /// Traffic summed across the container's interfaces.
    pub network: NetworkStats,
    /// CPU accounting.
    pub cpu_stats: CpuStats,
    /// Memory accounting.
    pub memory_stats: MemoryStats,
    /// Block I/O accounting.
    pub blkio_stats: BlkioStats,
}

/// Summed network counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct NetworkStats {
    /// Bytes received.
    pub rx_bytes: u64,
    /// Packets received.
    pub rx_packets: u64,
    /// Receive errors.
    pub rx_errors: u64,
    /// Dropped incoming packets.
    pub rx_dropped: u64,
    /// Bytes sent.
    pub tx_bytes: u64,
    /// Packets sent.
    pub tx_packets: u64,
    /// Transmit errors.
    pub tx_errors: u64,
    /// Dropped outgoing packets.
    pub tx_dropped: u64,
}

/// CPU accounting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CpuStats {
    /// Usage counters, nanoseconds.
    pub cpu_usage: CpuUsage,
    /// Cumulative host CPU time, nanoseconds.
    pub system_cpu_usage: u64,
    /// Bandwidth throttling.
    pub throttling_data: ThrottlingData,
}

/// CPU time consumed, nanoseconds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CpuUsage {
    /// Total.
    pub total_usage: u64,
    /// Per core.
    pub percpu_usage: Vec<u64>,
    /// In kernel mode.
    pub usage_in_kernelmode: u64,
    /// In user mode.
    pub usage_in_usermode: u64,
}

/// CPU bandwidth throttling counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ThrottlingData {
    /// Enforcement periods.
    pub periods: u64,
    /// Periods in which the group was throttled.
    pub throttled_periods: u64,
    /// Total throttled time, nanoseconds.
    pub throttled_time: u64,
}

/// Memory accounting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MemoryStats {
    /// Current usage in bytes.
    pub usage: u64,
    /// Peak usage in bytes.
    pub max_usage: u64,
    /// Named counters from the cgroup.
    pub stats: HashMap<String, u64>,
    /// Times the limit was hit.
    pub failcnt: u64,
    /// Effective limit: the configured one, or machine memory.
    pub limit: u64,
}

/// One block I/O counter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlkioStatEntry {
    /// Device major number.
    pub major: u64,
    /// Device minor number.
    pub minor: u64,
    /// Operation.
    pub op: String,
    /// Value.
    pub value: u64,
}

/// Block I/O accounting, one list per series.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BlkioStats {
    /// Bytes transferred.
    pub io_service_bytes_recursive: Vec<BlkioStatEntry>,
    /// Operations issued.
    pub io_serviced_recursive: Vec<BlkioStatEntry>,
    /// Operations queued.
    pub io_queue_recursive: Vec<BlkioStatEntry>,
    /// Time spent servicing.
    pub io_service_time_recursive: Vec<BlkioStatEntry>,
    /// Time spent waiting.
    pub io_wait_time_recursive: Vec<BlkioStatEntry>,
    /// Merged operations.
    pub io_merged_recursive: Vec<BlkioStatEntry>,
    /// Device time.
    pub io_time_recursive: Vec<BlkioStatEntry>,
    /// Sectors transferred.
    pub sectors_recursive: Vec<BlkioStatEntry>,
}

/// Builds a [`ResourceStats`] from raw backend accounting.
///
/// `memory_limit` is the effective limit chosen by the caller and
/// `system_usage` the host CPU time at sampling.
#[must_use]
pub fn normalize(
    raw: &RawStats,
    read: DateTime<Utc>,
    memory_limit: u64,
    system_usage: u64,
) -> ResourceStats {
    let cgroup = raw.cgroup.clone().unwrap_or_default();
    let CgroupStats { cpu, memory, blkio } = cgroup;

    ResourceStats {
        read,
        network: sum_interfaces(&raw.interfaces),
        cpu_stats: CpuStats {
            cpu_usage: CpuUsage {
                total_usage: cpu.usage.total,
                percpu_usage: cpu.usage.per_core,
                usage_in_kernelmode: cpu.usage.kernel,
                usage_in_usermode: cpu.usage.user,
            },
            system_cpu_usage: system_usage,
            throttling_data: ThrottlingData {
                periods: cpu.throttling.periods,
                throttled_periods: cpu.throttling.throttled_periods,
                throttled_time: cpu.throttling.throttled_time,
            },
        },
        memory_stats: MemoryStats {
            usage: memory.usage,
            max_usage: memory.max_usage,
            stats: memory.stats,
            failcnt: memory.fail_count,
            limit: memory_limit,
        },
        blkio_stats: BlkioStats {
            io_service_bytes_recursive: entries(blkio.service_bytes),
            io_serviced_recursive: entries(blkio.serviced),
            io_queue_recursive: entries(blkio.queued),
            io_service_time_recursive: entries(blkio.service_time),
            io_wait_time_recursive: entries(blkio.wait_time),
            io_merged_recursive: entries(blkio.merged),
            io_time_recursive: entries(blkio.time),
            sectors_recursive: entries(blkio.sectors),
        },
    }
}

fn sum_interfaces(interfaces: &[InterfaceStats]) -> NetworkStats {
    interfaces
        .iter()
        .fold(NetworkStats::default(), |mut acc, iface| {
            acc.rx_bytes += iface.rx_bytes;
            acc.rx_packets += iface.rx_packets;
            acc.rx_errors += iface.rx_errors;
            acc.rx_dropped += iface.rx_dropped;
            acc.tx_bytes += iface.tx_bytes;
            acc.tx_packets += iface.tx_packets;
            acc.tx_errors += iface.tx_errors;
            acc.tx_dropped += iface.tx_dropped;
            acc
        })
}

fn entries(series: Vec<BlkioEntry>) -> Vec<BlkioStatEntry> {
    series
        .into_iter()
        .map(|e| BlkioStatEntry {
            major: e.major,
            minor: e.minor,
            op: e.op,
            value: e.value,
        })
        .collect()
}
