//! Raw cgroup counters as read from the unified hierarchy.
//!
//! These types mirror the control files closely and are free to change with
//! the kernel interface. Consumers outside the runtime should use the
//! normalized record produced by the execution driver instead.

use std::collections::HashMap;
use std::fmt;

use serde::Serialize;

/// Statistics for one cgroup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CgroupStats {
    /// CPU accounting.
    pub cpu: CpuStats,
    /// Memory accounting.
    pub memory: MemoryStats,
    /// Block I/O accounting.
    pub blkio: BlkioStats,
}

/// CPU accounting for a cgroup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CpuStats {
    /// Usage counters.
    pub usage: CpuUsage,
    /// Bandwidth throttling counters.
    pub throttling: ThrottlingData,
}

/// CPU time consumed by the cgroup, in nanoseconds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CpuUsage {
    /// Total CPU time.
    pub total: u64,
    /// Total CPU time per core. Empty when the hierarchy does not report it.
    pub per_core: Vec<u64>,
    /// Time spent in kernel mode.
    pub kernel: u64,
    /// Time spent in user mode.
    pub user: u64,
}

/// CFS bandwidth throttling counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ThrottlingData {
    /// Number of enforcement periods that elapsed.
    pub periods: u64,
    /// Number of periods in which the cgroup was throttled.
    pub throttled_periods: u64,
    /// Total throttled time in nanoseconds.
    pub throttled_time: u64,
}

/// Memory accounting for a cgroup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MemoryStats {
    /// Current usage in bytes.
    pub usage: u64,
    /// Peak usage in bytes.
    pub max_usage: u64,
    /// Number of times usage hit the limit.
    pub fail_count: u64,
    /// Configured limit in bytes, 0 when unlimited.
    pub limit: u64,
    /// Named counters from `memory.stat`.
    pub stats: HashMap<String, u64>,
}

/// Block I/O accounting, one list of entries per series.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BlkioStats {
    /// Bytes transferred per device and direction.
    pub service_bytes: Vec<BlkioEntry>,
    /// Operations issued per device and direction.
    pub serviced: Vec<BlkioEntry>,
    /// Requests queued.
    pub queued: Vec<BlkioEntry>,
    /// Time between dispatch and completion.
    pub service_time: Vec<BlkioEntry>,
    /// Time spent waiting in scheduler queues.
    pub wait_time: Vec<BlkioEntry>,
    /// Requests merged.
    pub merged: Vec<BlkioEntry>,
    /// Device time.
    pub time: Vec<BlkioEntry>,
    /// Sectors transferred.
    pub sectors: Vec<BlkioEntry>,
}

/// One counter for a block device.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct BlkioEntry {
    /// Device major number.
    pub major: u64,
    /// Device minor number.
    pub minor: u64,
    /// Operation the value counts (`Read`, `Write`, ...).
    pub op: String,
    /// Counter value.
    pub value: u64,
}

impl fmt::Display for BlkioEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} {} {}", self.major, self.minor, self.op, self.value)
    }
}
