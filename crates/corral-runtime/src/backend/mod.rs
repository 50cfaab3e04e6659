//! Runtime backend abstraction.
//!
//! The driver drives containers through these traits and never touches
//! namespaces or cgroups itself. [`linux`] is the native implementation;
//! tests substitute in-memory fakes.

#[cfg(target_os = "linux")]
pub mod linux;

use crossbeam_channel::Receiver;
use nix::sys::signal::Signal;

use corral_common::error::Result;
use corral_common::types::ContainerId;
use corral_core::cgroup::stats::CgroupStats;
use corral_core::proc::InterfaceStats;
use corral_core::profile::IsolationConfig;

use crate::command::ProcessConfig;
use crate::console::ProcessIo;

/// A process to start inside a container, with its console descriptors.
#[derive(Debug)]
pub struct ProcessLaunch {
    /// What to run.
    pub process: ProcessConfig,
    /// Descriptors installed as the process's stdio.
    pub io: ProcessIo,
}

/// Identity of a container's init process as tracked by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandleState {
    /// Host pid of the init process.
    pub init_pid: i32,
    /// Start time of the init process in clock ticks since boot.
    pub init_start_time: u64,
}

/// Unnormalized accounting read from the backend.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawStats {
    /// Per-interface traffic counters.
    pub interfaces: Vec<InterfaceStats>,
    /// Cgroup accounting, absent when the backend has none.
    pub cgroup: Option<CgroupStats>,
}

/// Creates runtime handles.
pub trait RuntimeFactory: Send + Sync {
    /// Creates the isolation for container `id` without starting anything.
    ///
    /// # Errors
    ///
    /// Returns an error if the container's isolation cannot be set up.
    fn create(&self, id: &ContainerId, config: &IsolationConfig) -> Result<Box<dyn RuntimeHandle>>;
}

/// Live isolation of one container.
pub trait RuntimeHandle: Send + Sync {
    /// Configuration the handle was created from.
    fn config(&self) -> &IsolationConfig;

    /// Host uid the container's root user maps to.
    fn host_uid(&self) -> u32 {
        0
    }

    /// Starts the init process.
    ///
    /// # Errors
    ///
    /// Returns an error if the process cannot be started.
    fn start(&self, launch: ProcessLaunch) -> Result<Box<dyn ContainerProcess>>;

    /// Starts an additional process next to the running init process.
    ///
    /// # Errors
    ///
    /// Returns an error if the init process is not running or the process
    /// cannot be started.
    fn exec(&self, launch: ProcessLaunch) -> Result<Box<dyn ContainerProcess>>;

    /// Freezes every process.
    ///
    /// # Errors
    ///
    /// Returns an error if the processes cannot be frozen.
    fn pause(&self) -> Result<()>;

    /// Thaws frozen processes.
    ///
    /// # Errors
    ///
    /// Returns an error if the processes cannot be thawed.
    fn resume(&self) -> Result<()>;

    /// Identity of the init process.
    ///
    /// # Errors
    ///
    /// Returns an error if no init process was started.
    fn state(&self) -> Result<HandleState>;

    /// Host pids of every process in the container.
    ///
    /// # Errors
    ///
    /// Returns an error if the process list cannot be read.
    fn processes(&self) -> Result<Vec<i32>>;

    /// Current accounting.
    ///
    /// # Errors
    ///
    /// Returns an error if accounting cannot be read.
    fn stats(&self) -> Result<RawStats>;

    /// Subscribes to OOM-kill events. Each event delivers one `()`; the
    /// channel disconnects when the backend stops watching.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot report OOM events.
    fn notify_oom(&self) -> Result<Receiver<()>>;

    /// Tears down the isolation, killing anything still running in it.
    /// Destroying twice succeeds.
    ///
    /// # Errors
    ///
    /// Returns an error if resources cannot be released.
    fn destroy(&self) -> Result<()>;
}

/// A started process.
pub trait ContainerProcess: Send {
    /// Host pid.
    fn pid(&self) -> i32;

    /// Blocks until the process exits and reaps it.
    ///
    /// # Errors
    ///
    /// Returns an error if waiting fails.
    fn wait(&mut self) -> Result<std::process::ExitStatus>;

    /// Sends `signal` to the process.
    ///
    /// # Errors
    ///
    /// Returns an error if delivery fails.
    fn signal(&mut self, signal: Signal) -> Result<()>;
}
