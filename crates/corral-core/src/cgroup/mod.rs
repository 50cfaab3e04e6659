//! Cgroups v2 resource management.
//!
//! Provides interfaces for creating cgroup hierarchies, setting resource
//! limits for CPU, memory and cpusets, freezing, and reading accounting
//! data via the unified hierarchy at `/sys/fs/cgroup`.

pub mod cpu;
pub mod io;
pub mod memory;
pub mod stats;

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use corral_common::error::{CorralError, Result};

use self::stats::CgroupStats;

/// Controllers the driver delegates to container cgroups.
const CONTROLLERS: &str = "+cpu +cpuset +io +memory +pids";

/// Attempts made to remove a cgroup whose processes are still exiting.
const REMOVE_ATTEMPTS: u32 = 20;

/// Cgroup section of an isolation configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CgroupConfig {
    /// Grouping directory under the hierarchy root.
    pub parent: String,
    /// Leaf directory name, normally the container id.
    pub name: String,
    /// Whether every device node may be accessed.
    pub allow_all_devices: bool,
    /// Memory limit in bytes, 0 when unlimited.
    pub memory: u64,
    /// CPU shares, 0 when unset.
    pub cpu_shares: u64,
    /// Cpuset CPU list, empty when unset.
    pub cpuset_cpus: String,
}

/// Handle to a cgroup for a specific container.
#[derive(Debug, Clone)]
pub struct CgroupManager {
    /// Path to this container's cgroup directory.
    path: PathBuf,
}

impl CgroupManager {
    /// Creates the cgroup `<root>/<parent>/<name>`.
    ///
    /// Controller delegation to the new cgroup is best effort: a controller
    /// that cannot be enabled only disables the matching limit.
    ///
    /// The leaf must not exist yet; a live cgroup belongs to another handle.
    ///
    /// # Errors
    ///
    /// Returns an error if the leaf already exists or a directory cannot be
    /// created.
    pub fn create(root: &Path, parent: &str, name: &str) -> Result<Self> {
        let parent_path = root.join(parent);
        std::fs::create_dir_all(&parent_path).map_err(|e| CorralError::io(&parent_path, e))?;
        enable_controllers(root);
        enable_controllers(&parent_path);

        let path = parent_path.join(name);
        std::fs::create_dir(&path).map_err(|e| CorralError::io(&path, e))?;
        tracing::info!(path = %path.display(), "cgroup created");
        Ok(Self { path })
    }

    /// Wraps an existing cgroup directory.
    #[must_use]
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the cgroup directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Applies the resource limits of `config` to this cgroup.
    ///
    /// # Errors
    ///
    /// Returns an error if writing to a cgroup control file fails.
    pub fn apply(&self, config: &CgroupConfig) -> Result<()> {
        if config.memory > 0 {
            memory::set_memory_max(&self.path, config.memory)?;
        }
        if config.cpu_shares > 0 {
            cpu::set_cpu_shares(&self.path, config.cpu_shares)?;
        }
        if !config.cpuset_cpus.is_empty() {
            cpu::set_cpuset_cpus(&self.path, &config.cpuset_cpus)?;
        }
        Ok(())
    }

    /// Opens `cgroup.procs` for writing.
    ///
    /// A process that writes `0` to the returned file moves itself into the
    /// cgroup, which lets a freshly forked child join before it execs.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened.
    pub fn open_procs(&self) -> Result<File> {
        let path = self.path.join("cgroup.procs");
        OpenOptions::new()
            .write(true)
            .open(&path)
            .map_err(|e| CorralError::io(path, e))
    }

    /// Adds a process to this cgroup by writing its PID.
    ///
    /// # Errors
    ///
    /// Returns an error if writing to `cgroup.procs` fails.
    pub fn add_process(&self, pid: i32) -> Result<()> {
        write_control(&self.path, "cgroup.procs", &pid.to_string())?;
        tracing::debug!(pid, "added process to cgroup");
        Ok(())
    }

    /// Lists the pids currently in this cgroup.
    ///
    /// # Errors
    ///
    /// Returns an error if `cgroup.procs` cannot be read.
    pub fn processes(&self) -> Result<Vec<i32>> {
        let content = read_control(&self.path, "cgroup.procs")?;
        Ok(content
            .lines()
            .filter_map(|line| line.trim().parse().ok())
            .collect())
    }

    /// Freezes every process in the cgroup.
    ///
    /// # Errors
    ///
    /// Returns an error if writing to `cgroup.freeze` fails.
    pub fn freeze(&self) -> Result<()> {
        write_control(&self.path, "cgroup.freeze", "1")?;
        tracing::debug!(path = %self.path.display(), "cgroup frozen");
        Ok(())
    }

    /// Thaws a frozen cgroup.
    ///
    /// # Errors
    ///
    /// Returns an error if writing to `cgroup.freeze` fails.
    pub fn thaw(&self) -> Result<()> {
        write_control(&self.path, "cgroup.freeze", "0")?;
        tracing::debug!(path = %self.path.display(), "cgroup thawed");
        Ok(())
    }

    /// Reads CPU, memory and block I/O accounting.
    ///
    /// # Errors
    ///
    /// Returns an error if a required control file cannot be read, which
    /// includes the cgroup having been removed concurrently.
    pub fn stats(&self) -> Result<CgroupStats> {
        Ok(CgroupStats {
            cpu: cpu::read_stats(&self.path)?,
            memory: memory::read_stats(&self.path)?,
            blkio: io::read_stats(&self.path)?,
        })
    }

    /// Returns the cumulative OOM-kill count of the cgroup.
    ///
    /// # Errors
    ///
    /// Returns an error if `memory.events` cannot be read.
    pub fn oom_kill_count(&self) -> Result<u64> {
        memory::oom_kill_count(&self.path)
    }

    /// Kills any remaining processes and removes the cgroup.
    ///
    /// Removing an already removed cgroup succeeds.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory still cannot be removed after the
    /// processes had time to exit.
    pub fn destroy(&self) -> Result<()> {
        if !self.path.exists() {
            return Ok(());
        }
        if self.path.join("cgroup.kill").exists() {
            if let Err(e) = write_control(&self.path, "cgroup.kill", "1") {
                tracing::debug!(error = %e, "cgroup.kill failed");
            }
        }
        let mut attempt = 0;
        loop {
            match std::fs::remove_dir(&self.path) {
                Ok(()) => break,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => break,
                Err(e) if attempt + 1 >= REMOVE_ATTEMPTS => {
                    return Err(CorralError::io(&self.path, e));
                }
                Err(_) => {
                    attempt += 1;
                    std::thread::sleep(Duration::from_millis(10));
                }
            }
        }
        tracing::info!(path = %self.path.display(), "cgroup destroyed");
        Ok(())
    }
}

/// Delegates the container controllers to children of `dir`.
fn enable_controllers(dir: &Path) {
    if let Err(e) = write_control(dir, "cgroup.subtree_control", CONTROLLERS) {
        tracing::debug!(dir = %dir.display(), error = %e, "controller delegation failed");
    }
}

pub(crate) fn read_control(cgroup_path: &Path, file: &str) -> Result<String> {
    let path = cgroup_path.join(file);
    std::fs::read_to_string(&path).map_err(|e| CorralError::io(path, e))
}

pub(crate) fn write_control(cgroup_path: &Path, file: &str, value: &str) -> Result<()> {
    let path = cgroup_path.join(file);
    std::fs::write(&path, value).map_err(|e| CorralError::io(path, e))
}

/// Parses `key value` lines, skipping lines that do not hold an integer.
pub(crate) fn parse_flat_keyed(content: &str) -> HashMap<String, u64> {
    content
        .lines()
        .filter_map(|line| {
            let (key, value) = line.split_once(' ')?;
            Some((key.to_string(), value.trim().parse().ok()?))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> (tempfile::TempDir, CgroupManager) {
        let dir = tempfile::tempdir().expect("tempdir");
        let cg = CgroupManager::at(dir.path());
        (dir, cg)
    }

    #[test]
    fn create_builds_parent_and_leaf() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cg = CgroupManager::create(dir.path(), "corral", "abc").expect("create");
        assert!(cg.path().ends_with("corral/abc"));
        assert!(cg.path().is_dir());
    }

    #[test]
    fn create_refuses_an_existing_leaf() {
        let dir = tempfile::tempdir().expect("tempdir");
        let first = CgroupManager::create(dir.path(), "corral", "abc").expect("create");
        let err = CgroupManager::create(dir.path(), "corral", "abc").unwrap_err();
        assert!(matches!(
            err,
            CorralError::Io { ref source, .. } if source.kind() == std::io::ErrorKind::AlreadyExists
        ));
        assert!(first.path().is_dir());
    }

    #[test]
    fn stats_without_memory_controller_are_zeroed() {
        let (dir, cg) = fixture();
        std::fs::write(dir.path().join("cpu.stat"), "usage_usec 7\n").expect("write");
        let stats = cg.stats().expect("stats");
        assert_eq!(stats.cpu.usage.total, 7_000);
        assert_eq!(stats.memory.usage, 0);
        assert!(stats.blkio.service_bytes.is_empty());
    }

    #[test]
    fn apply_skips_unset_limits() {
        let (dir, cg) = fixture();
        cg.apply(&CgroupConfig {
            memory: 1024,
            ..CgroupConfig::default()
        })
        .expect("apply");
        assert!(dir.path().join("memory.max").exists());
        assert!(!dir.path().join("cpu.weight").exists());
        assert!(!dir.path().join("cpuset.cpus").exists());
    }

    #[test]
    fn processes_parses_procs_file() {
        let (dir, cg) = fixture();
        std::fs::write(dir.path().join("cgroup.procs"), "12\n34\n\n").expect("write");
        assert_eq!(cg.processes().expect("read"), vec![12, 34]);
    }

    #[test]
    fn freeze_and_thaw_write_freezer() {
        let (dir, cg) = fixture();
        cg.freeze().expect("freeze");
        let frozen = std::fs::read_to_string(dir.path().join("cgroup.freeze")).expect("read");
        assert_eq!(frozen, "1");
        cg.thaw().expect("thaw");
        let thawed = std::fs::read_to_string(dir.path().join("cgroup.freeze")).expect("read");
        assert_eq!(thawed, "0");
    }

    #[test]
    fn stats_fail_when_cgroup_is_gone() {
        let cg = CgroupManager::at("/nonexistent/corral/gone");
        assert!(cg.stats().is_err());
    }

    #[test]
    fn destroy_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cg = CgroupManager::create(dir.path(), "corral", "gone").expect("create");
        cg.destroy().expect("first destroy");
        cg.destroy().expect("second destroy");
        assert!(!cg.path().exists());
    }

    #[test]
    fn flat_keyed_skips_non_numeric() {
        let map = parse_flat_keyed("a 1\nb x\nc 3\n");
        assert_eq!(map.len(), 2);
        assert_eq!(map.get("c"), Some(&3));
    }
}
