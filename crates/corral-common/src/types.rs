//! Domain primitive types used across the Corral workspace.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{CorralError, Result};

/// Unique identifier for a container instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContainerId(String);

impl ContainerId {
    /// Creates a new container ID from a string value without checking it.
    ///
    /// Ids from untrusted input go through [`ContainerId::parse`]; the driver
    /// re-checks ids before using them as path components.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Creates a container ID, rejecting values that are unsafe as a single
    /// path component.
    ///
    /// # Errors
    ///
    /// Returns [`CorralError::Config`] unless the id is non-empty, consists of
    /// ASCII letters, digits, `_`, `.` and `-`, and is not `.` or `..`.
    pub fn parse(id: impl Into<String>) -> Result<Self> {
        let id = Self(id.into());
        id.validate()?;
        Ok(id)
    }

    /// Checks that the id can name a directory under the state root and a
    /// cgroup leaf.
    ///
    /// # Errors
    ///
    /// See [`ContainerId::parse`].
    pub fn validate(&self) -> Result<()> {
        let id = self.0.as_str();
        let allowed = |c: char| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-');
        if id.is_empty() || id == "." || id == ".." || !id.chars().all(allowed) {
            return Err(CorralError::Config {
                message: format!("invalid container id {id:?}"),
            });
        }
        Ok(())
    }

    /// Generates a random container ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Returns the inner string representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ContainerId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl std::str::FromStr for ContainerId {
    type Err = CorralError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Resource limits for a container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Memory limit in bytes. `None` leaves the cgroup unlimited.
    pub memory_bytes: Option<u64>,
    /// CPU shares (relative weight, cgroup v1 scale 2-262144).
    pub cpu_shares: Option<u64>,
    /// CPUs the container may run on, in cpuset list syntax (`0-3,6`).
    pub cpuset_cpus: Option<String>,
}

/// Lifecycle state of a container as seen by one driver instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContainerState {
    /// The init process is running.
    Running,
    /// All processes are frozen.
    Paused,
    /// No live process tree is tracked for the container.
    Stopped,
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}
