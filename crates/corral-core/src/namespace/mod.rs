//! Linux namespace kinds and their util-linux flag spellings.
//!
//! Namespace creation is delegated to `unshare(1)` and joining to
//! `nsenter(1)`; this module owns the mapping from an isolation
//! configuration to the flags those tools expect.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use corral_common::error::CorralError;

/// A namespace type a container can be isolated in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum NamespaceKind {
    /// Private mount table.
    Mount,
    /// Private hostname and domain name.
    Uts,
    /// Private System V IPC objects and POSIX message queues.
    Ipc,
    /// Private process id space; the entrypoint becomes pid 1.
    Pid,
    /// Private network stack.
    Network,
    /// UID/GID remapping.
    User,
    /// Private view of the cgroup hierarchy.
    Cgroup,
}

impl NamespaceKind {
    /// Every supported namespace kind.
    pub const ALL: &'static [Self] = &[
        Self::Mount,
        Self::Uts,
        Self::Ipc,
        Self::Pid,
        Self::Network,
        Self::User,
        Self::Cgroup,
    ];

    /// Clone-flag style name, e.g. `NEWNS`.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Mount => "NEWNS",
            Self::Uts => "NEWUTS",
            Self::Ipc => "NEWIPC",
            Self::Pid => "NEWPID",
            Self::Network => "NEWNET",
            Self::User => "NEWUSER",
            Self::Cgroup => "NEWCGROUP",
        }
    }

    /// Long option shared by `unshare(1)` and `nsenter(1)`.
    #[must_use]
    pub const fn util_linux_flag(self) -> &'static str {
        match self {
            Self::Mount => "--mount",
            Self::Uts => "--uts",
            Self::Ipc => "--ipc",
            Self::Pid => "--pid",
            Self::Network => "--net",
            Self::User => "--user",
            Self::Cgroup => "--cgroup",
        }
    }
}

impl fmt::Display for NamespaceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for NamespaceKind {
    type Err = CorralError;

    /// Accepts clone-flag names (`NEWNET`) and short names (`net`, `network`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let kind = match s.trim().to_ascii_lowercase().as_str() {
            "newns" | "mount" | "mnt" => Self::Mount,
            "newuts" | "uts" => Self::Uts,
            "newipc" | "ipc" => Self::Ipc,
            "newpid" | "pid" => Self::Pid,
            "newnet" | "net" | "network" => Self::Network,
            "newuser" | "user" => Self::User,
            "newcgroup" | "cgroup" => Self::Cgroup,
            _ => {
                return Err(CorralError::Config {
                    message: format!("unknown namespace: {s}"),
                });
            }
        };
        Ok(kind)
    }
}

impl TryFrom<String> for NamespaceKind {
    type Error = CorralError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<NamespaceKind> for String {
    fn from(kind: NamespaceKind) -> Self {
        kind.name().to_string()
    }
}

/// Returns the util-linux flags for `namespaces`, in a stable order and
/// without duplicates.
#[must_use]
pub fn util_linux_flags(namespaces: &[NamespaceKind]) -> Vec<&'static str> {
    let mut kinds = namespaces.to_vec();
    kinds.sort_unstable();
    kinds.dedup();
    tracing::trace!(namespaces = ?kinds, "namespace flags");
    kinds.into_iter().map(NamespaceKind::util_linux_flag).collect()
}
