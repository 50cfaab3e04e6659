//! Isolation configuration and the default profile every container starts from.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::capability::Capability;
use crate::cgroup::CgroupConfig;
use crate::namespace::NamespaceKind;

/// Everything a runtime backend needs to materialize an isolated container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IsolationConfig {
    /// Capabilities retained in the bounding set.
    pub capabilities: Vec<Capability>,
    /// Namespaces the init process is isolated in.
    pub namespaces: Vec<NamespaceKind>,
    /// Cgroup placement and limits.
    pub cgroup: CgroupConfig,
    /// AppArmor profile applied to every process, if any.
    pub apparmor_profile: Option<String>,
    /// Root filesystem to switch into; `None` shares the host root.
    pub rootfs: Option<PathBuf>,
}

impl IsolationConfig {
    /// Whether the configuration isolates `kind`.
    #[must_use]
    pub fn has_namespace(&self, kind: NamespaceKind) -> bool {
        self.namespaces.contains(&kind)
    }

    /// Adds capabilities not already retained, keeping the existing order.
    pub fn add_capabilities(&mut self, extra: &[Capability]) {
        for cap in extra {
            if !self.capabilities.contains(cap) {
                self.capabilities.push(*cap);
            }
        }
    }

    /// Adds namespaces not already isolated, keeping the existing order.
    pub fn add_namespaces(&mut self, extra: &[NamespaceKind]) {
        for kind in extra {
            if !self.namespaces.contains(kind) {
                self.namespaces.push(*kind);
            }
        }
    }
}

/// Capabilities every container keeps.
pub const DEFAULT_CAPABILITIES: &[Capability] = &[
    Capability::Chown,
    Capability::DacOverride,
    Capability::Fsetid,
    Capability::Fowner,
    Capability::Mknod,
    Capability::NetRaw,
    Capability::Setgid,
    Capability::Setuid,
    Capability::Setfcap,
    Capability::Setpcap,
    Capability::NetBindService,
    Capability::SysChroot,
    Capability::Kill,
    Capability::AuditWrite,
];

/// Namespaces every container is isolated in.
pub const DEFAULT_NAMESPACES: &[NamespaceKind] = &[
    NamespaceKind::Mount,
    NamespaceKind::Uts,
    NamespaceKind::Ipc,
    NamespaceKind::Pid,
    NamespaceKind::Network,
];

/// Builds the baseline isolation configuration.
///
/// `apparmor_profile` is attached only when `apparmor_enabled` is set; pass
/// [`crate::apparmor::is_enabled`] for the running host.
#[must_use]
pub fn default_profile(
    cgroup_parent: &str,
    apparmor_enabled: bool,
    apparmor_profile: &str,
) -> IsolationConfig {
    IsolationConfig {
        capabilities: DEFAULT_CAPABILITIES.to_vec(),
        namespaces: DEFAULT_NAMESPACES.to_vec(),
        cgroup: CgroupConfig {
            parent: cgroup_parent.to_string(),
            allow_all_devices: false,
            ..CgroupConfig::default()
        },
        apparmor_profile: apparmor_enabled.then(|| apparmor_profile.to_string()),
        rootfs: None,
    }
}
