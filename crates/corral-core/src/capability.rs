//! Linux capability names and bounding-set formatting.
//!
//! Containers start from an empty bounding set and only retain the
//! capabilities listed in their isolation configuration.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use corral_common::error::CorralError;

macro_rules! capabilities {
    ($($variant:ident => $name:literal,)+) => {
        /// Linux capability identifiers.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        #[allow(missing_docs)]
        pub enum Capability {
            $($variant,)+
        }

        impl Capability {
            /// Every capability known to this crate, in kernel bit order.
            pub const ALL: &'static [Self] = &[$(Self::$variant,)+];

            /// Upper-case name without the `CAP_` prefix, e.g. `NET_RAW`.
            #[must_use]
            pub const fn name(self) -> &'static str {
                match self {
                    $(Self::$variant => $name,)+
                }
            }
        }
    };
}

capabilities! {
    Chown => "CHOWN",
    DacOverride => "DAC_OVERRIDE",
    DacReadSearch => "DAC_READ_SEARCH",
    Fowner => "FOWNER",
    Fsetid => "FSETID",
    Kill => "KILL",
    Setgid => "SETGID",
    Setuid => "SETUID",
    Setpcap => "SETPCAP",
    LinuxImmutable => "LINUX_IMMUTABLE",
    NetBindService => "NET_BIND_SERVICE",
    NetBroadcast => "NET_BROADCAST",
    NetAdmin => "NET_ADMIN",
    NetRaw => "NET_RAW",
    IpcLock => "IPC_LOCK",
    IpcOwner => "IPC_OWNER",
    SysModule => "SYS_MODULE",
    SysRawio => "SYS_RAWIO",
    SysChroot => "SYS_CHROOT",
    SysPtrace => "SYS_PTRACE",
    SysPacct => "SYS_PACCT",
    SysAdmin => "SYS_ADMIN",
    SysBoot => "SYS_BOOT",
    SysNice => "SYS_NICE",
    SysResource => "SYS_RESOURCE",
    SysTime => "SYS_TIME",
    SysTtyConfig => "SYS_TTY_CONFIG",
    Mknod => "MKNOD",
    Lease => "LEASE",
    AuditWrite => "AUDIT_WRITE",
    AuditControl => "AUDIT_CONTROL",
    Setfcap => "SETFCAP",
    MacOverride => "MAC_OVERRIDE",
    MacAdmin => "MAC_ADMIN",
    Syslog => "SYSLOG",
    WakeAlarm => "WAKE_ALARM",
    BlockSuspend => "BLOCK_SUSPEND",
    AuditRead => "AUDIT_READ",
    Perfmon => "PERFMON",
    Bpf => "BPF",
    CheckpointRestore => "CHECKPOINT_RESTORE",
}

impl Capability {
    /// Lower-case name as accepted by `setpriv --bounding-set`.
    #[must_use]
    pub fn setpriv_name(self) -> String {
        self.name().to_ascii_lowercase()
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Capability {
    type Err = CorralError;

    /// Accepts `NET_RAW`, `net_raw` and `CAP_NET_RAW` spellings.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        let bare = upper.strip_prefix("CAP_").unwrap_or(&upper);
        Self::ALL
            .iter()
            .copied()
            .find(|cap| cap.name() == bare)
            .ok_or_else(|| CorralError::Config {
                message: format!("unknown capability: {s}"),
            })
    }
}

impl TryFrom<String> for Capability {
    type Error = CorralError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Capability> for String {
    fn from(cap: Capability) -> Self {
        cap.name().to_string()
    }
}

/// Builds the `setpriv --bounding-set` argument that clears every capability
/// except those in `keep`.
#[must_use]
pub fn bounding_set_arg(keep: &[Capability]) -> String {
    let mut arg = String::from("-all");
    for cap in keep {
        arg.push_str(",+");
        arg.push_str(&cap.setpriv_name());
    }
    tracing::trace!(retained = keep.len(), "computed capability bounding set");
    arg
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_all_spellings() {
        assert_eq!("NET_RAW".parse::<Capability>().unwrap(), Capability::NetRaw);
        assert_eq!("net_raw".parse::<Capability>().unwrap(), Capability::NetRaw);
        assert_eq!("CAP_NET_RAW".parse::<Capability>().unwrap(), Capability::NetRaw);
    }

    #[test]
    fn rejects_unknown_names() {
        assert!("FLY".parse::<Capability>().is_err());
    }

    #[test]
    fn names_round_trip_through_parse() {
        for cap in Capability::ALL {
            assert_eq!(cap.name().parse::<Capability>().unwrap(), *cap);
        }
    }

    #[test]
    fn bounding_set_clears_then_adds() {
        let arg = bounding_set_arg(&[Capability::Chown, Capability::Kill]);
        assert_eq!(arg, "-all,+chown,+kill");
    }

    #[test]
    fn empty_bounding_set_drops_everything() {
        assert_eq!(bounding_set_arg(&[]), "-all");
    }

    #[test]
    fn serializes_as_kernel_name() {
        let json = serde_json::to_string(&Capability::SysChroot).unwrap();
        assert_eq!(json, "\"SYS_CHROOT\"");
    }
}
