//! Process specifications handed to the execution driver.

use std::path::PathBuf;

use corral_common::error::{CorralError, Result};
use corral_common::types::{ContainerId, ResourceLimits};
use corral_core::capability::Capability;
use corral_core::namespace::NamespaceKind;

/// A process to run inside a container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessConfig {
    /// Program to execute.
    pub entrypoint: String,
    /// Arguments following the entrypoint.
    pub arguments: Vec<String>,
    /// Environment as `KEY=value` entries. The process inherits nothing else.
    pub env: Vec<String>,
    /// Working directory inside the container.
    pub working_dir: Option<PathBuf>,
    /// `uid[:gid]` to run as; empty runs as the container's root.
    pub user: String,
    /// Whether to attach a pseudo-terminal.
    pub tty: bool,
}

impl ProcessConfig {
    /// Creates a process running `entrypoint` with `arguments`.
    #[must_use]
    pub fn new(entrypoint: impl Into<String>, arguments: Vec<String>) -> Self {
        Self {
            entrypoint: entrypoint.into(),
            arguments,
            ..Self::default()
        }
    }

    /// Entrypoint followed by its arguments.
    #[must_use]
    pub fn argv(&self) -> Vec<String> {
        std::iter::once(self.entrypoint.clone())
            .chain(self.arguments.iter().cloned())
            .collect()
    }

    /// Environment split into key/value pairs. Entries without `=` are
    /// passed with an empty value.
    pub fn env_pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.env
            .iter()
            .map(|entry| entry.split_once('=').unwrap_or((entry.as_str(), "")))
    }

    /// Parses [`ProcessConfig::user`].
    ///
    /// # Errors
    ///
    /// Returns an error if the user is not numeric `uid` or `uid:gid`.
    pub fn user_spec(&self) -> Result<Option<UserSpec>> {
        UserSpec::parse(&self.user)
    }
}

/// Numeric identity a process switches to before exec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserSpec {
    /// User id.
    pub uid: u32,
    /// Group id; defaults to the uid when omitted.
    pub gid: u32,
}

impl UserSpec {
    /// Parses `uid` or `uid:gid`. An empty string means "no switch".
    ///
    /// # Errors
    ///
    /// Returns an error for user or group names, which need the container's
    /// passwd database to resolve.
    pub fn parse(user: &str) -> Result<Option<Self>> {
        let user = user.trim();
        if user.is_empty() {
            return Ok(None);
        }
        let invalid = || CorralError::Config {
            message: format!("user must be numeric uid[:gid], got {user:?}"),
        };
        let (uid, gid) = match user.split_once(':') {
            Some((uid, gid)) => (uid, Some(gid)),
            None => (user, None),
        };
        let uid: u32 = uid.parse().map_err(|_| invalid())?;
        let gid = match gid {
            Some(gid) => gid.parse().map_err(|_| invalid())?,
            None => uid,
        };
        Ok(Some(Self { uid, gid }))
    }
}

/// A container to create and run: the init process plus its isolation
/// requirements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// Container identifier, the registry key.
    pub id: ContainerId,
    /// The init process.
    pub process: ProcessConfig,
    /// Cgroup limits.
    pub resources: ResourceLimits,
    /// Capabilities added to the default profile.
    pub capabilities: Vec<Capability>,
    /// Namespaces added to the default profile.
    pub namespaces: Vec<NamespaceKind>,
    /// Root filesystem to switch into; `None` shares the host root.
    pub rootfs: Option<PathBuf>,
}

impl Command {
    /// Creates a command with default limits and no profile additions.
    #[must_use]
    pub fn new(id: ContainerId, process: ProcessConfig) -> Self {
        Self {
            id,
            process,
            resources: ResourceLimits::default(),
            capabilities: Vec::new(),
            namespaces: Vec::new(),
            rootfs: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn argv_starts_with_entrypoint() {
        let p = ProcessConfig::new("/bin/echo", vec!["hi".into(), "there".into()]);
        assert_eq!(p.argv(), vec!["/bin/echo", "hi", "there"]);
    }

    #[test]
    fn env_pairs_split_on_first_equals() {
        let p = ProcessConfig {
            env: vec!["A=1".into(), "B=x=y".into(), "C".into()],
            ..ProcessConfig::default()
        };
        let pairs: Vec<_> = p.env_pairs().collect();
        assert_eq!(pairs, vec![("A", "1"), ("B", "x=y"), ("C", "")]);
    }

    #[test]
    fn user_spec_parses_numeric_forms() {
        assert_eq!(UserSpec::parse("").unwrap(), None);
        assert_eq!(
            UserSpec::parse("1000").unwrap(),
            Some(UserSpec { uid: 1000, gid: 1000 })
        );
        assert_eq!(
            UserSpec::parse("1000:50").unwrap(),
            Some(UserSpec { uid: 1000, gid: 50 })
        );
    }

    #[test]
    fn user_spec_rejects_names() {
        assert!(UserSpec::parse("www-data").is_err());
        assert!(UserSpec::parse("0:wheel").is_err());
    }
}
