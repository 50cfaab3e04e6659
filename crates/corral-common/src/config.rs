//! Configuration model for the execution driver.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::constants;
use crate::error::{CorralError, Result};

/// Root configuration for a driver instance.
///
/// Every field has a default, so a configuration file only needs to list the
/// values it overrides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Directory holding driver-owned per-container state.
    pub root: PathBuf,
    /// Mount point of the cgroup v2 unified hierarchy.
    pub cgroup_root: PathBuf,
    /// Cgroup grouping every container cgroup is created under.
    pub cgroup_parent: String,
    /// AppArmor profile attached when AppArmor is enabled.
    pub apparmor_profile: String,
    /// Poll interval of the native backend's OOM event watcher.
    pub oom_poll_interval_ms: u64,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(constants::DEFAULT_ROOT),
            cgroup_root: PathBuf::from(constants::CGROUP_V2_PATH),
            cgroup_parent: constants::DEFAULT_CGROUP_PARENT.to_string(),
            apparmor_profile: constants::DEFAULT_APPARMOR_PROFILE.to_string(),
            oom_poll_interval_ms: constants::OOM_POLL_INTERVAL_MS,
        }
    }
}

impl DriverConfig {
    /// Creates a configuration rooted at `root` with defaults elsewhere.
    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    /// Loads a configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, is not valid JSON, or
    /// names an empty cgroup parent.
    pub fn load(path: &Path) -> Result<Self> {
        tracing::debug!(path = %path.display(), "loading driver configuration");
        let content = std::fs::read_to_string(path).map_err(|e| CorralError::io(path, e))?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks values that have no sensible fallback.
    ///
    /// # Errors
    ///
    /// Returns [`CorralError::Config`] describing the first invalid field.
    pub fn validate(&self) -> Result<()> {
        if self.cgroup_parent.trim().is_empty() {
            return Err(CorralError::Config {
                message: "cgroup_parent must not be empty".into(),
            });
        }
        if self.oom_poll_interval_ms == 0 {
            return Err(CorralError::Config {
                message: "oom_poll_interval_ms must be greater than zero".into(),
            });
        }
        Ok(())
    }

    /// Directory holding the state of one container.
    #[must_use]
    pub fn container_dir(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_use_constants() {
        let config = DriverConfig::default();
        assert_eq!(config.cgroup_parent, "corral");
        assert_eq!(config.root, PathBuf::from(constants::DEFAULT_ROOT));
    }

    #[test]
    fn load_merges_partial_file_with_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("driver.json");
        std::fs::write(&path, r#"{ "root": "/tmp/corral-test", "cgroup_parent": "ci" }"#)
            .expect("write config");

        let config = DriverConfig::load(&path).expect("load");
        assert_eq!(config.root, PathBuf::from("/tmp/corral-test"));
        assert_eq!(config.cgroup_parent, "ci");
        assert_eq!(config.apparmor_profile, constants::DEFAULT_APPARMOR_PROFILE);
    }

    #[test]
    fn load_rejects_empty_parent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("driver.json");
        std::fs::write(&path, r#"{ "cgroup_parent": "  " }"#).expect("write config");

        let err = DriverConfig::load(&path).unwrap_err();
        assert!(matches!(err, CorralError::Config { .. }));
    }

    #[test]
    fn load_missing_file_reports_path() {
        let err = DriverConfig::load(Path::new("/nonexistent/driver.json")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/driver.json"));
    }

    #[test]
    fn container_dir_is_keyed_by_id() {
        let config = DriverConfig::with_root("/run/corral");
        assert_eq!(config.container_dir("abc"), PathBuf::from("/run/corral/abc"));
    }
}
