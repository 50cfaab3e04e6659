//! System-wide constants and default paths.

/// Name reported by the native execution driver.
pub const DRIVER_NAME: &str = "native";

/// Version of the native execution driver, reported alongside its name.
pub const DRIVER_VERSION: &str = "0.2";

/// Default root directory for driver-owned per-container state.
pub const DEFAULT_ROOT: &str = "/var/lib/corral/execdriver/native";

/// File written under `<root>/<id>/` describing the isolation configuration.
pub const CONTAINER_CONFIG_FILE: &str = "container.json";

/// Cgroups v2 unified hierarchy mount point.
pub const CGROUP_V2_PATH: &str = "/sys/fs/cgroup";

/// Cgroup grouping that every container cgroup is created under.
pub const DEFAULT_CGROUP_PARENT: &str = "corral";

/// AppArmor profile attached when AppArmor is enabled on the host.
pub const DEFAULT_APPARMOR_PROFILE: &str = "corral-default";

/// Interval at which the native backend polls `memory.events` for OOM kills.
pub const OOM_POLL_INTERVAL_MS: u64 = 100;

/// Exit code reported when the driver itself failed to run the process.
pub const DRIVER_FAILURE_EXIT_CODE: i32 = -1;

/// Application name used in CLI output and log fields.
pub const APP_NAME: &str = "corral";

/// Binary name for the CLI.
pub const BIN_NAME: &str = "corral";
