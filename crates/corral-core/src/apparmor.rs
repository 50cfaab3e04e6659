//! AppArmor availability detection.

use std::path::Path;

const ENABLED_PARAMETER_PATH: &str = "/sys/module/apparmor/parameters/enabled";

/// Checks if AppArmor has been enabled on the host.
///
/// A host without the AppArmor module reports `false`.
#[must_use]
pub fn is_enabled() -> bool {
    is_enabled_at(Path::new(ENABLED_PARAMETER_PATH))
}

fn is_enabled_at(parameter: &Path) -> bool {
    let enabled = std::fs::read_to_string(parameter).is_ok_and(|value| value.starts_with('Y'));
    tracing::debug!(enabled, "AppArmor detection");
    enabled
}
