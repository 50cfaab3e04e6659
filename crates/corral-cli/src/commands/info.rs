//! `corral info` — Show the driver and its effective configuration.

use anyhow::Context;
use clap::Args;

use corral_common::config::DriverConfig;
use corral_runtime::driver::ExecDriver;

use crate::output::format_bytes;

/// Arguments for the `info` command.
#[derive(Args, Debug)]
pub struct InfoArgs {
    /// Print machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

/// Executes the `info` command.
///
/// # Errors
///
/// Returns an error if the driver cannot be created.
pub fn execute(config: DriverConfig, args: &InfoArgs) -> anyhow::Result<()> {
    let driver = ExecDriver::native(config).context("starting native driver")?;
    let apparmor = corral_core::apparmor::is_enabled();

    if args.json {
        let info = serde_json::json!({
            "driver": driver.name(),
            "machine_memory": driver.machine_memory(),
            "apparmor": apparmor,
            "config": driver.config(),
        });
        println!("{}", serde_json::to_string_pretty(&info)?);
        return Ok(());
    }

    let config = driver.config();
    println!("{:<16} {}", "Driver:", driver.name());
    println!("{:<16} {}", "Memory:", format_bytes(driver.machine_memory()));
    println!("{:<16} {}", "AppArmor:", if apparmor { "enabled" } else { "disabled" });
    println!("{:<16} {}", "State root:", config.root.display());
    println!("{:<16} {}", "Cgroup root:", config.cgroup_root.display());
    println!("{:<16} {}", "Cgroup parent:", config.cgroup_parent);
    Ok(())
}
