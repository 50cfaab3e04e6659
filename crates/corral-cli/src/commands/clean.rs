//! `corral clean` — Remove driver-owned container state.

use anyhow::Context;
use clap::Args;

use corral_common::config::DriverConfig;
use corral_common::types::ContainerId;
use corral_runtime::driver::ExecDriver;

/// Arguments for the `clean` command.
#[derive(Args, Debug)]
pub struct CleanArgs {
    /// Ids of the containers whose state is removed.
    #[arg(required = true)]
    pub ids: Vec<ContainerId>,
}

/// Executes the `clean` command. Unknown ids are not an error.
///
/// # Errors
///
/// Returns an error if the driver cannot be created or a state directory
/// cannot be removed.
pub fn execute(config: DriverConfig, args: &CleanArgs) -> anyhow::Result<()> {
    let driver = ExecDriver::native(config).context("starting native driver")?;
    for id in &args.ids {
        driver
            .clean(id)
            .with_context(|| format!("cleaning container {id}"))?;
        tracing::info!(%id, "container state removed");
    }
    Ok(())
}
