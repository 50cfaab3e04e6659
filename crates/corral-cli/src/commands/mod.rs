//! CLI command definitions and dispatch.

pub mod clean;
pub mod info;
pub mod run;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand};

use corral_common::config::DriverConfig;

/// Corral: run containers on the native execution driver.
#[derive(Parser, Debug)]
#[command(name = "corral", version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,

    /// Driver configuration file (JSON).
    #[arg(long, global = true, env = "CORRAL_CONFIG")]
    pub config: Option<PathBuf>,

    /// Directory for per-container driver state; overrides the configuration.
    #[arg(long, global = true, env = "CORRAL_ROOT")]
    pub root: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub log_json: bool,
}

/// Available CLI subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a container in the foreground until its init process exits.
    Run(run::RunArgs),
    /// Show the driver name, machine memory and effective configuration.
    Info(info::InfoArgs),
    /// Remove the driver-owned state of containers.
    Clean(clean::CleanArgs),
}

impl Cli {
    /// Driver configuration: the file given by `--config`, or defaults, with
    /// `--root` applied on top.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration file cannot be loaded.
    pub fn driver_config(&self) -> anyhow::Result<DriverConfig> {
        let mut config = match &self.config {
            Some(path) => DriverConfig::load(path)
                .with_context(|| format!("loading configuration {}", path.display()))?,
            None => DriverConfig::default(),
        };
        if let Some(root) = &self.root {
            config.root.clone_from(root);
        }
        Ok(config)
    }
}

/// Dispatches the parsed CLI command to its handler.
///
/// # Errors
///
/// Returns an error if the command execution fails.
pub fn execute(cli: Cli) -> anyhow::Result<ExitCode> {
    let config = cli.driver_config()?;
    match cli.command {
        Command::Run(args) => run::execute(config, args),
        Command::Info(args) => info::execute(config, &args).map(|()| ExitCode::SUCCESS),
        Command::Clean(args) => clean::execute(config, &args).map(|()| ExitCode::SUCCESS),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_flag_overrides_default() {
        let cli = Cli::parse_from(["corral", "--root", "/tmp/corral", "info"]);
        let config = cli.driver_config().unwrap();
        assert_eq!(config.root, PathBuf::from("/tmp/corral"));
        assert_eq!(config.cgroup_parent, "corral");
    }

    #[test]
    fn root_flag_overrides_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("driver.json");
        std::fs::write(&path, r#"{ "root": "/srv/a", "cgroup_parent": "ci" }"#).unwrap();
        let cli = Cli::parse_from([
            "corral",
            "--config",
            path.to_str().unwrap(),
            "--root",
            "/srv/b",
            "info",
        ]);
        let config = cli.driver_config().unwrap();
        assert_eq!(config.root, PathBuf::from("/srv/b"));
        assert_eq!(config.cgroup_parent, "ci");
    }

    #[test]
    fn missing_config_file_is_an_error() {
        let cli = Cli::parse_from(["corral", "--config", "/nonexistent/corral.json", "info"]);
        assert!(cli.driver_config().is_err());
    }
}
