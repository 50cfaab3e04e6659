//! `corral run` — Run one container in the foreground.

use std::io::Read;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Context;
use clap::Args;
use nix::sys::signal::Signal;

use corral_common::config::DriverConfig;
use corral_common::types::{ContainerId, ResourceLimits};
use corral_core::capability::Capability;
use corral_core::namespace::NamespaceKind;
use corral_runtime::command::{Command, ProcessConfig};
use corral_runtime::console::{Pipes, StreamSink};
use corral_runtime::driver::ExecDriver;
use corral_runtime::error::CallbackError;

use crate::output::parse_bytes;

/// Arguments for the `run` command.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Container id; a random one is generated when omitted.
    #[arg(long)]
    pub id: Option<ContainerId>,

    /// Attach a pseudo-terminal.
    #[arg(short, long)]
    pub tty: bool,

    /// Forward standard input to the container.
    #[arg(short, long)]
    pub interactive: bool,

    /// Memory limit, e.g. `256m` or `1g`.
    #[arg(short, long, value_parser = parse_bytes)]
    pub memory: Option<u64>,

    /// Relative CPU weight.
    #[arg(long)]
    pub cpu_shares: Option<u64>,

    /// CPUs the container may run on, e.g. `0-3,6`.
    #[arg(long)]
    pub cpuset_cpus: Option<String>,

    /// Capabilities to keep in addition to the default set.
    #[arg(long, value_delimiter = ',')]
    pub cap_add: Vec<Capability>,

    /// Namespaces to isolate in addition to the default set.
    #[arg(long, value_delimiter = ',')]
    pub ns_add: Vec<NamespaceKind>,

    /// Root filesystem to switch into. It must provide `setpriv`.
    #[arg(long)]
    pub rootfs: Option<PathBuf>,

    /// Numeric `uid[:gid]` to run as.
    #[arg(short, long, default_value = "")]
    pub user: String,

    /// Environment entries as `KEY=value`.
    #[arg(short, long)]
    pub env: Vec<String>,

    /// Working directory inside the container.
    #[arg(short, long)]
    pub workdir: Option<PathBuf>,

    /// Terminate the container after this many seconds.
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Program and arguments of the init process.
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

impl RunArgs {
    /// Builds the driver command described by the arguments.
    #[must_use]
    pub fn to_command(&self) -> Command {
        let id = self.id.clone().unwrap_or_else(ContainerId::generate);
        let (entrypoint, arguments) = self
            .command
            .split_first()
            .map(|(first, rest)| (first.clone(), rest.to_vec()))
            .unwrap_or_default();

        let mut process = ProcessConfig::new(entrypoint, arguments);
        process.env.clone_from(&self.env);
        process.working_dir.clone_from(&self.workdir);
        process.user.clone_from(&self.user);
        process.tty = self.tty;

        let mut command = Command::new(id, process);
        command.resources = ResourceLimits {
            memory_bytes: self.memory,
            cpu_shares: self.cpu_shares,
            cpuset_cpus: self.cpuset_cpus.clone(),
        };
        command.capabilities.clone_from(&self.cap_add);
        command.namespaces.clone_from(&self.ns_add);
        command.rootfs.clone_from(&self.rootfs);
        command
    }
}

/// Executes the `run` command and returns the container's exit code.
///
/// # Errors
///
/// Returns an error if the driver cannot be created or fails to run the
/// container.
pub fn execute(config: DriverConfig, args: RunArgs) -> anyhow::Result<ExitCode> {
    let command = args.to_command();
    let id = command.id.clone();
    let driver = Arc::new(ExecDriver::native(config).context("starting native driver")?);
    tracing::debug!(driver = %driver.name(), %id, "running container");

    install_interrupt(&driver, &id)?;
    if let Some(secs) = args.timeout {
        spawn_deadline(&driver, &id, Duration::from_secs(secs))?;
    }

    let stdin = (args.interactive || args.tty)
        .then(|| Box::new(std::io::stdin()) as Box<dyn Read + Send>);
    let pipes = Pipes::new(
        stdin,
        Box::new(StreamSink(std::io::stdout())),
        Box::new(StreamSink(std::io::stderr())),
    );
    let mut on_start = |process: &ProcessConfig, pid: i32| -> Result<(), CallbackError> {
        tracing::info!(%id, pid, entrypoint = %process.entrypoint, "container running");
        Ok(())
    };

    let status = driver
        .run(&command, pipes, Some(&mut on_start))
        .with_context(|| format!("running container {}", command.id))?;
    if status.oom_killed {
        tracing::warn!(id = %command.id, "container was killed for running out of memory");
    }
    Ok(exit_code(status.exit_code))
}

/// First Ctrl-C forwards SIGTERM to the init process; any further one
/// terminates the container.
fn install_interrupt(driver: &Arc<ExecDriver>, id: &ContainerId) -> anyhow::Result<()> {
    let driver = Arc::clone(driver);
    let id = id.clone();
    let interrupts = AtomicUsize::new(0);
    ctrlc::set_handler(move || {
        let result = if interrupts.fetch_add(1, Ordering::SeqCst) == 0 {
            tracing::info!(%id, "interrupted, forwarding SIGTERM");
            driver.kill(&id, Signal::SIGTERM)
        } else {
            tracing::warn!(%id, "interrupted again, terminating container");
            driver.terminate(&id)
        };
        if let Err(e) = result {
            tracing::warn!(%id, error = %e, "failed to stop container");
        }
    })
    .context("failed to set Ctrl+C handler")
}

fn spawn_deadline(
    driver: &Arc<ExecDriver>,
    id: &ContainerId,
    timeout: Duration,
) -> anyhow::Result<()> {
    let driver = Arc::clone(driver);
    let id = id.clone();
    let _ = std::thread::Builder::new()
        .name("deadline".into())
        .spawn(move || {
            std::thread::sleep(timeout);
            if !driver.info(&id).is_running() {
                return;
            }
            tracing::warn!(%id, timeout_secs = timeout.as_secs(), "deadline reached, terminating container");
            if let Err(e) = driver.terminate(&id) {
                tracing::warn!(%id, error = %e, "failed to terminate container");
            }
        })
        .context("failed to start deadline thread")?;
    Ok(())
}

/// Maps a container exit code onto the CLI's own exit status; codes that
/// do not fit report plain failure.
fn exit_code(code: i32) -> ExitCode {
    ExitCode::from(status_byte(code))
}

fn status_byte(code: i32) -> u8 {
    u8::try_from(code).unwrap_or(1)
}
