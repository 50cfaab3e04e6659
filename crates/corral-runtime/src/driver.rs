//! The execution driver: container lifecycle on top of a runtime backend.

use std::fs::DirBuilder;
use std::os::unix::fs::DirBuilderExt;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use nix::sys::signal::Signal;

use corral_common::config::DriverConfig;
use corral_common::constants::{CONTAINER_CONFIG_FILE, DRIVER_NAME, DRIVER_VERSION};
use corral_common::error::CorralError;
use corral_common::types::ContainerId;
use corral_core::profile::{self, IsolationConfig};

use crate::backend::{ContainerProcess, ProcessLaunch, RuntimeFactory, RuntimeHandle};
use crate::command::{Command, ProcessConfig};
use crate::console::{self, Pipes, Terminal};
use crate::error::{CallbackError, DriverError, Result};
use crate::exit::{ExitStatus, decode_exit_status};
use crate::host::Host;
use crate::info::Info;
use crate::oom::OomWatcher;
use crate::registry::{ActiveContainer, ActiveContainers, InitProcess};
use crate::stats::{ResourceStats, normalize};

/// Called once with the process and its host pid after it has started.
/// An error kills the process and fails the operation.
pub type StartCallback<'a> =
    &'a mut dyn FnMut(&ProcessConfig, i32) -> std::result::Result<(), CallbackError>;

/// Runs and supervises containers.
///
/// All operations take `&self`; a driver is shared between the thread
/// blocked in [`ExecDriver::run`] and threads issuing pause, kill or
/// terminate requests for the same container.
pub struct ExecDriver {
    config: DriverConfig,
    profile: IsolationConfig,
    factory: Arc<dyn RuntimeFactory>,
    host: Arc<dyn Host>,
    registry: Arc<ActiveContainers>,
    machine_memory: u64,
}

impl ExecDriver {
    /// Creates a driver over `factory`.
    ///
    /// Reads the machine's memory once and creates the state root.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, machine memory
    /// cannot be read, or the state root cannot be created.
    pub fn new(
        config: DriverConfig,
        factory: Arc<dyn RuntimeFactory>,
        host: Arc<dyn Host>,
        registry: Arc<ActiveContainers>,
    ) -> Result<Self> {
        config.validate()?;
        let machine_memory = host.machine_memory()?;
        DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(&config.root)
            .map_err(|e| CorralError::io(&config.root, e))?;

        let apparmor = corral_core::apparmor::is_enabled();
        let profile =
            profile::default_profile(&config.cgroup_parent, apparmor, &config.apparmor_profile);
        tracing::info!(
            root = %config.root.display(),
            machine_memory,
            apparmor,
            "execution driver ready"
        );
        Ok(Self {
            config,
            profile,
            factory,
            host,
            registry,
            machine_memory,
        })
    }

    /// Creates a driver over the native Linux backend with its own registry.
    ///
    /// # Errors
    ///
    /// See [`ExecDriver::new`].
    #[cfg(target_os = "linux")]
    pub fn native(config: DriverConfig) -> Result<Self> {
        let factory = Arc::new(crate::backend::linux::NativeFactory::new(&config));
        Self::new(
            config,
            factory,
            Arc::new(crate::host::LinuxHost),
            Arc::new(ActiveContainers::new()),
        )
    }

    /// Driver name and version, e.g. `native-0.2`.
    #[must_use]
    pub fn name(&self) -> String {
        format!("{DRIVER_NAME}-{DRIVER_VERSION}")
    }

    /// Driver configuration.
    #[must_use]
    pub const fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Registry of active containers.
    #[must_use]
    pub const fn registry(&self) -> &Arc<ActiveContainers> {
        &self.registry
    }

    /// Machine memory read at construction.
    #[must_use]
    pub const fn machine_memory(&self) -> u64 {
        self.machine_memory
    }

    /// Isolation configuration for `command`: the default profile plus the
    /// command's capabilities, namespaces and limits.
    #[must_use]
    pub fn isolation_config(&self, command: &Command) -> IsolationConfig {
        let mut config = self.profile.clone();
        config.add_capabilities(&command.capabilities);
        config.add_namespaces(&command.namespaces);
        config.cgroup.name = command.id.as_str().to_string();
        config.cgroup.memory = command.resources.memory_bytes.unwrap_or(0);
        config.cgroup.cpu_shares = command.resources.cpu_shares.unwrap_or(0);
        config.cgroup.cpuset_cpus = command.resources.cpuset_cpus.clone().unwrap_or_default();
        config.rootfs.clone_from(&command.rootfs);
        config
    }

    /// Creates the container, runs its init process to completion and tears
    /// everything down again.
    ///
    /// Blocks until the init process exits. The container is registered, and
    /// reachable by the other lifecycle operations, from handle creation
    /// until return.
    ///
    /// # Errors
    ///
    /// Returns an error, meaning exit code `-1`, if the id is not a valid
    /// path component, the container cannot be created or started, the
    /// callback fails, or waiting fails. In the last two cases the process is
    /// killed first.
    pub fn run(
        &self,
        command: &Command,
        pipes: Pipes,
        start_callback: Option<StartCallback<'_>>,
    ) -> Result<ExitStatus> {
        const OP: &str = "run";
        let id = &command.id;
        id.validate().map_err(DriverError::InvalidId)?;
        if self.registry.get(id).is_some() {
            return Err(DriverError::AlreadyActive {
                id: id.clone(),
                operation: OP,
            });
        }

        let config = self.isolation_config(command);
        let handle: Arc<dyn RuntimeHandle> = self
            .factory
            .create(id, &config)
            .map_err(|source| runtime(id, OP, source))?
            .into();
        let container = Arc::new(ActiveContainer::new(id.clone(), handle));
        if let Err(e) = self.registry.insert(Arc::clone(&container)) {
            // Lost a race with another run of the same id; its resources are
            // not ours to tear down.
            tracing::warn!(%id, "container became active concurrently");
            return Err(e);
        }

        let result = self.run_registered(&container, command, pipes, start_callback);
        self.cleanup(&container, OP, true);
        match &result {
            Ok(status) => tracing::info!(
                %id,
                exit_code = status.exit_code,
                oom_killed = status.oom_killed,
                "container exited"
            ),
            Err(e) => tracing::error!(%id, error = %e, "container run failed"),
        }
        result
    }

    fn run_registered(
        &self,
        container: &ActiveContainer,
        command: &Command,
        pipes: Pipes,
        start_callback: Option<StartCallback<'_>>,
    ) -> Result<ExitStatus> {
        const OP: &str = "run";
        let id = container.id();
        let handle = container.handle();
        self.write_state(id, handle.config())?;

        let (console, io) = console::setup(command.process.tty, pipes, handle.host_uid())
            .map_err(|source| DriverError::ConsoleSetup {
                id: id.clone(),
                operation: OP,
                source,
            })?;
        container.set_console(Arc::clone(&console));

        let mut process = handle
            .start(ProcessLaunch {
                process: command.process.clone(),
                io,
            })
            .map_err(|source| runtime(id, OP, source))?;

        let state = match handle.state() {
            Ok(state) => state,
            Err(source) => {
                abort(id, process.as_mut());
                return Err(runtime(id, OP, source));
            }
        };
        container.set_init(InitProcess {
            pid: state.init_pid,
            start_time: state.init_start_time,
        });
        tracing::info!(%id, pid = state.init_pid, "container started");

        let events = match handle.notify_oom() {
            Ok(events) => Some(events),
            Err(e) => {
                tracing::warn!(%id, error = %e, "OOM notifications unavailable");
                None
            }
        };
        let watcher = OomWatcher::spawn(id, events);

        if let Some(callback) = start_callback {
            if let Err(source) = callback(&command.process, state.init_pid) {
                abort(id, process.as_mut());
                let _ = watcher.finish();
                return Err(DriverError::StartCallback {
                    id: id.clone(),
                    operation: OP,
                    source,
                });
            }
        }

        let status = match process.wait() {
            Ok(status) => status,
            Err(source) => {
                abort(id, process.as_mut());
                let _ = watcher.finish();
                return Err(runtime(id, OP, source));
            }
        };
        Ok(ExitStatus::from_process(status, watcher.finish()))
    }

    /// Runs an additional process inside the active container `id` and
    /// returns its exit code.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::NotActive`] if no container is active for `id`,
    /// and otherwise fails like [`ExecDriver::run`].
    pub fn exec(
        &self,
        id: &ContainerId,
        process: &ProcessConfig,
        pipes: Pipes,
        start_callback: Option<StartCallback<'_>>,
    ) -> Result<i32> {
        const OP: &str = "exec";
        let container = self.active(id, OP)?;
        let handle = container.handle();

        let (console, io) = console::setup(process.tty, pipes, handle.host_uid()).map_err(
            |source| DriverError::ConsoleSetup {
                id: id.clone(),
                operation: OP,
                source,
            },
        )?;
        let result = supervise_exec(id, handle.as_ref(), process, io, start_callback);
        close_console(id, console.as_ref());
        if let Ok(code) = result {
            tracing::info!(%id, exit_code = code, "exec process exited");
        }
        result
    }

    /// Freezes every process of container `id`.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::NotActive`] for an inactive id or the backend's
    /// failure.
    pub fn pause(&self, id: &ContainerId) -> Result<()> {
        const OP: &str = "pause";
        let container = self.active(id, OP)?;
        container
            .handle()
            .pause()
            .map_err(|source| runtime(id, OP, source))?;
        container.set_paused(true);
        tracing::info!(%id, "container paused");
        Ok(())
    }

    /// Thaws container `id`.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::NotActive`] for an inactive id or the backend's
    /// failure.
    pub fn unpause(&self, id: &ContainerId) -> Result<()> {
        const OP: &str = "unpause";
        let container = self.active(id, OP)?;
        container
            .handle()
            .resume()
            .map_err(|source| runtime(id, OP, source))?;
        container.set_paused(false);
        tracing::info!(%id, "container resumed");
        Ok(())
    }

    /// Sends `signal` to the init process of container `id`.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::NotActive`] for an inactive id,
    /// [`DriverError::NotStarted`] before the init process started, or the
    /// delivery failure.
    pub fn kill(&self, id: &ContainerId, signal: Signal) -> Result<()> {
        const OP: &str = "kill";
        let container = self.active(id, OP)?;
        let init = container.init().ok_or_else(|| DriverError::NotStarted {
            id: id.clone(),
            operation: OP,
        })?;
        tracing::info!(%id, pid = init.pid, %signal, "signaling container");
        self.host
            .signal(init.pid, signal)
            .map_err(|source| host(id, OP, source))
    }

    /// Force-kills container `id` if its init process is still the one the
    /// driver started, then unregisters the container.
    ///
    /// A pid that now belongs to another process, or to none, is left alone.
    /// The blocked [`ExecDriver::run`] call reaps the process and tears down
    /// the isolation.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::NotActive`] for an inactive id, or the failure
    /// to read state or deliver the signal. Unregistration happens regardless.
    pub fn terminate(&self, id: &ContainerId) -> Result<()> {
        const OP: &str = "terminate";
        let container = self.active(id, OP)?;
        let result = self.kill_if_same_process(&container);
        self.cleanup(&container, OP, false);
        result
    }

    fn kill_if_same_process(&self, container: &ActiveContainer) -> Result<()> {
        const OP: &str = "terminate";
        let id = container.id();
        let state = container
            .handle()
            .state()
            .map_err(|source| runtime(id, OP, source))?;
        let current = self
            .host
            .process_start_time(state.init_pid)
            .map_err(|source| host(id, OP, source))?;

        match current {
            Some(start_time) if start_time == state.init_start_time => {
                tracing::info!(%id, pid = state.init_pid, "terminating container");
                self.host
                    .signal(state.init_pid, Signal::SIGKILL)
                    .map_err(|source| host(id, OP, source))
            }
            Some(start_time) => {
                tracing::warn!(
                    %id,
                    pid = state.init_pid,
                    expected = state.init_start_time,
                    found = start_time,
                    "init pid was reused, not killing"
                );
                Ok(())
            }
            None => {
                tracing::warn!(%id, pid = state.init_pid, "init process already gone");
                Ok(())
            }
        }
    }

    /// Samples resource usage of container `id`.
    ///
    /// The memory limit reported is the container's own limit, or the
    /// machine's memory when it has none.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::NotActive`] for an inactive id, or the failure
    /// to read accounting.
    pub fn stats(&self, id: &ContainerId) -> Result<ResourceStats> {
        const OP: &str = "stats";
        let container = self.active(id, OP)?;
        let handle = container.handle();
        let read = Utc::now();
        let raw = handle.stats().map_err(|source| runtime(id, OP, source))?;
        let system_usage = self
            .host
            .system_cpu_usage()
            .map_err(|source| host(id, OP, source))?;

        let configured = handle.config().cgroup.memory;
        let memory_limit = if configured > 0 {
            configured
        } else {
            self.machine_memory
        };
        Ok(normalize(&raw, read, memory_limit, system_usage))
    }

    /// Resizes the terminal of container `id`'s init process.
    ///
    /// Containers without a terminal accept and ignore the call.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::NotActive`] for an inactive id,
    /// [`DriverError::NotStarted`] before a console is attached, or the
    /// resize failure.
    pub fn resize(&self, id: &ContainerId, rows: u16, cols: u16) -> Result<()> {
        const OP: &str = "resize";
        let container = self.active(id, OP)?;
        let console = container.console().ok_or_else(|| DriverError::NotStarted {
            id: id.clone(),
            operation: OP,
        })?;
        console
            .resize(rows, cols)
            .map_err(|e| runtime(id, OP, CorralError::io("console", e)))
    }

    /// Describes container `id`.
    #[must_use]
    pub fn info(&self, id: &ContainerId) -> Info<'_> {
        Info::new(id.clone(), self)
    }

    /// Host pids of every process in container `id`.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::NotActive`] for an inactive id, or the failure
    /// to list processes.
    pub fn processes(&self, id: &ContainerId) -> Result<Vec<i32>> {
        const OP: &str = "processes";
        let container = self.active(id, OP)?;
        container
            .handle()
            .processes()
            .map_err(|source| runtime(id, OP, source))
    }

    /// Removes every driver-owned file of container `id`. Cleaning an
    /// unknown id succeeds.
    ///
    /// # Errors
    ///
    /// Returns an error if the id is not a valid path component, or the
    /// state directory exists but cannot be removed.
    pub fn clean(&self, id: &ContainerId) -> Result<()> {
        id.validate().map_err(DriverError::InvalidId)?;
        let dir = self.config.container_dir(id.as_str());
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => {
                tracing::debug!(%id, "container state removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(DriverError::State {
                id: id.clone(),
                operation: "clean",
                source: CorralError::io(dir, e),
            }),
        }
    }

    fn active(&self, id: &ContainerId, operation: &'static str) -> Result<Arc<ActiveContainer>> {
        self.registry.get(id).ok_or_else(|| DriverError::NotActive {
            id: id.clone(),
            operation,
        })
    }

    fn state_file(&self, id: &ContainerId) -> PathBuf {
        self.config
            .container_dir(id.as_str())
            .join(CONTAINER_CONFIG_FILE)
    }

    fn write_state(&self, id: &ContainerId, config: &IsolationConfig) -> Result<()> {
        let state_error = |source| DriverError::State {
            id: id.clone(),
            operation: "run",
            source,
        };
        let dir = self.config.container_dir(id.as_str());
        DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(&dir)
            .map_err(|e| state_error(CorralError::io(&dir, e)))?;
        let data = serde_json::to_vec_pretty(config).map_err(|e| state_error(e.into()))?;
        let path = self.state_file(id);
        std::fs::write(&path, data).map_err(|e| state_error(CorralError::io(&path, e)))?;
        tracing::debug!(%id, path = %path.display(), "container state written");
        Ok(())
    }

    /// Releases what the driver holds for `container`.
    ///
    /// `destroy` is set by the owner of the handle, the run call; terminate
    /// only unregisters and leaves teardown to it. The state file is removed
    /// only by whoever unregisters the container, so a run finishing after
    /// terminate leaves a successor's `container.json` alone.
    fn cleanup(&self, container: &Arc<ActiveContainer>, operation: &'static str, destroy: bool) {
        let id = container.id();
        if destroy {
            if let Some(console) = container.console() {
                close_console(id, console.as_ref());
            }
            if let Err(e) = container.handle().destroy() {
                tracing::warn!(%id, operation, error = %e, "failed to destroy container");
            }
        }
        if !self.registry.remove_entry(container) {
            return;
        }
        let path = self.state_file(id);
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(%id, operation, error = %e, "failed to remove container state"),
        }
    }
}

impl std::fmt::Debug for ExecDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecDriver")
            .field("name", &self.name())
            .field("root", &self.config.root)
            .field("active", &self.registry.len())
            .finish_non_exhaustive()
    }
}

fn supervise_exec(
    id: &ContainerId,
    handle: &dyn RuntimeHandle,
    process: &ProcessConfig,
    io: console::ProcessIo,
    start_callback: Option<StartCallback<'_>>,
) -> Result<i32> {
    const OP: &str = "exec";
    let mut child = handle
        .exec(ProcessLaunch {
            process: process.clone(),
            io,
        })
        .map_err(|source| runtime(id, OP, source))?;
    let pid = child.pid();
    tracing::debug!(%id, pid, "exec process started");

    if let Some(callback) = start_callback {
        if let Err(source) = callback(process, pid) {
            abort(id, child.as_mut());
            return Err(DriverError::StartCallback {
                id: id.clone(),
                operation: OP,
                source,
            });
        }
    }

    match child.wait() {
        Ok(status) => Ok(decode_exit_status(status).0),
        Err(source) => {
            abort(id, child.as_mut());
            Err(runtime(id, OP, source))
        }
    }
}

/// Kills and reaps a process after a failure, logging what goes wrong.
fn abort(id: &ContainerId, process: &mut dyn ContainerProcess) {
    let pid = process.pid();
    if let Err(e) = process.signal(Signal::SIGKILL) {
        tracing::warn!(%id, pid, error = %e, "failed to kill process");
    }
    if let Err(e) = process.wait() {
        tracing::debug!(%id, pid, error = %e, "failed to reap killed process");
    }
}

fn close_console(id: &ContainerId, console: &dyn Terminal) {
    if let Err(e) = console.close() {
        tracing::warn!(%id, error = %e, "failed to close console");
    }
}

fn runtime(id: &ContainerId, operation: &'static str, source: CorralError) -> DriverError {
    DriverError::Runtime {
        id: id.clone(),
        operation,
        source,
    }
}

fn host(id: &ContainerId, operation: &'static str, source: CorralError) -> DriverError {
    DriverError::Host {
        id: id.clone(),
        operation,
        source,
    }
}
