//! Native Linux backend.
//!
//! Namespaces are created by util-linux `unshare` and joined by `nsenter`;
//! `setpriv` narrows the capability bounding set, switches user and applies
//! the AppArmor profile right before the workload execs. The cgroup is
//! managed directly through [`CgroupManager`]. Every launched tool joins the
//! container cgroup before exec, so its descendants are accounted from their
//! first instruction.

use std::fs::File;
use std::io::Write;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Child;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use nix::sys::signal::Signal;
use nix::unistd::Pid;

use corral_common::config::DriverConfig;
use corral_common::error::{CorralError, Result};
use corral_common::types::ContainerId;
use corral_core::capability::bounding_set_arg;
use corral_core::cgroup::CgroupManager;
use corral_core::namespace::{NamespaceKind, util_linux_flags};
use corral_core::profile::IsolationConfig;

use super::{ContainerProcess, HandleState, ProcessLaunch, RawStats, RuntimeFactory, RuntimeHandle};
use crate::command::ProcessConfig;

/// How long to wait for a launcher to fork the workload.
const FORK_TIMEOUT: Duration = Duration::from_secs(5);

/// Creates containers backed by a cgroup v2 directory and util-linux tools.
#[derive(Debug, Clone)]
pub struct NativeFactory {
    cgroup_root: PathBuf,
    oom_poll_interval: Duration,
}

impl NativeFactory {
    /// Creates a factory from the driver configuration.
    #[must_use]
    pub fn new(config: &DriverConfig) -> Self {
        Self {
            cgroup_root: config.cgroup_root.clone(),
            oom_poll_interval: Duration::from_millis(config.oom_poll_interval_ms),
        }
    }
}

impl RuntimeFactory for NativeFactory {
    fn create(&self, id: &ContainerId, config: &IsolationConfig) -> Result<Box<dyn RuntimeHandle>> {
        let tools = Tools::locate()?;
        let cgroup =
            CgroupManager::create(&self.cgroup_root, &config.cgroup.parent, &config.cgroup.name)?;
        if let Err(e) = cgroup.apply(&config.cgroup) {
            if let Err(cleanup) = cgroup.destroy() {
                tracing::warn!(%id, error = %cleanup, "failed to remove cgroup");
            }
            return Err(e);
        }

        let host_uid = if config.has_namespace(NamespaceKind::User) {
            nix::unistd::geteuid().as_raw()
        } else {
            0
        };
        tracing::info!(%id, cgroup = %cgroup.path().display(), "native container created");
        Ok(Box::new(NativeContainer {
            id: id.clone(),
            config: config.clone(),
            cgroup,
            tools,
            host_uid,
            oom_poll_interval: self.oom_poll_interval,
            init: Mutex::new(None),
        }))
    }
}

/// Absolute paths of the util-linux tools on the host.
#[derive(Debug, Clone)]
struct Tools {
    unshare: PathBuf,
    nsenter: PathBuf,
    setpriv: PathBuf,
}

impl Tools {
    fn locate() -> Result<Self> {
        Ok(Self {
            unshare: find_tool("unshare")?,
            nsenter: find_tool("nsenter")?,
            setpriv: find_tool("setpriv")?,
        })
    }
}

fn find_tool(binary: &str) -> Result<PathBuf> {
    which::which(binary).map_err(|_| CorralError::NotFound {
        kind: "util-linux tool",
        id: format!("{binary} (install util-linux to run native containers)"),
    })
}

/// One container on the native backend.
#[derive(Debug)]
pub struct NativeContainer {
    id: ContainerId,
    config: IsolationConfig,
    cgroup: CgroupManager,
    tools: Tools,
    host_uid: u32,
    oom_poll_interval: Duration,
    init: Mutex<Option<HandleState>>,
}

impl NativeContainer {
    fn init_state(&self) -> Option<HandleState> {
        *self.init.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// `setpriv` invocation that execs the workload. Inside another root
    /// the rootfs's own `setpriv` is used.
    fn setpriv_args(&self, process: &ProcessConfig) -> Result<Vec<String>> {
        let setpriv = if self.config.rootfs.is_some() {
            "setpriv".to_string()
        } else {
            self.tools.setpriv.display().to_string()
        };
        let mut args = vec![
            setpriv,
            format!("--bounding-set={}", bounding_set_arg(&self.config.capabilities)),
        ];
        if let Some(user) = process.user_spec()? {
            args.push(format!("--reuid={}", user.uid));
            args.push(format!("--regid={}", user.gid));
            args.push("--clear-groups".into());
        }
        if let Some(profile) = &self.config.apparmor_profile {
            args.push(format!("--apparmor-profile={profile}"));
        }
        args.push("--".into());
        args.extend(process.argv());
        Ok(args)
    }

    fn unshare_command(&self, process: &ProcessConfig) -> Result<std::process::Command> {
        let mut cmd = std::process::Command::new(&self.tools.unshare);
        let _ = cmd.args(util_linux_flags(&self.config.namespaces));
        if self.config.has_namespace(NamespaceKind::User) {
            let _ = cmd.arg("--map-root-user");
        }
        let _ = cmd.args(["--fork", "--kill-child"]);
        if self.config.has_namespace(NamespaceKind::Mount)
            && self.config.has_namespace(NamespaceKind::Pid)
        {
            let _ = cmd.arg("--mount-proc");
        }
        if let Some(root) = &self.config.rootfs {
            let _ = cmd.arg(format!("--root={}", root.display()));
        }
        if let Some(wd) = &process.working_dir {
            let _ = cmd.arg(format!("--wd={}", wd.display()));
        }
        let _ = cmd.arg("--").args(self.setpriv_args(process)?);
        Ok(cmd)
    }

    fn nsenter_command(&self, target: i32, process: &ProcessConfig) -> Result<std::process::Command> {
        let mut cmd = std::process::Command::new(&self.tools.nsenter);
        let _ = cmd
            .arg(format!("--target={target}"))
            .args(util_linux_flags(&self.config.namespaces))
            .arg("--root");
        match &process.working_dir {
            Some(wd) => {
                let _ = cmd.arg(format!(
                    "--wd={}",
                    host_path(self.config.rootfs.as_deref(), wd).display()
                ));
            }
            None => {
                let _ = cmd.arg("--wd");
            }
        }
        let _ = cmd.arg("--").args(self.setpriv_args(process)?);
        Ok(cmd)
    }

    /// Spawns `cmd` with the launch's stdio inside the container cgroup and
    /// returns the process it forks for the workload.
    #[allow(unsafe_code)]
    fn launch(&self, mut cmd: std::process::Command, launch: ProcessLaunch) -> Result<NativeProcess> {
        let ProcessLaunch { process, io } = launch;
        let procs = self.cgroup.open_procs()?;
        let tty = io.tty;
        let (stdin, stdout, stderr) = io.into_stdio();
        let _ = cmd
            .env_clear()
            .envs(process.env_pairs())
            .stdin(stdin)
            .stdout(stdout)
            .stderr(stderr);
        // SAFETY: the hook only issues async-signal-safe syscalls on
        // descriptors that stay open until exec.
        unsafe {
            let _ = cmd.pre_exec(move || join_container(&procs, tty));
        }

        let program = PathBuf::from(cmd.get_program());
        let mut child = cmd.spawn().map_err(|e| CorralError::io(&program, e))?;
        // Drops the child's ends of the console.
        drop(cmd);

        let launcher = pid_of(&child)?;
        let pid = wait_for_fork(launcher, &mut child)?;
        tracing::debug!(id = %self.id, launcher, pid, "process launched");
        Ok(NativeProcess { child, pid })
    }
}

impl RuntimeHandle for NativeContainer {
    fn config(&self) -> &IsolationConfig {
        &self.config
    }

    fn host_uid(&self) -> u32 {
        self.host_uid
    }

    fn start(&self, launch: ProcessLaunch) -> Result<Box<dyn ContainerProcess>> {
        if self.init_state().is_some() {
            return Err(CorralError::Process {
                pid: 0,
                message: format!("container {} already started", self.id),
            });
        }
        let cmd = self.unshare_command(&launch.process)?;
        let process = self.launch(cmd, launch)?;
        let start_time = corral_core::proc::process_start_time(process.pid)
            .unwrap_or_else(|e| {
                tracing::warn!(id = %self.id, error = %e, "init start time unavailable");
                None
            })
            .unwrap_or(0);
        *self.init.lock().unwrap_or_else(PoisonError::into_inner) = Some(HandleState {
            init_pid: process.pid,
            init_start_time: start_time,
        });
        Ok(Box::new(process))
    }

    fn exec(&self, launch: ProcessLaunch) -> Result<Box<dyn ContainerProcess>> {
        let state = self.state()?;
        let cmd = self.nsenter_command(state.init_pid, &launch.process)?;
        Ok(Box::new(self.launch(cmd, launch)?))
    }

    fn pause(&self) -> Result<()> {
        self.cgroup.freeze()
    }

    fn resume(&self) -> Result<()> {
        self.cgroup.thaw()
    }

    fn state(&self) -> Result<HandleState> {
        self.init_state().ok_or_else(|| CorralError::NotFound {
            kind: "init process",
            id: self.id.to_string(),
        })
    }

    fn processes(&self) -> Result<Vec<i32>> {
        self.cgroup.processes()
    }

    fn stats(&self) -> Result<RawStats> {
        let interfaces = match self.init_state() {
            Some(state) => corral_core::proc::network_interfaces(state.init_pid).unwrap_or_else(|e| {
                tracing::debug!(id = %self.id, error = %e, "interface counters unavailable");
                Vec::new()
            }),
            None => Vec::new(),
        };
        Ok(RawStats {
            interfaces,
            cgroup: Some(self.cgroup.stats()?),
        })
    }

    fn notify_oom(&self) -> Result<Receiver<()>> {
        let seen = self.cgroup.oom_kill_count()?;
        let (tx, rx) = crossbeam_channel::unbounded();
        let cgroup = self.cgroup.clone();
        let interval = self.oom_poll_interval;
        let _handle = std::thread::Builder::new()
            .name(format!("oom-poll-{}", self.id))
            .spawn(move || poll_oom_kills(&cgroup, seen, interval, &tx))
            .map_err(|e| CorralError::io("oom poller", e))?;
        Ok(rx)
    }

    fn destroy(&self) -> Result<()> {
        self.cgroup.destroy()
    }
}

/// A process started through `unshare` or `nsenter`.
#[derive(Debug)]
pub struct NativeProcess {
    child: Child,
    pid: i32,
}

impl ContainerProcess for NativeProcess {
    fn pid(&self) -> i32 {
        self.pid
    }

    fn wait(&mut self) -> Result<std::process::ExitStatus> {
        self.child.wait().map_err(|e| CorralError::Process {
            pid: self.pid,
            message: format!("waiting: {e}"),
        })
    }

    fn signal(&mut self, signal: Signal) -> Result<()> {
        nix::sys::signal::kill(Pid::from_raw(self.pid), signal).map_err(|e| CorralError::Process {
            pid: self.pid,
            message: format!("sending {signal}: {e}"),
        })
    }
}

/// Runs in the forked child before exec.
#[allow(unsafe_code)]
fn join_container(procs: &File, tty: bool) -> std::io::Result<()> {
    let _ = nix::unistd::setsid().map_err(std::io::Error::from)?;
    if tty {
        // SAFETY: fd 0 is the terminal slave installed as stdin.
        if unsafe { libc::ioctl(0, libc::TIOCSCTTY, 0) } == -1 {
            return Err(std::io::Error::last_os_error());
        }
    }
    let mut procs = procs;
    procs.write_all(b"0")
}

fn pid_of(child: &Child) -> Result<i32> {
    i32::try_from(child.id()).map_err(|_| CorralError::Process {
        pid: -1,
        message: format!("pid {} out of range", child.id()),
    })
}

/// Waits for `launcher` to fork the workload and returns the workload's pid.
///
/// A launcher that exits first, or never forks in time, stands in for the
/// workload.
fn wait_for_fork(launcher: i32, child: &mut Child) -> Result<i32> {
    let deadline = Instant::now() + FORK_TIMEOUT;
    loop {
        if let Some(&pid) = corral_core::proc::child_pids(launcher)?.first() {
            return Ok(pid);
        }
        let exited = child.try_wait().map_err(|e| CorralError::Process {
            pid: launcher,
            message: format!("polling launcher: {e}"),
        })?;
        if exited.is_some() || Instant::now() >= deadline {
            tracing::debug!(launcher, "launcher has no workload child");
            return Ok(launcher);
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}

/// Reports each increase of the cgroup's OOM-kill counter until the cgroup
/// disappears or nobody listens.
fn poll_oom_kills(cgroup: &CgroupManager, mut seen: u64, interval: Duration, events: &Sender<()>) {
    loop {
        std::thread::sleep(interval);
        match cgroup.oom_kill_count() {
            Ok(count) if count > seen => {
                seen = count;
                if events.send(()).is_err() {
                    return;
                }
            }
            Ok(_) => {}
            Err(_) => return,
        }
    }
}

/// Host path of `path` inside a container rooted at `rootfs`.
fn host_path(rootfs: Option<&Path>, path: &Path) -> PathBuf {
    match rootfs {
        Some(root) => root.join(path.strip_prefix("/").unwrap_or(path)),
        None => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use corral_core::capability::Capability;
    use corral_core::cgroup::CgroupConfig;

    use super::*;

    fn container(config: IsolationConfig) -> NativeContainer {
        NativeContainer {
            id: ContainerId::new("native-test"),
            config,
            cgroup: CgroupManager::at("/nonexistent"),
            tools: Tools {
                unshare: "/usr/bin/unshare".into(),
                nsenter: "/usr/bin/nsenter".into(),
                setpriv: "/usr/bin/setpriv".into(),
            },
            host_uid: 0,
            oom_poll_interval: Duration::from_millis(10),
            init: Mutex::new(None),
        }
    }

    fn isolation() -> IsolationConfig {
        IsolationConfig {
            capabilities: vec![Capability::Chown, Capability::Kill],
            namespaces: vec![NamespaceKind::Mount, NamespaceKind::Pid, NamespaceKind::Network],
            cgroup: CgroupConfig::default(),
            apparmor_profile: None,
            rootfs: None,
        }
    }

    fn args(cmd: &std::process::Command) -> Vec<String> {
        cmd.get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn unshare_creates_namespaces_and_forks() {
        let c = container(isolation());
        let process = ProcessConfig::new("/bin/sh", vec!["-c".into(), "true".into()]);
        let cmd = c.unshare_command(&process).unwrap();
        let args = args(&cmd);

        assert_eq!(cmd.get_program(), "/usr/bin/unshare");
        assert!(args.contains(&"--mount".to_string()));
        assert!(args.contains(&"--net".to_string()));
        assert!(args.contains(&"--kill-child".to_string()));
        assert!(args.contains(&"--mount-proc".to_string()));
        assert!(!args.contains(&"--map-root-user".to_string()));

        let sep = args.iter().position(|a| a == "--").unwrap();
        assert_eq!(args[sep + 1], "/usr/bin/setpriv");
        assert_eq!(args[sep + 2], "--bounding-set=-all,+chown,+kill");
        assert_eq!(args[args.len() - 3..], ["/bin/sh", "-c", "true"]);
    }

    #[test]
    fn rootfs_uses_the_container_setpriv() {
        let mut config = isolation();
        config.rootfs = Some("/srv/rootfs".into());
        config.apparmor_profile = Some("corral-default".into());
        let c = container(config);
        let mut process = ProcessConfig::new("/app", Vec::new());
        process.user = "1000:100".into();
        process.working_dir = Some("/work".into());

        let args = args(&c.unshare_command(&process).unwrap());
        assert!(args.contains(&"--root=/srv/rootfs".to_string()));
        assert!(args.contains(&"--wd=/work".to_string()));
        assert!(args.contains(&"setpriv".to_string()));
        assert!(args.contains(&"--reuid=1000".to_string()));
        assert!(args.contains(&"--regid=100".to_string()));
        assert!(args.contains(&"--apparmor-profile=corral-default".to_string()));
    }

    #[test]
    fn named_users_are_rejected() {
        let c = container(isolation());
        let mut process = ProcessConfig::new("/app", Vec::new());
        process.user = "nobody".into();
        assert!(c.unshare_command(&process).is_err());
    }

    #[test]
    fn nsenter_targets_init_and_maps_workdir() {
        let mut config = isolation();
        config.rootfs = Some("/srv/rootfs".into());
        let c = container(config);
        let mut process = ProcessConfig::new("ls", Vec::new());
        process.working_dir = Some("/tmp".into());

        let cmd = c.nsenter_command(4242, &process).unwrap();
        let args = args(&cmd);
        assert_eq!(cmd.get_program(), "/usr/bin/nsenter");
        assert_eq!(args[0], "--target=4242");
        assert!(args.contains(&"--pid".to_string()));
        assert!(args.contains(&"--root".to_string()));
        assert!(args.contains(&"--wd=/srv/rootfs/tmp".to_string()));
    }

    #[test]
    fn state_requires_started_init() {
        let c = container(isolation());
        assert!(c.state().is_err());
        assert_eq!(c.host_uid(), 0);
    }

    #[test]
    fn host_path_joins_under_rootfs() {
        assert_eq!(
            host_path(Some(Path::new("/r")), Path::new("/a/b")),
            PathBuf::from("/r/a/b")
        );
        assert_eq!(host_path(None, Path::new("/a")), PathBuf::from("/a"));
    }

    #[test]
    fn oom_poller_stops_with_the_cgroup() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("memory.events"), "oom 0\noom_kill 0\n").unwrap();
        let cgroup = CgroupManager::at(dir.path());
        let (tx, rx) = crossbeam_channel::unbounded();
        let poller = std::thread::spawn({
            let cgroup = cgroup.clone();
            move || poll_oom_kills(&cgroup, 0, Duration::from_millis(5), &tx)
        });

        std::fs::write(dir.path().join("memory.events"), "oom 1\noom_kill 1\n").unwrap();
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());

        std::fs::remove_file(dir.path().join("memory.events")).unwrap();
        poller.join().unwrap();
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
    }
}
