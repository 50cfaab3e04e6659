//! In-memory backend and host shared by the integration tests.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::collections::HashMap;
use std::io::Write;
use std::os::unix::process::ExitStatusExt;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use nix::sys::signal::Signal;

use corral_common::config::DriverConfig;
use corral_common::error::{CorralError, Result};
use corral_common::types::ContainerId;
use corral_core::cgroup::stats::CgroupStats;
use corral_core::proc::InterfaceStats;
use corral_core::profile::IsolationConfig;
use corral_runtime::backend::{
    ContainerProcess, HandleState, ProcessLaunch, RawStats, RuntimeFactory, RuntimeHandle,
};
use corral_runtime::driver::ExecDriver;
use corral_runtime::host::Host;
use corral_runtime::registry::ActiveContainers;

pub const MACHINE_MEMORY: u64 = 1_000_000_000;

/// Raw wait status of a normal exit with `code`.
pub const fn exited(code: i32) -> i32 {
    code << 8
}

/// Exit slot of one fake process.
#[derive(Debug, Default)]
pub struct Exit {
    status: Mutex<Option<i32>>,
    cvar: Condvar,
}

impl Exit {
    pub fn finish(&self, raw: i32) {
        let mut status = self.status.lock().unwrap();
        if status.is_none() {
            *status = Some(raw);
        }
        self.cvar.notify_all();
    }

    fn wait(&self) -> i32 {
        let status = self.status.lock().unwrap();
        let status = self.cvar.wait_while(status, |s| s.is_none()).unwrap();
        status.unwrap_or_default()
    }
}

/// Shared state of the fake backend and host, plus behavior knobs.
#[derive(Debug)]
pub struct World {
    pub events: Mutex<Vec<String>>,
    pub host_signals: Mutex<Vec<(i32, Signal)>>,
    pub start_times: Mutex<HashMap<i32, u64>>,
    pub processes: Mutex<HashMap<i32, Arc<Exit>>>,
    next_pid: AtomicI32,

    pub fail_create: AtomicBool,
    pub fail_start: AtomicBool,
    pub fail_wait: AtomicBool,
    pub blocking: AtomicBool,
    pub exit_raw: AtomicI32,
    pub oom_queued: AtomicBool,
    pub oom_unsupported: AtomicBool,
    pub output: Mutex<Vec<u8>>,
}

impl Default for World {
    fn default() -> Self {
        Self {
            events: Mutex::default(),
            host_signals: Mutex::default(),
            start_times: Mutex::default(),
            processes: Mutex::default(),
            next_pid: AtomicI32::new(100),
            fail_create: AtomicBool::new(false),
            fail_start: AtomicBool::new(false),
            fail_wait: AtomicBool::new(false),
            blocking: AtomicBool::new(false),
            exit_raw: AtomicI32::new(0),
            oom_queued: AtomicBool::new(false),
            oom_unsupported: AtomicBool::new(false),
            output: Mutex::default(),
        }
    }
}

impl World {
    pub fn record(&self, event: impl Into<String>) {
        self.events.lock().unwrap().push(event.into());
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn saw(&self, event: &str) -> bool {
        self.events().iter().any(|e| e == event)
    }

    pub fn host_signals(&self) -> Vec<(i32, Signal)> {
        self.host_signals.lock().unwrap().clone()
    }

    /// Lets process `pid` exit with `raw`.
    pub fn release(&self, pid: i32, raw: i32) {
        if let Some(exit) = self.processes.lock().unwrap().get(&pid) {
            exit.finish(raw);
        }
    }

    fn spawn(&self, blocking: bool) -> (i32, Arc<Exit>) {
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        let exit = Arc::new(Exit::default());
        if !blocking {
            exit.finish(self.exit_raw.load(Ordering::SeqCst));
        }
        let _ = self
            .processes
            .lock()
            .unwrap()
            .insert(pid, Arc::clone(&exit));
        let _ = self
            .start_times
            .lock()
            .unwrap()
            .insert(pid, 1_000 + u64::try_from(pid).unwrap());
        (pid, exit)
    }
}

pub struct FakeFactory(pub Arc<World>);

impl RuntimeFactory for FakeFactory {
    fn create(&self, id: &ContainerId, config: &IsolationConfig) -> Result<Box<dyn RuntimeHandle>> {
        if self.0.fail_create.load(Ordering::SeqCst) {
            return Err(CorralError::PermissionDenied {
                message: "create refused".into(),
            });
        }
        self.0.record(format!("create:{id}"));
        Ok(Box::new(FakeHandle {
            world: Arc::clone(&self.0),
            config: config.clone(),
            init: Mutex::new(None),
            oom: Mutex::new(None),
        }))
    }
}

pub struct FakeHandle {
    world: Arc<World>,
    config: IsolationConfig,
    init: Mutex<Option<HandleState>>,
    oom: Mutex<Option<Sender<()>>>,
}

impl FakeHandle {
    fn launch(&self, launch: ProcessLaunch, blocking: bool) -> FakeProcess {
        let mut stdout = std::fs::File::from(launch.io.stdout);
        stdout
            .write_all(&self.world.output.lock().unwrap())
            .unwrap();
        let (pid, exit) = self.world.spawn(blocking);
        FakeProcess {
            world: Arc::clone(&self.world),
            pid,
            exit,
        }
    }
}

impl RuntimeHandle for FakeHandle {
    fn config(&self) -> &IsolationConfig {
        &self.config
    }

    fn host_uid(&self) -> u32 {
        nix::unistd::geteuid().as_raw()
    }

    fn start(&self, launch: ProcessLaunch) -> Result<Box<dyn ContainerProcess>> {
        if self.world.fail_start.load(Ordering::SeqCst) {
            return Err(CorralError::Unsupported {
                message: "start refused".into(),
            });
        }
        let process = self.launch(launch, self.world.blocking.load(Ordering::SeqCst));
        let start_time = self.world.start_times.lock().unwrap()[&process.pid];
        *self.init.lock().unwrap() = Some(HandleState {
            init_pid: process.pid,
            init_start_time: start_time,
        });
        self.world.record("start");
        Ok(Box::new(process))
    }

    fn exec(&self, launch: ProcessLaunch) -> Result<Box<dyn ContainerProcess>> {
        let process = self.launch(launch, false);
        self.world.record("exec");
        Ok(Box::new(process))
    }

    fn pause(&self) -> Result<()> {
        self.world.record("pause");
        Ok(())
    }

    fn resume(&self) -> Result<()> {
        self.world.record("resume");
        Ok(())
    }

    fn state(&self) -> Result<HandleState> {
        self.init.lock().unwrap().ok_or_else(|| CorralError::NotFound {
            kind: "init process",
            id: "fake".into(),
        })
    }

    fn processes(&self) -> Result<Vec<i32>> {
        Ok(self
            .init
            .lock()
            .unwrap()
            .map(|s| vec![s.init_pid])
            .unwrap_or_default())
    }

    fn stats(&self) -> Result<RawStats> {
        Ok(RawStats {
            interfaces: vec![InterfaceStats {
                name: "eth0".into(),
                rx_bytes: 10,
                tx_bytes: 20,
                ..InterfaceStats::default()
            }],
            cgroup: Some(CgroupStats::default()),
        })
    }

    fn notify_oom(&self) -> Result<Receiver<()>> {
        if self.world.oom_unsupported.load(Ordering::SeqCst) {
            return Err(CorralError::Unsupported {
                message: "no memory.events".into(),
            });
        }
        let (tx, rx) = crossbeam_channel::unbounded();
        if self.world.oom_queued.load(Ordering::SeqCst) {
            tx.send(()).unwrap();
        }
        *self.oom.lock().unwrap() = Some(tx);
        Ok(rx)
    }

    fn destroy(&self) -> Result<()> {
        drop(self.oom.lock().unwrap().take());
        self.world.record("destroy");
        Ok(())
    }
}

pub struct FakeProcess {
    world: Arc<World>,
    pid: i32,
    exit: Arc<Exit>,
}

impl ContainerProcess for FakeProcess {
    fn pid(&self) -> i32 {
        self.pid
    }

    fn wait(&mut self) -> Result<std::process::ExitStatus> {
        if self.world.fail_wait.load(Ordering::SeqCst) {
            return Err(CorralError::Process {
                pid: self.pid,
                message: "wait refused".into(),
            });
        }
        Ok(std::process::ExitStatus::from_raw(self.exit.wait()))
    }

    fn signal(&mut self, signal: Signal) -> Result<()> {
        self.world.record(format!("process-signal:{signal}"));
        self.exit.finish(signal as i32);
        Ok(())
    }
}

pub struct FakeHost(pub Arc<World>);

impl Host for FakeHost {
    fn machine_memory(&self) -> Result<u64> {
        Ok(MACHINE_MEMORY)
    }

    fn system_cpu_usage(&self) -> Result<u64> {
        Ok(5_000)
    }

    fn process_start_time(&self, pid: i32) -> Result<Option<u64>> {
        Ok(self.0.start_times.lock().unwrap().get(&pid).copied())
    }

    fn signal(&self, pid: i32, signal: Signal) -> Result<()> {
        self.0.host_signals.lock().unwrap().push((pid, signal));
        if signal == Signal::SIGKILL || signal == Signal::SIGTERM {
            self.0.release(pid, signal as i32);
        }
        Ok(())
    }
}

/// A driver over the fakes with its state root in `root`.
pub fn driver(root: &std::path::Path) -> (ExecDriver, Arc<World>) {
    let world = Arc::new(World::default());
    let driver = ExecDriver::new(
        DriverConfig::with_root(root),
        Arc::new(FakeFactory(Arc::clone(&world))),
        Arc::new(FakeHost(Arc::clone(&world))),
        Arc::new(ActiveContainers::new()),
    )
    .expect("driver");
    (driver, world)
}

/// Polls `condition` for up to five seconds.
pub fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    false
}
