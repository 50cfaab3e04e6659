//! OOM-kill watcher.
//!
//! Observes a backend's OOM notification channel on its own thread while
//! the init process runs. The observation is best effort: an event the
//! backend delivers after the watcher is stopped is missed.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender, select};

use corral_common::types::ContainerId;

/// Watches for an OOM kill until stopped.
#[derive(Debug)]
pub struct OomWatcher {
    killed: Arc<AtomicBool>,
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl OomWatcher {
    /// Starts watching `events`. `None` means the backend cannot report OOM
    /// kills; the watcher then always reports `false`.
    #[must_use]
    pub fn spawn(id: &ContainerId, events: Option<Receiver<()>>) -> Self {
        let killed = Arc::new(AtomicBool::new(false));
        let Some(events) = events else {
            return Self {
                killed,
                stop: None,
                thread: None,
            };
        };

        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
        let flag = Arc::clone(&killed);
        let container = id.clone();
        let thread = std::thread::Builder::new()
            .name(format!("oom-{id}"))
            .spawn(move || watch(&container, &events, &stop_rx, &flag));
        match thread {
            Ok(thread) => Self {
                killed,
                stop: Some(stop_tx),
                thread: Some(thread),
            },
            Err(e) => {
                tracing::warn!(%id, error = %e, "failed to start OOM watcher");
                Self {
                    killed,
                    stop: None,
                    thread: None,
                }
            }
        }
    }

    /// Stops the watcher and returns whether an OOM kill was observed.
    #[must_use]
    pub fn finish(mut self) -> bool {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::warn!("OOM watcher panicked");
            }
        }
        self.killed.load(Ordering::SeqCst)
    }
}

fn watch(id: &ContainerId, events: &Receiver<()>, stop: &Receiver<()>, killed: &AtomicBool) {
    let mut open = true;
    while open {
        select! {
            recv(events) -> event => match event {
                Ok(()) => {
                    tracing::warn!(%id, "container OOM killed");
                    killed.store(true, Ordering::SeqCst);
                }
                // The backend stopped watching; wait for the stop signal.
                Err(_) => open = false,
            },
            recv(stop) -> _ => {
                // Events queued before the process exited still count.
                if events.try_recv().is_ok() {
                    tracing::warn!(%id, "container OOM killed");
                    killed.store(true, Ordering::SeqCst);
                }
                return;
            },
        }
    }
    let _ = stop.recv();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id() -> ContainerId {
        ContainerId::new("oom-test")
    }

    #[test]
    fn queued_event_is_reported() {
        let (tx, rx) = crossbeam_channel::unbounded();
        tx.send(()).unwrap();
        let watcher = OomWatcher::spawn(&id(), Some(rx));
        assert!(watcher.finish());
    }

    #[test]
    fn silent_channel_reports_false() {
        let (_tx, rx) = crossbeam_channel::unbounded::<()>();
        let watcher = OomWatcher::spawn(&id(), Some(rx));
        assert!(!watcher.finish());
    }

    #[test]
    fn disconnected_channel_reports_false() {
        let (tx, rx) = crossbeam_channel::unbounded::<()>();
        drop(tx);
        let watcher = OomWatcher::spawn(&id(), Some(rx));
        assert!(!watcher.finish());
    }

    #[test]
    fn unsupported_reports_false() {
        assert!(!OomWatcher::spawn(&id(), None).finish());
    }
}
