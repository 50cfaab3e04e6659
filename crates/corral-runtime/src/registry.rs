//! Registry of active containers.
//!
//! A container is active from the moment its runtime handle exists until
//! its `run` call has cleaned up. Lifecycle operations on other threads look
//! it up here by id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use corral_common::types::ContainerId;

use crate::backend::RuntimeHandle;
use crate::console::Terminal;
use crate::error::{DriverError, Result};

/// Identity of a started init process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitProcess {
    /// Host pid.
    pub pid: i32,
    /// Start time in clock ticks since boot.
    pub start_time: u64,
}

/// One active container.
pub struct ActiveContainer {
    id: ContainerId,
    handle: Arc<dyn RuntimeHandle>,
    init: Mutex<Option<InitProcess>>,
    console: Mutex<Option<Arc<dyn Terminal>>>,
    paused: AtomicBool,
}

impl ActiveContainer {
    /// Wraps a freshly created runtime handle.
    #[must_use]
    pub fn new(id: ContainerId, handle: Arc<dyn RuntimeHandle>) -> Self {
        Self {
            id,
            handle,
            init: Mutex::new(None),
            console: Mutex::new(None),
            paused: AtomicBool::new(false),
        }
    }

    /// Container identifier.
    #[must_use]
    pub const fn id(&self) -> &ContainerId {
        &self.id
    }

    /// Runtime handle owning the container's isolation.
    #[must_use]
    pub const fn handle(&self) -> &Arc<dyn RuntimeHandle> {
        &self.handle
    }

    /// The started init process, if any.
    #[must_use]
    pub fn init(&self) -> Option<InitProcess> {
        *lock(&self.init)
    }

    pub(crate) fn set_init(&self, init: InitProcess) {
        *lock(&self.init) = Some(init);
    }

    /// Console of the init process, if one was attached.
    #[must_use]
    pub fn console(&self) -> Option<Arc<dyn Terminal>> {
        lock(&self.console).clone()
    }

    pub(crate) fn set_console(&self, console: Arc<dyn Terminal>) {
        *lock(&self.console) = Some(console);
    }

    /// Whether the container is currently frozen.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub(crate) fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for ActiveContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveContainer")
            .field("id", &self.id)
            .field("init", &self.init())
            .field("paused", &self.is_paused())
            .finish_non_exhaustive()
    }
}

/// Thread-safe map from container id to active container.
///
/// Several drivers may share one registry; each container id maps to at
/// most one entry.
#[derive(Debug, Default)]
pub struct ActiveContainers {
    entries: Mutex<HashMap<ContainerId, Arc<ActiveContainer>>>,
}

impl ActiveContainers {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `container`.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::AlreadyActive`] if the id is taken.
    pub fn insert(&self, container: Arc<ActiveContainer>) -> Result<()> {
        let mut entries = lock(&self.entries);
        if entries.contains_key(container.id()) {
            return Err(DriverError::AlreadyActive {
                id: container.id().clone(),
                operation: "run",
            });
        }
        tracing::debug!(id = %container.id(), "container registered");
        let _ = entries.insert(container.id().clone(), container);
        Ok(())
    }

    /// Looks up the active container for `id`.
    #[must_use]
    pub fn get(&self, id: &ContainerId) -> Option<Arc<ActiveContainer>> {
        lock(&self.entries).get(id).cloned()
    }

    /// Removes `container` if it is still the entry registered for its id.
    ///
    /// A later container registered under the same id is left in place.
    pub fn remove_entry(&self, container: &Arc<ActiveContainer>) -> bool {
        let mut entries = lock(&self.entries);
        let current = entries.get(container.id());
        if !current.is_some_and(|c| Arc::ptr_eq(c, container)) {
            return false;
        }
        let _ = entries.remove(container.id());
        tracing::debug!(id = %container.id(), "container unregistered");
        true
    }

    /// Number of active containers.
    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    /// Whether no container is active.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sorted ids of the active containers.
    #[must_use]
    pub fn ids(&self) -> Vec<ContainerId> {
        let mut ids: Vec<_> = lock(&self.entries).keys().cloned().collect();
        ids.sort();
        ids
    }
}

/// Locks `mutex`, recovering the data if a holder panicked.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
