//! Lightweight descriptor of one container as seen by a driver.

use corral_common::types::{ContainerId, ContainerState};

use crate::driver::ExecDriver;
use crate::error::Result;

/// A container id bound to the driver that answers questions about it.
#[derive(Debug)]
pub struct Info<'a> {
    id: ContainerId,
    driver: &'a ExecDriver,
}

impl<'a> Info<'a> {
    pub(crate) const fn new(id: ContainerId, driver: &'a ExecDriver) -> Self {
        Self { id, driver }
    }

    /// Container id.
    #[must_use]
    pub const fn id(&self) -> &ContainerId {
        &self.id
    }

    /// Whether the container's init process has started and the container
    /// has not been torn down.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.driver
            .registry()
            .get(&self.id)
            .is_some_and(|c| c.init().is_some())
    }

    /// Lifecycle state.
    #[must_use]
    pub fn state(&self) -> ContainerState {
        match self.driver.registry().get(&self.id) {
            Some(c) if c.init().is_some() && c.is_paused() => ContainerState::Paused,
            Some(c) if c.init().is_some() => ContainerState::Running,
            _ => ContainerState::Stopped,
        }
    }

    /// Host pids of the container's processes.
    ///
    /// # Errors
    ///
    /// Returns an error if the container is not active or its processes
    /// cannot be listed.
    pub fn processes(&self) -> Result<Vec<i32>> {
        self.driver.processes(&self.id)
    }
}
