//! Errors returned by the execution driver.
//!
//! Every variant names the container and the lifecycle operation so callers
//! can log the failure and map it to their own API status.

use corral_common::error::CorralError;
use corral_common::types::ContainerId;
use thiserror::Error;

/// Error returned by a start callback.
pub type CallbackError = Box<dyn std::error::Error + Send + Sync>;

/// Failure of a lifecycle operation.
#[derive(Debug, Error)]
pub enum DriverError {
    /// No active container exists for the identifier.
    #[error("{operation}: active container for {id} does not exist")]
    NotActive {
        /// Container the operation targeted.
        id: ContainerId,
        /// Lifecycle operation.
        operation: &'static str,
    },

    /// The identifier already has an active container.
    #[error("{operation}: container {id} is already active")]
    AlreadyActive {
        /// Container the operation targeted.
        id: ContainerId,
        /// Lifecycle operation.
        operation: &'static str,
    },

    /// The container has no started init process to signal.
    #[error("{operation} {id}: not started")]
    NotStarted {
        /// Container the operation targeted.
        id: ContainerId,
        /// Lifecycle operation.
        operation: &'static str,
    },

    /// The runtime backend failed.
    #[error("{operation} {id}: {source}")]
    Runtime {
        /// Container the operation targeted.
        id: ContainerId,
        /// Lifecycle operation.
        operation: &'static str,
        /// Error reported by the backend.
        source: CorralError,
    },

    /// Console or pipe setup failed; the process was never started.
    #[error("{operation} {id}: console setup failed: {source}")]
    ConsoleSetup {
        /// Container the operation targeted.
        id: ContainerId,
        /// Lifecycle operation.
        operation: &'static str,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The caller's start callback failed; the process was killed.
    #[error("{operation} {id}: start callback failed: {source}")]
    StartCallback {
        /// Container the operation targeted.
        id: ContainerId,
        /// Lifecycle operation.
        operation: &'static str,
        /// Error returned by the callback.
        source: CallbackError,
    },

    /// Reading host information or driver-owned state failed.
    #[error("{operation} {id}: {source}")]
    Host {
        /// Container the operation targeted.
        id: ContainerId,
        /// Lifecycle operation.
        operation: &'static str,
        /// Underlying error.
        source: CorralError,
    },

    /// Driver-owned state on disk could not be written or removed.
    #[error("{operation} {id}: state: {source}")]
    State {
        /// Container the operation targeted.
        id: ContainerId,
        /// Lifecycle operation.
        operation: &'static str,
        /// Underlying error.
        source: CorralError,
    },

    /// The container id cannot name a state directory.
    #[error("{0}")]
    InvalidId(CorralError),

    /// The driver could not be constructed.
    #[error("driver setup: {0}")]
    Setup(#[from] CorralError),
}

impl DriverError {
    /// Container the failed operation targeted, if any.
    #[must_use]
    pub const fn container_id(&self) -> Option<&ContainerId> {
        match self {
            Self::NotActive { id, .. }
            | Self::AlreadyActive { id, .. }
            | Self::NotStarted { id, .. }
            | Self::Runtime { id, .. }
            | Self::ConsoleSetup { id, .. }
            | Self::StartCallback { id, .. }
            | Self::Host { id, .. }
            | Self::State { id, .. } => Some(id),
            Self::InvalidId(_) | Self::Setup(_) => None,
        }
    }
}

/// Result alias for driver operations.
pub type Result<T> = std::result::Result<T, DriverError>;
