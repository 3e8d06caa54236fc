//! Error types for lifecycle and catalog operations.
//!
//! `ManagerError` is what the controllers and the catalog return to callers;
//! the HTTP layer maps each variant onto a status code. `KillError` is
//! produced by the platform capabilities and is normally logged rather than
//! surfaced.

use thiserror::Error;

/// Errors returned by the lifecycle controllers and the catalog.
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("service not found: {0}")]
    ServiceNotFound(String),
    #[error("project not found: {0}")]
    ProjectNotFound(String),
    /// The requested change would break a catalog invariant.
    #[error("{0}")]
    Conflict(String),
    /// The OS refused to create the service's process.
    #[error("failed to spawn service {service}: {source}")]
    Spawn {
        service: String,
        #[source]
        source: std::io::Error,
    },
    #[error("catalog error: {0:#}")]
    Catalog(anyhow::Error),
}

impl ManagerError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ManagerError::ServiceNotFound(_) | ManagerError::ProjectNotFound(_)
        )
    }
}

/// Errors from terminating processes or resolving port owners.
#[derive(Debug, Error)]
pub enum KillError {
    /// The host platform has no way to perform the operation.
    #[error("operation not supported on this platform")]
    Unsupported,
    #[error("refusing to signal reserved pid {0}")]
    ReservedPid(u32),
    #[error("{command} failed: {source}")]
    Io {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{command} exited with {status}")]
    CommandFailed { command: String, status: String },
}
