//! Error types for the bio submission layer

use thiserror::Error;

use crate::bio::RequestId;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by submitter creation, scheduling and configuration.
///
/// Device failures are not represented here: they travel asynchronously in
/// the completion result of each bio (see [`crate::device::DeviceError`]).
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Allocation of bank, queue or map resources failed
    #[error("Allocation failed for {what}: {reason}")]
    AllocationFailed { what: &'static str, reason: String },

    /// A worker queue thread could not be started
    #[error("Failed to start work queue {queue}: {source}")]
    QueueStart {
        queue: String,
        #[source]
        source: std::io::Error,
    },

    /// The submitter has been shut down
    #[error("I/O submitter has been shut down")]
    ShutDown,

    /// The request already has bios waiting in a merge group
    #[error("Request {0} already has a pending bio group")]
    RequestPending(RequestId),

    /// Work was offered to a queue that is no longer accepting items
    #[error("Work queue {0} is stopped")]
    QueueStopped(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}
