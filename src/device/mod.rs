//! Block Device Abstraction
//!
//! The submitter hands each bio to a [`BlockDevice`] wrapped in a
//! [`SubmittedBio`]. The device performs the I/O, possibly later and on
//! another thread, and reports the outcome with [`SubmittedBio::complete`],
//! which routes the bio back through the submitter's completion path to the
//! owning request.
//!
//! `begin_batch` / `end_batch` bracket a burst of submissions from one bio
//! queue thread (the block layer's plug/unplug); devices that cannot use the
//! hint ignore it.

#[cfg(unix)]
pub mod file;
pub mod memory;

use std::io;
use std::sync::Arc;

use thiserror::Error;

use crate::bio::{Bio, Sector};
use crate::submitter::completion::CompletionPath;

#[cfg(unix)]
pub use file::FileDevice;
pub use memory::{MemoryDevice, SubmissionRecord};

/// Errors a device reports through a bio's completion.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    /// Underlying I/O failure
    #[error("I/O error ({kind:?}): {message}")]
    Io { kind: io::ErrorKind, message: String },

    /// Bio extends past the end of the device
    #[error("sectors {sector}..+{sectors} beyond device end at sector {capacity}")]
    OutOfRange {
        sector: Sector,
        sectors: u32,
        capacity: Sector,
    },

    /// Failure injected for testing
    #[error("injected failure at sector {0}")]
    Injected(Sector),

    /// The device no longer accepts I/O
    #[error("device {0} is offline")]
    Offline(String),
}

impl From<io::Error> for DeviceError {
    fn from(err: io::Error) -> Self {
        DeviceError::Io {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Result of one bio's device operation.
pub type IoStatus = std::result::Result<(), DeviceError>;

/// A bio in the device's hands, carrying its way back to the submitter.
pub struct SubmittedBio {
    bio: Bio,
    path: Arc<CompletionPath>,
}

impl SubmittedBio {
    pub(crate) fn new(bio: Bio, path: Arc<CompletionPath>) -> Self {
        Self { bio, path }
    }

    pub fn bio(&self) -> &Bio {
        &self.bio
    }

    pub fn bio_mut(&mut self) -> &mut Bio {
        &mut self.bio
    }

    /// Report the outcome. Callable from any thread.
    pub fn complete(self, status: IoStatus) {
        self.path.on_device_completion(self.bio, status);
    }
}

impl std::fmt::Debug for SubmittedBio {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("SubmittedBio").field(&self.bio).finish()
    }
}

/// Device submission primitive.
pub trait BlockDevice: Send + Sync + 'static {
    /// Name for logs and dumps.
    fn name(&self) -> &str;

    /// Accept a bio. May block when the device is saturated; must eventually
    /// call [`SubmittedBio::complete`] exactly once.
    fn submit(&self, bio: SubmittedBio);

    /// Several submissions from the calling thread follow.
    fn begin_batch(&self) {}

    /// The current batch is over.
    fn end_batch(&self) {}
}
