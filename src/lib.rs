//! bioq - Bio Submission Layer for Block Storage Engines
//!
//! Takes block I/O generated inside a storage engine and gets it onto the
//! underlying device through a fixed bank of worker threads, joining adjacent
//! sequential bios on the way so the device sees fewer, larger requests.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                           IoSubmitter                            │
//! ├──────────────────────────────────────────────────────────────────┤
//! │   PBN ──▶ QueueRouting ──┬──▶ bioQ0 [merge map │ work queue]     │
//! │                          ├──▶ bioQ1 [merge map │ work queue]     │
//! │   flush ──▶ BioRotor ────┴──▶ ...                                │
//! └──────────────────────────────────┬───────────────────────────────┘
//!                                    ▼
//!              BlockDevice ──▶ CompletionPath ──▶ RequestContinuation
//! ```
//!
//! # Modules
//!
//! - [`bio`] - Bios, operations and request metadata
//! - [`config`] - Submitter configuration
//! - [`device`] - Block device trait and in-memory / file devices
//! - [`error`] - Error types
//! - [`stats`] - Submission and completion counters
//! - [`submitter`] - Queue bank, routing, merging and completion
//! - [`waiter`] - Channel and oneshot continuations
//! - [`work_queue`] - Single-threaded priority work queues

pub mod bio;
pub mod config;
pub mod device;
pub mod error;
pub mod stats;
pub mod submitter;
pub mod waiter;
pub mod work_queue;

// Re-export commonly used types
pub use bio::{Bio, BioFlags, BioOp, DataState, RequestContinuation, RequestInfo, VioType};
pub use config::SubmitterConfig;
pub use device::{BlockDevice, DeviceError, IoStatus, MemoryDevice, SubmittedBio};
pub use error::{Error, Result};
pub use stats::SubmitterStatsSnapshot;
pub use submitter::{IoSubmitter, SubmitterDump};
pub use waiter::{ChannelContinuation, Completion, CompletionWaiter};
pub use work_queue::BioQAction;

#[cfg(unix)]
pub use device::FileDevice;
