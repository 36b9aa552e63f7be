//! Submitter Configuration
//!
//! Sizing and policy knobs for the bio submission bank. The values are fixed
//! for the lifetime of an [`IoSubmitter`](crate::submitter::IoSubmitter);
//! the bank is never resized.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// =============================================================================
// Constants
// =============================================================================

/// Default thread name prefix
pub const DEFAULT_THREAD_NAME_PREFIX: &str = "bioq";

/// Default number of bio submission threads
pub const DEFAULT_THREAD_COUNT: u32 = 4;

/// Default number of consecutive PBNs routed to one queue before rotating
pub const DEFAULT_ROTATION_INTERVAL: u32 = 64;

/// Default bound on concurrently active requests
pub const DEFAULT_MAX_REQUESTS_ACTIVE: u32 = 2000;

/// Maximum number of bio submission threads
pub const MAX_THREAD_COUNT: u32 = 100;

/// Maximum rotation interval
pub const MAX_ROTATION_INTERVAL: u32 = 1024;

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the I/O submitter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubmitterConfig {
    /// Prefix for worker thread names (`{prefix}:bioQ{n}`)
    pub thread_name_prefix: String,

    /// Number of bio submission queues, one OS thread each
    pub thread_count: u32,

    /// Consecutive PBNs assigned to a queue before moving to the next
    pub rotation_interval: u32,

    /// Maximum requests in flight; each queue's merge map holds twice this
    pub max_requests_active: u32,

    /// Whether adjacent data bios are collected for merging
    pub use_bio_map: bool,

    /// Rewrite sync flags to favour full-stripe writes on MD RAID5
    pub md_raid5_mode: bool,
}

impl Default for SubmitterConfig {
    fn default() -> Self {
        Self {
            thread_name_prefix: DEFAULT_THREAD_NAME_PREFIX.to_string(),
            thread_count: DEFAULT_THREAD_COUNT,
            rotation_interval: DEFAULT_ROTATION_INTERVAL,
            max_requests_active: DEFAULT_MAX_REQUESTS_ACTIVE,
            use_bio_map: true,
            md_raid5_mode: false,
        }
    }
}

impl SubmitterConfig {
    /// Number of entries each queue's merge map must hold: a head and a
    /// tail sector for every request that may be active.
    pub fn bio_map_capacity(&self) -> usize {
        self.max_requests_active as usize * 2
    }

    /// Name of the work queue with the given index.
    pub fn queue_name(&self, index: usize) -> String {
        format!("{}:bioQ{}", self.thread_name_prefix, index)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.thread_count == 0 || self.thread_count > MAX_THREAD_COUNT {
            return Err(Error::Config(format!(
                "thread_count must be between 1 and {}, got {}",
                MAX_THREAD_COUNT, self.thread_count
            )));
        }
        if self.rotation_interval == 0 || self.rotation_interval > MAX_ROTATION_INTERVAL {
            return Err(Error::Config(format!(
                "rotation_interval must be between 1 and {}, got {}",
                MAX_ROTATION_INTERVAL, self.rotation_interval
            )));
        }
        if self.max_requests_active == 0 {
            return Err(Error::Config("max_requests_active must be > 0".into()));
        }
        if self.thread_name_prefix.is_empty() {
            return Err(Error::Config("thread_name_prefix must not be empty".into()));
        }
        Ok(())
    }

    /// Parse a YAML document. Missing fields take their defaults.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)
            .map_err(|e| Error::Config(format!("invalid submitter config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a YAML configuration file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&text)
    }
}

// =============================================================================
// Tests
// =============================================================================
