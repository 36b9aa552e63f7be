//! Bio queue action table.
//!
//! Every work item carries an action. The action's priority decides the order
//! in which a queue runs its items (higher first, FIFO within a priority), and
//! two items are merge-compatible only when their actions are equal.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Number of distinct priority levels.
pub const PRIORITY_LEVELS: usize = 3;

/// Highest priority value.
pub const MAX_PRIORITY: usize = PRIORITY_LEVELS - 1;

/// Work item actions known to bio submission queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BioQAction {
    CompressedData,
    Data,
    Flush,
    High,
    Metadata,
    ReadCache,
    Verify,
}

impl BioQAction {
    /// All actions, in table order.
    pub const ALL: [BioQAction; 7] = [
        BioQAction::CompressedData,
        BioQAction::Data,
        BioQAction::Flush,
        BioQAction::High,
        BioQAction::Metadata,
        BioQAction::ReadCache,
        BioQAction::Verify,
    ];

    /// Name used in dumps and statistics.
    pub fn name(self) -> &'static str {
        match self {
            BioQAction::CompressedData => "bio_compressed_data",
            BioQAction::Data => "bio_data",
            BioQAction::Flush => "bio_flush",
            BioQAction::High => "bio_high",
            BioQAction::Metadata => "bio_metadata",
            BioQAction::ReadCache => "bio_readcache",
            BioQAction::Verify => "bio_verify",
        }
    }

    pub fn priority(self) -> usize {
        match self {
            BioQAction::CompressedData | BioQAction::Data | BioQAction::ReadCache => 0,
            BioQAction::Metadata | BioQAction::Verify => 1,
            BioQAction::Flush | BioQAction::High => 2,
        }
    }

    /// Position in [`BioQAction::ALL`].
    pub fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for BioQAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
