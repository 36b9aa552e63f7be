//! Request metadata shared by every bio a request owns.
//!
//! The surrounding engine creates one [`RequestInfo`] per I/O it issues. The
//! submitter only inspects it: the classification decides merge eligibility,
//! statistics buckets and the RAID5 sync hint; the data state decides whether
//! a read completion may take the fast acknowledgement path.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{Bio, PhysicalBlockNumber};
use crate::device::IoStatus;
use crate::stats::StatsBucket;

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique request identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId(u64);

impl RequestId {
    fn next() -> Self {
        Self(NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req#{}", self.0)
    }
}

// =============================================================================
// Classification
// =============================================================================

/// What kind of I/O a request performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VioType {
    /// User data
    Data,
    /// Recovery journal block
    RecoveryJournal,
    /// Slab journal block
    SlabJournal,
    /// Block map page
    BlockMap,
    /// Any other metadata
    Metadata,
}

impl VioType {
    pub fn is_data(self) -> bool {
        matches!(self, VioType::Data)
    }

    /// Only data bios are collected in the merge map; metadata is submitted
    /// as soon as its queue reaches it.
    pub fn is_mergeable(self) -> bool {
        self.is_data()
    }

    /// Statistics buckets a bio of this type is counted in.
    pub fn stats_buckets(self) -> &'static [StatsBucket] {
        match self {
            VioType::Data => &[StatsBucket::Out],
            VioType::RecoveryJournal => &[StatsBucket::Meta, StatsBucket::Journal],
            VioType::BlockMap => &[StatsBucket::Meta, StatsBucket::PageCache],
            VioType::SlabJournal | VioType::Metadata => &[StatsBucket::Meta],
        }
    }

    /// Sync flag to apply in MD RAID5 mode: cleared on data so the array can
    /// gather full stripes, set on journal writes to keep their latency low.
    pub fn raid5_sync_hint(self) -> Option<bool> {
        match self {
            VioType::Data => Some(false),
            VioType::RecoveryJournal | VioType::SlabJournal => Some(true),
            VioType::BlockMap | VioType::Metadata => None,
        }
    }
}

impl fmt::Display for VioType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VioType::Data => write!(f, "data"),
            VioType::RecoveryJournal => write!(f, "recovery_journal"),
            VioType::SlabJournal => write!(f, "slab_journal"),
            VioType::BlockMap => write!(f, "block_map"),
            VioType::Metadata => write!(f, "metadata"),
        }
    }
}

/// Mapping state of a data request, consulted on read completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataState {
    /// The block is stored compressed and must be decompressed first
    pub compressed: bool,
    /// The caller asked for less than a whole block
    pub partial: bool,
}

// =============================================================================
// Continuation
// =============================================================================

/// Where completed bios go.
///
/// Implemented by the engine that issued the request. Both methods may be
/// called from any thread the device completes on.
pub trait RequestContinuation: Send + Sync {
    /// Fast path: a successful read of uncompressed, whole-block data is
    /// ready to hand to the caller without further processing.
    fn acknowledge_read(&self, bio: Bio);

    /// Generic path; `result` is the device's result, unmodified.
    fn continue_request(&self, bio: Bio, result: IoStatus);
}

// =============================================================================
// Request Info
// =============================================================================

/// Immutable description of one engine request.
pub struct RequestInfo {
    id: RequestId,
    pbn: PhysicalBlockNumber,
    vio_type: VioType,
    data_state: DataState,
    continuation: Arc<dyn RequestContinuation>,
}

impl RequestInfo {
    /// Create a request targeting `pbn`.
    pub fn new(
        pbn: PhysicalBlockNumber,
        vio_type: VioType,
        continuation: Arc<dyn RequestContinuation>,
    ) -> Self {
        Self {
            id: RequestId::next(),
            pbn,
            vio_type,
            data_state: DataState::default(),
            continuation,
        }
    }

    pub fn with_data_state(mut self, data_state: DataState) -> Self {
        self.data_state = data_state;
        self
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn pbn(&self) -> PhysicalBlockNumber {
        self.pbn
    }

    pub fn vio_type(&self) -> VioType {
        self.vio_type
    }

    pub fn is_data(&self) -> bool {
        self.vio_type.is_data()
    }

    pub fn data_state(&self) -> DataState {
        self.data_state
    }

    pub fn continuation(&self) -> &Arc<dyn RequestContinuation> {
        &self.continuation
    }
}

impl fmt::Debug for RequestInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestInfo")
            .field("id", &self.id)
            .field("pbn", &self.pbn)
            .field("vio_type", &self.vio_type)
            .field("data_state", &self.data_state)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================
