//! Bios: the device-facing unit of work
//!
//! A [`Bio`] is a contiguous sector range, an operation, a set of hint flags
//! and a payload buffer. Every bio points back at the request that owns it
//! ([`RequestInfo`]), which carries the request's classification and the
//! continuation invoked when the device completes the bio.
//!
//! ```text
//!   PBN 12 ──▶ sectors [96, 103]      (8 × 512 B = one 4 KiB block)
//!   PBN 13 ──▶ sectors [104, 111]
//! ```

pub mod request;

use std::fmt;
use std::sync::Arc;

use bytes::BytesMut;
use serde::{Deserialize, Serialize};

pub use request::{DataState, RequestContinuation, RequestId, RequestInfo, VioType};

// =============================================================================
// Constants
// =============================================================================

/// A 512-byte sector number on the underlying device.
pub type Sector = u64;

/// A fixed-size block number on the underlying device.
pub type PhysicalBlockNumber = u64;

/// Bytes per sector
pub const SECTOR_SIZE: usize = 512;

/// Bytes per block
pub const BLOCK_SIZE: usize = 4096;

/// Sectors per block
pub const SECTORS_PER_BLOCK: u64 = (BLOCK_SIZE / SECTOR_SIZE) as u64;

/// First sector of a physical block.
#[inline]
pub fn pbn_to_sector(pbn: PhysicalBlockNumber) -> Sector {
    pbn * SECTORS_PER_BLOCK
}

// =============================================================================
// Operation and Direction
// =============================================================================

/// Operation requested of the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BioOp {
    Read,
    Write,
    Discard,
    Flush,
}

impl BioOp {
    /// Data direction of the operation. Everything except a read moves data
    /// toward the device.
    pub fn direction(self) -> IoDirection {
        match self {
            BioOp::Read => IoDirection::Read,
            BioOp::Write | BioOp::Discard | BioOp::Flush => IoDirection::Write,
        }
    }
}

impl fmt::Display for BioOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BioOp::Read => write!(f, "read"),
            BioOp::Write => write!(f, "write"),
            BioOp::Discard => write!(f, "discard"),
            BioOp::Flush => write!(f, "flush"),
        }
    }
}

/// Data direction of a bio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IoDirection {
    Read,
    Write,
}

/// Hint flags carried to the device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BioFlags {
    /// Synchronous I/O; the device should not hold the bio for combining
    pub sync: bool,
    /// Forced unit access
    pub fua: bool,
    /// Flush the device cache before this bio
    pub preflush: bool,
}

// =============================================================================
// Bio
// =============================================================================

/// A contiguous sector range handed to the device.
pub struct Bio {
    sector: Sector,
    sectors: u32,
    op: BioOp,
    flags: BioFlags,
    data: BytesMut,
    owner: Arc<RequestInfo>,
}

impl Bio {
    /// Create a bio starting at `sector` covering `data`.
    ///
    /// `data` must be a whole number of sectors. For reads it is the buffer
    /// the device fills; for writes it is the payload.
    pub fn new(owner: Arc<RequestInfo>, op: BioOp, sector: Sector, data: BytesMut) -> Self {
        debug_assert_eq!(data.len() % SECTOR_SIZE, 0, "bio data must be sector sized");
        Self {
            sector,
            sectors: (data.len() / SECTOR_SIZE) as u32,
            op,
            flags: BioFlags::default(),
            data,
            owner,
        }
    }

    /// Create a bio covering exactly the owner's physical block.
    pub fn for_block(owner: Arc<RequestInfo>, op: BioOp, data: BytesMut) -> Self {
        let sector = pbn_to_sector(owner.pbn());
        Self::new(owner, op, sector, data)
    }

    /// Create an empty pre-flush bio.
    pub fn empty_flush(owner: Arc<RequestInfo>) -> Self {
        let mut bio = Self::new(owner, BioOp::Flush, 0, BytesMut::new());
        bio.flags.preflush = true;
        bio
    }

    /// Builder-style flag setter.
    pub fn with_flags(mut self, flags: BioFlags) -> Self {
        self.flags = flags;
        self
    }

    /// First sector covered.
    #[inline]
    pub fn sector(&self) -> Sector {
        self.sector
    }

    /// Length in sectors.
    #[inline]
    pub fn sectors(&self) -> u32 {
        self.sectors
    }

    /// Last sector covered (inclusive). Equals [`Bio::sector`] for an empty bio.
    #[inline]
    pub fn last_sector(&self) -> Sector {
        self.sector + u64::from(self.sectors.max(1)) - 1
    }

    /// Length in bytes.
    pub fn len_bytes(&self) -> usize {
        self.sectors as usize * SECTOR_SIZE
    }

    pub fn op(&self) -> BioOp {
        self.op
    }

    pub fn direction(&self) -> IoDirection {
        self.op.direction()
    }

    pub fn flags(&self) -> BioFlags {
        self.flags
    }

    pub fn flags_mut(&mut self) -> &mut BioFlags {
        &mut self.flags
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Consume the bio, returning its buffer.
    pub fn into_data(self) -> BytesMut {
        self.data
    }

    /// The request this bio belongs to.
    pub fn owner(&self) -> &Arc<RequestInfo> {
        &self.owner
    }

    /// Turn this bio into an empty pre-flush, dropping any payload.
    pub(crate) fn prepare_flush(&mut self) {
        self.op = BioOp::Flush;
        self.sector = 0;
        self.sectors = 0;
        self.data.clear();
        self.flags.preflush = true;
    }
}

impl fmt::Debug for Bio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bio")
            .field("sector", &self.sector)
            .field("sectors", &self.sectors)
            .field("op", &self.op)
            .field("flags", &self.flags)
            .field("request", &self.owner.id())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
