//! Bio Statistics
//!
//! Lock-free counters updated on the submission and completion paths. A
//! [`SubmitterStats::snapshot`] gives a consistent-enough copy for dumps and
//! tests; individual counters are read with relaxed ordering.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::bio::{Bio, BioOp};

// =============================================================================
// Per-operation counters
// =============================================================================

/// Atomic per-operation bio counters.
#[derive(Debug, Default)]
pub struct AtomicBioStats {
    read: AtomicU64,
    write: AtomicU64,
    discard: AtomicU64,
    flush: AtomicU64,
    fua: AtomicU64,
}

impl AtomicBioStats {
    /// Count one bio.
    pub fn count(&self, bio: &Bio) {
        match bio.op() {
            BioOp::Read => self.read.fetch_add(1, Ordering::Relaxed),
            BioOp::Write => self.write.fetch_add(1, Ordering::Relaxed),
            BioOp::Discard => self.discard.fetch_add(1, Ordering::Relaxed),
            BioOp::Flush => self.flush.fetch_add(1, Ordering::Relaxed),
        };
        let flags = bio.flags();
        if flags.preflush && bio.op() != BioOp::Flush {
            self.flush.fetch_add(1, Ordering::Relaxed);
        }
        if flags.fua {
            self.fua.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> BioStats {
        BioStats {
            read: self.read.load(Ordering::Relaxed),
            write: self.write.load(Ordering::Relaxed),
            discard: self.discard.load(Ordering::Relaxed),
            flush: self.flush.load(Ordering::Relaxed),
            fua: self.fua.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`AtomicBioStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BioStats {
    pub read: u64,
    pub write: u64,
    pub discard: u64,
    pub flush: u64,
    pub fua: u64,
}

impl BioStats {
    pub fn total(&self) -> u64 {
        self.read + self.write + self.discard + self.flush
    }
}

impl std::ops::Sub for BioStats {
    type Output = BioStats;

    fn sub(self, rhs: BioStats) -> BioStats {
        BioStats {
            read: self.read.saturating_sub(rhs.read),
            write: self.write.saturating_sub(rhs.write),
            discard: self.discard.saturating_sub(rhs.discard),
            flush: self.flush.saturating_sub(rhs.flush),
            fua: self.fua.saturating_sub(rhs.fua),
        }
    }
}

impl fmt::Display for BioStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "read={} write={} discard={} flush={} fua={}",
            self.read, self.write, self.discard, self.flush, self.fua
        )
    }
}

// =============================================================================
// Submitter counters
// =============================================================================

/// Classification bucket for bio counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatsBucket {
    /// Data bios sent out
    Out,
    /// All metadata
    Meta,
    /// Recovery journal
    Journal,
    /// Block map pages
    PageCache,
}

/// All counters maintained by the submitter.
#[derive(Debug, Default)]
pub struct SubmitterStats {
    bios_submitted: AtomicU64,
    bios_completed: AtomicU64,
    flush_out: AtomicU64,
    back_merges: AtomicU64,
    front_merges: AtomicU64,
    map_insert_failures: AtomicU64,

    bios_out: AtomicBioStats,
    bios_meta: AtomicBioStats,
    bios_journal: AtomicBioStats,
    bios_page_cache: AtomicBioStats,

    bios_out_completed: AtomicBioStats,
    bios_meta_completed: AtomicBioStats,
    bios_journal_completed: AtomicBioStats,
    bios_page_cache_completed: AtomicBioStats,

    bios_acknowledged: AtomicBioStats,
}

impl SubmitterStats {
    pub fn new() -> Self {
        Self::default()
    }

    fn submitted_bucket(&self, bucket: StatsBucket) -> &AtomicBioStats {
        match bucket {
            StatsBucket::Out => &self.bios_out,
            StatsBucket::Meta => &self.bios_meta,
            StatsBucket::Journal => &self.bios_journal,
            StatsBucket::PageCache => &self.bios_page_cache,
        }
    }

    fn completed_bucket(&self, bucket: StatsBucket) -> &AtomicBioStats {
        match bucket {
            StatsBucket::Out => &self.bios_out_completed,
            StatsBucket::Meta => &self.bios_meta_completed,
            StatsBucket::Journal => &self.bios_journal_completed,
            StatsBucket::PageCache => &self.bios_page_cache_completed,
        }
    }

    /// Record a bio handed to the device.
    pub fn record_submitted(&self, bio: &Bio) {
        self.bios_submitted.fetch_add(1, Ordering::Relaxed);
        for bucket in bio.owner().vio_type().stats_buckets() {
            self.submitted_bucket(*bucket).count(bio);
        }
    }

    /// Record a bio the device has completed.
    pub fn record_completed(&self, bio: &Bio) {
        self.bios_completed.fetch_add(1, Ordering::Relaxed);
        for bucket in bio.owner().vio_type().stats_buckets() {
            self.completed_bucket(*bucket).count(bio);
        }
    }

    /// Record a flush bio accepted for forwarding.
    pub fn record_acknowledged(&self, bio: &Bio) {
        self.bios_acknowledged.count(bio);
    }

    pub fn record_flush_out(&self) {
        self.flush_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_back_merge(&self) {
        self.back_merges.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_front_merge(&self) {
        self.front_merges.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_map_insert_failure(&self) {
        self.map_insert_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bios_submitted(&self) -> u64 {
        self.bios_submitted.load(Ordering::Relaxed)
    }

    pub fn bios_completed(&self) -> u64 {
        self.bios_completed.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> SubmitterStatsSnapshot {
        SubmitterStatsSnapshot {
            bios_submitted: self.bios_submitted.load(Ordering::Relaxed),
            bios_completed: self.bios_completed.load(Ordering::Relaxed),
            flush_out: self.flush_out.load(Ordering::Relaxed),
            back_merges: self.back_merges.load(Ordering::Relaxed),
            front_merges: self.front_merges.load(Ordering::Relaxed),
            map_insert_failures: self.map_insert_failures.load(Ordering::Relaxed),
            bios_out: self.bios_out.snapshot(),
            bios_meta: self.bios_meta.snapshot(),
            bios_journal: self.bios_journal.snapshot(),
            bios_page_cache: self.bios_page_cache.snapshot(),
            bios_out_completed: self.bios_out_completed.snapshot(),
            bios_meta_completed: self.bios_meta_completed.snapshot(),
            bios_journal_completed: self.bios_journal_completed.snapshot(),
            bios_page_cache_completed: self.bios_page_cache_completed.snapshot(),
            bios_acknowledged: self.bios_acknowledged.snapshot(),
        }
    }
}

/// Serializable copy of [`SubmitterStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitterStatsSnapshot {
    pub bios_submitted: u64,
    pub bios_completed: u64,
    pub flush_out: u64,
    pub back_merges: u64,
    pub front_merges: u64,
    pub map_insert_failures: u64,
    pub bios_out: BioStats,
    pub bios_meta: BioStats,
    pub bios_journal: BioStats,
    pub bios_page_cache: BioStats,
    pub bios_out_completed: BioStats,
    pub bios_meta_completed: BioStats,
    pub bios_journal_completed: BioStats,
    pub bios_page_cache_completed: BioStats,
    pub bios_acknowledged: BioStats,
}

impl SubmitterStatsSnapshot {
    /// Bios handed to the device whose completion has not been seen yet.
    pub fn in_progress(&self) -> u64 {
        self.bios_submitted.saturating_sub(self.bios_completed)
    }
}

impl fmt::Display for SubmitterStatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Bio submission statistics:")?;
        writeln!(f, "  submitted: {}", self.bios_submitted)?;
        writeln!(f, "  completed: {}", self.bios_completed)?;
        writeln!(f, "  in progress: {}", self.in_progress())?;
        writeln!(f, "  flush out: {}", self.flush_out)?;
        writeln!(
            f,
            "  merges: back={} front={} map insert failures={}",
            self.back_merges, self.front_merges, self.map_insert_failures
        )?;
        writeln!(f, "  out: {}", self.bios_out)?;
        writeln!(f, "  meta: {}", self.bios_meta)?;
        writeln!(f, "  journal: {}", self.bios_journal)?;
        writeln!(f, "  page cache: {}", self.bios_page_cache)?;
        writeln!(f, "  out completed: {}", self.bios_out_completed)?;
        writeln!(f, "  meta completed: {}", self.bios_meta_completed)?;
        writeln!(f, "  journal completed: {}", self.bios_journal_completed)?;
        writeln!(f, "  page cache completed: {}", self.bios_page_cache_completed)?;
        write!(f, "  acknowledged: {}", self.bios_acknowledged)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bio::request::tests::noop_request;
    use crate::bio::{BioFlags, VioType, BLOCK_SIZE};
    use bytes::BytesMut;

    fn bio(vio_type: VioType, op: BioOp) -> Bio {
        Bio::for_block(noop_request(1, vio_type), op, BytesMut::zeroed(BLOCK_SIZE))
    }

    #[test]
    fn test_bio_stats_count_by_op() {
        let stats = AtomicBioStats::default();
        stats.count(&bio(VioType::Data, BioOp::Read));
        stats.count(&bio(VioType::Data, BioOp::Write));
        stats.count(&bio(VioType::Data, BioOp::Write).with_flags(BioFlags {
            fua: true,
            preflush: true,
            ..Default::default()
        }));
        stats.count(&bio(VioType::Data, BioOp::Discard));

        let snap = stats.snapshot();
        assert_eq!(snap.read, 1);
        assert_eq!(snap.write, 2);
        assert_eq!(snap.discard, 1);
        assert_eq!(snap.flush, 1);
        assert_eq!(snap.fua, 1);
        assert_eq!(snap.total(), 5);
    }

    #[test]
    fn test_bio_stats_sub() {
        let a = BioStats {
            read: 5,
            write: 3,
            ..Default::default()
        };
        let b = BioStats {
            read: 2,
            write: 4,
            ..Default::default()
        };
        let d = a - b;
        assert_eq!(d.read, 3);
        assert_eq!(d.write, 0);
    }

    #[test]
    fn test_submitted_buckets() {
        let stats = SubmitterStats::new();
        stats.record_submitted(&bio(VioType::Data, BioOp::Write));
        stats.record_submitted(&bio(VioType::RecoveryJournal, BioOp::Write));
        stats.record_submitted(&bio(VioType::BlockMap, BioOp::Read));
        stats.record_submitted(&bio(VioType::SlabJournal, BioOp::Write));

        let snap = stats.snapshot();
        assert_eq!(snap.bios_submitted, 4);
        assert_eq!(snap.bios_out.write, 1);
        assert_eq!(snap.bios_meta.write, 2);
        assert_eq!(snap.bios_meta.read, 1);
        assert_eq!(snap.bios_journal.write, 1);
        assert_eq!(snap.bios_page_cache.read, 1);
        assert_eq!(snap.in_progress(), 4);
    }

    #[test]
    fn test_completed_buckets() {
        let stats = SubmitterStats::new();
        let b = bio(VioType::Data, BioOp::Read);
        stats.record_submitted(&b);
        stats.record_completed(&b);

        let snap = stats.snapshot();
        assert_eq!(snap.bios_completed, 1);
        assert_eq!(snap.bios_out_completed.read, 1);
        assert_eq!(snap.bios_meta_completed.total(), 0);
        assert_eq!(snap.in_progress(), 0);
    }

    #[test]
    fn test_snapshot_display() {
        let stats = SubmitterStats::new();
        stats.record_back_merge();
        stats.record_front_merge();
        let text = stats.snapshot().to_string();
        assert!(text.contains("merges: back=1 front=1"));
    }
}
