//! I/O Submitter
//!
//! The submitter owns a fixed bank of bio queues, one OS thread each, and is
//! the single entry point through which the storage engine sends bios to the
//! device.
//!
//! # Flow
//!
//! ```text
//!   submit_bio(bio, action)
//!     │  queue = (pbn % (T × R)) / R
//!     ▼
//!   ┌────────────── bio queue [queue] ──────────────┐
//!   │ lock merge state                              │
//!   │   back merge ─▶ append to group, done         │
//!   │   front merge ─▶ prepend to group, done       │
//!   │   no merge ─▶ new group + work item ───┐      │
//!   │ unlock                                 ▼      │
//!   │              worker thread: take group, unlock, submit each bio
//!   └───────────────────────────────────────────────┘
//!                                            │
//!                                            ▼
//!                      device ─▶ completion path ─▶ request continuation
//! ```
//!
//! Every PBN is served by exactly one queue, so all merging for a PBN happens
//! under one lock and all device submission for it happens on one thread.
//! Work without an address (flushes, [`IoSubmitter::enqueue_work`]) is spread
//! over the queues by a rotor.

pub mod bio_map;
pub mod completion;
pub mod routing;

mod proptest;

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::bio::{Bio, PhysicalBlockNumber, RequestId, Sector};
use crate::config::SubmitterConfig;
use crate::device::{BlockDevice, DeviceError, SubmittedBio};
use crate::error::{Error, Result};
use crate::stats::{SubmitterStats, SubmitterStatsSnapshot};
use crate::work_queue::{self, BioQAction, WorkItem, WorkQueue, WorkQueueDump, WorkQueueHooks};

pub use bio_map::{BioMap, BioMapFull, BioMapState, GroupPending, MergeOutcome};
pub use completion::CompletionPath;
pub use routing::{BioRotor, QueueRouting};

// =============================================================================
// Queue Identity
// =============================================================================

/// Private data of a bio queue thread: which bank and which slot it serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct BioQueueIdentity {
    pub bank: Uuid,
    pub index: usize,
}

/// Identity of the bio queue the current thread belongs to.
pub fn current_bio_queue() -> Option<BioQueueIdentity> {
    work_queue::with_private_data::<BioQueueIdentity, _>(|identity| identity.copied())
}

// =============================================================================
// Bio Queue
// =============================================================================

/// Per-slot state shared between the submitter and the slot's thread.
struct BioQueueData {
    identity: BioQueueIdentity,
    name: String,
    routing: QueueRouting,
    merge: Mutex<BioMapState>,
    device: Arc<dyn BlockDevice>,
    stats: Arc<SubmitterStats>,
    completion: Arc<CompletionPath>,
    batches: AtomicU64,
}

impl BioQueueData {
    fn is_current(&self) -> bool {
        current_bio_queue() == Some(self.identity)
    }

    fn assert_running_in_bio_queue(&self) {
        debug_assert!(
            self.is_current(),
            "expected to run on {} (thread {:?})",
            self.name,
            std::thread::current().name()
        );
    }

    fn assert_running_in_bio_queue_for_pbn(&self, pbn: PhysicalBlockNumber) {
        self.assert_running_in_bio_queue();
        debug_assert_eq!(
            self.routing.queue_for_pbn(pbn),
            self.identity.index,
            "PBN {} submitted on {}",
            pbn,
            self.name
        );
    }

    /// Work item body for a newly queued group.
    fn process_pending_group(&self, id: RequestId) {
        let bios = self.merge.lock().take_group(id);
        for bio in bios {
            self.assert_running_in_bio_queue_for_pbn(bio.owner().pbn());
            self.send_bio(bio);
        }
    }

    /// Work item body for a bio that bypasses the merge map.
    fn process_bio(&self, bio: Bio) {
        self.assert_running_in_bio_queue_for_pbn(bio.owner().pbn());
        self.send_bio(bio);
    }

    fn process_flush(&self, bios: Vec<Bio>) {
        self.assert_running_in_bio_queue();
        for mut bio in bios {
            self.stats.record_acknowledged(&bio);
            bio.prepare_flush();
            self.stats.record_flush_out();
            self.send_bio(bio);
        }
    }

    fn send_bio(&self, bio: Bio) {
        self.stats.record_submitted(&bio);
        self.device
            .submit(SubmittedBio::new(bio, Arc::clone(&self.completion)));
    }

    /// Complete the bios of a group that will never be submitted.
    fn fail_group(&self, bios: Vec<Bio>, skip: RequestId) {
        for bio in bios {
            if bio.owner().id() == skip {
                continue;
            }
            warn!(queue = %self.name, request = %bio.owner().id(), "failing merged bio of unscheduled group");
            SubmittedBio::new(bio, Arc::clone(&self.completion))
                .complete(Err(DeviceError::Offline(self.device.name().to_string())));
        }
    }
}

impl WorkQueueHooks for BioQueueData {
    fn start(&self) {
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.device.begin_batch();
    }

    fn finish(&self) {
        self.device.end_batch();
    }
}

/// One slot of the bank: its shared state and its work queue.
struct BioQueue {
    data: Arc<BioQueueData>,
    queue: WorkQueue,
}

impl BioQueue {
    fn start(
        identity: BioQueueIdentity,
        config: &SubmitterConfig,
        routing: QueueRouting,
        shared: &SharedResources,
    ) -> Result<Self> {
        let name = config.queue_name(identity.index);
        let merge = BioMapState::new(config.bio_map_capacity())?;
        let data = Arc::new(BioQueueData {
            identity,
            name: name.clone(),
            routing,
            merge: Mutex::new(merge),
            device: Arc::clone(&shared.device),
            stats: Arc::clone(&shared.stats),
            completion: Arc::clone(&shared.completion),
            batches: AtomicU64::new(0),
        });
        let hooks: Arc<dyn WorkQueueHooks> = data.clone();
        let queue = WorkQueue::start(name, Arc::new(identity), hooks)?;
        Ok(Self { data, queue })
    }

    fn dump(&self) -> BioQueueDump {
        let merge = self.data.merge.lock();
        BioQueueDump {
            index: self.data.identity.index,
            map_entries: merge.map_len(),
            map_capacity: merge.map_capacity(),
            pending_groups: merge.pending_groups(),
            pending_bios: merge.pending_bios(),
            batches: self.data.batches.load(Ordering::Relaxed),
            work_queue: self.queue.dump(),
        }
    }
}

struct SharedResources {
    device: Arc<dyn BlockDevice>,
    stats: Arc<SubmitterStats>,
    completion: Arc<CompletionPath>,
}

// =============================================================================
// Dump
// =============================================================================

/// Diagnostic view of one bio queue.
#[derive(Debug, Clone, Serialize)]
pub struct BioQueueDump {
    pub index: usize,
    pub map_entries: usize,
    pub map_capacity: usize,
    pub pending_groups: usize,
    pub pending_bios: usize,
    pub batches: u64,
    pub work_queue: WorkQueueDump,
}

/// Diagnostic view of the whole submitter.
#[derive(Debug, Clone, Serialize)]
pub struct SubmitterDump {
    pub bank: Uuid,
    pub device: String,
    pub dumped_at: DateTime<Utc>,
    pub thread_count: usize,
    pub rotation_interval: u32,
    pub shut_down: bool,
    pub queues: Vec<BioQueueDump>,
    pub stats: SubmitterStatsSnapshot,
}

impl fmt::Display for SubmitterDump {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "I/O submitter {} on {} ({} queues, rotation {}) at {}",
            self.bank,
            self.device,
            self.thread_count,
            self.rotation_interval,
            self.dumped_at.to_rfc3339()
        )?;
        for q in &self.queues {
            writeln!(
                f,
                "  {}: pending={} processed={} batches={} map={}/{} groups={} bios={}{}",
                q.work_queue.name,
                q.work_queue.pending,
                q.work_queue.processed,
                q.batches,
                q.map_entries,
                q.map_capacity,
                q.pending_groups,
                q.pending_bios,
                if q.work_queue.stopped { " (stopped)" } else { "" }
            )?;
        }
        write!(f, "{}", self.stats)
    }
}

// =============================================================================
// I/O Submitter
// =============================================================================

/// The bio submission bank.
pub struct IoSubmitter {
    id: Uuid,
    config: SubmitterConfig,
    routing: QueueRouting,
    rotor: BioRotor,
    queues: Vec<BioQueue>,
    device: Arc<dyn BlockDevice>,
    stats: Arc<SubmitterStats>,
    shut_down: AtomicBool,
}

impl IoSubmitter {
    /// Create the bank and start one thread per queue.
    ///
    /// If any queue fails to start, the queues already started are stopped
    /// and released before the error is returned.
    pub fn create(config: SubmitterConfig, device: Arc<dyn BlockDevice>) -> Result<Self> {
        Self::create_with_slot_hook(config, device, |_| Ok(()))
    }

    #[instrument(skip_all, fields(threads = config.thread_count, rotation = config.rotation_interval, device = %device.name()))]
    pub(crate) fn create_with_slot_hook(
        config: SubmitterConfig,
        device: Arc<dyn BlockDevice>,
        mut slot_hook: impl FnMut(usize) -> Result<()>,
    ) -> Result<Self> {
        config.validate()?;
        let routing = QueueRouting::new(config.thread_count, config.rotation_interval)?;
        let id = Uuid::new_v4();

        let stats = Arc::new(SubmitterStats::new());
        let shared = SharedResources {
            device: Arc::clone(&device),
            stats: Arc::clone(&stats),
            completion: Arc::new(CompletionPath::new(Arc::clone(&stats))),
        };

        let mut queues = Vec::new();
        queues
            .try_reserve_exact(routing.queue_count())
            .map_err(|e| Error::AllocationFailed {
                what: "bio queue bank",
                reason: e.to_string(),
            })?;

        for index in 0..routing.queue_count() {
            let identity = BioQueueIdentity { bank: id, index };
            let started = slot_hook(index)
                .and_then(|()| BioQueue::start(identity, &config, routing, &shared));
            match started {
                Ok(queue) => queues.push(queue),
                Err(err) => {
                    error!(queue = index, error = %err, "bio queue failed to start; rolling back");
                    release_queues(&mut queues);
                    return Err(err);
                }
            }
        }

        info!(
            bank = %id,
            queues = queues.len(),
            map_capacity = config.bio_map_capacity(),
            merging = config.use_bio_map,
            raid5 = config.md_raid5_mode,
            "I/O submitter created"
        );
        Ok(Self {
            id,
            config,
            routing,
            rotor: BioRotor::new(),
            queues,
            device,
            stats,
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &SubmitterConfig {
        &self.config
    }

    pub fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.device
    }

    pub fn queue_count(&self) -> usize {
        self.routing.queue_count()
    }

    pub fn rotation_interval(&self) -> u32 {
        self.routing.rotation_interval()
    }

    /// Queue serving `pbn`.
    pub fn queue_for_pbn(&self, pbn: PhysicalBlockNumber) -> usize {
        self.routing.queue_for_pbn(pbn)
    }

    /// Advance the rotor and return the queue it selects.
    pub fn next_rotor_queue(&self) -> usize {
        self.rotor.advance(&self.routing)
    }

    pub fn queue_name(&self, index: usize) -> Option<&str> {
        self.queues.get(index).map(|q| q.data.name.as_str())
    }

    /// Current counters.
    pub fn stats(&self) -> SubmitterStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_shut_down() {
            Err(Error::ShutDown)
        } else {
            Ok(())
        }
    }

    fn queue(&self, index: usize) -> Result<&BioQueue> {
        self.queues
            .get(index)
            .ok_or_else(|| Error::Internal(format!("bio queue {} out of range", index)))
    }

    /// Submit one bio on the queue owning its request's PBN.
    ///
    /// Data bios are offered to the queue's merge map when merging is
    /// enabled; everything else gets its own work item. On error the bio has
    /// not been submitted and its request will not see a completion.
    ///
    /// While merging, a request may have only one group of bios pending on
    /// its queue. A further bio for it that joins no group fails with
    /// [`Error::RequestPending`].
    pub fn submit_bio(&self, mut bio: Bio, action: BioQAction) -> Result<()> {
        self.ensure_running()?;

        if self.config.md_raid5_mode {
            if let Some(sync) = bio.owner().vio_type().raid5_sync_hint() {
                bio.flags_mut().sync = sync;
            }
        }

        let queue = self.queue(self.routing.queue_for_pbn(bio.owner().pbn()))?;
        if !(self.config.use_bio_map && bio.owner().vio_type().is_mergeable()) {
            let data = Arc::clone(&queue.data);
            return queue
                .queue
                .enqueue(WorkItem::new(action, move || data.process_bio(bio)));
        }

        let id = bio.owner().id();
        let outcome = queue
            .data
            .merge
            .lock()
            .try_merge(action, bio)
            .map_err(|refused| {
                warn!(
                    queue = %queue.data.name,
                    request = %refused.id,
                    sector = refused.bio.sector(),
                    "bio refused: request already has a pending group"
                );
                Error::RequestPending(refused.id)
            })?;
        match outcome {
            MergeOutcome::BackMerged(_) => {
                self.stats.record_back_merge();
                Ok(())
            }
            MergeOutcome::FrontMerged(_) => {
                self.stats.record_front_merge();
                Ok(())
            }
            MergeOutcome::Queued { indexed } => {
                if !indexed {
                    self.stats.record_map_insert_failure();
                }
                let data = Arc::clone(&queue.data);
                let scheduled = queue
                    .queue
                    .enqueue(WorkItem::new(action, move || data.process_pending_group(id)));
                if scheduled.is_err() {
                    let orphaned = queue.data.merge.lock().take_group(id);
                    queue.data.fail_group(orphaned, id);
                }
                scheduled
            }
        }
    }

    /// Forward flush bios to the device from the next rotor queue. Each bio
    /// is turned into an empty pre-flush before submission.
    pub fn submit_flush(&self, bios: Vec<Bio>) -> Result<()> {
        self.ensure_running()?;
        let queue = self.queue(self.next_rotor_queue())?;
        let data = Arc::clone(&queue.data);
        queue
            .queue
            .enqueue(WorkItem::new(BioQAction::Flush, move || data.process_flush(bios)))
    }

    /// Run `work` on the next rotor queue.
    pub fn enqueue_work(
        &self,
        action: BioQAction,
        work: impl FnOnce() + Send + 'static,
    ) -> Result<()> {
        self.ensure_running()?;
        self.queue(self.next_rotor_queue())?
            .queue
            .enqueue(WorkItem::new(action, work))
    }

    /// Check that the calling thread is the bio queue serving `pbn` on this
    /// submitter. Fatal in debug builds only.
    pub fn assert_running_in_bio_queue_for_pbn(&self, pbn: PhysicalBlockNumber) {
        let index = self.routing.queue_for_pbn(pbn);
        if let Some(queue) = self.queues.get(index) {
            queue.data.assert_running_in_bio_queue_for_pbn(pbn);
        }
    }

    /// Merge map entries of queue `index`, ordered by sector.
    pub fn map_entries(&self, index: usize) -> Vec<(Sector, RequestId)> {
        self.queues
            .get(index)
            .map(|q| q.data.merge.lock().map_entries())
            .unwrap_or_default()
    }

    /// Sector span of the pending group owned by `id` on queue `index`.
    pub fn pending_group_span(&self, index: usize, id: RequestId) -> Option<(Sector, Sector)> {
        self.queues
            .get(index)
            .and_then(|q| q.data.merge.lock().group_span(id))
    }

    /// Requests whose bios make up the pending group owned by `id`.
    pub fn pending_group_members(&self, index: usize, id: RequestId) -> Vec<RequestId> {
        self.queues
            .get(index)
            .map(|q| q.data.merge.lock().group_members(id))
            .unwrap_or_default()
    }

    /// Snapshot every queue and the counters, and log the result.
    pub fn dump_state(&self) -> SubmitterDump {
        let dump = SubmitterDump {
            bank: self.id,
            device: self.device.name().to_string(),
            dumped_at: Utc::now(),
            thread_count: self.queue_count(),
            rotation_interval: self.rotation_interval(),
            shut_down: self.is_shut_down(),
            queues: self.queues.iter().map(BioQueue::dump).collect(),
            stats: self.stats.snapshot(),
        };
        for q in &dump.queues {
            info!(
                queue = %q.work_queue.name,
                pending = q.work_queue.pending,
                processed = q.work_queue.processed,
                batches = q.batches,
                map_entries = q.map_entries,
                pending_groups = q.pending_groups,
                "bio queue state"
            );
        }
        info!(
            submitted = dump.stats.bios_submitted,
            completed = dump.stats.bios_completed,
            back_merges = dump.stats.back_merges,
            front_merges = dump.stats.front_merges,
            "bio submission state"
        );
        dump
    }

    /// Stop accepting work and drain every queue, last queue first. Calling
    /// this again is a no-op.
    #[instrument(skip(self), fields(bank = %self.id))]
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        for queue in self.queues.iter().rev() {
            queue.queue.finish();
        }
        info!(
            in_progress = self.stats.snapshot().in_progress(),
            "I/O submitter shut down"
        );
    }

    /// Shut down if needed, then free every queue, last queue first.
    pub fn release(mut self) {
        self.shutdown();
        release_queues(&mut self.queues);
        debug!(bank = %self.id, "I/O submitter released");
    }
}

/// Stop, then drop, `queues` in reverse order.
fn release_queues(queues: &mut Vec<BioQueue>) {
    for queue in queues.iter().rev() {
        queue.queue.finish();
    }
    while let Some(queue) = queues.pop() {
        drop(queue);
    }
}

impl Drop for IoSubmitter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for IoSubmitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoSubmitter")
            .field("id", &self.id)
            .field("queues", &self.queues.len())
            .field("rotation_interval", &self.routing.rotation_interval())
            .field("device", &self.device.name())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bio::{BioOp, RequestInfo, VioType, BLOCK_SIZE};
    use crate::device::MemoryDevice;
    use crate::waiter::{ChannelContinuation, Completion};
    use assert_matches::assert_matches;
    use bytes::BytesMut;
    use crossbeam::channel::{self, Receiver, Sender};
    use std::time::Duration;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn config(threads: u32, rotation: u32) -> SubmitterConfig {
        SubmitterConfig {
            thread_name_prefix: "unit".into(),
            thread_count: threads,
            rotation_interval: rotation,
            max_requests_active: 16,
            ..Default::default()
        }
    }

    fn write_bio(pbn: u64, continuation: &Arc<ChannelContinuation>) -> Bio {
        let info = Arc::new(RequestInfo::new(pbn, VioType::Data, continuation.clone()));
        Bio::for_block(info, BioOp::Write, BytesMut::zeroed(BLOCK_SIZE))
    }

    /// Park the single queue until the returned sender fires.
    fn hold_queue(submitter: &IoSubmitter) -> Sender<()> {
        let (tx, rx): (Sender<()>, Receiver<()>) = channel::bounded(0);
        submitter
            .enqueue_work(BioQAction::High, move || {
                let _ = rx.recv();
            })
            .unwrap();
        tx
    }

    fn collect(rx: &Receiver<Completion>, n: usize) -> Vec<Completion> {
        (0..n).map(|_| rx.recv_timeout(TIMEOUT).unwrap()).collect()
    }

    #[test]
    fn test_failed_create_rolls_back() {
        let device: Arc<dyn BlockDevice> = Arc::new(MemoryDevice::new("mem", 1 << 20));
        let result = IoSubmitter::create_with_slot_hook(config(4, 1), Arc::clone(&device), |index| {
            if index == 2 {
                Err(Error::AllocationFailed {
                    what: "bio map",
                    reason: "injected".into(),
                })
            } else {
                Ok(())
            }
        });

        assert_matches!(result, Err(Error::AllocationFailed { what: "bio map", .. }));
        // Every started queue released its device handle.
        assert_eq!(Arc::strong_count(&device), 1);
    }

    #[test]
    fn test_failed_first_slot() {
        let device: Arc<dyn BlockDevice> = Arc::new(MemoryDevice::new("mem", 1 << 20));
        let result = IoSubmitter::create_with_slot_hook(config(2, 1), Arc::clone(&device), |_| {
            Err(Error::Internal("no".into()))
        });
        assert_matches!(result, Err(Error::Internal(_)));
        assert_eq!(Arc::strong_count(&device), 1);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let device: Arc<dyn BlockDevice> = Arc::new(MemoryDevice::new("mem", 1 << 20));
        let result = IoSubmitter::create(config(0, 1), device);
        assert_matches!(result, Err(Error::Config(_)));
    }

    #[test]
    fn test_queue_threads_carry_identity() {
        let device: Arc<dyn BlockDevice> = Arc::new(MemoryDevice::new("mem", 1 << 20));
        let submitter = IoSubmitter::create(config(2, 1), device).unwrap();
        let (tx, rx) = channel::unbounded();
        for _ in 0..2 {
            let tx = tx.clone();
            submitter
                .enqueue_work(BioQAction::Verify, move || {
                    tx.send(current_bio_queue()).unwrap();
                })
                .unwrap();
        }
        let mut seen: Vec<usize> = (0..2)
            .map(|_| rx.recv_timeout(TIMEOUT).unwrap().unwrap().index)
            .collect();
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1]);
        assert!(current_bio_queue().is_none());
        submitter.release();
    }

    #[test]
    fn test_merge_then_process_group() {
        let device = Arc::new(MemoryDevice::new("mem", 1 << 20));
        let submitter = IoSubmitter::create(config(1, 64), device.clone()).unwrap();
        let (continuation, rx) = ChannelContinuation::new();

        let gate = hold_queue(&submitter);
        let first = write_bio(10, &continuation);
        let first_id = first.owner().id();
        submitter.submit_bio(first, BioQAction::Data).unwrap();
        submitter.submit_bio(write_bio(11, &continuation), BioQAction::Data).unwrap();
        submitter.submit_bio(write_bio(9, &continuation), BioQAction::Data).unwrap();

        assert_eq!(submitter.pending_group_span(0, first_id), Some((72, 95)));
        assert_eq!(
            submitter.map_entries(0),
            vec![(72, first_id), (95, first_id)]
        );
        gate.send(()).unwrap();

        let done = collect(&rx, 3);
        assert!(done.iter().all(|c| c.status().is_ok()));
        let sectors: Vec<u64> = device.submissions().iter().map(|r| r.sector).collect();
        assert_eq!(sectors, vec![72, 80, 88]);

        let stats = submitter.stats();
        assert_eq!(stats.back_merges, 1);
        assert_eq!(stats.front_merges, 1);
        assert_eq!(stats.bios_submitted, 3);
        assert!(submitter.map_entries(0).is_empty());
        submitter.release();
    }

    #[test]
    fn test_full_map_counts_insert_failure() {
        let device: Arc<dyn BlockDevice> = Arc::new(MemoryDevice::new("mem", 1 << 20));
        let mut cfg = config(1, 64);
        cfg.max_requests_active = 1;
        let submitter = IoSubmitter::create(cfg, device).unwrap();
        let (continuation, rx) = ChannelContinuation::new();

        let gate = hold_queue(&submitter);
        submitter.submit_bio(write_bio(1, &continuation), BioQAction::Data).unwrap();
        submitter.submit_bio(write_bio(20, &continuation), BioQAction::Data).unwrap();
        gate.send(()).unwrap();

        assert_eq!(collect(&rx, 2).len(), 2);
        assert_eq!(submitter.stats().map_insert_failures, 1);
        submitter.release();
    }

    #[test]
    fn test_submit_after_shutdown() {
        let device: Arc<dyn BlockDevice> = Arc::new(MemoryDevice::new("mem", 1 << 20));
        let submitter = IoSubmitter::create(config(2, 1), device).unwrap();
        let (continuation, _rx) = ChannelContinuation::new();
        submitter.shutdown();
        submitter.shutdown();

        assert_matches!(
            submitter.submit_bio(write_bio(0, &continuation), BioQAction::Data),
            Err(Error::ShutDown)
        );
        assert_matches!(submitter.submit_flush(vec![]), Err(Error::ShutDown));
        assert_matches!(
            submitter.enqueue_work(BioQAction::High, || {}),
            Err(Error::ShutDown)
        );
        assert!(submitter.dump_state().shut_down);
    }

    #[test]
    fn test_dump_state() {
        let device: Arc<dyn BlockDevice> = Arc::new(MemoryDevice::new("mem", 1 << 20));
        let submitter = IoSubmitter::create(config(3, 2), device).unwrap();
        let dump = submitter.dump_state();
        assert_eq!(dump.thread_count, 3);
        assert_eq!(dump.queues.len(), 3);
        assert_eq!(dump.queues[1].work_queue.name, "unit:bioQ1");
        assert_eq!(dump.queues[0].map_capacity, 32);
        assert!(dump.to_string().contains("unit:bioQ2"));
        let json = serde_json::to_value(&dump).unwrap();
        assert_eq!(json["rotation_interval"], 2);
        submitter.release();
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "expected to run on")]
    fn test_wrong_thread_is_fatal_in_debug() {
        let device: Arc<dyn BlockDevice> = Arc::new(MemoryDevice::new("mem", 1 << 20));
        let submitter = IoSubmitter::create(config(1, 1), device).unwrap();
        submitter.assert_running_in_bio_queue_for_pbn(0);
    }

    #[cfg(debug_assertions)]
    #[test]
    fn test_pbn_of_other_queue_is_fatal_in_debug() {
        use std::panic::{self, AssertUnwindSafe};

        let device: Arc<dyn BlockDevice> = Arc::new(MemoryDevice::new("mem", 1 << 20));
        let submitter = IoSubmitter::create(config(2, 1), device).unwrap();
        assert_eq!(submitter.queue_for_pbn(1), 1);

        let queue0 = Arc::clone(&submitter.queues[0].data);
        let (tx, rx) = channel::unbounded();
        submitter.queues[0]
            .queue
            .enqueue(WorkItem::new(BioQAction::High, move || {
                let own = panic::catch_unwind(AssertUnwindSafe(|| {
                    queue0.assert_running_in_bio_queue_for_pbn(0)
                }));
                let other = panic::catch_unwind(AssertUnwindSafe(|| {
                    queue0.assert_running_in_bio_queue_for_pbn(1)
                }));
                let message = other
                    .err()
                    .and_then(|payload| payload.downcast::<String>().ok())
                    .map(|text| *text);
                tx.send((own.is_ok(), message)).unwrap();
            }))
            .unwrap();

        let (own_ok, message) = rx.recv_timeout(TIMEOUT).unwrap();
        assert!(own_ok);
        let message = message.expect("PBN owned by queue 1 must be rejected on queue 0");
        assert!(message.contains("PBN 1 submitted on unit:bioQ0"), "{}", message);
        submitter.release();
    }
}
