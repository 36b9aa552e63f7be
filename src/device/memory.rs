//! In-memory block device
//!
//! A sparse sector store for tests and the workload driver. Every submitted
//! bio is logged with the thread that submitted it, so callers can check
//! routing and merge order after the fact. Completions run inline on the
//! submitting thread unless an asynchronous completion thread is requested,
//! which models a real device completing from interrupt context.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Sender};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error};

use super::{BlockDevice, DeviceError, IoStatus, SubmittedBio};
use crate::bio::{Bio, BioFlags, BioOp, RequestId, Sector, SECTOR_SIZE};
use crate::error::{Error, Result};

type SectorData = [u8; SECTOR_SIZE];

/// One bio as the device saw it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubmissionRecord {
    pub request: RequestId,
    pub sector: Sector,
    pub sectors: u32,
    pub op: BioOp,
    pub flags: BioFlags,
    /// Name of the submitting thread
    pub thread: Option<String>,
}

struct Completer {
    tx: Option<Sender<(SubmittedBio, IoStatus)>>,
    thread: Option<JoinHandle<()>>,
}

/// Sparse in-memory device.
pub struct MemoryDevice {
    name: String,
    capacity: Sector,
    store: Mutex<HashMap<Sector, SectorData>>,
    log: Mutex<Vec<SubmissionRecord>>,
    failures: Mutex<HashSet<Sector>>,
    batches_begun: AtomicU64,
    batches_ended: AtomicU64,
    flushes: AtomicU64,
    completer: Option<Completer>,
}

impl MemoryDevice {
    /// Create a device of `capacity` sectors that completes bios inline.
    pub fn new(name: impl Into<String>, capacity: Sector) -> Self {
        Self {
            name: name.into(),
            capacity,
            store: Mutex::new(HashMap::new()),
            log: Mutex::new(Vec::new()),
            failures: Mutex::new(HashSet::new()),
            batches_begun: AtomicU64::new(0),
            batches_ended: AtomicU64::new(0),
            flushes: AtomicU64::new(0),
            completer: None,
        }
    }

    /// Complete bios from a dedicated thread instead of inline.
    pub fn with_async_completion(mut self) -> Result<Self> {
        let (tx, rx) = channel::unbounded::<(SubmittedBio, IoStatus)>();
        let thread_name = format!("{}:completion", self.name);
        let handle = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                for (bio, status) in rx {
                    bio.complete(status);
                }
            })
            .map_err(|source| Error::QueueStart {
                queue: thread_name,
                source,
            })?;
        self.completer = Some(Completer {
            tx: Some(tx),
            thread: Some(handle),
        });
        Ok(self)
    }

    pub fn capacity(&self) -> Sector {
        self.capacity
    }

    /// Fail every bio that covers `sector`.
    pub fn inject_failure(&self, sector: Sector) {
        self.failures.lock().insert(sector);
    }

    pub fn clear_failures(&self) {
        self.failures.lock().clear();
    }

    /// Every bio submitted so far, in submission order.
    pub fn submissions(&self) -> Vec<SubmissionRecord> {
        self.log.lock().clone()
    }

    /// Stored contents of `count` sectors; unwritten sectors read as zero.
    pub fn read_sectors(&self, sector: Sector, count: u64) -> Vec<u8> {
        let store = self.store.lock();
        let mut out = Vec::with_capacity(count as usize * SECTOR_SIZE);
        for s in sector..sector + count {
            match store.get(&s) {
                Some(data) => out.extend_from_slice(data),
                None => out.extend_from_slice(&[0; SECTOR_SIZE]),
            }
        }
        out
    }

    /// (batches begun, batches ended)
    pub fn batches(&self) -> (u64, u64) {
        (
            self.batches_begun.load(Ordering::SeqCst),
            self.batches_ended.load(Ordering::SeqCst),
        )
    }

    /// Flushes and pre-flushes seen.
    pub fn flushes(&self) -> u64 {
        self.flushes.load(Ordering::SeqCst)
    }

    fn check_range(&self, bio: &Bio) -> IoStatus {
        let end = bio.sector().checked_add(u64::from(bio.sectors()));
        match end {
            Some(end) if end <= self.capacity => Ok(()),
            _ => Err(DeviceError::OutOfRange {
                sector: bio.sector(),
                sectors: bio.sectors(),
                capacity: self.capacity,
            }),
        }
    }

    fn execute(&self, bio: &mut Bio) -> IoStatus {
        {
            let failures = self.failures.lock();
            let span = bio.sector()..bio.sector() + u64::from(bio.sectors());
            if let Some(sector) = failures.iter().find(|s| span.contains(s)) {
                return Err(DeviceError::Injected(*sector));
            }
        }

        if bio.op() == BioOp::Flush || bio.flags().preflush {
            self.flushes.fetch_add(1, Ordering::SeqCst);
        }
        if bio.op() == BioOp::Flush {
            return Ok(());
        }
        self.check_range(bio)?;

        let first = bio.sector();
        let mut store = self.store.lock();
        match bio.op() {
            BioOp::Read => {
                for (i, chunk) in bio.data_mut().chunks_exact_mut(SECTOR_SIZE).enumerate() {
                    match store.get(&(first + i as u64)) {
                        Some(data) => chunk.copy_from_slice(data),
                        None => chunk.fill(0),
                    }
                }
            }
            BioOp::Write => {
                for (i, chunk) in bio.data().chunks_exact(SECTOR_SIZE).enumerate() {
                    let mut data = [0; SECTOR_SIZE];
                    data.copy_from_slice(chunk);
                    store.insert(first + i as u64, data);
                }
            }
            BioOp::Discard => {
                for s in first..first + u64::from(bio.sectors()) {
                    store.remove(&s);
                }
            }
            BioOp::Flush => {}
        }
        Ok(())
    }
}

impl BlockDevice for MemoryDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn submit(&self, mut bio: SubmittedBio) {
        self.log.lock().push(SubmissionRecord {
            request: bio.bio().owner().id(),
            sector: bio.bio().sector(),
            sectors: bio.bio().sectors(),
            op: bio.bio().op(),
            flags: bio.bio().flags(),
            thread: thread::current().name().map(str::to_string),
        });

        let status = self.execute(bio.bio_mut());
        match self.completer.as_ref().and_then(|c| c.tx.as_ref()) {
            Some(tx) => {
                if let Err(err) = tx.send((bio, status)) {
                    let (bio, status) = err.into_inner();
                    error!(device = %self.name, "completion thread gone; completing inline");
                    bio.complete(status);
                }
            }
            None => bio.complete(status),
        }
    }

    fn begin_batch(&self) {
        self.batches_begun.fetch_add(1, Ordering::SeqCst);
    }

    fn end_batch(&self) {
        self.batches_ended.fetch_add(1, Ordering::SeqCst);
    }
}

impl Drop for MemoryDevice {
    fn drop(&mut self) {
        if let Some(completer) = self.completer.as_mut() {
            completer.tx.take();
            if let Some(handle) = completer.thread.take() {
                if handle.join().is_err() {
                    error!(device = %self.name, "completion thread panicked");
                }
            }
            debug!(device = %self.name, "completion thread stopped");
        }
    }
}

impl std::fmt::Debug for MemoryDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryDevice")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("async_completion", &self.completer.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bio::{RequestInfo, VioType, BLOCK_SIZE};
    use crate::stats::SubmitterStats;
    use crate::submitter::completion::CompletionPath;
    use crate::waiter::{ChannelContinuation, Completion};
    use bytes::BytesMut;
    use std::sync::Arc;
    use std::time::Duration;

    fn submit(device: &MemoryDevice, op: BioOp, pbn: u64, data: BytesMut) -> Completion {
        let (continuation, rx) = ChannelContinuation::new();
        let info = Arc::new(RequestInfo::new(pbn, VioType::Data, continuation));
        let bio = Bio::for_block(info, op, data);
        let path = Arc::new(CompletionPath::new(Arc::new(SubmitterStats::new())));
        device.submit(SubmittedBio::new(bio, path));
        rx.recv_timeout(Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_write_then_read() {
        let device = MemoryDevice::new("mem0", 1024);
        let mut payload = BytesMut::zeroed(BLOCK_SIZE);
        payload[0] = 0xAB;
        payload[BLOCK_SIZE - 1] = 0xCD;

        let done = submit(&device, BioOp::Write, 2, payload);
        assert!(done.status().is_ok());

        let done = submit(&device, BioOp::Read, 2, BytesMut::zeroed(BLOCK_SIZE));
        assert!(done.is_acknowledged());
        let data = done.into_bio().into_data();
        assert_eq!(data[0], 0xAB);
        assert_eq!(data[BLOCK_SIZE - 1], 0xCD);
        assert_eq!(device.read_sectors(16, 1)[0], 0xAB);
    }

    #[test]
    fn test_discard_zeroes() {
        let device = MemoryDevice::new("mem0", 1024);
        submit(&device, BioOp::Write, 1, BytesMut::from(&[7u8; BLOCK_SIZE][..]));
        submit(&device, BioOp::Discard, 1, BytesMut::zeroed(BLOCK_SIZE));
        assert!(device.read_sectors(8, 8).iter().all(|b| *b == 0));
    }

    #[test]
    fn test_out_of_range() {
        let device = MemoryDevice::new("mem0", 16);
        let done = submit(&device, BioOp::Write, 2, BytesMut::zeroed(BLOCK_SIZE));
        assert_eq!(
            done.status(),
            Err(DeviceError::OutOfRange {
                sector: 16,
                sectors: 8,
                capacity: 16
            })
        );
    }

    #[test]
    fn test_injected_failure() {
        let device = MemoryDevice::new("mem0", 1024);
        device.inject_failure(21);
        let done = submit(&device, BioOp::Write, 2, BytesMut::zeroed(BLOCK_SIZE));
        assert_eq!(done.status(), Err(DeviceError::Injected(21)));

        device.clear_failures();
        let done = submit(&device, BioOp::Write, 2, BytesMut::zeroed(BLOCK_SIZE));
        assert!(done.status().is_ok());
    }

    #[test]
    fn test_async_completion_runs_on_completion_thread() {
        let device = MemoryDevice::new("mem1", 1024)
            .with_async_completion()
            .unwrap();
        let (continuation, rx) = ChannelContinuation::new();
        let info = Arc::new(RequestInfo::new(0, VioType::Data, continuation));
        let bio = Bio::for_block(info, BioOp::Write, BytesMut::zeroed(BLOCK_SIZE)).with_flags(
            BioFlags {
                preflush: true,
                ..Default::default()
            },
        );
        let path = Arc::new(CompletionPath::new(Arc::new(SubmitterStats::new())));
        device.submit(SubmittedBio::new(bio, path));

        let done = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(done.status().is_ok());
        assert_eq!(done.thread().as_deref(), Some("mem1:completion"));
        assert_eq!(device.flushes(), 1);

        let log = device.submissions();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].sector, 0);
        assert!(log[0].flags.preflush);
    }
}
