//! Single-threaded priority work queues
//!
//! Each [`WorkQueue`] owns one named OS thread that runs [`WorkItem`]s in
//! priority order, FIFO within a priority. Around every run of items the
//! queue calls its [`WorkQueueHooks`]: `start` before the first item and
//! `finish` once the queue is drained, which lets a bio queue bracket a burst
//! of submissions in one device batch.
//!
//! ```text
//!   enqueue ──▶ ┌ p2: flush, high ──────┐
//!               ├ p1: metadata, verify ─┤──▶ worker thread
//!               └ p0: data, readcache ──┘    start() ▸ items… ▸ finish() ▸ sleep
//! ```
//!
//! A work item that panics is logged and counted; the thread carries on
//! with the next item.
//!
//! A queue thread may be given private data at start. It is stored in
//! thread-local storage before the first item runs and never changes, so code
//! running on the queue can find out which queue it is on without a lookup.

pub mod action;
pub mod stats;

use std::any::Any;
use std::cell::OnceCell;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, warn};

pub use action::{BioQAction, MAX_PRIORITY, PRIORITY_LEVELS};
pub use stats::{WorkQueueDump, WorkQueueStats};

use crate::error::{Error, Result};

// =============================================================================
// Thread-local queue context
// =============================================================================

struct QueueContext {
    name: Arc<str>,
    private: Arc<dyn Any + Send + Sync>,
}

thread_local! {
    static CONTEXT: OnceCell<QueueContext> = const { OnceCell::new() };
}

/// Run `f` with the current queue thread's private data, if this is a queue
/// thread whose private data has type `T`.
pub fn with_private_data<T: Any, R>(f: impl FnOnce(Option<&T>) -> R) -> R {
    CONTEXT.with(|ctx| f(ctx.get().and_then(|c| (*c.private).downcast_ref::<T>())))
}

/// Name of the queue owning the current thread.
pub fn current_queue_name() -> Option<Arc<str>> {
    CONTEXT.with(|ctx| ctx.get().map(|c| Arc::clone(&c.name)))
}

// =============================================================================
// Hooks and Items
// =============================================================================

/// Callbacks bracketing each run of work items.
pub trait WorkQueueHooks: Send + Sync + 'static {
    /// Called on the queue thread before it starts processing items.
    fn start(&self) {}

    /// Called on the queue thread once no items remain.
    fn finish(&self) {}
}

/// A unit of work for a queue.
pub struct WorkItem {
    action: BioQAction,
    enqueued_at: Instant,
    work: Box<dyn FnOnce() + Send + 'static>,
}

impl WorkItem {
    pub fn new(action: BioQAction, work: impl FnOnce() + Send + 'static) -> Self {
        Self {
            action,
            enqueued_at: Instant::now(),
            work: Box::new(work),
        }
    }

    pub fn action(&self) -> BioQAction {
        self.action
    }
}

impl std::fmt::Debug for WorkItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkItem")
            .field("action", &self.action)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Queue
// =============================================================================

#[derive(Default)]
struct QueueState {
    lanes: [VecDeque<WorkItem>; PRIORITY_LEVELS],
    stopping: bool,
    idle: bool,
}

impl QueueState {
    fn pending(&self) -> usize {
        self.lanes.iter().map(VecDeque::len).sum()
    }

    fn pop(&mut self) -> Option<WorkItem> {
        self.lanes.iter_mut().rev().find_map(VecDeque::pop_front)
    }
}

struct QueueShared {
    name: String,
    state: Mutex<QueueState>,
    wakeup: Condvar,
    stats: WorkQueueStats,
}

impl QueueShared {
    fn pop(&self) -> Option<WorkItem> {
        self.state.lock().pop()
    }
}

/// A work queue and its thread.
pub struct WorkQueue {
    shared: Arc<QueueShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl WorkQueue {
    /// Spawn the queue thread.
    pub fn start(
        name: impl Into<String>,
        private_data: Arc<dyn Any + Send + Sync>,
        hooks: Arc<dyn WorkQueueHooks>,
    ) -> Result<Self> {
        let name = name.into();
        let shared = Arc::new(QueueShared {
            name: name.clone(),
            state: Mutex::new(QueueState::default()),
            wakeup: Condvar::new(),
            stats: WorkQueueStats::default(),
        });

        let thread_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                CONTEXT.with(|ctx| {
                    let _ = ctx.set(QueueContext {
                        name: Arc::from(thread_shared.name.as_str()),
                        private: private_data,
                    });
                });
                run_queue(&thread_shared, hooks.as_ref());
            })
            .map_err(|source| Error::QueueStart {
                queue: name.clone(),
                source,
            })?;

        debug!(queue = %name, "work queue started");
        Ok(Self {
            shared,
            thread: Mutex::new(Some(handle)),
        })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Queue an item. Fails once [`WorkQueue::finish`] has been called.
    pub fn enqueue(&self, item: WorkItem) -> Result<()> {
        let mut state = self.shared.state.lock();
        if state.stopping {
            return Err(Error::QueueStopped(self.shared.name.clone()));
        }
        state.lanes[item.action.priority()].push_back(item);
        let pending = state.pending();
        drop(state);

        self.shared.stats.record_enqueued(pending);
        self.shared.wakeup.notify_one();
        Ok(())
    }

    /// Items waiting to run.
    pub fn pending(&self) -> usize {
        self.shared.state.lock().pending()
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.state.lock().stopping
    }

    pub fn stats(&self) -> &WorkQueueStats {
        &self.shared.stats
    }

    /// Stop accepting work, let the thread run every queued item, then join
    /// it. Calling this again is a no-op.
    pub fn finish(&self) {
        self.shared.state.lock().stopping = true;
        self.shared.wakeup.notify_all();

        let Some(handle) = self.thread.lock().take() else {
            return;
        };
        if handle.thread().id() == thread::current().id() {
            warn!(queue = %self.shared.name, "work queue finished from its own thread; not joining");
            return;
        }
        if handle.join().is_err() {
            error!(queue = %self.shared.name, "work queue thread panicked");
        }
        debug!(queue = %self.shared.name, "work queue stopped");
    }

    /// Diagnostic snapshot.
    pub fn dump(&self) -> WorkQueueDump {
        let (pending, idle, stopped) = {
            let state = self.shared.state.lock();
            (state.pending(), state.idle, state.stopping)
        };
        let stats = &self.shared.stats;
        WorkQueueDump {
            name: self.shared.name.clone(),
            pending,
            max_pending: stats.max_pending(),
            enqueued: stats.enqueued(),
            processed: stats.processed(),
            processed_by_action: stats.processed_by_action(),
            batches: stats.batches(),
            panics: stats.panics(),
            avg_queue_time_us: stats.avg_queue_time().as_micros() as u64,
            max_queue_time_us: stats.max_queue_time().as_micros() as u64,
            idle,
            stopped,
        }
    }
}

impl Drop for WorkQueue {
    fn drop(&mut self) {
        self.finish();
    }
}

impl std::fmt::Debug for WorkQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkQueue")
            .field("name", &self.shared.name)
            .field("pending", &self.pending())
            .finish()
    }
}

fn run_queue(shared: &QueueShared, hooks: &dyn WorkQueueHooks) {
    while wait_for_work(shared) {
        hooks.start();
        shared.stats.record_batch();
        while let Some(item) = shared.pop() {
            let action = item.action;
            shared.stats.record_processed(action, item.enqueued_at.elapsed());
            if panic::catch_unwind(AssertUnwindSafe(item.work)).is_err() {
                shared.stats.record_panic();
                error!(queue = %shared.name, action = %action, "work item panicked");
            }
        }
        hooks.finish();
    }
}

/// Sleep until an item is queued. Returns false once the queue is stopping
/// and nothing is left to run.
fn wait_for_work(shared: &QueueShared) -> bool {
    let mut state = shared.state.lock();
    state.idle = true;
    while state.pending() == 0 && !state.stopping {
        shared.wakeup.wait(&mut state);
    }
    state.idle = false;
    state.pending() > 0
}

// =============================================================================
// Tests
// =============================================================================
