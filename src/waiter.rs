//! Continuation adapters
//!
//! Turn [`RequestContinuation`] callbacks into values a caller can wait on:
//! [`ChannelContinuation`] feeds a crossbeam channel (one receiver can collect
//! completions for many requests), [`CompletionWaiter`] resolves a tokio
//! oneshot for a single request.

use std::sync::Arc;
use std::thread;

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::trace;

use crate::bio::{Bio, RequestContinuation, RequestId};
use crate::device::IoStatus;

/// A finished bio as delivered to its request.
#[derive(Debug)]
pub struct Completion {
    bio: Bio,
    status: IoStatus,
    acknowledged: bool,
    thread: Option<String>,
}

impl Completion {
    fn new(bio: Bio, status: IoStatus, acknowledged: bool) -> Self {
        Self {
            bio,
            status,
            acknowledged,
            thread: thread::current().name().map(str::to_string),
        }
    }

    pub fn request(&self) -> RequestId {
        self.bio.owner().id()
    }

    pub fn bio(&self) -> &Bio {
        &self.bio
    }

    pub fn into_bio(self) -> Bio {
        self.bio
    }

    pub fn status(&self) -> IoStatus {
        self.status.clone()
    }

    /// True if the read took the fast acknowledgement path.
    pub fn is_acknowledged(&self) -> bool {
        self.acknowledged
    }

    /// Thread the completion ran on.
    pub fn thread(&self) -> Option<&str> {
        self.thread.as_deref()
    }
}

/// Sends every completion down a channel.
#[derive(Debug, Clone)]
pub struct ChannelContinuation {
    tx: Sender<Completion>,
}

impl ChannelContinuation {
    pub fn new() -> (Arc<Self>, Receiver<Completion>) {
        let (tx, rx) = channel::unbounded();
        (Arc::new(Self { tx }), rx)
    }

    fn deliver(&self, completion: Completion) {
        if let Err(err) = self.tx.send(completion) {
            trace!(request = %err.into_inner().request(), "completion receiver dropped");
        }
    }
}

impl RequestContinuation for ChannelContinuation {
    fn acknowledge_read(&self, bio: Bio) {
        self.deliver(Completion::new(bio, Ok(()), true));
    }

    fn continue_request(&self, bio: Bio, result: IoStatus) {
        self.deliver(Completion::new(bio, result, false));
    }
}

/// Resolves a oneshot with the first completion it sees.
#[derive(Debug)]
pub struct CompletionWaiter {
    tx: Mutex<Option<oneshot::Sender<Completion>>>,
}

impl CompletionWaiter {
    pub fn new() -> (Arc<Self>, oneshot::Receiver<Completion>) {
        let (tx, rx) = oneshot::channel();
        (
            Arc::new(Self {
                tx: Mutex::new(Some(tx)),
            }),
            rx,
        )
    }

    fn deliver(&self, completion: Completion) {
        match self.tx.lock().take() {
            Some(tx) => {
                let _ = tx.send(completion);
            }
            None => trace!(request = %completion.request(), "waiter already resolved"),
        }
    }
}

impl RequestContinuation for CompletionWaiter {
    fn acknowledge_read(&self, bio: Bio) {
        self.deliver(Completion::new(bio, Ok(()), true));
    }

    fn continue_request(&self, bio: Bio, result: IoStatus) {
        self.deliver(Completion::new(bio, result, false));
    }
}
