//! Completion path.
//!
//! Every bio the device finishes comes back through
//! [`CompletionPath::on_device_completion`], on whatever thread the device
//! completes on. Successful reads of plain whole-block data are acknowledged
//! straight to the request; everything else goes to the request's generic
//! continuation with the device status untouched.

use std::sync::Arc;

use tracing::trace;

use crate::bio::{Bio, BioOp};
use crate::device::IoStatus;
use crate::stats::SubmitterStats;

#[derive(Debug)]
pub struct CompletionPath {
    stats: Arc<SubmitterStats>,
}

impl CompletionPath {
    pub fn new(stats: Arc<SubmitterStats>) -> Self {
        Self { stats }
    }

    pub fn on_device_completion(&self, bio: Bio, status: IoStatus) {
        self.stats.record_completed(&bio);

        let owner = Arc::clone(bio.owner());
        if status.is_ok() && takes_fast_ack(&bio) {
            trace!(request = %owner.id(), sector = bio.sector(), "read acknowledged");
            owner.continuation().acknowledge_read(bio);
        } else {
            trace!(request = %owner.id(), sector = bio.sector(), ok = status.is_ok(), "bio completed");
            owner.continuation().continue_request(bio, status);
        }
    }
}

fn takes_fast_ack(bio: &Bio) -> bool {
    let owner = bio.owner();
    let state = owner.data_state();
    bio.op() == BioOp::Read && owner.is_data() && !state.compressed && !state.partial
}
