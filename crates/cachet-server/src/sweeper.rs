//! Periodic retention sweeping.

use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::attachments::AttachmentStore;
use crate::error::ServerError;
use crate::queue::EnvelopeQueue;

/// What one sweep removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    /// Envelopes past their retention window.
    pub envelopes_removed: usize,
    /// Attachments past their retention window.
    pub attachments_removed: usize,
}

/// Drives expiry for the queue and the attachment store.
#[derive(Clone)]
pub struct Sweeper {
    queue: EnvelopeQueue,
    attachments: AttachmentStore,
}

impl Sweeper {
    /// Build a sweeper over the shared services.
    pub fn new(queue: EnvelopeQueue, attachments: AttachmentStore) -> Self {
        Self { queue, attachments }
    }

    /// Run one sweep immediately.
    pub async fn sweep_once(&self) -> Result<SweepReport, ServerError> {
        let envelopes_removed = self.queue.sweep_expired();
        let attachments_removed = self.attachments.sweep_expired().await?;
        debug!(envelopes_removed, attachments_removed, "retention sweep");
        Ok(SweepReport { envelopes_removed, attachments_removed })
    }

    /// Spawn a background task sweeping at a fixed interval. Abort the
    /// returned handle to stop it.
    pub fn spawn(self, every: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if let Err(e) = self.sweep_once().await {
                    warn!(error = %e, "retention sweep failed");
                }
            }
        })
    }
}
