//! Envelope transport queue.
//!
//! Pure store-and-forward: envelopes are opaque ciphertext routed by
//! destination address. Submission is all-or-nothing per batch, delivery
//! is oldest-first, and deletion is two-phase: a fetch leaves envelopes
//! queued, and only an acknowledgment from the owning device deletes
//! them, so a crash between fetch and processing redelivers instead of
//! losing messages.

#![allow(clippy::expect_used, reason = "Mutex poisoning should cause a panic")]

use std::sync::{Arc, Mutex};

use cachet_proto::{DeviceAddress, QueuedEnvelope, SubmitEnvelope};
use tracing::debug;

use crate::clock::Clock;
use crate::devices::DeviceRegistry;
use crate::error::ServerError;

/// Default envelope retention: thirty days.
pub const ENVELOPE_TTL_SECS: u64 = 30 * 24 * 60 * 60;

/// Queue behavior knobs.
#[derive(Debug, Clone, Copy)]
pub struct QueueConfig {
    /// Attach the sender's address to fetched envelopes. Disabled for
    /// sealed-sender deployments, where the sender is only inside the
    /// ciphertext.
    pub attach_source: bool,
    /// Seconds an unfetched envelope is retained.
    pub retention_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { attach_source: true, retention_secs: ENVELOPE_TTL_SECS }
    }
}

struct Stored {
    id: u64,
    destination: DeviceAddress,
    source: Option<DeviceAddress>,
    envelope: SubmitEnvelope,
    received_at: u64,
}

/// Thread-safe envelope queue. Clone shares the same underlying state.
#[derive(Clone)]
pub struct EnvelopeQueue {
    devices: DeviceRegistry,
    clock: Arc<dyn Clock>,
    config: QueueConfig,
    inner: Arc<Mutex<Inner>>,
}

struct Inner {
    next_id: u64,
    envelopes: Vec<Stored>,
}

impl EnvelopeQueue {
    /// Create an empty queue.
    pub fn new(devices: DeviceRegistry, clock: Arc<dyn Clock>, config: QueueConfig) -> Self {
        Self {
            devices,
            clock,
            config,
            inner: Arc::new(Mutex::new(Inner { next_id: 1, envelopes: Vec::new() })),
        }
    }

    /// Submit a batch of envelopes.
    ///
    /// The whole batch is validated before anything is enqueued; one bad
    /// envelope rejects all of them, so a multi-device fan-out is never
    /// partially delivered.
    pub fn submit(
        &self,
        sender: DeviceAddress,
        envelopes: Vec<SubmitEnvelope>,
    ) -> Result<(), ServerError> {
        self.devices.require_active(sender)?;
        if envelopes.is_empty() {
            return Err(ServerError::EnvelopeRejected("empty batch".into()));
        }
        for envelope in &envelopes {
            if envelope.content.is_empty() {
                return Err(ServerError::EnvelopeRejected("empty content".into()));
            }
            let destination = DeviceAddress {
                user_id: envelope.destination_user_id,
                device_id: envelope.destination_device_id,
            };
            if !self.devices.is_active(destination) {
                return Err(ServerError::EnvelopeRejected(format!(
                    "unknown destination {destination}"
                )));
            }
        }

        let now = self.clock.now_unix();
        let source = self.config.attach_source.then_some(sender);
        let count = envelopes.len();

        let mut inner = self.inner.lock().expect("EnvelopeQueue mutex poisoned");
        for envelope in envelopes {
            let id = inner.next_id;
            inner.next_id += 1;
            inner.envelopes.push(Stored {
                id,
                destination: DeviceAddress {
                    user_id: envelope.destination_user_id,
                    device_id: envelope.destination_device_id,
                },
                source,
                envelope,
                received_at: now,
            });
        }
        self.devices.touch(sender);
        debug!(%sender, count, "envelope batch accepted");
        Ok(())
    }

    /// Fetch pending envelopes for a device, oldest first.
    ///
    /// The envelopes remain queued until acknowledged, so a crash between
    /// fetch and processing redelivers them on the next cycle.
    pub fn fetch(
        &self,
        address: DeviceAddress,
        limit: u32,
    ) -> Result<Vec<QueuedEnvelope>, ServerError> {
        self.devices.require_active(address)?;
        let now = self.clock.now_unix();
        let inner = self.inner.lock().expect("EnvelopeQueue mutex poisoned");

        let retention = self.config.retention_secs;
        let out: Vec<QueuedEnvelope> = inner
            .envelopes
            .iter()
            .filter(|s| s.destination == address)
            .filter(|s| now < s.received_at.saturating_add(retention))
            .take(limit as usize)
            .map(|stored| QueuedEnvelope {
                id: stored.id,
                source_user_id: stored.source.map(|s| s.user_id),
                source_device_id: stored.source.map(|s| s.device_id),
                envelope_type: stored.envelope.envelope_type,
                content: stored.envelope.content.clone(),
                server_timestamp: stored.received_at,
            })
            .collect();
        drop(inner);
        self.devices.touch(address);
        Ok(out)
    }

    /// Delete acknowledged envelopes.
    ///
    /// Ids not addressed to the calling device are silently ignored; a
    /// device can only delete its own mail.
    pub fn acknowledge(&self, address: DeviceAddress, ids: &[u64]) -> Result<(), ServerError> {
        self.devices.require_active(address)?;
        let mut inner = self.inner.lock().expect("EnvelopeQueue mutex poisoned");
        inner.envelopes.retain(|s| !(s.destination == address && ids.contains(&s.id)));
        Ok(())
    }

    /// Remove envelopes past their retention window. Returns the number
    /// removed.
    pub fn sweep_expired(&self) -> usize {
        let now = self.clock.now_unix();
        let retention = self.config.retention_secs;
        let mut inner = self.inner.lock().expect("EnvelopeQueue mutex poisoned");
        let before = inner.envelopes.len();
        inner.envelopes.retain(|s| now < s.received_at.saturating_add(retention));
        let removed = before - inner.envelopes.len();
        if removed > 0 {
            debug!(removed, "expired envelopes swept");
        }
        removed
    }

    /// Envelopes currently queued for a device, fetched or not.
    pub fn pending_count(&self, address: DeviceAddress) -> usize {
        let inner = self.inner.lock().expect("EnvelopeQueue mutex poisoned");
        inner.envelopes.iter().filter(|s| s.destination == address).count()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use cachet_proto::EnvelopeType;

    use crate::clock::ManualClock;

    use super::*;

    fn setup() -> (Arc<ManualClock>, DeviceRegistry, EnvelopeQueue) {
        let clock = ManualClock::at(1_000);
        let devices = DeviceRegistry::new(clock.clone());
        let queue = EnvelopeQueue::new(devices.clone(), clock.clone(), QueueConfig::default());
        (clock, devices, queue)
    }

    fn envelope_to(address: DeviceAddress, content: &[u8]) -> SubmitEnvelope {
        SubmitEnvelope {
            destination_user_id: address.user_id,
            destination_device_id: address.device_id,
            envelope_type: EnvelopeType::Normal,
            content: content.to_vec(),
        }
    }

    fn register(devices: &DeviceRegistry, user_id: u64) -> DeviceAddress {
        let d = devices.register(user_id, "dev".into());
        DeviceAddress { user_id: d.user_id, device_id: d.device_id }
    }

    #[test]
    fn fetch_is_oldest_first() {
        let (_, devices, queue) = setup();
        let alice = register(&devices, 1);
        let bob = register(&devices, 2);

        queue.submit(alice, vec![envelope_to(bob, b"first")]).unwrap();
        queue.submit(alice, vec![envelope_to(bob, b"second")]).unwrap();

        let fetched = queue.fetch(bob, 10).unwrap();
        assert_eq!(fetched.len(), 2);
        assert_eq!(fetched[0].content, b"first");
        assert!(fetched[0].id < fetched[1].id);
    }

    #[test]
    fn unacknowledged_envelopes_are_refetched() {
        let (_, devices, queue) = setup();
        let alice = register(&devices, 1);
        let bob = register(&devices, 2);
        queue.submit(alice, vec![envelope_to(bob, b"m")]).unwrap();

        assert_eq!(queue.fetch(bob, 10).unwrap().len(), 1);
        // No ack: a second fetch sees the same envelope again.
        assert_eq!(queue.fetch(bob, 10).unwrap().len(), 1);
    }

    #[test]
    fn acknowledge_deletes_only_own_envelopes() {
        let (_, devices, queue) = setup();
        let alice = register(&devices, 1);
        let bob = register(&devices, 2);
        let carol = register(&devices, 3);

        queue.submit(alice, vec![envelope_to(bob, b"for bob")]).unwrap();
        queue.submit(alice, vec![envelope_to(carol, b"for carol")]).unwrap();

        let bobs = queue.fetch(bob, 10).unwrap();
        let carols_id = queue.fetch(carol, 10).unwrap()[0].id;

        // Bob tries to ack carol's envelope along with his own.
        queue.acknowledge(bob, &[bobs[0].id, carols_id]).unwrap();
        assert_eq!(queue.pending_count(bob), 0);
        assert_eq!(queue.pending_count(carol), 1);
    }

    #[test]
    fn batch_is_all_or_nothing() {
        let (_, devices, queue) = setup();
        let alice = register(&devices, 1);
        let bob = register(&devices, 2);
        let ghost = DeviceAddress { user_id: 99, device_id: 1 };

        let result =
            queue.submit(alice, vec![envelope_to(bob, b"ok"), envelope_to(ghost, b"bad")]);
        assert!(matches!(result, Err(ServerError::EnvelopeRejected(_))));
        assert_eq!(queue.pending_count(bob), 0);
    }

    #[test]
    fn empty_content_is_rejected() {
        let (_, devices, queue) = setup();
        let alice = register(&devices, 1);
        let bob = register(&devices, 2);
        let result = queue.submit(alice, vec![envelope_to(bob, b"")]);
        assert!(matches!(result, Err(ServerError::EnvelopeRejected(_))));
    }

    #[test]
    fn expired_envelopes_are_not_delivered_and_get_swept() {
        let (clock, devices, queue) = setup();
        let alice = register(&devices, 1);
        let bob = register(&devices, 2);
        queue.submit(alice, vec![envelope_to(bob, b"old")]).unwrap();

        clock.advance(ENVELOPE_TTL_SECS);
        assert!(queue.fetch(bob, 10).unwrap().is_empty());
        assert_eq!(queue.sweep_expired(), 1);
        assert_eq!(queue.pending_count(bob), 0);
    }

    #[test]
    fn sealed_sender_mode_omits_source() {
        let clock = ManualClock::at(0);
        let devices = DeviceRegistry::new(clock.clone());
        let queue = EnvelopeQueue::new(
            devices.clone(),
            clock,
            QueueConfig { attach_source: false, ..QueueConfig::default() },
        );
        let alice = register(&devices, 1);
        let bob = register(&devices, 2);

        queue.submit(alice, vec![envelope_to(bob, b"anon")]).unwrap();
        let fetched = queue.fetch(bob, 10).unwrap();
        assert_eq!(fetched[0].source_user_id, None);
        assert_eq!(fetched[0].source_device_id, None);
    }

    #[test]
    fn fetch_respects_limit() {
        let (_, devices, queue) = setup();
        let alice = register(&devices, 1);
        let bob = register(&devices, 2);
        for i in 0..5u8 {
            queue.submit(alice, vec![envelope_to(bob, &[i])]).unwrap();
        }
        assert_eq!(queue.fetch(bob, 3).unwrap().len(), 3);
    }
}
