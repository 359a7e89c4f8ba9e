//! Envelope submit/fetch/acknowledge shapes.
//!
//! The envelope queue is pure transport: the server routes and retains
//! `content` without ever parsing it. Source fields are optional so a
//! deployment can run in sealed-sender mode without changing the fetch or
//! acknowledge paths.

use serde::{Deserialize, Serialize};

use crate::b64;

/// What kind of ciphertext an envelope carries.
///
/// The type tells the *recipient's* session engine how to treat the
/// content; the server never interprets it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EnvelopeType {
    /// First message of a freshly established session. Carries the
    /// handshake material needed to build the responder-side session.
    PreKeyInit,
    /// Ordinary ratchet message for an existing session.
    Normal,
    /// Group fan-out sender-key message.
    SenderKey,
}

/// One envelope submitted by a sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitEnvelope {
    /// Destination user.
    pub destination_user_id: u64,
    /// Destination device.
    pub destination_device_id: u32,
    /// Ciphertext kind.
    pub envelope_type: EnvelopeType,
    /// Opaque ciphertext.
    #[serde(with = "b64")]
    pub content: Vec<u8>,
}

/// One envelope returned from the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedEnvelope {
    /// Server-assigned id, monotonically increasing in receipt order.
    pub id: u64,
    /// Sending user; absent in sealed-sender deployments.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_user_id: Option<u64>,
    /// Sending device; absent in sealed-sender deployments.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_device_id: Option<u32>,
    /// Ciphertext kind.
    pub envelope_type: EnvelopeType,
    /// Opaque ciphertext.
    #[serde(with = "b64")]
    pub content: Vec<u8>,
    /// Unix seconds at which the server accepted the envelope.
    pub server_timestamp: u64,
}

/// Acknowledgment of processed envelopes.
///
/// Acknowledged ids are deleted server-side. Ids not owned by the calling
/// device are silently ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcknowledgeRequest {
    /// Envelope ids the device has durably processed.
    pub envelope_ids: Vec<u64>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn envelope_type_wire_names() {
        assert_eq!(serde_json::to_string(&EnvelopeType::PreKeyInit).unwrap(), r#""preKeyInit""#);
        assert_eq!(serde_json::to_string(&EnvelopeType::Normal).unwrap(), r#""normal""#);
        assert_eq!(serde_json::to_string(&EnvelopeType::SenderKey).unwrap(), r#""senderKey""#);
    }

    #[test]
    fn queued_envelope_roundtrip() {
        let envelope = QueuedEnvelope {
            id: 9,
            source_user_id: Some(1),
            source_device_id: Some(2),
            envelope_type: EnvelopeType::Normal,
            content: vec![1, 2, 3],
            server_timestamp: 1_700_000_000,
        };
        let json = serde_json::to_string(&envelope).unwrap();
        let back: QueuedEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back, envelope);
    }

    #[test]
    fn sealed_sender_omits_source_fields() {
        let envelope = QueuedEnvelope {
            id: 1,
            source_user_id: None,
            source_device_id: None,
            envelope_type: EnvelopeType::PreKeyInit,
            content: vec![],
            server_timestamp: 0,
        };
        let json = serde_json::to_string(&envelope).unwrap();
        assert!(!json.contains("sourceUserId"));
        assert!(!json.contains("sourceDeviceId"));
    }
}
