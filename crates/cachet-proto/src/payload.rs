//! The plaintext payload carried inside an encrypted envelope.
//!
//! After the recipient's ratchet decrypts an envelope, the resulting bytes
//! decode to a [`MessagePayload`]. The server never sees this structure.

use serde::{Deserialize, Serialize};

use crate::attachment::AttachmentPointer;

/// Decrypted message content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
    /// Conversation this message belongs to.
    pub chat_id: u64,
    /// Text body, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Attachment pointer, if the message carries a file.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachment: Option<AttachmentPointer>,
}

impl MessagePayload {
    /// Text-only payload.
    pub fn text(chat_id: u64, text: impl Into<String>) -> Self {
        Self { chat_id, text: Some(text.into()), attachment: None }
    }

    /// Attachment payload with optional caption.
    pub fn attachment(chat_id: u64, pointer: AttachmentPointer, caption: Option<String>) -> Self {
        Self { chat_id, text: caption, attachment: Some(pointer) }
    }

    /// Encode for encryption.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Decode a decrypted payload.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
