//! Attachment upload/download shapes and the in-envelope pointer.

use serde::{Deserialize, Serialize};

use crate::b64;

/// Response to an upload initiation: a fresh attachment id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiateUploadResponse {
    /// Server-assigned attachment id; chunk uploads reference it.
    pub attachment_id: u64,
}

/// Response to a completed upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteUploadResponse {
    /// The finalized attachment.
    pub attachment_id: u64,
    /// Total ciphertext size of the concatenated blob.
    pub ciphertext_size: u64,
}

/// Everything a recipient needs to fetch and decrypt an attachment.
///
/// This travels only *inside* the encrypted envelope payload. The server
/// stores none of it: no key, no content type, no file name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentPointer {
    /// Attachment id on the server.
    pub attachment_id: u64,
    /// Random 32-byte content key the sender encrypted with.
    #[serde(with = "b64")]
    pub content_key: Vec<u8>,
    /// Stream header binding all chunk nonces to this attachment.
    #[serde(with = "b64")]
    pub stream_header: Vec<u8>,
    /// SHA-256 over the complete ciphertext, verified after download.
    #[serde(with = "b64")]
    pub digest: Vec<u8>,
    /// MIME type of the plaintext.
    pub content_type: String,
    /// Original file name, if the sender chose to share it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    /// Plaintext size in bytes.
    pub plaintext_size: u64,
    /// Ciphertext size in bytes.
    pub ciphertext_size: u64,
    /// Plaintext chunk size the stream cipher used.
    pub chunk_size: u32,
}
