//! Transport seam between the engine and a server.
//!
//! The engine is transport-agnostic: everything it needs from a server is
//! behind [`Transport`]. Production deployments implement it over their
//! wire protocol; tests and single-process setups use the in-process
//! loopback implementation the server crate provides.

use async_trait::async_trait;
use cachet_proto::{
    AcknowledgeRequest, CompleteUploadResponse, DeviceAddress, DeviceInfo, InitiateUploadResponse,
    KeyBundleResponse, KeyBundleUpload, PreKeyCountResponse, QueuedEnvelope, RegisterDeviceRequest,
    ReplenishRequest, SubmitEnvelope,
};
use thiserror::Error;

/// Errors crossing the transport seam.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The referenced resource does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The caller does not own the referenced resource.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The request conflicts with server state, such as uploading to a
    /// completed attachment.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The server rejected the request as malformed.
    #[error("rejected: {0}")]
    Rejected(String),

    /// The request never reached the server, or the response was lost.
    #[error("network: {0}")]
    Network(String),
}

/// Everything the engine asks of a server.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Register a new device for a user, returning its assigned id.
    async fn register_device(
        &self,
        user_id: u64,
        request: RegisterDeviceRequest,
    ) -> Result<DeviceInfo, TransportError>;

    /// List a user's devices, active and revoked.
    async fn list_devices(&self, user_id: u64) -> Result<Vec<DeviceInfo>, TransportError>;

    /// Publish or replace a device's key bundle.
    async fn upload_key_bundle(
        &self,
        address: DeviceAddress,
        bundle: KeyBundleUpload,
    ) -> Result<(), TransportError>;

    /// Fetch a device's bundle, atomically consuming one one-time prekey
    /// when available.
    async fn fetch_key_bundle(
        &self,
        address: DeviceAddress,
    ) -> Result<KeyBundleResponse, TransportError>;

    /// Append fresh one-time prekeys to a device's pool.
    async fn replenish_prekeys(
        &self,
        address: DeviceAddress,
        request: ReplenishRequest,
    ) -> Result<(), TransportError>;

    /// Count a device's unconsumed one-time prekeys.
    async fn prekey_count(
        &self,
        address: DeviceAddress,
    ) -> Result<PreKeyCountResponse, TransportError>;

    /// Submit a batch of envelopes. All are accepted or none are.
    async fn submit_envelopes(
        &self,
        sender: DeviceAddress,
        envelopes: Vec<SubmitEnvelope>,
    ) -> Result<(), TransportError>;

    /// Fetch pending envelopes for a device, oldest first.
    async fn fetch_envelopes(
        &self,
        address: DeviceAddress,
        limit: u32,
    ) -> Result<Vec<QueuedEnvelope>, TransportError>;

    /// Acknowledge processed envelopes so the server deletes them.
    async fn acknowledge(
        &self,
        address: DeviceAddress,
        request: AcknowledgeRequest,
    ) -> Result<(), TransportError>;

    /// Start an attachment upload.
    async fn initiate_upload(
        &self,
        owner: DeviceAddress,
    ) -> Result<InitiateUploadResponse, TransportError>;

    /// Upload one ciphertext chunk by index. Chunks may arrive in any
    /// order and re-uploading an index overwrites it.
    async fn upload_chunk(
        &self,
        owner: DeviceAddress,
        attachment_id: u64,
        chunk_index: u32,
        data: Vec<u8>,
    ) -> Result<(), TransportError>;

    /// Finalize an upload, assembling the chunks into the stored blob.
    async fn complete_upload(
        &self,
        owner: DeviceAddress,
        attachment_id: u64,
    ) -> Result<CompleteUploadResponse, TransportError>;

    /// Download a complete attachment's ciphertext.
    async fn download_attachment(&self, attachment_id: u64) -> Result<Vec<u8>, TransportError>;
}
