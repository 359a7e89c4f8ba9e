//! In-process transport over the server services.
//!
//! Implements the client's [`Transport`] trait directly against the shared
//! service handles, so a client engine and the server run in one process
//! with no wire in between. Integration tests and single-binary demos use
//! this; a networked deployment implements `Transport` over its protocol
//! instead.

use async_trait::async_trait;
use cachet_client::{Transport, TransportError};
use cachet_proto::{
    AcknowledgeRequest, CompleteUploadResponse, DeviceAddress, DeviceInfo, InitiateUploadResponse,
    KeyBundleResponse, KeyBundleUpload, PreKeyCountResponse, QueuedEnvelope, RegisterDeviceRequest,
    ReplenishRequest, SubmitEnvelope,
};

use crate::attachments::AttachmentStore;
use crate::devices::DeviceRegistry;
use crate::directory::KeyDirectory;
use crate::error::ServerError;
use crate::queue::EnvelopeQueue;

/// Transport implementation backed by in-process services.
#[derive(Clone)]
pub struct LoopbackTransport {
    devices: DeviceRegistry,
    directory: KeyDirectory,
    queue: EnvelopeQueue,
    attachments: AttachmentStore,
}

impl LoopbackTransport {
    /// Bundle the shared service handles into a transport.
    pub fn new(
        devices: DeviceRegistry,
        directory: KeyDirectory,
        queue: EnvelopeQueue,
        attachments: AttachmentStore,
    ) -> Self {
        Self { devices, directory, queue, attachments }
    }
}

impl From<ServerError> for TransportError {
    fn from(e: ServerError) -> Self {
        match e {
            ServerError::UnknownDevice(_) | ServerError::BundleMissing(_) => {
                TransportError::NotFound(e.to_string())
            }
            ServerError::AttachmentNotFound(_) => TransportError::NotFound(e.to_string()),
            ServerError::Unauthorized(_) => TransportError::Unauthorized(e.to_string()),
            ServerError::AlreadyComplete(_) => TransportError::Conflict(e.to_string()),
            ServerError::EnvelopeRejected(_) | ServerError::EmptyUpload(_) => {
                TransportError::Rejected(e.to_string())
            }
            ServerError::Io(_) => TransportError::Network(e.to_string()),
        }
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn register_device(
        &self,
        user_id: u64,
        request: RegisterDeviceRequest,
    ) -> Result<DeviceInfo, TransportError> {
        Ok(self.devices.register(user_id, request.display_name))
    }

    async fn list_devices(&self, user_id: u64) -> Result<Vec<DeviceInfo>, TransportError> {
        Ok(self.devices.list(user_id))
    }

    async fn upload_key_bundle(
        &self,
        address: DeviceAddress,
        bundle: KeyBundleUpload,
    ) -> Result<(), TransportError> {
        Ok(self.directory.upload(address, bundle)?)
    }

    async fn fetch_key_bundle(
        &self,
        address: DeviceAddress,
    ) -> Result<KeyBundleResponse, TransportError> {
        Ok(self.directory.fetch(address)?)
    }

    async fn replenish_prekeys(
        &self,
        address: DeviceAddress,
        request: ReplenishRequest,
    ) -> Result<(), TransportError> {
        Ok(self.directory.replenish(address, request)?)
    }

    async fn prekey_count(
        &self,
        address: DeviceAddress,
    ) -> Result<PreKeyCountResponse, TransportError> {
        Ok(PreKeyCountResponse { available: self.directory.count(address)? })
    }

    async fn submit_envelopes(
        &self,
        sender: DeviceAddress,
        envelopes: Vec<SubmitEnvelope>,
    ) -> Result<(), TransportError> {
        Ok(self.queue.submit(sender, envelopes)?)
    }

    async fn fetch_envelopes(
        &self,
        address: DeviceAddress,
        limit: u32,
    ) -> Result<Vec<QueuedEnvelope>, TransportError> {
        Ok(self.queue.fetch(address, limit)?)
    }

    async fn acknowledge(
        &self,
        address: DeviceAddress,
        request: AcknowledgeRequest,
    ) -> Result<(), TransportError> {
        Ok(self.queue.acknowledge(address, &request.envelope_ids)?)
    }

    async fn initiate_upload(
        &self,
        owner: DeviceAddress,
    ) -> Result<InitiateUploadResponse, TransportError> {
        Ok(InitiateUploadResponse { attachment_id: self.attachments.initiate(owner).await? })
    }

    async fn upload_chunk(
        &self,
        owner: DeviceAddress,
        attachment_id: u64,
        chunk_index: u32,
        data: Vec<u8>,
    ) -> Result<(), TransportError> {
        Ok(self.attachments.upload_chunk(owner, attachment_id, chunk_index, data).await?)
    }

    async fn complete_upload(
        &self,
        owner: DeviceAddress,
        attachment_id: u64,
    ) -> Result<CompleteUploadResponse, TransportError> {
        let ciphertext_size = self.attachments.complete(owner, attachment_id).await?;
        Ok(CompleteUploadResponse { attachment_id, ciphertext_size })
    }

    async fn download_attachment(&self, attachment_id: u64) -> Result<Vec<u8>, TransportError> {
        Ok(self.attachments.download(attachment_id).await?)
    }
}
