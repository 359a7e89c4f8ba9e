//! The client engine: orchestrates the key store, sessions, vault and
//! transport into the operations an application calls.
//!
//! All mutable state lives behind one async mutex, so every operation sees
//! a consistent key store and session set. Crypto work under the lock is
//! cheap; transport calls await while holding it, which also serializes
//! fetch/acknowledge cycles per device.

use std::sync::Arc;

use cachet_crypto::keys::IdentityKeyPair;
use cachet_crypto::stream::{STREAM_CHUNK_SIZE, StreamSecrets, decrypt_stream, encrypt_stream};
use cachet_crypto::{CryptoError, safety_number};
use cachet_proto::{
    AcknowledgeRequest, AttachmentPointer, DeviceAddress, MessagePayload, RegisterDeviceRequest,
    SubmitEnvelope,
};
use rand::rngs::OsRng;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::ClientError;
use crate::keystore::KeyStore;
use crate::keystore_codec::{decode, encode};
use crate::transport::Transport;
use crate::vault::VaultRecord;
use crate::{identity, session, vault};

/// Envelopes fetched per receive cycle.
const FETCH_LIMIT: u32 = 100;

/// Ciphertext bytes per uploaded chunk: one stream-cipher chunk plus tag.
const UPLOAD_CHUNK_SIZE: usize = STREAM_CHUNK_SIZE + 16;

/// Outcome of sending one logical message.
#[derive(Debug, Clone, Copy)]
pub struct SendOutcome {
    /// Devices the message was fanned out to.
    pub devices: u32,
    /// True when any recipient device presented a changed identity key.
    pub identity_changed: bool,
}

/// One decrypted incoming message.
#[derive(Debug)]
pub struct ReceivedMessage {
    /// Queue id of the envelope, already acknowledged.
    pub envelope_id: u64,
    /// Sending device.
    pub source: DeviceAddress,
    /// Unix seconds the server accepted the envelope.
    pub server_timestamp: u64,
    /// Decrypted payload.
    pub payload: MessagePayload,
    /// True when the sender's identity key changed with this message.
    pub identity_changed: bool,
}

/// One envelope processed by a receive cycle.
#[derive(Debug)]
pub enum Inbound {
    /// A successfully decrypted message.
    Message(ReceivedMessage),
    /// An envelope that could not be decrypted or parsed. It was
    /// acknowledged and dropped; the sender's session was not advanced, so
    /// a correct retransmission will still decrypt.
    Undecryptable {
        /// Queue id of the envelope, already acknowledged.
        envelope_id: u64,
        /// Sending device, when the envelope carried one. Absent under a
        /// sealed-sender queue, whose envelopes this engine cannot route
        /// to a session.
        source: Option<DeviceAddress>,
    },
}

struct Inner {
    store: KeyStore,
    address: Option<DeviceAddress>,
}

impl Inner {
    fn address(&mut self) -> Result<DeviceAddress, ClientError> {
        if let Some(address) = self.address {
            return Ok(address);
        }
        let Some(bytes) = self.store.get("device-address")? else {
            return Err(ClientError::NotSetUp);
        };
        let address = decode(&bytes)?;
        self.address = Some(address);
        Ok(address)
    }

    fn identity(&mut self) -> Result<IdentityKeyPair, ClientError> {
        identity::ensure_identity(&mut self.store, &mut OsRng)
    }
}

/// The top-level client engine.
pub struct Engine {
    transport: Arc<dyn Transport>,
    inner: Mutex<Inner>,
}

impl Engine {
    /// Wrap a key store and a transport into an engine.
    ///
    /// The store may be freshly created or reopened; a reopened store must
    /// be unlocked before any operation succeeds.
    pub fn new(transport: Arc<dyn Transport>, store: KeyStore) -> Self {
        Self { transport, inner: Mutex::new(Inner { store, address: None }) }
    }

    /// Register this device and publish its initial key bundle.
    pub async fn setup_device(
        &self,
        user_id: u64,
        display_name: &str,
    ) -> Result<DeviceAddress, ClientError> {
        let mut inner = self.inner.lock().await;
        let bundle = identity::initial_bundle(&mut inner.store, &mut OsRng)?;

        let device = self
            .transport
            .register_device(
                user_id,
                RegisterDeviceRequest { display_name: display_name.to_string() },
            )
            .await?;
        let address = DeviceAddress { user_id: device.user_id, device_id: device.device_id };

        self.transport.upload_key_bundle(address, bundle).await?;
        inner.store.put(&mut OsRng, "device-address", &encode(&address))?;
        inner.address = Some(address);
        info!(%address, "device set up");
        Ok(address)
    }

    /// Encrypt and send a payload to every active device of a user.
    ///
    /// Sessions are established on demand from fetched bundles. A bundle
    /// with an exhausted one-time prekey pool still establishes, with
    /// slightly weaker deniability for that handshake.
    pub async fn send_message(
        &self,
        recipient_user_id: u64,
        payload: &MessagePayload,
    ) -> Result<SendOutcome, ClientError> {
        let mut inner = self.inner.lock().await;
        let our_address = inner.address()?;
        let our_identity = inner.identity()?;
        let plaintext = payload.to_bytes()?;

        let devices = self.transport.list_devices(recipient_user_id).await?;
        let mut envelopes = Vec::new();
        let mut identity_changed = false;

        for device in devices.into_iter().filter(|d| d.active) {
            let address = DeviceAddress { user_id: device.user_id, device_id: device.device_id };
            if !session::has_session(&mut inner.store, address)? {
                let bundle = self.transport.fetch_key_bundle(address).await?;
                if bundle.one_time_pre_key.is_none() {
                    warn!(%address, "one-time prekey pool exhausted, establishing without");
                }
                identity_changed |= session::establish_outgoing(
                    &mut inner.store,
                    &mut OsRng,
                    &our_identity,
                    &bundle,
                )?;
            }
            let (envelope_type, content) = session::encrypt_outgoing(
                &mut inner.store,
                &mut OsRng,
                &our_identity,
                address,
                &plaintext,
            )?;
            envelopes.push(SubmitEnvelope {
                destination_user_id: address.user_id,
                destination_device_id: address.device_id,
                envelope_type,
                content,
            });
        }

        let count = u32::try_from(envelopes.len()).unwrap_or(u32::MAX);
        if !envelopes.is_empty() {
            self.transport.submit_envelopes(our_address, envelopes).await?;
        }
        debug!(recipient_user_id, devices = count, "message sent");
        Ok(SendOutcome { devices: count, identity_changed })
    }

    /// Fetch, decrypt and acknowledge pending envelopes.
    ///
    /// Failures are isolated per envelope: an undecryptable envelope is
    /// surfaced as [`Inbound::Undecryptable`], acknowledged and dropped so
    /// it cannot jam the queue behind it. Afterwards the one-time prekey
    /// pool is topped up if the server count fell below the replenishment
    /// threshold.
    pub async fn receive_messages(&self) -> Result<Vec<Inbound>, ClientError> {
        let mut inner = self.inner.lock().await;
        let address = inner.address()?;
        let our_identity = inner.identity()?;

        let envelopes = self.transport.fetch_envelopes(address, FETCH_LIMIT).await?;
        let mut received = Vec::new();
        let mut processed = Vec::new();

        for envelope in envelopes {
            let source = match (envelope.source_user_id, envelope.source_device_id) {
                (Some(user_id), Some(device_id)) => DeviceAddress { user_id, device_id },
                _ => {
                    // A sealed-sender queue omits the source; this engine
                    // learns the sender only from it, so such mail cannot
                    // be routed to a session and is surfaced as-is.
                    warn!(id = envelope.id, "envelope without source");
                    received.push(Inbound::Undecryptable { envelope_id: envelope.id, source: None });
                    processed.push(envelope.id);
                    continue;
                }
            };
            match session::decrypt_incoming(
                &mut inner.store,
                &mut OsRng,
                &our_identity,
                address,
                source,
                envelope.envelope_type,
                &envelope.content,
            ) {
                Ok(outcome) => {
                    match MessagePayload::from_bytes(&outcome.plaintext) {
                        Ok(payload) => received.push(Inbound::Message(ReceivedMessage {
                            envelope_id: envelope.id,
                            source,
                            server_timestamp: envelope.server_timestamp,
                            payload,
                            identity_changed: outcome.identity_changed,
                        })),
                        Err(e) => {
                            warn!(id = envelope.id, error = %e, "unparseable payload");
                            received.push(Inbound::Undecryptable {
                                envelope_id: envelope.id,
                                source: Some(source),
                            });
                        }
                    }
                    processed.push(envelope.id);
                }
                Err(ClientError::Locked) => return Err(ClientError::Locked),
                Err(e) => {
                    // Poison envelopes are dropped; the session state was
                    // not advanced, so a correct retransmission will still
                    // decrypt.
                    warn!(id = envelope.id, %source, error = %e, "undecryptable envelope");
                    received.push(Inbound::Undecryptable {
                        envelope_id: envelope.id,
                        source: Some(source),
                    });
                    processed.push(envelope.id);
                }
            }
        }

        if !processed.is_empty() {
            self.transport
                .acknowledge(address, AcknowledgeRequest { envelope_ids: processed })
                .await?;
        }

        self.replenish_if_needed(&mut inner, address).await?;
        Ok(received)
    }

    async fn replenish_if_needed(
        &self,
        inner: &mut Inner,
        address: DeviceAddress,
    ) -> Result<(), ClientError> {
        let count = self.transport.prekey_count(address).await?;
        if count.available < identity::REPLENISH_THRESHOLD {
            let batch = identity::replenish_batch(&mut inner.store, &mut OsRng)?;
            self.transport.replenish_prekeys(address, batch).await?;
            info!(available = count.available, "replenished one-time prekeys");
        }
        Ok(())
    }

    /// Encrypt and upload an attachment, returning the pointer to embed in
    /// a message payload.
    pub async fn upload_attachment(
        &self,
        data: &[u8],
        content_type: &str,
        file_name: Option<String>,
    ) -> Result<AttachmentPointer, ClientError> {
        let inner = &mut *self.inner.lock().await;
        let address = inner.address()?;

        let secrets = StreamSecrets::generate(&mut OsRng);
        let (ciphertext, digest) = encrypt_stream(&secrets, data);

        let initiated = self.transport.initiate_upload(address).await?;
        for (index, chunk) in ciphertext.chunks(UPLOAD_CHUNK_SIZE).enumerate() {
            self.transport
                .upload_chunk(
                    address,
                    initiated.attachment_id,
                    u32::try_from(index).unwrap_or(u32::MAX),
                    chunk.to_vec(),
                )
                .await?;
        }
        let completed = self.transport.complete_upload(address, initiated.attachment_id).await?;
        debug!(attachment_id = completed.attachment_id, size = completed.ciphertext_size, "attachment uploaded");

        Ok(AttachmentPointer {
            attachment_id: completed.attachment_id,
            content_key: secrets.content_key.to_vec(),
            stream_header: secrets.header.to_vec(),
            digest: digest.to_vec(),
            content_type: content_type.to_string(),
            file_name,
            plaintext_size: data.len() as u64,
            ciphertext_size: ciphertext.len() as u64,
            chunk_size: u32::try_from(STREAM_CHUNK_SIZE).unwrap_or(u32::MAX),
        })
    }

    /// Download and decrypt an attachment through its pointer.
    pub async fn download_attachment(
        &self,
        pointer: &AttachmentPointer,
    ) -> Result<Vec<u8>, ClientError> {
        let ciphertext = self.transport.download_attachment(pointer.attachment_id).await?;
        let content_key: [u8; 32] =
            pointer.content_key.as_slice().try_into().map_err(|_| CryptoError::InvalidLength {
                field: "content key",
                expected: 32,
                got: pointer.content_key.len(),
            })?;
        let header: [u8; 16] =
            pointer.stream_header.as_slice().try_into().map_err(|_| {
                CryptoError::InvalidLength {
                    field: "stream header",
                    expected: 16,
                    got: pointer.stream_header.len(),
                }
            })?;
        let secrets = StreamSecrets { content_key, header };
        Ok(decrypt_stream(&secrets, &ciphertext, &pointer.digest)?)
    }

    /// Seal a message into the personal vault for a context.
    pub async fn vault_save(
        &self,
        context_id: u64,
        plaintext: &[u8],
    ) -> Result<VaultRecord, ClientError> {
        let mut inner = self.inner.lock().await;
        vault::save(&mut inner.store, &mut OsRng, context_id, plaintext)
    }

    /// Open a vault record.
    pub async fn vault_load(
        &self,
        context_id: u64,
        record: &VaultRecord,
    ) -> Result<Vec<u8>, ClientError> {
        let mut inner = self.inner.lock().await;
        vault::load(&mut inner.store, context_id, record)
    }

    /// Securely delete one vault record by discarding its snapshot.
    pub async fn vault_delete(&self, context_id: u64, counter: u64) -> Result<bool, ClientError> {
        let mut inner = self.inner.lock().await;
        vault::delete_snapshot(&mut inner.store, context_id, counter)
    }

    /// The 60-digit safety number shared with a peer.
    ///
    /// Requires at least one prior contact, so the peer's identity is
    /// pinned locally.
    pub async fn safety_number_with(&self, peer_user_id: u64) -> Result<String, ClientError> {
        let mut inner = self.inner.lock().await;
        let our_address = inner.address()?;
        let our_identity = inner.identity()?.public();
        let Some(peer_identity) = session::pinned_identity(&mut inner.store, peer_user_id)? else {
            return Err(ClientError::NoSession { address: peer_user_id.to_string() });
        };
        Ok(safety_number(
            &our_identity.to_bytes(),
            our_address.user_id,
            &peer_identity.to_bytes(),
            peer_user_id,
        ))
    }

    /// Unlock the key store.
    pub async fn unlock(&self, passphrase: &str) -> Result<(), ClientError> {
        self.inner.lock().await.store.unlock(passphrase)
    }

    /// Lock the key store immediately.
    pub async fn lock(&self) {
        self.inner.lock().await.store.lock();
    }

    /// Serialize the (sealed) key store for persistence.
    pub async fn export_store(&self) -> Vec<u8> {
        self.inner.lock().await.store.to_bytes()
    }

    /// Destroy all local key material. Used when this device is revoked.
    pub async fn wipe(&self) {
        let mut inner = self.inner.lock().await;
        inner.store.wipe();
        inner.address = None;
        info!("local key material wiped");
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine").finish_non_exhaustive()
    }
}
