//! Session establishment and per-address ratchet state.
//!
//! Sessions are keyed by the peer's device address and persisted through
//! the key store after every successful operation, never after a failed
//! one. Peer identities are pinned on first contact; a later change is
//! reported to the caller but never blocks decryption, since blocking
//! would turn every reinstall into silent message loss.
//!
//! Until the peer has sent something back, outgoing messages keep carrying
//! the handshake material (`PreKeyInit`), so the session survives the loss
//! of any prefix of the first messages.

use cachet_crypto::keys::{IdentityKeyPair, IdentityPublic};
use cachet_crypto::ratchet::{PreKeyInitMessage, RatchetMessage, SessionState};
use cachet_crypto::{CryptoError, x3dh_initiate, x3dh_respond};
use cachet_proto::{DeviceAddress, EnvelopeType, KeyBundleResponse};
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use x25519_dalek::PublicKey;

use crate::error::ClientError;
use crate::keystore::KeyStore;
use crate::{identity, keystore_codec};

/// Handshake material re-sent with every message until the peer replies.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PendingInit {
    registration_id: u32,
    ephemeral_key: [u8; 32],
    signed_prekey_id: u32,
    one_time_prekey_id: Option<u32>,
    kyber_prekey_id: Option<u32>,
}

/// Result of decrypting an incoming envelope.
#[derive(Debug)]
pub struct DecryptOutcome {
    /// The decrypted payload bytes.
    pub plaintext: Vec<u8>,
    /// True when the sender's pinned identity key changed with this
    /// message. The message is still delivered; surface the change to the
    /// user for re-verification.
    pub identity_changed: bool,
}

fn session_record(address: DeviceAddress) -> String {
    format!("session/{address}")
}

fn pending_record(address: DeviceAddress) -> String {
    format!("pending-init/{address}")
}

fn init_ephemeral_record(address: DeviceAddress) -> String {
    format!("init-ek/{address}")
}

fn pin_record(user_id: u64) -> String {
    format!("peer-identity/{user_id}")
}

/// AAD for ratchet messages: the recipient's address, so a ciphertext
/// cannot be replayed to a different device.
fn message_aad(recipient: DeviceAddress) -> Vec<u8> {
    recipient.to_string().into_bytes()
}

/// Whether a session with the address already exists.
pub fn has_session(store: &mut KeyStore, address: DeviceAddress) -> Result<bool, ClientError> {
    Ok(store.get(&session_record(address))?.is_some())
}

/// The pinned identity key for a user, if any contact has happened.
pub fn pinned_identity(
    store: &mut KeyStore,
    user_id: u64,
) -> Result<Option<IdentityPublic>, ClientError> {
    match store.get(&pin_record(user_id))? {
        Some(bytes) => Ok(Some(IdentityPublic::from_bytes(&bytes)?)),
        None => Ok(None),
    }
}

/// Pin an identity, returning whether this replaced a different one.
fn pin<R: RngCore + CryptoRng>(
    store: &mut KeyStore,
    rng: &mut R,
    user_id: u64,
    identity: &IdentityPublic,
) -> Result<bool, ClientError> {
    let changed = match pinned_identity(store, user_id)? {
        Some(existing) => existing != *identity,
        None => false,
    };
    store.put(rng, &pin_record(user_id), &identity.to_bytes())?;
    Ok(changed)
}

/// Establish an outgoing session from a fetched bundle.
///
/// Fails closed when the signed prekey signature does not verify. Pins the
/// peer identity; an identity change is reported, not blocked.
pub fn establish_outgoing<R: RngCore + CryptoRng>(
    store: &mut KeyStore,
    rng: &mut R,
    our_identity: &IdentityKeyPair,
    bundle: &KeyBundleResponse,
) -> Result<bool, ClientError> {
    let their_identity = IdentityPublic::from_bytes(&bundle.identity_key)?;
    let spk_bytes: [u8; 32] =
        bundle.signed_pre_key.public_key.as_slice().try_into().map_err(|_| {
            CryptoError::InvalidLength {
                field: "signed prekey",
                expected: 32,
                got: bundle.signed_pre_key.public_key.len(),
            }
        })?;
    let their_spk = PublicKey::from(spk_bytes);

    let one_time = match &bundle.one_time_pre_key {
        Some(otk) => {
            let bytes: [u8; 32] = otk.public_key.as_slice().try_into().map_err(|_| {
                CryptoError::InvalidLength {
                    field: "one-time prekey",
                    expected: 32,
                    got: otk.public_key.len(),
                }
            })?;
            Some(PublicKey::from(bytes))
        }
        None => None,
    };

    // A published kyber prekey is mixed into the KDF as an opaque share.
    let kyber_share = bundle.kyber_pre_key.as_ref().map(|k| k.public_key.as_slice());

    let handshake = x3dh_initiate(
        rng,
        our_identity,
        &their_identity,
        &their_spk,
        &bundle.signed_pre_key.signature,
        one_time.as_ref(),
        kyber_share,
    )?;

    let session = SessionState::initiator(rng, handshake.shared_secret, &their_spk);
    let address = DeviceAddress { user_id: bundle.user_id, device_id: bundle.device_id };

    let pending = PendingInit {
        registration_id: identity::registration_id(store)?,
        ephemeral_key: *handshake.ephemeral_public.as_bytes(),
        signed_prekey_id: bundle.signed_pre_key.key_id,
        one_time_prekey_id: bundle.one_time_pre_key.as_ref().map(|k| k.key_id),
        kyber_prekey_id: bundle.kyber_pre_key.as_ref().map(|k| k.key_id),
    };

    let identity_changed = pin(store, rng, bundle.user_id, &their_identity)?;
    store.put(rng, &session_record(address), &session.to_bytes())?;
    store.put(rng, &pending_record(address), &keystore_codec::encode(&pending))?;
    Ok(identity_changed)
}

/// Encrypt a payload for an established session.
///
/// Returns the envelope type and opaque content. While handshake material
/// is still pending, the message is wrapped as a `PreKeyInit`.
pub fn encrypt_outgoing<R: RngCore + CryptoRng>(
    store: &mut KeyStore,
    rng: &mut R,
    our_identity: &IdentityKeyPair,
    address: DeviceAddress,
    plaintext: &[u8],
) -> Result<(EnvelopeType, Vec<u8>), ClientError> {
    let Some(bytes) = store.get(&session_record(address))? else {
        return Err(ClientError::NoSession { address: address.to_string() });
    };
    let session = SessionState::from_bytes(&bytes)?;
    let (next, message) = session.encrypt(rng, plaintext, &message_aad(address))?;
    store.put(rng, &session_record(address), &next.to_bytes())?;

    match store.get(&pending_record(address))? {
        Some(pending_bytes) => {
            let pending: PendingInit = keystore_codec::decode(&pending_bytes)?;
            let init = PreKeyInitMessage {
                registration_id: pending.registration_id,
                identity_key: our_identity.public().to_bytes().to_vec(),
                ephemeral_key: pending.ephemeral_key,
                signed_prekey_id: pending.signed_prekey_id,
                one_time_prekey_id: pending.one_time_prekey_id,
                kyber_prekey_id: pending.kyber_prekey_id,
                message,
            };
            Ok((EnvelopeType::PreKeyInit, init.to_bytes()))
        }
        None => Ok((EnvelopeType::Normal, message.to_bytes())),
    }
}

/// Decrypt an incoming envelope's content.
///
/// State is persisted only after the plaintext is authenticated; a failed
/// decrypt leaves the stored session untouched.
pub fn decrypt_incoming<R: RngCore + CryptoRng>(
    store: &mut KeyStore,
    rng: &mut R,
    our_identity: &IdentityKeyPair,
    our_address: DeviceAddress,
    source: DeviceAddress,
    envelope_type: EnvelopeType,
    content: &[u8],
) -> Result<DecryptOutcome, ClientError> {
    match envelope_type {
        EnvelopeType::PreKeyInit => {
            decrypt_prekey_init(store, rng, our_identity, our_address, source, content)
        }
        EnvelopeType::Normal | EnvelopeType::SenderKey => {
            decrypt_normal(store, rng, our_address, source, content)
        }
    }
}

fn decrypt_prekey_init<R: RngCore + CryptoRng>(
    store: &mut KeyStore,
    rng: &mut R,
    our_identity: &IdentityKeyPair,
    our_address: DeviceAddress,
    source: DeviceAddress,
    content: &[u8],
) -> Result<DecryptOutcome, ClientError> {
    let init = PreKeyInitMessage::from_bytes(content)?;
    let their_identity = IdentityPublic::from_bytes(&init.identity_key)?;

    // A re-sent init for a session we already hold decrypts through the
    // existing state; rebuilding it would reset the ratchet.
    if let Some(bytes) = store.get(&session_record(source))? {
        let session = SessionState::from_bytes(&bytes)?;
        match session.decrypt(rng, &init.message, &message_aad(our_address)) {
            Ok((next, plaintext)) => {
                store.put(rng, &session_record(source), &next.to_bytes())?;
                store.delete(&pending_record(source))?;
                let identity_changed = pin(store, rng, source.user_id, &their_identity)?;
                return Ok(DecryptOutcome { plaintext, identity_changed });
            }
            Err(err) => {
                // Same handshake material as the session we hold: this is
                // a replay or corruption, not a new handshake. Rebuilding
                // the session would re-derive the same secret and accept
                // the replay.
                let known = store.get(&init_ephemeral_record(source))?;
                if known.as_deref() == Some(init.ephemeral_key.as_slice()) {
                    return Err(err.into());
                }
            }
        }
    }

    // Older signed prekeys are retained for a grace period, so an init
    // built against a rotated-out prekey still resolves.
    let Some(bytes) = store.get(&format!("spk/{}", init.signed_prekey_id))? else {
        return Err(ClientError::Storage(format!(
            "signed prekey {} no longer held",
            init.signed_prekey_id
        )));
    };
    let spk: cachet_crypto::keys::SignedPreKeyPair = keystore_codec::decode(&bytes)?;

    let one_time = match init.one_time_prekey_id {
        Some(id) => identity::one_time_prekey(store, id)?,
        None => None,
    };

    if init.kyber_prekey_id.is_some() {
        // No kyber prekeys are published yet, so an init naming one cannot
        // have agreed with anything we hold.
        return Err(CryptoError::Malformed("unknown kyber prekey id".into()).into());
    }

    let shared_secret = x3dh_respond(
        our_identity,
        &spk.pair,
        one_time.as_ref().map(|k| &k.pair),
        &their_identity,
        &PublicKey::from(init.ephemeral_key),
        None,
    );

    let session = SessionState::responder(shared_secret, &spk.pair);
    let (next, plaintext) = session.decrypt(rng, &init.message, &message_aad(our_address))?;

    // Only now is the init known genuine; consuming the one-time prekey
    // any earlier would let a forged init destroy it.
    if let Some(id) = init.one_time_prekey_id {
        identity::discard_one_time_prekey(store, id)?;
    }
    let identity_changed = pin(store, rng, source.user_id, &their_identity)?;
    store.put(rng, &session_record(source), &next.to_bytes())?;
    store.put(rng, &init_ephemeral_record(source), &init.ephemeral_key)?;
    Ok(DecryptOutcome { plaintext, identity_changed })
}

fn decrypt_normal<R: RngCore + CryptoRng>(
    store: &mut KeyStore,
    rng: &mut R,
    our_address: DeviceAddress,
    source: DeviceAddress,
    content: &[u8],
) -> Result<DecryptOutcome, ClientError> {
    let Some(bytes) = store.get(&session_record(source))? else {
        return Err(ClientError::NoSession { address: source.to_string() });
    };
    let session = SessionState::from_bytes(&bytes)?;
    let message = RatchetMessage::from_bytes(content)?;
    let (next, plaintext) = session.decrypt(rng, &message, &message_aad(our_address))?;

    store.put(rng, &session_record(source), &next.to_bytes())?;
    // The peer demonstrably holds the session; stop re-sending handshake
    // material.
    store.delete(&pending_record(source))?;
    Ok(DecryptOutcome { plaintext, identity_changed: false })
}
