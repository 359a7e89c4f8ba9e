//! Double ratchet session state and message formats.
//!
//! Every state transition is a pure function: `encrypt` and `decrypt` take
//! the current [`SessionState`] by reference and return the successor state
//! alongside their output. Nothing is mutated on failure, so a message that
//! fails authentication leaves the session exactly where it was and the
//! caller simply drops the returned error.
//!
//! # Security
//!
//! - The header is authenticated as associated data, so a tampered counter
//!   or ratchet key fails the AEAD check rather than desynchronizing state.
//! - Each direction change runs a fresh DH ratchet step, replacing the root
//!   key and both chain seeds.
//! - Message keys for out-of-order delivery are retained in a bounded
//!   window; a replayed counter whose key was already consumed is rejected.

use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

use crate::aead::{XNONCE_LEN, open_xchacha, seal_xchacha};
use crate::chain::{ChainKey, MessageKey};
use crate::error::CryptoError;
use crate::kdf::ratchet_root_step;
use crate::keys::PreKeyPair;

/// Maximum number of skipped message keys retained per session. Oldest
/// entries are evicted first once the window is full.
const MAX_STORED_SKIPPED: usize = 1000;

/// Plaintext ratchet header, authenticated as associated data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatchetHeader {
    /// Sender's current ratchet public key.
    pub dh_public: [u8; 32],
    /// Length of the sender's previous sending chain.
    pub pn: u32,
    /// Counter of this message within the current sending chain.
    pub n: u32,
}

impl RatchetHeader {
    fn to_aad(self) -> Vec<u8> {
        let mut out = Vec::with_capacity(40);
        let Ok(()) = ciborium::into_writer(&self, &mut out) else {
            unreachable!("encoding to a Vec cannot fail");
        };
        out
    }
}

/// An encrypted ratchet message: header, random nonce, ciphertext.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatchetMessage {
    /// Plaintext header.
    pub header: RatchetHeader,
    /// Random XChaCha20-Poly1305 nonce.
    pub nonce: [u8; XNONCE_LEN],
    /// Authenticated ciphertext.
    pub ciphertext: Vec<u8>,
}

impl RatchetMessage {
    /// Encode for transport inside an envelope.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        let Ok(()) = ciborium::into_writer(self, &mut out) else {
            unreachable!("encoding to a Vec cannot fail");
        };
        out
    }

    /// Decode from envelope content.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        ciborium::from_reader(bytes).map_err(|e| CryptoError::Malformed(e.to_string()))
    }
}

/// First message of a session, carrying the X3DH handshake material the
/// responder needs to derive the shared secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreKeyInitMessage {
    /// Sender's registration id.
    pub registration_id: u32,
    /// Sender's 64-byte identity key.
    pub identity_key: Vec<u8>,
    /// Sender's ephemeral X25519 public key.
    pub ephemeral_key: [u8; 32],
    /// Id of the signed prekey the sender used.
    pub signed_prekey_id: u32,
    /// Id of the consumed one-time prekey, when one was available.
    pub one_time_prekey_id: Option<u32>,
    /// Id of the post-quantum prekey, when the bundle carried one.
    pub kyber_prekey_id: Option<u32>,
    /// The first ratchet message of the session.
    pub message: RatchetMessage,
}

impl PreKeyInitMessage {
    /// Encode for transport inside an envelope.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        let Ok(()) = ciborium::into_writer(self, &mut out) else {
            unreachable!("encoding to a Vec cannot fail");
        };
        out
    }

    /// Decode from envelope content.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        ciborium::from_reader(bytes).map_err(|e| CryptoError::Malformed(e.to_string()))
    }
}

/// A message key retained for out-of-order delivery, indexed by the remote
/// ratchet key it belongs to.
#[derive(Clone, Serialize, Deserialize)]
struct SkippedKey {
    dh_public: [u8; 32],
    key: MessageKey,
}

/// Full double ratchet state for one session.
///
/// Serializable so the engine can persist sessions through the key store;
/// secrets inside are zeroized when the state is dropped.
#[derive(Clone, Serialize, Deserialize)]
pub struct SessionState {
    root_key: [u8; 32],
    dh_self: StaticSecret,
    dh_remote: Option<[u8; 32]>,
    chain_send: Option<ChainKey>,
    chain_recv: Option<ChainKey>,
    prev_send_count: u32,
    skipped: Vec<SkippedKey>,
}

impl Drop for SessionState {
    fn drop(&mut self) {
        self.root_key.zeroize();
    }
}

impl std::fmt::Debug for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionState")
            .field("dh_remote", &self.dh_remote.map(|_| ".."))
            .field("send_counter", &self.chain_send.as_ref().map(ChainKey::counter))
            .field("recv_counter", &self.chain_recv.as_ref().map(ChainKey::counter))
            .field("skipped", &self.skipped.len())
            .finish_non_exhaustive()
    }
}

impl SessionState {
    /// Initiator-side session from an X3DH shared secret.
    ///
    /// The recipient's signed prekey serves as its initial ratchet key, so
    /// the initiator can ratchet forward and send immediately.
    pub fn initiator<R: RngCore + CryptoRng>(
        rng: &mut R,
        shared_secret: [u8; 32],
        their_signed_prekey: &PublicKey,
    ) -> Self {
        let mut dh_bytes = [0u8; 32];
        rng.fill_bytes(&mut dh_bytes);
        let dh_self = StaticSecret::from(dh_bytes);

        let dh_out = dh_self.diffie_hellman(their_signed_prekey);
        let (root_key, chain_seed) = ratchet_root_step(&shared_secret, dh_out.as_bytes());

        Self {
            root_key,
            dh_self,
            dh_remote: Some(*their_signed_prekey.as_bytes()),
            chain_send: Some(ChainKey::new(chain_seed)),
            chain_recv: None,
            prev_send_count: 0,
            skipped: Vec::new(),
        }
    }

    /// Responder-side session from an X3DH shared secret.
    ///
    /// The signed prekey the initiator agreed against becomes the initial
    /// ratchet keypair. Chains are established by the first received
    /// message.
    pub fn responder(shared_secret: [u8; 32], signed_prekey: &PreKeyPair) -> Self {
        Self {
            root_key: shared_secret,
            dh_self: signed_prekey.secret.clone(),
            dh_remote: None,
            chain_send: None,
            chain_recv: None,
            prev_send_count: 0,
            skipped: Vec::new(),
        }
    }

    /// Our current ratchet public key.
    pub fn ratchet_public(&self) -> PublicKey {
        PublicKey::from(&self.dh_self)
    }

    /// Encrypt a message, returning the successor state and the wire form.
    ///
    /// `associated_data` binds caller context (such as the recipient's
    /// address) into the AEAD alongside the header.
    pub fn encrypt<R: RngCore + CryptoRng>(
        &self,
        rng: &mut R,
        plaintext: &[u8],
        associated_data: &[u8],
    ) -> Result<(Self, RatchetMessage), CryptoError> {
        let mut next = self.clone();
        let Some(chain) = next.chain_send.as_mut() else {
            return Err(CryptoError::Malformed("session has no sending chain".into()));
        };
        let message_key = chain.advance()?;

        let header = RatchetHeader {
            dh_public: *PublicKey::from(&next.dh_self).as_bytes(),
            pn: next.prev_send_count,
            n: message_key.counter(),
        };

        let mut nonce = [0u8; XNONCE_LEN];
        rng.fill_bytes(&mut nonce);

        let aad = [header.to_aad().as_slice(), associated_data].concat();
        let ciphertext = seal_xchacha(message_key.key(), &nonce, plaintext, &aad);

        Ok((next, RatchetMessage { header, nonce, ciphertext }))
    }

    /// Decrypt a message, returning the successor state and the plaintext.
    ///
    /// On any error the original state is untouched; the caller keeps the
    /// state it passed in and the message is treated as undecryptable.
    pub fn decrypt<R: RngCore + CryptoRng>(
        &self,
        rng: &mut R,
        message: &RatchetMessage,
        associated_data: &[u8],
    ) -> Result<(Self, Vec<u8>), CryptoError> {
        let mut next = self.clone();
        let header = message.header;
        let aad = [header.to_aad().as_slice(), associated_data].concat();

        // A message from an older ratchet key, or an out-of-order message
        // from the current one, may have its key in the skipped window.
        if let Some(pos) = next
            .skipped
            .iter()
            .position(|s| s.dh_public == header.dh_public && s.key.counter() == header.n)
        {
            let skipped = next.skipped.remove(pos);
            let plaintext =
                open_xchacha(skipped.key.key(), &message.nonce, &message.ciphertext, &aad)?;
            return Ok((next, plaintext));
        }

        if next.dh_remote != Some(header.dh_public) {
            next.skip_recv_to(header.pn)?;
            next.dh_ratchet(rng, header.dh_public);
        }

        let Some(chain) = next.chain_recv.as_mut() else {
            unreachable!("dh ratchet always installs a receiving chain");
        };
        if header.n < chain.counter() {
            return Err(CryptoError::Replayed { counter: header.n });
        }
        let (message_key, newly_skipped) = chain.advance_to(header.n)?;
        let plaintext = open_xchacha(message_key.key(), &message.nonce, &message.ciphertext, &aad)?;

        for key in newly_skipped {
            next.store_skipped(header.dh_public, key);
        }
        Ok((next, plaintext))
    }

    /// Skip remaining keys of the current receiving chain before a DH
    /// ratchet step retires it.
    fn skip_recv_to(&mut self, until: u32) -> Result<(), CryptoError> {
        let Some(dh_remote) = self.dh_remote else {
            return Ok(());
        };
        let Some(chain) = self.chain_recv.as_mut() else {
            return Ok(());
        };
        if until < chain.counter() {
            return Ok(());
        }
        let mut pending = Vec::new();
        while chain.counter() < until {
            pending.push(chain.advance()?);
        }
        for key in pending {
            self.store_skipped(dh_remote, key);
        }
        Ok(())
    }

    fn dh_ratchet<R: RngCore + CryptoRng>(&mut self, rng: &mut R, their_public: [u8; 32]) {
        self.prev_send_count = self.chain_send.as_ref().map_or(0, ChainKey::counter);
        self.dh_remote = Some(their_public);
        let remote = PublicKey::from(their_public);

        let dh_out = self.dh_self.diffie_hellman(&remote);
        let (root_key, recv_seed) = ratchet_root_step(&self.root_key, dh_out.as_bytes());
        self.root_key = root_key;
        self.chain_recv = Some(ChainKey::new(recv_seed));

        let mut dh_bytes = [0u8; 32];
        rng.fill_bytes(&mut dh_bytes);
        self.dh_self = StaticSecret::from(dh_bytes);

        let dh_out = self.dh_self.diffie_hellman(&remote);
        let (root_key, send_seed) = ratchet_root_step(&self.root_key, dh_out.as_bytes());
        self.root_key = root_key;
        self.chain_send = Some(ChainKey::new(send_seed));
    }

    fn store_skipped(&mut self, dh_public: [u8; 32], key: MessageKey) {
        if self.skipped.len() == MAX_STORED_SKIPPED {
            self.skipped.remove(0);
        }
        self.skipped.push(SkippedKey { dh_public, key });
    }

    /// Encode for persistence in the local key store.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        let Ok(()) = ciborium::into_writer(self, &mut out) else {
            unreachable!("encoding to a Vec cannot fail");
        };
        out
    }

    /// Decode a persisted session.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        ciborium::from_reader(bytes).map_err(|e| CryptoError::Malformed(e.to_string()))
    }
}
