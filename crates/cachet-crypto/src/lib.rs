//! Cachet cryptographic primitives.
//!
//! Building blocks for the E2EE engine: key types, the X3DH handshake, the
//! double ratchet, the symmetric chain ratchet both ratchets share, AEAD
//! helpers, the chunked attachment stream cipher, the safety-number
//! fingerprint and the passphrase KDF. Pure functions and value types with
//! no I/O; callers provide the RNG so tests can be deterministic.
//!
//! # Key Lifecycle
//!
//! ```text
//! X3DH (identity + signed prekey + one-time prekey [+ kyber share])
//!        │
//!        ▼
//! Root Key ── DH ratchet ──► Chain Keys (per direction)
//!        │
//!        ▼
//! Chain Ratchet ──► Message Keys (single use)
//!        │
//!        ▼
//! XChaCha20-Poly1305 ──► Ciphertext
//! ```
//!
//! # Security
//!
//! - Forward secrecy: chain keys are zeroized when advanced; message keys
//!   are zeroized after a single use.
//! - Post-compromise security: every direction change performs a fresh DH
//!   ratchet step, replacing the root key.
//! - Authenticity: signed prekeys are verified against the identity key
//!   before any agreement runs; AEAD authenticates headers and addresses
//!   through associated data.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod aead;
pub mod agreement;
pub mod chain;
pub mod error;
pub mod fingerprint;
pub mod kdf;
pub mod keys;
pub mod ratchet;
pub mod stream;

pub use aead::{open, open_xchacha, seal, seal_xchacha};
pub use agreement::{InitiatorHandshake, x3dh_initiate, x3dh_respond};
pub use chain::{ChainKey, MAX_SKIP, MessageKey};
pub use error::CryptoError;
pub use fingerprint::safety_number;
pub use kdf::{KdfParams, derive_master_key};
pub use keys::{
    IdentityKeyPair, IdentityPublic, OneTimePreKeyPair, PreKeyPair, SignedPreKeyPair,
};
pub use ratchet::{PreKeyInitMessage, RatchetHeader, RatchetMessage, SessionState};
pub use stream::{
    STREAM_CHUNK_SIZE, STREAM_HEADER_LEN, StreamSecrets, decrypt_stream, encrypt_stream,
};
