//! Error types for cryptographic operations.

use thiserror::Error;

/// Errors from the cryptographic layer.
///
/// `DecryptionFailed` deliberately carries no detail about *why*
/// authentication failed; tampered ciphertext and a wrong key are
/// indistinguishable to avoid oracle behavior.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// A signed prekey's signature does not verify against the identity
    /// key. Fail closed: the bundle must be rejected.
    #[error("invalid prekey signature")]
    InvalidSignature,

    /// AEAD authentication failed: tampered ciphertext or wrong key.
    #[error("decryption failed")]
    DecryptionFailed,

    /// A key or nonce field had the wrong length.
    #[error("invalid {field} length: expected {expected}, got {got}")]
    InvalidLength {
        /// Which field was malformed.
        field: &'static str,
        /// Expected byte length.
        expected: usize,
        /// Actual byte length.
        got: usize,
    },

    /// The chain ratchet was asked to skip too far ahead, or to step
    /// backwards to an already-consumed counter.
    #[error("chain counter out of range: at {current}, requested {requested}")]
    CounterOutOfRange {
        /// Current chain position.
        current: u32,
        /// Requested position.
        requested: u32,
    },

    /// The chain counter reached its maximum; the session must be
    /// re-established.
    #[error("chain counter overflow at {current}")]
    CounterOverflow {
        /// Current chain position.
        current: u32,
    },

    /// A received message replayed a counter whose key was already
    /// consumed.
    #[error("replayed message counter {counter}")]
    Replayed {
        /// The replayed counter.
        counter: u32,
    },

    /// Encoding or decoding of a serialized crypto structure failed.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// The passphrase KDF rejected its parameters or failed to derive.
    #[error("key derivation failed: {0}")]
    Kdf(String),

    /// Attachment stream digest did not match the pointer.
    #[error("ciphertext digest mismatch")]
    DigestMismatch,
}
