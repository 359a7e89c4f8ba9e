//! Client-side error types.

use cachet_crypto::CryptoError;
use thiserror::Error;

use crate::transport::TransportError;

/// Errors surfaced by the client engine.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The key store is locked; unlock with the passphrase first.
    #[error("key store is locked")]
    Locked,

    /// The passphrase did not unlock the key store.
    #[error("wrong passphrase")]
    WrongPassphrase,

    /// The engine has no registered device yet.
    #[error("device not set up")]
    NotSetUp,

    /// No session exists for the address and the envelope was not a
    /// session-establishing message.
    #[error("no session with {address}")]
    NoSession {
        /// The peer address.
        address: String,
    },

    /// A cryptographic operation failed.
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// The server or network rejected a request.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A locally persisted record failed to decode.
    #[error("corrupt local record: {0}")]
    Storage(String),

    /// A payload failed to encode or decode as JSON.
    #[error("payload encoding: {0}")]
    Payload(#[from] serde_json::Error),

    /// The requested vault snapshot was deleted or never existed.
    #[error("no vault snapshot for counter {counter}")]
    VaultSnapshotMissing {
        /// The requested counter.
        counter: u64,
    },
}
