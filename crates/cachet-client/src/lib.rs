//! Cachet client engine.
//!
//! Everything a chat application needs to speak the protocol end-to-end
//! encrypted: a passphrase-protected key store, X3DH session
//! establishment, double-ratchet messaging, encrypted attachments, the
//! personal vault ratchet and safety numbers. The server side is reached
//! through the [`Transport`] trait, so the engine runs unchanged against a
//! remote server or the in-process loopback used in tests.
//!
//! # Security
//!
//! - Private keys never leave the key store unsealed; the store auto-locks
//!   after five minutes idle.
//! - Peer identities are pinned on first use. A changed identity is
//!   reported on every affected operation but never blocks delivery.
//! - Session state is persisted only after a successful operation, so a
//!   failed decrypt cannot desynchronize the ratchet.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod engine;
pub mod error;
pub mod identity;
pub mod keystore;
mod keystore_codec;
pub mod session;
pub mod transport;
pub mod vault;

pub use engine::{Engine, Inbound, ReceivedMessage, SendOutcome};
pub use error::ClientError;
pub use identity::{INITIAL_ONE_TIME_PREKEYS, REPLENISH_BATCH, REPLENISH_THRESHOLD};
pub use keystore::{AUTO_LOCK_AFTER, KeyStore};
pub use session::DecryptOutcome;
pub use transport::{Transport, TransportError};
pub use vault::VaultRecord;
