//! Passphrase-protected local key store.
//!
//! Every secret the client persists lives here: identity keys, prekeys,
//! sessions, vault chains, pinned peer identities. Records are sealed
//! individually under a master key derived from the passphrase with
//! Argon2id, each with a fresh random nonce and the record name as
//! associated data, so a record cannot be silently swapped into another
//! slot.
//!
//! The store auto-locks after five minutes without use. A locked store
//! refuses every record operation with [`ClientError::Locked`] until
//! unlocked again; `wipe` destroys all material immediately and is used on
//! device revocation.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use cachet_crypto::kdf::{KdfParams, derive_master_key};
use cachet_crypto::{CryptoError, open, seal};
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::error::ClientError;

/// Idle time before the store locks itself.
pub const AUTO_LOCK_AFTER: Duration = Duration::from_secs(5 * 60);

/// Reserved record proving a derived master key is correct.
const SENTINEL_NAME: &str = "\u{0}sentinel";
const SENTINEL_VALUE: &[u8] = b"cachet-keystore-v1";

/// One sealed record: fresh nonce plus ciphertext.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SealedRecord {
    nonce: [u8; 12],
    ciphertext: Vec<u8>,
}

/// On-disk form of the store.
#[derive(Serialize, Deserialize)]
struct PersistedStore {
    salt: [u8; 16],
    params: KdfParams,
    records: HashMap<String, SealedRecord>,
}

/// The local key store.
pub struct KeyStore {
    salt: [u8; 16],
    params: KdfParams,
    records: HashMap<String, SealedRecord>,
    master: Option<[u8; 32]>,
    last_touch: Instant,
    auto_lock_after: Duration,
}

impl std::fmt::Debug for KeyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyStore")
            .field("records", &self.records.len())
            .field("locked", &self.master.is_none())
            .finish_non_exhaustive()
    }
}

impl KeyStore {
    /// Create a fresh store, unlocked, keyed by `passphrase`.
    pub fn create<R: RngCore + CryptoRng>(
        rng: &mut R,
        passphrase: &str,
    ) -> Result<Self, ClientError> {
        Self::create_with_params(rng, passphrase, KdfParams::default())
    }

    /// Create a store with explicit KDF parameters.
    ///
    /// Production uses the defaults; tests pass weaker parameters to keep
    /// store creation cheap.
    pub fn create_with_params<R: RngCore + CryptoRng>(
        rng: &mut R,
        passphrase: &str,
        params: KdfParams,
    ) -> Result<Self, ClientError> {
        let mut salt = [0u8; 16];
        rng.fill_bytes(&mut salt);
        let master = derive_master_key(passphrase, &salt, params)?;

        let mut store = Self {
            salt,
            params,
            records: HashMap::new(),
            master: Some(master),
            last_touch: Instant::now(),
            auto_lock_after: AUTO_LOCK_AFTER,
        };
        store.put(rng, SENTINEL_NAME, SENTINEL_VALUE)?;
        Ok(store)
    }

    /// Reopen a persisted store. The result starts locked.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ClientError> {
        let persisted: PersistedStore =
            ciborium::from_reader(bytes).map_err(|e| ClientError::Storage(e.to_string()))?;
        Ok(Self {
            salt: persisted.salt,
            params: persisted.params,
            records: persisted.records,
            master: None,
            last_touch: Instant::now(),
            auto_lock_after: AUTO_LOCK_AFTER,
        })
    }

    /// Serialize for persistence. Secrets are already sealed; the output
    /// is safe to write to disk as-is.
    pub fn to_bytes(&self) -> Vec<u8> {
        let persisted = PersistedStore {
            salt: self.salt,
            params: self.params,
            records: self.records.clone(),
        };
        let mut out = Vec::new();
        let Ok(()) = ciborium::into_writer(&persisted, &mut out) else {
            unreachable!("encoding to a Vec cannot fail");
        };
        out
    }

    /// Unlock with the passphrase. Verifies the derived key against the
    /// sentinel record before accepting it.
    pub fn unlock(&mut self, passphrase: &str) -> Result<(), ClientError> {
        let master = derive_master_key(passphrase, &self.salt, self.params)?;
        let Some(sentinel) = self.records.get(SENTINEL_NAME) else {
            return Err(ClientError::Storage("missing sentinel record".into()));
        };
        match open(&master, &sentinel.nonce, &sentinel.ciphertext, SENTINEL_NAME.as_bytes()) {
            Ok(value) if value == SENTINEL_VALUE => {
                self.master = Some(master);
                self.last_touch = Instant::now();
                Ok(())
            }
            Ok(_) | Err(CryptoError::DecryptionFailed) => Err(ClientError::WrongPassphrase),
            Err(e) => Err(e.into()),
        }
    }

    /// Lock immediately, wiping the master key from memory.
    pub fn lock(&mut self) {
        if let Some(mut master) = self.master.take() {
            master.zeroize();
        }
    }

    /// Whether record operations would currently fail with `Locked`.
    pub fn is_locked(&self) -> bool {
        self.master.is_none() || self.last_touch.elapsed() >= self.auto_lock_after
    }

    /// Override the auto-lock timeout. Tests use short values.
    pub fn set_auto_lock_after(&mut self, after: Duration) {
        self.auto_lock_after = after;
    }

    /// Store a record, sealing it with a fresh nonce.
    pub fn put<R: RngCore + CryptoRng>(
        &mut self,
        rng: &mut R,
        name: &str,
        value: &[u8],
    ) -> Result<(), ClientError> {
        let master = self.active_master()?;
        let mut nonce = [0u8; 12];
        rng.fill_bytes(&mut nonce);
        let ciphertext = seal(&master, &nonce, value, name.as_bytes());
        self.records.insert(name.to_string(), SealedRecord { nonce, ciphertext });
        Ok(())
    }

    /// Fetch and open a record. `None` if no such record exists.
    pub fn get(&mut self, name: &str) -> Result<Option<Vec<u8>>, ClientError> {
        let master = self.active_master()?;
        let Some(record) = self.records.get(name) else {
            return Ok(None);
        };
        let value = open(&master, &record.nonce, &record.ciphertext, name.as_bytes())?;
        Ok(Some(value))
    }

    /// Delete a record. Returns whether it existed.
    pub fn delete(&mut self, name: &str) -> Result<bool, ClientError> {
        self.active_master()?;
        Ok(self.records.remove(name).is_some())
    }

    /// Names of all records under a prefix, unordered.
    pub fn names_with_prefix(&mut self, prefix: &str) -> Result<Vec<String>, ClientError> {
        self.active_master()?;
        Ok(self
            .records
            .keys()
            .filter(|name| name.starts_with(prefix) && *name != SENTINEL_NAME)
            .cloned()
            .collect())
    }

    /// Destroy all records and lock. Used on device revocation; the store
    /// cannot be recovered afterwards.
    pub fn wipe(&mut self) {
        self.records.clear();
        self.lock();
    }

    /// The master key if unlocked and not idle past the auto-lock window.
    fn active_master(&mut self) -> Result<[u8; 32], ClientError> {
        let Some(master) = self.master else {
            return Err(ClientError::Locked);
        };
        if self.last_touch.elapsed() >= self.auto_lock_after {
            self.lock();
            return Err(ClientError::Locked);
        }
        self.last_touch = Instant::now();
        Ok(master)
    }
}
