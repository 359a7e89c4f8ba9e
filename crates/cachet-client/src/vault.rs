//! Personal vault ratchet for saved messages.
//!
//! Saved messages are re-encrypted locally under a per-context forward
//! ratchet rather than stored with their original message keys. Each save
//! derives a one-off key labeled with the current counter, snapshots the
//! chain key at that counter, then advances the chain. Deleting a
//! snapshot is the secure-delete primitive: without it the record can
//! never be decrypted again, while every other record stays readable.

use hkdf::Hkdf;
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use cachet_crypto::{open, seal};

use crate::error::ClientError;
use crate::keystore::KeyStore;
use crate::keystore_codec::{decode, encode};

/// Label advancing the vault chain.
const ADVANCE_LABEL: &[u8] = b"chain-advance";

/// One encrypted vault record. Stored wherever the application keeps its
/// saved messages; only the key store can open it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultRecord {
    /// Chain position the record was sealed at.
    pub counter: u64,
    /// Random 96-bit nonce.
    pub nonce: [u8; 12],
    /// Authenticated ciphertext.
    pub ciphertext: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct VaultChain {
    key: [u8; 32],
    counter: u64,
}

fn current_record(context_id: u64) -> String {
    format!("vault/{context_id}/current")
}

fn snapshot_record(context_id: u64, counter: u64) -> String {
    format!("vault/{context_id}/snap/{counter}")
}

fn expand(key: &[u8; 32], label: &[u8]) -> [u8; 32] {
    let hkdf = Hkdf::<Sha256>::new(None, key);
    let mut out = [0u8; 32];
    let Ok(()) = hkdf.expand(label, &mut out) else {
        unreachable!("32 bytes is a valid HKDF-SHA256 output length");
    };
    out
}

fn message_key(chain_key: &[u8; 32], counter: u64) -> [u8; 32] {
    expand(chain_key, format!("saved-msg|{counter}").as_bytes())
}

fn record_aad(context_id: u64, counter: u64) -> Vec<u8> {
    format!("{context_id}|{counter}").into_bytes()
}

/// Seal a message into the vault for a context, advancing its chain.
pub fn save<R: RngCore + CryptoRng>(
    store: &mut KeyStore,
    rng: &mut R,
    context_id: u64,
    plaintext: &[u8],
) -> Result<VaultRecord, ClientError> {
    let mut chain: VaultChain = match store.get(&current_record(context_id))? {
        Some(bytes) => decode(&bytes)?,
        None => {
            let mut key = [0u8; 32];
            rng.fill_bytes(&mut key);
            VaultChain { key, counter: 0 }
        }
    };

    let counter = chain.counter;
    let key = message_key(&chain.key, counter);
    let mut nonce = [0u8; 12];
    rng.fill_bytes(&mut nonce);
    let ciphertext = seal(&key, &nonce, plaintext, &record_aad(context_id, counter));

    store.put(rng, &snapshot_record(context_id, counter), &chain.key)?;

    chain.key = expand(&chain.key, ADVANCE_LABEL);
    chain.counter += 1;
    store.put(rng, &current_record(context_id), &encode(&chain))?;

    Ok(VaultRecord { counter, nonce, ciphertext })
}

/// Open a vault record through its retained snapshot.
pub fn load(
    store: &mut KeyStore,
    context_id: u64,
    record: &VaultRecord,
) -> Result<Vec<u8>, ClientError> {
    let Some(snapshot) = store.get(&snapshot_record(context_id, record.counter))? else {
        return Err(ClientError::VaultSnapshotMissing { counter: record.counter });
    };
    let snapshot: [u8; 32] = snapshot
        .try_into()
        .map_err(|_| ClientError::Storage("vault snapshot has wrong length".into()))?;
    let key = message_key(&snapshot, record.counter);
    Ok(open(&key, &record.nonce, &record.ciphertext, &record_aad(context_id, record.counter))?)
}

/// Delete the snapshot for one record, making it permanently unreadable.
pub fn delete_snapshot(
    store: &mut KeyStore,
    context_id: u64,
    counter: u64,
) -> Result<bool, ClientError> {
    store.delete(&snapshot_record(context_id, counter))
}
