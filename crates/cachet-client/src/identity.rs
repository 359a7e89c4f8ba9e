//! Local identity and prekey material, persisted through the key store.
//!
//! Record layout inside the store:
//!
//! ```text
//! identity            IdentityKeyPair
//! registration-id     u32
//! spk-current         u32 (id of the live signed prekey)
//! spk/{id}            SignedPreKeyPair
//! otk/{id}            OneTimePreKeyPair (deleted once consumed)
//! otk-next-id         u32 (next id to assign)
//! ```
//!
//! One-time prekey policy: publish [`INITIAL_ONE_TIME_PREKEYS`] at setup,
//! replenish with [`REPLENISH_BATCH`] fresh keys whenever the server-side
//! pool drops below [`REPLENISH_THRESHOLD`].

use cachet_crypto::keys::{IdentityKeyPair, OneTimePreKeyPair, SignedPreKeyPair};
use cachet_proto::{KeyBundleUpload, OneTimePreKeyPublic, ReplenishRequest, SignedPreKeyPublic};
use rand::{CryptoRng, RngCore};

use crate::error::ClientError;
use crate::keystore::KeyStore;
use crate::keystore_codec::{decode, encode};

/// One-time prekeys published at device setup.
pub const INITIAL_ONE_TIME_PREKEYS: u32 = 100;

/// Server-side pool size below which the engine replenishes.
pub const REPLENISH_THRESHOLD: u32 = 20;

/// Keys per replenishment batch.
pub const REPLENISH_BATCH: u32 = 80;

/// Load the identity keypair, generating and persisting one on first call.
pub fn ensure_identity<R: RngCore + CryptoRng>(
    store: &mut KeyStore,
    rng: &mut R,
) -> Result<IdentityKeyPair, ClientError> {
    if let Some(bytes) = store.get("identity")? {
        return decode(&bytes);
    }
    let identity = IdentityKeyPair::generate(rng);
    store.put(rng, "identity", &encode(&identity))?;

    let registration_id: u32 = rng.next_u32();
    store.put(rng, "registration-id", &encode(&registration_id))?;
    Ok(identity)
}

/// The registration id chosen at identity creation.
pub fn registration_id(store: &mut KeyStore) -> Result<u32, ClientError> {
    let Some(bytes) = store.get("registration-id")? else {
        return Err(ClientError::NotSetUp);
    };
    decode(&bytes)
}

/// Build the full bundle published at device setup.
///
/// Generates the first signed prekey and the initial one-time batch, and
/// persists all private halves before returning the public bundle.
pub fn initial_bundle<R: RngCore + CryptoRng>(
    store: &mut KeyStore,
    rng: &mut R,
) -> Result<KeyBundleUpload, ClientError> {
    let identity = ensure_identity(store, rng)?;
    let registration_id = registration_id(store)?;

    let spk = SignedPreKeyPair::generate(rng, &identity, 1);
    store.put(rng, &format!("spk/{}", spk.key_id), &encode(&spk))?;
    store.put(rng, "spk-current", &encode(&spk.key_id))?;

    let one_time = generate_one_time_batch(store, rng, INITIAL_ONE_TIME_PREKEYS)?;

    Ok(KeyBundleUpload {
        registration_id,
        identity_key: identity.public().to_bytes().to_vec(),
        signed_pre_key: SignedPreKeyPublic {
            key_id: spk.key_id,
            public_key: spk.pair.public.as_bytes().to_vec(),
            signature: spk.signature.to_vec(),
        },
        kyber_pre_key: None,
        one_time_pre_keys: one_time,
    })
}

/// Build a replenishment batch of [`REPLENISH_BATCH`] fresh keys.
pub fn replenish_batch<R: RngCore + CryptoRng>(
    store: &mut KeyStore,
    rng: &mut R,
) -> Result<ReplenishRequest, ClientError> {
    let one_time_pre_keys = generate_one_time_batch(store, rng, REPLENISH_BATCH)?;
    Ok(ReplenishRequest { one_time_pre_keys })
}

fn generate_one_time_batch<R: RngCore + CryptoRng>(
    store: &mut KeyStore,
    rng: &mut R,
    count: u32,
) -> Result<Vec<OneTimePreKeyPublic>, ClientError> {
    let start_id: u32 = match store.get("otk-next-id")? {
        Some(bytes) => decode(&bytes)?,
        None => 1,
    };
    let batch = OneTimePreKeyPair::generate_batch(rng, start_id, count);
    for key in &batch {
        store.put(rng, &format!("otk/{}", key.key_id), &encode(key))?;
    }
    store.put(rng, "otk-next-id", &encode(&start_id.saturating_add(count)))?;

    Ok(batch
        .iter()
        .map(|key| OneTimePreKeyPublic {
            key_id: key.key_id,
            public_key: key.pair.public.as_bytes().to_vec(),
        })
        .collect())
}

/// The current signed prekey.
pub fn current_signed_prekey(store: &mut KeyStore) -> Result<SignedPreKeyPair, ClientError> {
    let Some(bytes) = store.get("spk-current")? else {
        return Err(ClientError::NotSetUp);
    };
    let key_id: u32 = decode(&bytes)?;
    let Some(bytes) = store.get(&format!("spk/{key_id}"))? else {
        return Err(ClientError::Storage(format!("signed prekey {key_id} missing")));
    };
    decode(&bytes)
}

/// Look up a one-time prekey's private half without consuming it.
///
/// `None` when the key was already consumed, which a responder treats as
/// an undecryptable handshake rather than a protocol error. Deletion is a
/// separate step so the key is only consumed once the handshake that
/// named it has authenticated.
pub fn one_time_prekey(
    store: &mut KeyStore,
    key_id: u32,
) -> Result<Option<OneTimePreKeyPair>, ClientError> {
    match store.get(&format!("otk/{key_id}"))? {
        Some(bytes) => Ok(Some(decode(&bytes)?)),
        None => Ok(None),
    }
}

/// Discard a consumed one-time prekey. Returns whether it was present.
pub fn discard_one_time_prekey(store: &mut KeyStore, key_id: u32) -> Result<bool, ClientError> {
    store.delete(&format!("otk/{key_id}"))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use rand::rngs::OsRng;

    use super::*;

    fn store() -> KeyStore {
        let params = cachet_crypto::kdf::KdfParams { time_cost: 1, memory_kib: 8, parallelism: 1 };
        KeyStore::create_with_params(&mut OsRng, "pw", params).unwrap()
    }

    #[test]
    fn identity_is_idempotent() {
        let mut store = store();
        let first = ensure_identity(&mut store, &mut OsRng).unwrap();
        let second = ensure_identity(&mut store, &mut OsRng).unwrap();
        assert_eq!(first.public(), second.public());
    }

    #[test]
    fn initial_bundle_has_policy_counts() {
        let mut store = store();
        let bundle = initial_bundle(&mut store, &mut OsRng).unwrap();
        assert_eq!(bundle.one_time_pre_keys.len(), INITIAL_ONE_TIME_PREKEYS as usize);
        assert_eq!(bundle.signed_pre_key.key_id, 1);
        assert_eq!(bundle.identity_key.len(), 64);
    }

    #[test]
    fn bundle_signature_verifies() {
        let mut store = store();
        let bundle = initial_bundle(&mut store, &mut OsRng).unwrap();
        let identity =
            cachet_crypto::keys::IdentityPublic::from_bytes(&bundle.identity_key).unwrap();
        identity
            .verify(&bundle.signed_pre_key.public_key, &bundle.signed_pre_key.signature)
            .unwrap();
    }

    #[test]
    fn replenish_continues_id_sequence() {
        let mut store = store();
        let bundle = initial_bundle(&mut store, &mut OsRng).unwrap();
        let last_initial = bundle.one_time_pre_keys.last().unwrap().key_id;

        let replenish = replenish_batch(&mut store, &mut OsRng).unwrap();
        assert_eq!(replenish.one_time_pre_keys.len(), REPLENISH_BATCH as usize);
        assert_eq!(replenish.one_time_pre_keys[0].key_id, last_initial + 1);
    }

    #[test]
    fn one_time_prekey_lookup_does_not_consume() {
        let mut store = store();
        initial_bundle(&mut store, &mut OsRng).unwrap();
        assert!(one_time_prekey(&mut store, 5).unwrap().is_some());
        assert!(one_time_prekey(&mut store, 5).unwrap().is_some());
    }

    #[test]
    fn discarded_one_time_prekey_is_gone() {
        let mut store = store();
        initial_bundle(&mut store, &mut OsRng).unwrap();
        assert!(discard_one_time_prekey(&mut store, 5).unwrap());
        assert!(one_time_prekey(&mut store, 5).unwrap().is_none());
        assert!(!discard_one_time_prekey(&mut store, 5).unwrap());
    }

    #[test]
    fn current_signed_prekey_matches_bundle() {
        let mut store = store();
        let bundle = initial_bundle(&mut store, &mut OsRng).unwrap();
        let spk = current_signed_prekey(&mut store).unwrap();
        assert_eq!(spk.key_id, bundle.signed_pre_key.key_id);
        assert_eq!(spk.pair.public.as_bytes().to_vec(), bundle.signed_pre_key.public_key);
    }
}
