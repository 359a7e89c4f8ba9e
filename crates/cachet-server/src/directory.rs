//! Key bundle directory.
//!
//! Stores each device's published public key material. Identity, signed
//! and kyber prekeys are replaced latest-wins; one-time prekeys are
//! appended and each is consumed by exactly one bundle fetch. Consumption
//! picks the lowest unconsumed id and happens atomically under the
//! directory lock, so two concurrent fetches can never receive the same
//! one-time prekey.

#![allow(clippy::expect_used, reason = "Mutex poisoning should cause a panic")]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use cachet_proto::{
    DeviceAddress, KeyBundleResponse, KeyBundleUpload, OneTimePreKeyPublic, ReplenishRequest,
    SignedPreKeyPublic,
};
use tracing::debug;

use crate::devices::DeviceRegistry;
use crate::error::ServerError;

struct OneTimeEntry {
    key: OneTimePreKeyPublic,
    consumed: bool,
}

struct StoredBundle {
    registration_id: u32,
    identity_key: Vec<u8>,
    signed_pre_key: SignedPreKeyPublic,
    kyber_pre_key: Option<SignedPreKeyPublic>,
    one_time: Vec<OneTimeEntry>,
}

/// Thread-safe bundle directory. Clone shares the same underlying state.
#[derive(Clone)]
pub struct KeyDirectory {
    devices: DeviceRegistry,
    inner: Arc<Mutex<HashMap<DeviceAddress, StoredBundle>>>,
}

impl KeyDirectory {
    /// Create an empty directory backed by the device registry.
    pub fn new(devices: DeviceRegistry) -> Self {
        Self { devices, inner: Arc::new(Mutex::new(HashMap::new())) }
    }

    /// Publish or replace a device's bundle.
    ///
    /// Identity, signed and kyber prekeys replace the stored ones; the
    /// one-time batch is appended to whatever pool remains.
    pub fn upload(
        &self,
        address: DeviceAddress,
        bundle: KeyBundleUpload,
    ) -> Result<(), ServerError> {
        self.devices.require_active(address)?;
        let mut inner = self.inner.lock().expect("KeyDirectory mutex poisoned");

        let new_entries = bundle
            .one_time_pre_keys
            .into_iter()
            .map(|key| OneTimeEntry { key, consumed: false });

        match inner.get_mut(&address) {
            Some(stored) => {
                stored.registration_id = bundle.registration_id;
                stored.identity_key = bundle.identity_key;
                stored.signed_pre_key = bundle.signed_pre_key;
                stored.kyber_pre_key = bundle.kyber_pre_key;
                stored.one_time.extend(new_entries);
            }
            None => {
                inner.insert(
                    address,
                    StoredBundle {
                        registration_id: bundle.registration_id,
                        identity_key: bundle.identity_key,
                        signed_pre_key: bundle.signed_pre_key,
                        kyber_pre_key: bundle.kyber_pre_key,
                        one_time: new_entries.collect(),
                    },
                );
            }
        }
        debug!(%address, "key bundle uploaded");
        Ok(())
    }

    /// Fetch a device's bundle for session establishment.
    ///
    /// Atomically claims the lowest unconsumed one-time prekey. An
    /// exhausted pool returns the bundle without one; the fetch never
    /// fails for that reason.
    pub fn fetch(&self, address: DeviceAddress) -> Result<KeyBundleResponse, ServerError> {
        self.devices.require_active(address)?;
        let mut inner = self.inner.lock().expect("KeyDirectory mutex poisoned");
        let stored = inner.get_mut(&address).ok_or(ServerError::BundleMissing(address))?;

        let one_time_pre_key = stored
            .one_time
            .iter_mut()
            .filter(|entry| !entry.consumed)
            .min_by_key(|entry| entry.key.key_id)
            .map(|entry| {
                entry.consumed = true;
                entry.key.clone()
            });

        Ok(KeyBundleResponse {
            user_id: address.user_id,
            device_id: address.device_id,
            registration_id: stored.registration_id,
            identity_key: stored.identity_key.clone(),
            signed_pre_key: stored.signed_pre_key.clone(),
            kyber_pre_key: stored.kyber_pre_key.clone(),
            one_time_pre_key,
        })
    }

    /// Append fresh one-time prekeys and purge consumed entries.
    pub fn replenish(
        &self,
        address: DeviceAddress,
        request: ReplenishRequest,
    ) -> Result<(), ServerError> {
        self.devices.require_active(address)?;
        let mut inner = self.inner.lock().expect("KeyDirectory mutex poisoned");
        let stored = inner.get_mut(&address).ok_or(ServerError::BundleMissing(address))?;

        stored.one_time.retain(|entry| !entry.consumed);
        stored.one_time.extend(
            request.one_time_pre_keys.into_iter().map(|key| OneTimeEntry { key, consumed: false }),
        );
        debug!(%address, pool = stored.one_time.len(), "one-time prekeys replenished");
        Ok(())
    }

    /// Count of unconsumed one-time prekeys.
    pub fn count(&self, address: DeviceAddress) -> Result<u32, ServerError> {
        self.devices.require_active(address)?;
        let inner = self.inner.lock().expect("KeyDirectory mutex poisoned");
        let stored = inner.get(&address).ok_or(ServerError::BundleMissing(address))?;
        Ok(u32::try_from(stored.one_time.iter().filter(|e| !e.consumed).count())
            .unwrap_or(u32::MAX))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use cachet_proto::OneTimePreKeyPublic;

    use crate::clock::ManualClock;

    use super::*;

    fn sample_bundle(key_ids: &[u32]) -> KeyBundleUpload {
        KeyBundleUpload {
            registration_id: 99,
            identity_key: vec![1; 64],
            signed_pre_key: SignedPreKeyPublic {
                key_id: 1,
                public_key: vec![2; 32],
                signature: vec![3; 64],
            },
            kyber_pre_key: None,
            one_time_pre_keys: key_ids
                .iter()
                .map(|&key_id| OneTimePreKeyPublic { key_id, public_key: vec![4; 32] })
                .collect(),
        }
    }

    fn directory() -> (DeviceRegistry, KeyDirectory, DeviceAddress) {
        let devices = DeviceRegistry::new(ManualClock::at(0));
        let device = devices.register(1, "test".into());
        let address = DeviceAddress { user_id: device.user_id, device_id: device.device_id };
        (devices.clone(), KeyDirectory::new(devices), address)
    }

    #[test]
    fn fetch_claims_lowest_unconsumed_key() {
        let (_, directory, address) = directory();
        directory.upload(address, sample_bundle(&[3, 1, 2])).unwrap();

        let first = directory.fetch(address).unwrap();
        assert_eq!(first.one_time_pre_key.unwrap().key_id, 1);
        let second = directory.fetch(address).unwrap();
        assert_eq!(second.one_time_pre_key.unwrap().key_id, 2);
        assert_eq!(directory.count(address).unwrap(), 1);
    }

    #[test]
    fn exhausted_pool_still_serves_the_bundle() {
        let (_, directory, address) = directory();
        directory.upload(address, sample_bundle(&[1])).unwrap();
        directory.fetch(address).unwrap();

        let exhausted = directory.fetch(address).unwrap();
        assert!(exhausted.one_time_pre_key.is_none());
        assert_eq!(exhausted.identity_key, vec![1; 64]);
    }

    #[test]
    fn upload_replaces_signed_material_and_appends_one_time() {
        let (_, directory, address) = directory();
        directory.upload(address, sample_bundle(&[1, 2])).unwrap();

        let mut second = sample_bundle(&[3]);
        second.signed_pre_key.key_id = 2;
        directory.upload(address, second).unwrap();

        let fetched = directory.fetch(address).unwrap();
        assert_eq!(fetched.signed_pre_key.key_id, 2);
        assert_eq!(directory.count(address).unwrap(), 2);
    }

    #[test]
    fn replenish_appends_and_purges_consumed() {
        let (_, directory, address) = directory();
        directory.upload(address, sample_bundle(&[1, 2])).unwrap();
        directory.fetch(address).unwrap();

        directory
            .replenish(
                address,
                ReplenishRequest {
                    one_time_pre_keys: vec![OneTimePreKeyPublic {
                        key_id: 3,
                        public_key: vec![5; 32],
                    }],
                },
            )
            .unwrap();

        // Key 1 was consumed and purged; 2 and 3 remain.
        assert_eq!(directory.count(address).unwrap(), 2);
        assert_eq!(directory.fetch(address).unwrap().one_time_pre_key.unwrap().key_id, 2);
    }

    #[test]
    fn fetch_for_unknown_device_fails() {
        let (_, directory, _) = directory();
        let result = directory.fetch(DeviceAddress { user_id: 9, device_id: 9 });
        assert!(matches!(result, Err(ServerError::UnknownDevice(_))));
    }

    #[test]
    fn fetch_before_upload_fails() {
        let (_, directory, address) = directory();
        assert!(matches!(directory.fetch(address), Err(ServerError::BundleMissing(_))));
    }

    #[test]
    fn revoked_device_cannot_serve_bundles() {
        let (devices, directory, address) = directory();
        directory.upload(address, sample_bundle(&[1])).unwrap();
        devices.revoke(address).unwrap();
        assert!(matches!(directory.fetch(address), Err(ServerError::UnknownDevice(_))));
    }
}
