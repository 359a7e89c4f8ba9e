//! Device registry.
//!
//! Tracks every registered device per user. Device ids are assigned as
//! `max + 1` over all of the user's devices including revoked ones, so an
//! id is never reused. Revocation deactivates rather than deletes; historic
//! envelopes and pinned sessions keep a resolvable address.

#![allow(clippy::expect_used, reason = "Mutex poisoning should cause a panic")]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use cachet_proto::{DeviceAddress, DeviceInfo};
use tracing::info;

use crate::clock::Clock;
use crate::error::ServerError;

/// Thread-safe device registry. Clone shares the same underlying state.
#[derive(Clone)]
pub struct DeviceRegistry {
    clock: Arc<dyn Clock>,
    inner: Arc<Mutex<Inner>>,
}

struct Inner {
    /// Devices per user, keyed by device id.
    devices: HashMap<u64, HashMap<u32, DeviceInfo>>,
}

impl DeviceRegistry {
    /// Create an empty registry.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock, inner: Arc::new(Mutex::new(Inner { devices: HashMap::new() })) }
    }

    /// Register a new device, assigning the next free id.
    pub fn register(&self, user_id: u64, display_name: String) -> DeviceInfo {
        let now = self.clock.now_unix();
        let mut inner = self.inner.lock().expect("DeviceRegistry mutex poisoned");
        let devices = inner.devices.entry(user_id).or_default();

        let device_id = devices.keys().max().map_or(1, |max| max + 1);
        let device = DeviceInfo {
            user_id,
            device_id,
            display_name,
            created_at: now,
            last_active_at: now,
            active: true,
        };
        devices.insert(device_id, device.clone());
        info!(user_id, device_id, "device registered");
        device
    }

    /// All devices of a user, active and revoked, ordered by id.
    pub fn list(&self, user_id: u64) -> Vec<DeviceInfo> {
        let inner = self.inner.lock().expect("DeviceRegistry mutex poisoned");
        let mut devices: Vec<DeviceInfo> =
            inner.devices.get(&user_id).map(|d| d.values().cloned().collect()).unwrap_or_default();
        devices.sort_by_key(|d| d.device_id);
        devices
    }

    /// Look up one device.
    pub fn get(&self, address: DeviceAddress) -> Option<DeviceInfo> {
        let inner = self.inner.lock().expect("DeviceRegistry mutex poisoned");
        inner.devices.get(&address.user_id).and_then(|d| d.get(&address.device_id)).cloned()
    }

    /// Whether the device exists and has not been revoked.
    pub fn is_active(&self, address: DeviceAddress) -> bool {
        self.get(address).is_some_and(|d| d.active)
    }

    /// Require an active device, for use by the other services.
    pub fn require_active(&self, address: DeviceAddress) -> Result<(), ServerError> {
        if self.is_active(address) { Ok(()) } else { Err(ServerError::UnknownDevice(address)) }
    }

    /// Deactivate a device. Idempotent once revoked.
    pub fn revoke(&self, address: DeviceAddress) -> Result<(), ServerError> {
        let mut inner = self.inner.lock().expect("DeviceRegistry mutex poisoned");
        let device = inner
            .devices
            .get_mut(&address.user_id)
            .and_then(|d| d.get_mut(&address.device_id))
            .ok_or(ServerError::UnknownDevice(address))?;
        device.active = false;
        info!(%address, "device revoked");
        Ok(())
    }

    /// Record activity for a device.
    pub fn touch(&self, address: DeviceAddress) {
        let now = self.clock.now_unix();
        let mut inner = self.inner.lock().expect("DeviceRegistry mutex poisoned");
        if let Some(device) =
            inner.devices.get_mut(&address.user_id).and_then(|d| d.get_mut(&address.device_id))
        {
            device.last_active_at = now;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use crate::clock::ManualClock;

    use super::*;

    fn registry() -> (Arc<ManualClock>, DeviceRegistry) {
        let clock = ManualClock::at(1000);
        (clock.clone(), DeviceRegistry::new(clock))
    }

    #[test]
    fn ids_start_at_one_and_increment() {
        let (_, registry) = registry();
        assert_eq!(registry.register(7, "laptop".into()).device_id, 1);
        assert_eq!(registry.register(7, "phone".into()).device_id, 2);
        assert_eq!(registry.register(8, "other user".into()).device_id, 1);
    }

    #[test]
    fn revoked_ids_are_never_reused() {
        let (_, registry) = registry();
        registry.register(7, "a".into());
        let second = registry.register(7, "b".into());
        registry.revoke(DeviceAddress { user_id: 7, device_id: second.device_id }).unwrap();
        assert_eq!(registry.register(7, "c".into()).device_id, 3);
    }

    #[test]
    fn revoke_deactivates_but_keeps_the_record() {
        let (_, registry) = registry();
        registry.register(7, "a".into());
        let address = DeviceAddress { user_id: 7, device_id: 1 };
        registry.revoke(address).unwrap();
        assert!(!registry.is_active(address));
        assert!(registry.get(address).is_some());
        assert_eq!(registry.list(7).len(), 1);
    }

    #[test]
    fn revoke_unknown_device_fails() {
        let (_, registry) = registry();
        let result = registry.revoke(DeviceAddress { user_id: 1, device_id: 1 });
        assert!(matches!(result, Err(ServerError::UnknownDevice(_))));
    }

    #[test]
    fn touch_updates_last_active() {
        let (clock, registry) = registry();
        registry.register(7, "a".into());
        let address = DeviceAddress { user_id: 7, device_id: 1 };
        clock.advance(60);
        registry.touch(address);
        assert_eq!(registry.get(address).unwrap().last_active_at, 1060);
    }
}
