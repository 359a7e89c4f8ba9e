//! Device registration shapes.

use serde::{Deserialize, Serialize};

/// Request to register a new device for a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterDeviceRequest {
    /// Human-readable name shown in the user's device list.
    pub display_name: String,
}

/// A registered device.
///
/// Devices are deactivated on revoke, never hard-deleted, so historic
/// envelopes and sessions keep a resolvable address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    /// Owning user.
    pub user_id: u64,
    /// Per-user device id.
    pub device_id: u32,
    /// Display name.
    pub display_name: String,
    /// Unix seconds of registration.
    pub created_at: u64,
    /// Unix seconds of last observed activity.
    pub last_active_at: u64,
    /// False once revoked.
    pub active: bool,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn device_info_roundtrip() {
        let device = DeviceInfo {
            user_id: 3,
            device_id: 1,
            display_name: "laptop".to_string(),
            created_at: 100,
            last_active_at: 200,
            active: true,
        };
        let json = serde_json::to_string(&device).unwrap();
        assert!(json.contains("displayName"));
        assert!(json.contains("lastActiveAt"));
        let back: DeviceInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(back, device);
    }
}
