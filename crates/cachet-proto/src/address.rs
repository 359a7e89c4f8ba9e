//! Addressing of a single device.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Address of one device: a (user, device) pair.
///
/// Every envelope is addressed to exactly one device. Ratchet sessions are
/// keyed by the remote address, so a user with three devices has three
/// independent sessions from the sender's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceAddress {
    /// Owning user.
    pub user_id: u64,
    /// Per-user device id, assigned `max(existing)+1` starting at 1.
    pub device_id: u32,
}

impl DeviceAddress {
    /// Create an address from its parts.
    pub fn new(user_id: u64, device_id: u32) -> Self {
        Self { user_id, device_id }
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.user_id, self.device_id)
    }
}
