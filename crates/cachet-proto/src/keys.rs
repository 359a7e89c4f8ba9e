//! Key bundle upload/fetch shapes.
//!
//! A device publishes its public key material so that others can establish
//! sessions with it while it is offline. Identity, signed and kyber prekeys
//! are replaced latest-wins; one-time prekeys are appended and consumed
//! exactly once.

use serde::{Deserialize, Serialize};

use crate::b64;

/// Public half of a signed prekey (also used for kyber prekeys, whose
/// public keys the server stores verbatim).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedPreKeyPublic {
    /// Uploader-assigned id; the highest id is the current prekey.
    pub key_id: u32,
    /// Public key bytes.
    #[serde(with = "b64")]
    pub public_key: Vec<u8>,
    /// Signature by the device's identity key over `public_key`.
    #[serde(with = "b64")]
    pub signature: Vec<u8>,
}

/// Public half of a one-time prekey.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OneTimePreKeyPublic {
    /// Uploader-assigned id, unique per device.
    pub key_id: u32,
    /// Public key bytes.
    #[serde(with = "b64")]
    pub public_key: Vec<u8>,
}

/// Full bundle a device uploads after registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyBundleUpload {
    /// Random 32-bit id distinguishing reinstalls of the same device slot.
    pub registration_id: u32,
    /// Long-term identity public key.
    #[serde(with = "b64")]
    pub identity_key: Vec<u8>,
    /// Current signed prekey.
    pub signed_pre_key: SignedPreKeyPublic,
    /// Current post-quantum prekey, if the device publishes one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kyber_pre_key: Option<SignedPreKeyPublic>,
    /// Batch of one-time prekeys to append.
    pub one_time_pre_keys: Vec<OneTimePreKeyPublic>,
}

/// Bundle returned to a sender wanting to establish a session.
///
/// `one_time_pre_key` is absent when the pool is exhausted; the handshake
/// still proceeds without it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyBundleResponse {
    /// Bundle owner.
    pub user_id: u64,
    /// Bundle owner's device.
    pub device_id: u32,
    /// Owner's registration id.
    pub registration_id: u32,
    /// Long-term identity public key.
    #[serde(with = "b64")]
    pub identity_key: Vec<u8>,
    /// Current signed prekey with signature.
    pub signed_pre_key: SignedPreKeyPublic,
    /// Current kyber prekey, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kyber_pre_key: Option<SignedPreKeyPublic>,
    /// Atomically consumed one-time prekey, if one was available.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub one_time_pre_key: Option<OneTimePreKeyPublic>,
}

/// Replenishment batch of fresh one-time prekeys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplenishRequest {
    /// Keys to append to the device's pool.
    pub one_time_pre_keys: Vec<OneTimePreKeyPublic>,
}

/// Count of unconsumed one-time prekeys, used by the replenishment policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreKeyCountResponse {
    /// Unconsumed keys remaining in the pool.
    pub available: u32,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn sample_bundle() -> KeyBundleResponse {
        KeyBundleResponse {
            user_id: 1,
            device_id: 1,
            registration_id: 777,
            identity_key: vec![1; 64],
            signed_pre_key: SignedPreKeyPublic {
                key_id: 1,
                public_key: vec![2; 32],
                signature: vec![3; 64],
            },
            kyber_pre_key: None,
            one_time_pre_key: Some(OneTimePreKeyPublic { key_id: 1, public_key: vec![4; 32] }),
        }
    }

    #[test]
    fn bundle_roundtrip() {
        let bundle = sample_bundle();
        let json = serde_json::to_string(&bundle).unwrap();
        let back: KeyBundleResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(back, bundle);
    }

    #[test]
    fn exhausted_pool_omits_one_time_key() {
        let mut bundle = sample_bundle();
        bundle.one_time_pre_key = None;
        let json = serde_json::to_string(&bundle).unwrap();
        assert!(!json.contains("oneTimePreKey\""));
        assert!(json.contains("signedPreKey"));
    }
}
