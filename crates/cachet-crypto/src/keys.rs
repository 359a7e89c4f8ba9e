//! Key material: identity, signed prekeys, one-time prekeys.
//!
//! The identity keypair has two components: an X25519 key for
//! Diffie-Hellman agreement and an Ed25519 key that signs prekeys. The
//! published identity key is the 64-byte concatenation of both public
//! halves, so a bundle consumer can verify signatures and run X3DH from a
//! single fixed-size field.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::CryptoError;

/// Byte length of the published identity key (X25519 ∥ Ed25519).
pub const IDENTITY_PUBLIC_LEN: usize = 64;

/// Byte length of an X25519 public key.
pub const PUBLIC_KEY_LEN: usize = 32;

/// Byte length of an Ed25519 signature.
pub const SIGNATURE_LEN: usize = 64;

/// Public half of an identity: agreement key plus signing key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityPublic {
    /// X25519 public key used in X3DH.
    pub dh: PublicKey,
    /// Ed25519 key that signs this identity's prekeys.
    pub ed: VerifyingKey,
}

impl IdentityPublic {
    /// Encode as the 64-byte wire form.
    pub fn to_bytes(&self) -> [u8; IDENTITY_PUBLIC_LEN] {
        let mut out = [0u8; IDENTITY_PUBLIC_LEN];
        out[..32].copy_from_slice(self.dh.as_bytes());
        out[32..].copy_from_slice(self.ed.as_bytes());
        out
    }

    /// Decode from the 64-byte wire form.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != IDENTITY_PUBLIC_LEN {
            return Err(CryptoError::InvalidLength {
                field: "identity key",
                expected: IDENTITY_PUBLIC_LEN,
                got: bytes.len(),
            });
        }
        let mut dh = [0u8; 32];
        dh.copy_from_slice(&bytes[..32]);
        let mut ed = [0u8; 32];
        ed.copy_from_slice(&bytes[32..]);
        let ed = VerifyingKey::from_bytes(&ed).map_err(|_| CryptoError::InvalidLength {
            field: "identity signing key",
            expected: 32,
            got: 32,
        })?;
        Ok(Self { dh: PublicKey::from(dh), ed })
    }

    /// Verify an Ed25519 signature made by this identity.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
        let signature = Signature::from_slice(signature).map_err(|_| CryptoError::InvalidLength {
            field: "signature",
            expected: SIGNATURE_LEN,
            got: signature.len(),
        })?;
        self.ed.verify(message, &signature).map_err(|_| CryptoError::InvalidSignature)
    }
}

/// Long-term identity keypair. The private halves never leave the device.
#[derive(Clone, Serialize, Deserialize)]
pub struct IdentityKeyPair {
    /// X25519 secret for agreement.
    pub dh_secret: StaticSecret,
    /// Ed25519 secret for signing prekeys.
    pub signing: SigningKey,
}

impl IdentityKeyPair {
    /// Generate a fresh identity.
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let mut dh_bytes = [0u8; 32];
        rng.fill_bytes(&mut dh_bytes);
        let mut ed_bytes = [0u8; 32];
        rng.fill_bytes(&mut ed_bytes);
        Self {
            dh_secret: StaticSecret::from(dh_bytes),
            signing: SigningKey::from_bytes(&ed_bytes),
        }
    }

    /// Public halves for publication.
    pub fn public(&self) -> IdentityPublic {
        IdentityPublic {
            dh: PublicKey::from(&self.dh_secret),
            ed: self.signing.verifying_key(),
        }
    }

    /// Sign a prekey's public bytes.
    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LEN] {
        self.signing.sign(message).to_bytes()
    }
}

impl std::fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print private key material.
        f.debug_struct("IdentityKeyPair").field("public", &self.public()).finish_non_exhaustive()
    }
}

/// An X25519 keypair used as prekey material.
#[derive(Clone, Serialize, Deserialize)]
pub struct PreKeyPair {
    /// Secret half, kept in the local key store.
    pub secret: StaticSecret,
    /// Public half, uploaded to the directory.
    pub public: PublicKey,
}

impl PreKeyPair {
    /// Generate a fresh X25519 keypair.
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let mut bytes = [0u8; 32];
        rng.fill_bytes(&mut bytes);
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }
}

impl std::fmt::Debug for PreKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreKeyPair").field("public", &self.public).finish_non_exhaustive()
    }
}

/// A signed prekey: X25519 keypair plus the identity's signature over the
/// public half.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedPreKeyPair {
    /// Uploader-assigned id; highest id is current.
    pub key_id: u32,
    /// The keypair.
    pub pair: PreKeyPair,
    /// Identity signature over the public key bytes.
    #[serde(with = "signature_bytes")]
    pub signature: [u8; SIGNATURE_LEN],
}

/// Serde has no impls for 64-byte arrays; route the signature through a
/// slice with a length check on the way back.
mod signature_bytes {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use super::SIGNATURE_LEN;

    pub fn serialize<S: Serializer>(
        signature: &[u8; SIGNATURE_LEN],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        signature.as_slice().serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<[u8; SIGNATURE_LEN], D::Error> {
        let bytes = Vec::<u8>::deserialize(deserializer)?;
        let len = bytes.len();
        bytes.try_into().map_err(|_| D::Error::invalid_length(len, &"a 64-byte signature"))
    }
}

impl SignedPreKeyPair {
    /// Generate and sign a fresh signed prekey.
    pub fn generate<R: RngCore + CryptoRng>(
        rng: &mut R,
        identity: &IdentityKeyPair,
        key_id: u32,
    ) -> Self {
        let pair = PreKeyPair::generate(rng);
        let signature = identity.sign(pair.public.as_bytes());
        Self { key_id, pair, signature }
    }
}

/// A one-time prekey: consumed by exactly one handshake, then discarded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OneTimePreKeyPair {
    /// Uploader-assigned id, unique per device.
    pub key_id: u32,
    /// The keypair.
    pub pair: PreKeyPair,
}

impl OneTimePreKeyPair {
    /// Generate a batch of one-time prekeys with consecutive ids.
    pub fn generate_batch<R: RngCore + CryptoRng>(
        rng: &mut R,
        start_id: u32,
        count: u32,
    ) -> Vec<Self> {
        (start_id..start_id.saturating_add(count))
            .map(|key_id| Self { key_id, pair: PreKeyPair::generate(rng) })
            .collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use rand::rngs::OsRng;

    use super::*;

    #[test]
    fn identity_public_roundtrip() {
        let identity = IdentityKeyPair::generate(&mut OsRng);
        let public = identity.public();
        let bytes = public.to_bytes();
        assert_eq!(bytes.len(), IDENTITY_PUBLIC_LEN);
        let back = IdentityPublic::from_bytes(&bytes).unwrap();
        assert_eq!(back, public);
    }

    #[test]
    fn identity_public_rejects_wrong_length() {
        let result = IdentityPublic::from_bytes(&[0u8; 33]);
        assert!(matches!(result, Err(CryptoError::InvalidLength { .. })));
    }

    #[test]
    fn signed_prekey_verifies() {
        let identity = IdentityKeyPair::generate(&mut OsRng);
        let spk = SignedPreKeyPair::generate(&mut OsRng, &identity, 1);
        identity
            .public()
            .verify(spk.pair.public.as_bytes(), &spk.signature)
            .expect("signature must verify");
    }

    #[test]
    fn forged_prekey_signature_is_rejected() {
        let identity = IdentityKeyPair::generate(&mut OsRng);
        let other = IdentityKeyPair::generate(&mut OsRng);
        let spk = SignedPreKeyPair::generate(&mut OsRng, &other, 1);
        let result = identity.public().verify(spk.pair.public.as_bytes(), &spk.signature);
        assert_eq!(result, Err(CryptoError::InvalidSignature));
    }

    #[test]
    fn signed_prekey_survives_persistence() {
        let identity = IdentityKeyPair::generate(&mut OsRng);
        let spk = SignedPreKeyPair::generate(&mut OsRng, &identity, 3);

        let mut bytes = Vec::new();
        ciborium::into_writer(&spk, &mut bytes).unwrap();
        let back: SignedPreKeyPair = ciborium::from_reader(bytes.as_slice()).unwrap();

        assert_eq!(back.key_id, spk.key_id);
        assert_eq!(back.signature, spk.signature);
        assert_eq!(back.pair.public, spk.pair.public);
        identity.public().verify(back.pair.public.as_bytes(), &back.signature).unwrap();
    }

    #[test]
    fn batch_ids_are_consecutive() {
        let batch = OneTimePreKeyPair::generate_batch(&mut OsRng, 5, 3);
        let ids: Vec<u32> = batch.iter().map(|k| k.key_id).collect();
        assert_eq!(ids, vec![5, 6, 7]);
    }

    #[test]
    fn debug_never_prints_secrets() {
        let identity = IdentityKeyPair::generate(&mut OsRng);
        let debug = format!("{identity:?}");
        assert!(!debug.contains("dh_secret"));
        assert!(!debug.contains("signing"));
    }
}
