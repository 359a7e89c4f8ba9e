//! Key derivation: the passphrase KDF and the ratchet root step.

use argon2::{Algorithm, Argon2, Params, Version};
use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::Zeroize;

use crate::error::CryptoError;

/// Domain separator for the DH ratchet root step.
const ROOT_INFO: &[u8] = b"cachet-root";

/// Argon2id parameters for deriving the key-store master key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    /// Iteration count.
    pub time_cost: u32,
    /// Memory in KiB.
    pub memory_kib: u32,
    /// Lanes.
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self { time_cost: 3, memory_kib: 65536, parallelism: 4 }
    }
}

/// Derive the 32-byte master key that wraps the local key store.
///
/// Argon2id with the given parameters. The salt is generated once per
/// store and persisted alongside it.
pub fn derive_master_key(
    passphrase: &str,
    salt: &[u8],
    params: KdfParams,
) -> Result<[u8; 32], CryptoError> {
    let argon_params = Params::new(params.memory_kib, params.time_cost, params.parallelism, Some(32))
        .map_err(|e| CryptoError::Kdf(e.to_string()))?;
    let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon_params);

    let mut key = [0u8; 32];
    argon
        .hash_password_into(passphrase.as_bytes(), salt, &mut key)
        .map_err(|e| CryptoError::Kdf(e.to_string()))?;
    Ok(key)
}

/// One DH ratchet root step: mix a fresh DH output into the root key.
///
/// Returns the successor root key and the seed for the new chain.
pub fn ratchet_root_step(root_key: &[u8; 32], dh_output: &[u8]) -> ([u8; 32], [u8; 32]) {
    let hkdf = Hkdf::<Sha256>::new(Some(root_key), dh_output);
    let mut okm = [0u8; 64];
    let Ok(()) = hkdf.expand(ROOT_INFO, &mut okm) else {
        unreachable!("64 bytes is a valid HKDF-SHA256 output length");
    };
    let mut next_root = [0u8; 32];
    next_root.copy_from_slice(&okm[..32]);
    let mut chain_seed = [0u8; 32];
    chain_seed.copy_from_slice(&okm[32..]);
    okm.zeroize();
    (next_root, chain_seed)
}
