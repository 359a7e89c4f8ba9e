//! AEAD helpers.
//!
//! Two cipher variants are used across the engine:
//!
//! - XChaCha20-Poly1305 (24-byte nonce) for ratchet messages and the
//!   attachment stream, where nonces are random or derived per chunk.
//! - ChaCha20-Poly1305 (12-byte nonce) for the vault ratchet and the local
//!   key store, whose formats specify a random 96-bit nonce.
//!
//! Failed authentication surfaces as [`CryptoError::DecryptionFailed`]
//! with no further detail.

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Nonce, XChaCha20Poly1305, XNonce};

use crate::error::CryptoError;

/// Byte length of a ChaCha20-Poly1305 nonce.
pub const NONCE_LEN: usize = 12;

/// Byte length of an XChaCha20-Poly1305 nonce.
pub const XNONCE_LEN: usize = 24;

/// Byte length of the Poly1305 authentication tag.
pub const TAG_LEN: usize = 16;

/// Encrypt with ChaCha20-Poly1305 (96-bit nonce).
pub fn seal(key: &[u8; 32], nonce: &[u8; NONCE_LEN], plaintext: &[u8], aad: &[u8]) -> Vec<u8> {
    let cipher = ChaCha20Poly1305::new(key.into());
    let Ok(ciphertext) =
        cipher.encrypt(Nonce::from_slice(nonce), Payload { msg: plaintext, aad })
    else {
        unreachable!("ChaCha20-Poly1305 encryption cannot fail with valid inputs");
    };
    ciphertext
}

/// Decrypt with ChaCha20-Poly1305 (96-bit nonce).
pub fn open(
    key: &[u8; 32],
    nonce: &[u8; NONCE_LEN],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = ChaCha20Poly1305::new(key.into());
    cipher
        .decrypt(Nonce::from_slice(nonce), Payload { msg: ciphertext, aad })
        .map_err(|_| CryptoError::DecryptionFailed)
}

/// Encrypt with XChaCha20-Poly1305 (192-bit nonce).
pub fn seal_xchacha(
    key: &[u8; 32],
    nonce: &[u8; XNONCE_LEN],
    plaintext: &[u8],
    aad: &[u8],
) -> Vec<u8> {
    let cipher = XChaCha20Poly1305::new(key.into());
    let Ok(ciphertext) =
        cipher.encrypt(XNonce::from_slice(nonce), Payload { msg: plaintext, aad })
    else {
        unreachable!("XChaCha20-Poly1305 encryption cannot fail with valid inputs");
    };
    ciphertext
}

/// Decrypt with XChaCha20-Poly1305 (192-bit nonce).
pub fn open_xchacha(
    key: &[u8; 32],
    nonce: &[u8; XNONCE_LEN],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new(key.into());
    cipher
        .decrypt(XNonce::from_slice(nonce), Payload { msg: ciphertext, aad })
        .map_err(|_| CryptoError::DecryptionFailed)
}
