//! Chunked stream cipher for attachment content.
//!
//! Attachments are encrypted in fixed-size chunks so uploads can resume
//! without re-encrypting, and so a download can stream without buffering
//! the whole file. Each chunk gets its own XChaCha20-Poly1305 nonce derived
//! from a per-stream random header and the chunk index; the chunk index and
//! a final-chunk flag ride in the associated data, so chunks cannot be
//! reordered, dropped or truncated without failing authentication.
//!
//! A SHA-256 digest over the full ciphertext is published in the pointer,
//! letting the recipient reject a substituted blob before decrypting.

use rand::{CryptoRng, RngCore};
use sha2::{Digest, Sha256};

use crate::aead::{TAG_LEN, XNONCE_LEN, open_xchacha, seal_xchacha};
use crate::error::CryptoError;

/// Plaintext bytes per chunk.
pub const STREAM_CHUNK_SIZE: usize = 64 * 1024;

/// Byte length of the per-stream nonce header.
pub const STREAM_HEADER_LEN: usize = 16;

/// Per-stream secret material, carried in the attachment pointer.
#[derive(Clone)]
pub struct StreamSecrets {
    /// Content encryption key.
    pub content_key: [u8; 32],
    /// Random nonce prefix shared by every chunk of the stream.
    pub header: [u8; STREAM_HEADER_LEN],
}

impl StreamSecrets {
    /// Generate fresh secrets for a new attachment.
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let mut content_key = [0u8; 32];
        rng.fill_bytes(&mut content_key);
        let mut header = [0u8; STREAM_HEADER_LEN];
        rng.fill_bytes(&mut header);
        Self { content_key, header }
    }
}

impl std::fmt::Debug for StreamSecrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSecrets").finish_non_exhaustive()
    }
}

fn chunk_nonce(header: &[u8; STREAM_HEADER_LEN], index: u64) -> [u8; XNONCE_LEN] {
    let mut nonce = [0u8; XNONCE_LEN];
    nonce[..STREAM_HEADER_LEN].copy_from_slice(header);
    nonce[STREAM_HEADER_LEN..].copy_from_slice(&index.to_be_bytes());
    nonce
}

fn chunk_aad(index: u64, is_final: bool) -> [u8; 9] {
    let mut aad = [0u8; 9];
    aad[..8].copy_from_slice(&index.to_be_bytes());
    aad[8] = u8::from(is_final);
    aad
}

/// Encrypt a full attachment, returning the ciphertext and its SHA-256
/// digest.
///
/// An empty plaintext still produces one authenticated (empty) final
/// chunk, so truncation to zero bytes is detectable.
pub fn encrypt_stream(secrets: &StreamSecrets, plaintext: &[u8]) -> (Vec<u8>, [u8; 32]) {
    let chunk_count = plaintext.len().div_ceil(STREAM_CHUNK_SIZE).max(1);
    let mut ciphertext = Vec::with_capacity(plaintext.len() + chunk_count * TAG_LEN);

    let mut chunks = plaintext.chunks(STREAM_CHUNK_SIZE);
    for index in 0..chunk_count {
        let chunk = chunks.next().unwrap_or(b"");
        let index_u64 = index as u64;
        let is_final = index == chunk_count - 1;
        let sealed = seal_xchacha(
            &secrets.content_key,
            &chunk_nonce(&secrets.header, index_u64),
            chunk,
            &chunk_aad(index_u64, is_final),
        );
        ciphertext.extend_from_slice(&sealed);
    }

    let digest = Sha256::digest(&ciphertext).into();
    (ciphertext, digest)
}

/// Decrypt a full attachment, verifying the ciphertext digest first.
pub fn decrypt_stream(
    secrets: &StreamSecrets,
    ciphertext: &[u8],
    expected_digest: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let digest: [u8; 32] = Sha256::digest(ciphertext).into();
    if digest.as_slice() != expected_digest {
        return Err(CryptoError::DigestMismatch);
    }

    let sealed_chunk = STREAM_CHUNK_SIZE + TAG_LEN;
    if ciphertext.len() < TAG_LEN {
        return Err(CryptoError::DecryptionFailed);
    }

    let mut plaintext = Vec::with_capacity(ciphertext.len());
    let mut remaining = ciphertext;
    let mut index: u64 = 0;
    loop {
        let is_final = remaining.len() <= sealed_chunk;
        let (chunk, rest) =
            if is_final { (remaining, &[][..]) } else { remaining.split_at(sealed_chunk) };
        let opened = open_xchacha(
            &secrets.content_key,
            &chunk_nonce(&secrets.header, index),
            chunk,
            &chunk_aad(index, is_final),
        )?;
        plaintext.extend_from_slice(&opened);
        if is_final {
            return Ok(plaintext);
        }
        remaining = rest;
        index += 1;
    }
}
