//! Symmetric chain ratchet deriving single-use message keys.
//!
//! Each direction of a session owns one chain. Advancing the chain derives
//! a message key from the current chain key and replaces the chain key with
//! a one-way successor, so compromising the current chain key never reveals
//! keys that were already handed out.

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::Zeroize;

use crate::error::CryptoError;

type HmacSha256 = Hmac<Sha256>;

/// Label deriving the successor chain key.
const CHAIN_LABEL: &[u8] = b"cachet-chain";

/// Label deriving the message key for the current counter.
const MESSAGE_LABEL: &[u8] = b"cachet-message";

/// Upper bound on how many counters a receiving chain may skip when
/// catching up with out-of-order delivery.
pub const MAX_SKIP: u32 = 1000;

/// A single-use message key.
///
/// Use once, then drop; the key bytes are zeroized on drop.
#[derive(Clone, Serialize, Deserialize)]
pub struct MessageKey {
    key: [u8; 32],
    counter: u32,
}

impl MessageKey {
    /// 32-byte AEAD key.
    pub fn key(&self) -> &[u8; 32] {
        &self.key
    }

    /// Chain position this key was derived at.
    pub fn counter(&self) -> u32 {
        self.counter
    }
}

impl Drop for MessageKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

impl std::fmt::Debug for MessageKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageKey").field("counter", &self.counter).finish_non_exhaustive()
    }
}

/// Forward-secure chain key.
///
/// `advance()` derives the message key for the current counter, replaces
/// the chain key with its one-way successor and increments the counter.
/// The old chain key is zeroized in place.
#[derive(Clone, Serialize, Deserialize)]
pub struct ChainKey {
    key: [u8; 32],
    counter: u32,
}

impl ChainKey {
    /// Start a chain from a 32-byte seed at counter zero.
    pub fn new(seed: [u8; 32]) -> Self {
        Self { key: seed, counter: 0 }
    }

    /// Current counter: the number of times the chain has advanced.
    pub fn counter(&self) -> u32 {
        self.counter
    }

    /// Derive the message key for the current counter and step the chain.
    pub fn advance(&mut self) -> Result<MessageKey, CryptoError> {
        if self.counter == u32::MAX {
            return Err(CryptoError::CounterOverflow { current: self.counter });
        }

        let message_key = derive(&self.key, MESSAGE_LABEL);
        let next = derive(&self.key, CHAIN_LABEL);

        self.key.zeroize();
        self.key = next;

        let counter = self.counter;
        self.counter += 1;

        Ok(MessageKey { key: message_key, counter })
    }

    /// Advance until the message key for `target` is produced, collecting
    /// the keys that were skipped over.
    ///
    /// Skipped keys belong to messages that may still arrive out of order;
    /// the caller stores them in a bounded window. Requests behind the
    /// current counter or more than [`MAX_SKIP`] ahead are refused.
    pub fn advance_to(
        &mut self,
        target: u32,
    ) -> Result<(MessageKey, Vec<MessageKey>), CryptoError> {
        if target < self.counter {
            return Err(CryptoError::CounterOutOfRange {
                current: self.counter,
                requested: target,
            });
        }
        if target - self.counter > MAX_SKIP {
            return Err(CryptoError::CounterOutOfRange {
                current: self.counter,
                requested: target,
            });
        }

        let mut skipped = Vec::new();
        while self.counter < target {
            skipped.push(self.advance()?);
        }
        let key = self.advance()?;
        Ok((key, skipped))
    }
}

impl Drop for ChainKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

impl std::fmt::Debug for ChainKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainKey").field("counter", &self.counter).finish_non_exhaustive()
    }
}

fn derive(key: &[u8; 32], label: &[u8]) -> [u8; 32] {
    let Ok(mut mac) = HmacSha256::new_from_slice(key) else {
        unreachable!("HMAC-SHA256 accepts any key size");
    };
    mac.update(label);
    let result = mac.finalize().into_bytes();
    let mut out = [0u8; 32];
    out.copy_from_slice(&result);
    out
}
