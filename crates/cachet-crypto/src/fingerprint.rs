//! Safety-number fingerprints for out-of-band identity verification.
//!
//! Each side of a conversation contributes 30 decimal digits derived from
//! its identity key and user id by iterated hashing. The two halves are
//! sorted before concatenation, so both participants compute the same
//! 60-digit string and can compare it aloud or by QR scan.

use sha2::{Digest, Sha256};

/// Iterations of the hash chain per side. Slows brute-force search for an
/// identity key colliding into a target fingerprint.
const ITERATIONS: usize = 5200;

/// Fingerprint format version, mixed into the first hash input.
const VERSION: [u8; 2] = [0, 1];

/// Compute the 60-digit safety number for a conversation.
///
/// Symmetric in its arguments: both participants get the same string
/// regardless of which side they pass as "local".
pub fn safety_number(
    local_identity: &[u8],
    local_user_id: u64,
    remote_identity: &[u8],
    remote_user_id: u64,
) -> String {
    let local = displayable_half(local_identity, local_user_id);
    let remote = displayable_half(remote_identity, remote_user_id);

    let (first, second) = if local <= remote { (local, remote) } else { (remote, local) };

    let mut out = String::with_capacity(71);
    for (i, chunk) in first.chunks(5).chain(second.chunks(5)).enumerate() {
        if i > 0 {
            out.push(' ');
        }
        for digit in chunk {
            out.push(char::from(b'0' + digit));
        }
    }
    out
}

/// One side's 30 digits, as raw digit values.
fn displayable_half(identity: &[u8], user_id: u64) -> Vec<u8> {
    let mut hash = {
        let mut hasher = Sha256::new();
        hasher.update(VERSION);
        hasher.update(identity);
        hasher.update(user_id.to_be_bytes());
        hasher.finalize()
    };

    for _ in 1..ITERATIONS {
        let mut hasher = Sha256::new();
        hasher.update(hash);
        hasher.update(identity);
        hash = hasher.finalize();
    }

    // Six groups of five digits, each group from five hash bytes.
    let mut digits = Vec::with_capacity(30);
    for group in hash[..30].chunks(5) {
        let mut value: u64 = 0;
        for byte in group {
            value = (value << 8) | u64::from(*byte);
        }
        let group_digits = value % 100_000;
        for place in [10_000, 1_000, 100, 10, 1] {
            digits.push(u8::try_from(group_digits / place % 10).unwrap_or(0));
        }
    }
    digits
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn symmetric_between_participants() {
        let alice = safety_number(&[1u8; 64], 10, &[2u8; 64], 20);
        let bob = safety_number(&[2u8; 64], 20, &[1u8; 64], 10);
        assert_eq!(alice, bob);
    }

    #[test]
    fn sixty_digits_in_groups_of_five() {
        let number = safety_number(&[1u8; 64], 10, &[2u8; 64], 20);
        let groups: Vec<&str> = number.split(' ').collect();
        assert_eq!(groups.len(), 12);
        for group in groups {
            assert_eq!(group.len(), 5);
            assert!(group.chars().all(|c| c.is_ascii_digit()));
        }
    }

    #[test]
    fn identity_change_changes_the_number() {
        let before = safety_number(&[1u8; 64], 10, &[2u8; 64], 20);
        let after = safety_number(&[1u8; 64], 10, &[3u8; 64], 20);
        assert_ne!(before, after);
    }

    #[test]
    fn user_id_is_bound_in() {
        let a = safety_number(&[1u8; 64], 10, &[2u8; 64], 20);
        let b = safety_number(&[1u8; 64], 11, &[2u8; 64], 20);
        assert_ne!(a, b);
    }

    #[test]
    fn deterministic() {
        let a = safety_number(&[7u8; 64], 1, &[8u8; 64], 2);
        let b = safety_number(&[7u8; 64], 1, &[8u8; 64], 2);
        assert_eq!(a, b);
    }
}
