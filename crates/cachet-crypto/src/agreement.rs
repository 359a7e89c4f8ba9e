//! X3DH asynchronous key agreement.
//!
//! The initiator derives a shared secret from the recipient's published
//! bundle without the recipient being online; the recipient later derives
//! the same secret from the handshake material embedded in the first
//! message. When the bundle carries a post-quantum prekey, the kyber share
//! is mixed into the KDF input alongside the classical DH outputs (PQXDH
//! layout).
//!
//! Signature verification over the signed prekey happens here, before any
//! agreement runs. This is the single point at which a forged bundle is
//! rejected.

use hkdf::Hkdf;
use rand::{CryptoRng, RngCore};
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

use crate::error::CryptoError;
use crate::keys::{IdentityKeyPair, IdentityPublic, PreKeyPair};

/// Domain separator for the X3DH KDF.
const X3DH_INFO: &[u8] = b"cachet-x3dh";

/// Prefix of the KDF input, reserving the all-ones block for domain
/// separation from raw DH outputs.
const IKM_PREFIX: [u8; 32] = [0xFF; 32];

/// Initiator-side handshake output.
pub struct InitiatorHandshake {
    /// The derived shared secret, feeding the double ratchet root.
    pub shared_secret: [u8; 32],
    /// Ephemeral public key the responder needs to re-derive the secret.
    pub ephemeral_public: PublicKey,
}

impl std::fmt::Debug for InitiatorHandshake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InitiatorHandshake")
            .field("ephemeral_public", &self.ephemeral_public)
            .finish_non_exhaustive()
    }
}

/// Run the initiator side of X3DH against a fetched bundle.
///
/// Verifies the signed prekey's signature against the bundle's identity
/// key first and fails closed on mismatch.
pub fn x3dh_initiate<R: RngCore + CryptoRng>(
    rng: &mut R,
    our_identity: &IdentityKeyPair,
    their_identity: &IdentityPublic,
    their_signed_prekey: &PublicKey,
    their_signed_prekey_signature: &[u8],
    their_one_time_prekey: Option<&PublicKey>,
    kyber_share: Option<&[u8]>,
) -> Result<InitiatorHandshake, CryptoError> {
    their_identity.verify(their_signed_prekey.as_bytes(), their_signed_prekey_signature)?;

    let mut ephemeral_bytes = [0u8; 32];
    rng.fill_bytes(&mut ephemeral_bytes);
    let ephemeral = StaticSecret::from(ephemeral_bytes);
    let ephemeral_public = PublicKey::from(&ephemeral);

    let dh1 = our_identity.dh_secret.diffie_hellman(their_signed_prekey);
    let dh2 = ephemeral.diffie_hellman(&their_identity.dh);
    let dh3 = ephemeral.diffie_hellman(their_signed_prekey);
    let dh4 = their_one_time_prekey.map(|otk| ephemeral.diffie_hellman(otk));

    let shared_secret = derive_secret(
        dh1.as_bytes(),
        dh2.as_bytes(),
        dh3.as_bytes(),
        dh4.as_ref().map(|dh| dh.as_bytes().as_slice()),
        kyber_share,
    );

    Ok(InitiatorHandshake { shared_secret, ephemeral_public })
}

/// Run the responder side of X3DH from the material embedded in a
/// `PreKeyInit` message.
///
/// The responder uses its own private prekeys, so no signature check is
/// needed here; the keys came out of its own store.
pub fn x3dh_respond(
    our_identity: &IdentityKeyPair,
    our_signed_prekey: &PreKeyPair,
    our_one_time_prekey: Option<&PreKeyPair>,
    their_identity: &IdentityPublic,
    their_ephemeral: &PublicKey,
    kyber_share: Option<&[u8]>,
) -> [u8; 32] {
    let dh1 = our_signed_prekey.secret.diffie_hellman(&their_identity.dh);
    let dh2 = our_identity.dh_secret.diffie_hellman(their_ephemeral);
    let dh3 = our_signed_prekey.secret.diffie_hellman(their_ephemeral);
    let dh4 = our_one_time_prekey.map(|otk| otk.secret.diffie_hellman(their_ephemeral));

    derive_secret(
        dh1.as_bytes(),
        dh2.as_bytes(),
        dh3.as_bytes(),
        dh4.as_ref().map(|dh| dh.as_bytes().as_slice()),
        kyber_share,
    )
}

fn derive_secret(
    dh1: &[u8],
    dh2: &[u8],
    dh3: &[u8],
    dh4: Option<&[u8]>,
    kyber_share: Option<&[u8]>,
) -> [u8; 32] {
    let mut ikm = Vec::with_capacity(32 * 6);
    ikm.extend_from_slice(&IKM_PREFIX);
    ikm.extend_from_slice(dh1);
    ikm.extend_from_slice(dh2);
    ikm.extend_from_slice(dh3);
    if let Some(dh4) = dh4 {
        ikm.extend_from_slice(dh4);
    }
    if let Some(share) = kyber_share {
        ikm.extend_from_slice(share);
    }

    let hkdf = Hkdf::<Sha256>::new(Some(&[0u8; 32]), &ikm);
    let mut secret = [0u8; 32];
    let Ok(()) = hkdf.expand(X3DH_INFO, &mut secret) else {
        unreachable!("32 bytes is a valid HKDF-SHA256 output length");
    };
    ikm.zeroize();
    secret
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use rand::rngs::OsRng;

    use super::*;
    use crate::keys::SignedPreKeyPair;

    struct Responder {
        identity: IdentityKeyPair,
        signed_prekey: SignedPreKeyPair,
        one_time: PreKeyPair,
    }

    fn responder() -> Responder {
        let identity = IdentityKeyPair::generate(&mut OsRng);
        let signed_prekey = SignedPreKeyPair::generate(&mut OsRng, &identity, 1);
        let one_time = PreKeyPair::generate(&mut OsRng);
        Responder { identity, signed_prekey, one_time }
    }

    #[test]
    fn both_sides_derive_same_secret() {
        let initiator = IdentityKeyPair::generate(&mut OsRng);
        let bob = responder();

        let handshake = x3dh_initiate(
            &mut OsRng,
            &initiator,
            &bob.identity.public(),
            &bob.signed_prekey.pair.public,
            &bob.signed_prekey.signature,
            Some(&bob.one_time.public),
            None,
        )
        .unwrap();

        let responder_secret = x3dh_respond(
            &bob.identity,
            &bob.signed_prekey.pair,
            Some(&bob.one_time),
            &initiator.public(),
            &handshake.ephemeral_public,
            None,
        );

        assert_eq!(handshake.shared_secret, responder_secret);
    }

    #[test]
    fn agreement_works_without_one_time_prekey() {
        let initiator = IdentityKeyPair::generate(&mut OsRng);
        let bob = responder();

        let handshake = x3dh_initiate(
            &mut OsRng,
            &initiator,
            &bob.identity.public(),
            &bob.signed_prekey.pair.public,
            &bob.signed_prekey.signature,
            None,
            None,
        )
        .unwrap();

        let responder_secret = x3dh_respond(
            &bob.identity,
            &bob.signed_prekey.pair,
            None,
            &initiator.public(),
            &handshake.ephemeral_public,
            None,
        );

        assert_eq!(handshake.shared_secret, responder_secret);
    }

    #[test]
    fn kyber_share_changes_the_secret() {
        let initiator = IdentityKeyPair::generate(&mut OsRng);
        let bob = responder();

        // Deterministic ephemeral comparison requires deriving twice from
        // the responder side, which uses no randomness.
        let handshake = x3dh_initiate(
            &mut OsRng,
            &initiator,
            &bob.identity.public(),
            &bob.signed_prekey.pair.public,
            &bob.signed_prekey.signature,
            None,
            Some(b"kyber-share"),
        )
        .unwrap();

        let with_share = x3dh_respond(
            &bob.identity,
            &bob.signed_prekey.pair,
            None,
            &initiator.public(),
            &handshake.ephemeral_public,
            Some(b"kyber-share"),
        );
        let without_share = x3dh_respond(
            &bob.identity,
            &bob.signed_prekey.pair,
            None,
            &initiator.public(),
            &handshake.ephemeral_public,
            None,
        );

        assert_eq!(handshake.shared_secret, with_share);
        assert_ne!(with_share, without_share);
    }

    #[test]
    fn forged_signature_fails_closed() {
        let initiator = IdentityKeyPair::generate(&mut OsRng);
        let bob = responder();
        let mallory = IdentityKeyPair::generate(&mut OsRng);
        let forged = mallory.sign(bob.signed_prekey.pair.public.as_bytes());

        let result = x3dh_initiate(
            &mut OsRng,
            &initiator,
            &bob.identity.public(),
            &bob.signed_prekey.pair.public,
            &forged,
            None,
            None,
        );

        assert!(matches!(result, Err(CryptoError::InvalidSignature)));
    }

    #[test]
    fn different_ephemerals_produce_different_secrets() {
        let initiator = IdentityKeyPair::generate(&mut OsRng);
        let bob = responder();

        let run = || {
            x3dh_initiate(
                &mut OsRng,
                &initiator,
                &bob.identity.public(),
                &bob.signed_prekey.pair.public,
                &bob.signed_prekey.signature,
                None,
                None,
            )
            .unwrap()
        };

        assert_ne!(run().shared_secret, run().shared_secret);
    }
}
