//! Property-based tests for the ratchet, the attachment stream cipher and
//! safety numbers: invariants that must hold for arbitrary message orders,
//! payload sizes and identities.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use cachet_crypto::keys::{IdentityKeyPair, SignedPreKeyPair};
use cachet_crypto::ratchet::SessionState;
use cachet_crypto::stream::{STREAM_CHUNK_SIZE, StreamSecrets, decrypt_stream, encrypt_stream};
use cachet_crypto::{safety_number, x3dh_initiate, x3dh_respond};
use proptest::prelude::*;
use rand::SeedableRng;
use rand::rngs::StdRng;

fn session_pair(rng: &mut StdRng) -> (SessionState, SessionState) {
    let alice_identity = IdentityKeyPair::generate(rng);
    let bob_identity = IdentityKeyPair::generate(rng);
    let bob_spk = SignedPreKeyPair::generate(rng, &bob_identity, 1);

    let handshake = x3dh_initiate(
        rng,
        &alice_identity,
        &bob_identity.public(),
        &bob_spk.pair.public,
        &bob_spk.signature,
        None,
        None,
    )
    .unwrap();
    let alice = SessionState::initiator(rng, handshake.shared_secret, &bob_spk.pair.public);

    let bob_secret = x3dh_respond(
        &bob_identity,
        &bob_spk.pair,
        None,
        &alice_identity.public(),
        &handshake.ephemeral_public,
        None,
    );
    let bob = SessionState::responder(bob_secret, &bob_spk.pair);
    (alice, bob)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Every plaintext size, including empty and exact chunk multiples,
    /// survives the stream cipher roundtrip.
    #[test]
    fn stream_roundtrip_any_size(
        len in 0usize..(3 * STREAM_CHUNK_SIZE + 17),
        seed in any::<u64>(),
    ) {
        let mut rng = StdRng::seed_from_u64(seed);
        let secrets = StreamSecrets::generate(&mut rng);
        let plaintext: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();

        let (ciphertext, digest) = encrypt_stream(&secrets, &plaintext);
        prop_assert_eq!(decrypt_stream(&secrets, &ciphertext, &digest).unwrap(), plaintext);
    }

    /// A batch of messages delivered in any order all decrypt, through the
    /// skipped-key window.
    #[test]
    fn shuffled_delivery_decrypts_everything(
        order in (1usize..=12).prop_flat_map(|n| Just((0..n).collect::<Vec<usize>>()).prop_shuffle()),
        seed in any::<u64>(),
    ) {
        let mut rng = StdRng::seed_from_u64(seed);
        let (mut alice, mut bob) = session_pair(&mut rng);

        let mut messages = Vec::new();
        for i in 0..order.len() {
            let (next, msg) = alice.encrypt(&mut rng, format!("m{i}").as_bytes(), b"").unwrap();
            alice = next;
            messages.push(msg);
        }

        for &i in &order {
            let (next, plaintext) = bob.decrypt(&mut rng, &messages[i], b"").unwrap();
            bob = next;
            prop_assert_eq!(plaintext, format!("m{i}").into_bytes());
        }
    }

    /// Once the responder has received the opening message, any sequence of
    /// direction changes keeps both ratchets in sync.
    #[test]
    fn any_direction_sequence_stays_in_sync(
        directions in proptest::collection::vec(any::<bool>(), 0..20),
        seed in any::<u64>(),
    ) {
        let mut rng = StdRng::seed_from_u64(seed);
        let (mut alice, mut bob) = session_pair(&mut rng);

        let (a, opening) = alice.encrypt(&mut rng, b"opening", b"").unwrap();
        alice = a;
        let (b, plaintext) = bob.decrypt(&mut rng, &opening, b"").unwrap();
        bob = b;
        prop_assert_eq!(plaintext, b"opening".to_vec());

        for (i, alice_sends) in directions.iter().enumerate() {
            let body = format!("turn {i}");
            let (sender, receiver) =
                if *alice_sends { (&mut alice, &mut bob) } else { (&mut bob, &mut alice) };
            let (next, msg) = sender.encrypt(&mut rng, body.as_bytes(), b"").unwrap();
            *sender = next;
            let (next, plaintext) = receiver.decrypt(&mut rng, &msg, b"").unwrap();
            *receiver = next;
            prop_assert_eq!(plaintext, body.into_bytes());
        }
    }

    /// Safety numbers are symmetric and always render as twelve
    /// five-digit groups.
    #[test]
    fn safety_number_symmetric_and_formatted(
        seed in any::<u64>(),
        user_a in any::<u64>(),
        user_b in any::<u64>(),
    ) {
        let mut rng = StdRng::seed_from_u64(seed);
        let a = IdentityKeyPair::generate(&mut rng).public().to_bytes();
        let b = IdentityKeyPair::generate(&mut rng).public().to_bytes();

        let ours = safety_number(&a, user_a, &b, user_b);
        let theirs = safety_number(&b, user_b, &a, user_a);
        prop_assert_eq!(&ours, &theirs);

        let groups: Vec<&str> = ours.split(' ').collect();
        prop_assert_eq!(groups.len(), 12);
        prop_assert!(
            groups.iter().all(|g| g.len() == 5 && g.chars().all(|c| c.is_ascii_digit()))
        );
    }
}
