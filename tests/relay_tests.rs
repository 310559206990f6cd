// Friend relay and proof issuer tests
// Rate limiting, fan-out isolation, and recipient-side verification

use std::sync::Arc;
use std::time::{Duration, Instant};
use stealth_sidecar::{
    attestation::MessageDigest,
    memnet::MemoryNetwork,
    proof::{Identity, LocalNullifierProver, NullifierLog, ProofProvider, RateLimitedProofIssuer},
    relay::{FriendNode, FriendRelay, RelayEnvelope, RelayInbox, SkipReason},
    Attestation, DefenseError, Epoch, SubnetId,
};

const GROUP_KEY: [u8; 32] = [7u8; 32];

fn issuer(limit: u32) -> RateLimitedProofIssuer {
    RateLimitedProofIssuer::new(
        Arc::new(LocalNullifierProver::new(GROUP_KEY)),
        Identity::from_secret([1u8; 32]),
        limit,
        Duration::from_secs(1),
    )
}

fn friends(n: usize) -> Vec<FriendNode> {
    (0..n)
        .map(|i| FriendNode {
            peer_id: format!("friend-{}", i),
            address: format!("/ip4/10.0.0.{}/udp/9000/quic-v1", i + 2),
            public_key: hex::encode([i as u8; 32]),
        })
        .collect()
}

fn attestation(tag: &str) -> Attestation {
    Attestation::new(7, SubnetId(40), tag.as_bytes().to_vec(), 0)
}

#[tokio::test]
async fn test_rate_limit_k_plus_one() {
    println!("🧪 Testing k+1 issuances in one epoch...");

    let k = 5;
    let issuer = issuer(k);
    let digest = MessageDigest::of(b"payload");
    let mut exceeded = 0;
    for i in 0..=k {
        match issuer.issue(&digest, Epoch(3)).await {
            Ok(_) => assert!(i < k, "call {} should have been refused", i + 1),
            Err(DefenseError::RateLimitExceeded { epoch, issued, limit }) => {
                exceeded += 1;
                assert_eq!(i, k, "only the (k+1)th call is refused");
                assert_eq!((epoch, issued, limit), (Epoch(3), k, k));
            }
            Err(e) => panic!("unexpected error {e}"),
        }
    }
    assert_eq!(exceeded, 1, "Exactly one RateLimitExceeded");
    assert_eq!(issuer.issued_in(Epoch(3)).await, k);

    println!("  Advancing to the next epoch...");
    assert!(issuer.issue(&digest, Epoch(4)).await.is_ok(), "Counter resets on a new epoch");
    assert_eq!(issuer.issued_in(Epoch(4)).await, 1);
    assert_eq!(issuer.issued_in(Epoch(3)).await, 0);
}

#[tokio::test]
async fn test_stale_epoch_rejected() {
    println!("🧪 Testing issuance for a past epoch...");

    let issuer = issuer(10);
    let digest = MessageDigest::of(b"x");
    issuer.issue(&digest, Epoch(9)).await.unwrap();
    let err = issuer.issue(&digest, Epoch(8)).await.unwrap_err();
    assert_eq!(err, DefenseError::StaleEpoch { requested: Epoch(8), current: Epoch(9) });
    assert!(!err.is_fatal());
    assert_eq!(issuer.issued_in(Epoch(9)).await, 1, "A stale request does not consume quota");
}

#[tokio::test]
async fn test_fan_out_isolates_unreachable_friend() {
    println!("🧪 Testing fan-out with one of three friends unreachable...");

    let net = Arc::new(MemoryNetwork::new());
    net.set_unreachable("friend-1");
    let relay = FriendRelay::new(friends(3), issuer(100), net.clone(), Duration::from_millis(500));

    let outcome = relay.relay(&attestation("a"), Epoch(1)).await;
    assert!(!outcome.is_skipped());
    assert_eq!(outcome.deliveries.len(), 3);
    assert_eq!(outcome.succeeded(), 2, "The other two friends still receive it");
    assert_eq!(outcome.failed(), 1, "Exactly one failure entry");
    assert_eq!(outcome.failures().next().unwrap().peer_id, "friend-1");

    let delivered: Vec<String> = net.pushes().into_iter().map(|p| p.peer_id).collect();
    assert!(delivered.contains(&"friend-0".to_string()) && delivered.contains(&"friend-2".to_string()));
    println!("✅ Failure stayed isolated to friend-1");
}

#[tokio::test]
async fn test_fan_out_is_concurrent_and_times_out() {
    println!("🧪 Testing concurrent dispatch and the per-friend timeout...");

    let net = Arc::new(MemoryNetwork::new());
    for f in ["friend-0", "friend-1", "friend-2"] {
        net.set_push_delay(f, Duration::from_millis(150));
    }
    net.set_push_delay("friend-3", Duration::from_secs(5));
    let relay = FriendRelay::new(friends(4), issuer(100), net.clone(), Duration::from_millis(400));

    let started = Instant::now();
    let outcome = relay.relay(&attestation("b"), Epoch(1)).await;
    let elapsed = started.elapsed();

    assert_eq!(outcome.succeeded(), 3);
    assert_eq!(outcome.failed(), 1, "The slow friend times out");
    assert!(elapsed < Duration::from_millis(1_000), "Pushes ran in parallel, took {:?}", elapsed);

    let pushes = net.pushes();
    let first = pushes.iter().map(|p| p.at).min().unwrap();
    let last = pushes.iter().map(|p| p.at).max().unwrap();
    assert!(last - first < Duration::from_millis(100), "Copies surface within one window");
}

#[tokio::test]
async fn test_empty_roster_and_rate_limited_skip() {
    println!("🧪 Testing the documented no-op and the rate-limit skip...");

    let net = Arc::new(MemoryNetwork::new());
    let empty = FriendRelay::new(Vec::new(), issuer(100), net.clone(), Duration::from_millis(100));
    let outcome = empty.relay(&attestation("c"), Epoch(1)).await;
    assert_eq!(outcome.skipped, Some(SkipReason::EmptyRoster));
    assert_eq!(empty.issuer().issued_in(Epoch(1)).await, 0, "No proof is spent on an empty roster");

    let limited = FriendRelay::new(friends(3), issuer(1), net.clone(), Duration::from_millis(100));
    assert!(!limited.relay(&attestation("d"), Epoch(1)).await.is_skipped());
    let second = limited.relay(&attestation("e"), Epoch(1)).await;
    assert_eq!(second.skipped, Some(SkipReason::RateLimited));
    assert!(second.deliveries.is_empty());
    assert_eq!(net.pushes().len(), 3, "Only the first attestation was pushed");
}

#[tokio::test]
async fn test_inbox_verifies_and_detects_replay() {
    println!("🧪 Testing recipient-side verification...");

    let net = Arc::new(MemoryNetwork::new());
    let relay = FriendRelay::new(friends(1), issuer(10), net.clone(), Duration::from_millis(100));
    relay.relay(&attestation("f"), Epoch(2)).await;
    let bytes = net.pushes()[0].payload.clone();

    let mut inbox = RelayInbox::new(NullifierLog::new(GROUP_KEY, 10), 64);
    let envelope = inbox.accept(&bytes, Epoch(2)).unwrap().expect("fresh envelope accepted");
    assert_eq!(envelope.payload, b"f".to_vec());
    assert!(inbox.accept(&bytes, Epoch(2)).unwrap().is_none(), "Duplicate dropped silently");

    // Same proof re-attached to a different message: signal binding fails.
    let mut forged = RelayEnvelope::decode(&bytes).unwrap();
    forged.payload = b"other".to_vec();
    forged.digest = MessageDigest::of(b"other");
    let err = inbox.accept(&forged.encode().unwrap(), Epoch(2)).unwrap_err();
    assert!(matches!(err, DefenseError::InvalidProof(_)));

    // Same nullifier on a fresh digest-consistent envelope: replay.
    let mut log = NullifierLog::new(GROUP_KEY, 10);
    let original = RelayEnvelope::decode(&bytes).unwrap();
    log.verify(&original.proof, &original.digest, Epoch(2)).unwrap();
    assert!(matches!(
        log.verify(&original.proof, &original.digest, Epoch(2)),
        Err(DefenseError::InvalidProof(_))
    ), "Reused nullifier is rejected");

    // Proofs from epoch E-1 are invalid in epoch E.
    let mut later = RelayInbox::new(NullifierLog::new(GROUP_KEY, 10), 64);
    assert!(matches!(later.accept(&bytes, Epoch(3)), Err(DefenseError::StaleEpoch { .. })));

    // Wrong group key.
    let mut outsider = RelayInbox::new(NullifierLog::new([0u8; 32], 10), 64);
    assert!(matches!(outsider.accept(&bytes, Epoch(2)), Err(DefenseError::InvalidProof(_))));
    println!("✅ Replay, stale and foreign proofs rejected");
}

#[tokio::test]
async fn test_recipient_enforces_quota_per_identity() {
    println!("🧪 Testing that one identity cannot exceed the quota at a recipient...");

    const LIMIT: u32 = 3;
    let prover = LocalNullifierProver::new(GROUP_KEY);
    let id = Identity::from_secret([4u8; 32]);
    let mut log = NullifierLog::new(GROUP_KEY, LIMIT);

    // A sender bypassing its own counter: indices 0..=LIMIT on distinct messages.
    let mut rejected = Vec::new();
    for i in 0..=LIMIT {
        let digest = MessageDigest::of(format!("msg-{}", i).as_bytes());
        let proof = prover.generate_proof(&id, &digest, Epoch(1), i).await.unwrap();
        if let Err(e) = log.verify(&proof, &digest, Epoch(1)) {
            assert!(matches!(e, DefenseError::InvalidProof(_)));
            rejected.push(i);
        }
    }
    assert_eq!(rejected, vec![LIMIT], "Exactly the over-quota proof is rejected");

    // Staying inside the index range means reusing a nullifier.
    let digest = MessageDigest::of(b"msg-again");
    let reused = prover.generate_proof(&id, &digest, Epoch(1), 0).await.unwrap();
    assert!(matches!(log.verify(&reused, &digest, Epoch(1)), Err(DefenseError::InvalidProof(_))));

    // Rewriting the index breaks the credential tag.
    let digest = MessageDigest::of(b"msg-forged");
    let mut forged = prover.generate_proof(&id, &digest, Epoch(1), LIMIT + 5).await.unwrap();
    forged.message_index = 1;
    assert!(matches!(log.verify(&forged, &digest, Epoch(1)), Err(DefenseError::InvalidProof(_))));
    println!("✅ {} of {} proofs accepted", LIMIT, LIMIT + 1);
}
