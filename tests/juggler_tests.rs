// Subnet juggler tests
// Cardinality, coverage and failure semantics of the per-epoch reshuffle

use std::collections::BTreeSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use stealth_sidecar::{
    juggler::JugglerState,
    memnet::{MemoryNetwork, SubscriptionOp},
    BackboneAssignment, DefenseError, Epoch, ModuloBackbone, SubnetId, SubnetJuggler, SubnetSet,
};

fn backbone() -> SubnetSet {
    ModuloBackbone::default().backbone_for(&[0])
}

fn juggler(net: &Arc<MemoryNetwork>, k: usize, seed: u64) -> SubnetJuggler {
    SubnetJuggler::new(net.clone(), backbone(), k, Duration::from_millis(200))
        .expect("valid juggler")
        .with_seed(seed)
}

#[tokio::test]
async fn test_cardinality_and_coverage_over_100_epochs() {
    println!("🧪 Testing k=8 juggling over 100 epochs...");

    let bb = backbone();
    let net = Arc::new(MemoryNetwork::with_backbone(&bb));
    let mut j = juggler(&net, 8, 42);

    let mut union: BTreeSet<SubnetId> = BTreeSet::new();
    j.enable(Epoch(0)).await.expect("first enable reshuffles");
    for e in 0..100u64 {
        if e > 0 {
            j.on_epoch(Epoch(e)).await.expect("new epoch reshuffles");
        }
        assert_eq!(j.joined().len(), 8, "|SubnetSet| must equal k in epoch {}", e);
        assert!(j.joined().iter().all(|s| !bb.contains(s)), "Extra subnets never include the backbone");
        assert_eq!(net.subscribed().len(), bb.len() + 8, "Network holds backbone plus k");
        union.extend(j.joined().iter().copied());
    }

    println!("  Visited {} of 62 non-backbone subnets", union.len());
    assert!(union.len() >= 50, "Independent draws should visit most of the space, got {}", union.len());
    assert!(net.peak_subscribed() < 64, "Never subscribed to all 64 subnets");
    assert!(net.peak_subscribed() <= bb.len() + 8, "Unsubscribe runs before subscribe");
    println!("✅ Cardinality held and {} subnets were covered", union.len());
}

#[tokio::test]
async fn test_enable_is_idempotent_and_epoch_guard() {
    println!("🧪 Testing enable idempotence and the per-epoch guard...");

    let net = Arc::new(MemoryNetwork::with_backbone(&backbone()));
    let mut j = juggler(&net, 8, 1);

    let first = j.enable(Epoch(5)).await.expect("first enable draws");
    let set = j.joined().clone();
    assert_eq!(first.target, set);

    assert!(j.enable(Epoch(5)).await.is_none(), "Second enable is a no-op");
    assert_eq!(j.joined(), &set, "Second enable keeps the same SubnetSet");

    assert!(j.on_epoch(Epoch(5)).await.is_none(), "No second reshuffle in the same epoch");
    assert!(j.on_epoch(Epoch(4)).await.is_none(), "Older epochs are ignored");
    assert_eq!(j.joined(), &set);

    let subscribes = net.subscription_log().iter().filter(|(op, _)| *op == SubscriptionOp::Subscribe).count();
    assert_eq!(subscribes, 8, "Only the first enable touched the network");

    assert!(j.on_epoch(Epoch(6)).await.is_some());
    match j.state() {
        JugglerState::Active { epoch, subnets } => {
            assert_eq!(*epoch, Epoch(6));
            assert_eq!(subnets.len(), 8);
        }
        JugglerState::Idle => panic!("juggler should be active"),
    }
}

#[tokio::test]
async fn test_disable_leaves_extras_and_keeps_backbone() {
    println!("🧪 Testing disable...");

    let bb = backbone();
    let net = Arc::new(MemoryNetwork::with_backbone(&bb));
    let mut j = juggler(&net, 6, 3);
    j.enable(Epoch(1)).await;
    let report = j.disable(Epoch(1)).await;

    assert_eq!(report.left.len(), 6);
    assert!(j.joined().is_empty());
    assert_eq!(net.subscribed(), bb, "Backbone subscriptions are untouched");
    assert_eq!(j.state(), &JugglerState::Idle);
    assert!(j.on_epoch(Epoch(2)).await.is_none(), "Idle juggler with nothing stale does nothing");
}

#[tokio::test]
async fn test_failed_unsubscribe_is_retried_next_epoch() {
    println!("🧪 Testing failure isolation and retry on the next boundary...");

    let bb = backbone();
    let net = Arc::new(MemoryNetwork::with_backbone(&bb));
    let mut j = juggler(&net, 4, 9);
    j.enable(Epoch(0)).await;

    let stuck = *j.joined().iter().next().unwrap();
    net.fail_subnet(stuck);

    let report = j.disable(Epoch(0)).await;
    assert_eq!(report.failures.len(), 1, "Exactly the failing subnet is reported");
    assert_eq!(report.failures[0].subnet, stuck);
    assert_eq!(report.left.len(), 3, "Other unsubscribes still went through");
    assert!(j.joined().contains(&stuck), "Stale subscription is remembered");

    net.heal_subnet(stuck);
    let retry = j.on_epoch(Epoch(1)).await.expect("idle juggler retries stale unsubscribes");
    assert_eq!(retry.left, vec![stuck]);
    assert!(j.joined().is_empty());
    assert_eq!(net.subscribed(), bb);
    println!("✅ Stale subnet {} cleaned up on the next epoch", stuck);
}

#[tokio::test]
async fn test_failed_subscribe_degrades_without_crashing() {
    println!("🧪 Testing a subscribe failure during reshuffle...");

    let net = Arc::new(MemoryNetwork::with_backbone(&backbone()));
    for s in 2..64u8 {
        net.fail_subnet(SubnetId(s));
    }
    let mut j = juggler(&net, 8, 11);
    let report = j.enable(Epoch(0)).await.unwrap();
    assert_eq!(report.failures.len(), 8);
    assert!(j.joined().is_empty(), "Nothing joined, nothing crashed");
    assert!(j.is_active(), "The juggler is still active and will retry next epoch");

    for s in 2..64u8 {
        net.heal_subnet(SubnetId(s));
    }
    j.on_epoch(Epoch(1)).await.unwrap();
    assert_eq!(j.joined().len(), 8);
}

#[tokio::test]
async fn test_cancel_stops_between_phases() {
    println!("🧪 Testing cancellation between unsubscribe and subscribe phases...");

    let net = Arc::new(MemoryNetwork::with_backbone(&backbone()));
    let mut j = juggler(&net, 8, 5);
    j.enable(Epoch(0)).await;
    let before = j.joined().clone();
    let subscribes_before = net.subscription_log().iter().filter(|(op, _)| *op == SubscriptionOp::Subscribe).count();

    // What disable() raises while a reshuffle is running.
    let cancel = j.cancel_handle();
    cancel.store(true, Ordering::SeqCst);
    let report = j.on_epoch(Epoch(1)).await.unwrap();
    assert!(report.cancelled);
    assert!(report.joined.is_empty(), "No subscribe after cancellation");
    assert!(j.joined().iter().all(|s| before.contains(s)), "Only previously joined subnets remain");
    let subscribes_after = net.subscription_log().iter().filter(|(op, _)| *op == SubscriptionOp::Subscribe).count();
    assert_eq!(subscribes_before, subscribes_after);

    let report = j.disable(Epoch(1)).await;
    assert!(report.failures.is_empty());
    assert!(j.joined().is_empty(), "Disable leaves a consistent, empty extra set");
    assert!(!cancel.load(Ordering::SeqCst), "Flag is cleared once disable completes");
}

#[tokio::test]
async fn test_configuration_rejected() {
    println!("🧪 Testing configuration errors...");

    let net = Arc::new(MemoryNetwork::new());
    let bb = backbone();
    assert!(matches!(
        SubnetJuggler::new(net.clone(), SubnetSet::new(), 8, Duration::from_secs(1)),
        Err(DefenseError::Configuration(_))
    ), "Empty backbone is fatal");
    assert!(matches!(
        SubnetJuggler::new(net.clone(), bb.clone(), 0, Duration::from_secs(1)),
        Err(DefenseError::Configuration(_))
    ));
    assert!(matches!(
        SubnetJuggler::new(net.clone(), bb.clone(), 62, Duration::from_secs(1)),
        Err(DefenseError::Configuration(_))
    ), "backbone + k = 64 would cover everything");
    assert!(SubnetJuggler::new(net, bb, 61, Duration::from_secs(1)).is_ok(), "63 subnets is the maximum");
}

#[tokio::test]
async fn test_maximum_k_never_covers_all_subnets() {
    println!("🧪 Testing the coverage invariant at the largest legal k...");

    let bb = backbone();
    let net = Arc::new(MemoryNetwork::with_backbone(&bb));
    let mut j = juggler(&net, 61, 13);
    j.enable(Epoch(0)).await;
    for e in 1..20 {
        j.on_epoch(Epoch(e)).await;
        assert_eq!(j.joined().len(), 61);
        assert!(net.subscribed().len() < 64);
    }
    assert!(net.peak_subscribed() < 64, "peak {}", net.peak_subscribed());
}
