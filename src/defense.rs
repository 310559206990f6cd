//! Defense orchestrator: the one control surface over the juggler and the relay.
//!
//! Enable, disable and epoch ticks all funnel through the same juggler lock, so
//! a manual command can never race an epoch-driven reshuffle.

use crate::{
    attestation::Attestation,
    config::Config,
    epoch::{Epoch, EpochClock, EpochWatcher, TimeSource},
    error::DefenseResult,
    juggler::{ReshuffleReport, SubnetJuggler},
    metrics::MetricsSink,
    network::GossipNetwork,
    proof::{Identity, LocalNullifierProver, RateLimitedProofIssuer},
    relay::{FriendRelay, RelayEnvelope, RelayInbox, RelayOutcome, SkipReason},
    subnet::SubnetSet,
};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DefenseStatus {
    pub active: bool,
    pub current_subnets: SubnetSet,
    pub epoch: Epoch,
    pub backbone: SubnetSet,
    pub friends: usize,
}

pub struct DefenseOrchestrator {
    clock: EpochClock,
    time: Arc<dyn TimeSource>,
    network: Arc<dyn GossipNetwork>,
    juggler: Mutex<SubnetJuggler>,
    cancel: Arc<AtomicBool>,
    relay: FriendRelay,
    enabled: AtomicBool,
    metrics: MetricsSink,
    fork_digest: String,
    poll_interval: Duration,
}

impl DefenseOrchestrator {
    pub fn new(
        clock: EpochClock,
        time: Arc<dyn TimeSource>,
        network: Arc<dyn GossipNetwork>,
        juggler: SubnetJuggler,
        relay: FriendRelay,
        metrics: MetricsSink,
        fork_digest: impl Into<String>,
    ) -> Self {
        let cancel = juggler.cancel_handle();
        Self {
            poll_interval: clock.slot_duration(),
            clock,
            time,
            network,
            juggler: Mutex::new(juggler),
            cancel,
            relay,
            enabled: AtomicBool::new(false),
            metrics,
            fork_digest: fork_digest.into(),
        }
    }

    /// Wire every component from a validated configuration.
    ///
    /// # Errors
    /// * `DefenseError::Configuration` for anything that must halt startup.
    pub fn from_config(
        cfg: &Config,
        network: Arc<dyn GossipNetwork>,
        time: Arc<dyn TimeSource>,
        metrics: MetricsSink,
    ) -> DefenseResult<Self> {
        cfg.validate()?;
        let clock = EpochClock::new(
            Duration::from_secs(cfg.clock.genesis_unix),
            Duration::from_secs(cfg.clock.seconds_per_slot),
            cfg.clock.slots_per_epoch,
        )?;
        let juggler = SubnetJuggler::new(
            network.clone(),
            cfg.backbone_set()?,
            cfg.juggler.extra_subnets,
            cfg.juggler.call_timeout(),
        )?;
        let identity = match cfg.relay.identity_secret_bytes()? {
            Some(secret) => Identity::from_secret(secret),
            None => Identity::random(),
        };
        debug!("🔑 Relay identity {:?}", identity);
        // No key means no friends (checked by validate); proofs are never sent then.
        let group_key = match cfg.relay.group_key_bytes()? {
            Some(key) => key,
            None => Identity::random().commitment(),
        };
        let issuer = RateLimitedProofIssuer::new(
            Arc::new(LocalNullifierProver::new(group_key)),
            identity,
            cfg.relay.rate_limit_per_epoch,
            cfg.relay.proof_timeout(),
        );
        let relay = FriendRelay::new(cfg.relay.friends.clone(), issuer, network.clone(), cfg.relay.push_timeout());
        Ok(Self::new(clock, time, network, juggler, relay, metrics, cfg.net.fork_digest.clone())
            .with_poll_interval(cfg.juggler.poll_interval()))
    }

    pub fn with_poll_interval(mut self, poll: Duration) -> Self {
        self.poll_interval = poll;
        self
    }

    pub fn current_epoch(&self) -> Epoch {
        self.clock.epoch_at(self.time.now())
    }

    pub fn metrics(&self) -> &MetricsSink {
        &self.metrics
    }

    pub fn relay(&self) -> &FriendRelay {
        &self.relay
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Turn on both defenses. Enabling twice in one epoch keeps the first draw.
    pub async fn enable(&self) -> DefenseStatus {
        let epoch = self.current_epoch();
        {
            // The flag flips under the juggler lock so it always agrees with the juggler state.
            let mut juggler = self.juggler.lock().await;
            self.enabled.store(true, Ordering::SeqCst);
            let started = Instant::now();
            if let Some(report) = juggler.enable(epoch).await {
                self.record_reshuffle(&report, juggler.joined().len(), started.elapsed());
            }
        }
        info!("🛡️  Defense enabled at epoch {}", epoch);
        self.status().await
    }

    /// Turn off both defenses. An in-flight reshuffle stops after its unsubscribe
    /// phase; friend pushes already dispatched keep running.
    pub async fn disable(&self) -> DefenseStatus {
        self.cancel.store(true, Ordering::SeqCst);
        let epoch = self.current_epoch();
        {
            let mut juggler = self.juggler.lock().await;
            self.enabled.store(false, Ordering::SeqCst);
            let started = Instant::now();
            let report = juggler.disable(epoch).await;
            self.record_reshuffle(&report, juggler.joined().len(), started.elapsed());
        }
        info!("🛡️  Defense disabled at epoch {}", epoch);
        self.status().await
    }

    pub async fn status(&self) -> DefenseStatus {
        let juggler = self.juggler.lock().await;
        DefenseStatus {
            active: self.is_enabled() && juggler.is_active(),
            current_subnets: juggler.joined().clone(),
            epoch: self.current_epoch(),
            backbone: juggler.backbone().clone(),
            friends: self.relay.roster().len(),
        }
    }

    /// Epoch-boundary hook. Safe to call repeatedly with the same epoch.
    pub async fn on_epoch(&self, epoch: Epoch) -> Option<ReshuffleReport> {
        self.metrics.current_epoch.set(epoch.0 as i64);
        let mut juggler = self.juggler.lock().await;
        let started = Instant::now();
        let report = juggler.on_epoch(epoch).await?;
        self.record_reshuffle(&report, juggler.joined().len(), started.elapsed());
        Some(report)
    }

    /// Publish on the attestation's own subnet and, when enabled, relay through
    /// the friend mesh at the same time. Publication never waits on the relay's
    /// outcome and a relay failure never blocks publication.
    pub async fn on_attestation(&self, attestation: Attestation) -> RelayOutcome {
        let epoch = self.current_epoch();
        let topic = attestation.subnet.topic(&self.fork_digest);

        let publish = self.network.publish(&topic, attestation.payload.clone());
        let relay = async {
            if self.is_enabled() {
                self.relay.relay(&attestation, epoch).await
            } else {
                RelayOutcome::skipped(attestation.digest, epoch, SkipReason::Disabled)
            }
        };
        let (published, outcome) = tokio::join!(publish, relay);

        if let Err(e) = published {
            warn!("⚠️  Publish of {} on subnet {} failed: {}", attestation.digest.short(), attestation.subnet, e);
        }
        self.record_relay(&outcome);
        outcome
    }

    /// Friend-side path: verify an envelope pushed to us and republish it on its subnet.
    pub async fn accept_relayed(&self, inbox: &mut RelayInbox, bytes: &[u8]) -> Option<RelayEnvelope> {
        let epoch = self.current_epoch();
        match inbox.accept(bytes, epoch) {
            Ok(Some(envelope)) => {
                let topic = envelope.subnet.topic(&self.fork_digest);
                if let Err(e) = self.network.publish(&topic, envelope.payload.clone()).await {
                    warn!("⚠️  Republish of relayed {} failed: {}", envelope.digest.short(), e);
                }
                debug!("📨 Republished relayed {} on subnet {}", envelope.digest.short(), envelope.subnet);
                Some(envelope)
            }
            Ok(None) => {
                debug!("🔁 Duplicate relay envelope dropped");
                None
            }
            Err(e) => {
                self.metrics.proofs_rejected.with_label_values(&[e.kind()]).inc();
                warn!("🚫 Rejected relay envelope: {}", e);
                None
            }
        }
    }

    /// Drive `on_epoch` from the clock until `shutdown` fires.
    pub fn spawn(self: Arc<Self>, shutdown: &broadcast::Sender<()>) -> JoinHandle<()> {
        let watcher = EpochWatcher::new(self.clock, self.time.clone(), self.poll_interval);
        let mut epochs = watcher.subscribe();
        watcher.spawn(shutdown.subscribe());
        let mut stop = shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.recv() => break,
                    next = epochs.recv() => match next {
                        Ok(epoch) => {
                            let _ = self.on_epoch(epoch).await;
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!("⏱️  Epoch ticker lagged by {} epochs", n);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        })
    }

    fn record_reshuffle(&self, report: &ReshuffleReport, held: usize, took: Duration) {
        self.metrics.observe_reshuffle(took);
        self.metrics.subnets_joined.inc_by(report.joined.len() as u64);
        self.metrics.subnets_left.inc_by(report.left.len() as u64);
        for failure in &report.failures {
            self.metrics.subnet_failures.with_label_values(&[failure.op.label()]).inc();
        }
        if !report.target.is_empty() && !report.cancelled {
            self.metrics.reshuffles.inc();
        }
        self.metrics.current_extra_subnets.set(held as i64);
    }

    fn record_relay(&self, outcome: &RelayOutcome) {
        if let Some(reason) = &outcome.skipped {
            self.metrics.relay_skipped.with_label_values(&[reason.label()]).inc();
            return;
        }
        self.metrics.proofs_issued.inc();
        self.metrics.relay_attempted.inc_by(outcome.deliveries.len() as u64);
        self.metrics.relay_succeeded.inc_by(outcome.succeeded() as u64);
        self.metrics.relay_failed.inc_by(outcome.failed() as u64);
        if let Some(latency) = outcome.max_latency() {
            self.metrics.observe_relay_latency(latency);
        }
    }
}
