//! Subnet juggler: joins `k` extra attestation subnets on top of the backbone
//! and redraws them every epoch, so a subscription says nothing durable about
//! which validators live behind a node.

use crate::{
    epoch::Epoch,
    error::{DefenseError, DefenseResult},
    network::GossipNetwork,
    subnet::{SubnetId, SubnetSet, SUBNET_COUNT},
};
use futures::future::join_all;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum JugglerState {
    Idle,
    Active { subnets: SubnetSet, epoch: Epoch },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SubnetOp {
    Subscribe,
    Unsubscribe,
}

impl SubnetOp {
    pub fn label(&self) -> &'static str {
        match self {
            SubnetOp::Subscribe => "subscribe",
            SubnetOp::Unsubscribe => "unsubscribe",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubnetFailure {
    pub op: SubnetOp,
    pub subnet: SubnetId,
    pub error: String,
}

/// What one enable or reshuffle actually did.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReshuffleReport {
    pub epoch: Epoch,
    /// The freshly drawn target set.
    pub target: SubnetSet,
    pub joined: Vec<SubnetId>,
    pub left: Vec<SubnetId>,
    pub failures: Vec<SubnetFailure>,
    pub cancelled: bool,
}

impl ReshuffleReport {
    fn new(epoch: Epoch, target: SubnetSet) -> Self {
        Self { epoch, target, joined: Vec::new(), left: Vec::new(), failures: Vec::new(), cancelled: false }
    }
}

pub struct SubnetJuggler {
    network: Arc<dyn GossipNetwork>,
    backbone: SubnetSet,
    extra_count: usize,
    call_timeout: Duration,
    rng: StdRng,
    state: JugglerState,
    // Extra subnets the network is actually subscribed to. Can differ from the
    // target set while a failed unsubscribe is waiting to be retried.
    joined: SubnetSet,
    cancel: Arc<AtomicBool>,
}

impl SubnetJuggler {
    pub fn new(
        network: Arc<dyn GossipNetwork>,
        backbone: SubnetSet,
        extra_count: usize,
        call_timeout: Duration,
    ) -> DefenseResult<Self> {
        if backbone.is_empty() {
            return Err(DefenseError::Configuration("backbone subnet set is empty".into()));
        }
        if extra_count == 0 {
            return Err(DefenseError::Configuration("extra subnet count must be at least 1".into()));
        }
        if backbone.len() + extra_count >= SUBNET_COUNT as usize {
            return Err(DefenseError::Configuration(format!(
                "{} backbone + {} extra subnets would cover all {}",
                backbone.len(),
                extra_count,
                SUBNET_COUNT
            )));
        }
        Ok(Self {
            network,
            backbone,
            extra_count,
            call_timeout,
            rng: StdRng::from_entropy(),
            state: JugglerState::Idle,
            joined: SubnetSet::new(),
            cancel: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Deterministic draws, for simulation and tests.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn backbone(&self) -> &SubnetSet {
        &self.backbone
    }

    pub fn extra_count(&self) -> usize {
        self.extra_count
    }

    pub fn state(&self) -> &JugglerState {
        &self.state
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state, JugglerState::Active { .. })
    }

    /// Extra subnets currently held on the network.
    pub fn joined(&self) -> &SubnetSet {
        &self.joined
    }

    /// Flag observed between the unsubscribe and subscribe phases of a reshuffle.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    /// Idle -> Active. A second call while active is a no-op.
    pub async fn enable(&mut self, epoch: Epoch) -> Option<ReshuffleReport> {
        if self.is_active() {
            debug!("🔀 Juggler already active; enable ignored");
            return None;
        }
        self.cancel.store(false, Ordering::SeqCst);
        info!("🔀 Subnet juggling enabled at epoch {} ({} extra subnets)", epoch, self.extra_count);
        Some(self.reshuffle(epoch).await)
    }

    /// Reshuffle for a new epoch. At most once per epoch; while idle this only
    /// retries unsubscribes that failed earlier.
    pub async fn on_epoch(&mut self, epoch: Epoch) -> Option<ReshuffleReport> {
        match &self.state {
            JugglerState::Idle => {
                if self.joined.is_empty() {
                    return None;
                }
                let mut report = ReshuffleReport::new(epoch, SubnetSet::new());
                self.leave_all(&mut report).await;
                Some(report)
            }
            JugglerState::Active { epoch: last, .. } if epoch <= *last => None,
            JugglerState::Active { .. } => Some(self.reshuffle(epoch).await),
        }
    }

    /// Active -> Idle. Leaves every extra subnet; the backbone is never touched.
    pub async fn disable(&mut self, epoch: Epoch) -> ReshuffleReport {
        self.state = JugglerState::Idle;
        let mut report = ReshuffleReport::new(epoch, SubnetSet::new());
        self.leave_all(&mut report).await;
        self.cancel.store(false, Ordering::SeqCst);
        info!("🔀 Subnet juggling disabled ({} extra subnets still pending removal)", self.joined.len());
        report
    }

    async fn leave_all(&mut self, report: &mut ReshuffleReport) {
        let to_leave: Vec<SubnetId> = self.joined.iter().copied().collect();
        self.apply(SubnetOp::Unsubscribe, to_leave, report).await;
    }

    async fn reshuffle(&mut self, epoch: Epoch) -> ReshuffleReport {
        let target = match SubnetSet::draw(self.extra_count, &self.backbone, &mut self.rng) {
            Ok(t) => t,
            Err(e) => {
                // Unreachable after construction-time validation; keep the old set.
                warn!("⚠️  Subnet draw failed: {}", e);
                return ReshuffleReport::new(epoch, self.joined.clone());
            }
        };
        let mut report = ReshuffleReport::new(epoch, target.clone());

        let to_leave: Vec<SubnetId> = self.joined.iter().filter(|s| !target.contains(s)).copied().collect();
        self.apply(SubnetOp::Unsubscribe, to_leave, &mut report).await;

        if self.cancel.load(Ordering::SeqCst) {
            report.cancelled = true;
            info!("🛑 Reshuffle for epoch {} cancelled after unsubscribe phase", epoch);
            return report;
        }

        let mut to_join = Vec::new();
        for s in target.iter().filter(|s| !self.joined.contains(s)) {
            // Held = backbone ∪ joined ∪ pending joins; one more must leave a subnet uncovered.
            let held = self.backbone.len() + self.joined.len() + to_join.len();
            if held + 1 >= SUBNET_COUNT as usize {
                warn!("🚧 Skipping subnet {}: joining would cover every subnet", s);
                report.failures.push(SubnetFailure {
                    op: SubnetOp::Subscribe,
                    subnet: *s,
                    error: DefenseError::Coverage(*s).to_string(),
                });
                continue;
            }
            to_join.push(*s);
        }
        self.apply(SubnetOp::Subscribe, to_join, &mut report).await;

        self.state = JugglerState::Active { subnets: target, epoch };
        info!(
            "🔀 Epoch {}: extra subnets {:?} (+{} / -{}, {} failed)",
            epoch,
            self.joined.ids(),
            report.joined.len(),
            report.left.len(),
            report.failures.len()
        );
        report
    }

    /// Run one kind of call against many subnets concurrently, each under the call timeout.
    async fn apply(&mut self, op: SubnetOp, subnets: Vec<SubnetId>, report: &mut ReshuffleReport) {
        if subnets.is_empty() {
            return;
        }
        let network = self.network.clone();
        let timeout = self.call_timeout;
        let calls = subnets.iter().map(|&s| {
            let network = network.clone();
            async move {
                let call = async {
                    match op {
                        SubnetOp::Subscribe => network.subscribe(s).await,
                        SubnetOp::Unsubscribe => network.unsubscribe(s).await,
                    }
                };
                let res = match time::timeout(timeout, call).await {
                    Ok(r) => r,
                    Err(_) => Err(DefenseError::TransientNetwork(format!("{} {} timed out", op.label(), s))),
                };
                (s, res)
            }
        });
        for (subnet, res) in join_all(calls).await {
            match res {
                Ok(()) => match op {
                    SubnetOp::Subscribe => {
                        self.joined.insert(subnet);
                        report.joined.push(subnet);
                    }
                    SubnetOp::Unsubscribe => {
                        self.joined.remove(&subnet);
                        report.left.push(subnet);
                    }
                },
                Err(e) => {
                    warn!("⚠️  {} subnet {} failed: {}", op.label(), subnet, e);
                    report.failures.push(SubnetFailure { op, subnet, error: e.to_string() });
                }
            }
        }
    }
}
