//! Friend-mesh relay: every outgoing attestation is pushed to the whole roster
//! at once so the first-seen forwarder stops identifying the origin.

use crate::{
    attestation::{Attestation, MessageDigest},
    epoch::Epoch,
    error::{DefenseError, DefenseResult},
    network::GossipNetwork,
    proof::{NullifierLog, RateLimitedProofIssuer, RelayProof},
    subnet::SubnetId,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time;
use tracing::{debug, info, warn};

/// A trusted relay peer, loaded once from configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FriendNode {
    pub peer_id: String,
    pub address: String,
    /// Hex key of the friend's libp2p identity. Envelopes are authenticated by the
    /// shared group key, so this only pins who we push to.
    pub public_key: String,
}

/// What travels to each friend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayEnvelope {
    pub subnet: SubnetId,
    pub digest: MessageDigest,
    pub payload: Vec<u8>,
    pub proof: RelayProof,
}

impl RelayEnvelope {
    pub fn encode(&self) -> DefenseResult<Vec<u8>> {
        bincode::serialize(self).map_err(|e| DefenseError::InvalidProof(format!("envelope encode: {}", e)))
    }

    pub fn decode(bytes: &[u8]) -> DefenseResult<Self> {
        bincode::deserialize(bytes).map_err(|e| DefenseError::InvalidProof(format!("envelope decode: {}", e)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum SkipReason {
    Disabled,
    EmptyRoster,
    RateLimited,
    StaleEpoch,
    ProofUnavailable(String),
}

impl SkipReason {
    pub fn label(&self) -> &'static str {
        match self {
            SkipReason::Disabled => "disabled",
            SkipReason::EmptyRoster => "empty_roster",
            SkipReason::RateLimited => "rate_limited",
            SkipReason::StaleEpoch => "stale_epoch",
            SkipReason::ProofUnavailable(_) => "proof_unavailable",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FriendDelivery {
    pub peer_id: String,
    pub error: Option<String>,
    pub latency: Duration,
}

impl FriendDelivery {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RelayOutcome {
    pub digest: MessageDigest,
    pub epoch: Epoch,
    pub skipped: Option<SkipReason>,
    pub deliveries: Vec<FriendDelivery>,
}

impl RelayOutcome {
    pub fn skipped(digest: MessageDigest, epoch: Epoch, reason: SkipReason) -> Self {
        Self { digest, epoch, skipped: Some(reason), deliveries: Vec::new() }
    }

    pub fn is_skipped(&self) -> bool {
        self.skipped.is_some()
    }

    pub fn succeeded(&self) -> usize {
        self.deliveries.iter().filter(|d| d.succeeded()).count()
    }

    pub fn failed(&self) -> usize {
        self.deliveries.len() - self.succeeded()
    }

    pub fn failures(&self) -> impl Iterator<Item = &FriendDelivery> {
        self.deliveries.iter().filter(|d| !d.succeeded())
    }

    /// Slowest successful push, i.e. when the last copy reached its friend.
    pub fn max_latency(&self) -> Option<Duration> {
        self.deliveries.iter().filter(|d| d.succeeded()).map(|d| d.latency).max()
    }
}

pub struct FriendRelay {
    roster: Arc<[FriendNode]>,
    issuer: RateLimitedProofIssuer,
    network: Arc<dyn GossipNetwork>,
    push_timeout: Duration,
}

impl FriendRelay {
    pub fn new(
        roster: Vec<FriendNode>,
        issuer: RateLimitedProofIssuer,
        network: Arc<dyn GossipNetwork>,
        push_timeout: Duration,
    ) -> Self {
        if roster.is_empty() {
            info!("🫥 No friends configured; relay disabled, subnet shuffling only");
        } else if roster.len() < 3 {
            warn!("⚠️  Only {} friends configured; k-anonymity is weak below 3", roster.len());
        }
        Self { roster: roster.into(), issuer, network, push_timeout }
    }

    pub fn roster(&self) -> &[FriendNode] {
        &self.roster
    }

    pub fn issuer(&self) -> &RateLimitedProofIssuer {
        &self.issuer
    }

    /// Attach a fresh proof and push to every friend concurrently.
    ///
    /// Pushes run on their own tasks: a failure or timeout on one friend never
    /// affects the others, and dropping this future does not cancel pushes that
    /// were already dispatched.
    pub async fn relay(&self, attestation: &Attestation, epoch: Epoch) -> RelayOutcome {
        let digest = attestation.digest;
        if self.roster.is_empty() {
            return RelayOutcome::skipped(digest, epoch, SkipReason::EmptyRoster);
        }

        let proof = match self.issuer.issue(&digest, epoch).await {
            Ok(p) => p,
            Err(DefenseError::RateLimitExceeded { issued, limit, .. }) => {
                warn!("⏳ Relay skipped for {}: {}/{} proofs used in epoch {}", digest.short(), issued, limit, epoch);
                return RelayOutcome::skipped(digest, epoch, SkipReason::RateLimited);
            }
            Err(DefenseError::StaleEpoch { requested, current }) => {
                warn!("⏳ Relay skipped for {}: epoch {} is behind {}", digest.short(), requested, current);
                return RelayOutcome::skipped(digest, epoch, SkipReason::StaleEpoch);
            }
            Err(e) => {
                warn!("⚠️  Relay skipped for {}: {}", digest.short(), e);
                return RelayOutcome::skipped(digest, epoch, SkipReason::ProofUnavailable(e.to_string()));
            }
        };

        let envelope = RelayEnvelope {
            subnet: attestation.subnet,
            digest,
            payload: attestation.payload.clone(),
            proof,
        };
        let bytes = match envelope.encode() {
            Ok(b) => b,
            Err(e) => return RelayOutcome::skipped(digest, epoch, SkipReason::ProofUnavailable(e.to_string())),
        };

        let handles: Vec<_> = self
            .roster
            .iter()
            .cloned()
            .map(|friend| {
                let network = self.network.clone();
                let bytes = bytes.clone();
                let timeout = self.push_timeout;
                tokio::spawn(async move {
                    let started = Instant::now();
                    let error = match time::timeout(timeout, network.push_to_peer(&friend, bytes)).await {
                        Ok(Ok(())) => None,
                        Ok(Err(e)) => Some(e.to_string()),
                        Err(_) => Some(format!("push timed out after {:?}", timeout)),
                    };
                    FriendDelivery { peer_id: friend.peer_id, error, latency: started.elapsed() }
                })
            })
            .collect();

        let deliveries: Vec<FriendDelivery> = futures::future::join_all(handles)
            .await
            .into_iter()
            .zip(self.roster.iter())
            .map(|(joined, friend)| {
                joined.unwrap_or_else(|e| FriendDelivery {
                    peer_id: friend.peer_id.clone(),
                    error: Some(format!("push task failed: {}", e)),
                    latency: Duration::ZERO,
                })
            })
            .collect();

        let outcome = RelayOutcome { digest, epoch, skipped: None, deliveries };
        for failure in outcome.failures() {
            warn!("⚠️  Friend {} missed {}: {}", failure.peer_id, digest.short(), failure.error.as_deref().unwrap_or("unknown"));
        }
        debug!("📡 Relayed {} to {}/{} friends", digest.short(), outcome.succeeded(), self.roster.len());
        outcome
    }
}

/// Friend-side intake: drop duplicates, then verify the proof before republishing.
pub struct RelayInbox {
    verifier: NullifierLog,
    recent: VecDeque<MessageDigest>,
    seen: HashSet<MessageDigest>,
    capacity: usize,
}

impl RelayInbox {
    pub fn new(verifier: NullifierLog, capacity: usize) -> Self {
        Self { verifier, recent: VecDeque::new(), seen: HashSet::new(), capacity: capacity.max(1) }
    }

    /// `Ok(None)` for a duplicate, `Ok(Some(..))` for an envelope worth republishing.
    pub fn accept(&mut self, bytes: &[u8], current: Epoch) -> DefenseResult<Option<RelayEnvelope>> {
        let envelope = RelayEnvelope::decode(bytes)?;
        if self.seen.contains(&envelope.digest) {
            return Ok(None);
        }
        if MessageDigest::of(&envelope.payload) != envelope.digest {
            return Err(DefenseError::InvalidProof("payload does not match digest".into()));
        }
        self.verifier.verify(&envelope.proof, &envelope.digest, current)?;
        self.remember(envelope.digest);
        Ok(Some(envelope))
    }

    fn remember(&mut self, digest: MessageDigest) {
        if self.recent.len() >= self.capacity {
            if let Some(old) = self.recent.pop_front() {
                self.seen.remove(&old);
            }
        }
        self.recent.push_back(digest);
        self.seen.insert(digest);
    }
}
