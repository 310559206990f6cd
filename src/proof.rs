//! Rate-limiting nullifier proofs.
//!
//! The issuer is only an epoch-scoped counting and validation wrapper; proof
//! construction belongs to a [`ProofProvider`]. [`LocalNullifierProver`] is a
//! keyed-BLAKE3 credential scheme: every member of the mesh holds the same group
//! key, so a valid tag shows "some member issued this" and nothing more.
//!
//! Nullifiers are `H(secret, epoch, message_index)`. The index travels in the
//! proof and is covered by the tag, and [`NullifierLog`] only accepts indices
//! below the mesh's per-epoch limit. A member that exceeds its quota has to
//! repeat an index, which repeats a nullifier, which the log rejects.
//!
//! The tag is symmetric, so a recipient cannot check that a nullifier was
//! derived from the sender's own secret; the quota holds against members that
//! run this prover, not against one that forges nullifiers with the group key.

use crate::attestation::MessageDigest;
use crate::epoch::Epoch;
use crate::error::{DefenseError, DefenseResult};
use async_trait::async_trait;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

const NULLIFIER_CONTEXT: &str = "stealth-sidecar 2024 relay nullifier";
const COMMITMENT_CONTEXT: &str = "stealth-sidecar 2024 identity commitment";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayProof {
    pub nullifier: [u8; 32],
    pub epoch: Epoch,
    pub message_index: u32,
    pub signal_hash: MessageDigest,
    pub proof: Vec<u8>,
}

/// Per-node secret from which nullifiers are derived.
#[derive(Clone)]
pub struct Identity {
    secret: [u8; 32],
}

impl Identity {
    pub fn from_secret(secret: [u8; 32]) -> Self {
        Self { secret }
    }

    pub fn random() -> Self {
        let mut secret = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut secret);
        Self { secret }
    }

    pub fn commitment(&self) -> [u8; 32] {
        *blake3::Hasher::new_derive_key(COMMITMENT_CONTEXT)
            .update(&self.secret)
            .finalize()
            .as_bytes()
    }

    fn nullifier(&self, epoch: Epoch, message_index: u32) -> [u8; 32] {
        let key = blake3::derive_key(NULLIFIER_CONTEXT, &self.secret);
        let mut input = [0u8; 12];
        input[..8].copy_from_slice(&epoch.0.to_le_bytes());
        input[8..].copy_from_slice(&message_index.to_le_bytes());
        *blake3::keyed_hash(&key, &input).as_bytes()
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identity(commitment={})", hex::encode(&self.commitment()[..6]))
    }
}

/// Credential/proof collaborator.
#[async_trait]
pub trait ProofProvider: Send + Sync {
    async fn generate_proof(
        &self,
        identity: &Identity,
        digest: &MessageDigest,
        epoch: Epoch,
        message_index: u32,
    ) -> DefenseResult<RelayProof>;
}

#[derive(Clone)]
pub struct LocalNullifierProver {
    group_key: [u8; 32],
}

impl LocalNullifierProver {
    pub fn new(group_key: [u8; 32]) -> Self {
        Self { group_key }
    }
}

fn credential_tag(
    group_key: &[u8; 32],
    nullifier: &[u8; 32],
    epoch: Epoch,
    message_index: u32,
    signal: &MessageDigest,
) -> [u8; 32] {
    let mut h = blake3::Hasher::new_keyed(group_key);
    h.update(nullifier);
    h.update(&epoch.0.to_le_bytes());
    h.update(&message_index.to_le_bytes());
    h.update(signal.as_bytes());
    *h.finalize().as_bytes()
}

#[async_trait]
impl ProofProvider for LocalNullifierProver {
    async fn generate_proof(
        &self,
        identity: &Identity,
        digest: &MessageDigest,
        epoch: Epoch,
        message_index: u32,
    ) -> DefenseResult<RelayProof> {
        let nullifier = identity.nullifier(epoch, message_index);
        let tag = credential_tag(&self.group_key, &nullifier, epoch, message_index, digest);
        Ok(RelayProof { nullifier, epoch, message_index, signal_hash: *digest, proof: tag.to_vec() })
    }
}

#[derive(Debug, Default)]
struct IssuerState {
    epoch: Option<Epoch>,
    issued: u32,
}

/// Hands out at most `limit` proofs per epoch for one identity.
pub struct RateLimitedProofIssuer {
    provider: Arc<dyn ProofProvider>,
    identity: Identity,
    limit: u32,
    timeout: Duration,
    // Held across the provider call so concurrent relays never share a message index.
    state: Mutex<IssuerState>,
}

impl RateLimitedProofIssuer {
    pub fn new(provider: Arc<dyn ProofProvider>, identity: Identity, limit: u32, timeout: Duration) -> Self {
        Self { provider, identity, limit, timeout, state: Mutex::new(IssuerState::default()) }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub async fn issued_in(&self, epoch: Epoch) -> u32 {
        let st = self.state.lock().await;
        if st.epoch == Some(epoch) { st.issued } else { 0 }
    }

    pub async fn issue(&self, digest: &MessageDigest, epoch: Epoch) -> DefenseResult<RelayProof> {
        let mut st = self.state.lock().await;
        match st.epoch {
            Some(current) if epoch < current => {
                return Err(DefenseError::StaleEpoch { requested: epoch, current });
            }
            Some(current) if epoch == current => {}
            _ => {
                st.epoch = Some(epoch);
                st.issued = 0;
            }
        }
        if st.issued >= self.limit {
            return Err(DefenseError::RateLimitExceeded { epoch, issued: st.issued, limit: self.limit });
        }
        let index = st.issued;
        let proof = tokio::time::timeout(
            self.timeout,
            self.provider.generate_proof(&self.identity, digest, epoch, index),
        )
        .await
        .map_err(|_| DefenseError::TransientNetwork("proof provider timed out".into()))??;
        st.issued += 1;
        debug!("🔏 Issued proof {}/{} for epoch {}", st.issued, self.limit, epoch);
        Ok(proof)
    }
}

/// Recipient-side check: epoch freshness, signal binding, quota index,
/// credential tag and nullifier reuse.
pub struct NullifierLog {
    group_key: [u8; 32],
    limit: u32,
    seen: BTreeMap<Epoch, HashSet<[u8; 32]>>,
}

impl NullifierLog {
    /// `limit` is the mesh-wide `rate_limit_per_epoch`.
    pub fn new(group_key: [u8; 32], limit: u32) -> Self {
        Self { group_key, limit, seen: BTreeMap::new() }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn verify(&mut self, proof: &RelayProof, digest: &MessageDigest, current: Epoch) -> DefenseResult<()> {
        self.seen.retain(|e, _| *e >= current);

        if proof.epoch < current {
            return Err(DefenseError::StaleEpoch { requested: proof.epoch, current });
        }
        if proof.epoch > current {
            return Err(DefenseError::InvalidProof(format!("proof for future epoch {}", proof.epoch)));
        }
        if proof.signal_hash != *digest {
            return Err(DefenseError::InvalidProof("signal hash does not match message".into()));
        }
        if proof.message_index >= self.limit {
            return Err(DefenseError::InvalidProof(format!(
                "message index {} is outside the quota of {}",
                proof.message_index, self.limit
            )));
        }
        let expected =
            credential_tag(&self.group_key, &proof.nullifier, proof.epoch, proof.message_index, &proof.signal_hash);
        if proof.proof.as_slice() != expected.as_slice() {
            return Err(DefenseError::InvalidProof("credential tag rejected".into()));
        }
        let seen = self.seen.entry(current).or_default();
        if !seen.insert(proof.nullifier) {
            warn!("🚨 Nullifier reuse in epoch {}", current);
            return Err(DefenseError::InvalidProof(format!("nullifier reused in epoch {}", current)));
        }
        Ok(())
    }
}
