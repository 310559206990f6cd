use crate::subnet::SubnetId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// BLAKE3 digest of an attestation payload.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageDigest(pub [u8; 32]);

impl MessageDigest {
    pub fn of(payload: &[u8]) -> Self {
        Self(*blake3::hash(payload).as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn short(&self) -> String {
        hex::encode(&self.0[..6])
    }
}

impl fmt::Display for MessageDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for MessageDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageDigest({})", self.short())
    }
}

/// A locally originated attestation. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attestation {
    pub validator_index: u64,
    pub subnet: SubnetId,
    pub digest: MessageDigest,
    pub payload: Vec<u8>,
    /// Milliseconds since the unix epoch at which the attestation was produced.
    pub arrival_ms: u64,
}

impl Attestation {
    pub fn new(validator_index: u64, subnet: SubnetId, payload: Vec<u8>, arrival_ms: u64) -> Self {
        let digest = MessageDigest::of(&payload);
        Self { validator_index, subnet, digest, payload, arrival_ms }
    }
}
