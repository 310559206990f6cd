//! Error taxonomy for the defense layer.
//!
//! Only [`DefenseError::Configuration`] is allowed to reach the orchestration
//! boundary. Everything else is absorbed by the component that raised it and
//! shows up in logs and metrics instead.

use crate::epoch::Epoch;
use crate::subnet::SubnetId;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum DefenseError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("transient network error: {0}")]
    TransientNetwork(String),

    #[error("rate limit exceeded: {issued}/{limit} proofs in epoch {epoch}")]
    RateLimitExceeded { epoch: Epoch, issued: u32, limit: u32 },

    #[error("stale epoch: requested {requested}, current {current}")]
    StaleEpoch { requested: Epoch, current: Epoch },

    #[error("invalid relay proof: {0}")]
    InvalidProof(String),

    #[error("subscribing to subnet {0} would cover every attestation subnet")]
    Coverage(SubnetId),
}

impl DefenseError {
    /// Fatal errors halt startup; every other kind degrades protection instead.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DefenseError::Configuration(_))
    }

    /// Short label used for metric dimensions.
    pub fn kind(&self) -> &'static str {
        match self {
            DefenseError::Configuration(_) => "configuration",
            DefenseError::TransientNetwork(_) => "transient_network",
            DefenseError::RateLimitExceeded { .. } => "rate_limit",
            DefenseError::StaleEpoch { .. } => "stale_epoch",
            DefenseError::InvalidProof(_) => "invalid_proof",
            DefenseError::Coverage(_) => "coverage",
        }
    }
}

pub type DefenseResult<T> = Result<T, DefenseError>;
