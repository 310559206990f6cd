use crate::error::DefenseError;
use crate::relay::FriendNode;
use crate::subnet::{BackboneAssignment, ModuloBackbone, SubnetSet, SUBNET_COUNT};
use anyhow::{Context, Result};
use serde::Deserialize;
use std::{fs, path::Path, time::Duration};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub clock: Clock,
    #[serde(default)]
    pub juggler: Juggler,
    #[serde(default)]
    pub relay: Relay,
    #[serde(default)]
    pub attack: Attack,
    #[serde(default)]
    pub net: Net,
    #[serde(default)]
    pub metrics: Metrics,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Clock {
    #[serde(default = "default_genesis")]
    pub genesis_unix: u64,
    #[serde(default = "default_seconds_per_slot")]
    pub seconds_per_slot: u64,
    #[serde(default = "default_slots_per_epoch")]
    pub slots_per_epoch: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Juggler {
    #[serde(default = "default_extra_subnets")]
    pub extra_subnets: usize,
    #[serde(default = "default_validators")]
    pub validator_indices: Vec<u64>,
    #[serde(default = "default_backbone_multiplier")]
    pub backbone_multiplier: u64,
    #[serde(default = "default_backbone_per_validator")]
    pub backbone_subnets_per_validator: u8,
    #[serde(default = "default_poll_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Relay {
    #[serde(default = "default_rate_limit")]
    pub rate_limit_per_epoch: u32,
    #[serde(default = "default_push_timeout_ms")]
    pub push_timeout_ms: u64,
    #[serde(default = "default_proof_timeout_ms")]
    pub proof_timeout_ms: u64,
    /// 32-byte hex node secret; a fresh one is generated per run when absent.
    #[serde(default)]
    pub identity_secret: Option<String>,
    /// 32-byte hex key shared by every member of the friend mesh.
    #[serde(default)]
    pub group_key: Option<String>,
    #[serde(default)]
    pub friends: Vec<FriendNode>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Attack {
    #[serde(default = "default_tolerance_ms")]
    pub simultaneity_tolerance_ms: u64,
    #[serde(default = "default_confidence")]
    pub confidence_threshold: f64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Net {
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    #[serde(default)]
    pub bootstrap: Vec<String>,          // multiaddrs
    #[serde(default = "default_fork_digest")]
    pub fork_digest: String,
    #[serde(default = "default_identity_path")]
    pub identity_path: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Metrics {
    #[serde(default = "default_bind")]
    pub bind: String,
}

fn default_genesis() -> u64 { 1_606_824_023 }    // mainnet beacon genesis
fn default_seconds_per_slot() -> u64 { 12 }
fn default_slots_per_epoch() -> u64 { 32 }
fn default_extra_subnets() -> usize { 8 }
fn default_validators() -> Vec<u64> { vec![0] }
fn default_backbone_multiplier() -> u64 { 2 }
fn default_backbone_per_validator() -> u8 { 2 }
fn default_poll_ms() -> u64 { 12_000 }
fn default_call_timeout_ms() -> u64 { 5_000 }
fn default_rate_limit() -> u32 { 100 }
fn default_push_timeout_ms() -> u64 { 2_000 }
fn default_proof_timeout_ms() -> u64 { 2_000 }
fn default_tolerance_ms() -> u64 { 50 }
fn default_confidence() -> f64 { 0.8 }
fn default_listen_port() -> u16 { 9000 }
fn default_fork_digest() -> String { "6a95a1a9".into() }
fn default_identity_path() -> String { "peer_identity.key".into() }
fn default_bind() -> String { "0.0.0.0:9100".into() }

impl Default for Clock {
    fn default() -> Self {
        Self {
            genesis_unix: default_genesis(),
            seconds_per_slot: default_seconds_per_slot(),
            slots_per_epoch: default_slots_per_epoch(),
        }
    }
}

impl Default for Juggler {
    fn default() -> Self {
        Self {
            extra_subnets: default_extra_subnets(),
            validator_indices: default_validators(),
            backbone_multiplier: default_backbone_multiplier(),
            backbone_subnets_per_validator: default_backbone_per_validator(),
            poll_interval_ms: default_poll_ms(),
            call_timeout_ms: default_call_timeout_ms(),
        }
    }
}

impl Default for Relay {
    fn default() -> Self {
        Self {
            rate_limit_per_epoch: default_rate_limit(),
            push_timeout_ms: default_push_timeout_ms(),
            proof_timeout_ms: default_proof_timeout_ms(),
            identity_secret: None,
            group_key: None,
            friends: Vec::new(),
        }
    }
}

impl Default for Attack {
    fn default() -> Self {
        Self {
            simultaneity_tolerance_ms: default_tolerance_ms(),
            confidence_threshold: default_confidence(),
        }
    }
}

impl Default for Net {
    fn default() -> Self {
        Self {
            listen_port: default_listen_port(),
            bootstrap: Vec::new(),
            fork_digest: default_fork_digest(),
            identity_path: default_identity_path(),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self { bind: default_bind() }
    }
}

impl Juggler {
    pub fn backbone_formula(&self) -> Result<ModuloBackbone, DefenseError> {
        ModuloBackbone::new(self.backbone_multiplier, self.backbone_subnets_per_validator)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

impl Relay {
    pub fn push_timeout(&self) -> Duration {
        Duration::from_millis(self.push_timeout_ms)
    }

    pub fn proof_timeout(&self) -> Duration {
        Duration::from_millis(self.proof_timeout_ms)
    }

    pub fn identity_secret_bytes(&self) -> Result<Option<[u8; 32]>, DefenseError> {
        self.identity_secret.as_deref().map(|s| parse_key("relay.identity_secret", s)).transpose()
    }

    /// Mesh credential key. Required whenever friends are configured.
    pub fn group_key_bytes(&self) -> Result<Option<[u8; 32]>, DefenseError> {
        self.group_key.as_deref().map(|s| parse_key("relay.group_key", s)).transpose()
    }
}

fn parse_key(field: &str, s: &str) -> Result<[u8; 32], DefenseError> {
    let bytes = hex::decode(s.trim())
        .map_err(|e| DefenseError::Configuration(format!("{} is not hex: {}", field, e)))?;
    bytes
        .try_into()
        .map_err(|_| DefenseError::Configuration(format!("{} must be 32 bytes", field)))
}

impl Config {
    /// Startup checks. Anything returned here is fatal; a thin friend roster only warns.
    pub fn validate(&self) -> Result<(), DefenseError> {
        if self.clock.seconds_per_slot == 0 {
            return Err(DefenseError::Configuration("clock.seconds_per_slot must be non-zero".into()));
        }
        if self.clock.slots_per_epoch == 0 {
            return Err(DefenseError::Configuration("clock.slots_per_epoch must be non-zero".into()));
        }
        if self.juggler.extra_subnets == 0 {
            return Err(DefenseError::Configuration("juggler.extra_subnets must be at least 1".into()));
        }
        if self.juggler.validator_indices.is_empty() {
            return Err(DefenseError::Configuration("juggler.validator_indices is empty".into()));
        }
        let backbone = self.backbone_set()?;
        if backbone.is_empty() {
            return Err(DefenseError::Configuration("backbone subnet set is empty".into()));
        }
        if backbone.len() + self.juggler.extra_subnets >= SUBNET_COUNT as usize {
            return Err(DefenseError::Configuration(format!(
                "{} backbone + {} extra subnets would cover all {} subnets",
                backbone.len(),
                self.juggler.extra_subnets,
                SUBNET_COUNT
            )));
        }
        let t = self.attack.confidence_threshold;
        if !t.is_finite() || !(0.0..=1.0).contains(&t) {
            return Err(DefenseError::Configuration(format!(
                "attack.confidence_threshold {} must lie in [0, 1]",
                t
            )));
        }
        if self.relay.rate_limit_per_epoch == 0 && !self.relay.friends.is_empty() {
            return Err(DefenseError::Configuration("relay.rate_limit_per_epoch must be at least 1".into()));
        }
        self.relay.identity_secret_bytes()?;
        if self.relay.group_key_bytes()?.is_none() && !self.relay.friends.is_empty() {
            return Err(DefenseError::Configuration(
                "relay.group_key is required when relay.friends is non-empty".into(),
            ));
        }
        for friend in &self.relay.friends {
            let valid = !friend.public_key.trim().is_empty() && hex::decode(friend.public_key.trim()).is_ok();
            if !valid {
                return Err(DefenseError::Configuration(format!(
                    "relay.friends[{}].public_key is not hex",
                    friend.peer_id
                )));
            }
        }
        if !self.relay.friends.is_empty() && self.relay.friends.len() < 3 {
            tracing::warn!("⚠️  Only {} friends configured; at least 3 are recommended", self.relay.friends.len());
        }
        Ok(())
    }

    /// Backbone subnets of every configured local validator.
    pub fn backbone_set(&self) -> Result<SubnetSet, DefenseError> {
        Ok(self.juggler.backbone_formula()?.backbone_for(&self.juggler.validator_indices))
    }
}

/// Read the TOML file at `p` and deserialize into `Config`.
/// *Adds context* so user errors print a friendlier message.
///
/// # Errors
/// * Returns an anyhow::Error if the file cannot be read or parsed.
pub fn load<P: AsRef<Path>>(p: P) -> Result<Config> {
    let text = fs::read_to_string(&p)
        .with_context(|| format!("🗂️  couldn’t read config file {}", p.as_ref().display()))?;
    load_from_str(&text)
}

pub fn load_from_str(text: &str) -> Result<Config> {
    let cfg: Config = toml::from_str(text)
        .with_context(|| "📝  invalid TOML in config file".to_string())?;
    cfg.validate()?;
    Ok(cfg)
}
