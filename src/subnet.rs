//! Attestation subnet identifiers, the extra-subnet set and the backbone formula.

use crate::error::{DefenseError, DefenseResult};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

/// Number of attestation gossip topics on the network.
pub const SUBNET_COUNT: u8 = 64;

/// One attestation gossip topic, `0..64`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubnetId(pub u8);

impl SubnetId {
    pub fn new(id: u8) -> DefenseResult<Self> {
        if id >= SUBNET_COUNT {
            return Err(DefenseError::Configuration(format!(
                "invalid subnet id {} (must be below {})",
                id, SUBNET_COUNT
            )));
        }
        Ok(SubnetId(id))
    }

    pub fn all() -> impl Iterator<Item = SubnetId> {
        (0..SUBNET_COUNT).map(SubnetId)
    }

    /// Gossip topic for this subnet under the given fork digest.
    pub fn topic(&self, fork_digest: &str) -> String {
        format!("/eth2/{}/beacon_attestation_{}/ssz_snappy", fork_digest, self.0)
    }

    /// Inverse of [`SubnetId::topic`]; `None` for anything that isn't an attestation topic.
    pub fn from_topic(topic: &str) -> Option<SubnetId> {
        let rest = topic.strip_prefix("/eth2/")?;
        let mut parts = rest.split('/');
        let _fork = parts.next()?;
        let id = parts.next()?.strip_prefix("beacon_attestation_")?.parse::<u8>().ok()?;
        SubnetId::new(id).ok()
    }
}

impl fmt::Display for SubnetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Subnets joined beyond the fixed backbone. Ordered so status output is stable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubnetSet(BTreeSet<SubnetId>);

impl SubnetSet {
    pub fn new() -> Self {
        Self(BTreeSet::new())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, subnet: &SubnetId) -> bool {
        self.0.contains(subnet)
    }

    pub fn insert(&mut self, subnet: SubnetId) -> bool {
        self.0.insert(subnet)
    }

    pub fn remove(&mut self, subnet: &SubnetId) -> bool {
        self.0.remove(subnet)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SubnetId> {
        self.0.iter()
    }

    pub fn ids(&self) -> Vec<u8> {
        self.0.iter().map(|s| s.0).collect()
    }

    /// Draw `k` subnets uniformly without replacement from the universe minus `excluded`.
    ///
    /// The draw never looks at the previous selection, so successive calls are independent.
    pub fn draw<R: Rng + ?Sized>(k: usize, excluded: &SubnetSet, rng: &mut R) -> DefenseResult<Self> {
        let candidates: Vec<SubnetId> = SubnetId::all().filter(|s| !excluded.contains(s)).collect();
        if k > candidates.len() {
            return Err(DefenseError::Configuration(format!(
                "cannot draw {} extra subnets from {} candidates",
                k,
                candidates.len()
            )));
        }
        Ok(candidates.choose_multiple(rng, k).copied().collect())
    }
}

impl FromIterator<SubnetId> for SubnetSet {
    fn from_iter<I: IntoIterator<Item = SubnetId>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a SubnetSet {
    type Item = &'a SubnetId;
    type IntoIter = std::collections::btree_set::Iter<'a, SubnetId>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Maps a validator to its protocol-assigned backbone subnets.
///
/// Production correctness depends on matching the real committee assignment, so the
/// formula is pluggable rather than baked into the juggler or the attack model.
pub trait BackboneAssignment: Send + Sync {
    fn backbone_subnets(&self, validator_index: u64) -> Vec<SubnetId>;

    fn is_backbone(&self, validator_index: u64, subnet: SubnetId) -> bool {
        self.backbone_subnets(validator_index).contains(&subnet)
    }

    /// Union of the backbone subnets of every local validator.
    fn backbone_for(&self, validator_indices: &[u64]) -> SubnetSet {
        validator_indices
            .iter()
            .flat_map(|v| self.backbone_subnets(*v))
            .collect()
    }
}

pub type Backbone = Arc<dyn BackboneAssignment>;

/// Simplified placeholder formula: subnet `(index * multiplier + i) % 64` for `i < per_validator`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuloBackbone {
    multiplier: u64,
    per_validator: u8,
}

impl ModuloBackbone {
    pub fn new(multiplier: u64, per_validator: u8) -> DefenseResult<Self> {
        if per_validator == 0 {
            return Err(DefenseError::Configuration(
                "backbone formula assigns no subnets".into(),
            ));
        }
        if per_validator >= SUBNET_COUNT {
            return Err(DefenseError::Configuration(format!(
                "backbone formula assigns {} subnets per validator",
                per_validator
            )));
        }
        Ok(Self { multiplier, per_validator })
    }
}

impl Default for ModuloBackbone {
    fn default() -> Self {
        Self { multiplier: 2, per_validator: 2 }
    }
}

impl BackboneAssignment for ModuloBackbone {
    fn backbone_subnets(&self, validator_index: u64) -> Vec<SubnetId> {
        let base = validator_index.wrapping_mul(self.multiplier);
        (0..self.per_validator as u64)
            .map(|i| SubnetId((base.wrapping_add(i) % SUBNET_COUNT as u64) as u8))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn subnet_id_bounds() {
        assert!(SubnetId::new(0).is_ok());
        assert!(SubnetId::new(63).is_ok());
        assert!(SubnetId::new(64).is_err());
    }

    #[test]
    fn topic_round_trips_through_parser() {
        let s = SubnetId(42);
        assert_eq!(SubnetId::from_topic(&s.topic("6a95a1a9")), Some(s));
        assert_eq!(SubnetId::from_topic("/eth2/6a95a1a9/beacon_block/ssz_snappy"), None);
        assert_eq!(SubnetId::from_topic("/eth2/6a95a1a9/beacon_attestation_99/ssz_snappy"), None);
    }

    #[test]
    fn modulo_backbone_matches_placeholder_formula() {
        let b = ModuloBackbone::default();
        assert_eq!(b.backbone_subnets(5), vec![SubnetId(10), SubnetId(11)]);
        assert_eq!(b.backbone_subnets(32), vec![SubnetId(0), SubnetId(1)]);
        assert_eq!(b.backbone_subnets(31), vec![SubnetId(62), SubnetId(63)]);
        assert!(ModuloBackbone::new(2, 0).is_err());
    }

    #[test]
    fn draw_excludes_and_has_exact_size() {
        let mut rng = StdRng::seed_from_u64(7);
        let excluded: SubnetSet = [SubnetId(0), SubnetId(1)].into_iter().collect();
        for _ in 0..50 {
            let set = SubnetSet::draw(8, &excluded, &mut rng).unwrap();
            assert_eq!(set.len(), 8);
            assert!(!set.contains(&SubnetId(0)) && !set.contains(&SubnetId(1)));
        }
        assert!(SubnetSet::draw(63, &excluded, &mut rng).is_err());
    }
}
