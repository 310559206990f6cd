//! Seeded attestation traffic for the attack model.
//!
//! Every validator attests once per epoch on a duty subnet drawn uniformly from
//! all 64. Its home node publishes first; ordinary peers forward the message
//! 60-250 ms later. With the friend relay on, each friend republishes within a
//! few milliseconds of the origin, which is what the relay does on the wire.

use crate::attestation::MessageDigest;
use crate::epoch::Epoch;
use crate::rainbow::ArrivalEvent;
use crate::subnet::{BackboneAssignment, SubnetId, SUBNET_COUNT};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficProfile {
    pub validators: u64,
    pub epochs: u64,
    /// Ordinary peers forwarding each message after the origin.
    pub forwarders: usize,
    /// Friend-mesh size; only used when `defended`.
    pub friends: usize,
    pub defended: bool,
    pub seed: u64,
    pub epoch_ms: u64,
}

impl Default for TrafficProfile {
    fn default() -> Self {
        Self {
            validators: 64,
            epochs: 10,
            forwarders: 4,
            friends: 3,
            defended: false,
            seed: 7,
            epoch_ms: 384_000,
        }
    }
}

impl TrafficProfile {
    /// Same traffic with the friend relay switched on.
    pub fn defended(&self) -> Self {
        Self { defended: true, ..self.clone() }
    }
}

fn origin_of(validator: u64) -> String {
    format!("node-{}", validator)
}

/// Generate the full stream, sorted by arrival time.
///
/// The duty-subnet and origin-delay draws do not depend on `defended`, so an
/// undefended and a defended profile with the same seed describe the same duties.
pub fn generate(profile: &TrafficProfile, backbone: &dyn BackboneAssignment) -> Vec<ArrivalEvent> {
    let mut duty_rng = StdRng::seed_from_u64(profile.seed);
    let mut relay_rng = StdRng::seed_from_u64(profile.seed ^ 0x5eed_f00d);
    let mut events = Vec::new();

    for epoch in 0..profile.epochs {
        let window = Epoch(epoch);
        for v in 0..profile.validators {
            let subnet = SubnetId(duty_rng.gen_range(0..SUBNET_COUNT));
            let slot_offset = duty_rng.gen_range(0..profile.epoch_ms.max(1));
            let t0 = epoch * profile.epoch_ms + slot_offset + duty_rng.gen_range(5..=20);
            let message = MessageDigest::of(format!("{}:{}", v, epoch).as_bytes()).to_string();

            events.push(ArrivalEvent::observed(v, subnet, message.clone(), origin_of(v), t0, window, backbone));

            for f in 0..profile.forwarders {
                let at = t0 + duty_rng.gen_range(60..=250);
                events.push(ArrivalEvent::observed(v, subnet, message.clone(), format!("peer-{}", f), at, window, backbone));
            }

            if profile.defended {
                for j in 0..profile.friends {
                    let at = t0 + relay_rng.gen_range(0..=10);
                    let source = format!("friend-{}-{}", v, j);
                    events.push(ArrivalEvent::observed(v, subnet, message.clone(), source, at, window, backbone));
                }
            }
        }
    }

    events.sort_by_key(|e| e.arrival_ms);
    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subnet::ModuloBackbone;

    #[test]
    fn same_seed_same_stream() {
        let p = TrafficProfile { validators: 8, epochs: 3, ..Default::default() };
        let b = ModuloBackbone::default();
        assert_eq!(generate(&p, &b), generate(&p, &b));
        assert_eq!(generate(&p, &b).len(), 8 * 3 * (1 + p.forwarders));
        assert_eq!(generate(&p.defended(), &b).len(), 8 * 3 * (1 + p.forwarders + p.friends));
    }
}
