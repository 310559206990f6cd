//! RAINBOW attack model.
//!
//! The adversary sees every attestation arrival on every subnet. Per validator
//! and per window it keeps the first-seen arrival; a window counts against the
//! validator when that arrival is on a non-backbone subnet and no other source
//! delivered the same message within the simultaneity tolerance. Across windows,
//! confidence is the share of windows that point at the same source.
//!
//! The analysis is fully deterministic: ordered maps everywhere, no randomness.

use crate::epoch::Epoch;
use crate::subnet::{BackboneAssignment, SubnetId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One observed arrival of an attestation at the adversary's vantage points.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArrivalEvent {
    pub validator: u64,
    pub subnet: SubnetId,
    /// Opaque message identity; copies of one attestation share it.
    pub message: String,
    /// Peer that delivered this copy.
    pub source: String,
    pub arrival_ms: u64,
    /// Analysis window, normally the epoch the attestation belongs to.
    pub window: Epoch,
    pub is_backbone: bool,
}

impl ArrivalEvent {
    /// Build an event whose backbone flag is resolved against `backbone`.
    pub fn observed(
        validator: u64,
        subnet: SubnetId,
        message: impl Into<String>,
        source: impl Into<String>,
        arrival_ms: u64,
        window: Epoch,
        backbone: &dyn BackboneAssignment,
    ) -> Self {
        Self {
            validator,
            subnet,
            message: message.into(),
            source: source.into(),
            arrival_ms,
            window,
            is_backbone: backbone.is_backbone(validator, subnet),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AttackConfig {
    /// Copies from other sources arriving within this many ms of the first
    /// one (inclusive) make the first-seen ambiguous.
    pub simultaneity_tolerance_ms: u64,
    /// Minimum share of windows that must agree on one source.
    pub confidence_threshold: f64,
}

impl Default for AttackConfig {
    fn default() -> Self {
        Self { simultaneity_tolerance_ms: 50, confidence_threshold: 0.8 }
    }
}

impl From<&crate::config::Attack> for AttackConfig {
    fn from(a: &crate::config::Attack) -> Self {
        Self { simultaneity_tolerance_ms: a.simultaneity_tolerance_ms, confidence_threshold: a.confidence_threshold }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mapping {
    pub validator: u64,
    pub source: String,
    pub confidence: f64,
    /// Windows in which `source` was the uncontested off-backbone first-seen.
    pub evidence: u32,
    pub windows: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttackReport {
    /// `validators_mapped / total_observed`, in `[0, 1]`; zero for an empty stream.
    pub success_rate: f64,
    pub validators_mapped: usize,
    pub total_observed: usize,
    pub total_events: usize,
    pub simultaneity_tolerance_ms: u64,
    pub confidence_threshold: f64,
    pub mappings: Vec<Mapping>,
}

impl AttackReport {
    pub fn is_mapped(&self, validator: u64) -> bool {
        self.mappings.iter().any(|m| m.validator == validator)
    }

    pub fn mapping(&self, validator: u64) -> Option<&Mapping> {
        self.mappings.iter().find(|m| m.validator == validator)
    }
}

/// Undefended vs defended run over comparable traffic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportComparison {
    pub before: AttackReport,
    pub after: AttackReport,
    /// `before.success_rate - after.success_rate`.
    pub reduction: f64,
}

impl ReportComparison {
    pub fn new(before: AttackReport, after: AttackReport) -> Self {
        let reduction = before.success_rate - after.success_rate;
        Self { before, after, reduction }
    }
}

#[derive(Debug, Clone)]
struct Arrival {
    source: String,
    arrival_ms: u64,
}

pub struct AttackSimulator {
    config: AttackConfig,
    // (validator, window) -> first event seen for it.
    first_seen: BTreeMap<(u64, Epoch), ArrivalEvent>,
    // message -> every copy observed.
    copies: BTreeMap<String, Vec<Arrival>>,
    total_events: usize,
}

impl AttackSimulator {
    pub fn new(config: AttackConfig) -> Self {
        Self { config, first_seen: BTreeMap::new(), copies: BTreeMap::new(), total_events: 0 }
    }

    pub fn config(&self) -> &AttackConfig {
        &self.config
    }

    /// Feed one event. Events are expected in arrival order; within a
    /// (validator, window) the first one fed wins.
    pub fn observe(&mut self, event: &ArrivalEvent) {
        self.total_events += 1;
        self.copies
            .entry(event.message.clone())
            .or_default()
            .push(Arrival { source: event.source.clone(), arrival_ms: event.arrival_ms });
        self.first_seen.entry((event.validator, event.window)).or_insert_with(|| event.clone());
    }

    fn contested(&self, first: &ArrivalEvent) -> bool {
        let tol = self.config.simultaneity_tolerance_ms;
        self.copies.get(&first.message).map_or(false, |copies| {
            copies
                .iter()
                .any(|c| c.source != first.source && c.arrival_ms.abs_diff(first.arrival_ms) <= tol)
        })
    }

    pub fn report(&self) -> AttackReport {
        // validator -> (windows observed, source -> supporting windows)
        let mut tally: BTreeMap<u64, (u32, BTreeMap<&str, u32>)> = BTreeMap::new();
        for ((validator, _window), first) in &self.first_seen {
            let entry = tally.entry(*validator).or_default();
            entry.0 += 1;
            if !first.is_backbone && !self.contested(first) {
                *entry.1.entry(first.source.as_str()).or_default() += 1;
            }
        }

        let mut mappings = Vec::new();
        for (validator, (windows, sources)) in &tally {
            // Highest count wins; ties go to the smallest source name.
            let best = sources
                .iter()
                .fold(None::<(&str, u32)>, |acc, (s, n)| match acc {
                    Some((_, m)) if m >= *n => acc,
                    _ => Some((*s, *n)),
                });
            if let Some((source, evidence)) = best {
                let confidence = evidence as f64 / *windows as f64;
                if confidence >= self.config.confidence_threshold {
                    mappings.push(Mapping {
                        validator: *validator,
                        source: source.to_string(),
                        confidence,
                        evidence,
                        windows: *windows,
                    });
                }
            }
        }

        let total_observed = tally.len();
        let validators_mapped = mappings.len();
        let success_rate = if total_observed == 0 {
            0.0
        } else {
            validators_mapped as f64 / total_observed as f64
        };
        AttackReport {
            success_rate,
            validators_mapped,
            total_observed,
            total_events: self.total_events,
            simultaneity_tolerance_ms: self.config.simultaneity_tolerance_ms,
            confidence_threshold: self.config.confidence_threshold,
            mappings,
        }
    }

    /// Analyse a whole stream. Events are stably sorted by arrival time first,
    /// so equal timestamps keep their input order.
    pub fn run(events: &[ArrivalEvent], config: AttackConfig) -> AttackReport {
        let mut ordered: Vec<&ArrivalEvent> = events.iter().collect();
        ordered.sort_by_key(|e| e.arrival_ms);
        let mut sim = AttackSimulator::new(config);
        for e in ordered {
            sim.observe(e);
        }
        sim.report()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ev(validator: u64, subnet: u8, source: &str, at: u64, backbone: bool) -> ArrivalEvent {
        ArrivalEvent {
            validator,
            subnet: SubnetId(subnet),
            message: format!("m{}", validator),
            source: source.into(),
            arrival_ms: at,
            window: Epoch(0),
            is_backbone: backbone,
        }
    }

    #[test]
    fn empty_stream_reports_zero() {
        let r = AttackSimulator::run(&[], AttackConfig::default());
        assert_eq!(r.total_observed, 0);
        assert_eq!(r.success_rate, 0.0);
    }

    #[test]
    fn run_sorts_before_first_write_wins() {
        let events = vec![ev(1, 40, "late", 500, false), ev(1, 40, "origin", 100, false)];
        let r = AttackSimulator::run(&events, AttackConfig::default());
        assert_eq!(r.mapping(1).map(|m| m.source.as_str()), Some("origin"));
    }
}
