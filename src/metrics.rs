use crate::rainbow::AttackReport;
use anyhow::Result;
use prometheus::{
    Encoder, Gauge, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use std::thread;
use std::time::Duration;
use tracing::{error, info};

/// Counters and gauges for both defenses and the attack model.
///
/// Every metric is prefixed `stealth_` and registered on a private registry, so
/// several sinks can coexist in one process (tests build one per case).
#[derive(Clone)]
pub struct MetricsSink {
    registry: Registry,
    pub subnets_joined: IntCounter,
    pub subnets_left: IntCounter,
    pub subnet_failures: IntCounterVec,
    pub current_extra_subnets: IntGauge,
    pub current_epoch: IntGauge,
    pub reshuffles: IntCounter,
    pub reshuffle_duration: Histogram,
    pub relay_attempted: IntCounter,
    pub relay_succeeded: IntCounter,
    pub relay_failed: IntCounter,
    pub relay_skipped: IntCounterVec,
    pub relay_latency: Histogram,
    pub proofs_issued: IntCounter,
    pub proofs_rejected: IntCounterVec,
    pub attacker_success_rate: Gauge,
}

impl MetricsSink {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let subnets_joined = IntCounter::new("stealth_subnets_joined_total", "Extra subnets joined")?;
        let subnets_left = IntCounter::new("stealth_subnets_left_total", "Extra subnets left")?;
        let subnet_failures = IntCounterVec::new(
            Opts::new("stealth_subnet_failures_total", "Failed subscribe/unsubscribe calls"),
            &["op"],
        )?;
        let current_extra_subnets = IntGauge::new("stealth_current_extra_subnets", "Extra subnets currently held")?;
        let current_epoch = IntGauge::new("stealth_current_epoch", "Last epoch handled")?;
        let reshuffles = IntCounter::new("stealth_reshuffles_total", "Completed subnet reshuffles")?;
        let reshuffle_duration = Histogram::with_opts(
            HistogramOpts::new("stealth_reshuffle_duration_seconds", "Wall time of one enable, reshuffle or disable")
                .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
        )?;
        let relay_attempted = IntCounter::new("stealth_relay_attempted_total", "Friend pushes attempted")?;
        let relay_succeeded = IntCounter::new("stealth_relay_succeeded_total", "Friend pushes delivered")?;
        let relay_failed = IntCounter::new("stealth_relay_failed_total", "Friend pushes failed or timed out")?;
        let relay_skipped = IntCounterVec::new(
            Opts::new("stealth_relay_skipped_total", "Attestations sent without relay"),
            &["reason"],
        )?;
        let relay_latency = Histogram::with_opts(
            HistogramOpts::new("stealth_relay_latency_seconds", "Time until the slowest friend acknowledged")
                .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.0]),
        )?;
        let proofs_issued = IntCounter::new("stealth_proofs_issued_total", "Relay proofs issued")?;
        let proofs_rejected = IntCounterVec::new(
            Opts::new("stealth_proofs_rejected_total", "Inbound relay envelopes rejected"),
            &["reason"],
        )?;
        let attacker_success_rate =
            Gauge::new("stealth_attacker_success_rate", "Fraction of validators the attack model deanonymized")?;

        registry.register(Box::new(subnets_joined.clone()))?;
        registry.register(Box::new(subnets_left.clone()))?;
        registry.register(Box::new(subnet_failures.clone()))?;
        registry.register(Box::new(current_extra_subnets.clone()))?;
        registry.register(Box::new(current_epoch.clone()))?;
        registry.register(Box::new(reshuffles.clone()))?;
        registry.register(Box::new(reshuffle_duration.clone()))?;
        registry.register(Box::new(relay_attempted.clone()))?;
        registry.register(Box::new(relay_succeeded.clone()))?;
        registry.register(Box::new(relay_failed.clone()))?;
        registry.register(Box::new(relay_skipped.clone()))?;
        registry.register(Box::new(relay_latency.clone()))?;
        registry.register(Box::new(proofs_issued.clone()))?;
        registry.register(Box::new(proofs_rejected.clone()))?;
        registry.register(Box::new(attacker_success_rate.clone()))?;

        Ok(Self {
            registry,
            subnets_joined,
            subnets_left,
            subnet_failures,
            current_extra_subnets,
            current_epoch,
            reshuffles,
            reshuffle_duration,
            relay_attempted,
            relay_succeeded,
            relay_failed,
            relay_skipped,
            relay_latency,
            proofs_issued,
            proofs_rejected,
            attacker_success_rate,
        })
    }

    pub fn observe_relay_latency(&self, latency: Duration) {
        self.relay_latency.observe(latency.as_secs_f64());
    }

    pub fn observe_reshuffle(&self, took: Duration) {
        self.reshuffle_duration.observe(took.as_secs_f64());
    }

    /// Publish the outcome of an attack-model run.
    pub fn record_attack(&self, report: &AttackReport) {
        self.attacker_success_rate.set(report.success_rate);
    }

    /// Text exposition of every registered metric.
    pub fn encode(&self) -> Result<String> {
        let mut buffer = vec![];
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

pub fn serve(cfg: crate::config::Metrics, sink: MetricsSink) -> Result<()> {
    let bind_addr = cfg.bind.clone();
    let content_type = "Content-Type: text/plain; version=0.0.4; charset=utf-8"
        .parse::<tiny_http::Header>()
        .map_err(|_| anyhow::anyhow!("invalid metrics content-type header"))?;

    thread::spawn(move || {
        let server = match tiny_http::Server::http(&bind_addr) {
            Ok(s) => s,
            Err(e) => {
                error!("🔥 Could not start metrics server on {}: {}", bind_addr, e);
                return;
            }
        };
        info!("📈 Metrics served on http://{}/metrics (health on /health)", bind_addr);

        for request in server.incoming_requests() {
            if request.url() == "/health" {
                let _ = request.respond(tiny_http::Response::from_string("ok"));
                continue;
            }
            let body = match sink.encode() {
                Ok(b) => b,
                Err(e) => {
                    error!("🔥 Could not encode metrics: {}", e);
                    continue;
                }
            };
            let response = tiny_http::Response::from_string(body).with_header(content_type.clone());
            let _ = request.respond(response);
        }
    });

    Ok(())
}
