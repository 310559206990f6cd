use anyhow::{Context, Result};
use clap::Parser;
use stealth_sidecar::{
    rainbow::{ArrivalEvent, AttackConfig, AttackSimulator},
    traffic::{self, TrafficProfile},
    ModuloBackbone,
};
use std::fs;
use tracing::info;

/// Run the RAINBOW attack model over an arrival stream and print the report as JSON.
#[derive(Parser)]
#[command(author, version, about)]
struct Args {
    /// JSON array of arrival events; generated traffic is used when omitted
    #[arg(long)]
    events: Option<String>,

    /// Write the report here instead of stdout
    #[arg(long)]
    out: Option<String>,

    #[arg(long, default_value_t = 50)]
    tolerance_ms: u64,

    #[arg(long, default_value_t = 0.8)]
    threshold: f64,

    /// Generated traffic: include friend-relay copies
    #[arg(long)]
    defended: bool,

    #[arg(long, default_value_t = 64)]
    validators: u64,

    #[arg(long, default_value_t = 10)]
    epochs: u64,

    #[arg(long, default_value_t = 3)]
    friends: usize,

    #[arg(long, default_value_t = 7)]
    seed: u64,
}

fn main() -> Result<()> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .try_init();
    let args = Args::parse();

    if !args.threshold.is_finite() || !(0.0..=1.0).contains(&args.threshold) {
        anyhow::bail!("threshold {} must lie in [0, 1]", args.threshold);
    }
    let config = AttackConfig { simultaneity_tolerance_ms: args.tolerance_ms, confidence_threshold: args.threshold };

    let events: Vec<ArrivalEvent> = match &args.events {
        Some(path) => {
            let text = fs::read_to_string(path).with_context(|| format!("🗂️  couldn’t read events file {}", path))?;
            serde_json::from_str(&text).with_context(|| format!("📝  invalid event JSON in {}", path))?
        }
        None => {
            let profile = TrafficProfile {
                validators: args.validators,
                epochs: args.epochs,
                friends: args.friends,
                defended: args.defended,
                seed: args.seed,
                ..Default::default()
            };
            traffic::generate(&profile, &ModuloBackbone::default())
        }
    };
    info!("🌈 Analysing {} arrival events", events.len());

    let report = AttackSimulator::run(&events, config);
    let json = serde_json::to_string_pretty(&report)?;
    match &args.out {
        Some(path) => fs::write(path, json).with_context(|| format!("couldn’t write report to {}", path))?,
        None => println!("{}", json),
    }
    Ok(())
}
