use anyhow::Context;
use clap::{Parser, Subcommand};
use stealth_sidecar::{
    config, defense::DefenseOrchestrator, epoch::{SystemClock, TimeSource}, juggler::SubnetJuggler,
    memnet::MemoryNetwork, metrics, network::{self, GossipsubNetwork}, proof::NullifierLog,
    rainbow::{AttackConfig, AttackSimulator, ReportComparison}, relay::RelayInbox, subnet::SubnetId, traffic,
    Attestation, Epoch, MetricsSink, SUBNET_COUNT,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about = "stealth-sidecar: subnet juggling and friend-mesh relay against RAINBOW")]
struct Cli {
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Suppress routine network gossip logs
    #[arg(long, default_value_t = false)]
    quiet_net: bool,

    #[command(subcommand)]
    cmd: Option<Cmd>,
}

#[derive(Subcommand)]
enum Cmd {
    /// Start the sidecar and read control commands from stdin
    Run {
        /// Enable both defenses at startup
        #[arg(long)]
        stealth: bool,
    },
    /// Compare the attack model before and after the defense on generated traffic
    Simulate {
        #[arg(long, default_value_t = 64)]
        validators: u64,
        #[arg(long, default_value_t = 100)]
        epochs: u64,
        #[arg(long, default_value_t = 3)]
        friends: usize,
        #[arg(long, default_value_t = 7)]
        seed: u64,
        /// Print the comparison as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the local libp2p peer ID and exit
    PeerId,
}

fn init_logging(quiet_net: bool) {
    let default = if quiet_net { "warn" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_target(false).try_init();
}

fn load_config(path: &str) -> anyhow::Result<config::Config> {
    match config::load(path) {
        Ok(c) => Ok(c),
        Err(e) if std::path::Path::new(path).exists() => Err(e),
        Err(e) => {
            // Embedded default config lets the binary run standalone.
            warn!("⚠️  Could not read config from '{}': {}; using built-in defaults", path, e);
            const EMBEDDED_CONFIG: &str = include_str!("../config.toml");
            config::load_from_str(EMBEDDED_CONFIG)
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.quiet_net);
    let cfg = load_config(&cli.config)?;

    match cli.cmd.unwrap_or(Cmd::Run { stealth: false }) {
        Cmd::PeerId => {
            let keys = network::load_or_create_peer_identity(&cfg.net.identity_path)?;
            println!("🆔 Peer ID: {}", libp2p::PeerId::from(keys.public()));
            Ok(())
        }
        Cmd::Simulate { validators, epochs, friends, seed, json } => {
            simulate(&cfg, validators, epochs, friends, seed, json).await
        }
        Cmd::Run { stealth } => run(cfg, stealth).await,
    }
}

async fn simulate(
    cfg: &config::Config,
    validators: u64,
    epochs: u64,
    friends: usize,
    seed: u64,
    json: bool,
) -> anyhow::Result<()> {
    let backbone = cfg.juggler.backbone_formula()?;
    let attack = AttackConfig::from(&cfg.attack);
    let profile = traffic::TrafficProfile { validators, epochs, friends, seed, ..Default::default() };

    let before = AttackSimulator::run(&traffic::generate(&profile, &backbone), attack);
    let after = AttackSimulator::run(&traffic::generate(&profile.defended(), &backbone), attack);
    let comparison = ReportComparison::new(before, after);
    let sink = MetricsSink::new()?;
    sink.record_attack(&comparison.after);

    // Juggle over an in-memory network to show what an observer of our subscriptions sees.
    let backbone_set = cfg.backbone_set()?;
    let net = Arc::new(MemoryNetwork::with_backbone(&backbone_set));
    let mut juggler = SubnetJuggler::new(net.clone(), backbone_set, cfg.juggler.extra_subnets, cfg.juggler.call_timeout())?
        .with_seed(seed);
    let mut covered = BTreeSet::new();
    let _ = juggler.enable(Epoch(0)).await;
    covered.extend(juggler.joined().iter().copied());
    for e in 1..epochs {
        let _ = juggler.on_epoch(Epoch(e)).await;
        covered.extend(juggler.joined().iter().copied());
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&comparison)?);
        return Ok(());
    }
    println!("🌈 RAINBOW model over {} validators x {} epochs", validators, epochs);
    println!(
        "   Undefended: {:.1}% mapped ({}/{})",
        comparison.before.success_rate * 100.0,
        comparison.before.validators_mapped,
        comparison.before.total_observed
    );
    println!(
        "   Defended ({} friends): {:.1}% mapped ({}/{})",
        friends,
        comparison.after.success_rate * 100.0,
        comparison.after.validators_mapped,
        comparison.after.total_observed
    );
    println!("   📉 Reduction: {:.1} points", comparison.reduction * 100.0);
    println!("   📊 stealth_attacker_success_rate {}", sink.attacker_success_rate.get());
    println!(
        "🔀 Juggler: {} extra subnets per epoch, {}/{} subnets visited, peak {} subscriptions",
        cfg.juggler.extra_subnets,
        covered.len(),
        SUBNET_COUNT,
        net.peak_subscribed()
    );
    Ok(())
}

async fn run(cfg: config::Config, stealth: bool) -> anyhow::Result<()> {
    let sink = MetricsSink::new()?;
    metrics::serve(cfg.metrics.clone(), sink.clone())?;

    let net = GossipsubNetwork::spawn(cfg.net.clone()).await.context("starting gossip network")?;
    let time: Arc<dyn TimeSource> = Arc::new(SystemClock);
    let orchestrator = Arc::new(DefenseOrchestrator::from_config(&cfg, Arc::new(net.clone()), time.clone(), sink)?);

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let ticker = orchestrator.clone().spawn(&shutdown_tx);

    // Friend side: verify and republish envelopes pushed to us. Without a
    // group key we are not part of any mesh and accept nothing.
    if let Some(group_key) = cfg.relay.group_key_bytes()? {
        let orchestrator = orchestrator.clone();
        let mut inbound = net.inbound_relays();
        let mut shutdown = shutdown_tx.subscribe();
        let mut inbox = RelayInbox::new(NullifierLog::new(group_key, cfg.relay.rate_limit_per_epoch), 4096);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    msg = inbound.recv() => match msg {
                        Ok(bytes) => {
                            let _ = orchestrator.accept_relayed(&mut inbox, &bytes).await;
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => warn!("📨 Relay inbox lagged by {} envelopes", n),
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });
    } else {
        info!("📭 No relay.group_key configured; relay inbox disabled");
    }

    if stealth {
        orchestrator.enable().await;
    }

    info!("🚀 stealth-sidecar is running");
    info!("   🆔 Peer ID: {}", net.local_peer_id());
    info!("   📡 P2P listening on port {}", cfg.net.listen_port);
    info!("   📊 Metrics available on http://{}", cfg.metrics.bind);
    info!("   ⌨️  Commands: enable | disable | status | attest <validator> <subnet> <hex> | shutdown");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            res = signal::ctrl_c() => {
                if let Err(err) = res {
                    error!("Error waiting for shutdown signal: {err}");
                }
                info!("🛑 Shutdown signal received, cleaning up...");
                break;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if !handle_command(&orchestrator, time.as_ref(), line.trim()).await {
                        break;
                    }
                }
                // stdin closed: keep serving until ctrl-c
                Ok(None) => {
                    if let Err(err) = signal::ctrl_c().await {
                        error!("Error waiting for shutdown signal: {err}");
                    }
                    break;
                }
                Err(e) => {
                    error!("stdin error: {e}");
                    break;
                }
            },
        }
    }

    orchestrator.disable().await;
    let _ = shutdown_tx.send(());
    let _ = ticker.await;
    info!("👋 stealth-sidecar stopped");
    Ok(())
}

/// One control line. Returns `false` when the sidecar should stop.
async fn handle_command(orchestrator: &DefenseOrchestrator, time: &dyn TimeSource, line: &str) -> bool {
    let parts: Vec<&str> = line.split_whitespace().collect();
    match parts.as_slice() {
        [] => {}
        ["enable"] => print_json(&orchestrator.enable().await),
        ["disable"] => print_json(&orchestrator.disable().await),
        ["status"] => print_json(&orchestrator.status().await),
        ["attest", validator, subnet, payload] => {
            match parse_attestation(validator, subnet, payload, time.now().as_millis() as u64) {
                Ok(att) => print_json(&orchestrator.on_attestation(att).await),
                Err(e) => eprintln!("❌ {e:#}"),
            }
        }
        ["shutdown"] | ["quit"] => return false,
        _ => eprintln!("❓ Unknown command: {line}"),
    }
    true
}

fn parse_attestation(validator: &str, subnet: &str, payload_hex: &str, now_ms: u64) -> anyhow::Result<Attestation> {
    let validator = validator.parse::<u64>().with_context(|| format!("bad validator index '{validator}'"))?;
    let subnet = SubnetId::new(subnet.parse::<u8>().with_context(|| format!("bad subnet '{subnet}'"))?)?;
    let payload = hex::decode(payload_hex).context("payload is not hex")?;
    Ok(Attestation::new(validator, subnet, payload, now_ms))
}

fn print_json<T: serde::Serialize>(value: &T) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{s}"),
        Err(e) => eprintln!("❌ Could not encode response: {e}"),
    }
}
