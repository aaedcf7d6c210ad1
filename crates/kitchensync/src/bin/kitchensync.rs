//! kitchensync - synchronized playback and cue triggers across nodes
//!
//! - `kitchensync run` picks the role from configuration
//! - `kitchensync leader` runs a leader with an operator console on stdin
//! - `kitchensync follower` runs a follower
//! - `kitchensync status` asks every follower on the network for its state
//! - `kitchensync config` prints the effective configuration

use std::fs::OpenOptions;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kitchenconf::{ConfigSources, KitchenConfig, NodeRole, OutputKind};
use kitchensync::{
    command, telemetry, FollowerNode, LeaderNode, LineProtocolSink, Player, SimulatedPlayer,
    TracingSink, TriggerSink,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "kitchensync")]
#[command(about = "Leader/follower playback sync and cue scheduling")]
#[command(version)]
struct Cli {
    /// Config file, layered over the discovered ones
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override node.node_id
    #[arg(long, global = true)]
    node_id: Option<String>,

    /// Override telemetry.log_level
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run as the role named in the config (a leader starts immediately)
    Run,

    /// Run as leader with a console: start, stop, status, reload, quit
    Leader {
        /// Start a session without waiting for the console
        #[arg(long)]
        auto_start: bool,
    },

    /// Run as follower
    Follower,

    /// Broadcast a status request and print the answers
    Status {
        /// How long to collect answers
        #[arg(short, long, default_value = "1000")]
        timeout_ms: u64,
    },

    /// Print the effective configuration and where it came from
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (mut config, sources) = KitchenConfig::load_with_sources_from(cli.config.as_deref())
        .context("failed to load configuration")?;
    if let Some(node_id) = cli.node_id {
        config.infra.node.node_id = node_id;
    }
    if let Some(level) = cli.log_level {
        config.infra.telemetry.log_level = level;
    }
    config.validate().context("invalid configuration")?;

    telemetry::init(&config.infra.telemetry.log_level)?;
    info!(
        files = ?sources.files,
        env = ?sources.env_overrides,
        node_id = %config.infra.node.node_id,
        "configuration loaded"
    );

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    match cli.command {
        Commands::Run => match config.infra.node.role {
            NodeRole::Leader => run_leader(&config, true, false, shutdown).await,
            NodeRole::Follower => run_follower(&config, shutdown).await,
        },
        Commands::Leader { auto_start } => run_leader(&config, auto_start, true, shutdown).await,
        Commands::Follower => run_follower(&config, shutdown).await,
        Commands::Status { timeout_ms } => {
            print_status(&config, Duration::from_millis(timeout_ms)).await
        }
        Commands::Config => {
            print_config(&config, &sources);
            Ok(())
        }
    }
}

/// Cancel the root token on Ctrl-C or SIGTERM.
fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    warn!(error = %e, "SIGTERM handler unavailable");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            result = ctrl_c => {
                if let Err(e) = result {
                    warn!(error = %e, "Ctrl-C handler failed");
                    return;
                }
                info!("received Ctrl-C, shutting down");
            }
            _ = terminate => info!("received SIGTERM, shutting down"),
        }
        shutdown.cancel();
    });
}

fn build_player(config: &KitchenConfig) -> Arc<dyn Player> {
    let playback = &config.infra.playback;
    Arc::new(SimulatedPlayer::new(playback.duration_seconds, playback.looping))
}

fn build_sink(config: &KitchenConfig) -> Result<Arc<dyn TriggerSink>> {
    let output = &config.infra.output;
    match output.kind {
        OutputKind::Log => Ok(Arc::new(TracingSink)),
        OutputKind::Serial => {
            let device = output
                .device
                .as_ref()
                .context("output.kind = \"serial\" requires output.device")?;
            let writer = OpenOptions::new()
                .write(true)
                .open(device)
                .with_context(|| format!("failed to open trigger device {}", device.display()))?;
            info!(device = %device.display(), "trigger output on serial device");
            Ok(Arc::new(LineProtocolSink::new(writer)))
        }
    }
}

async fn run_leader(
    config: &KitchenConfig,
    auto_start: bool,
    console: bool,
    shutdown: CancellationToken,
) -> Result<()> {
    let leader = LeaderNode::spawn(config, build_player(config), build_sink(config)?, shutdown.clone())
        .await
        .context("failed to start leader")?;

    if auto_start {
        leader.start().await?;
    }
    if console {
        run_console(&leader, &shutdown).await;
    } else {
        shutdown.cancelled().await;
    }

    let stats = leader.shutdown().await?;
    info!(fired = stats.fired_total, "leader exited");
    Ok(())
}

async fn run_follower(config: &KitchenConfig, shutdown: CancellationToken) -> Result<()> {
    let follower =
        FollowerNode::spawn(config, build_player(config), build_sink(config)?, shutdown.clone())
            .await
            .context("failed to start follower")?;

    shutdown.cancelled().await;

    let stats = follower.shutdown().await?;
    info!(fired = stats.fired_total, "follower exited");
    Ok(())
}

/// Stdin lines on a plain thread; a blocked read must not hold up runtime
/// shutdown.
fn stdin_lines() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(8);
    std::thread::spawn(move || {
        for line in std::io::stdin().lines() {
            let Ok(line) = line else { break };
            if tx.blocking_send(line).is_err() {
                break;
            }
        }
    });
    rx
}

async fn run_console(leader: &LeaderNode, shutdown: &CancellationToken) {
    println!("commands: start, stop, status, reload, quit");
    let mut lines = stdin_lines();

    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => break,
            line = lines.recv() => line,
        };
        let Some(line) = line else {
            // stdin closed; keep serving until a signal arrives
            shutdown.cancelled().await;
            break;
        };

        match line.trim() {
            "" => {}
            "start" => match leader.start().await {
                Ok(epoch) => println!("session {} running", epoch),
                Err(e) => println!("start failed: {:#}", e),
            },
            "stop" => match leader.stop().await {
                Ok(Some(epoch)) => println!("session {} stopped", epoch),
                Ok(None) => println!("no session running"),
                Err(e) => println!("stop failed: {:#}", e),
            },
            "status" => {
                let asked = leader.request_status().await;
                if asked > 0 {
                    tokio::time::sleep(Duration::from_millis(300)).await;
                }
                print_leader_status(leader).await;
            }
            "reload" => match leader.publish_schedule().await {
                Ok(cues) => println!("schedule with {} cues sent to followers", cues),
                Err(e) => println!("reload failed: {:#}", e),
            },
            "quit" | "exit" => break,
            other => println!("unknown command '{}'", other),
        }
    }
}

async fn print_leader_status(leader: &LeaderNode) {
    let own = leader.snapshot();
    match leader.current_epoch().await {
        Some(epoch) => println!("{}: session {} ({})", leader.node_id(), epoch, own.status_label()),
        None => println!("{}: idle", leader.node_id()),
    }
    match serde_json::to_string_pretty(&leader.report().await) {
        Ok(json) => println!("{}", json),
        Err(e) => println!("failed to render registry: {}", e),
    }
}

async fn print_status(config: &KitchenConfig, wait: Duration) -> Result<()> {
    let bind = &config.infra.bind;
    let target = SocketAddr::new(bind.broadcast_addr, bind.follower_control_port);
    let answers = command::query_status(bind.bind_addr, target, wait).await?;

    if answers.is_empty() {
        println!("no followers answered within {:?}", wait);
        return Ok(());
    }
    println!(
        "{:<20} {:<22} {:<18} {:>12} {:>12} {:>6}",
        "NODE", "ADDRESS", "STATE", "DEVIATION", "FILTERED", "CORR"
    );
    for (addr, report) in answers {
        println!(
            "{:<20} {:<22} {:<18} {:>12} {:>12} {:>6}",
            report.node_id,
            addr.to_string(),
            report.correction_state.as_str(),
            format_seconds(report.last_deviation),
            format_seconds(report.filtered_deviation),
            report.corrections,
        );
    }
    Ok(())
}

fn format_seconds(value: Option<f64>) -> String {
    value.map_or_else(|| "-".to_string(), |v| format!("{:+.3}s", v))
}

fn print_config(config: &KitchenConfig, sources: &ConfigSources) {
    if sources.files.is_empty() {
        println!("# no config files found, using defaults");
    }
    for file in &sources.files {
        println!("# loaded: {}", file.display());
    }
    for var in &sources.env_overrides {
        println!("# env override: {}", var);
    }
    println!("{}", config.to_toml());
}
