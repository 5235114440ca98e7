use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use palisade::audit::AuditSink;
use palisade::clock::SystemClock;
use palisade::config::Config;
use palisade::janitor::Janitor;
use palisade::pipeline::Engine;
use palisade::server;
use palisade::store::ThreatStore;

#[derive(Parser, Debug)]
#[command(name = "palisade", version, about = "Stateful threat-detection and request-governance edge node")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address, overriding the configuration file
    #[arg(short, long)]
    listen: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => {
            info!("no config file given, using built-in defaults");
            Config::default()
        }
    };
    config.validate().context("invalid configuration")?;

    let addr: SocketAddr = match args.listen {
        Some(addr) => addr,
        None => format!("{}:{}", config.server.host, config.server.port)
            .parse()
            .with_context(|| {
                format!(
                    "invalid listen address '{}:{}'",
                    config.server.host, config.server.port
                )
            })?,
    };

    info!("╔══════════════════════════════════════════╗");
    info!("║  Palisade Request-Governance Engine      ║");
    info!("╚══════════════════════════════════════════╝");
    info!(
        "policy: ban at {} points for {}s, burst limit {}/s",
        config.policy.ban_threshold, config.policy.ban_duration_secs, config.rate.burst_limit
    );

    let clock = Arc::new(SystemClock);
    let audit = if config.audit.log_path.is_empty() {
        warn!("no audit log file configured, events kept in memory only");
        AuditSink::in_memory(clock.clone(), config.audit.buffer_capacity)
    } else {
        info!("audit log: {}", config.audit.log_path);
        AuditSink::with_log_file(
            clock.clone(),
            config.audit.buffer_capacity,
            &config.audit.log_path,
        )
    };
    let audit = Arc::new(audit);

    let store = Arc::new(ThreatStore::new(clock, audit));
    let janitor = Janitor::new(store.clone(), config.janitor.clone());
    let _janitor_handle = janitor.spawn();

    let engine = Arc::new(Engine::new(config, store));

    info!("admin API mounted at /palisade/api/");
    server::run(addr, engine).await
}
