//! # Chime — reminder scheduling and live notification delivery
//!
//! Usage:
//!   chime                          # Start with ~/.chime/config.toml (or defaults)
//!   chime --config ./chime.toml    # Explicit config file
//!   chime --port 8080 --verbose    # Override the gateway port, debug logging

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chime_core::ChimeConfig;
use chime_gateway::{AppState, Fanout, SessionHub};
use chime_scheduler::{ReminderDb, ReminderEngine};
use clap::Parser;
use tokio::sync::Notify;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "chime",
    version,
    about = "🔔 Chime — reminders for events and tasks, delivered live"
)]
struct Cli {
    /// Config file (default: $CHIME_CONFIG or ~/.chime/config.toml)
    #[arg(short, long)]
    config: Option<String>,

    /// Gateway port (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Gateway bind address (overrides config)
    #[arg(long)]
    host: Option<String>,

    /// Reminder database path (overrides config)
    #[arg(long)]
    db_path: Option<String>,

    /// Scan interval in seconds (overrides config)
    #[arg(long)]
    interval: Option<u64>,

    /// Emit JSON log lines
    #[arg(long)]
    json_logs: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn expand_path(p: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(p).to_string())
}

fn init_logging(cli: &Cli) {
    let filter = if cli.verbose {
        "chime=debug,chime_core=debug,chime_providers=debug,chime_scheduler=debug,\
         chime_gateway=debug,tower_http=debug"
    } else {
        "chime=info,chime_providers=info,chime_scheduler=info,chime_gateway=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    if cli.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }
}

fn load_config(cli: &Cli) -> Result<ChimeConfig> {
    let mut config = match &cli.config {
        Some(path) => ChimeConfig::load_from(&expand_path(path))
            .with_context(|| format!("loading config from {path}"))?,
        None => ChimeConfig::load().context("loading config")?,
    };
    if let Some(port) = cli.port {
        config.gateway.port = port;
    }
    if let Some(host) = &cli.host {
        config.gateway.host = host.clone();
    }
    if let Some(db_path) = &cli.db_path {
        config.database.path = db_path.clone();
    }
    if let Some(interval) = cli.interval {
        config.scheduler.interval_secs = interval;
    }
    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn open_db(path: &Path) -> Result<ReminderDb> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
    }
    ReminderDb::open(path).with_context(|| format!("opening {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli);

    let config = load_config(&cli)?;
    let db_path = config.database.resolved_path();
    let db = open_db(&db_path)?;
    tracing::info!("🗄️ Reminder store: {}", db_path.display());

    let estimator = chime_providers::create_estimator(&config.estimator);
    tracing::info!("🧮 Lead-time estimator: {}", estimator.name());

    let hub = Arc::new(SessionHub::new());
    let engine = ReminderEngine::new(
        Arc::new(db.clone()),
        estimator,
        Arc::new(Fanout::new(hub.clone())),
        config.scheduler.clone(),
    );

    let stop_scanner = Arc::new(Notify::new());
    let scanner = engine.spawn(stop_scanner.clone());

    let stop_gateway = Arc::new(Notify::new());
    let mut gateway = {
        let state = AppState::new(config.gateway.clone(), db, engine, hub);
        let stop = stop_gateway.clone();
        tokio::spawn(chime_gateway::start(state, async move { stop.notified().await }))
    };

    let gateway_result = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("waiting for Ctrl-C")?;
            tracing::info!("🛑 Shutting down");
            None
        }
        result = &mut gateway => Some(result),
    };

    // Scanner first so no new reminders are fired while sessions close.
    stop_scanner.notify_one();
    if let Err(e) = scanner.await {
        tracing::error!("❌ Scanner task failed: {e}");
    }

    let gateway_result = match gateway_result {
        Some(result) => result,
        None => {
            stop_gateway.notify_one();
            gateway.await
        }
    };
    match gateway_result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => return Err(e).context("gateway server failed"),
        Err(e) => return Err(e).context("gateway task failed"),
    }

    tracing::info!("👋 Chime stopped");
    Ok(())
}
