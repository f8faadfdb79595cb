use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use scan_relay_rs::access::AccessList;
use scan_relay_rs::commands::ChatBot;
use scan_relay_rs::config::{self, Config};
use scan_relay_rs::orchestrator::Orchestrator;
use scan_relay_rs::server::{self, AppState};
use scan_relay_rs::transport::MemoryTransport;
use scan_relay_rs::types::UserId;

/// Chat-driven masscan session orchestrator.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "scan-relay-rs",
    version,
    about = "Chat-driven masscan runs with live progress, timeouts and cancellation.",
    long_about = None
)]
struct Cli {
    /// Path to a TOML config file. Defaults to the platform config dir when present.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address for the chat HTTP API.
    #[arg(long)]
    bind: Option<String>,

    /// Directory for uploaded range lists and result files.
    #[arg(long = "files-dir")]
    files_dir: Option<PathBuf>,

    /// Owner user id; only the owner and sudo users may scan.
    #[arg(long)]
    owner: Option<UserId>,

    /// Engine command words, e.g. `--engine sudo --engine masscan`.
    #[arg(long = "engine")]
    engine: Vec<String>,

    /// Write the effective configuration to the config file and exit.
    #[arg(long = "write-config", default_value_t = false)]
    write_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // CLI > file > built-in defaults
    let mut cfg = match config::load_config(cli.config.as_deref()) {
        Ok(found) => found.unwrap_or_default(),
        Err(e) => {
            warn!("failed to load config file, using defaults: {e:#}");
            Config::default()
        }
    };
    if let Some(bind) = cli.bind {
        cfg.bind = bind;
    }
    if let Some(dir) = cli.files_dir {
        cfg.files_dir = dir;
    }
    if cli.owner.is_some() {
        cfg.owner_id = cli.owner;
    }
    if !cli.engine.is_empty() {
        cfg.engine.command = cli.engine;
    }

    if cli.write_config {
        let path = config::save_config(&cfg, cli.config.as_deref())?;
        println!("wrote configuration to {}", path.display());
        return Ok(());
    }

    info!(
        bind = %cfg.bind,
        files_dir = %cfg.files_dir.display(),
        engine = ?cfg.engine.command,
        max_concurrent_scans = cfg.max_concurrent_scans,
        scan_timeout_secs = cfg.scan_timeout_secs,
        "starting"
    );
    if cfg.owner_id.is_none() {
        warn!("no owner configured; every user may start scans");
    }

    let bind = cfg.bind.clone();
    let access = Arc::new(AccessList::new(cfg.owner_id));
    let outbox = Arc::new(MemoryTransport::new());
    let orchestrator = Orchestrator::new(cfg, outbox.clone());
    let bot = ChatBot::new(orchestrator, access);

    server::serve(&bind, AppState::new(bot, outbox)).await
}
