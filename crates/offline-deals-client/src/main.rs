//! Offline deals client daemon.
//!
//! Keeps the local storage node supplied with the data of its offline deals.
//!
//! # Usage
//!
//! ```bash
//! # Write a default configuration file
//! offline-deals-client init --config conf/app.toml
//!
//! # Run the daemon
//! offline-deals-client daemon --config conf/app.toml --datadir /var/lib/odc
//!
//! # Run with Prometheus metrics on :9091
//! offline-deals-client daemon --metrics-port 9091
//! ```
//!
//! # Graceful Shutdown
//!
//! The daemon handles SIGINT (Ctrl+C) and SIGTERM:
//! 1. Stops the reconciler and both workers at their next wait point
//! 2. Rolls back any transfer that was in flight
//! 3. Saves the ledger
//! 4. Exits cleanly

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use metrics::gauge;
use offline_deals_client::{
    ApiClient, NodeConfigDir, NodeRpcClient, RemoteStoreConnector, Settings, Syncer, SyncerConfig,
};
use offline_deals_core::metrics::{start_metrics_server, try_init_metrics};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Filedrive datasets offline deals client.
#[derive(Parser, Debug)]
#[command(name = "offline-deals-client")]
#[command(about = "Filedrive datasets offline deals client")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start an offline-deals-client daemon process
    Daemon(DaemonArgs),
    /// Initialize offline-deals-client
    Init(InitArgs),
}

#[derive(Args, Debug)]
struct DaemonArgs {
    /// Config file path
    #[arg(long, default_value = "conf/app.toml")]
    config: PathBuf,

    /// Log level for this client's crates
    #[arg(long, default_value = "debug")]
    loglevel: String,

    /// Directory to store data in
    #[arg(long, env = "ODC_DATADIR", default_value = "./data")]
    datadir: PathBuf,

    /// Metrics HTTP server port (0 to disable)
    #[arg(long, default_value = "0")]
    metrics_port: u16,
}

#[derive(Args, Debug)]
struct InitArgs {
    /// Output config file path
    #[arg(long, default_value = "conf/app.toml")]
    config: PathBuf,
}

fn init_tracing(level: &str) -> Result<()> {
    let filter = EnvFilter::from_default_env()
        .add_directive("info".parse()?)
        .add_directive(format!("offline_deals_client={level}").parse()?)
        .add_directive(format!("offline_deals_core={level}").parse()?);
    tracing_subscriber::fmt().with_env_filter(filter).init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Init(args) => init(args),
        Command::Daemon(args) => daemon(args).await,
    }
}

fn init(args: InitArgs) -> Result<()> {
    init_tracing("info")?;
    Settings::default()
        .write(&args.config)
        .with_context(|| format!("Failed to write {}", args.config.display()))?;
    tracing::info!("Wrote default configuration to {}", args.config.display());
    Ok(())
}

async fn daemon(args: DaemonArgs) -> Result<()> {
    init_tracing(&args.loglevel).context("Invalid log level")?;

    tracing::info!("Offline deals client starting...");

    let settings = Settings::load(&args.config).context("Failed to load configuration")?;
    let config = SyncerConfig::from_settings(&settings, &args.datadir)
        .context("Invalid configuration")?;

    std::fs::create_dir_all(&args.datadir)
        .with_context(|| format!("Failed to create {}", args.datadir.display()))?;
    std::fs::create_dir_all(&config.car_dir)
        .with_context(|| format!("Failed to create {}", config.car_dir.display()))?;

    // Initialize metrics
    if args.metrics_port > 0 {
        let metrics_handle =
            try_init_metrics().context("Metrics recorder already installed")?;
        start_metrics_server(args.metrics_port, metrics_handle).await?;
        gauge!("syncer_running").set(1.0);
    }

    // Set up graceful shutdown
    let cancel = CancellationToken::new();
    let signal = cancel.clone();
    ctrlc::set_handler(move || {
        tracing::info!("Shutdown Server ...");
        signal.cancel();
    })
    .context("Failed to set Ctrl+C handler")?;

    let http = reqwest::Client::builder()
        .connect_timeout(std::time::Duration::from_secs(30))
        .build()
        .context("Failed to build HTTP client")?;
    let api = ApiClient::with_http(http.clone(), &config.endpoint, &config.token);
    let connector = RemoteStoreConnector::new(api.clone(), http);
    let importer = NodeRpcClient::new(NodeConfigDir::from_env())?;

    let syncer = Syncer::new(
        config,
        Arc::new(api),
        Arc::new(connector),
        Arc::new(importer),
    );
    let result = syncer.run(cancel).await;

    if args.metrics_port > 0 {
        gauge!("syncer_running").set(0.0);
    }
    result.context("Syncer stopped on a fatal error")?;

    tracing::info!("Server exit");
    Ok(())
}
