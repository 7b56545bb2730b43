//! Controller service entry point

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use controller::api::HttpApi;
use controller::config::Config;
use controller::coordinator::{LocalCoordinator, StaticTableConfigs};
use controller::Controller;

/// Controller - Segment assignment and rebalancing engine
#[derive(Parser, Debug)]
#[command(name = "controller")]
#[command(about = "Segment assignment and rebalancing controller")]
struct Args {
    /// Configuration file (YAML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Cluster name
    #[arg(long)]
    cluster: Option<String>,

    /// Data directory of the local coordinator
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// HTTP API listen address
    #[arg(long)]
    http_addr: Option<String>,

    /// Log level
    #[arg(long)]
    log_level: Option<String>,

    /// Disable periodic reconciliation
    #[arg(long)]
    no_reconcile: bool,
}

impl Args {
    /// Command line values override the configuration file
    fn apply(&self, config: &mut Config) {
        if let Some(cluster) = &self.cluster {
            config.controller.cluster_name = cluster.clone();
        }
        if let Some(data_dir) = &self.data_dir {
            config.coordinator.data_dir = data_dir.clone();
        }
        if let Some(addr) = &self.http_addr {
            config.http.addr = addr.clone();
        }
        if let Some(level) = &self.log_level {
            config.log.level = level.clone();
        }
        if self.no_reconcile {
            config.reconcile.enabled = false;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    args.apply(&mut config);
    config.validate()?;

    // Initialize logging
    let level = match config.log.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting controller...");
    info!("  Cluster: {}", config.controller.cluster_name);
    info!("  Data dir: {:?}", config.coordinator.data_dir);
    info!("  HTTP API: {}", config.http.addr);
    info!("  Tables: {}", config.tables.len());

    let coordinator = Arc::new(LocalCoordinator::open(&config.coordinator.data_dir).await?);
    let tables = Arc::new(StaticTableConfigs::new(config.tables.clone()));
    let controller = Arc::new(Controller::new(
        config.clone(),
        coordinator.clone(),
        tables,
    ));

    // Start background tasks
    if config.reconcile.enabled {
        let _reconcile_handle = controller.clone().start_reconciler();
    }

    let snapshot_interval = config.coordinator.snapshot_interval();
    let snapshots = coordinator.clone();
    let _save_handle = tokio::spawn(async move {
        let mut interval = tokio::time::interval(snapshot_interval);
        loop {
            interval.tick().await;
            if let Err(e) = snapshots.save().await {
                error!("Failed to save coordinator snapshot: {}", e);
            }
        }
    });

    // Start HTTP API
    let http_api = HttpApi::new(controller, coordinator.clone());
    let app = http_api.router();

    let listener = tokio::net::TcpListener::bind(&config.http.addr).await?;
    info!("HTTP API listening on {}", config.http.addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    coordinator.save().await?;
    info!("Controller stopped");
    Ok(())
}
