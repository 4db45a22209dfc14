use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;

use blockworker::config::{Cli, Config};
use blockworker::server::{build_router, AppState};
use blockworker::worker::BlockWorker;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging.
    let filter = if cli.verbose {
        "blockworker=debug,tower_http=debug"
    } else {
        "blockworker=info,tower_http=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_target(true)
        .init();

    info!("blockworker v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration.
    let mut config = Config::load(&cli.config)?;
    config.server.listen = cli.listen.clone();

    info!(
        tiers = config.tiers.tiers.len(),
        total_capacity = config.tiers.total_capacity(),
        eviction = %config.eviction.policy,
        ufs_root = %config.ufs.root.display(),
        "Configuration loaded"
    );

    // Bring up the worker and its background loops.
    let worker = BlockWorker::standalone(config).await?;
    worker.start().await?;

    // Serve the admin surface.
    let state = Arc::new(AppState {
        worker,
        start_time: Instant::now(),
    });
    let app = build_router(state);

    let listen_addr = cli.listen;
    info!(addr = listen_addr, "Starting admin server");

    let listener = TcpListener::bind(&listen_addr).await?;
    info!("Listening on {listen_addr}");

    axum::serve(listener, app).await?;

    Ok(())
}
