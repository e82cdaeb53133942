//! Fleetcast - real-time dispatch server
//!
//! Serves the command API, provider webhooks and the persistent connection
//! routes on one listener, and runs the bus listener and the location
//! broadcaster alongside.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};

use fleetcast::config::Config;
use fleetcast::dispatch::Dispatch;
use fleetcast::presence::MemoryPresence;
use fleetcast::provider::HttpProvider;
use fleetcast::pubsub::{MemoryPubSub, PubSub};
use fleetcast::relay::spawn_broadcaster;
use fleetcast::store::{DirectorySeed, MemoryStore};

#[derive(Parser, Debug)]
#[command(name = "fleetcast")]
#[command(about = "Real-time dispatch and wallet reconciliation server")]
#[command(version)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Listen address, overrides FLEETCAST_BIND
    #[arg(short, long)]
    bind: Option<SocketAddr>,
}

async fn init_pubsub(config: &Config) -> anyhow::Result<Arc<dyn PubSub>> {
    #[cfg(feature = "postgres")]
    if let Some(url) = &config.database_url {
        let pubsub = fleetcast::pubsub::PostgresPubSub::new(url).await?;
        info!("PostgreSQL pub/sub connected");
        return Ok(Arc::new(pubsub));
    }

    #[cfg(not(feature = "postgres"))]
    if config.database_url.is_some() {
        tracing::warn!("FLEETCAST_DATABASE_URL set but built without the postgres feature");
    }

    info!("Memory pub/sub initialized (single-node only)");
    Ok(Arc::new(MemoryPubSub::new()))
}

async fn load_directory(config: &Config) -> anyhow::Result<MemoryStore> {
    let Some(path) = &config.directory_file else {
        return Ok(MemoryStore::new());
    };

    let raw = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading directory file {}", path.display()))?;
    let seed: DirectorySeed = serde_json::from_slice(&raw)
        .with_context(|| format!("parsing directory file {}", path.display()))?;
    info!(users = seed.users.len(), wallets = seed.wallets.len(), "user directory loaded");
    Ok(MemoryStore::from_seed(seed))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(&args.log_level)
        .init();

    info!("Fleetcast v{}", env!("CARGO_PKG_VERSION"));

    let mut config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load config: {}", e);
            error!("Required env vars: FLEETCAST_TOKEN_SECRET, FLEETCAST_WEBHOOK_SECRET");
            std::process::exit(1);
        }
    };
    if let Some(bind) = args.bind {
        config.bind = bind;
    }

    info!(
        bind = %config.bind,
        platform_cut = %config.platform_cut,
        wallet_floor = %config.wallet_floor,
        broadcast_interval_secs = config.broadcast_interval.as_secs(),
        "Configuration loaded"
    );

    let store = Arc::new(load_directory(&config).await?);
    let presence = Arc::new(MemoryPresence::new());
    let bus = init_pubsub(&config).await?;
    let provider = Arc::new(HttpProvider::new(
        config.provider_url.clone(),
        config.webhook_secret.clone(),
        config.provider_timeout,
    )?);

    let ctx = Arc::new(Dispatch::new(&config, store, presence, bus.clone(), provider));

    {
        let hub = ctx.hub.clone();
        tokio::spawn(async move {
            info!("Starting pub/sub listener");
            if let Err(e) = bus.listen(hub).await {
                error!(error = %e, "pub/sub listener stopped");
            }
        });
    }
    let broadcaster = spawn_broadcaster(ctx.relay.clone(), config.broadcast_interval);

    let app = fleetcast::api::router(ctx);
    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("binding {}", config.bind))?;
    info!(addr = %config.bind, "Listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    broadcaster.abort();
    info!("Fleetcast stopped");
    Ok(())
}
