//! polybook-connector: keeps live Polymarket order books in sync
//!
//! Subscribes to the CLOB market channel for a static and/or discovered set
//! of assets and serves health, readiness, metrics and book lookups over HTTP.

use clap::Parser;
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use polybook_connector_lib::polymarket::GammaMarketSource;
use polybook_connector_lib::server::{run_server, ServerState};
use polybook_connector_lib::{
    run_discovery, AssetId, BookStore, BookSyncClient, ConnectionState, SubscriptionRegistry,
    SyncEvent, SyncStatus,
};
use polybook_metadata::{LogFormat, LoggingConfig, SyncConfig};

#[derive(Parser, Debug)]
#[command(name = "polybook-connector")]
#[command(about = "Polymarket order book sync daemon")]
struct Args {
    /// Path to YAML configuration; built-in defaults apply when omitted
    #[arg(short, long, env = "POLYBOOK_CONFIG")]
    config: Option<PathBuf>,

    /// Asset (token) IDs to subscribe, in addition to those in the config
    #[arg(long = "asset", env = "POLYBOOK_ASSETS", value_delimiter = ',')]
    assets: Vec<String>,

    /// Enable Gamma market discovery regardless of the config
    #[arg(long)]
    discover: bool,

    /// Health server bind address
    #[arg(long, default_value = "0.0.0.0:8080", env = "POLYBOOK_HEALTH_ADDR")]
    health_addr: String,

    /// Seconds between status log lines
    #[arg(long, default_value = "60")]
    status_interval_secs: u64,
}

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    match logging.format {
        LogFormat::Json => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init(),
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => SyncConfig::load(path)?,
        None => SyncConfig::default(),
    };
    for asset in &args.assets {
        let asset = asset.trim();
        if !asset.is_empty() && !config.assets.iter().any(|a| a == asset) {
            config.assets.push(asset.to_string());
        }
    }
    if args.discover {
        config.discovery.enabled = true;
    }
    config.validate()?;

    init_tracing(&config.logging);
    info!(
        url = %config.websocket.url,
        static_assets = config.assets.len(),
        discovery = config.discovery.enabled,
        fingerprint_policy = ?config.reconcile.fingerprint_policy,
        "Loaded configuration"
    );

    if config.assets.is_empty() && !config.discovery.enabled {
        warn!("No assets configured and discovery disabled; the book store will stay empty");
    }

    // Setup shutdown signal
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Received shutdown signal");
        shutdown_tx.send(true).ok();
    });

    let health_addr: SocketAddr = args.health_addr.parse()?;

    let mut client = BookSyncClient::from_config(&config)?;
    let registry = client.registry();
    let store = client.store();
    let state = client.state_handle();
    let stale_after = config.reconcile.stale_after();

    let server_state = ServerState {
        feed_name: "polymarket".to_string(),
        state: state.clone(),
        registry: registry.clone(),
        store: store.clone(),
        metrics: client.metrics(),
        stale_after,
    };
    tokio::spawn(async move {
        if let Err(e) = run_server(health_addr, server_state).await {
            error!(error = %e, "Health server failed");
        }
    });

    if config.discovery.enabled {
        let source = GammaMarketSource::from_config(&config.discovery)?;
        let pinned: BTreeSet<AssetId> = config
            .assets
            .iter()
            .map(|a| AssetId::from(a.as_str()))
            .collect();
        let max_assets = config.discovery.max_assets;
        let interval = config.discovery.refresh_interval();
        let registry = registry.clone();
        let shutdown = shutdown_rx.clone();
        info!(
            base_url = %config.discovery.base_url,
            interval_secs = interval.as_secs(),
            max_assets,
            "Starting market discovery"
        );
        tokio::spawn(async move {
            run_discovery(&source, registry, pinned, max_assets, interval, shutdown).await;
        });
    }

    if let Some(events) = client.events() {
        tokio::spawn(log_events(events));
    }

    tokio::spawn(log_status(
        state,
        registry,
        store.clone(),
        stale_after,
        Duration::from_secs(args.status_interval_secs.max(1)),
        shutdown_rx.clone(),
    ));

    client.run(shutdown_rx).await;

    log_final_books(&store);
    info!("Connector shutdown complete");
    Ok(())
}

async fn log_events(mut events: mpsc::Receiver<SyncEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            SyncEvent::Connected => info!("Feed connected"),
            SyncEvent::Disconnected { reason } => warn!(%reason, "Feed disconnected"),
            SyncEvent::Trade(trade) => debug!(
                asset = %trade.asset_id,
                price = %trade.price,
                size = ?trade.size,
                side = ?trade.side,
                "Trade"
            ),
            SyncEvent::Desync(desync) => {
                warn!(asset = %desync.asset(), error = %desync, "Book desync, resubscribing")
            }
            SyncEvent::Rejected(rejection) => warn!(
                asset = %rejection.asset,
                reason = %rejection.reason,
                "Asset dropped"
            ),
        }
    }
}

async fn log_status(
    state: watch::Receiver<ConnectionState>,
    registry: Arc<SubscriptionRegistry>,
    store: Arc<BookStore>,
    stale_after: Duration,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let current = *state.borrow();
                let status = SyncStatus::collect(current, &registry, &store, stale_after);
                info!(
                    state = %status.state,
                    registered = status.assets_registered,
                    confirmed = status.assets_confirmed,
                    books = status.books,
                    stale = status.books_stale,
                    "Status"
                );
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

fn log_final_books(store: &BookStore) {
    let mut books: Vec<_> = store.snapshot_all().into_iter().collect();
    books.sort_by(|a, b| a.0.cmp(&b.0));
    for (asset, book) in books {
        let (bid_levels, ask_levels) = book.depth();
        info!(
            asset = %asset,
            best_bid = ?book.best_bid().map(|l| l.price),
            best_ask = ?book.best_ask().map(|l| l.price),
            bid_levels,
            ask_levels,
            stale = book.is_stale(),
            "Final book"
        );
    }
}
