//! Periodic discovery refresh: keeps the subscription registry in line with
//! the markets a [`MarketSource`] reports as open.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::error::DiscoveryError;
use crate::polymarket::market_discovery::collect_asset_ids;
use crate::registry::SubscriptionRegistry;
use crate::traits::MarketSource;
use crate::types::AssetId;

/// One refresh. `pinned` assets (from static config) are always kept.
/// Returns (added, removed).
pub async fn refresh_subscriptions<S: MarketSource + ?Sized>(
    source: &S,
    registry: &SubscriptionRegistry,
    pinned: &BTreeSet<AssetId>,
    max_assets: usize,
) -> Result<(usize, usize), DiscoveryError> {
    let markets = source.fetch_markets().await?;
    let mut desired = collect_asset_ids(&markets, max_assets);
    desired.extend(pinned.iter().cloned());
    Ok(registry.sync_to(&desired))
}

/// Refreshes immediately, then every `interval`, until shutdown. A failed
/// fetch keeps the current subscriptions.
pub async fn run_discovery<S: MarketSource + ?Sized>(
    source: &S,
    registry: Arc<SubscriptionRegistry>,
    pinned: BTreeSet<AssetId>,
    max_assets: usize,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match refresh_subscriptions(source, &registry, &pinned, max_assets).await {
                    Ok((added, removed)) => {
                        info!(added, removed, total = registry.len(), "discovery refresh complete")
                    }
                    Err(e) => warn!(error = %e, "discovery refresh failed, keeping current subscriptions"),
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}
