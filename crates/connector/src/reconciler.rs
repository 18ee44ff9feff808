//! Applies decoded events to the book store.
//!
//! Owned by the ingestion loop, so every store mutation for the client is
//! serialized through one `Reconciler`.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use polybook_metadata::FingerprintPolicy;
use rust_decimal::Decimal;
use tracing::{debug, info, trace, warn};

use crate::book::{BookState, LevelChange};
use crate::decoder::DomainEvent;
use crate::error::{DesyncError, PermanentRejection};
use crate::fingerprint::ladder_fingerprint;
use crate::metrics::SyncMetrics;
use crate::registry::SubscriptionRegistry;
use crate::store::BookStore;
use crate::types::{Side, TradeTick};

/// Result of applying one event.
#[derive(Debug, Clone, PartialEq)]
pub enum Applied {
    /// Book replaced. `confirmed` is true when this snapshot confirmed the
    /// subscription on the current connection.
    Snapshot { confirmed: bool },
    Delta(LevelChange),
    /// Delta for an asset with no book yet.
    DeltaBeforeSnapshot,
    /// Delta for an asset awaiting a snapshot on the current connection.
    DeltaUnconfirmed,
    Trade(TradeTick),
    Rejected(PermanentRejection),
    /// Event for an asset that is not registered.
    Untracked,
    Ignored,
}

pub struct Reconciler {
    store: Arc<BookStore>,
    registry: Arc<SubscriptionRegistry>,
    metrics: Arc<SyncMetrics>,
    policy: FingerprintPolicy,
}

impl Reconciler {
    pub fn new(
        store: Arc<BookStore>,
        registry: Arc<SubscriptionRegistry>,
        metrics: Arc<SyncMetrics>,
        policy: FingerprintPolicy,
    ) -> Self {
        Self {
            store,
            registry,
            metrics,
            policy,
        }
    }

    pub fn policy(&self) -> FingerprintPolicy {
        self.policy
    }

    pub fn apply(&self, event: DomainEvent) -> Result<Applied, DesyncError> {
        match event {
            DomainEvent::Snapshot {
                asset,
                bids,
                asks,
                fingerprint,
                timestamp,
            } => {
                if !self.registry.is_registered(&asset) {
                    trace!(asset = %asset, "snapshot for unregistered asset ignored");
                    return Ok(Applied::Untracked);
                }
                let book = BookState::from_snapshot(
                    asset.clone(),
                    bids,
                    asks,
                    fingerprint,
                    timestamp,
                    Utc::now(),
                );
                let (bid_levels, ask_levels) = book.depth();
                if !self.store_book(book) {
                    trace!(asset = %asset, "asset removed while applying snapshot");
                    return Ok(Applied::Untracked);
                }
                let confirmed = self.registry.confirm(&asset);
                if confirmed {
                    debug!(asset = %asset, bid_levels, ask_levels, "subscription confirmed");
                }
                Ok(Applied::Snapshot { confirmed })
            }

            DomainEvent::Delta {
                asset,
                side,
                price,
                new_size,
                fingerprint,
                best_bid,
                best_ask,
                timestamp,
            } => {
                let Ok(current) = self.store.get(&asset) else {
                    trace!(asset = %asset, "delta before snapshot skipped");
                    self.skipped("before_snapshot");
                    return Ok(Applied::DeltaBeforeSnapshot);
                };
                if !self.registry.is_confirmed(&asset) {
                    trace!(asset = %asset, "delta for unconfirmed asset skipped");
                    self.skipped("unconfirmed");
                    return Ok(Applied::DeltaUnconfirmed);
                }

                let mut next = BookState::clone(&current);
                let change = next.apply_level(side, price, new_size);
                next.touch(fingerprint.clone(), timestamp, Utc::now());

                let desync = match self.policy {
                    FingerprintPolicy::Record => None,
                    FingerprintPolicy::TopOfBook => top_of_book_mismatch(&next, best_bid, best_ask),
                    FingerprintPolicy::Verify => fingerprint_mismatch(&next, fingerprint),
                };
                if let Some(err) = desync {
                    // The old ladder stays in place until the fresh snapshot arrives.
                    warn!(error = %err, "book desync, requesting resubscribe");
                    self.metrics.desyncs.inc();
                    self.registry.request_resubscribe(&asset);
                    return Err(err);
                }

                if !self.store_book(next) {
                    return Ok(Applied::Untracked);
                }
                Ok(Applied::Delta(change))
            }

            DomainEvent::Trade(trade) => {
                if !self.registry.is_registered(&trade.asset_id) {
                    return Ok(Applied::Untracked);
                }
                if !self
                    .store
                    .record_trade_if(trade.clone(), |a| self.registry.is_registered(a))
                {
                    return Ok(Applied::Untracked);
                }
                Ok(Applied::Trade(trade))
            }

            DomainEvent::Rejected { asset, reason } => {
                if !self.registry.remove_asset(&asset) {
                    return Ok(Applied::Untracked);
                }
                self.metrics.rejections.inc();
                warn!(asset = %asset, reason = %reason, "asset rejected by feed");
                Ok(Applied::Rejected(PermanentRejection { asset, reason }))
            }

            DomainEvent::Unrecognized { event_type, raw } => {
                debug!(
                    event_type = event_type.as_deref().unwrap_or("<none>"),
                    len = raw.len(),
                    "unrecognized event ignored"
                );
                Ok(Applied::Ignored)
            }
        }
    }

    /// Handles subscriptions that never produced a snapshot. Overdue assets
    /// get a targeted resubscribe until `max_attempts` have been spent, after
    /// which they are dropped and reported as rejected.
    pub fn sweep_unconfirmed(
        &self,
        timeout: Duration,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Vec<PermanentRejection> {
        let mut rejected = Vec::new();
        for (asset, attempts) in self.registry.overdue(timeout, now) {
            if attempts >= max_attempts {
                if self.registry.remove_asset(&asset) {
                    self.metrics.rejections.inc();
                    let reason = format!("no snapshot after {} resubscribe attempts", attempts);
                    warn!(asset = %asset, attempts, "giving up on unconfirmed asset");
                    rejected.push(PermanentRejection { asset, reason });
                }
            } else {
                info!(asset = %asset, attempt = attempts + 1, "no snapshot yet, resubscribing");
                self.registry.request_resubscribe(&asset);
            }
        }
        rejected
    }

    /// Writes a book unless its asset was removed in the meantime. Removal
    /// runs on other tasks (discovery), so the check happens under the store
    /// lock.
    fn store_book(&self, book: BookState) -> bool {
        self.store
            .replace_if(book, |asset| self.registry.is_registered(asset))
    }

    fn skipped(&self, reason: &str) {
        self.metrics.deltas_skipped.with_label_values(&[reason]).inc();
    }
}

fn fingerprint_mismatch(book: &BookState, received: Option<String>) -> Option<DesyncError> {
    let asset = book.asset_id().clone();
    let local = ladder_fingerprint(book);
    match received {
        None => Some(DesyncError::MissingFingerprint { asset }),
        Some(received) if received != local => Some(DesyncError::FingerprintMismatch {
            asset,
            expected: local,
            received,
        }),
        Some(_) => None,
    }
}

/// The feed reports zero for an empty side.
fn top_of_book_mismatch(
    book: &BookState,
    best_bid: Option<Decimal>,
    best_ask: Option<Decimal>,
) -> Option<DesyncError> {
    [
        (Side::Bid, best_bid, book.best_bid()),
        (Side::Ask, best_ask, book.best_ask()),
    ]
    .into_iter()
    .find_map(|(side, feed, local)| {
        let feed = feed?;
        let local = local.map(|level| level.price);
        let agrees = if feed.is_zero() {
            local.is_none()
        } else {
            local == Some(feed)
        };
        (!agrees).then(|| DesyncError::TopOfBookMismatch {
            asset: book.asset_id().clone(),
            side,
            local,
            feed,
        })
    })
}
