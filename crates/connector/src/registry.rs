//! Subscription registry: the authoritative set of assets the client wants
//! books for, and whether the feed has confirmed each one with a snapshot.
//!
//! Registry changes never touch the socket directly. They queue an
//! [`OutboundCommand`] which the ingestion loop forwards while connected.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::store::BookStore;
use crate::types::AssetId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundCommand {
    Subscribe(Vec<AssetId>),
    Unsubscribe(Vec<AssetId>),
    /// Unsubscribe then subscribe one asset to force a fresh snapshot.
    Resubscribe(AssetId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionEntry {
    pub asset_id: AssetId,
    /// A snapshot arrived on the current connection.
    pub confirmed: bool,
    pub requested_at: DateTime<Utc>,
    /// Targeted resubscribes since the last confirmation.
    pub resubscribe_attempts: u32,
}

impl SubscriptionEntry {
    fn new(asset_id: AssetId) -> Self {
        Self {
            asset_id,
            confirmed: false,
            requested_at: Utc::now(),
            resubscribe_attempts: 0,
        }
    }
}

pub struct SubscriptionRegistry {
    entries: DashMap<AssetId, SubscriptionEntry>,
    store: Arc<BookStore>,
    outbound: mpsc::UnboundedSender<OutboundCommand>,
}

impl SubscriptionRegistry {
    /// Returns the registry and the receiving end of its command queue.
    pub fn new(store: Arc<BookStore>) -> (Self, mpsc::UnboundedReceiver<OutboundCommand>) {
        let (outbound, commands) = mpsc::unbounded_channel();
        let registry = Self {
            entries: DashMap::new(),
            store,
            outbound,
        };
        (registry, commands)
    }

    /// Registers an asset. Adding an asset that is already registered is a
    /// no-op and sends nothing.
    pub fn add_asset(&self, asset: AssetId) -> bool {
        match self.entries.entry(asset.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(SubscriptionEntry::new(asset.clone()));
                debug!(asset = %asset, "asset registered");
                self.send(OutboundCommand::Subscribe(vec![asset]));
                true
            }
        }
    }

    /// Registers several assets with a single subscribe command. Returns how
    /// many were new.
    pub fn add_assets<I>(&self, assets: I) -> usize
    where
        I: IntoIterator<Item = AssetId>,
    {
        let mut added = Vec::new();
        for asset in assets {
            if let Entry::Vacant(slot) = self.entries.entry(asset.clone()) {
                slot.insert(SubscriptionEntry::new(asset.clone()));
                added.push(asset);
            }
        }
        let count = added.len();
        if count > 0 {
            debug!(count, "assets registered");
            self.send(OutboundCommand::Subscribe(added));
        }
        count
    }

    /// Drops an asset and discards its book. Unknown assets are a no-op.
    pub fn remove_asset(&self, asset: &AssetId) -> bool {
        if self.entries.remove(asset).is_none() {
            return false;
        }
        self.store.remove(asset);
        debug!(asset = %asset, "asset removed");
        self.send(OutboundCommand::Unsubscribe(vec![asset.clone()]));
        true
    }

    /// Reconciles the registry to exactly `desired`. Returns (added, removed).
    pub fn sync_to(&self, desired: &BTreeSet<AssetId>) -> (usize, usize) {
        let stale: Vec<AssetId> = self
            .entries
            .iter()
            .filter(|entry| !desired.contains(entry.key()))
            .map(|entry| entry.key().clone())
            .collect();

        let removed = stale.iter().filter(|a| self.remove_asset(a)).count();
        let added = self.add_assets(desired.iter().cloned());
        if added > 0 || removed > 0 {
            info!(added, removed, total = self.len(), "subscription set updated");
        }
        (added, removed)
    }

    /// Marks an asset confirmed and resets its resubscribe attempts. Returns
    /// true on the transition from unconfirmed.
    pub fn confirm(&self, asset: &AssetId) -> bool {
        match self.entries.get_mut(asset) {
            Some(mut entry) => {
                let first = !entry.confirmed;
                entry.confirmed = true;
                entry.resubscribe_attempts = 0;
                first
            }
            None => false,
        }
    }

    pub fn is_registered(&self, asset: &AssetId) -> bool {
        self.entries.contains_key(asset)
    }

    pub fn is_confirmed(&self, asset: &AssetId) -> bool {
        self.entries
            .get(asset)
            .map(|entry| entry.confirmed)
            .unwrap_or(false)
    }

    /// Clears every confirmation and marks every book stale. Called when the
    /// connection drops: nothing received earlier can be trusted until a new
    /// snapshot arrives.
    pub fn clear_confirmations(&self) {
        for mut entry in self.entries.iter_mut() {
            entry.confirmed = false;
        }
        self.store.mark_all_stale();
    }

    /// Every registered asset, sorted. The full set is resent after each
    /// reconnect.
    pub fn assets_needing_subscription(&self) -> Vec<AssetId> {
        let mut assets: Vec<AssetId> = self.entries.iter().map(|e| e.key().clone()).collect();
        assets.sort();
        assets
    }

    pub fn unconfirmed(&self) -> Vec<AssetId> {
        let mut assets: Vec<AssetId> = self
            .entries
            .iter()
            .filter(|e| !e.confirmed)
            .map(|e| e.key().clone())
            .collect();
        assets.sort();
        assets
    }

    /// Stamps the request time on assets just sent to the feed.
    pub fn mark_requested(&self, assets: &[AssetId]) {
        let now = Utc::now();
        for asset in assets {
            if let Some(mut entry) = self.entries.get_mut(asset) {
                entry.requested_at = now;
            }
        }
    }

    /// Unconfirms the asset and queues a targeted resubscribe. Unknown
    /// assets are a no-op.
    pub fn request_resubscribe(&self, asset: &AssetId) -> bool {
        {
            let Some(mut entry) = self.entries.get_mut(asset) else {
                return false;
            };
            entry.confirmed = false;
            entry.resubscribe_attempts += 1;
            entry.requested_at = Utc::now();
        }
        self.send(OutboundCommand::Resubscribe(asset.clone()));
        true
    }

    /// Unconfirmed assets requested more than `timeout` before `now`, with
    /// their attempt counts.
    pub fn overdue(&self, timeout: Duration, now: DateTime<Utc>) -> Vec<(AssetId, u32)> {
        let mut overdue: Vec<(AssetId, u32)> = self
            .entries
            .iter()
            .filter(|e| !e.confirmed)
            .filter(|e| {
                now.signed_duration_since(e.requested_at)
                    .to_std()
                    .map(|waited| waited > timeout)
                    .unwrap_or(false)
            })
            .map(|e| (e.key().clone(), e.resubscribe_attempts))
            .collect();
        overdue.sort();
        overdue
    }

    pub fn entry(&self, asset: &AssetId) -> Option<SubscriptionEntry> {
        self.entries.get(asset).map(|e| e.value().clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn confirmed_count(&self) -> usize {
        self.entries.iter().filter(|e| e.confirmed).count()
    }

    pub fn store(&self) -> &Arc<BookStore> {
        &self.store
    }

    fn send(&self, command: OutboundCommand) {
        if self.outbound.send(command).is_err() {
            debug!("command queue closed, dropping outbound command");
        }
    }
}
