//! Shared book store.
//!
//! Readers get `Arc<BookState>` snapshots: a book handed out is never
//! mutated afterwards, so a reader always sees a complete ladder from before
//! or after an update, never a half-applied one. Only the reconciler and the
//! registry write.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::book::BookState;
use crate::error::StoreError;
use crate::types::{AssetId, TradeTick};

#[derive(Debug, Default)]
pub struct BookStore {
    books: RwLock<HashMap<AssetId, Arc<BookState>>>,
    trades: RwLock<HashMap<AssetId, TradeTick>>,
}

impl BookStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, asset: &AssetId) -> Result<Arc<BookState>, StoreError> {
        self.books
            .read()
            .get(asset)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(asset.clone()))
    }

    pub fn contains(&self, asset: &AssetId) -> bool {
        self.books.read().contains_key(asset)
    }

    /// Point-in-time copy of every book.
    pub fn snapshot_all(&self) -> HashMap<AssetId, Arc<BookState>> {
        self.books.read().clone()
    }

    pub fn last_trade(&self, asset: &AssetId) -> Option<TradeTick> {
        self.trades.read().get(asset).cloned()
    }

    pub fn len(&self) -> usize {
        self.books.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.books.read().is_empty()
    }

    /// True when the asset has no book, was invalidated by a reconnect, or
    /// has not been updated within `max_age`.
    pub fn is_stale(&self, asset: &AssetId, max_age: Duration) -> bool {
        match self.books.read().get(asset) {
            Some(book) => book.is_stale_at(max_age, Utc::now()),
            None => true,
        }
    }

    pub fn stale_assets(&self, max_age: Duration, now: DateTime<Utc>) -> Vec<AssetId> {
        let mut stale: Vec<AssetId> = self
            .books
            .read()
            .values()
            .filter(|book| book.is_stale_at(max_age, now))
            .map(|book| book.asset_id().clone())
            .collect();
        stale.sort();
        stale
    }

    /// Swaps in `book` if `live` still holds for its asset. The check runs
    /// under the write lock, so a book removed concurrently stays removed.
    pub(crate) fn replace_if<F>(&self, book: BookState, live: F) -> bool
    where
        F: FnOnce(&AssetId) -> bool,
    {
        let mut books = self.books.write();
        if !live(book.asset_id()) {
            return false;
        }
        books.insert(book.asset_id().clone(), Arc::new(book));
        true
    }

    #[cfg(test)]
    pub(crate) fn replace(&self, book: BookState) {
        self.replace_if(book, |_| true);
    }

    pub(crate) fn remove(&self, asset: &AssetId) -> Option<Arc<BookState>> {
        self.trades.write().remove(asset);
        self.books.write().remove(asset)
    }

    pub(crate) fn record_trade_if<F>(&self, trade: TradeTick, live: F) -> bool
    where
        F: FnOnce(&AssetId) -> bool,
    {
        let mut trades = self.trades.write();
        if !live(&trade.asset_id) {
            return false;
        }
        trades.insert(trade.asset_id.clone(), trade);
        true
    }

    /// Flags every book as stale. Ladders are kept for inspection until a
    /// fresh snapshot replaces them.
    pub(crate) fn mark_all_stale(&self) {
        let mut books = self.books.write();
        for book in books.values_mut() {
            if !book.is_stale() {
                let mut invalidated = (**book).clone();
                invalidated.mark_stale();
                *book = Arc::new(invalidated);
            }
        }
    }
}
