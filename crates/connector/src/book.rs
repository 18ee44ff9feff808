//! Per-asset order book ladder.
//!
//! Bids are kept strictly descending by price, asks strictly ascending, and
//! no level ever carries a zero size. Every mutation goes through
//! [`BookState::from_snapshot`] or [`BookState::apply_level`], both of which
//! preserve those invariants.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

use crate::types::{AssetId, PriceLevel, Side};

/// What a single level update did to the ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LevelChange {
    Inserted,
    Updated,
    Removed,
    /// Zero-size update for a price that was not on the ladder.
    Unchanged,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BookState {
    asset_id: AssetId,
    bids: Vec<PriceLevel>,
    asks: Vec<PriceLevel>,
    fingerprint: Option<String>,
    feed_timestamp: Option<DateTime<Utc>>,
    last_update: DateTime<Utc>,
    stale: bool,
}

impl BookState {
    /// Builds a ladder from snapshot levels. Zero or negative sizes are
    /// dropped; if a price repeats, the later level wins.
    pub fn from_snapshot(
        asset_id: AssetId,
        bids: Vec<PriceLevel>,
        asks: Vec<PriceLevel>,
        fingerprint: Option<String>,
        feed_timestamp: Option<DateTime<Utc>>,
        received_at: DateTime<Utc>,
    ) -> Self {
        Self {
            asset_id,
            bids: normalize(bids, Side::Bid),
            asks: normalize(asks, Side::Ask),
            fingerprint,
            feed_timestamp,
            last_update: received_at,
            stale: false,
        }
    }

    /// Sets, replaces or (with a zero size) removes the level at `price`.
    pub fn apply_level(&mut self, side: Side, price: Decimal, size: Decimal) -> LevelChange {
        let levels = match side {
            Side::Bid => &mut self.bids,
            Side::Ask => &mut self.asks,
        };

        let position = levels.binary_search_by(|level| side.ladder_cmp(level.price, price));
        match (position, size.is_zero()) {
            (Ok(idx), true) => {
                levels.remove(idx);
                LevelChange::Removed
            }
            (Ok(idx), false) => {
                levels[idx].size = size;
                LevelChange::Updated
            }
            (Err(_), true) => LevelChange::Unchanged,
            (Err(idx), false) => {
                levels.insert(idx, PriceLevel::new(price, size));
                LevelChange::Inserted
            }
        }
    }

    /// Records delta metadata after a level update.
    pub fn touch(
        &mut self,
        fingerprint: Option<String>,
        feed_timestamp: Option<DateTime<Utc>>,
        received_at: DateTime<Utc>,
    ) {
        if fingerprint.is_some() {
            self.fingerprint = fingerprint;
        }
        if feed_timestamp.is_some() {
            self.feed_timestamp = feed_timestamp;
        }
        self.last_update = received_at;
    }

    pub fn mark_stale(&mut self) {
        self.stale = true;
    }

    pub fn asset_id(&self) -> &AssetId {
        &self.asset_id
    }

    pub fn bids(&self) -> &[PriceLevel] {
        &self.bids
    }

    pub fn asks(&self) -> &[PriceLevel] {
        &self.asks
    }

    pub fn fingerprint(&self) -> Option<&str> {
        self.fingerprint.as_deref()
    }

    pub fn feed_timestamp(&self) -> Option<DateTime<Utc>> {
        self.feed_timestamp
    }

    pub fn last_update(&self) -> DateTime<Utc> {
        self.last_update
    }

    /// True once a reconnect has invalidated this book and no fresh snapshot
    /// has replaced it yet.
    pub fn is_stale(&self) -> bool {
        self.stale
    }

    /// Stale flag set, or no update for longer than `max_age` as of `now`.
    pub fn is_stale_at(&self, max_age: Duration, now: DateTime<Utc>) -> bool {
        if self.stale {
            return true;
        }
        now.signed_duration_since(self.last_update)
            .to_std()
            .map(|age| age > max_age)
            .unwrap_or(false)
    }

    pub fn best_bid(&self) -> Option<&PriceLevel> {
        self.bids.first()
    }

    pub fn best_ask(&self) -> Option<&PriceLevel> {
        self.asks.first()
    }

    pub fn mid_price(&self) -> Option<Decimal> {
        let bid = self.best_bid()?.price;
        let ask = self.best_ask()?.price;
        Some((bid + ask) / Decimal::TWO)
    }

    pub fn spread(&self) -> Option<Decimal> {
        Some(self.best_ask()?.price - self.best_bid()?.price)
    }

    /// Best bid at or above best ask. The feed can briefly publish this; the
    /// book keeps it as delivered.
    pub fn is_crossed(&self) -> bool {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => bid.price >= ask.price,
            _ => false,
        }
    }

    pub fn depth(&self) -> (usize, usize) {
        (self.bids.len(), self.asks.len())
    }
}

fn normalize(levels: Vec<PriceLevel>, side: Side) -> Vec<PriceLevel> {
    let mut by_price: BTreeMap<Decimal, Decimal> = BTreeMap::new();
    for level in levels {
        if level.size > Decimal::ZERO {
            by_price.insert(level.price, level.size);
        } else {
            by_price.remove(&level.price);
        }
    }

    let ascending = by_price
        .into_iter()
        .map(|(price, size)| PriceLevel::new(price, size));
    match side {
        Side::Bid => ascending.rev().collect(),
        Side::Ask => ascending.collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn lvl(price: &str, size: &str) -> PriceLevel {
        PriceLevel::new(dec(price), dec(size))
    }

    fn book(bids: Vec<PriceLevel>, asks: Vec<PriceLevel>) -> BookState {
        BookState::from_snapshot(AssetId::from("A"), bids, asks, None, None, Utc::now())
    }

    fn assert_ordered(book: &BookState) {
        assert!(book.bids().windows(2).all(|w| w[0].price > w[1].price));
        assert!(book.asks().windows(2).all(|w| w[0].price < w[1].price));
        assert!(book
            .bids()
            .iter()
            .chain(book.asks())
            .all(|l| l.size > Decimal::ZERO));
    }

    #[test]
    fn test_snapshot_sorts_and_drops_zero_levels() {
        let b = book(
            vec![lvl("0.38", "10"), lvl("0.40", "5"), lvl("0.39", "0")],
            vec![lvl("0.45", "1"), lvl("0.42", "50"), lvl("0.41", "30")],
        );
        assert_eq!(b.bids(), &[lvl("0.40", "5"), lvl("0.38", "10")]);
        assert_eq!(
            b.asks(),
            &[lvl("0.41", "30"), lvl("0.42", "50"), lvl("0.45", "1")]
        );
        assert_ordered(&b);
    }

    #[test]
    fn test_snapshot_duplicate_price_last_wins() {
        let b = book(vec![], vec![lvl("0.41", "30"), lvl("0.41", "12")]);
        assert_eq!(b.asks(), &[lvl("0.41", "12")]);

        let b = book(vec![], vec![lvl("0.41", "30"), lvl("0.41", "0")]);
        assert!(b.asks().is_empty());
    }

    #[test]
    fn test_apply_level_insert_update_remove() {
        let mut b = book(vec![lvl("0.40", "5")], vec![lvl("0.41", "30"), lvl("0.42", "50")]);

        assert_eq!(b.apply_level(Side::Bid, dec("0.39"), dec("7")), LevelChange::Inserted);
        assert_eq!(b.apply_level(Side::Bid, dec("0.395"), dec("2")), LevelChange::Inserted);
        assert_eq!(b.apply_level(Side::Ask, dec("0.41"), dec("25")), LevelChange::Updated);
        assert_eq!(b.apply_level(Side::Ask, dec("0.42"), dec("0")), LevelChange::Removed);
        assert_eq!(b.apply_level(Side::Ask, dec("0.50"), dec("0")), LevelChange::Unchanged);

        assert_eq!(
            b.bids(),
            &[lvl("0.40", "5"), lvl("0.395", "2"), lvl("0.39", "7")]
        );
        assert_eq!(b.asks(), &[lvl("0.41", "25")]);
        assert_ordered(&b);
    }

    #[test]
    fn test_equal_prices_with_different_scale_match() {
        let mut b = book(vec![], vec![lvl("0.41", "30")]);
        assert_eq!(b.apply_level(Side::Ask, dec("0.410"), dec("0")), LevelChange::Removed);
        assert!(b.asks().is_empty());
    }

    #[test]
    fn test_touch_keeps_previous_metadata_when_absent() {
        let mut b = book(vec![], vec![]);
        b.touch(Some("h1".to_string()), None, Utc::now());
        b.touch(None, None, Utc::now());
        assert_eq!(b.fingerprint(), Some("h1"));
    }

    #[test]
    fn test_top_of_book() {
        let b = book(vec![lvl("0.40", "5")], vec![lvl("0.44", "1")]);
        assert_eq!(b.mid_price(), Some(dec("0.42")));
        assert_eq!(b.spread(), Some(dec("0.04")));
        assert!(!b.is_crossed());

        let crossed = book(vec![lvl("0.45", "5")], vec![lvl("0.44", "1")]);
        assert!(crossed.is_crossed());

        let one_sided = book(vec![], vec![lvl("0.44", "1")]);
        assert_eq!(one_sided.mid_price(), None);
    }

    #[test]
    fn test_staleness() {
        let then = Utc::now() - chrono::Duration::seconds(120);
        let mut b = BookState::from_snapshot(AssetId::from("A"), vec![], vec![], None, None, then);
        assert!(b.is_stale_at(Duration::from_secs(60), Utc::now()));
        assert!(!b.is_stale_at(Duration::from_secs(600), Utc::now()));
        b.mark_stale();
        assert!(b.is_stale_at(Duration::from_secs(600), Utc::now()));
    }
}
