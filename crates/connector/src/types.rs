use std::borrow::Borrow;
use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Opaque feed identifier for one tradable outcome token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AssetId(String);

impl AssetId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AssetId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for AssetId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl Borrow<str> for AssetId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Bid,
    Ask,
}

impl Side {
    /// Maps the feed's order side ("BUY"/"SELL", any case) to a book side.
    pub fn from_wire(s: &str) -> Option<Self> {
        if s.eq_ignore_ascii_case("BUY") {
            Some(Side::Bid)
        } else if s.eq_ignore_ascii_case("SELL") {
            Some(Side::Ask)
        } else {
            None
        }
    }

    /// Ordering of `a` relative to `b` within this side's ladder: bids run
    /// from highest to lowest, asks from lowest to highest.
    pub fn ladder_cmp(self, a: Decimal, b: Decimal) -> Ordering {
        match self {
            Side::Bid => b.cmp(&a),
            Side::Ask => a.cmp(&b),
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Bid => f.write_str("bid"),
            Side::Ask => f.write_str("ask"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: Decimal,
    pub size: Decimal,
}

impl PriceLevel {
    pub fn new(price: Decimal, size: Decimal) -> Self {
        Self { price, size }
    }
}

/// Last trade print for an asset. Trades never touch the ladder.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TradeTick {
    pub asset_id: AssetId,
    pub price: Decimal,
    pub size: Option<Decimal>,
    pub side: Option<Side>,
    pub timestamp: Option<DateTime<Utc>>,
}

/// Session lifecycle as seen by observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Resubscribing,
}

impl ConnectionState {
    /// Numeric form for the connection state gauge.
    pub fn as_gauge(self) -> i64 {
        match self {
            ConnectionState::Disconnected => 0,
            ConnectionState::Connecting => 1,
            ConnectionState::Resubscribing => 2,
            ConnectionState::Connected => 3,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Resubscribing => "resubscribing",
        };
        f.write_str(s)
    }
}

/// Transport-neutral subscription message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionRequest {
    /// First subscription on a fresh connection; carries the full asset set.
    Initial(Vec<AssetId>),
    /// Incremental additions on a connection that already subscribed.
    Subscribe(Vec<AssetId>),
    Unsubscribe(Vec<AssetId>),
}

impl SubscriptionRequest {
    pub fn assets(&self) -> &[AssetId] {
        match self {
            SubscriptionRequest::Initial(ids)
            | SubscriptionRequest::Subscribe(ids)
            | SubscriptionRequest::Unsubscribe(ids) => ids,
        }
    }
}

/// A market found by discovery, with its outcome tokens.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredMarket {
    pub condition_id: String,
    pub question: Option<String>,
    pub asset_ids: Vec<AssetId>,
    pub volume: Option<f64>,
    pub liquidity: Option<f64>,
}
