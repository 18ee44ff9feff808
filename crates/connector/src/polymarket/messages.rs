//! Polymarket CLOB market-channel wire types.
//!
//! Prices and sizes arrive as decimal strings ("0.55"), timestamps as Unix
//! milliseconds in strings. Everything is kept as text here; conversion and
//! validation happen in the decoder.

use serde::{Deserialize, Serialize};

use crate::types::{AssetId, SubscriptionRequest};

/// Event types the decoder turns into domain events. Any other
/// `event_type` is reported as unrecognized without being parsed.
pub const BOOK: &str = "book";
pub const PRICE_CHANGE: &str = "price_change";
pub const LAST_TRADE_PRICE: &str = "last_trade_price";
pub const MARKET_RESOLVED: &str = "market_resolved";

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event_type")]
pub enum FeedMessage {
    #[serde(rename = "book")]
    Book(BookMessage),

    #[serde(rename = "price_change")]
    PriceChange {
        #[serde(default)]
        market: String,
        timestamp: Option<String>,
        /// Frame-level hash; used when an item carries none of its own.
        #[serde(default)]
        hash: Option<String>,
        price_changes: Vec<PriceChangeItem>,
    },

    #[serde(rename = "last_trade_price")]
    LastTradePrice {
        asset_id: String,
        #[serde(default)]
        market: String,
        price: String,
        side: Option<String>,
        size: Option<String>,
        timestamp: Option<String>,
    },

    #[serde(rename = "market_resolved")]
    MarketResolved {
        #[serde(default)]
        market: String,
        #[serde(default)]
        assets_ids: Vec<String>,
        #[serde(default)]
        winning_asset_id: Option<String>,
        #[serde(default)]
        winning_outcome: Option<String>,
        timestamp: Option<String>,
    },
}

/// Full ladder for one asset. Also the shape of initial-dump entries, which
/// arrive without an `event_type`.
#[derive(Debug, Clone, Deserialize)]
pub struct BookMessage {
    pub asset_id: String,
    #[serde(default)]
    pub market: String,
    pub timestamp: Option<String>,
    pub hash: Option<String>,
    #[serde(alias = "buys", default)]
    pub bids: Vec<WireLevel>,
    #[serde(alias = "sells", default)]
    pub asks: Vec<WireLevel>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireLevel {
    pub price: String,
    pub size: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PriceChangeItem {
    pub asset_id: String,
    pub price: String,
    /// New aggregate size at this price; "0" removes the level.
    pub size: String,
    pub side: String,
    #[serde(default)]
    pub hash: Option<String>,
    #[serde(default)]
    pub best_bid: Option<String>,
    #[serde(default)]
    pub best_ask: Option<String>,
}

/// Client-to-server subscription messages.
///
/// The first message on a connection names the channel:
/// `{"assets_ids":[...],"type":"market","custom_feature_enabled":true}`.
/// Later changes use `{"assets_ids":[...],"operation":"subscribe"|"unsubscribe"}`.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum OutgoingMessage<'a> {
    Initial {
        assets_ids: &'a [AssetId],
        #[serde(rename = "type")]
        channel: &'static str,
        custom_feature_enabled: bool,
    },
    Operation {
        assets_ids: &'a [AssetId],
        operation: &'static str,
    },
}

impl<'a> From<&'a SubscriptionRequest> for OutgoingMessage<'a> {
    fn from(request: &'a SubscriptionRequest) -> Self {
        match request {
            SubscriptionRequest::Initial(assets) => OutgoingMessage::Initial {
                assets_ids: assets,
                channel: "market",
                custom_feature_enabled: true,
            },
            SubscriptionRequest::Subscribe(assets) => OutgoingMessage::Operation {
                assets_ids: assets,
                operation: "subscribe",
            },
            SubscriptionRequest::Unsubscribe(assets) => OutgoingMessage::Operation {
                assets_ids: assets,
                operation: "unsubscribe",
            },
        }
    }
}
