//! Frame decoder: raw text frame in, domain events out.
//!
//! A frame is a single JSON object or an array of them. Decoding is
//! all-or-nothing per frame: if any element is malformed the whole frame is
//! rejected and no event from it is applied. Unknown event types are not
//! errors; they come back as [`DomainEvent::Unrecognized`].

use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;

use crate::error::DecodeError;
use crate::polymarket::messages::{
    BookMessage, FeedMessage, WireLevel, BOOK, LAST_TRADE_PRICE, MARKET_RESOLVED, PRICE_CHANGE,
};
use crate::types::{AssetId, PriceLevel, Side, TradeTick};

const PREVIEW_CHARS: usize = 200;

#[derive(Debug, Clone, PartialEq)]
pub enum DomainEvent {
    /// Full ladder for one asset.
    Snapshot {
        asset: AssetId,
        bids: Vec<PriceLevel>,
        asks: Vec<PriceLevel>,
        fingerprint: Option<String>,
        timestamp: Option<DateTime<Utc>>,
    },
    /// New aggregate size at one price; zero removes the level.
    Delta {
        asset: AssetId,
        side: Side,
        price: Decimal,
        new_size: Decimal,
        fingerprint: Option<String>,
        /// Top of book the feed reports after this change.
        best_bid: Option<Decimal>,
        best_ask: Option<Decimal>,
        timestamp: Option<DateTime<Utc>>,
    },
    Trade(TradeTick),
    /// The feed will not serve this asset any more.
    Rejected { asset: AssetId, reason: String },
    Unrecognized {
        event_type: Option<String>,
        raw: String,
    },
}

impl DomainEvent {
    /// Short label for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            DomainEvent::Snapshot { .. } => "snapshot",
            DomainEvent::Delta { .. } => "delta",
            DomainEvent::Trade(_) => "trade",
            DomainEvent::Rejected { .. } => "rejected",
            DomainEvent::Unrecognized { .. } => "unrecognized",
        }
    }

    pub fn asset(&self) -> Option<&AssetId> {
        match self {
            DomainEvent::Snapshot { asset, .. }
            | DomainEvent::Delta { asset, .. }
            | DomainEvent::Rejected { asset, .. } => Some(asset),
            DomainEvent::Trade(trade) => Some(&trade.asset_id),
            DomainEvent::Unrecognized { .. } => None,
        }
    }
}

/// Decodes one text frame. Empty frames and keepalive replies yield no events.
pub fn decode(frame: &str) -> Result<Vec<DomainEvent>, DecodeError> {
    let trimmed = frame.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("PONG") {
        return Ok(Vec::new());
    }

    let value: Value = serde_json::from_str(trimmed).map_err(|source| DecodeError::Json {
        source,
        preview: preview(trimmed),
    })?;

    let mut events = Vec::new();
    match value {
        Value::Array(items) => {
            for item in items {
                decode_element(item, &mut events)?;
            }
        }
        object @ Value::Object(_) => decode_element(object, &mut events)?,
        other => {
            return Err(DecodeError::Shape(format!(
                "expected object or array, got {}",
                preview(&other.to_string())
            )))
        }
    }
    Ok(events)
}

fn decode_element(value: Value, out: &mut Vec<DomainEvent>) -> Result<(), DecodeError> {
    let Value::Object(map) = &value else {
        return Err(DecodeError::Shape(format!(
            "array element is not an object: {}",
            preview(&value.to_string())
        )));
    };

    let event_type = map
        .get("event_type")
        .and_then(Value::as_str)
        .map(str::to_owned);

    match event_type.as_deref() {
        Some(BOOK | PRICE_CHANGE | LAST_TRADE_PRICE | MARKET_RESOLVED) => {
            let message = FeedMessage::deserialize(&value).map_err(|source| DecodeError::Json {
                source,
                preview: preview(&value.to_string()),
            })?;
            convert(message, out)
        }
        // Initial dumps carry bare ladders with no event_type.
        None if ["bids", "asks", "buys", "sells"]
            .iter()
            .any(|key| map.contains_key(*key)) =>
        {
            let book = BookMessage::deserialize(&value).map_err(|source| DecodeError::Json {
                source,
                preview: preview(&value.to_string()),
            })?;
            out.push(snapshot(book)?);
            Ok(())
        }
        _ => {
            out.push(DomainEvent::Unrecognized {
                event_type,
                raw: value.to_string(),
            });
            Ok(())
        }
    }
}

fn convert(message: FeedMessage, out: &mut Vec<DomainEvent>) -> Result<(), DecodeError> {
    match message {
        FeedMessage::Book(book) => out.push(snapshot(book)?),

        FeedMessage::PriceChange {
            timestamp,
            hash,
            price_changes,
            ..
        } => {
            let timestamp = parse_timestamp(PRICE_CHANGE, timestamp.as_deref())?;
            for item in price_changes {
                let side = Side::from_wire(&item.side).ok_or_else(|| DecodeError::InvalidField {
                    event_type: PRICE_CHANGE,
                    field: "side",
                    value: item.side.clone(),
                })?;
                out.push(DomainEvent::Delta {
                    asset: parse_asset(PRICE_CHANGE, item.asset_id)?,
                    side,
                    price: parse_price(PRICE_CHANGE, &item.price)?,
                    new_size: parse_size(PRICE_CHANGE, &item.size)?,
                    fingerprint: item.hash.or_else(|| hash.clone()),
                    best_bid: parse_quote("best_bid", item.best_bid.as_deref())?,
                    best_ask: parse_quote("best_ask", item.best_ask.as_deref())?,
                    timestamp,
                });
            }
        }

        FeedMessage::LastTradePrice {
            asset_id,
            price,
            side,
            size,
            timestamp,
            ..
        } => {
            let size = match size.as_deref() {
                Some(s) if !s.is_empty() => Some(parse_size(LAST_TRADE_PRICE, s)?),
                _ => None,
            };
            out.push(DomainEvent::Trade(TradeTick {
                asset_id: parse_asset(LAST_TRADE_PRICE, asset_id)?,
                price: parse_price(LAST_TRADE_PRICE, &price)?,
                size,
                side: side.as_deref().and_then(Side::from_wire),
                timestamp: parse_timestamp(LAST_TRADE_PRICE, timestamp.as_deref())?,
            }));
        }

        FeedMessage::MarketResolved {
            market,
            mut assets_ids,
            winning_asset_id,
            winning_outcome,
            ..
        } => {
            if let Some(winner) = winning_asset_id {
                if !assets_ids.contains(&winner) {
                    assets_ids.push(winner);
                }
            }
            let reason = match winning_outcome {
                Some(outcome) => format!("market {} resolved ({})", market, outcome),
                None => format!("market {} resolved", market),
            };
            for asset in assets_ids {
                out.push(DomainEvent::Rejected {
                    asset: parse_asset(MARKET_RESOLVED, asset)?,
                    reason: reason.clone(),
                });
            }
        }
    }
    Ok(())
}

fn snapshot(book: BookMessage) -> Result<DomainEvent, DecodeError> {
    Ok(DomainEvent::Snapshot {
        asset: parse_asset(BOOK, book.asset_id)?,
        bids: parse_levels(&book.bids)?,
        asks: parse_levels(&book.asks)?,
        fingerprint: book.hash,
        timestamp: parse_timestamp(BOOK, book.timestamp.as_deref())?,
    })
}

fn parse_levels(levels: &[WireLevel]) -> Result<Vec<PriceLevel>, DecodeError> {
    levels
        .iter()
        .map(|level| {
            Ok(PriceLevel::new(
                parse_price(BOOK, &level.price)?,
                parse_size(BOOK, &level.size)?,
            ))
        })
        .collect()
}

fn parse_asset(event_type: &'static str, raw: String) -> Result<AssetId, DecodeError> {
    if raw.trim().is_empty() {
        return Err(DecodeError::InvalidField {
            event_type,
            field: "asset_id",
            value: raw,
        });
    }
    Ok(AssetId::from(raw))
}

fn parse_decimal(raw: &str) -> Option<Decimal> {
    let raw = raw.trim();
    Decimal::from_str(raw)
        .or_else(|_| Decimal::from_scientific(raw))
        .ok()
}

fn parse_price(event_type: &'static str, raw: &str) -> Result<Decimal, DecodeError> {
    match parse_decimal(raw) {
        Some(price) if price > Decimal::ZERO => Ok(price),
        _ => Err(DecodeError::InvalidField {
            event_type,
            field: "price",
            value: raw.to_string(),
        }),
    }
}

fn parse_size(event_type: &'static str, raw: &str) -> Result<Decimal, DecodeError> {
    match parse_decimal(raw) {
        Some(size) if size >= Decimal::ZERO => Ok(size),
        _ => Err(DecodeError::InvalidField {
            event_type,
            field: "size",
            value: raw.to_string(),
        }),
    }
}

/// Optional top-of-book quote. Zero is allowed and means the side is empty.
fn parse_quote(field: &'static str, raw: Option<&str>) -> Result<Option<Decimal>, DecodeError> {
    let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
        return Ok(None);
    };
    match parse_decimal(raw) {
        Some(quote) if quote >= Decimal::ZERO => Ok(Some(quote)),
        _ => Err(DecodeError::InvalidField {
            event_type: PRICE_CHANGE,
            field,
            value: raw.to_string(),
        }),
    }
}

fn parse_timestamp(
    event_type: &'static str,
    raw: Option<&str>,
) -> Result<Option<DateTime<Utc>>, DecodeError> {
    let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
        return Ok(None);
    };
    raw.parse::<i64>()
        .ok()
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .map(Some)
        .ok_or_else(|| DecodeError::InvalidField {
            event_type,
            field: "timestamp",
            value: raw.to_string(),
        })
}

fn preview(text: &str) -> String {
    text.chars().take(PREVIEW_CHARS).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    #[test]
    fn test_decode_book() {
        let frame = r#"{"event_type":"book","asset_id":"A","market":"0x1","timestamp":"1706000000000","hash":"h1","bids":[],"asks":[{"price":"0.41","size":"30"},{"price":"0.42","size":"50"}]}"#;
        let events = decode(frame).unwrap();
        assert_eq!(
            events,
            vec![DomainEvent::Snapshot {
                asset: AssetId::from("A"),
                bids: vec![],
                asks: vec![
                    PriceLevel::new(dec("0.41"), dec("30")),
                    PriceLevel::new(dec("0.42"), dec("50")),
                ],
                fingerprint: Some("h1".to_string()),
                timestamp: Utc.timestamp_millis_opt(1_706_000_000_000).single(),
            }]
        );
    }

    #[test]
    fn test_decode_price_change_one_delta_per_item() {
        let frame = r#"{"event_type":"price_change","market":"0x1","timestamp":"1706000000001","hash":"frame","price_changes":[
            {"asset_id":"A","price":"0.41","size":"0","side":"SELL","hash":"h2"},
            {"asset_id":"B","price":"0.60","size":"12","side":"BUY"}
        ]}"#;
        let events = decode(frame).unwrap();
        assert_eq!(events.len(), 2);
        match &events[0] {
            DomainEvent::Delta {
                asset,
                side,
                price,
                new_size,
                fingerprint,
                ..
            } => {
                assert_eq!(asset.as_str(), "A");
                assert_eq!(*side, Side::Ask);
                assert_eq!(*price, dec("0.41"));
                assert!(new_size.is_zero());
                assert_eq!(fingerprint.as_deref(), Some("h2"));
            }
            other => panic!("expected delta, got {:?}", other),
        }
        match &events[1] {
            DomainEvent::Delta {
                side, fingerprint, ..
            } => {
                assert_eq!(*side, Side::Bid);
                assert_eq!(fingerprint.as_deref(), Some("frame"));
            }
            other => panic!("expected delta, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_price_change_carries_top_of_book() {
        let frame = r#"{"event_type":"price_change","market":"0x1","price_changes":[
            {"asset_id":"A","price":"0.41","size":"5","side":"BUY","best_bid":"0.41","best_ask":"0.43"},
            {"asset_id":"A","price":"0.41","size":"0","side":"BUY","best_bid":"0","best_ask":""}
        ]}"#;
        let events = decode(frame).unwrap();
        match &events[0] {
            DomainEvent::Delta {
                best_bid, best_ask, ..
            } => {
                assert_eq!(*best_bid, Some(dec("0.41")));
                assert_eq!(*best_ask, Some(dec("0.43")));
            }
            other => panic!("expected delta, got {:?}", other),
        }
        match &events[1] {
            DomainEvent::Delta {
                best_bid, best_ask, ..
            } => {
                assert_eq!(*best_bid, Some(Decimal::ZERO));
                assert_eq!(*best_ask, None);
            }
            other => panic!("expected delta, got {:?}", other),
        }

        let bad = r#"{"event_type":"price_change","price_changes":[
            {"asset_id":"A","price":"0.41","size":"5","side":"BUY","best_bid":"-1"}
        ]}"#;
        assert!(matches!(
            decode(bad),
            Err(DecodeError::InvalidField {
                field: "best_bid",
                ..
            })
        ));
    }

    #[test]
    fn test_decode_array_with_bare_books() {
        let frame = r#"[
            {"asset_id":"A","market":"0x1","bids":[{"price":"0.40","size":"5"}],"asks":[]},
            {"asset_id":"B","market":"0x1","buys":[],"sells":[{"price":"0.61","size":"3"}]}
        ]"#;
        let events = decode(frame).unwrap();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.kind() == "snapshot"));
        assert_eq!(events[1].asset(), Some(&AssetId::from("B")));
    }

    #[test]
    fn test_decode_trade() {
        let frame = r#"{"event_type":"last_trade_price","asset_id":"A","market":"0x1","price":"0.41","side":"BUY","size":"100","fee_rate_bps":"0","timestamp":"1706000000000"}"#;
        match decode(frame).unwrap().as_slice() {
            [DomainEvent::Trade(trade)] => {
                assert_eq!(trade.price, dec("0.41"));
                assert_eq!(trade.size, Some(dec("100")));
                assert_eq!(trade.side, Some(Side::Bid));
            }
            other => panic!("expected one trade, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_market_resolved_rejects_all_outcomes() {
        let frame = r#"{"event_type":"market_resolved","market":"0x1","assets_ids":["A","B"],"winning_asset_id":"A","winning_outcome":"Yes"}"#;
        let events = decode(frame).unwrap();
        let rejected: Vec<_> = events.iter().filter_map(|e| e.asset()).cloned().collect();
        assert_eq!(rejected, vec![AssetId::from("A"), AssetId::from("B")]);
        assert!(events.iter().all(|e| e.kind() == "rejected"));
    }

    #[test]
    fn test_unknown_event_type_is_unrecognized() {
        let frame = r#"{"event_type":"tick_size_change","asset_id":"A","market":"0x1","old_tick_size":"0.01","new_tick_size":"0.001"}"#;
        match decode(frame).unwrap().as_slice() {
            [DomainEvent::Unrecognized { event_type, raw }] => {
                assert_eq!(event_type.as_deref(), Some("tick_size_change"));
                assert!(raw.contains("new_tick_size"));
            }
            other => panic!("expected unrecognized, got {:?}", other),
        }
    }

    #[test]
    fn test_keepalive_and_empty_frames() {
        assert!(decode("PONG").unwrap().is_empty());
        assert!(decode("  ").unwrap().is_empty());
        assert!(decode("[]").unwrap().is_empty());
    }

    #[test]
    fn test_malformed_json_is_error() {
        assert!(matches!(
            decode(r#"{"event_type":"book","#),
            Err(DecodeError::Json { .. })
        ));
        assert!(matches!(decode("42"), Err(DecodeError::Shape(_))));
    }

    #[test]
    fn test_one_bad_element_rejects_whole_frame() {
        let frame = r#"[
            {"event_type":"book","asset_id":"A","bids":[],"asks":[{"price":"0.41","size":"30"}]},
            {"event_type":"price_change","price_changes":[{"asset_id":"A","price":"abc","size":"1","side":"BUY"}]}
        ]"#;
        match decode(frame) {
            Err(DecodeError::InvalidField { field, value, .. }) => {
                assert_eq!(field, "price");
                assert_eq!(value, "abc");
            }
            other => panic!("expected invalid price, got {:?}", other),
        }
    }

    #[test]
    fn test_rejects_negative_size_and_bad_side() {
        let negative = r#"{"event_type":"price_change","price_changes":[{"asset_id":"A","price":"0.4","size":"-1","side":"BUY"}]}"#;
        assert!(matches!(
            decode(negative),
            Err(DecodeError::InvalidField { field: "size", .. })
        ));

        let bad_side = r#"{"event_type":"price_change","price_changes":[{"asset_id":"A","price":"0.4","size":"1","side":"HOLD"}]}"#;
        assert!(matches!(
            decode(bad_side),
            Err(DecodeError::InvalidField { field: "side", .. })
        ));
    }

    #[test]
    fn test_bad_timestamp_is_error() {
        let frame = r#"{"event_type":"book","asset_id":"A","timestamp":"yesterday","bids":[],"asks":[]}"#;
        assert!(matches!(
            decode(frame),
            Err(DecodeError::InvalidField { field: "timestamp", .. })
        ));
    }
}
