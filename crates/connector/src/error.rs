use std::time::Duration;

use rust_decimal::Decimal;
use thiserror::Error;

use crate::types::{AssetId, Side};

/// Transport-level failures. Any of these ends the current session.
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("connection failed: {0}")]
    ConnectFailed(String),

    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("read timeout after {0:?}")]
    ReadTimeout(Duration),

    #[error("write timed out after {0:?}")]
    WriteTimeout(Duration),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("connection closed")]
    Closed,

    #[error("not connected")]
    NotConnected,
}

/// A frame that could not be turned into domain events. The whole frame is
/// discarded; the session stays up.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("malformed JSON: {source} (frame: {preview})")]
    Json {
        source: serde_json::Error,
        preview: String,
    },

    #[error("invalid {field} {value:?} in {event_type} event")]
    InvalidField {
        event_type: &'static str,
        field: &'static str,
        value: String,
    },

    #[error("unexpected frame shape: {0}")]
    Shape(String),
}

/// The local ladder no longer matches what the feed says it should be.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DesyncError {
    #[error("fingerprint mismatch for {asset}: local {expected}, feed {received}")]
    FingerprintMismatch {
        asset: AssetId,
        expected: String,
        received: String,
    },

    #[error("delta for {asset} carried no fingerprint")]
    MissingFingerprint { asset: AssetId },

    #[error("{side:?} top of book mismatch for {asset}: local {local:?}, feed {feed}")]
    TopOfBookMismatch {
        asset: AssetId,
        side: Side,
        local: Option<Decimal>,
        feed: Decimal,
    },
}

impl DesyncError {
    pub fn asset(&self) -> &AssetId {
        match self {
            DesyncError::FingerprintMismatch { asset, .. } => asset,
            DesyncError::MissingFingerprint { asset } => asset,
            DesyncError::TopOfBookMismatch { asset, .. } => asset,
        }
    }
}

/// The feed will never serve this asset again (resolved market, or no
/// snapshot after repeated resubscribes). The asset has been dropped from
/// the registry and its book discarded.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("asset {asset} rejected: {reason}")]
pub struct PermanentRejection {
    pub asset: AssetId,
    pub reason: String,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("no book for asset {0}")]
    NotFound(AssetId),
}

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error: {status} - {body}")]
    Api { status: u16, body: String },

    #[error("JSON parse error: {0}")]
    Parse(String),
}

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("invalid configuration: {0}")]
    Config(#[from] polybook_metadata::MetadataError),

    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}
