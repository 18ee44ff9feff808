use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::MetadataError;

/// Polymarket CLOB market channel
pub const DEFAULT_WS_URL: &str = "wss://ws-subscriptions-clob.polymarket.com/ws/market";

/// Gamma REST API used for market discovery
pub const DEFAULT_GAMMA_URL: &str = "https://gamma-api.polymarket.com";

/// How the reconciler checks a book against the feed after each delta.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FingerprintPolicy {
    /// Store the feed fingerprint on the book, never compare anything.
    Record,
    /// Compare the local best bid/ask with the `best_bid`/`best_ask` the feed
    /// sends with each price change; a mismatch is a desync.
    #[default]
    TopOfBook,
    /// Recompute the SHA-256 ladder fingerprint after every delta; a mismatch
    /// or a missing fingerprint is a desync. Only for feeds (replays, test
    /// servers) that stamp that fingerprint format.
    Verify,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WebSocketConfig {
    pub url: String,
    pub connect_timeout_secs: u64,
    /// Upper bound on any single socket write (subscribe, ping, pong, close).
    pub write_timeout_secs: u64,
    /// No frame (data or PONG) within this window closes the session.
    pub read_timeout_secs: u64,
    pub ping_interval_secs: u64,
    pub max_assets_per_connection: usize,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_WS_URL.to_string(),
            connect_timeout_secs: 10,
            write_timeout_secs: 10,
            read_timeout_secs: 120,
            ping_interval_secs: 10,
            max_assets_per_connection: 500,
        }
    }
}

impl WebSocketConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }
}

/// Largest accepted `backoff.factor`; anything above reaches the cap in one step anyway.
pub const MAX_BACKOFF_FACTOR: f64 = 10.0;

/// Reconnect backoff. Retries are unbounded; only the delay is capped.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BackoffConfig {
    pub initial_ms: u64,
    pub max_ms: u64,
    pub factor: f64,
    /// Fraction of each delay added as random jitter (0.0 disables).
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: 1_000,
            max_ms: 30_000,
            factor: 2.0,
            jitter: 0.1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReconcileConfig {
    pub fingerprint_policy: FingerprintPolicy,
    /// An unconfirmed subscription older than this gets a targeted resubscribe.
    pub confirm_timeout_secs: u64,
    /// Targeted resubscribes before an asset is reported as rejected.
    pub max_resubscribe_attempts: u32,
    /// Books not updated within this window are reported stale.
    pub stale_after_secs: u64,
    /// Capacity of the observer event channel (trades, rejections, desyncs).
    pub event_buffer: usize,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            fingerprint_policy: FingerprintPolicy::TopOfBook,
            confirm_timeout_secs: 30,
            max_resubscribe_attempts: 5,
            stale_after_secs: 60,
            event_buffer: 1024,
        }
    }
}

impl ReconcileConfig {
    pub fn confirm_timeout(&self) -> Duration {
        Duration::from_secs(self.confirm_timeout_secs)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub enabled: bool,
    pub base_url: String,
    pub refresh_interval_secs: u64,
    pub min_volume: Option<f64>,
    pub min_liquidity: Option<f64>,
    /// Cap on discovered assets (0 = no cap).
    pub max_assets: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: DEFAULT_GAMMA_URL.to_string(),
            refresh_interval_secs: 300,
            min_volume: None,
            min_liquidity: None,
            max_assets: 0,
        }
    }
}

impl DiscoveryConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when RUST_LOG is unset.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

/// Top-level configuration for the sync client and its daemon.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SyncConfig {
    pub websocket: WebSocketConfig,
    pub backoff: BackoffConfig,
    pub reconcile: ReconcileConfig,
    pub discovery: DiscoveryConfig,
    /// Static asset IDs subscribed at startup.
    pub assets: Vec<String>,
    pub logging: LoggingConfig,
}

impl SyncConfig {
    pub fn load(path: &Path) -> Result<Self, MetadataError> {
        let content = std::fs::read_to_string(path)?;
        let config: SyncConfig = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), MetadataError> {
        if !(self.websocket.url.starts_with("ws://") || self.websocket.url.starts_with("wss://")) {
            return Err(MetadataError::Validation(format!(
                "websocket.url must be ws:// or wss://, got {}",
                self.websocket.url
            )));
        }
        if self.websocket.read_timeout_secs == 0
            || self.websocket.connect_timeout_secs == 0
            || self.websocket.write_timeout_secs == 0
        {
            return Err(MetadataError::Validation(
                "websocket timeouts must be non-zero".to_string(),
            ));
        }
        if self.websocket.ping_interval_secs == 0
            || self.websocket.ping_interval_secs >= self.websocket.read_timeout_secs
        {
            return Err(MetadataError::Validation(
                "websocket.ping_interval_secs must be non-zero and below read_timeout_secs"
                    .to_string(),
            ));
        }
        if self.backoff.initial_ms == 0 || self.backoff.max_ms < self.backoff.initial_ms {
            return Err(MetadataError::Validation(
                "backoff.initial_ms must be non-zero and not exceed backoff.max_ms".to_string(),
            ));
        }
        if !(1.0..=MAX_BACKOFF_FACTOR).contains(&self.backoff.factor) {
            return Err(MetadataError::Validation(format!(
                "backoff.factor must be within [1, {}], got {}",
                MAX_BACKOFF_FACTOR, self.backoff.factor
            )));
        }
        if !(0.0..=1.0).contains(&self.backoff.jitter) {
            return Err(MetadataError::Validation(format!(
                "backoff.jitter must be within [0, 1], got {}",
                self.backoff.jitter
            )));
        }
        if self.reconcile.event_buffer == 0 {
            return Err(MetadataError::Validation(
                "reconcile.event_buffer must be non-zero".to_string(),
            ));
        }
        if self.discovery.enabled && self.discovery.refresh_interval_secs == 0 {
            return Err(MetadataError::Validation(
                "discovery.refresh_interval_secs must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}
