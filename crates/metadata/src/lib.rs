//! polybook-metadata: configuration types for the order-book sync client

pub mod config;
pub mod error;

pub use config::{
    BackoffConfig, DiscoveryConfig, FingerprintPolicy, LogFormat, LoggingConfig,
    ReconcileConfig, SyncConfig, WebSocketConfig, DEFAULT_GAMMA_URL, DEFAULT_WS_URL,
    MAX_BACKOFF_FACTOR,
};
pub use error::MetadataError;
