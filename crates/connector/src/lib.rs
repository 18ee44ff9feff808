//! Order book synchronization for the Polymarket CLOB market channel.
//!
//! A [`BookSyncClient`] keeps a local copy of the L2 ladder for every
//! registered asset: it connects, subscribes, applies snapshots and deltas,
//! detects desyncs, and reconnects with backoff. Readers query the shared
//! [`BookStore`] at any time.

pub mod backoff;
pub mod book;
pub mod client;
pub mod decoder;
pub mod discovery;
pub mod error;
pub mod fingerprint;
pub mod metrics;
pub mod polymarket;
pub mod reconciler;
pub mod registry;
pub mod server;
pub mod session;
pub mod store;
pub mod traits;
pub mod types;

pub use book::{BookState, LevelChange};
pub use client::{BookSyncClient, SyncEvent, SyncStatus};
pub use decoder::{decode, DomainEvent};
pub use discovery::{refresh_subscriptions, run_discovery};
pub use error::{
    ConnectionError, DecodeError, DesyncError, DiscoveryError, PermanentRejection, StoreError,
    SyncError,
};
pub use metrics::SyncMetrics;
pub use reconciler::{Applied, Reconciler};
pub use registry::{OutboundCommand, SubscriptionRegistry};
pub use session::{ConnectOutcome, Session};
pub use store::BookStore;
pub use traits::{MarketSource, Transport};
pub use types::{AssetId, ConnectionState, PriceLevel, Side, SubscriptionRequest, TradeTick};
