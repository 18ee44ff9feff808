use async_trait::async_trait;

use crate::error::{ConnectionError, DiscoveryError};
use crate::types::{DiscoveredMarket, SubscriptionRequest};

/// Bidirectional text-frame transport to the market data feed.
///
/// One connection at a time. `receive` yields every inbound text frame,
/// keepalive replies included, and must be cancel-safe: the caller races it
/// against its own read deadline. Writes must be bounded by the transport.
#[async_trait]
pub trait Transport: Send {
    /// Opens a fresh connection, replacing any existing one.
    async fn connect(&mut self) -> Result<(), ConnectionError>;

    async fn send(&mut self, request: &SubscriptionRequest) -> Result<(), ConnectionError>;

    /// Next text frame. Errors mean the connection is gone.
    async fn receive(&mut self) -> Result<String, ConnectionError>;

    /// Application-level keepalive.
    async fn ping(&mut self) -> Result<(), ConnectionError>;

    async fn close(&mut self) -> Result<(), ConnectionError>;
}

/// Source of tradable markets for automatic subscription.
#[async_trait]
pub trait MarketSource: Send + Sync {
    async fn fetch_markets(&self) -> Result<Vec<DiscoveredMarket>, DiscoveryError>;
}
