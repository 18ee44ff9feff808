//! Polymarket CLOB market channel: wire types, WebSocket transport and
//! Gamma market discovery. No authentication is needed for public books.

pub mod market_discovery;
pub mod messages;
pub mod websocket;

pub use market_discovery::{collect_asset_ids, GammaMarketSource};
pub use messages::FeedMessage;
pub use websocket::WsTransport;
