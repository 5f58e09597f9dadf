//! Real-time ticker and candle synchronization for trading dashboards.
//!
//! [`market::MarketDataClient`] is the entry point: it owns the websocket
//! [`market::TransportManager`], the in-memory [`market::LiveStore`] and the
//! REST-backed [`market::BackfillCoordinator`].

pub mod config;
pub mod error;
pub mod logging;
pub mod market;

pub use config::{SyncConfig, SyncConfigArgs};
pub use error::{ParseError, SyncError};
pub use market::types::{
    Candle, CandleInterval, CandleUpdate, ConnectionState, ConnectionStatus, SeriesKey,
    Subscription, Ticker,
};
pub use market::MarketDataClient;
