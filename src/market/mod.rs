pub mod backfill;
pub mod binance;
pub mod client;
pub mod listeners;
pub mod normalize;
pub mod providers;
pub mod store;
pub mod transport;
pub mod types;

pub use backfill::BackfillCoordinator;
pub use binance::BinanceRestClient;
pub use client::MarketDataClient;
pub use listeners::ListenerHandle;
pub use normalize::{normalize_frame, MarketFrame};
pub use providers::{CandleHistoryProvider, TickerSnapshotProvider};
pub use store::{CandleApplyOutcome, LiveStore, TickerApplyOutcome};
pub use transport::TransportManager;
