use crate::error::SyncError;
use crate::market::types::{Candle, SeriesKey, Ticker};
use async_trait::async_trait;

/// REST source of candle pages. Pages are ascending by open time.
#[async_trait]
pub trait CandleHistoryProvider: Send + Sync {
    /// Most recent `limit` candles of the series.
    async fn candles(&self, key: &SeriesKey, limit: u16) -> Result<Vec<Candle>, SyncError>;

    /// Up to `limit` candles strictly older than `end_time_exclusive`.
    /// An empty page means no earlier history exists.
    async fn older_candles(
        &self,
        key: &SeriesKey,
        end_time_exclusive: i64,
        limit: u16,
    ) -> Result<Vec<Candle>, SyncError>;
}

/// REST ticker snapshot used while the stream is unavailable.
#[async_trait]
pub trait TickerSnapshotProvider: Send + Sync {
    async fn ticker(&self, symbol: &str) -> Result<Ticker, SyncError>;
}
