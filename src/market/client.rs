use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::market::backfill::BackfillCoordinator;
use crate::market::binance::BinanceRestClient;
use crate::market::listeners::ListenerHandle;
use crate::market::providers::{CandleHistoryProvider, TickerSnapshotProvider};
use crate::market::store::{LiveStore, TickerApplyOutcome};
use crate::market::transport::TransportManager;
use crate::market::types::{
    normalize_symbol, Candle, CandleInterval, CandleUpdate, ConnectionStatus, SeriesKey,
    Subscription, Ticker,
};
use std::sync::Arc;
use tracing::{debug, info};

/// Consumer facade over the stream transport, the live store and the REST
/// history. Symbols are normalized on the way in, so `"solusdt "` and
/// `"SOLUSDT"` address the same data.
pub struct MarketDataClient {
    config: SyncConfig,
    store: Arc<LiveStore>,
    transport: Arc<TransportManager>,
    backfill: BackfillCoordinator,
    history: Arc<dyn CandleHistoryProvider>,
    tickers: Arc<dyn TickerSnapshotProvider>,
}

impl MarketDataClient {
    pub fn new(
        config: SyncConfig,
        history: Arc<dyn CandleHistoryProvider>,
        tickers: Arc<dyn TickerSnapshotProvider>,
    ) -> Self {
        let store = Arc::new(LiveStore::new(
            config.ticker_throttle(),
            config.max_candles,
        ));
        let transport = TransportManager::new(&config, Arc::clone(&store));
        let backfill = BackfillCoordinator::new(
            Arc::clone(&store),
            Arc::clone(&history),
            config.history_page_limit,
        );
        Self {
            config,
            store,
            transport,
            backfill,
            history,
            tickers,
        }
    }

    /// Client backed by the Binance USD-M REST API for history and ticker snapshots.
    pub fn from_config(config: SyncConfig) -> Self {
        let rest = Arc::new(BinanceRestClient::from_config(&config));
        Self::new(config, rest.clone(), rest)
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<LiveStore> {
        &self.store
    }

    pub fn transport(&self) -> &Arc<TransportManager> {
        &self.transport
    }

    pub fn connect(&self) {
        self.transport.connect();
    }

    pub fn disconnect(&self) {
        self.transport.disconnect();
    }

    pub fn status(&self) -> ConnectionStatus {
        self.transport.status()
    }

    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.transport.subscriptions()
    }

    pub fn subscribe(&self, symbol: &str) -> Result<bool, SyncError> {
        self.transport.subscribe_ticker(symbol)
    }

    /// Stops the ticker stream for `symbol` and drops its snapshot.
    pub fn unsubscribe(&self, symbol: &str) -> Result<bool, SyncError> {
        self.transport.unsubscribe_ticker(symbol)
    }

    pub fn subscribe_series(
        &self,
        symbol: &str,
        interval: CandleInterval,
    ) -> Result<bool, SyncError> {
        self.transport.subscribe_candle(symbol, interval)
    }

    /// Stops the candle stream and discards the series with its history flags.
    pub fn unsubscribe_series(
        &self,
        symbol: &str,
        interval: CandleInterval,
    ) -> Result<bool, SyncError> {
        let key = series_key(symbol, interval)?;
        let changed = self.transport.unsubscribe_candle(&key.symbol, interval)?;
        self.backfill.reset(&key);
        debug!(series = %key, "series discarded");
        Ok(changed)
    }

    pub fn get_snapshot(&self, symbol: &str) -> Option<Ticker> {
        let symbol = normalize_symbol(symbol).ok()?;
        self.store.ticker(&symbol)
    }

    pub fn get_series(&self, symbol: &str, interval: CandleInterval) -> Vec<Candle> {
        match series_key(symbol, interval) {
            Ok(key) => self.store.series(&key),
            Err(_) => Vec::new(),
        }
    }

    pub async fn fetch_older(
        &self,
        symbol: &str,
        interval: CandleInterval,
        before_time: i64,
    ) -> Result<Vec<Candle>, SyncError> {
        let key = series_key(symbol, interval)?;
        self.backfill.fetch_older(&key, before_time).await
    }

    pub fn is_history_exhausted(&self, symbol: &str, interval: CandleInterval) -> bool {
        series_key(symbol, interval)
            .map(|key| self.backfill.is_exhausted(&key))
            .unwrap_or(false)
    }

    /// Loads the most recent page of candles and seeds the series with it.
    /// Live candles that arrived meanwhile win on open-time collisions.
    /// Returns the series length afterwards.
    pub async fn load_series(
        &self,
        symbol: &str,
        interval: CandleInterval,
    ) -> Result<usize, SyncError> {
        let key = series_key(symbol, interval)?;
        let page = self
            .history
            .candles(&key, self.config.initial_page_limit)
            .await?;
        let fetched = page.len();
        let len = self.store.seed_series(&key, page);
        info!(series = %key, fetched, len, "initial candles loaded");
        Ok(len)
    }

    /// Pulls a REST ticker snapshot and applies it like a stream update.
    pub async fn refresh_ticker(&self, symbol: &str) -> Result<TickerApplyOutcome, SyncError> {
        let symbol = normalize_symbol(symbol)?;
        let mut ticker = self.tickers.ticker(&symbol).await?;
        ticker.symbol = symbol;
        Ok(self.transport.publish_ticker(ticker))
    }

    pub fn on_ticker<F>(&self, listener: F) -> ListenerHandle
    where
        F: Fn(&Ticker) + Send + Sync + 'static,
    {
        self.transport.on_ticker(listener)
    }

    pub fn on_candle<F>(&self, listener: F) -> ListenerHandle
    where
        F: Fn(&CandleUpdate) + Send + Sync + 'static,
    {
        self.transport.on_candle(listener)
    }

    pub fn on_status_change<F>(&self, listener: F) -> ListenerHandle
    where
        F: Fn(&ConnectionStatus) + Send + Sync + 'static,
    {
        self.transport.on_status_change(listener)
    }
}

fn series_key(symbol: &str, interval: CandleInterval) -> Result<SeriesKey, SyncError> {
    Ok(SeriesKey::new(normalize_symbol(symbol)?, interval))
}
