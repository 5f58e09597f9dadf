use crate::error::SyncError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_STREAM_URL: &str = "ws://127.0.0.1:8787/ws";
pub const DEFAULT_REST_BASE_URL: &str = "https://fapi.binance.com";
pub const DEFAULT_INITIAL_BACKOFF_MS: u64 = 1_000;
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;
pub const DEFAULT_MAX_BACKOFF_MS: u64 = 30_000;
pub const DEFAULT_TICKER_THROTTLE_MS: u64 = 250;
pub const DEFAULT_MAX_CANDLES: usize = 1_500;
pub const DEFAULT_HISTORY_PAGE_LIMIT: u16 = 200;
pub const DEFAULT_INITIAL_PAGE_LIMIT: u16 = 200;
pub const MIN_INITIAL_BACKOFF_MS: u64 = 1;
pub const MAX_INITIAL_BACKOFF_MS: u64 = 60_000;
pub const MIN_BACKOFF_MULTIPLIER: f64 = 1.0;
pub const MAX_BACKOFF_MULTIPLIER: f64 = 10.0;
pub const MAX_MAX_BACKOFF_MS: u64 = 600_000;
pub const MAX_TICKER_THROTTLE_MS: u64 = 60_000;
pub const MIN_MAX_CANDLES: usize = 50;
pub const MAX_MAX_CANDLES: usize = 20_000;
pub const MIN_PAGE_LIMIT: u16 = 1;
pub const MAX_PAGE_LIMIT: u16 = 1_500;

const ENV_PREFIX: &str = "MARKET_SYNC_";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SyncConfigArgs {
    pub stream_url: Option<String>,
    pub rest_base_url: Option<String>,
    pub initial_backoff_ms: Option<u64>,
    pub backoff_multiplier: Option<f64>,
    pub max_backoff_ms: Option<u64>,
    pub ticker_throttle_ms: Option<u64>,
    pub max_candles: Option<usize>,
    pub history_page_limit: Option<u16>,
    pub initial_page_limit: Option<u16>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    pub stream_url: String,
    pub rest_base_url: String,
    pub initial_backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub max_backoff_ms: u64,
    pub ticker_throttle_ms: u64,
    pub max_candles: usize,
    pub history_page_limit: u16,
    pub initial_page_limit: u16,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            stream_url: DEFAULT_STREAM_URL.to_string(),
            rest_base_url: DEFAULT_REST_BASE_URL.to_string(),
            initial_backoff_ms: DEFAULT_INITIAL_BACKOFF_MS,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            max_backoff_ms: DEFAULT_MAX_BACKOFF_MS,
            ticker_throttle_ms: DEFAULT_TICKER_THROTTLE_MS,
            max_candles: DEFAULT_MAX_CANDLES,
            history_page_limit: DEFAULT_HISTORY_PAGE_LIMIT,
            initial_page_limit: DEFAULT_INITIAL_PAGE_LIMIT,
        }
    }
}

impl SyncConfig {
    pub fn ticker_throttle(&self) -> Duration {
        Duration::from_millis(self.ticker_throttle_ms)
    }
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(format!("{ENV_PREFIX}{name}"))
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_parsed<T: std::str::FromStr>(name: &str) -> Result<Option<T>, SyncError> {
    match env_value(name) {
        Some(raw) => raw.parse::<T>().map(Some).map_err(|_| {
            SyncError::InvalidArgument(format!("{ENV_PREFIX}{name} has invalid value '{raw}'"))
        }),
        None => Ok(None),
    }
}

impl SyncConfigArgs {
    /// Reads `MARKET_SYNC_*` variables; unset or blank variables stay `None`.
    pub fn from_env() -> Result<Self, SyncError> {
        Ok(Self {
            stream_url: env_value("STREAM_URL"),
            rest_base_url: env_value("REST_BASE_URL"),
            initial_backoff_ms: env_parsed("INITIAL_BACKOFF_MS")?,
            backoff_multiplier: env_parsed("BACKOFF_MULTIPLIER")?,
            max_backoff_ms: env_parsed("MAX_BACKOFF_MS")?,
            ticker_throttle_ms: env_parsed("TICKER_THROTTLE_MS")?,
            max_candles: env_parsed("MAX_CANDLES")?,
            history_page_limit: env_parsed("HISTORY_PAGE_LIMIT")?,
            initial_page_limit: env_parsed("INITIAL_PAGE_LIMIT")?,
        })
    }

    pub fn normalize(self) -> Result<SyncConfig, SyncError> {
        let stream_url = self
            .stream_url
            .unwrap_or_else(|| DEFAULT_STREAM_URL.to_string())
            .trim()
            .to_string();
        if !(stream_url.starts_with("ws://") || stream_url.starts_with("wss://")) {
            return Err(SyncError::InvalidArgument(
                "streamUrl must use the ws:// or wss:// scheme".to_string(),
            ));
        }

        let rest_base_url = self
            .rest_base_url
            .unwrap_or_else(|| DEFAULT_REST_BASE_URL.to_string())
            .trim()
            .trim_end_matches('/')
            .to_string();
        if !(rest_base_url.starts_with("http://") || rest_base_url.starts_with("https://")) {
            return Err(SyncError::InvalidArgument(
                "restBaseUrl must use the http:// or https:// scheme".to_string(),
            ));
        }

        let initial_backoff_ms = self
            .initial_backoff_ms
            .unwrap_or(DEFAULT_INITIAL_BACKOFF_MS);
        if !(MIN_INITIAL_BACKOFF_MS..=MAX_INITIAL_BACKOFF_MS).contains(&initial_backoff_ms) {
            return Err(SyncError::InvalidArgument(format!(
                "initialBackoffMs must be between {MIN_INITIAL_BACKOFF_MS} and {MAX_INITIAL_BACKOFF_MS}"
            )));
        }

        let backoff_multiplier = self
            .backoff_multiplier
            .unwrap_or(DEFAULT_BACKOFF_MULTIPLIER);
        if !backoff_multiplier.is_finite()
            || !(MIN_BACKOFF_MULTIPLIER..=MAX_BACKOFF_MULTIPLIER).contains(&backoff_multiplier)
        {
            return Err(SyncError::InvalidArgument(format!(
                "backoffMultiplier must be between {MIN_BACKOFF_MULTIPLIER} and {MAX_BACKOFF_MULTIPLIER}"
            )));
        }

        let max_backoff_ms = self.max_backoff_ms.unwrap_or(DEFAULT_MAX_BACKOFF_MS);
        if !(initial_backoff_ms..=MAX_MAX_BACKOFF_MS).contains(&max_backoff_ms) {
            return Err(SyncError::InvalidArgument(format!(
                "maxBackoffMs must be between initialBackoffMs and {MAX_MAX_BACKOFF_MS}"
            )));
        }

        let ticker_throttle_ms = self
            .ticker_throttle_ms
            .unwrap_or(DEFAULT_TICKER_THROTTLE_MS);
        if ticker_throttle_ms > MAX_TICKER_THROTTLE_MS {
            return Err(SyncError::InvalidArgument(format!(
                "tickerThrottleMs must not exceed {MAX_TICKER_THROTTLE_MS}"
            )));
        }

        let max_candles = self.max_candles.unwrap_or(DEFAULT_MAX_CANDLES);
        if !(MIN_MAX_CANDLES..=MAX_MAX_CANDLES).contains(&max_candles) {
            return Err(SyncError::InvalidArgument(format!(
                "maxCandles must be between {MIN_MAX_CANDLES} and {MAX_MAX_CANDLES}"
            )));
        }

        let history_page_limit = self
            .history_page_limit
            .unwrap_or(DEFAULT_HISTORY_PAGE_LIMIT);
        let initial_page_limit = self
            .initial_page_limit
            .unwrap_or(DEFAULT_INITIAL_PAGE_LIMIT);
        for (name, limit) in [
            ("historyPageLimit", history_page_limit),
            ("initialPageLimit", initial_page_limit),
        ] {
            if !(MIN_PAGE_LIMIT..=MAX_PAGE_LIMIT).contains(&limit) {
                return Err(SyncError::InvalidArgument(format!(
                    "{name} must be between {MIN_PAGE_LIMIT} and {MAX_PAGE_LIMIT}"
                )));
            }
        }

        Ok(SyncConfig {
            stream_url,
            rest_base_url,
            initial_backoff_ms,
            backoff_multiplier,
            max_backoff_ms,
            ticker_throttle_ms,
            max_candles,
            history_page_limit,
            initial_page_limit,
        })
    }
}
