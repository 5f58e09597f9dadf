use crate::error::{ParseError, SyncError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
        }
    }
}

/// Value handed to status listeners on every connection transition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub reconnect_attempt: u32,
    pub reason: Option<String>,
}

impl ConnectionStatus {
    pub fn disconnected(reason: Option<String>) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            reconnect_attempt: 0,
            reason,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CandleInterval {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "3m")]
    M3,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "30m")]
    M30,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "2h")]
    H2,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "6h")]
    H6,
    #[serde(rename = "12h")]
    H12,
    #[serde(rename = "1d")]
    D1,
    #[serde(rename = "1w")]
    W1,
    #[serde(rename = "1M")]
    Mo1,
}

impl CandleInterval {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::M1 => "1m",
            Self::M3 => "3m",
            Self::M5 => "5m",
            Self::M15 => "15m",
            Self::M30 => "30m",
            Self::H1 => "1h",
            Self::H2 => "2h",
            Self::H4 => "4h",
            Self::H6 => "6h",
            Self::H12 => "12h",
            Self::D1 => "1d",
            Self::W1 => "1w",
            Self::Mo1 => "1M",
        }
    }

    pub fn duration_ms(self) -> i64 {
        match self {
            Self::M1 => 60_000,
            Self::M3 => 180_000,
            Self::M5 => 300_000,
            Self::M15 => 900_000,
            Self::M30 => 1_800_000,
            Self::H1 => 3_600_000,
            Self::H2 => 7_200_000,
            Self::H4 => 14_400_000,
            Self::H6 => 21_600_000,
            Self::H12 => 43_200_000,
            Self::D1 => 86_400_000,
            Self::W1 => 604_800_000,
            Self::Mo1 => 2_592_000_000,
        }
    }
}

impl fmt::Display for CandleInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CandleInterval {
    type Err = ParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        // "1M" (month) and "1m" (minute) only differ by case, so match exactly first.
        let trimmed = value.trim();
        let interval = match trimmed {
            "1m" => Self::M1,
            "3m" => Self::M3,
            "5m" => Self::M5,
            "15m" => Self::M15,
            "30m" => Self::M30,
            "1h" | "1H" | "60m" => Self::H1,
            "2h" | "2H" => Self::H2,
            "4h" | "4H" => Self::H4,
            "6h" | "6H" => Self::H6,
            "12h" | "12H" => Self::H12,
            "1d" | "1D" => Self::D1,
            "1w" | "1W" => Self::W1,
            "1M" | "1mo" => Self::Mo1,
            _ => return Err(ParseError::UnknownInterval(trimmed.to_string())),
        };
        Ok(interval)
    }
}

/// Latest price, volume, and funding snapshot for one symbol.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Ticker {
    pub symbol: String,
    pub last_price: f64,
    pub mark_price: f64,
    pub price_change: f64,
    pub price_change_percent: f64,
    pub high_price: f64,
    pub low_price: f64,
    pub volume: f64,
    pub quote_volume: f64,
    pub open_interest: f64,
    pub funding_rate: f64,
    pub timestamp: i64,
}

/// One OHLCV bucket. `open_time` is the identity inside a series.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Candle {
    pub open_time: i64,
    pub close_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub trade_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "camelCase")]
pub struct SeriesKey {
    pub symbol: String,
    pub interval: CandleInterval,
}

impl SeriesKey {
    pub fn new(symbol: impl Into<String>, interval: CandleInterval) -> Self {
        Self {
            symbol: symbol.into(),
            interval,
        }
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.symbol, self.interval)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CandleUpdate {
    pub key: SeriesKey,
    pub candle: Candle,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Subscription {
    Ticker {
        symbol: String,
    },
    Candle {
        symbol: String,
        interval: CandleInterval,
    },
}

impl Subscription {
    pub fn ticker(symbol: impl Into<String>) -> Self {
        Self::Ticker {
            symbol: symbol.into(),
        }
    }

    pub fn candle(symbol: impl Into<String>, interval: CandleInterval) -> Self {
        Self::Candle {
            symbol: symbol.into(),
            interval,
        }
    }

    /// Deduplication key: `ticker:SYMBOL` or `candle:SYMBOL:INTERVAL`.
    pub fn key(&self) -> String {
        match self {
            Self::Ticker { symbol } => format!("ticker:{symbol}"),
            Self::Candle { symbol, interval } => format!("candle:{symbol}:{interval}"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionMethod {
    Subscribe,
    Unsubscribe,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SubscriptionFrame<'a> {
    pub method: SubscriptionMethod,
    pub subscription: &'a [Subscription],
}

impl<'a> SubscriptionFrame<'a> {
    pub fn new(method: SubscriptionMethod, subscription: &'a [Subscription]) -> Self {
        Self {
            method,
            subscription,
        }
    }

    pub fn to_json(&self) -> Result<String, SyncError> {
        Ok(serde_json::to_string(self)?)
    }
}

pub fn normalize_symbol(symbol: &str) -> Result<String, SyncError> {
    let symbol = symbol.trim().to_ascii_uppercase();
    let allowed = |ch: char| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '/');
    if symbol.is_empty() || !symbol.chars().all(allowed) {
        return Err(SyncError::InvalidArgument(
            "symbol must be non-empty alphanumeric ASCII".to_string(),
        ));
    }
    Ok(symbol)
}
