use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::market::providers::{CandleHistoryProvider, TickerSnapshotProvider};
use crate::market::types::{Candle, CandleInterval, SeriesKey, Ticker};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

const BINANCE_MAX_KLINES_PER_REQUEST: u16 = 1_500;

fn klines_endpoint(
    base_url: &str,
    symbol: &str,
    interval: CandleInterval,
    limit: u16,
    end_time: Option<i64>,
) -> String {
    let mut endpoint = format!("{base_url}/fapi/v1/klines")
        + &format!(
            "?symbol={}&interval={}&limit={limit}",
            symbol.to_ascii_uppercase(),
            interval.as_str()
        );
    if let Some(value) = end_time {
        endpoint.push_str(&format!("&endTime={value}"));
    }
    endpoint
}

fn ticker_24h_endpoint(base_url: &str, symbol: &str) -> String {
    format!(
        "{base_url}/fapi/v1/ticker/24hr?symbol={}",
        symbol.to_ascii_uppercase()
    )
}

fn premium_index_endpoint(base_url: &str, symbol: &str) -> String {
    format!(
        "{base_url}/fapi/v1/premiumIndex?symbol={}",
        symbol.to_ascii_uppercase()
    )
}

fn open_interest_endpoint(base_url: &str, symbol: &str) -> String {
    format!(
        "{base_url}/fapi/v1/openInterest?symbol={}",
        symbol.to_ascii_uppercase()
    )
}

#[derive(Debug, Deserialize)]
#[allow(dead_code)]
pub struct KlineWire(
    pub i64,
    pub String,
    pub String,
    pub String,
    pub String,
    pub String,
    pub i64,
    pub String,
    pub u64,
    pub String,
    pub String,
    pub String,
);

impl TryFrom<KlineWire> for Candle {
    type Error = SyncError;

    fn try_from(value: KlineWire) -> Result<Self, Self::Error> {
        let open = value.1.parse::<f64>()?;
        let high = value.2.parse::<f64>()?;
        let low = value.3.parse::<f64>()?;
        let close = value.4.parse::<f64>()?;
        let volume = value.5.parse::<f64>()?;

        if !open.is_finite()
            || !high.is_finite()
            || !low.is_finite()
            || !close.is_finite()
            || !volume.is_finite()
        {
            return Err(SyncError::InvalidArgument(
                "kline values must be finite".to_string(),
            ));
        }

        Ok(Self {
            open_time: value.0,
            close_time: value.6,
            open,
            high,
            low,
            close,
            volume: volume.max(0.0),
            trade_count: value.8,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Ticker24hWire {
    symbol: String,
    price_change: String,
    price_change_percent: String,
    last_price: String,
    high_price: String,
    low_price: String,
    volume: String,
    quote_volume: String,
    close_time: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PremiumIndexWire {
    mark_price: String,
    last_funding_rate: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OpenInterestWire {
    open_interest: String,
}

fn parse_finite(field: &str, raw: &str) -> Result<f64, SyncError> {
    let value = raw.trim().parse::<f64>()?;
    if !value.is_finite() {
        return Err(SyncError::InvalidArgument(format!(
            "{field} must be finite"
        )));
    }
    Ok(value)
}

fn ticker_from_wires(
    daily: Ticker24hWire,
    premium: PremiumIndexWire,
    open_interest: OpenInterestWire,
) -> Result<Ticker, SyncError> {
    Ok(Ticker {
        symbol: daily.symbol,
        last_price: parse_finite("lastPrice", &daily.last_price)?,
        mark_price: parse_finite("markPrice", &premium.mark_price)?,
        price_change: parse_finite("priceChange", &daily.price_change)?,
        price_change_percent: parse_finite("priceChangePercent", &daily.price_change_percent)?,
        high_price: parse_finite("highPrice", &daily.high_price)?,
        low_price: parse_finite("lowPrice", &daily.low_price)?,
        volume: parse_finite("volume", &daily.volume)?,
        quote_volume: parse_finite("quoteVolume", &daily.quote_volume)?,
        open_interest: parse_finite("openInterest", &open_interest.open_interest)?,
        funding_rate: parse_finite("lastFundingRate", &premium.last_funding_rate)?,
        timestamp: daily.close_time,
    })
}

/// Sorts, dedups, and keeps only rows strictly before `end_time_exclusive`.
fn finish_page(mut candles: Vec<Candle>, end_time_exclusive: Option<i64>) -> Vec<Candle> {
    if let Some(end_time) = end_time_exclusive {
        candles.retain(|candle| candle.open_time < end_time);
    }
    candles.sort_unstable_by_key(|candle| candle.open_time);
    candles.dedup_by_key(|candle| candle.open_time);
    candles
}

/// USD-M futures REST client serving candle pages and ticker snapshots.
#[derive(Debug, Clone)]
pub struct BinanceRestClient {
    client: Client,
    base_url: String,
}

impl BinanceRestClient {
    pub fn new(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(Client::new(), config.rest_base_url.clone())
    }

    async fn fetch_klines(
        &self,
        key: &SeriesKey,
        limit: u16,
        end_time_exclusive: Option<i64>,
    ) -> Result<Vec<Candle>, SyncError> {
        let request_limit = limit.clamp(1, BINANCE_MAX_KLINES_PER_REQUEST);
        // endTime is inclusive on the exchange side.
        let end_time = end_time_exclusive.map(|value| value.saturating_sub(1));
        let endpoint = klines_endpoint(
            &self.base_url,
            &key.symbol,
            key.interval,
            request_limit,
            end_time,
        );
        let response = self.client.get(endpoint).send().await?.error_for_status()?;
        let payload = response.json::<Vec<KlineWire>>().await?;

        let mut candles = Vec::with_capacity(payload.len());
        for kline in payload {
            candles.push(kline.try_into()?);
        }
        Ok(finish_page(candles, end_time_exclusive))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, endpoint: String) -> Result<T, SyncError> {
        let response = self.client.get(endpoint).send().await?.error_for_status()?;
        Ok(response.json::<T>().await?)
    }
}

#[async_trait]
impl CandleHistoryProvider for BinanceRestClient {
    async fn candles(&self, key: &SeriesKey, limit: u16) -> Result<Vec<Candle>, SyncError> {
        self.fetch_klines(key, limit, None).await
    }

    async fn older_candles(
        &self,
        key: &SeriesKey,
        end_time_exclusive: i64,
        limit: u16,
    ) -> Result<Vec<Candle>, SyncError> {
        self.fetch_klines(key, limit, Some(end_time_exclusive)).await
    }
}

#[async_trait]
impl TickerSnapshotProvider for BinanceRestClient {
    async fn ticker(&self, symbol: &str) -> Result<Ticker, SyncError> {
        let daily_future =
            self.get_json::<Ticker24hWire>(ticker_24h_endpoint(&self.base_url, symbol));
        let premium_future =
            self.get_json::<PremiumIndexWire>(premium_index_endpoint(&self.base_url, symbol));
        let open_interest_future =
            self.get_json::<OpenInterestWire>(open_interest_endpoint(&self.base_url, symbol));

        let (daily, premium, open_interest) =
            tokio::join!(daily_future, premium_future, open_interest_future);
        ticker_from_wires(daily?, premium?, open_interest?)
    }
}
