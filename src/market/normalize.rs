//! Turns stream frames into canonical [`Ticker`] and [`CandleUpdate`] records.
//!
//! The upstream schema is not fixed, so every canonical field is looked up
//! through an alias table covering the camelCase, snake_case and single-letter
//! exchange spellings seen in the wild. Numeric fields accept numbers or
//! numeric strings and fall back to zero when absent.

use crate::error::ParseError;
use crate::market::types::{Candle, CandleInterval, CandleUpdate, SeriesKey, Ticker};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq)]
pub enum MarketFrame {
    Ticker(Ticker),
    Candles(Vec<CandleUpdate>),
    SubscriptionAck,
}

const KIND_KEYS: &[&str] = &["type", "channel", "e", "event", "stream", "topic"];
const ENVELOPE_KEYS: &[&str] = &["data", "result", "payload"];

const TICKER_KINDS: &[&str] = &["ticker", "24hrticker", "tickers", "markpriceupdate"];
const CANDLE_KINDS: &[&str] = &["candle", "candles", "kline", "klines", "ohlcv"];
const ACK_KINDS: &[&str] = &["subscribed", "unsubscribed", "subscriptionresponse", "ack"];

const SYMBOL: &[&str] = &["symbol", "s", "coin", "instrument", "market"];
const INTERVAL: &[&str] = &["interval", "i", "resolution", "timeframe"];

const LAST_PRICE: &[&str] = &["lastPrice", "last_price", "c", "last", "price"];
const MARK_PRICE: &[&str] = &["markPrice", "mark_price", "markPx", "mark"];
const PRICE_CHANGE: &[&str] = &["priceChange", "price_change", "p", "change"];
const PRICE_CHANGE_PERCENT: &[&str] = &[
    "priceChangePercent",
    "price_change_percent",
    "P",
    "changePercent",
];
const HIGH_PRICE: &[&str] = &["highPrice", "high_price", "h", "high"];
const LOW_PRICE: &[&str] = &["lowPrice", "low_price", "l", "low"];
const VOLUME: &[&str] = &["volume", "v", "baseVolume", "base_volume"];
const QUOTE_VOLUME: &[&str] = &["quoteVolume", "quote_volume", "q", "turnover"];
const OPEN_INTEREST: &[&str] = &["openInterest", "open_interest", "oi"];
const FUNDING_RATE: &[&str] = &["fundingRate", "funding_rate", "r", "funding"];
const TIMESTAMP: &[&str] = &["timestamp", "ts", "E", "time", "eventTime", "event_time"];

const OPEN_TIME: &[&str] = &["openTime", "open_time", "t", "start", "startTime"];
const CLOSE_TIME: &[&str] = &["closeTime", "close_time", "T", "end", "endTime"];
const OPEN: &[&str] = &["open", "o"];
const HIGH: &[&str] = &["high", "h"];
const LOW: &[&str] = &["low", "l"];
const CLOSE: &[&str] = &["close", "c"];
const CANDLE_VOLUME: &[&str] = &["volume", "v", "baseVolume", "base_volume"];
const TRADE_COUNT: &[&str] = &["tradeCount", "trade_count", "n", "trades", "count"];

/// Decodes one raw frame. The slice is used as simd-json scratch space.
pub fn normalize_frame(payload: &mut [u8]) -> Result<MarketFrame, ParseError> {
    let value: Value = simd_json::serde::from_slice(payload)
        .map_err(|error| ParseError::InvalidJson(error.to_string()))?;
    normalize_value(&value)
}

pub fn normalize_value(value: &Value) -> Result<MarketFrame, ParseError> {
    let envelope = value.as_object().ok_or(ParseError::UnrecognizedFrame)?;

    if is_subscription_ack(envelope) {
        return Ok(MarketFrame::SubscriptionAck);
    }

    let kind = frame_kind(envelope).ok_or(ParseError::UnrecognizedFrame)?;
    let body = envelope_body(envelope);

    if matches_kind(&kind, CANDLE_KINDS) {
        return normalize_candles(envelope, body).map(MarketFrame::Candles);
    }
    if matches_kind(&kind, TICKER_KINDS) {
        let fields = body
            .and_then(Value::as_object)
            .unwrap_or(envelope);
        return normalize_ticker(fields, envelope).map(MarketFrame::Ticker);
    }
    if matches_kind(&kind, ACK_KINDS) {
        return Ok(MarketFrame::SubscriptionAck);
    }

    Err(ParseError::UnrecognizedFrame)
}

fn is_subscription_ack(envelope: &Map<String, Value>) -> bool {
    let method_is_subscription = envelope
        .get("method")
        .and_then(Value::as_str)
        .map(|method| {
            method.eq_ignore_ascii_case("subscribe") || method.eq_ignore_ascii_case("unsubscribe")
        })
        .unwrap_or(false);
    let carries_result = envelope.contains_key("result")
        || envelope.contains_key("success")
        || envelope.contains_key("id");
    let has_no_data = !envelope.contains_key("data");
    method_is_subscription && carries_result && has_no_data
}

fn frame_kind(envelope: &Map<String, Value>) -> Option<String> {
    let own = KIND_KEYS
        .iter()
        .find_map(|key| envelope.get(*key).and_then(Value::as_str));
    if let Some(kind) = own {
        return Some(kind.to_ascii_lowercase());
    }

    // Binance-style `{ "stream": "...", "data": { "e": "kline" } }` puts the kind inside.
    envelope_body(envelope)
        .and_then(Value::as_object)
        .and_then(|inner| {
            KIND_KEYS
                .iter()
                .find_map(|key| inner.get(*key).and_then(Value::as_str))
        })
        .map(str::to_ascii_lowercase)
}

fn matches_kind(kind: &str, known: &[&str]) -> bool {
    // Stream names such as "solusdt@kline_5m" or "candle.SOL.5m" embed the kind.
    known.iter().any(|candidate| {
        kind == *candidate
            || kind
                .split(['@', '.', ':', '_', '/'])
                .any(|part| part == *candidate)
    })
}

fn envelope_body(envelope: &Map<String, Value>) -> Option<&Value> {
    ENVELOPE_KEYS.iter().find_map(|key| envelope.get(*key))
}

fn lookup<'a>(fields: &'a Map<String, Value>, aliases: &[&str]) -> Option<&'a Value> {
    aliases
        .iter()
        .find_map(|alias| fields.get(*alias).filter(|value| !value.is_null()))
}

fn number_from(value: &Value) -> Option<f64> {
    let parsed = match value {
        Value::Number(number) => number.as_f64(),
        Value::String(raw) => raw.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    parsed.is_finite().then_some(parsed)
}

fn float_field(fields: &Map<String, Value>, aliases: &[&str]) -> f64 {
    lookup(fields, aliases).and_then(number_from).unwrap_or(0.0)
}

fn int_field(fields: &Map<String, Value>, aliases: &[&str]) -> Option<i64> {
    let value = lookup(fields, aliases)?;
    match value {
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().map(|float| float as i64)),
        Value::String(raw) => raw.trim().parse::<i64>().ok(),
        _ => None,
    }
}

fn string_field<'a>(fields: &'a Map<String, Value>, aliases: &[&str]) -> Option<&'a str> {
    lookup(fields, aliases)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

fn normalize_ticker(
    fields: &Map<String, Value>,
    envelope: &Map<String, Value>,
) -> Result<Ticker, ParseError> {
    let symbol = string_field(fields, SYMBOL)
        .or_else(|| string_field(envelope, SYMBOL))
        .ok_or(ParseError::MissingField("symbol"))?;

    Ok(Ticker {
        symbol: symbol.to_ascii_uppercase(),
        last_price: float_field(fields, LAST_PRICE),
        mark_price: float_field(fields, MARK_PRICE),
        price_change: float_field(fields, PRICE_CHANGE),
        price_change_percent: float_field(fields, PRICE_CHANGE_PERCENT),
        high_price: float_field(fields, HIGH_PRICE),
        low_price: float_field(fields, LOW_PRICE),
        volume: float_field(fields, VOLUME),
        quote_volume: float_field(fields, QUOTE_VOLUME),
        open_interest: float_field(fields, OPEN_INTEREST),
        funding_rate: float_field(fields, FUNDING_RATE),
        timestamp: int_field(fields, TIMESTAMP)
            .or_else(|| int_field(envelope, TIMESTAMP))
            .unwrap_or(0),
    })
}

fn normalize_candles(
    envelope: &Map<String, Value>,
    body: Option<&Value>,
) -> Result<Vec<CandleUpdate>, ParseError> {
    match body {
        Some(Value::Array(entries)) => entries
            .iter()
            .map(|entry| {
                let fields = entry.as_object().ok_or(ParseError::UnrecognizedFrame)?;
                normalize_candle_entry(fields, &[envelope])
            })
            .collect(),
        Some(Value::Object(inner)) => {
            if let Some(Value::Array(entries)) = inner.get("candles") {
                return entries
                    .iter()
                    .map(|entry| {
                        let fields = entry.as_object().ok_or(ParseError::UnrecognizedFrame)?;
                        normalize_candle_entry(fields, &[inner, envelope])
                    })
                    .collect();
            }
            normalize_single_candle(inner, envelope).map(|update| vec![update])
        }
        _ => normalize_single_candle(envelope, envelope).map(|update| vec![update]),
    }
}

fn normalize_single_candle(
    fields: &Map<String, Value>,
    envelope: &Map<String, Value>,
) -> Result<CandleUpdate, ParseError> {
    // Binance nests the bucket under "k" and keeps the symbol on the event.
    match fields.get("k").and_then(Value::as_object) {
        Some(nested) => normalize_candle_entry(nested, &[fields, envelope]),
        None => normalize_candle_entry(fields, &[envelope]),
    }
}

fn normalize_candle_entry(
    fields: &Map<String, Value>,
    outer: &[&Map<String, Value>],
) -> Result<CandleUpdate, ParseError> {
    let symbol = string_field(fields, SYMBOL)
        .or_else(|| outer.iter().find_map(|scope| string_field(scope, SYMBOL)))
        .ok_or(ParseError::MissingField("symbol"))?;
    let interval_raw = string_field(fields, INTERVAL)
        .or_else(|| outer.iter().find_map(|scope| string_field(scope, INTERVAL)))
        .ok_or(ParseError::MissingField("interval"))?;
    let interval = interval_raw.parse::<CandleInterval>()?;
    let open_time = int_field(fields, OPEN_TIME).ok_or(ParseError::MissingField("openTime"))?;

    let candle = Candle {
        open_time,
        close_time: int_field(fields, CLOSE_TIME).unwrap_or(0),
        open: float_field(fields, OPEN),
        high: float_field(fields, HIGH),
        low: float_field(fields, LOW),
        close: float_field(fields, CLOSE),
        volume: float_field(fields, CANDLE_VOLUME),
        trade_count: int_field(fields, TRADE_COUNT)
            .map(|count| count.max(0) as u64)
            .unwrap_or(0),
    };

    Ok(CandleUpdate {
        key: SeriesKey::new(symbol.to_ascii_uppercase(), interval),
        candle,
    })
}
