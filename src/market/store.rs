//! In-memory mirror of the latest tickers and bounded candle series.
//!
//! The mutation methods here are the only write path. Each candle series sits
//! behind its own mutex, so live updates and backfill merges for one series
//! are serialized while distinct series never contend.

use crate::market::types::{Candle, CandleUpdate, SeriesKey, Ticker};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickerApplyOutcome {
    Applied,
    Throttled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandleApplyOutcome {
    Appended,
    Replaced,
    /// Older than the last bucket; the live path never rewinds a series.
    Stale { open_time: i64, last_open_time: i64 },
    /// No series exists for the key; live updates never create one.
    Untracked,
}

#[derive(Debug, Clone)]
struct TickerSlot {
    snapshot: Ticker,
    applied_at: Instant,
}

#[derive(Debug, Default)]
struct CandleSeries {
    candles: VecDeque<Candle>,
}

impl CandleSeries {
    fn apply_live(&mut self, candle: Candle, max_len: usize) -> CandleApplyOutcome {
        let outcome = match self.candles.back_mut() {
            Some(last) if candle.open_time < last.open_time => {
                return CandleApplyOutcome::Stale {
                    open_time: candle.open_time,
                    last_open_time: last.open_time,
                };
            }
            Some(last) if candle.open_time == last.open_time => {
                *last = candle;
                CandleApplyOutcome::Replaced
            }
            _ => {
                self.candles.push_back(candle);
                CandleApplyOutcome::Appended
            }
        };
        self.trim_front(max_len);
        outcome
    }

    /// Merges `page` into the series by open time, skipping open times already
    /// held, then trims the front. Returns the page candles still held.
    fn merge(&mut self, page: Vec<Candle>, max_len: usize) -> Vec<Candle> {
        let mut incoming: Vec<Candle> = page
            .into_iter()
            .filter(|candle| !self.contains(candle.open_time))
            .collect();
        incoming.sort_by_key(|candle| candle.open_time);
        incoming.dedup_by_key(|candle| candle.open_time);
        if incoming.is_empty() {
            return incoming;
        }

        let existing = std::mem::take(&mut self.candles);
        let mut merged = VecDeque::with_capacity(existing.len() + incoming.len());
        let mut existing = existing.into_iter().peekable();
        let mut fresh = incoming.iter().cloned().peekable();
        loop {
            let take_existing = match (existing.peek(), fresh.peek()) {
                (Some(current), Some(candidate)) => current.open_time < candidate.open_time,
                (Some(_), None) => true,
                (None, Some(_)) => false,
                (None, None) => break,
            };
            let next = if take_existing {
                existing.next()
            } else {
                fresh.next()
            };
            merged.extend(next);
        }
        self.candles = merged;
        self.trim_front(max_len);

        let front = self
            .candles
            .front()
            .map(|candle| candle.open_time)
            .unwrap_or(i64::MAX);
        incoming.retain(|candle| candle.open_time >= front);
        incoming
    }

    fn contains(&self, open_time: i64) -> bool {
        self.candles
            .binary_search_by_key(&open_time, |candle| candle.open_time)
            .is_ok()
    }

    fn trim_front(&mut self, max_len: usize) {
        if self.candles.len() > max_len {
            let overflow = self.candles.len() - max_len;
            self.candles.drain(0..overflow);
        }
    }
}

#[derive(Debug)]
pub struct LiveStore {
    tickers: RwLock<HashMap<String, TickerSlot>>,
    series: RwLock<HashMap<SeriesKey, Arc<Mutex<CandleSeries>>>>,
    ticker_throttle: Duration,
    max_candles: usize,
}

impl LiveStore {
    pub fn new(ticker_throttle: Duration, max_candles: usize) -> Self {
        Self {
            tickers: RwLock::new(HashMap::new()),
            series: RwLock::new(HashMap::new()),
            ticker_throttle,
            max_candles: max_candles.max(1),
        }
    }

    pub fn max_candles(&self) -> usize {
        self.max_candles
    }

    pub fn apply_ticker(&self, ticker: Ticker) -> TickerApplyOutcome {
        self.apply_ticker_at(ticker, Instant::now())
    }

    /// Latest-wins throttle: an update landing inside the window of the last
    /// *applied* update is dropped outright, never queued.
    pub fn apply_ticker_at(&self, ticker: Ticker, now: Instant) -> TickerApplyOutcome {
        let mut tickers = self.tickers.write();
        if let Some(slot) = tickers.get(&ticker.symbol) {
            if now.saturating_duration_since(slot.applied_at) < self.ticker_throttle {
                return TickerApplyOutcome::Throttled;
            }
        }

        tickers.insert(
            ticker.symbol.clone(),
            TickerSlot {
                snapshot: ticker,
                applied_at: now,
            },
        );
        TickerApplyOutcome::Applied
    }

    pub fn ticker(&self, symbol: &str) -> Option<Ticker> {
        self.tickers
            .read()
            .get(symbol)
            .map(|slot| slot.snapshot.clone())
    }

    pub fn remove_ticker(&self, symbol: &str) -> bool {
        self.tickers.write().remove(symbol).is_some()
    }

    /// Live path. Writes only to series created by [`LiveStore::ensure_series`]
    /// or [`LiveStore::seed_series`].
    pub fn apply_candle(&self, update: CandleUpdate) -> CandleApplyOutcome {
        let Some(series) = self.existing_slot(&update.key) else {
            return CandleApplyOutcome::Untracked;
        };
        let mut writable = series.lock();
        writable.apply_live(update.candle, self.max_candles)
    }

    /// Seeds a series with the initial page. Candles that arrived live while
    /// the page was in flight are kept in preference to the page's copy.
    pub fn seed_series(&self, key: &SeriesKey, page: Vec<Candle>) -> usize {
        let series = self.series_slot(key);
        let mut writable = series.lock();
        writable.merge(page, self.max_candles);
        writable.candles.len()
    }

    /// Backfill merge: dedup against the series as it is *now*, keep ascending
    /// order, then trim from the front. Readers never observe a partial merge.
    /// A series that no longer exists is left absent.
    pub fn merge_older(&self, key: &SeriesKey, page: Vec<Candle>) -> Vec<Candle> {
        let Some(series) = self.existing_slot(key) else {
            return Vec::new();
        };
        let mut writable = series.lock();
        writable.merge(page, self.max_candles)
    }

    pub fn ensure_series(&self, key: &SeriesKey) {
        let _ = self.series_slot(key);
    }

    pub fn remove_series(&self, key: &SeriesKey) -> bool {
        self.series.write().remove(key).is_some()
    }

    pub fn has_series(&self, key: &SeriesKey) -> bool {
        self.series.read().contains_key(key)
    }

    pub fn series(&self, key: &SeriesKey) -> Vec<Candle> {
        self.existing_slot(key)
            .map(|series| series.lock().candles.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn series_len(&self, key: &SeriesKey) -> usize {
        self.existing_slot(key)
            .map(|series| series.lock().candles.len())
            .unwrap_or(0)
    }

    pub fn last_candle(&self, key: &SeriesKey) -> Option<Candle> {
        self.existing_slot(key)
            .and_then(|series| series.lock().candles.back().cloned())
    }

    pub fn oldest_open_time(&self, key: &SeriesKey) -> Option<i64> {
        self.existing_slot(key)
            .and_then(|series| series.lock().candles.front().map(|candle| candle.open_time))
    }

    fn existing_slot(&self, key: &SeriesKey) -> Option<Arc<Mutex<CandleSeries>>> {
        self.series.read().get(key).cloned()
    }

    fn series_slot(&self, key: &SeriesKey) -> Arc<Mutex<CandleSeries>> {
        if let Some(existing) = self.existing_slot(key) {
            return existing;
        }
        let mut writable = self.series.write();
        Arc::clone(writable.entry(key.clone()).or_default())
    }
}
