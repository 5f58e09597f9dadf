//! Paged loading of older candles into the live store.
//!
//! At most one fetch per series is in flight. An empty page marks the series
//! exhausted so later calls return without touching the network.

use crate::error::SyncError;
use crate::market::providers::CandleHistoryProvider;
use crate::market::store::LiveStore;
use crate::market::types::{Candle, SeriesKey};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy)]
struct BackfillFlags {
    in_flight: bool,
    exhausted: bool,
    epoch: u64,
}

#[derive(Debug, Default)]
struct FlagTable {
    entries: HashMap<SeriesKey, BackfillFlags>,
    next_epoch: u64,
}

/// Clears the in-flight flag when the fetch finishes or its future is dropped.
struct InFlightGuard<'a> {
    table: &'a Mutex<FlagTable>,
    key: &'a SeriesKey,
    epoch: u64,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let mut table = self.table.lock();
        if let Some(flags) = table.entries.get_mut(self.key) {
            if flags.epoch == self.epoch {
                flags.in_flight = false;
            }
        }
    }
}

pub struct BackfillCoordinator {
    store: Arc<LiveStore>,
    provider: Arc<dyn CandleHistoryProvider>,
    flags: Mutex<FlagTable>,
    page_limit: u16,
}

impl BackfillCoordinator {
    pub fn new(
        store: Arc<LiveStore>,
        provider: Arc<dyn CandleHistoryProvider>,
        page_limit: u16,
    ) -> Self {
        Self {
            store,
            provider,
            flags: Mutex::new(FlagTable::default()),
            page_limit: page_limit.max(1),
        }
    }

    /// Loads one page of candles strictly older than `before_time` and merges
    /// it into the series. Returns the inserted candles that survived trimming.
    ///
    /// Returns an empty vec without a request when a fetch for the same series
    /// is already running or earlier history is known to be exhausted. On
    /// error the series is left as it was.
    pub async fn fetch_older(
        &self,
        key: &SeriesKey,
        before_time: i64,
    ) -> Result<Vec<Candle>, SyncError> {
        let Some(epoch) = self.begin(key) else {
            debug!(series = %key, "history fetch skipped");
            return Ok(Vec::new());
        };
        let _guard = InFlightGuard {
            table: &self.flags,
            key,
            epoch,
        };

        let page = match self
            .provider
            .older_candles(key, before_time, self.page_limit)
            .await
        {
            Ok(page) => page,
            Err(error) => {
                warn!(series = %key, before_time, "history fetch failed: {error}");
                return Err(SyncError::Backfill {
                    key: key.clone(),
                    source: Box::new(error),
                });
            }
        };

        if !self.is_current(key, epoch) {
            debug!(series = %key, "history page discarded after series reset");
            return Ok(Vec::new());
        }

        if page.is_empty() {
            self.mark_exhausted(key, epoch);
            info!(series = %key, before_time, "history exhausted");
            return Ok(Vec::new());
        }

        let fetched = page.len();
        let inserted = self.store.merge_older(key, page);
        debug!(
            series = %key,
            fetched,
            inserted = inserted.len(),
            len = self.store.series_len(key),
            "history page merged"
        );
        Ok(inserted)
    }

    pub fn is_exhausted(&self, key: &SeriesKey) -> bool {
        self.flags
            .lock()
            .entries
            .get(key)
            .map(|flags| flags.exhausted)
            .unwrap_or(false)
    }

    pub fn is_in_flight(&self, key: &SeriesKey) -> bool {
        self.flags
            .lock()
            .entries
            .get(key)
            .map(|flags| flags.in_flight)
            .unwrap_or(false)
    }

    /// Forgets the flags of a series. A fetch still running for it finishes
    /// without touching the store.
    pub fn reset(&self, key: &SeriesKey) {
        self.flags.lock().entries.remove(key);
    }

    fn begin(&self, key: &SeriesKey) -> Option<u64> {
        let mut table = self.flags.lock();
        if let Some(flags) = table.entries.get_mut(key) {
            if flags.in_flight || flags.exhausted {
                return None;
            }
            flags.in_flight = true;
            return Some(flags.epoch);
        }
        table.next_epoch += 1;
        let epoch = table.next_epoch;
        table.entries.insert(
            key.clone(),
            BackfillFlags {
                in_flight: true,
                exhausted: false,
                epoch,
            },
        );
        Some(epoch)
    }

    fn is_current(&self, key: &SeriesKey, epoch: u64) -> bool {
        self.flags
            .lock()
            .entries
            .get(key)
            .map(|flags| flags.epoch == epoch)
            .unwrap_or(false)
    }

    fn mark_exhausted(&self, key: &SeriesKey, epoch: u64) {
        if let Some(flags) = self.flags.lock().entries.get_mut(key) {
            if flags.epoch == epoch {
                flags.exhausted = true;
            }
        }
    }
}
