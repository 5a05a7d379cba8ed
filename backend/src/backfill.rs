// =============================================================================
// Backfill — historical pages into the base series
// =============================================================================
//
// Pages are requested from `from` forward. Each next page starts one base
// interval after the last returned candle. Paging stops when a page comes
// back short (history exhausted) or the window end is reached.
//
// A failing page is retried with exponential backoff up to the attempt cap,
// then surfaced as `SeriesError::Fetch`. Fetched candles already present in
// the store are dropped, so overlapping windows are harmless.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::error::{SeriesError, SeriesResult};
use crate::market_data::base_store::BaseSeriesStore;
use crate::types::{Candle, Resolution};

/// Pause inserted after every `PAGES_PER_PAUSE` pages.
const PAGES_PER_PAUSE: usize = 3;
const DEFAULT_PAGE_PAUSE: Duration = Duration::from_secs(1);

/// Source of historical candles (the exchange REST API in production).
#[async_trait]
pub trait HistoricalFetcher: Send + Sync {
    /// Up to `limit` candles with `start_ms <= start_t` (and `start_t <=
    /// end_ms` when given), ordered by `start_t`. Fewer than `limit` means
    /// the range is exhausted.
    async fn fetch(
        &self,
        symbol: &str,
        resolution: Resolution,
        start_ms: i64,
        end_ms: Option<i64>,
        limit: u32,
    ) -> anyhow::Result<Vec<Candle>>;
}

/// Result of applying one fetched page to the store.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PageOutcome {
    pub appended: usize,
    pub refreshed: usize,
    pub closed: usize,
    pub dropped: usize,
}

impl PageOutcome {
    /// Whether the page changed the base series, tail open flag included.
    pub fn changed(&self) -> bool {
        self.appended + self.refreshed + self.closed > 0
    }

    fn add(&mut self, other: PageOutcome) {
        self.appended += other.appended;
        self.refreshed += other.refreshed;
        self.closed += other.closed;
        self.dropped += other.dropped;
    }
}

pub struct Backfill {
    fetcher: Arc<dyn HistoricalFetcher>,
    symbol: String,
    resolution: Resolution,
    page_limit: u32,
    max_attempts: u32,
    backoff: Duration,
    page_pause: Duration,
}

impl Backfill {
    pub fn new(
        fetcher: Arc<dyn HistoricalFetcher>,
        symbol: impl Into<String>,
        resolution: Resolution,
        page_limit: u32,
        max_attempts: u32,
        backoff: Duration,
    ) -> Self {
        Self {
            fetcher,
            symbol: symbol.into(),
            resolution,
            page_limit: page_limit.max(1),
            max_attempts: max_attempts.max(1),
            backoff,
            page_pause: DEFAULT_PAGE_PAUSE,
        }
    }

    /// Override the courtesy pause between page groups.
    pub fn with_page_pause(mut self, pause: Duration) -> Self {
        self.page_pause = pause;
        self
    }

    /// Page through `[from, to]`, handing every page to `on_page` as it
    /// arrives. Never touches a store, so it can run off the writer task.
    /// Returns the number of pages fetched.
    pub async fn fetch_range(
        &self,
        from: i64,
        to: i64,
        mut on_page: impl FnMut(&[Candle]) + Send,
    ) -> SeriesResult<usize> {
        let step = self.resolution.millis();
        let mut start = self.resolution.align(from);
        let mut pages = 0usize;

        while start <= to {
            let page = self.fetch_page(start, to).await?;
            pages += 1;
            debug!(symbol = %self.symbol, page = pages, start, fetched = page.len(), "backfill page fetched");
            on_page(&page);

            if page.len() < self.page_limit as usize {
                break;
            }
            match page.last() {
                Some(last) => start = last.start_t + step,
                None => break,
            }
            if pages % PAGES_PER_PAUSE == 0 && !self.page_pause.is_zero() {
                tokio::time::sleep(self.page_pause).await;
            }
        }
        Ok(pages)
    }

    /// Fetch `[from, to]` into `store`. Returns the number of appended
    /// candles.
    pub async fn fill(&self, store: &BaseSeriesStore, from: i64, to: i64) -> SeriesResult<usize> {
        let mut total = PageOutcome::default();
        let pages = self
            .fetch_range(from, to, |page| total.add(self.apply_page(store, page, now_ms())))
            .await?;

        info!(
            symbol = %self.symbol,
            interval = %self.resolution,
            pages,
            appended = total.appended,
            refreshed = total.refreshed,
            closed = total.closed,
            dropped = total.dropped,
            "backfill complete"
        );
        Ok(total.appended)
    }

    /// Window that brings a series ending at `tail_start` up to now. The
    /// tail candle itself is re-requested so a provisional (open) tail gets
    /// confirmed. An empty series gets one page of recent history.
    pub fn present_window(&self, tail_start: Option<i64>) -> (i64, i64) {
        let now = now_ms();
        let from = match tail_start {
            Some(t) => t,
            None => now - self.resolution.millis() * i64::from(self.page_limit),
        };
        (from, now)
    }

    /// Fill from the stored tail up to now.
    pub async fn fill_to_present(&self, store: &BaseSeriesStore) -> SeriesResult<usize> {
        let (from, to) = self.present_window(store.last().map(|c| c.start_t));
        self.fill(store, from, to).await
    }

    async fn fetch_page(&self, start: i64, end: i64) -> SeriesResult<Vec<Candle>> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = self
                .fetcher
                .fetch(&self.symbol, self.resolution, start, Some(end), self.page_limit)
                .await;
            match result {
                Ok(page) => return Ok(page),
                Err(e) if attempt < self.max_attempts => {
                    let delay = self.backoff * 2u32.saturating_pow(attempt - 1);
                    warn!(
                        symbol = %self.symbol,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "historical fetch failed -- retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    return Err(SeriesError::Fetch {
                        symbol: self.symbol.clone(),
                        attempts: attempt,
                        reason: format!("{e:#}"),
                    })
                }
            }
        }
    }

    /// Merge one page into the store. Candles whose `end_t` is still in the
    /// future stay open; everything else is closed as it lands.
    pub(crate) fn apply_page(&self, store: &BaseSeriesStore, page: &[Candle], now: i64) -> PageOutcome {
        let mut outcome = PageOutcome::default();

        for candle in page {
            if let Err(reason) = candle.validate() {
                warn!(symbol = %self.symbol, start_t = candle.start_t, reason = %reason, "skipping invalid historical candle");
                outcome.dropped += 1;
                continue;
            }
            if !self.resolution.is_aligned(candle.start_t) {
                warn!(symbol = %self.symbol, start_t = candle.start_t, "skipping misaligned historical candle");
                outcome.dropped += 1;
                continue;
            }

            let result = match store.last() {
                Some(tail) if candle.start_t < tail.start_t => {
                    // Already-stored history is the normal overlap case.
                    if !store.contains(candle.start_t) {
                        warn!(
                            symbol = %self.symbol,
                            start_t = candle.start_t,
                            tail_start_t = tail.start_t,
                            "historical candle precedes stored tail -- dropped"
                        );
                    }
                    outcome.dropped += 1;
                    continue;
                }
                Some(tail) if candle.start_t == tail.start_t => {
                    if !store.is_tail_open() {
                        outcome.dropped += 1;
                        continue;
                    }
                    store.update_tail(candle).map(|_| outcome.refreshed += 1)
                }
                _ => store.append(*candle).map(|_| outcome.appended += 1),
            };
            if let Err(e) = result {
                warn!(symbol = %self.symbol, error = %e, "store rejected historical candle");
                outcome.dropped += 1;
                continue;
            }

            if candle.end_t < now && store.is_tail_open() {
                // The store is never empty here.
                if store.close_tail().is_ok() {
                    outcome.closed += 1;
                }
            }
        }

        outcome
    }
}

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// =============================================================================
// Tests
// =============================================================================
