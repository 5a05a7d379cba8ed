// =============================================================================
// Instrument Pipeline — one single-writer task per tracked instrument
// =============================================================================
//
// `InstrumentContext` owns everything mutable about one instrument: the base
// store, the stream updater, the propagator, the snapshotter, the backfill
// and the indicator set. It lives inside its pipeline task and is never
// shared, so the base and derived series have exactly one writer.
//
// `InstrumentHandle` is the read-only face handed to consumers (read API,
// indicator readers). Every read goes through the series' read locks and
// sees each propagation as a whole.
//
// Loop (`tokio::select!`, biased in this order):
//   1. shutdown signal   -> stop taking updates, final snapshot
//   2. queued update     -> StreamUpdater -> Propagator -> indicators
//   3. fetched gap pages -> Backfill::apply_page -> Propagator
//   4. gap-fill timer    -> spawn a fetch task
//
// Gap fills fetch on their own task and send the pages back, so a slow or
// retrying exchange never stalls live updates. Only the pipeline task
// applies pages to the store.
// =============================================================================

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::backfill::{now_ms, Backfill, HistoricalFetcher};
use crate::error::{SeriesError, SeriesResult};
use crate::indicators::{IndicatorReading, IndicatorSet};
use crate::market_data::base_store::BaseSeriesStore;
use crate::market_data::persistence::{series_path, Snapshotter};
use crate::market_data::propagator::Propagator;
use crate::market_data::series::{Series, SharedSeries};
use crate::market_data::stream_updater::{DiscardReason, StreamUpdater, UpdateOutcome};
use crate::runtime_config::TrackerConfig;
use crate::types::{Candle, KlineUpdate, Resolution};

/// Minimum spacing between gap fills requested by skipped-bucket discards.
const GAP_FILL_COOLDOWN: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// InstrumentHandle
// ---------------------------------------------------------------------------

/// Shared read access to one instrument's series and indicator readings.
pub struct InstrumentHandle {
    symbol: String,
    base_resolution: Resolution,
    series: BTreeMap<Resolution, Arc<SharedSeries>>,
    readings: RwLock<BTreeMap<Resolution, IndicatorReading>>,
    applied_updates: AtomicU64,
    discarded_updates: AtomicU64,
}

/// Per-instrument summary for the read API.
#[derive(Debug, Clone, Serialize)]
pub struct InstrumentSummary {
    pub symbol: String,
    pub base_interval: Resolution,
    pub base_len: usize,
    pub tail_open: bool,
    pub last_start_t: Option<i64>,
    pub intervals: Vec<Resolution>,
    pub applied_updates: u64,
    pub discarded_updates: u64,
}

impl InstrumentHandle {
    pub(crate) fn new(symbol: &str, base: &BaseSeriesStore, propagator: &Propagator) -> Self {
        let mut series = BTreeMap::new();
        series.insert(base.resolution(), base.shared());
        for r in propagator.resolutions() {
            if let Some(s) = propagator.series(r) {
                series.insert(r, s);
            }
        }
        Self {
            symbol: symbol.to_string(),
            base_resolution: base.resolution(),
            series,
            readings: RwLock::new(BTreeMap::new()),
            applied_updates: AtomicU64::new(0),
            discarded_updates: AtomicU64::new(0),
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn base_resolution(&self) -> Resolution {
        self.base_resolution
    }

    /// Base resolution plus every tracked derived resolution, ascending.
    pub fn resolutions(&self) -> Vec<Resolution> {
        self.series.keys().copied().collect()
    }

    /// Full series so far.
    pub fn series(&self, resolution: Resolution) -> Option<Series> {
        self.series.get(&resolution).map(|s| s.snapshot())
    }

    /// Most recent `n` candles.
    pub fn tail(&self, resolution: Resolution, n: usize) -> Option<Vec<Candle>> {
        self.series.get(&resolution).map(|s| s.tail(n))
    }

    /// Latest indicator readings, one per resolution.
    pub fn indicators(&self) -> Vec<IndicatorReading> {
        self.readings.read().values().cloned().collect()
    }

    pub fn indicator(&self, resolution: Resolution) -> Option<IndicatorReading> {
        self.readings.read().get(&resolution).cloned()
    }

    pub fn summary(&self) -> InstrumentSummary {
        let (base_len, tail_open, last_start_t) = self
            .series
            .get(&self.base_resolution)
            .map(|s| s.read(|s| (s.len(), s.is_tail_open(), s.last().map(|c| c.start_t))))
            .unwrap_or((0, false, None));
        InstrumentSummary {
            symbol: self.symbol.clone(),
            base_interval: self.base_resolution,
            base_len,
            tail_open,
            last_start_t,
            intervals: self.resolutions(),
            applied_updates: self.applied_updates.load(Ordering::Relaxed),
            discarded_updates: self.discarded_updates.load(Ordering::Relaxed),
        }
    }

    fn publish(&self, reading: IndicatorReading) {
        self.readings.write().insert(reading.interval, reading);
    }
}

// ---------------------------------------------------------------------------
// InstrumentContext
// ---------------------------------------------------------------------------

/// Pages fetched by a gap-fill task, plus how the fetch ended. Pages that
/// arrived before a failure are still applied.
pub struct FetchedGap {
    pages: Vec<Vec<Candle>>,
    result: SeriesResult<()>,
}

pub struct InstrumentContext {
    symbol: String,
    store: BaseSeriesStore,
    updater: StreamUpdater,
    propagator: Propagator,
    snapshotter: Snapshotter,
    backfill: Arc<Backfill>,
    indicators: IndicatorSet,
    indicator_window: usize,
    gap_fill_interval: Duration,
    last_gap_fill: Option<Instant>,
    gap_fill_in_flight: bool,
    gap_tx: mpsc::Sender<FetchedGap>,
    gap_rx: mpsc::Receiver<FetchedGap>,
    handle: Arc<InstrumentHandle>,
}

impl InstrumentContext {
    /// Load or backfill the base series, bring it up to date and derive
    /// every configured resolution.
    ///
    /// * persisted file present -> load it, then fill to present
    /// * no file                -> backfill `history_days`, then fill to present
    /// * corrupt file           -> `SeriesError::CorruptStore`, nothing tracked
    /// * fetch retries exhausted -> `SeriesError::Fetch`
    pub async fn bootstrap(
        symbol: &str,
        config: &TrackerConfig,
        fetcher: Arc<dyn HistoricalFetcher>,
        indicators: IndicatorSet,
    ) -> SeriesResult<Self> {
        let base = config.base_interval;
        let path = series_path(&config.data_dir, symbol);
        let backfill = Backfill::new(
            fetcher,
            symbol,
            base,
            config.page_limit,
            config.fetch_max_attempts,
            config.fetch_backoff(),
        );

        let (store, cold_start) = match BaseSeriesStore::load_from(&path, base) {
            Ok(store) => {
                info!(symbol, records = store.len(), path = %path.display(), "base series restored");
                (store, false)
            }
            Err(SeriesError::NotFound { .. }) => {
                let now = chrono::Utc::now().timestamp_millis();
                info!(symbol, days = config.history_days, "no stored history -- backfilling");
                let store = BaseSeriesStore::new(base);
                backfill.fill(&store, config.history_start(now), now).await?;
                (store, true)
            }
            Err(e) => return Err(e),
        };

        backfill.fill_to_present(&store).await?;

        let propagator = Propagator::new(symbol, &store, &config.derived_intervals);
        let mut snapshotter = Snapshotter::new(store.shared(), path, config.snapshot_every_updates);
        if cold_start {
            snapshotter.spawn_snapshot();
        }
        let handle = Arc::new(InstrumentHandle::new(symbol, &store, &propagator));
        let (gap_tx, gap_rx) = mpsc::channel(1);

        let ctx = Self {
            symbol: symbol.to_string(),
            updater: StreamUpdater::new(symbol, base),
            store,
            propagator,
            snapshotter,
            backfill: Arc::new(backfill),
            indicators,
            indicator_window: config.indicator_window,
            gap_fill_interval: config.gap_fill_interval(),
            last_gap_fill: None,
            gap_fill_in_flight: false,
            gap_tx,
            gap_rx,
            handle,
        };
        ctx.refresh_indicators();

        info!(
            symbol,
            base_len = ctx.store.len(),
            intervals = ?ctx.handle.resolutions().iter().map(|r| r.to_string()).collect::<Vec<_>>(),
            "instrument ready"
        );
        Ok(ctx)
    }

    pub fn handle(&self) -> Arc<InstrumentHandle> {
        Arc::clone(&self.handle)
    }

    /// Drive the pipeline until shutdown is signalled or the update queue
    /// closes, then write the final snapshot.
    pub async fn run(
        mut self,
        mut updates: mpsc::Receiver<KlineUpdate>,
        mut shutdown: watch::Receiver<bool>,
    ) -> SeriesResult<()> {
        let mut gap_timer = tokio::time::interval(self.gap_fill_interval);
        gap_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; bootstrap just filled.
        gap_timer.tick().await;

        info!(symbol = %self.symbol, "pipeline started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                next = updates.recv() => match next {
                    Some(update) => {
                        self.on_update(update);
                    }
                    None => {
                        info!(symbol = %self.symbol, "update queue closed");
                        break;
                    }
                },
                Some(fetched) = self.gap_rx.recv() => self.on_gap_fill(fetched),
                _ = gap_timer.tick() => {
                    self.start_gap_fill();
                }
            }
        }

        info!(symbol = %self.symbol, "pipeline stopping -- writing final snapshot");
        self.snapshotter.finish().await
    }

    /// Apply one live update and everything downstream of it.
    pub fn on_update(&mut self, update: KlineUpdate) -> UpdateOutcome {
        let outcome = self.updater.apply(&self.store, &update);
        match outcome {
            UpdateOutcome::Discarded(reason) => {
                self.handle.discarded_updates.fetch_add(1, Ordering::Relaxed);
                if matches!(reason, DiscardReason::SkippedBuckets { .. }) {
                    self.request_gap_fill();
                }
            }
            _ => {
                self.handle.applied_updates.fetch_add(1, Ordering::Relaxed);
                self.after_base_change();
                self.snapshotter.record_update();
            }
        }
        outcome
    }

    fn request_gap_fill(&mut self) {
        let cooling = self
            .last_gap_fill
            .map_or(false, |t| t.elapsed() < GAP_FILL_COOLDOWN);
        if cooling {
            debug!(symbol = %self.symbol, "gap fill requested during cooldown -- deferred");
            return;
        }
        self.start_gap_fill();
    }

    /// Spawn a fetch of whatever the stream missed. At most one runs at a
    /// time; returns `false` when one is already in flight.
    pub fn start_gap_fill(&mut self) -> bool {
        if self.gap_fill_in_flight {
            debug!(symbol = %self.symbol, "gap fill already in flight");
            return false;
        }
        self.gap_fill_in_flight = true;
        self.last_gap_fill = Some(Instant::now());

        let (from, to) = self.backfill.present_window(self.store.last().map(|c| c.start_t));
        let backfill = Arc::clone(&self.backfill);
        let tx = self.gap_tx.clone();
        let symbol = self.symbol.clone();
        tokio::spawn(async move {
            let mut pages = Vec::new();
            let result = backfill
                .fetch_range(from, to, |page| pages.push(page.to_vec()))
                .await
                .map(|_| ());
            if tx.send(FetchedGap { pages, result }).await.is_err() {
                debug!(symbol = %symbol, "pipeline stopped -- fetched gap dropped");
            }
        });
        true
    }

    /// Merge a finished gap fetch into the base store. Failures are logged;
    /// the timer retries.
    pub fn on_gap_fill(&mut self, fetched: FetchedGap) {
        self.gap_fill_in_flight = false;

        let now = now_ms();
        let mut changed = false;
        let mut appended = 0;
        for page in &fetched.pages {
            let outcome = self.backfill.apply_page(&self.store, page, now);
            changed |= outcome.changed();
            appended += outcome.appended;
        }
        if let Err(e) = fetched.result {
            error!(symbol = %self.symbol, error = %e, "gap fill failed -- will retry");
        }

        if changed {
            info!(symbol = %self.symbol, appended, tail_open = self.store.is_tail_open(), "gap filled");
            self.after_base_change();
            self.snapshotter.record_update();
        }
    }

    fn after_base_change(&self) {
        self.propagator.on_base_tail_changed(&self.store);
        self.refresh_indicators();
    }

    fn refresh_indicators(&self) {
        if self.indicators.is_empty() {
            return;
        }
        let window = self.indicator_window.max(self.indicators.lookback());
        for (&r, series) in &self.handle.series {
            let (candles, tail_open) = series.read(|s| (s.tail(window).to_vec(), s.is_tail_open()));
            match self.indicators.evaluate(r, &candles, tail_open) {
                Some(reading) => self.handle.publish(reading),
                None => debug!(symbol = %self.symbol, interval = %r, "no candles to evaluate indicators on"),
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
