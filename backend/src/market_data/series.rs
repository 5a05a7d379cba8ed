// =============================================================================
// Series — ordered candles for one (instrument, resolution) pair
// =============================================================================
//
// `Series` is the plain value (what resampling consumes and produces);
// `SharedSeries` wraps it in a `parking_lot::RwLock` so the single pipeline
// writer and any number of readers (snapshotter, read API, indicators) can
// share it. Writers always swap whole records, so a reader never observes a
// half-applied candle.
// =============================================================================

use parking_lot::RwLock;

use crate::types::{Candle, Resolution};

/// Ordered, `start_t`-unique candles plus the open/closed state of the last
/// record. Only the last record can be open.
#[derive(Debug, Clone, PartialEq)]
pub struct Series {
    resolution: Resolution,
    candles: Vec<Candle>,
    tail_open: bool,
}

impl Series {
    pub fn new(resolution: Resolution) -> Self {
        Self {
            resolution,
            candles: Vec::new(),
            tail_open: false,
        }
    }

    /// Build a series from already ordered candles. `tail_open` is ignored
    /// for an empty vector.
    pub fn from_parts(resolution: Resolution, candles: Vec<Candle>, tail_open: bool) -> Self {
        let tail_open = tail_open && !candles.is_empty();
        Self {
            resolution,
            candles,
            tail_open,
        }
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    pub fn candles(&self) -> &[Candle] {
        &self.candles
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    pub fn last(&self) -> Option<&Candle> {
        self.candles.last()
    }

    pub fn is_tail_open(&self) -> bool {
        self.tail_open
    }

    /// The last `n` records (oldest first).
    pub fn tail(&self, n: usize) -> &[Candle] {
        let start = self.candles.len().saturating_sub(n);
        &self.candles[start..]
    }

    /// Every record whose `start_t` is `>= start_t`.
    pub fn since(&self, start_t: i64) -> &[Candle] {
        let idx = self.candles.partition_point(|c| c.start_t < start_t);
        &self.candles[idx..]
    }

    pub(crate) fn push(&mut self, candle: Candle, open: bool) {
        self.candles.push(candle);
        self.tail_open = open;
    }

    pub(crate) fn last_mut(&mut self) -> Option<&mut Candle> {
        self.candles.last_mut()
    }

    pub(crate) fn set_tail_open(&mut self, open: bool) {
        self.tail_open = open && !self.candles.is_empty();
    }
}

/// Lock-guarded [`Series`] shared between the pipeline writer and readers.
#[derive(Debug)]
pub struct SharedSeries {
    inner: RwLock<Series>,
}

impl SharedSeries {
    pub fn new(series: Series) -> Self {
        Self {
            inner: RwLock::new(series),
        }
    }

    pub fn resolution(&self) -> Resolution {
        self.inner.read().resolution()
    }

    /// Point-in-time copy of the whole series.
    pub fn snapshot(&self) -> Series {
        self.inner.read().clone()
    }

    /// Copy of every record ("series so far").
    pub fn candles(&self) -> Vec<Candle> {
        self.inner.read().candles().to_vec()
    }

    /// Copy of the most recent `n` records (oldest first).
    pub fn tail(&self, n: usize) -> Vec<Candle> {
        self.inner.read().tail(n).to_vec()
    }

    pub fn last(&self) -> Option<Candle> {
        self.inner.read().last().copied()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    pub fn is_tail_open(&self) -> bool {
        self.inner.read().is_tail_open()
    }

    /// Run `f` against the series under the read lock.
    pub fn read<R>(&self, f: impl FnOnce(&Series) -> R) -> R {
        f(&self.inner.read())
    }

    /// Run `f` against the series under the write lock.
    pub(crate) fn write<R>(&self, f: impl FnOnce(&mut Series) -> R) -> R {
        f(&mut self.inner.write())
    }

    pub(crate) fn replace(&self, series: Series) {
        *self.inner.write() = series;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(start_t: i64) -> Candle {
        Candle {
            start_t,
            end_t: start_t + 59_999,
            open: 1.0,
            high: 1.0,
            low: 1.0,
            close: 1.0,
            volume: 1.0,
            n_trades: 1,
        }
    }

    fn base() -> Resolution {
        "1m".parse().unwrap()
    }

    #[test]
    fn tail_and_since_views() {
        let candles: Vec<Candle> = (0..5).map(|i| candle(i * 60_000)).collect();
        let s = Series::from_parts(base(), candles, true);

        assert_eq!(s.tail(2).len(), 2);
        assert_eq!(s.tail(2)[0].start_t, 180_000);
        assert_eq!(s.tail(10).len(), 5);
        assert_eq!(s.since(120_000).len(), 3);
        assert_eq!(s.since(130_000).len(), 2);
        assert!(s.since(1_000_000).is_empty());
        assert!(s.is_tail_open());
    }

    #[test]
    fn empty_series_is_never_open() {
        let s = Series::from_parts(base(), Vec::new(), true);
        assert!(!s.is_tail_open());
    }

    #[test]
    fn shared_snapshot_is_detached() {
        let shared = SharedSeries::new(Series::from_parts(base(), vec![candle(0)], true));
        let snap = shared.snapshot();
        shared.write(|s| s.push(candle(60_000), true));
        assert_eq!(snap.len(), 1);
        assert_eq!(shared.len(), 2);
    }
}
