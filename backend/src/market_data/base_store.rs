use std::path::Path;
use std::sync::Arc;

use tracing::debug;

use crate::error::{SeriesError, SeriesResult};
use crate::market_data::persistence;
use crate::market_data::series::{Series, SharedSeries};
use crate::types::{Candle, Resolution};

// ---------------------------------------------------------------------------
// BaseSeriesStore -- canonical finest-resolution series of one instrument
// ---------------------------------------------------------------------------

/// Single source of truth for an instrument's base-resolution candles.
///
/// Every record except the last is immutable. The last record may be *open*:
/// the live stream keeps refreshing it in place until it is closed, after
/// which only a strictly later `start_t` may be appended.
///
/// Mutations go through the pipeline writer only; reads (snapshots, tail
/// windows, the read API) can happen from anywhere through [`Self::shared`].
pub struct BaseSeriesStore {
    series: Arc<SharedSeries>,
}

impl BaseSeriesStore {
    pub fn new(resolution: Resolution) -> Self {
        Self::from_series(Series::new(resolution))
    }

    pub fn from_series(series: Series) -> Self {
        Self {
            series: Arc::new(SharedSeries::new(series)),
        }
    }

    pub fn resolution(&self) -> Resolution {
        self.series.resolution()
    }

    /// Read handle shared with consumers and the snapshotter.
    pub fn shared(&self) -> Arc<SharedSeries> {
        Arc::clone(&self.series)
    }

    /// Append a record, leaving it open.
    ///
    /// * `start_t` later than the tail: pushed (the previous tail, if still
    ///   open, becomes immutable).
    /// * `start_t` equal to an **open** tail: in-place update.
    /// * Anything else: [`SeriesError::OutOfOrder`].
    pub fn append(&self, candle: Candle) -> SeriesResult<()> {
        self.series.write(|s| {
            let tail = s.last().map(|c| c.start_t);
            match tail {
                Some(tail_start) if candle.start_t == tail_start && s.is_tail_open() => {
                    replace_mutable_fields(s, &candle);
                    Ok(())
                }
                Some(tail_start) if candle.start_t <= tail_start => Err(SeriesError::OutOfOrder {
                    start_t: candle.start_t,
                    tail_start_t: tail_start,
                }),
                _ => {
                    s.push(candle, true);
                    Ok(())
                }
            }
        })
    }

    /// Replace the open tail's mutable fields (`end_t`, `high`, `low`,
    /// `close`, `volume`, `n_trades`) with `candle`'s. `open` and `start_t`
    /// are kept.
    pub fn update_tail(&self, candle: &Candle) -> SeriesResult<()> {
        self.series.write(|s| {
            let tail = s.last().ok_or(SeriesError::NoOpenCandle)?;
            if candle.start_t != tail.start_t || !s.is_tail_open() {
                return Err(SeriesError::OutOfOrder {
                    start_t: candle.start_t,
                    tail_start_t: tail.start_t,
                });
            }
            replace_mutable_fields(s, candle);
            Ok(())
        })
    }

    /// Mark the tail immutable. No-op when it is already closed.
    pub fn close_tail(&self) -> SeriesResult<()> {
        self.series.write(|s| {
            if s.is_empty() {
                return Err(SeriesError::NoOpenCandle);
            }
            s.set_tail_open(false);
            Ok(())
        })
    }

    /// Last `n` records, oldest first.
    pub fn tail(&self, n: usize) -> Vec<Candle> {
        self.series.tail(n)
    }

    pub fn last(&self) -> Option<Candle> {
        self.series.last()
    }

    pub fn len(&self) -> usize {
        self.series.len()
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }

    pub fn is_tail_open(&self) -> bool {
        self.series.is_tail_open()
    }

    /// Whether a record with this `start_t` is stored.
    pub fn contains(&self, start_t: i64) -> bool {
        self.series.read(|s| {
            s.candles()
                .binary_search_by_key(&start_t, |c| c.start_t)
                .is_ok()
        })
    }

    /// Records with `start_t >= from`, extended backwards so that at least
    /// `min_len` records are returned when the store holds that many.
    pub fn window(&self, from: i64, min_len: usize) -> (Vec<Candle>, bool) {
        self.series.read(|s| {
            let since = s.since(from);
            let slice = if since.len() >= min_len {
                since
            } else {
                s.tail(min_len)
            };
            (slice.to_vec(), s.is_tail_open())
        })
    }

    /// Consistent point-in-time copy of the whole series.
    pub fn snapshot(&self) -> Series {
        self.series.snapshot()
    }

    /// Load a persisted series, replacing any in-memory state.
    ///
    /// The last record comes back provisionally open: it may have been
    /// captured mid-candle, so the next fetch at its `start_t` refreshes it.
    pub fn load_from(path: &Path, resolution: Resolution) -> SeriesResult<Self> {
        let candles = persistence::read_series(path)?;
        if let Some(c) = candles.iter().find(|c| !resolution.is_aligned(c.start_t)) {
            return Err(SeriesError::CorruptStore {
                path: path.to_path_buf(),
                reason: format!("start_t {} is not on the {resolution} grid", c.start_t),
            });
        }
        debug!(path = %path.display(), records = candles.len(), "base series loaded");
        Ok(Self::from_series(Series::from_parts(resolution, candles, true)))
    }

    /// Persist the full record set (atomic replace).
    pub fn save(&self, path: &Path) -> SeriesResult<()> {
        let snapshot = self.snapshot();
        persistence::write_series_atomic(path, snapshot.candles())
    }
}

fn replace_mutable_fields(series: &mut Series, candle: &Candle) {
    if let Some(last) = series.last_mut() {
        *last = Candle {
            start_t: last.start_t,
            open: last.open,
            ..*candle
        };
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Resolution {
        "1m".parse().unwrap()
    }

    fn candle(start_t: i64, close: f64) -> Candle {
        Candle {
            start_t,
            end_t: start_t + 59_999,
            open: 10.0,
            high: close.max(10.0) + 1.0,
            low: close.min(10.0) - 1.0,
            close,
            volume: 100.0,
            n_trades: 5,
        }
    }

    #[test]
    fn append_to_empty_store_leaves_one_open_record() {
        let store = BaseSeriesStore::new(base());
        let c = Candle {
            start_t: 0,
            end_t: 59_999,
            open: 10.0,
            high: 12.0,
            low: 9.0,
            close: 11.0,
            volume: 100.0,
            n_trades: 5,
        };
        store.append(c).unwrap();

        assert_eq!(store.len(), 1);
        assert!(store.is_tail_open());
        assert_eq!(store.last(), Some(c));
    }

    #[test]
    fn update_tail_replaces_mutable_fields_only() {
        let store = BaseSeriesStore::new(base());
        store.append(candle(0, 11.0)).unwrap();

        let update = Candle {
            start_t: 0,
            end_t: 59_999,
            open: 99.0,
            high: 13.0,
            low: 9.0,
            close: 11.5,
            volume: 150.0,
            n_trades: 7,
        };
        store.update_tail(&update).unwrap();

        let tail = store.last().unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(tail.start_t, 0);
        assert_eq!(tail.open, 10.0);
        assert_eq!(tail.high, 13.0);
        assert_eq!(tail.low, 9.0);
        assert_eq!(tail.close, 11.5);
        assert_eq!(tail.volume, 150.0);
        assert_eq!(tail.n_trades, 7);
    }

    #[test]
    fn update_and_close_on_empty_store_fail() {
        let store = BaseSeriesStore::new(base());
        assert!(matches!(
            store.update_tail(&candle(0, 1.0)),
            Err(SeriesError::NoOpenCandle)
        ));
        assert!(matches!(store.close_tail(), Err(SeriesError::NoOpenCandle)));
    }

    #[test]
    fn append_with_same_start_on_open_tail_updates_in_place() {
        let store = BaseSeriesStore::new(base());
        store.append(candle(0, 11.0)).unwrap();
        store.append(candle(0, 12.0)).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.last().unwrap().close, 12.0);
    }

    #[test]
    fn closed_tail_rejects_same_or_earlier_start() {
        let store = BaseSeriesStore::new(base());
        store.append(candle(0, 11.0)).unwrap();
        store.append(candle(60_000, 11.0)).unwrap();
        store.close_tail().unwrap();
        store.close_tail().unwrap(); // idempotent

        assert!(matches!(
            store.append(candle(60_000, 12.0)),
            Err(SeriesError::OutOfOrder { .. })
        ));
        assert!(matches!(
            store.append(candle(0, 12.0)),
            Err(SeriesError::OutOfOrder { .. })
        ));
        assert!(matches!(
            store.update_tail(&candle(60_000, 12.0)),
            Err(SeriesError::OutOfOrder { .. })
        ));
        store.append(candle(120_000, 12.0)).unwrap();
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn start_times_stay_strictly_increasing() {
        let store = BaseSeriesStore::new(base());
        let starts = [0, 60_000, 60_000, 30_000, 120_000, 120_000, 0, 240_000];
        for (i, s) in starts.iter().enumerate() {
            let _ = store.append(candle(*s, 10.0 + i as f64));
            if i % 3 == 2 {
                let _ = store.close_tail();
            }
        }
        let snap = store.snapshot();
        assert!(snap
            .candles()
            .windows(2)
            .all(|w| w[0].start_t < w[1].start_t));
    }

    #[test]
    fn window_extends_to_minimum_length() {
        let store = BaseSeriesStore::new(base());
        for i in 0..10 {
            store.append(candle(i * 60_000, 10.0)).unwrap();
        }
        let (w, open) = store.window(480_000, 0);
        assert_eq!(w.len(), 2);
        assert!(open);
        let (w, _) = store.window(480_000, 4);
        assert_eq!(w.len(), 4);
        assert_eq!(w[0].start_t, 360_000);
    }

    #[test]
    fn contains_finds_stored_starts() {
        let store = BaseSeriesStore::new(base());
        for i in [0, 2, 3] {
            store.append(candle(i * 60_000, 10.0)).unwrap();
        }
        assert!(store.contains(120_000));
        assert!(!store.contains(60_000));
    }

    #[test]
    fn tail_returns_last_records() {
        let store = BaseSeriesStore::new(base());
        for i in 0..5 {
            store.append(candle(i * 60_000, 10.0 + i as f64)).unwrap();
        }
        let closes: Vec<f64> = store.tail(3).iter().map(|c| c.close).collect();
        assert_eq!(closes, vec![12.0, 13.0, 14.0]);
        assert_eq!(store.len(), 5);
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ETHBTC.csv");
        let store = BaseSeriesStore::new(base());
        for i in 0..4 {
            store.append(candle(i * 60_000, 10.0 + i as f64 * 0.125)).unwrap();
        }
        store.save(&path).unwrap();

        let loaded = BaseSeriesStore::load_from(&path, base()).unwrap();
        assert_eq!(loaded.snapshot().candles(), store.snapshot().candles());
        assert!(loaded.is_tail_open());
    }

    #[test]
    fn load_rejects_records_off_the_base_grid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ETHBTC.csv");
        let store = BaseSeriesStore::new(base());
        store.append(candle(0, 10.0)).unwrap();
        store.append(candle(60_000, 10.0)).unwrap();
        store.save(&path).unwrap();

        let five: Resolution = "5m".parse().unwrap();
        assert!(matches!(
            BaseSeriesStore::load_from(&path, five),
            Err(SeriesError::CorruptStore { .. })
        ));
    }
}
