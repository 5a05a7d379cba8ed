// =============================================================================
// Persistence — base-series CSV files and the periodic snapshotter
// =============================================================================
//
// One file per instrument, one row per candle:
//
//   start_t,end_t,open,high,low,close,volume,n_trades
//
// ordered by `start_t` ascending. Files are replaced atomically (write to a
// `.tmp` sibling, fsync, rename) so a crash mid-write leaves the previous
// snapshot intact. Loading re-validates ordering, uniqueness and every
// record's OHLC invariants; a bad file is reported, never repaired.
// =============================================================================

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures_util::FutureExt;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{SeriesError, SeriesResult};
use crate::market_data::series::SharedSeries;
use crate::types::Candle;

/// Path of the persisted base series for `symbol` under `data_dir`.
pub fn series_path(data_dir: &Path, symbol: &str) -> PathBuf {
    data_dir.join(format!("{}.csv", symbol.to_uppercase()))
}

/// Read and validate a persisted series.
pub fn read_series(path: &Path) -> SeriesResult<Vec<Candle>> {
    if !path.exists() {
        return Err(SeriesError::NotFound {
            path: path.to_path_buf(),
        });
    }

    let corrupt = |reason: String| SeriesError::CorruptStore {
        path: path.to_path_buf(),
        reason,
    };

    let mut reader = csv::Reader::from_path(path)?;
    let mut candles: Vec<Candle> = Vec::new();

    for (row, record) in reader.deserialize::<Candle>().enumerate() {
        let candle = record.map_err(|e| corrupt(format!("row {}: {e}", row + 1)))?;
        candle
            .validate()
            .map_err(|reason| corrupt(format!("row {}: {reason}", row + 1)))?;
        if let Some(prev) = candles.last() {
            if candle.start_t == prev.start_t {
                return Err(corrupt(format!(
                    "row {}: duplicate start_t {}",
                    row + 1,
                    candle.start_t
                )));
            }
            if candle.start_t < prev.start_t {
                return Err(corrupt(format!(
                    "row {}: start_t {} precedes {}",
                    row + 1,
                    candle.start_t,
                    prev.start_t
                )));
            }
        }
        candles.push(candle);
    }

    Ok(candles)
}

/// Write `candles` to `path`, replacing any previous file atomically.
pub fn write_series_atomic(path: &Path, candles: &[Candle]) -> SeriesResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let tmp_path = path.with_extension("csv.tmp");
    {
        let file = File::create(&tmp_path)?;
        let mut writer = csv::Writer::from_writer(BufWriter::new(file));
        for candle in candles {
            writer.serialize(candle)?;
        }
        let mut inner = writer
            .into_inner()
            .map_err(|e| SeriesError::Io(e.into_error()))?;
        inner.flush()?;
        inner.get_ref().sync_all()?;
    }
    fs::rename(&tmp_path, path)?;

    debug!(path = %path.display(), records = candles.len(), "series written (atomic)");
    Ok(())
}

// =============================================================================
// Snapshotter
// =============================================================================

/// Periodically persists an instrument's base series.
///
/// The copy is taken under the series read lock (consistent, never torn);
/// the file write runs on a blocking task so the pipeline writer keeps
/// going. At most one write is in flight per instrument.
pub struct Snapshotter {
    series: Arc<SharedSeries>,
    path: PathBuf,
    every: u64,
    pending_updates: u64,
    in_flight: Option<JoinHandle<SeriesResult<()>>>,
}

impl Snapshotter {
    /// `every` is the number of applied updates between snapshots; `0`
    /// disables the cadence (shutdown snapshots still happen).
    pub fn new(series: Arc<SharedSeries>, path: PathBuf, every: u64) -> Self {
        Self {
            series,
            path,
            every,
            pending_updates: 0,
            in_flight: None,
        }
    }

    /// Count one applied update; starts a background snapshot when the
    /// cadence is reached.
    pub fn record_update(&mut self) {
        self.pending_updates += 1;
        if self.every > 0 && self.pending_updates >= self.every {
            self.spawn_snapshot();
        }
    }

    /// Take a consistent copy now and write it on a blocking task. Skipped
    /// (and retried at the next cadence) while a previous write is running.
    pub fn spawn_snapshot(&mut self) {
        if let Some(handle) = &self.in_flight {
            if !handle.is_finished() {
                debug!(path = %self.path.display(), "snapshot still in flight -- skipping");
                return;
            }
        }
        self.reap_finished();

        let copy = self.series.snapshot();
        let path = self.path.clone();
        self.pending_updates = 0;
        self.in_flight = Some(tokio::task::spawn_blocking(move || {
            write_series_atomic(&path, copy.candles())
        }));
    }

    /// Wait for any in-flight write, then write one final snapshot.
    pub async fn finish(&mut self) -> SeriesResult<()> {
        if let Some(handle) = self.in_flight.take() {
            match handle.await {
                Ok(Err(e)) => warn!(path = %self.path.display(), error = %e, "background snapshot failed"),
                Err(e) => warn!(path = %self.path.display(), error = %e, "background snapshot task panicked"),
                Ok(Ok(())) => {}
            }
        }
        let path = self.path.clone();
        let copy = self.series.snapshot();
        let records = copy.len();
        tokio::task::spawn_blocking(move || write_series_atomic(&path, copy.candles()))
            .await
            .map_err(|e| SeriesError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))??;
        self.pending_updates = 0;
        info!(path = %self.path.display(), records, "final snapshot written");
        Ok(())
    }

    fn reap_finished(&mut self) {
        if let Some(handle) = self.in_flight.take() {
            match handle.now_or_never() {
                Some(Ok(Err(e))) => {
                    error!(path = %self.path.display(), error = %e, "background snapshot failed")
                }
                Some(Err(e)) => {
                    error!(path = %self.path.display(), error = %e, "background snapshot task panicked")
                }
                _ => {}
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::series::Series;
    use crate::types::Resolution;

    fn candle(start_t: i64, close: f64) -> Candle {
        Candle {
            start_t,
            end_t: start_t + 59_999,
            open: 1.5,
            high: close.max(1.5) + 0.25,
            low: close.min(1.5) - 0.25,
            close,
            volume: 12.75,
            n_trades: 3,
        }
    }

    fn write_raw(path: &Path, body: &str) {
        fs::write(path, body).unwrap();
    }

    #[test]
    fn round_trip_preserves_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = series_path(dir.path(), "ethbtc");
        let candles: Vec<Candle> = (0..20).map(|i| candle(i * 60_000, 1.0 + i as f64 / 7.0)).collect();

        write_series_atomic(&path, &candles).unwrap();
        assert_eq!(read_series(&path).unwrap(), candles);
        assert!(path.ends_with("ETHBTC.csv"));
        assert!(!path.with_extension("csv.tmp").exists());
    }

    #[test]
    fn missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = read_series(&dir.path().join("NOPE.csv")).unwrap_err();
        assert!(matches!(err, SeriesError::NotFound { .. }));
    }

    #[test]
    fn duplicate_start_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("DUP.csv");
        write_raw(
            &path,
            "start_t,end_t,open,high,low,close,volume,n_trades\n\
             0,59999,10,12,9,11,100,5\n\
             0,59999,10,12,9,11,100,5\n",
        );
        let err = read_series(&path).unwrap_err();
        assert!(matches!(err, SeriesError::CorruptStore { .. }));
    }

    #[test]
    fn non_monotonic_start_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("BACK.csv");
        write_raw(
            &path,
            "start_t,end_t,open,high,low,close,volume,n_trades\n\
             60000,119999,10,12,9,11,100,5\n\
             0,59999,10,12,9,11,100,5\n",
        );
        assert!(matches!(
            read_series(&path),
            Err(SeriesError::CorruptStore { .. })
        ));
    }

    #[test]
    fn malformed_row_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("BAD.csv");
        write_raw(
            &path,
            "start_t,end_t,open,high,low,close,volume,n_trades\n\
             0,59999,ten,12,9,11,100,5\n",
        );
        assert!(matches!(
            read_series(&path),
            Err(SeriesError::CorruptStore { .. })
        ));
    }

    #[tokio::test]
    async fn snapshotter_follows_cadence_and_finishes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ETHBTC.csv");
        let res: Resolution = "1m".parse().unwrap();
        let shared = Arc::new(SharedSeries::new(Series::from_parts(
            res,
            vec![candle(0, 1.0)],
            true,
        )));
        let mut snap = Snapshotter::new(Arc::clone(&shared), path.clone(), 2);

        snap.record_update();
        assert!(!path.exists());
        snap.record_update();

        shared.write(|s| s.push(candle(60_000, 2.0), true));
        snap.finish().await.unwrap();

        let on_disk = read_series(&path).unwrap();
        assert_eq!(on_disk.len(), 2);
    }
}
