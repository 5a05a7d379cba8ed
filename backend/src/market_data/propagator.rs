// =============================================================================
// Propagator — keeps every derived resolution in step with the base tail
// =============================================================================
//
// After each base mutation, every derived series re-derives only the
// bucket(s) at its tail: the base window starts at the boundary of the
// derived series' last bucket (at least `ratio + 1` base candles), the
// resampler recomputes those buckets and they are spliced in place:
//
//   returned bucket == derived last bucket  -> replace
//   returned bucket  > derived last bucket  -> append (previous one closes)
//
// Work per tick is O(resolutions), independent of history length. A full
// rebuild happens only at construction or when the splice finds the derived
// series inconsistent with the base.
// =============================================================================

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::market_data::base_store::BaseSeriesStore;
use crate::market_data::resampler::{resample_full, resample_tail, TailUpdate};
use crate::market_data::series::{Series, SharedSeries};
use crate::types::Resolution;

struct DerivedEntry {
    ratio: usize,
    series: Arc<SharedSeries>,
}

/// Owner of an instrument's derived series.
pub struct Propagator {
    symbol: String,
    derived: BTreeMap<Resolution, DerivedEntry>,
}

impl Propagator {
    /// Build every derived series with one full resampling pass.
    ///
    /// Resolutions that are not an integer multiple (> 1) of the base
    /// resolution are skipped with a warning.
    pub fn new(symbol: impl Into<String>, base: &BaseSeriesStore, resolutions: &[Resolution]) -> Self {
        let symbol = symbol.into();
        let base_res = base.resolution();
        let snapshot = base.snapshot();

        let mut derived = BTreeMap::new();
        for &r in resolutions {
            let ratio = match r.ratio_to(base_res) {
                Some(ratio) if ratio > 1 => ratio as usize,
                _ => {
                    warn!(symbol = %symbol, interval = %r, base = %base_res, "resolution is not a multiple of the base -- not tracked");
                    continue;
                }
            };
            let series = resample_full(&snapshot, r);
            debug!(symbol = %symbol, interval = %r, candles = series.len(), "derived series built");
            derived.insert(
                r,
                DerivedEntry {
                    ratio,
                    series: Arc::new(SharedSeries::new(series)),
                },
            );
        }

        Self { symbol, derived }
    }

    pub fn resolutions(&self) -> Vec<Resolution> {
        self.derived.keys().copied().collect()
    }

    /// Read handle to a derived series.
    pub fn series(&self, resolution: Resolution) -> Option<Arc<SharedSeries>> {
        self.derived.get(&resolution).map(|e| Arc::clone(&e.series))
    }

    /// Re-derive the tail bucket(s) of every derived series. Returns the
    /// number of buckets replaced or appended across all resolutions.
    pub fn on_base_tail_changed(&self, base: &BaseSeriesStore) -> usize {
        let mut touched = 0;
        for (&r, entry) in &self.derived {
            let from = entry
                .series
                .last()
                .map(|c| r.align(c.start_t))
                .unwrap_or(i64::MIN);
            let (window, tail_open) = base.window(from, entry.ratio + 1);
            let update = entry
                .series
                .read(|previous| resample_tail(&window, tail_open, r, previous));

            match entry.series.write(|s| splice(s, &update)) {
                Ok(n) => touched += n,
                Err(reason) => {
                    warn!(symbol = %self.symbol, interval = %r, reason = %reason, "derived tail inconsistent with base -- rebuilding");
                    self.rebuild(base, r);
                    continue;
                }
            }

            let (base_last, derived_last) = (base.last(), entry.series.last());
            if let (Some(b), Some(d)) = (base_last, derived_last) {
                if r.align(b.start_t) != r.align(d.start_t) {
                    warn!(symbol = %self.symbol, interval = %r, "derived tail lags the base -- rebuilding");
                    self.rebuild(base, r);
                }
            }
        }
        touched
    }

    /// Full recomputation of one derived resolution.
    pub fn rebuild(&self, base: &BaseSeriesStore, resolution: Resolution) {
        if let Some(entry) = self.derived.get(&resolution) {
            let series = resample_full(&base.snapshot(), resolution);
            debug!(symbol = %self.symbol, interval = %resolution, candles = series.len(), "derived series rebuilt");
            entry.series.replace(series);
        }
    }
}

/// Splice recomputed buckets onto the end of `series`.
fn splice(series: &mut Series, update: &TailUpdate) -> Result<usize, String> {
    let r = series.resolution();
    for bucket in &update.candles {
        let key = r.align(bucket.start_t);
        match series.last().map(|c| r.align(c.start_t)) {
            Some(last) if last == key => {
                if let Some(slot) = series.last_mut() {
                    *slot = *bucket;
                }
            }
            Some(last) if last > key => {
                return Err(format!("bucket {key} precedes derived tail {last}"));
            }
            _ => series.push(*bucket, true),
        }
    }
    if !update.candles.is_empty() {
        series.set_tail_open(update.tail_open);
    }
    Ok(update.candles.len())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Candle;

    fn res(s: &str) -> Resolution {
        s.parse().unwrap()
    }

    fn tracked() -> Vec<Resolution> {
        ["3m", "5m", "15m", "1h"].iter().map(|s| res(s)).collect()
    }

    /// Small deterministic generator so the mutation sequences are
    /// reproducible without pulling in an RNG crate.
    struct Lcg(u64);

    impl Lcg {
        fn next(&mut self) -> u64 {
            self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            self.0 >> 33
        }

        fn unit(&mut self) -> f64 {
            (self.next() % 10_000) as f64 / 10_000.0
        }
    }

    fn tick(start_t: i64, rng: &mut Lcg, open: f64) -> Candle {
        let close = open + rng.unit() - 0.5;
        Candle {
            start_t,
            end_t: start_t + 59_999,
            open,
            high: open.max(close) + rng.unit(),
            low: open.min(close) - rng.unit(),
            close,
            volume: rng.unit() * 100.0,
            n_trades: (rng.next() % 50) as i64,
        }
    }

    fn assert_in_sync(base: &BaseSeriesStore, p: &Propagator) {
        let snap = base.snapshot();
        for r in p.resolutions() {
            let expected = resample_full(&snap, r);
            let actual = p.series(r).unwrap().snapshot();
            assert_eq!(actual, expected, "interval {r} diverged");
        }
    }

    #[test]
    fn incremental_matches_full_after_every_mutation() {
        let mut rng = Lcg(7);
        let base = BaseSeriesStore::new(res("1m"));
        for i in 0..30 {
            base.append(tick(i * 60_000, &mut rng, 100.0)).unwrap();
        }
        base.close_tail().unwrap();

        let p = Propagator::new("ETHBTC", &base, &tracked());
        assert_in_sync(&base, &p);

        let mut start = 30 * 60_000;
        for step in 0..400 {
            match rng.next() % 4 {
                // refresh the open candle
                0 | 1 if base.is_tail_open() => {
                    let last = base.last().unwrap();
                    base.update_tail(&tick(last.start_t, &mut rng, last.open)).unwrap();
                }
                // close it
                2 if base.is_tail_open() => base.close_tail().unwrap(),
                // open the next candle, sometimes leaving a gap
                _ => {
                    if rng.next() % 10 == 0 {
                        start += 60_000 * (1 + (rng.next() % 20) as i64);
                    }
                    base.append(tick(start, &mut rng, 100.0)).unwrap();
                    start += 60_000;
                }
            }
            p.on_base_tail_changed(&base);
            if step % 7 == 0 {
                assert_in_sync(&base, &p);
            }
        }
        assert_in_sync(&base, &p);
    }

    #[test]
    fn works_from_an_empty_base() {
        let mut rng = Lcg(11);
        let base = BaseSeriesStore::new(res("1m"));
        let p = Propagator::new("ETHBTC", &base, &tracked());
        assert!(p.series(res("5m")).unwrap().is_empty());

        for i in 0..12 {
            base.append(tick(i * 60_000, &mut rng, 50.0)).unwrap();
            p.on_base_tail_changed(&base);
            assert_in_sync(&base, &p);
        }
    }

    #[test]
    fn crossing_a_boundary_appends_and_closes_previous_bucket() {
        let mut rng = Lcg(3);
        let base = BaseSeriesStore::new(res("1m"));
        for i in 0..3 {
            base.append(tick(i * 60_000, &mut rng, 10.0)).unwrap();
        }
        base.close_tail().unwrap();
        let p = Propagator::new("ETHBTC", &base, &[res("3m")]);
        let derived = p.series(res("3m")).unwrap();
        assert_eq!(derived.len(), 1);
        assert!(!derived.is_tail_open());

        base.append(tick(180_000, &mut rng, 10.0)).unwrap();
        assert_eq!(p.on_base_tail_changed(&base), 2);
        assert_eq!(derived.len(), 2);
        assert!(derived.is_tail_open());
    }

    #[test]
    fn non_multiple_resolutions_are_not_tracked() {
        let base = BaseSeriesStore::new(res("3m"));
        let p = Propagator::new("ETHBTC", &base, &[res("5m"), res("3m"), res("15m")]);
        assert_eq!(p.resolutions(), vec![res("15m")]);
    }

    #[test]
    fn inconsistent_derived_tail_is_rebuilt() {
        let mut rng = Lcg(5);
        let base = BaseSeriesStore::new(res("1m"));
        for i in 0..10 {
            base.append(tick(i * 60_000, &mut rng, 10.0)).unwrap();
        }
        let p = Propagator::new("ETHBTC", &base, &[res("5m")]);

        // Corrupt the derived series: drop everything but a future bucket.
        let derived = p.series(res("5m")).unwrap();
        derived.replace(Series::from_parts(
            res("5m"),
            vec![tick(3_000_000, &mut rng, 10.0)],
            true,
        ));

        p.on_base_tail_changed(&base);
        assert_in_sync(&base, &p);
    }
}
