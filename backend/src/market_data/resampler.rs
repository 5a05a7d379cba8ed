// =============================================================================
// Resampler — base-resolution candles to coarser buckets
// =============================================================================
//
// Buckets sit on the epoch-aligned grid of the target resolution. A bucket
// aggregates the base candles whose `start_t` falls inside it:
//
//   start  = first.start_t      end    = last.end_t
//   open   = first.open         close  = last.close
//   high   = max(high)          low    = min(low)
//   volume = sum(volume)        trades = sum(n_trades)
//
// Buckets without any base candle (exchange gaps) are not emitted.
//
// Both entry points are pure and share `bucketize`, so a bucket recomputed
// from a tail window is bit-identical to the same bucket from a full pass
// as long as the window holds every base candle of that bucket.
// =============================================================================

use crate::market_data::series::Series;
use crate::types::{Candle, Resolution};

/// Derived buckets recomputed from a base tail window, ready to be spliced
/// onto the end of the derived series.
#[derive(Debug, Clone, PartialEq)]
pub struct TailUpdate {
    pub candles: Vec<Candle>,
    /// Whether the last returned bucket still contains the open base candle.
    pub tail_open: bool,
}

/// Aggregate an ordered, non-empty run of base candles into one candle.
pub fn aggregate(candles: &[Candle]) -> Option<Candle> {
    let first = candles.first()?;
    let last = candles.last()?;

    let mut high = first.high;
    let mut low = first.low;
    let mut volume = 0.0;
    let mut n_trades = 0;
    for c in candles {
        high = high.max(c.high);
        low = low.min(c.low);
        volume += c.volume;
        n_trades += c.n_trades;
    }

    Some(Candle {
        start_t: first.start_t,
        end_t: last.end_t,
        open: first.open,
        high,
        low,
        close: last.close,
        volume,
        n_trades,
    })
}

/// Full pass: aggregate the whole base series into `resolution` buckets.
///
/// The trailing bucket is open iff the base series' trailing candle is.
pub fn resample_full(base: &Series, resolution: Resolution) -> Series {
    let candles = bucketize(base.candles(), resolution);
    Series::from_parts(resolution, candles, base.is_tail_open())
}

/// Tail pass: recompute only the buckets touched by `window`.
///
/// `window` must be ordered and must contain **every** base candle of the
/// bucket that `previous` currently ends with (the caller reads it from the
/// store starting at that bucket's boundary). Base candles from earlier
/// buckets are ignored. Normally at most two buckets come back: the
/// previous last bucket and, once the base stream crossed its boundary, the
/// next one.
pub fn resample_tail(
    window: &[Candle],
    window_tail_open: bool,
    resolution: Resolution,
    previous: &Series,
) -> TailUpdate {
    let from = previous
        .last()
        .map(|c| resolution.align(c.start_t))
        .unwrap_or(i64::MIN);
    let idx = window.partition_point(|c| resolution.align(c.start_t) < from);
    let candles = bucketize(&window[idx..], resolution);
    let tail_open = window_tail_open && !candles.is_empty();
    TailUpdate { candles, tail_open }
}

/// Split ordered base candles into consecutive runs sharing a bucket and
/// aggregate each run.
fn bucketize(candles: &[Candle], resolution: Resolution) -> Vec<Candle> {
    let mut out = Vec::new();
    let mut run_start = 0;
    for i in 1..=candles.len() {
        let boundary = i == candles.len()
            || resolution.align(candles[i].start_t) != resolution.align(candles[run_start].start_t);
        if boundary {
            if let Some(bucket) = aggregate(&candles[run_start..i]) {
                out.push(bucket);
            }
            run_start = i;
        }
    }
    out
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn res(s: &str) -> Resolution {
        s.parse().unwrap()
    }

    fn candle(start_t: i64, open: f64, high: f64, low: f64, close: f64, volume: f64, n: i64) -> Candle {
        Candle {
            start_t,
            end_t: start_t + 59_999,
            open,
            high,
            low,
            close,
            volume,
            n_trades: n,
        }
    }

    fn wave(n: i64) -> Vec<Candle> {
        (0..n)
            .map(|i| {
                let mid = 100.0 + (i as f64 * 0.7).sin() * 5.0;
                candle(i * 60_000, mid - 0.5, mid + 1.0 + (i % 3) as f64, mid - 1.5, mid + 0.25, 10.0 + i as f64 * 0.1, i % 7)
            })
            .collect()
    }

    /// Reference aggregation written independently of `bucketize`.
    fn reference(candles: &[Candle], r: Resolution) -> Vec<Candle> {
        let mut keys: Vec<i64> = candles.iter().map(|c| r.align(c.start_t)).collect();
        keys.dedup();
        keys.into_iter()
            .map(|k| {
                let members: Vec<&Candle> =
                    candles.iter().filter(|c| r.align(c.start_t) == k).collect();
                Candle {
                    start_t: members[0].start_t,
                    end_t: members[members.len() - 1].end_t,
                    open: members[0].open,
                    high: members.iter().map(|c| c.high).fold(f64::MIN, f64::max),
                    low: members.iter().map(|c| c.low).fold(f64::MAX, f64::min),
                    close: members[members.len() - 1].close,
                    volume: members.iter().fold(0.0, |acc, c| acc + c.volume),
                    n_trades: members.iter().map(|c| c.n_trades).sum(),
                }
            })
            .collect()
    }

    #[test]
    fn two_base_candles_into_one_double_bucket() {
        let base = Series::from_parts(
            res("1m"),
            vec![
                candle(0, 10.0, 12.0, 9.0, 11.0, 100.0, 5),
                candle(60_000, 11.0, 14.0, 10.0, 13.0, 50.0, 3),
            ],
            false,
        );
        let out = resample_full(&base, res("2m"));

        assert_eq!(out.len(), 1);
        assert_eq!(
            out.candles()[0],
            Candle {
                start_t: 0,
                end_t: 119_999,
                open: 10.0,
                high: 14.0,
                low: 9.0,
                close: 13.0,
                volume: 150.0,
                n_trades: 8,
            }
        );
        assert!(!out.is_tail_open());
    }

    #[test]
    fn full_resample_matches_reference_for_every_resolution() {
        let base = Series::from_parts(res("1m"), wave(500), true);
        for r in ["3m", "5m", "15m", "30m", "1h", "2h", "4h"] {
            let r = res(r);
            let out = resample_full(&base, r);
            assert_eq!(out.candles(), reference(base.candles(), r).as_slice(), "{r}");
            assert!(out.is_tail_open());
            assert!(out.candles().iter().all(|c| r.is_aligned(c.start_t)));
        }
    }

    #[test]
    fn resample_full_is_deterministic() {
        let base = Series::from_parts(res("1m"), wave(300), false);
        let a = resample_full(&base, res("15m"));
        let b = resample_full(&base, res("15m"));
        assert_eq!(a, b);
        for (x, y) in a.candles().iter().zip(b.candles()) {
            assert_eq!(x.volume.to_bits(), y.volume.to_bits());
        }
    }

    #[test]
    fn gaps_are_skipped_and_first_start_is_kept() {
        let candles = vec![
            candle(60_000, 1.0, 2.0, 0.5, 1.5, 1.0, 1),
            candle(120_000, 1.5, 2.5, 1.0, 2.0, 1.0, 1),
            // 5m bucket [300_000, 600_000) is empty
            candle(600_000, 2.0, 3.0, 1.5, 2.5, 1.0, 1),
        ];
        let base = Series::from_parts(res("1m"), candles, false);
        let out = resample_full(&base, res("5m"));
        assert_eq!(out.len(), 2);
        assert_eq!(out.candles()[0].start_t, 60_000);
        assert_eq!(out.candles()[0].end_t, 179_999);
        assert_eq!(out.candles()[1].start_t, 600_000);
    }

    #[test]
    fn tail_pass_equals_full_pass_on_touched_buckets() {
        let all = wave(47);
        let r = res("5m");
        let previous = resample_full(&Series::from_parts(res("1m"), all[..43].to_vec(), true), r);
        let from = r.align(previous.last().unwrap().start_t);

        // Window starts a little before the bucket boundary.
        let window: Vec<Candle> = all.iter().filter(|c| c.start_t >= from - 120_000).copied().collect();
        let tail = resample_tail(&window, true, r, &previous);

        let full = resample_full(&Series::from_parts(res("1m"), all.clone(), true), r);
        assert_eq!(tail.candles.len(), 2);
        assert_eq!(tail.candles.as_slice(), &full.candles()[full.len() - 2..]);
        assert!(tail.tail_open);
    }

    #[test]
    fn tail_pass_on_empty_previous_resamples_window() {
        let window = wave(7);
        let r = res("3m");
        let tail = resample_tail(&window, false, r, &Series::new(r));
        assert_eq!(tail.candles, reference(&window, r));
        assert!(!tail.tail_open);
    }
}
