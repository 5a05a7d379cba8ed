// =============================================================================
// Average True Range (ATR) — Wilder's Smoothing
// =============================================================================
//
//   TR    = max(H - L, |H - prevClose|, |L - prevClose|)
//   ATR_0 = SMA of the first `period` TR values
//   ATR_t = (ATR_{t-1} * (period - 1) + TR_t) / period
//
// Emits `atr_<period>`.
// =============================================================================

use std::collections::BTreeMap;

use crate::indicators::Indicator;
use crate::types::Candle;

/// Most recent ATR over `candles` (oldest first).
///
/// `None` when `period == 0`, fewer than `period + 1` candles are given, or
/// any high, low or close is non-finite.
pub fn calculate_atr(candles: &[Candle], period: usize) -> Option<f64> {
    if period == 0 || candles.len() < period + 1 {
        return None;
    }
    // f64::max drops NaN, so a bad bar would otherwise pass through silently.
    if candles
        .iter()
        .any(|c| !(c.high.is_finite() && c.low.is_finite() && c.close.is_finite()))
    {
        return None;
    }

    let true_ranges: Vec<f64> = candles
        .windows(2)
        .map(|w| {
            let (prev_close, c) = (w[0].close, &w[1]);
            (c.high - c.low)
                .max((c.high - prev_close).abs())
                .max((c.low - prev_close).abs())
        })
        .collect();

    let n = period as f64;
    let mut atr = true_ranges[..period].iter().sum::<f64>() / n;
    for &tr in &true_ranges[period..] {
        atr = (atr * (n - 1.0) + tr) / n;
    }
    atr.is_finite().then_some(atr)
}

pub struct Atr {
    periods: Vec<usize>,
}

impl Atr {
    pub fn new(periods: Vec<usize>) -> Self {
        Self { periods }
    }
}

impl Indicator for Atr {
    fn name(&self) -> &'static str {
        "atr"
    }

    fn compute(&self, candles: &[Candle]) -> BTreeMap<String, f64> {
        self.periods
            .iter()
            .filter_map(|&p| calculate_atr(candles, p).map(|v| (format!("atr_{p}"), v)))
            .collect()
    }

    fn lookback(&self) -> usize {
        self.periods.iter().copied().max().unwrap_or(0) + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(open: f64, high: f64, low: f64, close: f64) -> Candle {
        Candle {
            start_t: 0,
            end_t: 59_999,
            open,
            high,
            low,
            close,
            volume: 100.0,
            n_trades: 50,
        }
    }

    #[test]
    fn atr_guards() {
        let candles = vec![candle(100.0, 105.0, 95.0, 102.0); 10];
        assert!(calculate_atr(&candles, 0).is_none());
        assert!(calculate_atr(&candles, 14).is_none());
    }

    #[test]
    fn atr_constant_range_converges() {
        let candles: Vec<Candle> = (0..30)
            .map(|i| {
                let mid = 100.0 + i as f64 * 0.1;
                candle(mid, mid + 5.0, mid - 5.0, mid)
            })
            .collect();
        let atr = calculate_atr(&candles, 14).unwrap();
        assert!((atr - 10.0).abs() < 1.0, "expected ATR near 10, got {atr}");
    }

    #[test]
    fn atr_counts_gaps_through_previous_close() {
        let candles = vec![
            candle(100.0, 105.0, 95.0, 95.0),
            candle(110.0, 115.0, 108.0, 112.0),
            candle(112.0, 118.0, 110.0, 115.0),
            candle(115.0, 120.0, 113.0, 118.0),
        ];
        // First TR is |115 - 95| = 20, well above the bar's own range.
        assert!(calculate_atr(&candles, 3).unwrap() > 7.0);
    }

    #[test]
    fn atr_non_finite_is_none() {
        let candles = vec![
            candle(100.0, 105.0, 95.0, 100.0),
            candle(100.0, f64::NAN, 95.0, 100.0),
            candle(100.0, 105.0, 95.0, 100.0),
            candle(100.0, 105.0, 95.0, 100.0),
        ];
        assert!(calculate_atr(&candles, 3).is_none());
    }

    #[test]
    fn atr_non_finite_previous_close_is_none() {
        let candles = vec![
            candle(100.0, 105.0, 95.0, f64::INFINITY),
            candle(100.0, 105.0, 95.0, 100.0),
            candle(100.0, 105.0, 95.0, 100.0),
        ];
        assert!(calculate_atr(&candles, 2).is_none());
    }
}
