// =============================================================================
// Exponential Moving Average (EMA)
// =============================================================================
//
//   multiplier = 2 / (period + 1)
//   EMA_t      = close_t * multiplier + EMA_{t-1} * (1 - multiplier)
//
// Seeded with the SMA of the first `period` closes. Emits `ema_<period>`.
// =============================================================================

use std::collections::BTreeMap;

use crate::indicators::{closes, Indicator};
use crate::types::Candle;

/// EMA series for `closes`, one value per close from index `period - 1`.
///
/// Empty when `period == 0`, the input is shorter than `period`, or the seed
/// is non-finite. A non-finite step truncates the series.
pub fn calculate_ema(closes: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || closes.len() < period {
        return Vec::new();
    }
    let k = 2.0 / (period + 1) as f64;

    let seed = closes[..period].iter().sum::<f64>() / period as f64;
    if !seed.is_finite() {
        return Vec::new();
    }

    let mut out = Vec::with_capacity(closes.len() - period + 1);
    out.push(seed);
    let mut prev = seed;
    for &close in &closes[period..] {
        let next = close * k + prev * (1.0 - k);
        if !next.is_finite() {
            break;
        }
        out.push(next);
        prev = next;
    }
    out
}

pub struct Ema {
    periods: Vec<usize>,
}

impl Ema {
    pub fn new(periods: Vec<usize>) -> Self {
        Self { periods }
    }
}

impl Indicator for Ema {
    fn name(&self) -> &'static str {
        "ema"
    }

    fn compute(&self, candles: &[Candle]) -> BTreeMap<String, f64> {
        let closes = closes(candles);
        self.periods
            .iter()
            .filter_map(|&p| {
                calculate_ema(&closes, p)
                    .last()
                    .map(|v| (format!("ema_{p}"), *v))
            })
            .collect()
    }

    fn lookback(&self) -> usize {
        self.periods.iter().copied().max().unwrap_or(0)
    }
}
