// =============================================================================
// Relative Strength Index (RSI) — Wilder's Smoothing
// =============================================================================
//
// Average gain / loss are seeded with the SMA of the first `period` deltas,
// then smoothed:
//
//   avg = (prev_avg * (period - 1) + current) / period
//   RSI = 100 - 100 / (1 + avg_gain / avg_loss)
//
// Emits `rsi_<period>`.
// =============================================================================

use std::collections::BTreeMap;

use crate::indicators::{closes, Indicator};
use crate::types::Candle;

/// RSI series, one value per close from index `period`.
///
/// Empty when `period == 0` or fewer than `period + 1` closes are given.
/// A flat window yields 50; a window without losses yields 100.
pub fn calculate_rsi(closes: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || closes.len() < period + 1 {
        return Vec::new();
    }

    let deltas: Vec<f64> = closes.windows(2).map(|w| w[1] - w[0]).collect();
    let n = period as f64;

    let mut avg_gain = deltas[..period].iter().map(|d| d.max(0.0)).sum::<f64>() / n;
    let mut avg_loss = deltas[..period].iter().map(|d| (-d).max(0.0)).sum::<f64>() / n;

    let mut out = Vec::with_capacity(deltas.len() - period + 1);
    match rsi_from_averages(avg_gain, avg_loss) {
        Some(v) => out.push(v),
        None => return out,
    }

    for &d in &deltas[period..] {
        avg_gain = (avg_gain * (n - 1.0) + d.max(0.0)) / n;
        avg_loss = (avg_loss * (n - 1.0) + (-d).max(0.0)) / n;
        match rsi_from_averages(avg_gain, avg_loss) {
            Some(v) => out.push(v),
            None => break,
        }
    }
    out
}

fn rsi_from_averages(avg_gain: f64, avg_loss: f64) -> Option<f64> {
    let rsi = if avg_loss == 0.0 && avg_gain == 0.0 {
        50.0
    } else if avg_loss == 0.0 {
        100.0
    } else {
        100.0 - 100.0 / (1.0 + avg_gain / avg_loss)
    };
    rsi.is_finite().then_some(rsi)
}

pub struct Rsi {
    periods: Vec<usize>,
}

impl Rsi {
    pub fn new(periods: Vec<usize>) -> Self {
        Self { periods }
    }
}

impl Indicator for Rsi {
    fn name(&self) -> &'static str {
        "rsi"
    }

    fn compute(&self, candles: &[Candle]) -> BTreeMap<String, f64> {
        let closes = closes(candles);
        self.periods
            .iter()
            .filter_map(|&p| {
                calculate_rsi(&closes, p)
                    .last()
                    .map(|v| (format!("rsi_{p}"), *v))
            })
            .collect()
    }

    fn lookback(&self) -> usize {
        self.periods.iter().copied().max().unwrap_or(0) + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rsi_guards() {
        assert!(calculate_rsi(&[], 14).is_empty());
        assert!(calculate_rsi(&[1.0; 14], 14).is_empty());
        assert!(calculate_rsi(&[1.0, 2.0], 0).is_empty());
    }

    #[test]
    fn rsi_extremes() {
        let up: Vec<f64> = (1..=30).map(|x| x as f64).collect();
        assert_eq!(*calculate_rsi(&up, 14).last().unwrap(), 100.0);

        let flat = vec![5.0; 30];
        assert_eq!(*calculate_rsi(&flat, 14).last().unwrap(), 50.0);

        let down: Vec<f64> = (1..=30).rev().map(|x| x as f64).collect();
        assert!(*calculate_rsi(&down, 14).last().unwrap() < 1e-9);
    }

    #[test]
    fn rsi_seed_value() {
        // Deltas +1, -1, +2: gains 3/3, losses 1/3 -> RS 3 -> RSI 75.
        let rsi = calculate_rsi(&[10.0, 11.0, 10.0, 12.0], 3);
        assert_eq!(rsi.len(), 1);
        assert!((rsi[0] - 75.0).abs() < 1e-10);
    }

    #[test]
    fn rsi_stays_in_range() {
        let closes: Vec<f64> = (0..200).map(|i| 100.0 + (i as f64 * 0.37).sin() * 4.0).collect();
        assert!(calculate_rsi(&closes, 14)
            .iter()
            .all(|v| (0.0..=100.0).contains(v)));
    }
}
