// =============================================================================
// Rate of Change (ROC) — Momentum Indicator
// =============================================================================
//
//   ROC = ((close - close_n) / close_n) * 100
//
// Emits `roc_<period>`.

use std::collections::BTreeMap;

use crate::indicators::{closes, Indicator};
use crate::types::Candle;

/// Most recent ROC, or `None` without `period + 1` closes or with a zero
/// reference close.
pub fn current_roc(closes: &[f64], period: usize) -> Option<f64> {
    if period == 0 || closes.len() <= period {
        return None;
    }
    let last = *closes.last()?;
    let reference = closes[closes.len() - 1 - period];
    if reference == 0.0 {
        return None;
    }
    Some((last - reference) / reference * 100.0)
}

pub struct Roc {
    periods: Vec<usize>,
}

impl Roc {
    pub fn new(periods: Vec<usize>) -> Self {
        Self { periods }
    }
}

impl Indicator for Roc {
    fn name(&self) -> &'static str {
        "roc"
    }

    fn compute(&self, candles: &[Candle]) -> BTreeMap<String, f64> {
        let closes = closes(candles);
        self.periods
            .iter()
            .filter_map(|&p| current_roc(&closes, p).map(|v| (format!("roc_{p}"), v)))
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
    fn roc_basic() {
        let closes: Vec<f64> = (1..=15).map(|x| x as f64).collect();
        // 1 -> 15 over 14 periods.
        assert!((current_roc(&closes, 14).unwrap() - 1400.0).abs() < 1e-10);
    }

    #[test]
    fn roc_guards() {
        assert!(current_roc(&[1.0, 2.0, 3.0], 14).is_none());
        assert!(current_roc(&[0.0, 2.0], 1).is_none());
    }
}
