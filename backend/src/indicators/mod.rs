// =============================================================================
// Technical Indicators Module
// =============================================================================
//
// Indicators are an injected capability: the configured set is resolved once
// at startup (`IndicatorSet::from_config`) and then evaluated over a window of
// candles for every tracked resolution after each propagation. Output fields
// are named `<indicator>_<period>`, e.g. `ema_21`.
// =============================================================================

pub mod atr;
pub mod ema;
pub mod roc;
pub mod rsi;

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::types::{Candle, Resolution};

/// A computation over an ordered candle window (oldest first).
pub trait Indicator: Send + Sync {
    fn name(&self) -> &'static str;

    /// Latest values keyed by output field. Fields without enough data are
    /// omitted.
    fn compute(&self, candles: &[Candle]) -> BTreeMap<String, f64>;

    /// Minimum window length for every field to be produced.
    fn lookback(&self) -> usize;
}

/// Latest indicator values for one resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorReading {
    pub interval: Resolution,
    /// `start_t` of the candle the values were computed at.
    pub start_t: i64,
    /// Whether that candle was still open.
    pub provisional: bool,
    pub values: BTreeMap<String, f64>,
}

/// The configured indicators, shared by every instrument pipeline.
#[derive(Clone, Default)]
pub struct IndicatorSet {
    indicators: Vec<Arc<dyn Indicator>>,
}

impl IndicatorSet {
    /// Build from a `name -> periods` map. Unknown names, empty period lists
    /// and zero periods are configuration errors.
    pub fn from_config(config: &BTreeMap<String, Vec<usize>>) -> Result<Self> {
        let mut indicators: Vec<Arc<dyn Indicator>> = Vec::with_capacity(config.len());
        for (name, periods) in config {
            if periods.is_empty() || periods.contains(&0) {
                bail!("indicator '{name}' needs at least one non-zero period, got {periods:?}");
            }
            let periods = periods.clone();
            let indicator: Arc<dyn Indicator> = match name.as_str() {
                "ema" => Arc::new(ema::Ema::new(periods)),
                "rsi" => Arc::new(rsi::Rsi::new(periods)),
                "atr" => Arc::new(atr::Atr::new(periods)),
                "roc" => Arc::new(roc::Roc::new(periods)),
                other => bail!("unknown indicator '{other}' (known: ema, rsi, atr, roc)"),
            };
            indicators.push(indicator);
        }
        Ok(Self { indicators })
    }

    pub fn is_empty(&self) -> bool {
        self.indicators.is_empty()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.indicators.iter().map(|i| i.name()).collect()
    }

    /// Longest window any configured indicator needs.
    pub fn lookback(&self) -> usize {
        self.indicators.iter().map(|i| i.lookback()).max().unwrap_or(0)
    }

    /// Evaluate every indicator over `window`. `None` for an empty window.
    pub fn evaluate(&self, interval: Resolution, window: &[Candle], tail_open: bool) -> Option<IndicatorReading> {
        let last = window.last()?;
        let values = self
            .indicators
            .iter()
            .flat_map(|i| i.compute(window))
            .collect();
        Some(IndicatorReading {
            interval,
            start_t: last.start_t,
            provisional: tail_open,
            values,
        })
    }
}

/// Close prices of `candles`.
pub(crate) fn closes(candles: &[Candle]) -> Vec<f64> {
    candles.iter().map(|c| c.close).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(entries: &[(&str, &[usize])]) -> BTreeMap<String, Vec<usize>> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_vec()))
            .collect()
    }

    fn rising(n: i64) -> Vec<Candle> {
        (0..n)
            .map(|i| {
                let c = 10.0 + i as f64;
                Candle {
                    start_t: i * 60_000,
                    end_t: i * 60_000 + 59_999,
                    open: c - 0.5,
                    high: c + 1.0,
                    low: c - 1.0,
                    close: c,
                    volume: 1.0,
                    n_trades: 1,
                }
            })
            .collect()
    }

    #[test]
    fn builds_known_indicators() {
        let set = IndicatorSet::from_config(&config(&[("ema", &[9, 21]), ("rsi", &[14])])).unwrap();
        assert_eq!(set.names(), vec!["ema", "rsi"]);
        assert_eq!(set.lookback(), 21);
    }

    #[test]
    fn rejects_unknown_names_and_bad_periods() {
        assert!(IndicatorSet::from_config(&config(&[("macd", &[12])])).is_err());
        assert!(IndicatorSet::from_config(&config(&[("ema", &[])])).is_err());
        assert!(IndicatorSet::from_config(&config(&[("rsi", &[0])])).is_err());
    }

    #[test]
    fn evaluate_names_fields_by_period() {
        let set = IndicatorSet::from_config(&config(&[
            ("ema", &[3]),
            ("rsi", &[5]),
            ("atr", &[5]),
            ("roc", &[2]),
        ]))
        .unwrap();
        let window = rising(20);
        let reading = set.evaluate("1m".parse().unwrap(), &window, true).unwrap();

        assert_eq!(reading.start_t, 19 * 60_000);
        assert!(reading.provisional);
        let keys: Vec<&str> = reading.values.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["atr_5", "ema_3", "roc_2", "rsi_5"]);
        assert_eq!(reading.values["rsi_5"], 100.0);
    }

    #[test]
    fn evaluate_on_empty_window_is_none() {
        let set = IndicatorSet::from_config(&config(&[("ema", &[3])])).unwrap();
        assert!(set.evaluate("1m".parse().unwrap(), &[], false).is_none());
    }
}
