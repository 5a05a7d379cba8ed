// =============================================================================
// Central Application State — Kline Tracker
// =============================================================================
//
// Ties the tracked instruments' read handles together for the read API.
// Nothing in here is written by the pipelines: each pipeline owns its own
// context and only publishes through its `InstrumentHandle`.
//
// Thread safety:
//   - parking_lot::RwLock for the instrument registry and the error log.
//   - Arc wrappers for the handles and the rate-limit tracker, which manage
//     their own interior mutability.
// =============================================================================

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;

use crate::binance::RateLimitTracker;
use crate::pipeline::InstrumentHandle;
use crate::runtime_config::TrackerConfig;

/// Maximum number of recent errors to retain.
const MAX_RECENT_ERRORS: usize = 50;

/// An operator-facing error event (bootstrap failures, corrupt stores).
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub symbol: Option<String>,
    pub message: String,
    /// ISO 8601 timestamp.
    pub at: String,
}

pub struct AppState {
    pub config: TrackerConfig,
    pub rate_limit: Arc<RateLimitTracker>,
    /// Instant when the tracker was started. Used for uptime calculations.
    pub start_time: Instant,
    instruments: RwLock<BTreeMap<String, Arc<InstrumentHandle>>>,
    recent_errors: RwLock<VecDeque<ErrorRecord>>,
}

impl AppState {
    pub fn new(config: TrackerConfig, rate_limit: Arc<RateLimitTracker>) -> Self {
        Self {
            config,
            rate_limit,
            start_time: Instant::now(),
            instruments: RwLock::new(BTreeMap::new()),
            recent_errors: RwLock::new(VecDeque::with_capacity(MAX_RECENT_ERRORS)),
        }
    }

    pub fn register(&self, handle: Arc<InstrumentHandle>) {
        self.instruments
            .write()
            .insert(handle.symbol().to_uppercase(), handle);
    }

    /// Look up an instrument by symbol (case-insensitive).
    pub fn instrument(&self, symbol: &str) -> Option<Arc<InstrumentHandle>> {
        self.instruments.read().get(&symbol.to_uppercase()).cloned()
    }

    pub fn instruments(&self) -> Vec<Arc<InstrumentHandle>> {
        self.instruments.read().values().cloned().collect()
    }

    pub fn push_error(&self, symbol: Option<&str>, message: String) {
        let mut errors = self.recent_errors.write();
        if errors.len() >= MAX_RECENT_ERRORS {
            errors.pop_front();
        }
        errors.push_back(ErrorRecord {
            symbol: symbol.map(str::to_string),
            message,
            at: Utc::now().to_rfc3339(),
        });
    }

    pub fn recent_errors(&self) -> Vec<ErrorRecord> {
        self.recent_errors.read().iter().cloned().collect()
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_log_is_bounded() {
        let state = AppState::new(TrackerConfig::default(), Arc::new(RateLimitTracker::new()));
        for i in 0..(MAX_RECENT_ERRORS + 5) {
            state.push_error(Some("ETHBTC"), format!("error {i}"));
        }
        let errors = state.recent_errors();
        assert_eq!(errors.len(), MAX_RECENT_ERRORS);
        assert_eq!(errors[0].message, "error 5");
    }

    #[test]
    fn unknown_instrument_is_none() {
        let state = AppState::new(TrackerConfig::default(), Arc::new(RateLimitTracker::new()));
        assert!(state.instrument("ethbtc").is_none());
        assert!(state.instruments().is_empty());
    }
}
