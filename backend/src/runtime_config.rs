// =============================================================================
// Tracker Configuration — JSON-backed, env-overridable
// =============================================================================
//
// Loaded once at startup from `tracker_config.json`. Every field carries a
// `#[serde(default = ...)]` so partial files (or `{}`) load cleanly and new
// fields never break existing files.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash.
// =============================================================================

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::binance::client::MAX_KLINES_LIMIT;
use crate::indicators::IndicatorSet;
use crate::types::Resolution;

pub const DEFAULT_CONFIG_PATH: &str = "tracker_config.json";

// ---------------------------------------------------------------------------
// Default value helpers (required by `#[serde(default = "...")]`)
// ---------------------------------------------------------------------------

fn default_symbols() -> Vec<String> {
    vec!["ETHBTC".into(), "XRPBTC".into()]
}

fn default_base_interval() -> Resolution {
    Resolution::from_minutes(1)
}

fn default_derived_intervals() -> Vec<Resolution> {
    [3, 5, 15, 30, 60, 120, 240]
        .into_iter()
        .map(Resolution::from_minutes)
        .collect()
}

fn default_history_days() -> u32 {
    10
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./output/data")
}

fn default_page_limit() -> u32 {
    500
}

fn default_fetch_max_attempts() -> u32 {
    3
}

fn default_fetch_backoff_ms() -> u64 {
    500
}

fn default_snapshot_every_updates() -> u64 {
    100
}

fn default_gap_fill_interval_secs() -> u64 {
    300
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_indicator_window() -> usize {
    110
}

fn default_indicators() -> BTreeMap<String, Vec<usize>> {
    BTreeMap::from([("ema".into(), vec![9, 21]), ("rsi".into(), vec![14])])
}

fn default_bind_addr() -> String {
    "0.0.0.0:3001".into()
}

// ---------------------------------------------------------------------------
// TrackerConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// Instruments to track (exchange symbols, upper-case).
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    /// Finest tracked resolution; the live stream subscribes to this one.
    #[serde(default = "default_base_interval")]
    pub base_interval: Resolution,

    /// Coarser resolutions derived from the base series. Each must be an
    /// integer multiple (> 1) of `base_interval`.
    #[serde(default = "default_derived_intervals")]
    pub derived_intervals: Vec<Resolution>,

    /// Depth of the cold-start backfill.
    #[serde(default = "default_history_days")]
    pub history_days: u32,

    /// Directory holding one `<SYMBOL>.csv` per instrument.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default = "default_page_limit")]
    pub page_limit: u32,

    #[serde(default = "default_fetch_max_attempts")]
    pub fetch_max_attempts: u32,

    /// First retry delay; doubles per attempt.
    #[serde(default = "default_fetch_backoff_ms")]
    pub fetch_backoff_ms: u64,

    /// Applied updates between background snapshots (0 = shutdown only).
    #[serde(default = "default_snapshot_every_updates")]
    pub snapshot_every_updates: u64,

    #[serde(default = "default_gap_fill_interval_secs")]
    pub gap_fill_interval_secs: u64,

    /// Bounded per-instrument queue between the stream and the pipeline.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Candles per resolution fed to the indicators.
    #[serde(default = "default_indicator_window")]
    pub indicator_window: usize,

    /// Indicator name -> periods, e.g. `{"ema": [9, 21]}`.
    #[serde(default = "default_indicators")]
    pub indicators: BTreeMap<String, Vec<usize>>,

    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            symbols: default_symbols(),
            base_interval: default_base_interval(),
            derived_intervals: default_derived_intervals(),
            history_days: default_history_days(),
            data_dir: default_data_dir(),
            page_limit: default_page_limit(),
            fetch_max_attempts: default_fetch_max_attempts(),
            fetch_backoff_ms: default_fetch_backoff_ms(),
            snapshot_every_updates: default_snapshot_every_updates(),
            gap_fill_interval_secs: default_gap_fill_interval_secs(),
            queue_capacity: default_queue_capacity(),
            indicator_window: default_indicator_window(),
            indicators: default_indicators(),
            bind_addr: default_bind_addr(),
        }
    }
}

impl TrackerConfig {
    /// Load from a JSON file on disk.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read tracker config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse tracker config from {}", path.display()))?;

        info!(
            path = %path.display(),
            symbols = ?config.symbols,
            base = %config.base_interval,
            "tracker config loaded"
        );

        Ok(config)
    }

    /// Persist to disk atomically (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise tracker config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "tracker config saved (atomic)");
        Ok(())
    }

    /// Apply `KLINE_SYMBOLS` / `KLINE_BIND_ADDR` from `lookup`.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(syms) = lookup("KLINE_SYMBOLS") {
            let symbols: Vec<String> = syms
                .split(',')
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .collect();
            if !symbols.is_empty() {
                self.symbols = symbols;
            }
        }
        if let Some(addr) = lookup("KLINE_BIND_ADDR") {
            let addr = addr.trim();
            if !addr.is_empty() {
                self.bind_addr = addr.to_string();
            }
        }
    }

    /// Reject configurations the tracker cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.symbols.is_empty() {
            bail!("no symbols configured");
        }
        for r in &self.derived_intervals {
            match r.ratio_to(self.base_interval) {
                Some(ratio) if ratio > 1 => {}
                _ => bail!(
                    "derived interval {r} is not an integer multiple of the base interval {}",
                    self.base_interval
                ),
            }
        }
        if self.page_limit == 0 || self.page_limit > MAX_KLINES_LIMIT {
            bail!("page_limit must be within 1..={MAX_KLINES_LIMIT}, got {}", self.page_limit);
        }
        if self.fetch_max_attempts == 0 {
            bail!("fetch_max_attempts must be at least 1");
        }
        if self.history_days == 0 {
            bail!("history_days must be at least 1");
        }
        if self.queue_capacity == 0 {
            bail!("queue_capacity must be at least 1");
        }
        if self.gap_fill_interval_secs == 0 {
            bail!("gap_fill_interval_secs must be at least 1");
        }
        IndicatorSet::from_config(&self.indicators).context("invalid indicator configuration")?;
        Ok(())
    }

    pub fn fetch_backoff(&self) -> Duration {
        Duration::from_millis(self.fetch_backoff_ms)
    }

    pub fn gap_fill_interval(&self) -> Duration {
        Duration::from_secs(self.gap_fill_interval_secs)
    }

    /// Start of the cold-start backfill window relative to `now_ms`.
    pub fn history_start(&self, now_ms: i64) -> i64 {
        now_ms - i64::from(self.history_days) * 86_400_000
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
