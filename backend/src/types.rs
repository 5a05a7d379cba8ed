// =============================================================================
// Shared types used across the kline tracker
// =============================================================================

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// =============================================================================
// Candle
// =============================================================================

/// A single OHLCV record. `start_t` and `end_t` are epoch milliseconds, both
/// inclusive, so a one-minute candle starting at 0 ends at 59 999.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub start_t: i64,
    pub end_t: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub n_trades: i64,
}

impl Candle {
    /// Check the record-level invariants. Returns a human-readable reason on
    /// the first violation found.
    pub fn validate(&self) -> Result<(), String> {
        if self.end_t <= self.start_t {
            return Err(format!(
                "end_t {} is not after start_t {}",
                self.end_t, self.start_t
            ));
        }
        let prices = [self.open, self.high, self.low, self.close, self.volume];
        if prices.iter().any(|v| !v.is_finite()) {
            return Err(format!("non-finite value in candle at {}", self.start_t));
        }
        if self.high < self.open.max(self.close) {
            return Err(format!("high {} below body at {}", self.high, self.start_t));
        }
        if self.low > self.open.min(self.close) {
            return Err(format!("low {} above body at {}", self.low, self.start_t));
        }
        if self.volume < 0.0 || self.n_trades < 0 {
            return Err(format!("negative volume or trade count at {}", self.start_t));
        }
        Ok(())
    }
}

// =============================================================================
// Resolution
// =============================================================================

const MINUTE_MS: i64 = 60_000;
const HOUR_MS: i64 = 60 * MINUTE_MS;
const DAY_MS: i64 = 24 * HOUR_MS;
const WEEK_MS: i64 = 7 * DAY_MS;

/// A candle duration on a fixed epoch-aligned bucket grid.
///
/// Parsed from (and displayed as) the exchange interval vocabulary:
/// `1m`, `3m`, `15m`, `1h`, `4h`, `1d`, `1w`, ...
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Resolution {
    millis: i64,
}

impl Resolution {
    /// Build a resolution from a duration in milliseconds. Only whole
    /// minutes are accepted.
    pub fn from_millis(millis: i64) -> Option<Self> {
        if millis > 0 && millis % MINUTE_MS == 0 {
            Some(Self { millis })
        } else {
            None
        }
    }

    /// Whole-minute resolution; zero is treated as one minute.
    pub const fn from_minutes(minutes: u32) -> Self {
        let minutes = if minutes == 0 { 1 } else { minutes };
        Self {
            millis: minutes as i64 * MINUTE_MS,
        }
    }

    pub fn millis(&self) -> i64 {
        self.millis
    }

    /// Start of the bucket that contains `t`.
    pub fn align(&self, t: i64) -> i64 {
        t.div_euclid(self.millis) * self.millis
    }

    /// Whether `t` sits exactly on a bucket boundary.
    pub fn is_aligned(&self, t: i64) -> bool {
        t.rem_euclid(self.millis) == 0
    }

    /// How many `base` buckets fit in one bucket of `self`, if `self` is an
    /// integer multiple of `base`.
    pub fn ratio_to(&self, base: Resolution) -> Option<i64> {
        if self.millis % base.millis == 0 {
            Some(self.millis / base.millis)
        } else {
            None
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = self.millis;
        if m % WEEK_MS == 0 {
            write!(f, "{}w", m / WEEK_MS)
        } else if m % DAY_MS == 0 {
            write!(f, "{}d", m / DAY_MS)
        } else if m % HOUR_MS == 0 {
            write!(f, "{}h", m / HOUR_MS)
        } else {
            write!(f, "{}m", m / MINUTE_MS)
        }
    }
}

impl FromStr for Resolution {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let unit = s
            .chars()
            .last()
            .ok_or_else(|| "empty interval".to_string())?;
        let unit_ms = match unit {
            'm' => MINUTE_MS,
            'h' => HOUR_MS,
            'd' => DAY_MS,
            'w' => WEEK_MS,
            other => return Err(format!("unknown interval unit '{other}' in '{s}'")),
        };
        let count: i64 = s[..s.len() - 1]
            .parse()
            .map_err(|_| format!("invalid interval count in '{s}'"))?;
        count
            .checked_mul(unit_ms)
            .and_then(Resolution::from_millis)
            .ok_or_else(|| format!("interval '{s}' is not a positive duration"))
    }
}

impl TryFrom<String> for Resolution {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Resolution> for String {
    fn from(value: Resolution) -> Self {
        value.to_string()
    }
}

// =============================================================================
// Live stream event
// =============================================================================

/// One partial or final candle event from the live stream.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct KlineUpdate {
    pub start_t: i64,
    pub end_t: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub n_trades: i64,
    pub is_closed: bool,
}

impl KlineUpdate {
    pub fn candle(&self) -> Candle {
        Candle {
            start_t: self.start_t,
            end_t: self.end_t,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
            n_trades: self.n_trades,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
