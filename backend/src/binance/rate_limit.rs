// =============================================================================
// Rate-Limit Tracker — monitors Binance request weight to avoid 429s
// =============================================================================
//
// Binance allows 1200 request weight per minute per IP; we hard-cap
// ourselves at 1000. The tracker reads the `X-MBX-USED-WEIGHT-1M` response
// header after every request and keeps an atomic counter that any task may
// query lock-free.
//
// The exchange resets its window every minute, but our copy only refreshes
// when a response arrives. Once blocked, nothing would refresh it, so the
// counter is considered stale after a minute without responses.
// =============================================================================

use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Hard ceiling at which we refuse to send additional requests.
const WEIGHT_HARD_LIMIT: u32 = 1000;
/// Soft warning threshold.
const WEIGHT_WARN_THRESHOLD: u32 = 800;
/// Length of the exchange's weight window.
const WINDOW_MS: i64 = 60_000;

pub struct RateLimitTracker {
    used_weight_1m: AtomicU32,
    updated_at_ms: AtomicI64,
    blocked_requests: AtomicU32,
}

/// Serialisable view of the tracker for the health endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSnapshot {
    pub used_weight_1m: u32,
    pub hard_limit: u32,
    pub blocked_requests: u32,
}

impl RateLimitTracker {
    pub fn new() -> Self {
        Self {
            used_weight_1m: AtomicU32::new(0),
            updated_at_ms: AtomicI64::new(0),
            blocked_requests: AtomicU32::new(0),
        }
    }

    // -------------------------------------------------------------------------
    // Header-based updates
    // -------------------------------------------------------------------------

    /// Update the weight counter from the HTTP response headers returned by
    /// Binance.
    pub fn update_from_headers(&self, headers: &reqwest::header::HeaderMap) {
        let weight = headers
            .get("X-MBX-USED-WEIGHT-1M")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u32>().ok());
        if let Some(w) = weight {
            self.record_weight(w);
        }
    }

    /// Store the exchange-reported weight for the current window.
    pub fn record_weight(&self, w: u32) {
        let prev = self.used_weight_1m.swap(w, Ordering::Relaxed);
        self.updated_at_ms.store(now_ms(), Ordering::Relaxed);
        if w >= WEIGHT_WARN_THRESHOLD && prev < WEIGHT_WARN_THRESHOLD {
            warn!(
                used_weight = w,
                hard_limit = WEIGHT_HARD_LIMIT,
                "rate-limit weight crossed warning threshold"
            );
        }
        debug!(used_weight_1m = w, "rate-limit weight updated from header");
    }

    // -------------------------------------------------------------------------
    // Pre-flight checks
    // -------------------------------------------------------------------------

    /// Return `true` if we can afford to spend `weight` more request weight
    /// without exceeding the hard limit.
    pub fn can_send_request(&self, weight: u32) -> bool {
        let current = self.current_weight();
        let allowed = current + weight <= WEIGHT_HARD_LIMIT;
        if !allowed {
            self.blocked_requests.fetch_add(1, Ordering::Relaxed);
            warn!(
                current_weight = current,
                requested_weight = weight,
                hard_limit = WEIGHT_HARD_LIMIT,
                "request blocked -- would exceed rate-limit"
            );
        }
        allowed
    }

    fn current_weight(&self) -> u32 {
        let updated = self.updated_at_ms.load(Ordering::Relaxed);
        if now_ms() - updated >= WINDOW_MS {
            0
        } else {
            self.used_weight_1m.load(Ordering::Relaxed)
        }
    }

    // -------------------------------------------------------------------------
    // Snapshot
    // -------------------------------------------------------------------------

    pub fn snapshot(&self) -> RateLimitSnapshot {
        RateLimitSnapshot {
            used_weight_1m: self.current_weight(),
            hard_limit: WEIGHT_HARD_LIMIT,
            blocked_requests: self.blocked_requests.load(Ordering::Relaxed),
        }
    }
}

impl Default for RateLimitTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RateLimitTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitTracker")
            .field("used_weight_1m", &self.used_weight_1m.load(Ordering::Relaxed))
            .field("blocked_requests", &self.blocked_requests.load(Ordering::Relaxed))
            .finish()
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::{HeaderMap, HeaderValue};

    #[test]
    fn header_weight_gates_requests() {
        let tracker = RateLimitTracker::new();
        assert!(tracker.can_send_request(20));

        let mut headers = HeaderMap::new();
        headers.insert("X-MBX-USED-WEIGHT-1M", HeaderValue::from_static("990"));
        tracker.update_from_headers(&headers);

        assert!(tracker.can_send_request(10));
        assert!(!tracker.can_send_request(11));
        let snap = tracker.snapshot();
        assert_eq!(snap.used_weight_1m, 990);
        assert_eq!(snap.blocked_requests, 1);
    }

    #[test]
    fn stale_weight_is_ignored() {
        let tracker = RateLimitTracker::new();
        tracker.record_weight(1000);
        tracker
            .updated_at_ms
            .store(now_ms() - WINDOW_MS - 1, Ordering::Relaxed);
        assert!(tracker.can_send_request(500));
    }

    #[test]
    fn missing_or_garbage_header_changes_nothing() {
        let tracker = RateLimitTracker::new();
        let mut headers = HeaderMap::new();
        headers.insert("X-MBX-USED-WEIGHT-1M", HeaderValue::from_static("lots"));
        tracker.update_from_headers(&headers);
        tracker.update_from_headers(&HeaderMap::new());
        assert_eq!(tracker.snapshot().used_weight_1m, 0);
    }
}
