// =============================================================================
// Binance REST API Client — public market-data endpoints
// =============================================================================
//
// Only unauthenticated endpoints are used (klines, exchangeInfo), so no key
// material is held. Every response feeds `X-MBX-USED-WEIGHT-1M` into the
// shared `RateLimitTracker`; a request that would cross the weight ceiling
// is refused locally instead of earning a 429/418 from the exchange.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, instrument, warn};

use crate::backfill::HistoricalFetcher;
use crate::binance::rate_limit::RateLimitTracker;
use crate::types::{Candle, Resolution};

pub const DEFAULT_BASE_URL: &str = "https://api.binance.com";

/// Request weight of `GET /api/v3/klines` for `limit <= 1000`.
const KLINES_WEIGHT: u32 = 2;
/// Request weight of `GET /api/v3/exchangeInfo` for a single symbol.
const EXCHANGE_INFO_WEIGHT: u32 = 20;

/// Exchange ceiling for one klines page.
pub const MAX_KLINES_LIMIT: u32 = 1000;

#[derive(Clone)]
pub struct BinanceClient {
    base_url: String,
    client: reqwest::Client,
    rate_limit: Arc<RateLimitTracker>,
}

impl BinanceClient {
    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    pub fn new(rate_limit: Arc<RateLimitTracker>) -> Result<Self> {
        Self::with_base_url(DEFAULT_BASE_URL, rate_limit)
    }

    pub fn with_base_url(base_url: impl Into<String>, rate_limit: Arc<RateLimitTracker>) -> Result<Self> {
        let base_url = base_url.into();
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("failed to build reqwest client")?;

        debug!(base_url = %base_url, "BinanceClient initialised");

        Ok(Self {
            base_url,
            client,
            rate_limit,
        })
    }

    pub fn rate_limit(&self) -> &Arc<RateLimitTracker> {
        &self.rate_limit
    }

    // -------------------------------------------------------------------------
    // Market data
    // -------------------------------------------------------------------------

    /// GET /api/v3/klines for `[start_ms, end_ms]`, oldest first.
    #[instrument(skip(self), name = "binance::get_klines")]
    pub async fn get_klines(
        &self,
        symbol: &str,
        interval: Resolution,
        start_ms: i64,
        end_ms: Option<i64>,
        limit: u32,
    ) -> Result<Vec<Candle>> {
        let limit = limit.clamp(1, MAX_KLINES_LIMIT);
        let mut url = format!(
            "{}/api/v3/klines?symbol={}&interval={}&startTime={}&limit={}",
            self.base_url, symbol, interval, start_ms, limit
        );
        if let Some(end) = end_ms {
            url.push_str(&format!("&endTime={end}"));
        }

        let body = self.get_json(&url, KLINES_WEIGHT, "/api/v3/klines").await?;
        let candles = parse_klines(&body)?;

        debug!(symbol, interval = %interval, count = candles.len(), "klines fetched");
        Ok(candles)
    }

    /// GET /api/v3/exchangeInfo filtered by symbol.
    #[instrument(skip(self), name = "binance::get_symbol_info")]
    pub async fn get_symbol_info(&self, symbol: &str) -> Result<serde_json::Value> {
        let url = format!("{}/api/v3/exchangeInfo?symbol={}", self.base_url, symbol);
        let body = self
            .get_json(&url, EXCHANGE_INFO_WEIGHT, "/api/v3/exchangeInfo")
            .await?;

        // Extract the first (and usually only) symbol entry.
        let info = body["symbols"]
            .as_array()
            .and_then(|arr| arr.first().cloned())
            .context("symbol not found in exchangeInfo response")?;

        debug!(symbol, "symbol info retrieved");
        Ok(info)
    }

    /// Whether the exchange lists `symbol` and it is currently trading.
    pub async fn symbol_exists(&self, symbol: &str) -> Result<bool> {
        match self.get_symbol_info(symbol).await {
            Ok(info) => Ok(info["status"].as_str().map_or(true, |s| s == "TRADING")),
            Err(e) => {
                // exchangeInfo answers an unknown symbol with HTTP 400.
                if e.to_string().contains("returned 400") {
                    Ok(false)
                } else {
                    Err(e)
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Internal helpers
    // -------------------------------------------------------------------------

    async fn get_json(&self, url: &str, weight: u32, endpoint: &str) -> Result<serde_json::Value> {
        if !self.rate_limit.can_send_request(weight) {
            anyhow::bail!("GET {endpoint} withheld: request weight ceiling reached");
        }

        let resp = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("GET {endpoint} request failed"))?;

        self.rate_limit.update_from_headers(resp.headers());

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .with_context(|| format!("failed to parse {endpoint} response"))?;

        if !status.is_success() {
            anyhow::bail!("Binance GET {} returned {}: {}", endpoint, status, body);
        }
        Ok(body)
    }
}

#[async_trait]
impl HistoricalFetcher for BinanceClient {
    async fn fetch(
        &self,
        symbol: &str,
        resolution: Resolution,
        start_ms: i64,
        end_ms: Option<i64>,
        limit: u32,
    ) -> Result<Vec<Candle>> {
        self.get_klines(symbol, resolution, start_ms, end_ms, limit).await
    }
}

/// Parse the klines array-of-arrays:
/// `[open_time, open, high, low, close, volume, close_time, quote_volume,
/// n_trades, ...]`.
pub fn parse_klines(body: &serde_json::Value) -> Result<Vec<Candle>> {
    let raw = body.as_array().context("klines response is not an array")?;

    let mut candles = Vec::with_capacity(raw.len());
    for entry in raw {
        let arr = entry.as_array().context("kline entry is not an array")?;

        if arr.len() < 9 {
            warn!("skipping malformed kline entry with {} elements", arr.len());
            continue;
        }

        candles.push(Candle {
            start_t: arr[0].as_i64().context("kline open time is not an integer")?,
            open: parse_str_f64(&arr[1])?,
            high: parse_str_f64(&arr[2])?,
            low: parse_str_f64(&arr[3])?,
            close: parse_str_f64(&arr[4])?,
            volume: parse_str_f64(&arr[5])?,
            end_t: arr[6].as_i64().context("kline close time is not an integer")?,
            n_trades: arr[8].as_i64().unwrap_or(0),
        });
    }
    Ok(candles)
}

/// Parse a JSON value that may be either a string or a number into `f64`.
fn parse_str_f64(val: &serde_json::Value) -> Result<f64> {
    if let Some(s) = val.as_str() {
        s.parse::<f64>()
            .with_context(|| format!("failed to parse '{s}' as f64"))
    } else if let Some(n) = val.as_f64() {
        Ok(n)
    } else {
        anyhow::bail!("expected string or number, got: {val}")
    }
}

impl std::fmt::Debug for BinanceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceClient")
            .field("base_url", &self.base_url)
            .field("rate_limit", &self.rate_limit)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_kline_rows() {
        let body = json!([
            [1499040000000i64, "0.01634790", "0.80000000", "0.01575800", "0.01577100",
             "148976.11427815", 1499644799999i64, "2434.19055334", 308, "1756.87402397",
             "28.46694368", "0"],
            [1499644800000i64, "0.01577100", "0.01600000", "0.01500000", "0.01590000",
             "100.0", 1499644859999i64, "1.5", 12, "0", "0", "0"]
        ]);
        let candles = parse_klines(&body).unwrap();
        assert_eq!(candles.len(), 2);
        assert_eq!(candles[0].start_t, 1499040000000);
        assert_eq!(candles[0].end_t, 1499644799999);
        assert_eq!(candles[0].high, 0.8);
        assert_eq!(candles[0].n_trades, 308);
        assert_eq!(candles[1].close, 0.0159);
    }

    #[test]
    fn short_rows_are_skipped_and_garbage_fails() {
        let body = json!([[1, "1", "1"]]);
        assert!(parse_klines(&body).unwrap().is_empty());

        let body = json!([[0, "x", "1", "1", "1", "1", 59999, "0", 1]]);
        assert!(parse_klines(&body).is_err());

        assert!(parse_klines(&json!({"code": -1121})).is_err());
    }

    #[tokio::test]
    async fn saturated_weight_blocks_requests_locally() {
        let tracker = Arc::new(RateLimitTracker::new());
        tracker.record_weight(1_000);
        // Unroutable address: the request must be refused before any I/O.
        let client = BinanceClient::with_base_url("http://127.0.0.1:9", tracker).unwrap();
        let err = client
            .get_klines("ETHBTC", "1m".parse().unwrap(), 0, None, 10)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("withheld"));
    }
}
