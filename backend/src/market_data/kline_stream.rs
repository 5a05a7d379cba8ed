// =============================================================================
// Kline WebSocket stream — live base-interval candle events
// =============================================================================
//
// Each instrument gets one stream task that parses exchange `kline` events
// and hands them to its pipeline through a bounded queue. The queue is never
// awaited on: when the pipeline falls behind and the queue is full, the event
// is dropped here with a warning instead of growing memory without bound.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use futures_util::StreamExt;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_tungstenite::connect_async;
use tracing::{debug, error, info, warn};

use crate::types::{KlineUpdate, Resolution};

const STREAM_BASE_URL: &str = "wss://stream.binance.com:9443/ws";

/// Count of events dropped because an instrument's queue was full.
static DROPPED_ON_FULL_QUEUE: AtomicU64 = AtomicU64::new(0);

pub fn dropped_on_full_queue() -> u64 {
    DROPPED_ON_FULL_QUEUE.load(Ordering::Relaxed)
}

/// Connect to the kline stream for `symbol` at `interval` and feed parsed
/// events into `queue`.
///
/// Runs until the stream disconnects, errors, or the pipeline side of the
/// queue is gone, then returns so the caller can handle reconnection.
pub async fn run_kline_stream(
    symbol: &str,
    interval: Resolution,
    queue: &mpsc::Sender<KlineUpdate>,
) -> Result<()> {
    let lower = symbol.to_lowercase();
    let url = format!("{STREAM_BASE_URL}/{lower}@kline_{interval}");
    info!(url = %url, symbol = %symbol, interval = %interval, "connecting to kline WebSocket");

    let (ws_stream, _response) = connect_async(&url)
        .await
        .context("failed to connect to kline WebSocket")?;

    info!(symbol = %symbol, interval = %interval, "kline WebSocket connected");
    let (_write, mut read) = ws_stream.split();

    loop {
        match read.next().await {
            Some(Ok(msg)) => {
                if let tokio_tungstenite::tungstenite::Message::Text(text) = msg {
                    match parse_kline_message(&text) {
                        Ok(update) => {
                            debug!(
                                symbol = %symbol,
                                start_t = update.start_t,
                                close = update.close,
                                closed = update.is_closed,
                                "kline update"
                            );
                            if !enqueue(symbol, queue, update) {
                                info!(symbol = %symbol, "pipeline queue closed -- stopping kline stream");
                                return Ok(());
                            }
                        }
                        Err(e) => {
                            warn!(symbol = %symbol, error = %e, "failed to parse kline message");
                        }
                    }
                }
                // Ping/Pong/Binary/Close frames: tungstenite answers pings itself.
            }
            Some(Err(e)) => {
                error!(symbol = %symbol, error = %e, "kline WebSocket read error");
                return Err(e.into());
            }
            None => {
                warn!(symbol = %symbol, interval = %interval, "kline WebSocket stream ended");
                return Ok(());
            }
        }
    }
}

/// Push without waiting. Returns `false` once the receiving pipeline is gone.
pub fn enqueue(symbol: &str, queue: &mpsc::Sender<KlineUpdate>, update: KlineUpdate) -> bool {
    match queue.try_send(update) {
        Ok(()) => true,
        Err(TrySendError::Full(dropped)) => {
            DROPPED_ON_FULL_QUEUE.fetch_add(1, Ordering::Relaxed);
            warn!(
                symbol = %symbol,
                start_t = dropped.start_t,
                "pipeline queue full -- discarding kline update"
            );
            true
        }
        Err(TrySendError::Closed(_)) => false,
    }
}

/// Parse a kline event. Accepts both the combined-stream envelope
/// (`{"stream": ..., "data": {...}}`) and the single-stream payload.
///
/// ```json
/// { "e": "kline", "s": "ETHBTC", "k": { "t": 0, "T": 59999, "o": "0.1", ... } }
/// ```
pub fn parse_kline_message(text: &str) -> Result<KlineUpdate> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse kline JSON")?;

    let data = if root.get("data").is_some() {
        &root["data"]
    } else {
        &root
    };

    let k = &data["k"];
    if !k.is_object() {
        anyhow::bail!("message has no kline payload");
    }

    Ok(KlineUpdate {
        start_t: k["t"].as_i64().context("missing field k.t")?,
        end_t: k["T"].as_i64().context("missing field k.T")?,
        open: parse_string_f64(&k["o"], "k.o")?,
        high: parse_string_f64(&k["h"], "k.h")?,
        low: parse_string_f64(&k["l"], "k.l")?,
        close: parse_string_f64(&k["c"], "k.c")?,
        volume: parse_string_f64(&k["v"], "k.v")?,
        n_trades: k["n"].as_i64().context("missing field k.n")?,
        is_closed: k["x"].as_bool().context("missing field k.x")?,
    })
}

/// The exchange sends numeric values as JSON strings inside kline objects.
fn parse_string_f64(val: &serde_json::Value, name: &str) -> Result<f64> {
    match val {
        serde_json::Value::String(s) => s
            .parse::<f64>()
            .with_context(|| format!("failed to parse {name} as f64: {s}")),
        serde_json::Value::Number(n) => n
            .as_f64()
            .with_context(|| format!("field {name} is not a valid f64")),
        _ => anyhow::bail!("field {name} has unexpected JSON type"),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const SINGLE: &str = r#"{
        "e": "kline",
        "E": 123456789,
        "s": "ETHBTC",
        "k": {
            "t": 1700000000000,
            "T": 1700000059999,
            "s": "ETHBTC",
            "i": "1m",
            "o": "0.0510",
            "c": "0.0520",
            "h": "0.0525",
            "l": "0.0505",
            "v": "1000",
            "n": 100,
            "x": false,
            "q": "1.0000",
            "V": "500",
            "Q": "0.500",
            "B": "123456"
        }
    }"#;

    #[test]
    fn parses_single_stream_payload() {
        let u = parse_kline_message(SINGLE).expect("should parse");
        assert_eq!(u.start_t, 1_700_000_000_000);
        assert_eq!(u.end_t, 1_700_000_059_999);
        assert!((u.close - 0.052).abs() < f64::EPSILON);
        assert_eq!(u.n_trades, 100);
        assert!(!u.is_closed);
    }

    #[test]
    fn parses_combined_stream_envelope() {
        let wrapped = format!(r#"{{"stream": "ethbtc@kline_1m", "data": {SINGLE}}}"#);
        let u = parse_kline_message(&wrapped).expect("should parse");
        assert_eq!(u.start_t, 1_700_000_000_000);
    }

    #[test]
    fn rejects_non_kline_messages() {
        assert!(parse_kline_message(r#"{"result": null, "id": 1}"#).is_err());
        assert!(parse_kline_message("not json").is_err());
    }

    #[tokio::test]
    async fn full_queue_drops_instead_of_blocking() {
        let (tx, mut rx) = mpsc::channel(1);
        let u = parse_kline_message(SINGLE).unwrap();

        assert!(enqueue("ETHBTC", &tx, u));
        let before = dropped_on_full_queue();
        assert!(enqueue("ETHBTC", &tx, u));
        assert!(dropped_on_full_queue() > before);

        assert!(rx.recv().await.is_some());
        drop(rx);
        assert!(!enqueue("ETHBTC", &tx, u));
    }
}
