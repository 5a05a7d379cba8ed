// =============================================================================
// REST API — read-only views of the tracked series
// =============================================================================
//
//   GET /api/v1/health                          liveness, uptime, rate limit
//   GET /api/v1/instruments                     per-instrument summary
//   GET /api/v1/series/:symbol/:interval?limit  full series or last N candles
//   GET /api/v1/indicators/:symbol              latest indicator readings
//
// Unknown symbols and intervals answer 404 with a JSON error body.
// =============================================================================

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};

use crate::app_state::{AppState, ErrorRecord};
use crate::binance::RateLimitSnapshot;
use crate::indicators::IndicatorReading;
use crate::market_data::kline_stream;
use crate::pipeline::{InstrumentHandle, InstrumentSummary};
use crate::types::{Candle, Resolution};

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/instruments", get(instruments))
        .route("/api/v1/series/:symbol/:interval", get(series))
        .route("/api/v1/indicators/:symbol", get(indicators))
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Errors
// =============================================================================

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

fn not_found(message: String) -> Response {
    (StatusCode::NOT_FOUND, Json(ErrorBody { error: message })).into_response()
}

fn lookup(state: &AppState, symbol: &str) -> Result<Arc<InstrumentHandle>, Response> {
    state
        .instrument(symbol)
        .ok_or_else(|| not_found(format!("symbol '{symbol}' is not tracked")))
}

// =============================================================================
// Health
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
    server_time: i64,
    instruments: usize,
    rate_limit: RateLimitSnapshot,
    dropped_stream_updates: u64,
    recent_errors: Vec<ErrorRecord>,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        uptime_secs: state.uptime_secs(),
        server_time: chrono::Utc::now().timestamp_millis(),
        instruments: state.instruments().len(),
        rate_limit: state.rate_limit.snapshot(),
        dropped_stream_updates: kline_stream::dropped_on_full_queue(),
        recent_errors: state.recent_errors(),
    })
}

// =============================================================================
// Instruments
// =============================================================================

async fn instruments(State(state): State<Arc<AppState>>) -> Json<Vec<InstrumentSummary>> {
    Json(state.instruments().iter().map(|h| h.summary()).collect())
}

// =============================================================================
// Series
// =============================================================================

#[derive(Debug, Deserialize)]
struct SeriesQuery {
    limit: Option<usize>,
}

#[derive(Serialize)]
struct SeriesResponse {
    symbol: String,
    interval: Resolution,
    tail_open: bool,
    candles: Vec<Candle>,
}

async fn series(
    State(state): State<Arc<AppState>>,
    Path((symbol, interval)): Path<(String, String)>,
    Query(query): Query<SeriesQuery>,
) -> Result<Json<SeriesResponse>, Response> {
    let handle = lookup(&state, &symbol)?;
    let resolution: Resolution = interval.parse().map_err(not_found)?;
    let series = handle
        .series(resolution)
        .ok_or_else(|| not_found(format!("interval {resolution} is not tracked for {symbol}")))?;

    let candles = match query.limit {
        Some(n) => series.tail(n).to_vec(),
        None => series.candles().to_vec(),
    };
    Ok(Json(SeriesResponse {
        symbol: handle.symbol().to_string(),
        interval: resolution,
        tail_open: series.is_tail_open(),
        candles,
    }))
}

// =============================================================================
// Indicators
// =============================================================================

async fn indicators(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
) -> Result<Json<Vec<IndicatorReading>>, Response> {
    let handle = lookup(&state, &symbol)?;
    Ok(Json(handle.indicators()))
}
