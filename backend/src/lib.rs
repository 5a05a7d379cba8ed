// =============================================================================
// Kline Tracker — multi-resolution candle engine
// =============================================================================
//
// One base series per instrument, backfilled over REST and kept live from the
// kline WebSocket. Every coarser resolution is derived from the base series
// and kept consistent with it as the base tail changes. Base series are
// snapshotted to CSV so a restart resumes instead of re-fetching history.
// =============================================================================

pub mod api;
pub mod app_state;
pub mod backfill;
pub mod binance;
pub mod error;
pub mod indicators;
pub mod market_data;
pub mod pipeline;
pub mod runtime_config;
pub mod types;
