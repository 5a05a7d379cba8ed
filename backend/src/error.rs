// =============================================================================
// Series Errors — failure taxonomy of the aggregation engine
// =============================================================================
//
// Stream anomalies are *not* represented here: the stream updater reports
// them as `UpdateOutcome::Discarded` and the pipeline carries on.
// =============================================================================

use std::path::PathBuf;

use thiserror::Error;

pub type SeriesResult<T> = std::result::Result<T, SeriesError>;

#[derive(Debug, Error)]
pub enum SeriesError {
    /// Historical fetch still failing after the retry budget was spent.
    #[error("historical fetch for {symbol} failed after {attempts} attempts: {reason}")]
    Fetch {
        symbol: String,
        attempts: u32,
        reason: String,
    },

    /// A record would break the strictly increasing `start_t` ordering or
    /// touch an immutable record.
    #[error("out-of-order candle: start_t {start_t} against tail {tail_start_t}")]
    OutOfOrder { start_t: i64, tail_start_t: i64 },

    /// Persisted file violates ordering/uniqueness or the record schema.
    #[error("corrupt store {}: {reason}", path.display())]
    CorruptStore { path: PathBuf, reason: String },

    /// No persisted file for this instrument.
    #[error("no persisted series at {}", path.display())]
    NotFound { path: PathBuf },

    /// `update_tail`/`close_tail` on an empty store. Indicates a logic bug.
    #[error("no candle to update: store is empty")]
    NoOpenCandle,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
}
