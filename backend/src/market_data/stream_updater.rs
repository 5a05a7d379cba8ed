// =============================================================================
// Stream Updater — applies live kline events to the base series
// =============================================================================
//
// States: AwaitingFirst -> Tracking (on the first applied event).
//
// For an event `u` against the store's tail `t` (base interval `b`):
//
//   u.start == t.start, t open     -> update_tail (then close_tail if final)
//   u.start == t.start, t closed   -> discard: the candle is history
//   u.start == t.start + b         -> close_tail, append (then close if final)
//   u.start  < t.start             -> discard: regression
//   u.start  > t.start + b         -> discard: skipped buckets (gap fill repairs)
//
// Discards never reach the store and never surface as errors.
// =============================================================================

use std::fmt;

use tracing::{debug, error, info, warn};

use crate::error::SeriesResult;
use crate::market_data::base_store::BaseSeriesStore;
use crate::types::{KlineUpdate, Resolution};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackingState {
    AwaitingFirst,
    Tracking,
}

/// Why a stream event was not applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    /// Record violates the OHLC/time invariants.
    Malformed,
    /// `start_t` is not on the base interval grid.
    Misaligned,
    /// `start_t` is older than the current tail.
    Regression,
    /// `start_t` matches the tail, but the tail is already closed.
    ClosedCandle,
    /// The event jumped past the next bucket boundary.
    SkippedBuckets { missing: i64 },
    /// The store refused the mutation.
    Rejected,
}

impl fmt::Display for DiscardReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Malformed => write!(f, "malformed"),
            Self::Misaligned => write!(f, "misaligned"),
            Self::Regression => write!(f, "regression"),
            Self::ClosedCandle => write!(f, "closed candle"),
            Self::SkippedBuckets { missing } => write!(f, "skipped {missing} bucket(s)"),
            Self::Rejected => write!(f, "rejected by store"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// First candle of an empty store.
    Started,
    /// Open tail refreshed in place.
    Refreshed,
    /// Tail closed and the next candle appended.
    Advanced,
    Discarded(DiscardReason),
}

impl UpdateOutcome {
    pub fn is_applied(&self) -> bool {
        !matches!(self, Self::Discarded(_))
    }
}

/// Per-instrument live-update state machine. Owned by the pipeline task,
/// which is the only writer of the instrument's base store.
pub struct StreamUpdater {
    symbol: String,
    base: Resolution,
    state: TrackingState,
    applied: u64,
    discarded: u64,
}

impl StreamUpdater {
    pub fn new(symbol: impl Into<String>, base: Resolution) -> Self {
        Self {
            symbol: symbol.into(),
            base,
            state: TrackingState::AwaitingFirst,
            applied: 0,
            discarded: 0,
        }
    }

    pub fn state(&self) -> TrackingState {
        self.state
    }

    pub fn applied(&self) -> u64 {
        self.applied
    }

    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    /// Apply one event to `store`.
    pub fn apply(&mut self, store: &BaseSeriesStore, update: &KlineUpdate) -> UpdateOutcome {
        let outcome = self.classify_and_apply(store, update);
        match outcome {
            UpdateOutcome::Discarded(reason) => {
                self.discarded += 1;
                warn!(
                    symbol = %self.symbol,
                    start_t = update.start_t,
                    tail_start_t = store.last().map(|c| c.start_t),
                    reason = %reason,
                    "discarding kline update"
                );
            }
            _ => {
                self.applied += 1;
                if self.state == TrackingState::AwaitingFirst {
                    info!(symbol = %self.symbol, start_t = update.start_t, "live tracking started");
                    self.state = TrackingState::Tracking;
                }
                if update.is_closed {
                    info!(symbol = %self.symbol, start_t = update.start_t, close = update.close, "candle closed");
                }
            }
        }
        outcome
    }

    fn classify_and_apply(&self, store: &BaseSeriesStore, update: &KlineUpdate) -> UpdateOutcome {
        let candle = update.candle();
        if candle.validate().is_err() {
            return UpdateOutcome::Discarded(DiscardReason::Malformed);
        }
        if !self.base.is_aligned(candle.start_t) {
            return UpdateOutcome::Discarded(DiscardReason::Misaligned);
        }

        let Some(tail) = store.last() else {
            return self.commit(store, update, UpdateOutcome::Started, |s| s.append(candle));
        };

        let next_boundary = tail.start_t + self.base.millis();
        if candle.start_t < tail.start_t {
            UpdateOutcome::Discarded(DiscardReason::Regression)
        } else if candle.start_t == tail.start_t {
            if store.is_tail_open() {
                self.commit(store, update, UpdateOutcome::Refreshed, |s| s.update_tail(&candle))
            } else {
                UpdateOutcome::Discarded(DiscardReason::ClosedCandle)
            }
        } else if candle.start_t == next_boundary {
            if store.is_tail_open() {
                // The exchange opened the next candle before we saw the
                // final event of the previous one.
                debug!(symbol = %self.symbol, start_t = tail.start_t, "closing tail without close signal");
            }
            self.commit(store, update, UpdateOutcome::Advanced, |s| {
                s.close_tail()?;
                s.append(candle)
            })
        } else {
            let missing = (candle.start_t - next_boundary) / self.base.millis();
            UpdateOutcome::Discarded(DiscardReason::SkippedBuckets { missing })
        }
    }

    /// Run `mutate`, then close the new tail if the event was final.
    fn commit(
        &self,
        store: &BaseSeriesStore,
        update: &KlineUpdate,
        applied: UpdateOutcome,
        mutate: impl FnOnce(&BaseSeriesStore) -> SeriesResult<()>,
    ) -> UpdateOutcome {
        let result = mutate(store).and_then(|_| {
            if update.is_closed {
                store.close_tail()
            } else {
                Ok(())
            }
        });
        match result {
            Ok(()) => applied,
            Err(e) => {
                error!(symbol = %self.symbol, error = %e, "store rejected kline update");
                UpdateOutcome::Discarded(DiscardReason::Rejected)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
