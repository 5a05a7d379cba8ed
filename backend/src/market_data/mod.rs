pub mod base_store;
pub mod kline_stream;
pub mod persistence;
pub mod propagator;
pub mod resampler;
pub mod series;
pub mod stream_updater;

pub use base_store::BaseSeriesStore;
pub use persistence::Snapshotter;
pub use propagator::Propagator;
pub use series::{Series, SharedSeries};
pub use stream_updater::{DiscardReason, StreamUpdater, TrackingState, UpdateOutcome};
