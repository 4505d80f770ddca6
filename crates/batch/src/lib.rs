//! Debounced work batching and coalesced refresh fan-out.
//!
//! Goals:
//! - coalesce duplicate keys within one quiescence window (last write wins)
//! - pure debounce: every enqueue restarts the full window
//! - one batch in flight at a time; enqueues during draining land in the
//!   next window without cancelling the running batch
//! - disposal cancels in-flight processing and discards pending work

mod queue;
mod refresh;

pub use queue::{
	BatchConfig, BatchProcessor, BatchQueue, DEFAULT_QUIESCENCE, QueueError, QueueMetrics,
	QueueState,
};
pub use refresh::{RefreshCoordinator, RefreshSink};
