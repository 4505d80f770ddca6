//! Coalesced refresh notification fan-out.
//!
//! Turns bursts of per-key refresh requests into one downstream notification
//! per quiescence window. A request arriving while a notification is in
//! flight is guaranteed a later notification (the queue re-arms after
//! draining); a request that never arrives is never resent.

use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::queue::{BatchConfig, BatchProcessor, BatchQueue, QueueError, QueueMetrics, QueueState};

/// Downstream consumer of coalesced refresh notifications.
#[async_trait]
pub trait RefreshSink<K>: Send + Sync {
	/// Handles one coalesced notification covering `keys`.
	///
	/// A failure is logged and not retried; the next cycle resends only if a
	/// new request arrives for the key.
	async fn notify(&self, keys: &[K]) -> anyhow::Result<()>;
}

type SinkList<K> = Arc<Mutex<Vec<Arc<dyn RefreshSink<K>>>>>;

/// Debounced refresh fan-out built on [`BatchQueue`] with unit payloads:
/// the presence of a key is itself the signal.
pub struct RefreshCoordinator<K> {
	queue: BatchQueue<K, ()>,
	sinks: SinkList<K>,
}

impl<K> Clone for RefreshCoordinator<K> {
	fn clone(&self) -> Self {
		Self {
			queue: self.queue.clone(),
			sinks: Arc::clone(&self.sinks),
		}
	}
}

impl<K> fmt::Debug for RefreshCoordinator<K>
where
	K: Eq + Hash + Send + 'static,
{
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("RefreshCoordinator")
			.field("state", &self.queue.state())
			.field("sinks", &self.sinks.lock().len())
			.finish()
	}
}

impl<K> RefreshCoordinator<K>
where
	K: Eq + Hash + Send + 'static,
{
	/// Spawns the coordinator's driver task onto the current tokio runtime.
	pub fn spawn(config: BatchConfig) -> Self {
		let sinks: SinkList<K> = Arc::new(Mutex::new(Vec::new()));
		let queue = BatchQueue::spawn(
			config,
			Broadcast {
				sinks: Arc::clone(&sinks),
			},
		);
		Self { queue, sinks }
	}

	/// Registers a consumer. Takes effect from the next notification cycle.
	pub fn subscribe(&self, sink: Arc<dyn RefreshSink<K>>) {
		self.sinks.lock().push(sink);
	}

	/// Requests that `key` be covered by a future notification. Requests
	/// within one quiescence window coalesce into a single notification.
	pub fn request_refresh(&self, key: K) -> Result<(), QueueError> {
		self.queue.enqueue(key, ())
	}

	/// Emits the pending notification without waiting out the window.
	pub fn flush(&self) -> Result<(), QueueError> {
		self.queue.flush()
	}

	/// Current lifecycle state of the underlying queue.
	pub fn state(&self) -> QueueState {
		self.queue.state()
	}

	/// Watch channel following state transitions.
	pub fn state_watch(&self) -> watch::Receiver<QueueState> {
		self.queue.state_watch()
	}

	/// Activity counters of the underlying queue.
	pub fn metrics(&self) -> &QueueMetrics {
		self.queue.metrics()
	}

	/// Cancels any in-flight notification cycle and discards pending
	/// requests.
	pub fn dispose(&self) {
		self.queue.dispose()
	}
}

struct Broadcast<K> {
	sinks: SinkList<K>,
}

#[async_trait]
impl<K> BatchProcessor<K, ()> for Broadcast<K>
where
	K: Eq + Hash + Send + 'static,
{
	async fn process(&mut self, batch: Vec<(K, ())>, cancel: &CancellationToken) {
		let keys: Vec<K> = batch.into_iter().map(|(key, ())| key).collect();
		// Snapshot the subscriber list; never hold the lock across notify.
		let sinks: Vec<Arc<dyn RefreshSink<K>>> = self.sinks.lock().clone();
		for sink in sinks {
			if cancel.is_cancelled() {
				return;
			}
			if let Err(err) = sink.notify(&keys).await {
				warn!(error = %err, keys = keys.len(), "refresh sink failed; not retried");
			}
		}
	}
}
