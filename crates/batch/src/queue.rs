//! Coalescing work queue with a debounced release cycle.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::pin::pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Default quiescence window.
pub const DEFAULT_QUIESCENCE: Duration = Duration::from_millis(250);

/// Queue configuration.
#[derive(Debug, Clone, Copy)]
pub struct BatchConfig {
	/// Debounce interval: restarted on every enqueue, a batch is released
	/// only once no enqueue arrives within it (or on explicit flush).
	pub quiescence: Duration,
}

impl Default for BatchConfig {
	fn default() -> Self {
		Self {
			quiescence: DEFAULT_QUIESCENCE,
		}
	}
}

/// Observable queue lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
	/// No pending work.
	Idle,
	/// Work is pending and the quiescence timer is running.
	AwaitingQuiescence,
	/// A batch is being processed.
	Draining,
}

/// Submission error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
	/// The queue was disposed; the submission was discarded.
	#[error("queue disposed")]
	Disposed,
}

/// Batch consumer invoked by the queue's driver task, one batch at a time.
#[async_trait]
pub trait BatchProcessor<K, P>: Send + 'static {
	/// Processes one deduplicated batch.
	///
	/// `cancel` fires when the queue is disposed; long-running processors
	/// should observe it. Batch order across keys is unspecified.
	async fn process(&mut self, batch: Vec<(K, P)>, cancel: &CancellationToken);
}

/// Monotonic activity counters.
#[derive(Debug, Default)]
pub struct QueueMetrics {
	batches: AtomicU64,
	enqueued: AtomicU64,
	coalesced: AtomicU64,
}

impl QueueMetrics {
	/// Batches handed to the processor.
	pub fn batches_processed(&self) -> u64 {
		self.batches.load(Ordering::Relaxed)
	}

	/// Keys accepted by `enqueue`, including overwrites.
	pub fn keys_enqueued(&self) -> u64 {
		self.enqueued.load(Ordering::Relaxed)
	}

	/// Enqueues that overwrote an already-pending key (last write wins).
	pub fn keys_coalesced(&self) -> u64 {
		self.coalesced.load(Ordering::Relaxed)
	}
}

enum Op<K, P> {
	Enqueue(K, P),
	Flush,
}

/// Handle to a debounced, coalescing work queue.
///
/// Cheap to clone; every handle submits to the same driver task. Dropping all
/// handles closes the queue with the same effect as [`BatchQueue::dispose`].
pub struct BatchQueue<K, P> {
	tx: mpsc::UnboundedSender<Op<K, P>>,
	cancel: CancellationToken,
	state_rx: watch::Receiver<QueueState>,
	metrics: Arc<QueueMetrics>,
}

impl<K, P> Clone for BatchQueue<K, P> {
	fn clone(&self) -> Self {
		Self {
			tx: self.tx.clone(),
			cancel: self.cancel.clone(),
			state_rx: self.state_rx.clone(),
			metrics: Arc::clone(&self.metrics),
		}
	}
}

impl<K, P> fmt::Debug for BatchQueue<K, P>
where
	K: Eq + Hash + Send + 'static,
	P: Send + 'static,
{
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("BatchQueue")
			.field("state", &self.state())
			.finish()
	}
}

impl<K, P> BatchQueue<K, P>
where
	K: Eq + Hash + Send + 'static,
	P: Send + 'static,
{
	/// Spawns the driver task onto the current tokio runtime and returns the
	/// submission handle.
	pub fn spawn<B>(config: BatchConfig, processor: B) -> Self
	where
		B: BatchProcessor<K, P>,
	{
		let (tx, rx) = mpsc::unbounded_channel();
		let (state_tx, state_rx) = watch::channel(QueueState::Idle);
		let cancel = CancellationToken::new();
		let metrics = Arc::new(QueueMetrics::default());

		let driver = Driver {
			config,
			rx,
			state: state_tx,
			cancel: cancel.clone(),
			metrics: Arc::clone(&metrics),
			processor,
			pending: HashMap::new(),
		};
		tokio::spawn(driver.run());

		Self {
			tx,
			cancel,
			state_rx,
			metrics,
		}
	}

	/// Records `(key, payload)` for the next batch. Non-blocking; a payload
	/// already pending for `key` is overwritten (last write wins).
	pub fn enqueue(&self, key: K, payload: P) -> Result<(), QueueError> {
		if self.cancel.is_cancelled() {
			return Err(QueueError::Disposed);
		}
		self.tx
			.send(Op::Enqueue(key, payload))
			.map_err(|_| QueueError::Disposed)
	}

	/// Releases the pending set without waiting out the quiescence window.
	/// A no-op when nothing is pending.
	pub fn flush(&self) -> Result<(), QueueError> {
		if self.cancel.is_cancelled() {
			return Err(QueueError::Disposed);
		}
		self.tx.send(Op::Flush).map_err(|_| QueueError::Disposed)
	}

	/// Current lifecycle state.
	pub fn state(&self) -> QueueState {
		*self.state_rx.borrow()
	}

	/// Watch channel following state transitions.
	pub fn state_watch(&self) -> watch::Receiver<QueueState> {
		self.state_rx.clone()
	}

	/// Activity counters.
	pub fn metrics(&self) -> &QueueMetrics {
		&self.metrics
	}

	/// Cancels any in-flight batch via its token and discards pending items.
	/// Subsequent submissions return [`QueueError::Disposed`].
	pub fn dispose(&self) {
		self.cancel.cancel();
	}
}

#[derive(Default)]
struct DrainOutcome {
	flush_requested: bool,
	closed: bool,
}

struct Driver<K, P, B> {
	config: BatchConfig,
	rx: mpsc::UnboundedReceiver<Op<K, P>>,
	state: watch::Sender<QueueState>,
	cancel: CancellationToken,
	metrics: Arc<QueueMetrics>,
	processor: B,
	pending: HashMap<K, P>,
}

impl<K, P, B> Driver<K, P, B>
where
	K: Eq + Hash + Send + 'static,
	P: Send + 'static,
	B: BatchProcessor<K, P>,
{
	async fn run(mut self) {
		'main: loop {
			// Idle until the first enqueue of a window.
			if self.pending.is_empty() {
				self.set_state(QueueState::Idle);
				let op = tokio::select! {
					_ = self.cancel.cancelled() => break,
					op = self.rx.recv() => op,
				};
				match op {
					Some(Op::Enqueue(key, payload)) => self.record(key, payload),
					// Flush with nothing pending is a no-op.
					Some(Op::Flush) => continue,
					None => break,
				}
			}

			// Quiescence: every enqueue restarts the full window.
			self.set_state(QueueState::AwaitingQuiescence);
			let mut deadline = Instant::now() + self.config.quiescence;
			loop {
				tokio::select! {
					_ = self.cancel.cancelled() => break 'main,
					_ = time::sleep_until(deadline) => break,
					op = self.rx.recv() => match op {
						Some(Op::Enqueue(key, payload)) => {
							self.record(key, payload);
							deadline = Instant::now() + self.config.quiescence;
						}
						Some(Op::Flush) => break,
						None => break 'main,
					},
				}
			}

			// Draining; a flush received mid-batch releases the follow-up
			// batch without waiting out another window.
			loop {
				let outcome = self.drain().await;
				if self.cancel.is_cancelled() || outcome.closed {
					break 'main;
				}
				if !outcome.flush_requested || self.pending.is_empty() {
					break;
				}
			}
		}

		debug!(discarded = self.pending.len(), "batch queue driver exiting");
	}

	/// Snapshots and clears the pending set, then runs the processor while
	/// still accepting submissions for the next window. An in-flight batch is
	/// never cancelled by new submissions, only by disposal.
	async fn drain(&mut self) -> DrainOutcome {
		self.set_state(QueueState::Draining);
		let batch: Vec<(K, P)> = self.pending.drain().collect();
		self.metrics.batches.fetch_add(1, Ordering::Relaxed);
		debug!(items = batch.len(), "releasing batch");

		let mut outcome = DrainOutcome::default();
		let mut process = pin!(self.processor.process(batch, &self.cancel));
		loop {
			tokio::select! {
				_ = process.as_mut() => break,
				op = self.rx.recv() => match op {
					Some(Op::Enqueue(key, payload)) => {
						if self.pending.insert(key, payload).is_some() {
							self.metrics.coalesced.fetch_add(1, Ordering::Relaxed);
						}
						self.metrics.enqueued.fetch_add(1, Ordering::Relaxed);
					}
					Some(Op::Flush) => outcome.flush_requested = true,
					None => {
						// All handles dropped: same as disposal. Let the
						// processor observe the cancellation and finish.
						outcome.closed = true;
						self.cancel.cancel();
						process.as_mut().await;
						break;
					}
				},
			}
		}
		outcome
	}

	fn record(&mut self, key: K, payload: P) {
		if self.pending.insert(key, payload).is_some() {
			self.metrics.coalesced.fetch_add(1, Ordering::Relaxed);
		}
		self.metrics.enqueued.fetch_add(1, Ordering::Relaxed);
	}

	fn set_state(&self, state: QueueState) {
		self.state.send_replace(state);
	}
}
