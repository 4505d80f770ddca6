//! Version-stamped entry map with shared in-flight computations.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Error surfaced by [`VersionedCache::get_or_compute`].
///
/// Clonable so one computation outcome can fan out to every waiter attached
/// to the same in-flight entry.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CacheError {
	/// Cancellation was observed, either by this caller's own token or by the
	/// shared computation itself.
	#[error("computation cancelled")]
	Cancelled,
	/// The supplied compute function failed. The entry reverts to not-started;
	/// a later request for the same key recomputes from scratch.
	#[error("computation failed: {0}")]
	Failed(Arc<anyhow::Error>),
}

type Outcome<V> = Result<Arc<V>, CacheError>;

enum Entry<S, V> {
	/// A computation has started but not completed. New requesters for the
	/// same `(key, stamp)` clone the receiver and await the published outcome.
	InFlight {
		stamp: S,
		rx: watch::Receiver<Option<Outcome<V>>>,
	},
	Completed {
		stamp: S,
		value: Arc<V>,
	},
}

enum Action<V> {
	Ready(Arc<V>),
	Attach(watch::Receiver<Option<Outcome<V>>>),
	Lead(watch::Sender<Option<Outcome<V>>>),
}

/// Per-key artifact store with version-stamped entries.
///
/// Stamps are compared for equality only; a request carrying a stamp that
/// differs from the stored one supersedes the old entry (readers holding the
/// old `Arc` keep it, the store just never returns it again).
pub struct VersionedCache<K, S, V> {
	entries: Mutex<HashMap<K, Entry<S, V>>>,
}

impl<K, S, V> Default for VersionedCache<K, S, V> {
	fn default() -> Self {
		Self::new()
	}
}

impl<K, S, V> fmt::Debug for VersionedCache<K, S, V> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("VersionedCache")
			.field("entries", &self.entries.lock().len())
			.finish()
	}
}

impl<K, S, V> VersionedCache<K, S, V> {
	/// Creates an empty store.
	pub fn new() -> Self {
		Self {
			entries: Mutex::new(HashMap::new()),
		}
	}

	/// Number of tracked entries (completed and in-flight).
	pub fn len(&self) -> usize {
		self.entries.lock().len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.lock().is_empty()
	}

	/// Drops every entry. In-flight computations still publish their outcome
	/// to attached waiters; the results are just not retained.
	pub fn clear(&self) {
		self.entries.lock().clear();
	}
}

impl<K, S, V> VersionedCache<K, S, V>
where
	K: Eq + Hash + Clone,
	S: Eq + Clone,
{
	/// Returns the cached value for `(key, stamp)` or computes it.
	///
	/// - Completed entry with an equal stamp: the value is returned
	///   immediately, without holding the map lock across the return.
	/// - In-flight entry with an equal stamp: attaches to the existing
	///   computation and receives its eventual outcome.
	/// - Otherwise: this caller becomes the leader, runs `compute` raced
	///   against `cancel`, publishes the outcome to attached waiters, and
	///   stores the value on success. On failure or cancellation the in-flight
	///   marker is removed so a subsequent call may retry.
	///
	/// Cancelling `cancel` while attached aborts only this caller's wait;
	/// the leader's token aborts the computation for every waiter.
	pub async fn get_or_compute<F, Fut>(
		&self,
		key: K,
		stamp: S,
		compute: F,
		cancel: &CancellationToken,
	) -> Result<Arc<V>, CacheError>
	where
		F: FnOnce() -> Fut,
		Fut: Future<Output = anyhow::Result<V>>,
	{
		let action = {
			let mut entries = self.entries.lock();
			match entries.get(&key) {
				Some(Entry::Completed { stamp: s, value }) if *s == stamp => {
					Action::Ready(Arc::clone(value))
				}
				Some(Entry::InFlight { stamp: s, rx }) if *s == stamp => Action::Attach(rx.clone()),
				// Missing, or a differing stamp: the old entry (if any) is
				// superseded here and never returned again.
				_ => {
					let (tx, rx) = watch::channel(None);
					entries.insert(
						key.clone(),
						Entry::InFlight {
							stamp: stamp.clone(),
							rx,
						},
					);
					Action::Lead(tx)
				}
			}
		};

		match action {
			Action::Ready(value) => Ok(value),
			Action::Attach(rx) => wait_attached(rx, cancel).await,
			Action::Lead(tx) => self.lead(key, stamp, tx, compute, cancel).await,
		}
	}

	async fn lead<F, Fut>(
		&self,
		key: K,
		stamp: S,
		tx: watch::Sender<Option<Outcome<V>>>,
		compute: F,
		cancel: &CancellationToken,
	) -> Result<Arc<V>, CacheError>
	where
		F: FnOnce() -> Fut,
		Fut: Future<Output = anyhow::Result<V>>,
	{
		// If this future is dropped mid-compute the guard removes the
		// in-flight marker; dropping `tx` closes the channel and waiters
		// observe cancellation.
		let mut guard = InFlightGuard {
			entries: &self.entries,
			key: &key,
			stamp: &stamp,
			armed: true,
		};

		let outcome: Outcome<V> = tokio::select! {
			_ = cancel.cancelled() => Err(CacheError::Cancelled),
			res = compute() => match res {
				Ok(value) => Ok(Arc::new(value)),
				Err(err) => Err(CacheError::Failed(Arc::new(err))),
			},
		};
		guard.armed = false;

		{
			let mut entries = self.entries.lock();
			// Only touch the entry if it is still this computation's marker;
			// a request with a newer stamp may have replaced it mid-flight.
			let ours = matches!(
				entries.get(&key),
				Some(Entry::InFlight { stamp: s, .. }) if *s == stamp
			);
			if ours {
				match &outcome {
					Ok(value) => {
						entries.insert(
							key.clone(),
							Entry::Completed {
								stamp: stamp.clone(),
								value: Arc::clone(value),
							},
						);
					}
					Err(_) => {
						entries.remove(&key);
					}
				}
			}
		}

		match &outcome {
			Err(CacheError::Failed(err)) => warn!(error = %err, "cache computation failed"),
			Err(CacheError::Cancelled) => debug!("cache computation cancelled"),
			Ok(_) => {}
		}

		let _ = tx.send(Some(outcome.clone()));
		outcome
	}

	/// Removes the entry for `key`, if any. Returns whether one was present.
	///
	/// Does not cancel an in-flight computation; its waiters still receive
	/// the outcome, the result is just not retained.
	pub fn invalidate(&self, key: &K) -> bool {
		self.entries.lock().remove(key).is_some()
	}
}

async fn wait_attached<V>(
	mut rx: watch::Receiver<Option<Outcome<V>>>,
	cancel: &CancellationToken,
) -> Result<Arc<V>, CacheError> {
	tokio::select! {
		_ = cancel.cancelled() => Err(CacheError::Cancelled),
		res = rx.wait_for(|slot| slot.is_some()) => match res {
			Ok(slot) => (*slot).clone().unwrap_or(Err(CacheError::Cancelled)),
			// Leader dropped without publishing; its guard already removed
			// the in-flight marker.
			Err(_) => Err(CacheError::Cancelled),
		},
	}
}

struct InFlightGuard<'a, K: Eq + Hash, S: Eq, V> {
	entries: &'a Mutex<HashMap<K, Entry<S, V>>>,
	key: &'a K,
	stamp: &'a S,
	armed: bool,
}

impl<K: Eq + Hash, S: Eq, V> Drop for InFlightGuard<'_, K, S, V> {
	fn drop(&mut self) {
		if !self.armed {
			return;
		}
		let mut entries = self.entries.lock();
		let ours = matches!(
			entries.get(self.key),
			Some(Entry::InFlight { stamp, .. }) if stamp == self.stamp
		);
		if ours {
			entries.remove(self.key);
		}
	}
}

#[cfg(test)]
mod tests;
