use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use super::{CacheError, VersionedCache};

type StrCache = VersionedCache<&'static str, u64, String>;

/// Compute function that counts invocations and returns `value`.
fn counted(
	calls: &Arc<AtomicUsize>,
	value: &str,
) -> impl Future<Output = anyhow::Result<String>> + use<> {
	let calls = Arc::clone(calls);
	let value = value.to_string();
	async move {
		calls.fetch_add(1, Ordering::SeqCst);
		Ok(value)
	}
}

async fn settle() {
	for _ in 0..8 {
		tokio::task::yield_now().await;
	}
}

#[tokio::test]
async fn completed_entry_served_without_recompute() {
	let cache = StrCache::new();
	let calls = Arc::new(AtomicUsize::new(0));
	let cancel = CancellationToken::new();

	let first = cache
		.get_or_compute("a", 1, || counted(&calls, "X"), &cancel)
		.await
		.expect("computed");
	assert_eq!(*first, "X");

	let second = cache
		.get_or_compute("a", 1, || counted(&calls, "Y"), &cancel)
		.await
		.expect("cached");
	assert_eq!(*second, "X");
	assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn differing_stamp_triggers_recompute() {
	let cache = StrCache::new();
	let calls = Arc::new(AtomicUsize::new(0));
	let cancel = CancellationToken::new();

	let v1 = cache
		.get_or_compute("a", 1, || counted(&calls, "X"), &cancel)
		.await
		.expect("computed");
	assert_eq!(*v1, "X");

	let v2 = cache
		.get_or_compute("a", 2, || counted(&calls, "Y"), &cancel)
		.await
		.expect("recomputed");
	assert_eq!(*v2, "Y");
	assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn stale_value_never_returned_for_new_stamp() {
	let cache = StrCache::new();
	let calls = Arc::new(AtomicUsize::new(0));
	let cancel = CancellationToken::new();

	cache
		.get_or_compute("a", 1, || counted(&calls, "old"), &cancel)
		.await
		.expect("computed");

	// The stamp-2 request supersedes the stamp-1 entry; a later stamp-1
	// request recomputes rather than resurrecting the old value.
	let v2 = cache
		.get_or_compute("a", 2, || counted(&calls, "new"), &cancel)
		.await
		.expect("recomputed");
	assert_eq!(*v2, "new");

	let v1_again = cache
		.get_or_compute("a", 1, || counted(&calls, "old-again"), &cancel)
		.await
		.expect("recomputed");
	assert_eq!(*v1_again, "old-again");
	assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn concurrent_requesters_share_one_computation() {
	let cache = Arc::new(StrCache::new());
	let calls = Arc::new(AtomicUsize::new(0));
	let gate = Arc::new(Semaphore::new(0));
	let cancel = CancellationToken::new();

	let mut handles = Vec::new();
	for _ in 0..4 {
		let cache = Arc::clone(&cache);
		let calls = Arc::clone(&calls);
		let gate = Arc::clone(&gate);
		let cancel = cancel.clone();
		handles.push(tokio::spawn(async move {
			cache
				.get_or_compute(
					"doc",
					1,
					|| {
						let calls = Arc::clone(&calls);
						let gate = Arc::clone(&gate);
						async move {
							calls.fetch_add(1, Ordering::SeqCst);
							let _permit = gate.acquire().await?;
							Ok("artifact".to_string())
						}
					},
					&cancel,
				)
				.await
		}));
	}

	// Let every requester reach the store before releasing the computation.
	settle().await;
	gate.add_permits(1);

	for handle in handles {
		let value = handle.await.expect("join").expect("value");
		assert_eq!(*value, "artifact");
	}
	assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn failure_fans_out_to_all_waiters_and_entry_reverts() {
	let cache = Arc::new(StrCache::new());
	let gate = Arc::new(Semaphore::new(0));
	let cancel = CancellationToken::new();

	let mut handles = Vec::new();
	for _ in 0..2 {
		let cache = Arc::clone(&cache);
		let gate = Arc::clone(&gate);
		let cancel = cancel.clone();
		handles.push(tokio::spawn(async move {
			cache
				.get_or_compute(
					"doc",
					1,
					|| {
						let gate = Arc::clone(&gate);
						async move {
							let _permit = gate.acquire().await?;
							Err(anyhow::anyhow!("analyzer exploded"))
						}
					},
					&cancel,
				)
				.await
		}));
	}

	settle().await;
	gate.add_permits(1);

	for handle in handles {
		let err = handle.await.expect("join").expect_err("failure");
		match err {
			CacheError::Failed(inner) => assert!(inner.to_string().contains("analyzer exploded")),
			other => panic!("expected Failed, got {other:?}"),
		}
	}

	// Entry reverted to not-started; the next request recomputes.
	assert!(cache.is_empty());
	let calls = Arc::new(AtomicUsize::new(0));
	let value = cache
		.get_or_compute("doc", 1, || counted(&calls, "ok"), &cancel)
		.await
		.expect("retry succeeds");
	assert_eq!(*value, "ok");
}

#[tokio::test]
async fn leader_cancellation_reaches_every_waiter() {
	let cache = Arc::new(StrCache::new());
	let gate = Arc::new(Semaphore::new(0));
	let leader_cancel = CancellationToken::new();
	let waiter_cancel = CancellationToken::new();

	let leader = {
		let cache = Arc::clone(&cache);
		let gate = Arc::clone(&gate);
		let cancel = leader_cancel.clone();
		tokio::spawn(async move {
			cache
				.get_or_compute(
					"doc",
					1,
					|| {
						let gate = Arc::clone(&gate);
						async move {
							let _permit = gate.acquire().await?;
							Ok("never".to_string())
						}
					},
					&cancel,
				)
				.await
		})
	};
	settle().await;

	let waiter = {
		let cache = Arc::clone(&cache);
		let cancel = waiter_cancel.clone();
		tokio::spawn(async move {
			cache
				.get_or_compute("doc", 1, || async { Ok("other".to_string()) }, &cancel)
				.await
		})
	};
	settle().await;

	leader_cancel.cancel();

	assert!(matches!(
		leader.await.expect("join"),
		Err(CacheError::Cancelled)
	));
	assert!(matches!(
		waiter.await.expect("join"),
		Err(CacheError::Cancelled)
	));
	assert!(cache.is_empty());
}

#[tokio::test]
async fn waiter_cancellation_leaves_computation_running() {
	let cache = Arc::new(StrCache::new());
	let calls = Arc::new(AtomicUsize::new(0));
	let gate = Arc::new(Semaphore::new(0));
	let leader_cancel = CancellationToken::new();
	let waiter_cancel = CancellationToken::new();

	let leader = {
		let cache = Arc::clone(&cache);
		let calls = Arc::clone(&calls);
		let gate = Arc::clone(&gate);
		let cancel = leader_cancel.clone();
		tokio::spawn(async move {
			cache
				.get_or_compute(
					"doc",
					1,
					|| {
						let calls = Arc::clone(&calls);
						let gate = Arc::clone(&gate);
						async move {
							calls.fetch_add(1, Ordering::SeqCst);
							let _permit = gate.acquire().await?;
							Ok("artifact".to_string())
						}
					},
					&cancel,
				)
				.await
		})
	};
	settle().await;

	let waiter = {
		let cache = Arc::clone(&cache);
		let cancel = waiter_cancel.clone();
		tokio::spawn(async move {
			cache
				.get_or_compute("doc", 1, || async { Ok("other".to_string()) }, &cancel)
				.await
		})
	};
	settle().await;

	// Only the canceller's own wait is affected.
	waiter_cancel.cancel();
	assert!(matches!(
		waiter.await.expect("join"),
		Err(CacheError::Cancelled)
	));

	gate.add_permits(1);
	let value = leader.await.expect("join").expect("value");
	assert_eq!(*value, "artifact");

	// The completed entry is served without recomputation.
	let again = cache
		.get_or_compute("doc", 1, || counted(&calls, "Y"), &leader_cancel)
		.await
		.expect("cached");
	assert_eq!(*again, "artifact");
	assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn dropped_leader_unsticks_waiters_and_entry() {
	let cache = Arc::new(StrCache::new());
	let gate = Arc::new(Semaphore::new(0));
	let cancel = CancellationToken::new();

	let leader = {
		let cache = Arc::clone(&cache);
		let gate = Arc::clone(&gate);
		let cancel = cancel.clone();
		tokio::spawn(async move {
			cache
				.get_or_compute(
					"doc",
					1,
					|| {
						let gate = Arc::clone(&gate);
						async move {
							let _permit = gate.acquire().await?;
							Ok("never".to_string())
						}
					},
					&cancel,
				)
				.await
		})
	};
	settle().await;

	let waiter = {
		let cache = Arc::clone(&cache);
		let cancel = cancel.clone();
		tokio::spawn(async move {
			cache
				.get_or_compute("doc", 1, || async { Ok("other".to_string()) }, &cancel)
				.await
		})
	};
	settle().await;

	leader.abort();
	assert!(matches!(
		waiter.await.expect("join"),
		Err(CacheError::Cancelled)
	));
	assert!(cache.is_empty());

	// The key is retryable after the aborted computation.
	let calls = Arc::new(AtomicUsize::new(0));
	let value = cache
		.get_or_compute("doc", 1, || counted(&calls, "fresh"), &cancel)
		.await
		.expect("retry succeeds");
	assert_eq!(*value, "fresh");
}

#[tokio::test]
async fn invalidate_and_clear_remove_entries() {
	let cache = StrCache::new();
	let calls = Arc::new(AtomicUsize::new(0));
	let cancel = CancellationToken::new();

	cache
		.get_or_compute("a", 1, || counted(&calls, "X"), &cancel)
		.await
		.expect("computed");
	cache
		.get_or_compute("b", 1, || counted(&calls, "Y"), &cancel)
		.await
		.expect("computed");
	assert_eq!(cache.len(), 2);

	assert!(cache.invalidate(&"a"));
	assert!(!cache.invalidate(&"a"));
	assert_eq!(cache.len(), 1);

	cache
		.get_or_compute("a", 1, || counted(&calls, "X2"), &cancel)
		.await
		.expect("recomputed");
	assert_eq!(calls.load(Ordering::SeqCst), 3);

	cache.clear();
	assert!(cache.is_empty());
}
