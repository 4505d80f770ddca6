//! Versioned result caching for expensive per-document computations.
//!
//! Goals:
//! - get-or-compute keyed by `(key, version stamp)`; a completed entry is
//!   returned only for the exact stamp it was computed from
//! - single-flight per key: concurrent requesters attach to the existing
//!   in-flight computation instead of starting a duplicate
//! - one computation outcome (value, failure, or cancellation) fans out to
//!   every attached waiter
//! - a failed or cancelled computation reverts the entry to not-started so a
//!   later request may retry from scratch

mod cache;

pub use cache::{CacheError, VersionedCache};
