//! Span aggregation across independent analyzers.
//!
//! Several contributors (one per language or analysis domain) produce span
//! lists for the same document; [`merge`] combines them into one
//! deterministic, deduplicated, ordered sequence, and [`ContributorRegistry`]
//! holds the explicit tag-to-contributor mapping the host populates at
//! startup.

mod merge;
mod registry;

pub use merge::{Span, merge};
pub use registry::{ContributorRegistry, SpanContributor};
