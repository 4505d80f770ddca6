//! Deduplicating span merge.
//!
//! # Merge Rules
//!
//! The concatenated input is sorted ascending by `(start, len)`, then a
//! single left-to-right pass drops zero-length spans and collapses exact
//! duplicates that became adjacent through the sort. Partially overlapping
//! but non-identical spans are preserved, not merged into a superspan:
//! downstream consumers render each distinct span separately, so this is
//! deliberately a deduplication merge, not an interval union.

/// Contiguous run of `len` units starting at `start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Span {
	pub start: u32,
	pub len: u32,
}

impl Span {
	pub const fn new(start: u32, len: u32) -> Self {
		Self { start, len }
	}

	/// Exclusive end position.
	pub const fn end(&self) -> u32 {
		self.start + self.len
	}

	pub const fn is_empty(&self) -> bool {
		self.len == 0
	}
}

/// Merges independently contributed span lists into one deterministic
/// sequence: ascending by `(start, len)`, empty spans removed, exact
/// duplicates collapsed to one occurrence.
///
/// Idempotent, and independent of contributor submission order: the sort key
/// is the full span, so the output depends only on the input multiset.
pub fn merge<I>(lists: I) -> Vec<Span>
where
	I: IntoIterator,
	I::Item: IntoIterator<Item = Span>,
{
	let mut all: Vec<Span> = lists.into_iter().flatten().collect();
	all.sort_unstable();

	let mut merged = Vec::with_capacity(all.len());
	for span in all {
		if span.is_empty() {
			continue;
		}
		// Duplicates are adjacent after the sort; only exact matches collapse.
		if merged.last() == Some(&span) {
			continue;
		}
		merged.push(span);
	}
	merged
}
