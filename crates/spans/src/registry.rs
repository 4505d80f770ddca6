//! Explicit contributor registry.
//!
//! The host registers every analyzer under a language/domain tag at startup;
//! nothing is discovered ambiently. Collecting for a tag runs each registered
//! contributor and merges their outputs through [`merge`].

use std::collections::HashMap;
use std::sync::Arc;

use crate::merge::{Span, merge};

/// One analyzer contributing spans for an input document.
pub trait SpanContributor<T: ?Sized>: Send + Sync {
	/// Returns this contributor's spans for `input`. Order and duplicates
	/// are irrelevant; the merge normalizes both.
	fn contribute(&self, input: &T) -> Vec<Span>;
}

/// Tag-keyed mapping of registered contributors.
pub struct ContributorRegistry<T: ?Sized> {
	contributors: HashMap<String, Vec<Arc<dyn SpanContributor<T>>>>,
}

impl<T: ?Sized> Default for ContributorRegistry<T> {
	fn default() -> Self {
		Self::new()
	}
}

impl<T: ?Sized> ContributorRegistry<T> {
	pub fn new() -> Self {
		Self {
			contributors: HashMap::new(),
		}
	}

	/// Registers a contributor under `tag`. Multiple contributors per tag are
	/// allowed; each contributes independently.
	pub fn register(&mut self, tag: impl Into<String>, contributor: Arc<dyn SpanContributor<T>>) {
		self.contributors
			.entry(tag.into())
			.or_default()
			.push(contributor);
	}

	/// Runs every contributor registered for `tag` against `input` and merges
	/// their outputs. An unknown tag yields an empty set.
	pub fn collect(&self, tag: &str, input: &T) -> Vec<Span> {
		let Some(list) = self.contributors.get(tag) else {
			return Vec::new();
		};
		merge(list.iter().map(|contributor| contributor.contribute(input)))
	}

	/// Registered tags, in no particular order.
	pub fn tags(&self) -> impl Iterator<Item = &str> {
		self.contributors.keys().map(String::as_str)
	}

	pub fn is_empty(&self) -> bool {
		self.contributors.is_empty()
	}
}
