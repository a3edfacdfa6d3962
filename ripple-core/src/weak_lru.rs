//! The small bounded cache used by the `flatMap` combinator to memoise
//! "inner node selected by outer key" lookups, without keeping the outer
//! key (or its selected inner node) alive past the user's own references.

use std::{
	num::NonZeroUsize,
	sync::{Arc, Weak},
};

use lru::LruCache;
use parking_lot::Mutex;

/// A bounded, access-ordered cache keyed by the *identity* of an `Arc<K>`,
/// held weakly: once nothing but this cache references the key, the entry
/// is treated as gone even if the size cap has not been reached yet.
///
/// Grounded in the `lru` crate usage seen across the pack (e.g.
/// `project-blinc-Blinc`, `DioxusLabs-dioxus`), composed with `Weak` keys
/// since `lru::LruCache` itself has no notion of weak keys.
pub struct WeakKeyedLru<K: ?Sized, V> {
	entries: Mutex<LruCache<usize, (Weak<K>, V)>>,
}

impl<K: ?Sized, V: Clone> WeakKeyedLru<K, V> {
	/// Creates a cache holding at most `capacity` entries.
	#[must_use]
	pub fn new(capacity: NonZeroUsize) -> Self {
		Self {
			entries: Mutex::new(LruCache::new(capacity)),
		}
	}

	/// Returns the cached value for `key`'s identity, computing and
	/// inserting it via `make` on a miss (including a miss caused by the
	/// previous occupant's key having been dropped).
	pub fn get_or_insert_with(&self, key: &Arc<K>, make: impl FnOnce() -> V) -> V {
		let ptr = Arc::as_ptr(key) as *const () as usize;
		let mut entries = self.entries.lock();
		if let Some((weak, value)) = entries.get(&ptr) {
			if weak.upgrade().is_some() {
				return value.clone();
			}
		}
		let value = make();
		entries.put(ptr, (Arc::downgrade(key), value.clone()));
		value
	}

	/// Removes every entry whose key has been dropped. The cache also
	/// prunes such entries opportunistically on insert, so calling this is
	/// only needed to reclaim capacity proactively.
	pub fn prune_dead(&self) {
		let mut entries = self.entries.lock();
		let dead: Vec<usize> = entries
			.iter()
			.filter(|(_, (weak, _))| weak.strong_count() == 0)
			.map(|(ptr, _)| *ptr)
			.collect();
		for ptr in dead {
			entries.pop(&ptr);
		}
	}

	/// Current number of entries, live or not-yet-pruned-dead.
	#[must_use]
	pub fn len(&self) -> usize {
		self.entries.lock().len()
	}

	/// `true` iff the cache holds no entries.
	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}
