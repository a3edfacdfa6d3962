//! `map`/`flatMap`/`with`/`withValue`: small transforms over `Cell` and
//! `DerivedCell` reads, layered on top of the primitives in [`crate::cell`]
//! and [`crate::derived`].

use std::{num::NonZeroUsize, sync::Arc};

use ripple_core::WeakKeyedLru;

use crate::{
	cell::Cell,
	derived::DerivedCell,
	error::{CycleError, RuntimeError},
};

impl<T: Clone + PartialEq + Send + Sync + 'static> Cell<T> {
	/// Derives a new cached cell from this one: `result.get() == f(self.get())`,
	/// recomputed whenever `self` changes.
	pub fn map<U: Clone + PartialEq + Send + Sync + 'static>(
		&self,
		f: impl Fn(T) -> U + Send + Sync + 'static,
	) -> Result<DerivedCell<U>, RuntimeError> {
		let source = self.clone();
		DerivedCell::new(move || f(source.get()))
	}

	/// Tracked read transformed in place: equivalent to `f(self.get())`.
	pub fn with<U>(&self, f: impl FnOnce(&T) -> U) -> U {
		let value = self.get();
		f(&value)
	}

	/// Untracked read transformed in place: equivalent to `f(self.peek())`.
	pub fn with_value<U>(&self, f: impl FnOnce(&T) -> U) -> U {
		let value = self.peek();
		f(&value)
	}
}

impl<T: Clone + PartialEq + Send + Sync + 'static> DerivedCell<T> {
	/// Derives a new cached cell: `result.get() == f(self.get())`. A cycle
	/// observed on `self` surfaces through the returned cell's own `get()`
	/// as a `CycleError`, the same as it would for a hand-written cell.
	pub fn map<U: Clone + PartialEq + Send + Sync + 'static>(
		&self,
		f: impl Fn(T) -> U + Send + Sync + 'static,
	) -> Result<DerivedCell<U>, RuntimeError> {
		let source = self.clone();
		DerivedCell::new_fallible(move || source.get().map(&f))
	}

	/// Tracked read transformed in place. Returns `Err(CycleError)` rather
	/// than panicking if `self` observed a cycle.
	pub fn with<U>(&self, f: impl FnOnce(&T) -> U) -> Result<U, CycleError> {
		let value = self.get()?;
		Ok(f(&value))
	}

	/// Untracked read transformed in place. Falls back to a tracked `get()`
	/// (and so can surface `CycleError`, like [`Self::with`]) only if
	/// nothing has been cached yet.
	pub fn with_value<U>(&self, f: impl FnOnce(&T) -> U) -> Result<U, CycleError> {
		let value = match self.peek() {
			Some(value) => value,
			None => self.get()?,
		};
		Ok(f(&value))
	}
}

/// The memoisation table backing [`flat_map`]: outer key `k` (held by
/// `Arc` so identity and weak-reclamation are well-defined) maps to the
/// `DerivedCell` the mapper produced for it, invoked at most once per
/// currently-reachable `k`.
pub struct FlatMapCache<K: ?Sized, U> {
	entries: WeakKeyedLru<K, DerivedCell<U>>,
}

impl<K: ?Sized, U: Clone + PartialEq + Send + Sync + 'static> FlatMapCache<K, U> {
	/// Creates a cache bounded to `capacity` distinct live keys.
	#[must_use]
	pub fn new(capacity: NonZeroUsize) -> Self {
		Self {
			entries: WeakKeyedLru::new(capacity),
		}
	}
}

/// Builds a `DerivedCell` that reads `source` for a key, resolves that key
/// to an inner node via `mapper` (memoised per reachable key in `cache`),
/// and flattens through to the inner node's value.
///
/// `source` is read under tracking on every recomputation, so a change to
/// `source` re-selects (or re-uses, from `cache`) the inner node; a change
/// to the currently-selected inner node also triggers recomputation, since
/// reading it happens inside this `DerivedCell`'s own tracked compute.
pub fn flat_map<K, U>(
	source: Cell<Arc<K>>,
	cache: Arc<FlatMapCache<K, U>>,
	mapper: impl Fn(&Arc<K>) -> DerivedCell<U> + Send + Sync + 'static,
) -> Result<DerivedCell<U>, RuntimeError>
where
	K: Send + Sync + 'static,
	U: Clone + PartialEq + Send + Sync + 'static,
{
	DerivedCell::new_fallible(move || {
		let key = source.get();
		let inner = cache.entries.get_or_insert_with(&key, || mapper(&key));
		inner.get()
	})
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::runtime::{Runtime, RuntimeOptions};
	use parking_lot::RwLock;

	#[test]
	fn map_recomputes_from_the_source_cell() {
		Runtime::scoped(RuntimeOptions::default(), || {
			let c = Cell::new(3).unwrap();
			let doubled = c.map(|v| v * 2).unwrap();
			assert_eq!(doubled.get().unwrap(), 6);
			c.set(10);
			assert_eq!(doubled.get().unwrap(), 20);
		});
	}

	#[test]
	fn with_and_with_value_do_not_allocate_a_node() {
		Runtime::scoped(RuntimeOptions::default(), || {
			let c = Cell::new("abc".to_string()).unwrap();
			assert_eq!(c.with(|s| s.len()), 3);
			assert_eq!(c.with_value(|s| s.len()), 3);
		});
	}

	#[test]
	fn derived_with_and_with_value_propagate_a_cycle_as_an_error() {
		Runtime::scoped(RuntimeOptions::default(), || {
			let c = Cell::new(1).unwrap();
			let doubled = c.map(|v| v * 2).unwrap();
			assert_eq!(doubled.with(|v| *v).unwrap(), 2);
			assert_eq!(doubled.with_value(|v| *v).unwrap(), 2);

			let cell: Arc<RwLock<Option<DerivedCell<i32>>>> = Arc::new(RwLock::new(None));
			let cell_for_closure = cell.clone();
			let cyclic =
				DerivedCell::new_fallible(move || cell_for_closure.read().as_ref().unwrap().get())
					.unwrap();
			*cell.write() = Some(cyclic.clone());

			let mapped = cyclic.map(|v| v + 1).unwrap();
			assert!(
				mapped.get().is_err(),
				"a cycle in the source cell must surface as CycleError, not a panic"
			);
			assert!(cyclic.with(|v| *v).is_err());
			assert!(cyclic.with_value(|v| *v).is_err());
		});
	}

	#[test]
	fn flat_map_switches_inner_node_by_key() {
		Runtime::scoped(RuntimeOptions::default(), || {
			let a = Cell::new(1).unwrap();
			let b = Cell::new(100).unwrap();
			let a2 = a.clone();
			let b2 = b.clone();

			let key: Cell<Arc<&'static str>> = Cell::new(Arc::new("a")).unwrap();
			let cache = Arc::new(FlatMapCache::new(NonZeroUsize::new(4).unwrap()));
			let picked = flat_map(key.clone(), cache, move |k| {
				if **k == "a" {
					a2.map(|v| v).unwrap()
				} else {
					b2.map(|v| v).unwrap()
				}
			})
			.unwrap();

			assert_eq!(picked.get().unwrap(), 1);
			a.set(2);
			assert_eq!(picked.get().unwrap(), 2);

			key.set(Arc::new("b"));
			assert_eq!(picked.get().unwrap(), 100);
		});
	}
}
