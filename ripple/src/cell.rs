//! `Cell[T]`: the mutable, atomic-slot reactive node.

use std::{
	panic::{catch_unwind, AssertUnwindSafe},
	sync::Arc,
};

use parking_lot::Mutex;
use ripple_core::{id::NodeId, subscription::Subscription, Notifier, SubscriptionList};

use crate::{error::RuntimeError, runtime};

type Listener<T> = dyn Fn(&T, &T) + Send + Sync;

struct Inner<T> {
	id: NodeId,
	value: Mutex<T>,
	notifier: Notifier,
	subscribers: SubscriptionList<Listener<T>>,
	runtime: Arc<runtime::RuntimeInner>,
}

/// A writable reactive value holder.
///
/// `set`/`update` only notify watchers and dependents when the new value is
/// unequal (by [`PartialEq`]) to the old one — the equality gate that keeps
/// re-assigning the same value from rippling through the dependency graph.
pub struct Cell<T> {
	inner: Arc<Inner<T>>,
}

impl<T> Clone for Cell<T> {
	fn clone(&self) -> Self {
		Self {
			inner: self.inner.clone(),
		}
	}
}

impl<T: Clone + PartialEq + Send + 'static> Cell<T> {
	/// Constructs a cell bound to the ambient runtime, failing with
	/// [`RuntimeError`] if none is initialised on this thread.
	pub fn new(initial: T) -> Result<Self, RuntimeError> {
		let rt = runtime::current()?;
		Ok(Self {
			inner: Arc::new(Inner {
				id: NodeId::fresh(),
				value: Mutex::new(initial),
				notifier: Notifier::new(),
				subscribers: SubscriptionList::new(),
				runtime: rt,
			}),
		})
	}

	pub(crate) fn id(&self) -> NodeId {
		self.inner.id
	}

	/// Reads the current value, registering this cell as a dependency of
	/// the surrounding computation (if any is in progress on this thread).
	pub fn get(&self) -> T {
		self.inner.runtime.tracker.track_access(self.inner.id);
		self.inner.value.lock().clone()
	}

	/// Reads the current value without registering a dependency.
	pub fn peek(&self) -> T {
		self.inner.value.lock().clone()
	}

	/// Replaces the value. Notifies watchers and dependents iff the new
	/// value is unequal to the old one.
	pub fn set(&self, new_value: T) {
		let mut guard = self.inner.value.lock();
		if *guard == new_value {
			return;
		}
		let old_value = std::mem::replace(&mut *guard, new_value.clone());
		drop(guard);
		self.publish(old_value, new_value);
	}

	/// Replaces the value with `f(&old)`, under the same equality gate as
	/// [`Self::set`]. `f` runs with the cell's lock held, so it must not
	/// re-enter this cell.
	pub fn update(&self, f: impl FnOnce(&T) -> T) {
		let mut guard = self.inner.value.lock();
		let new_value = f(&guard);
		if *guard == new_value {
			return;
		}
		let old_value = std::mem::replace(&mut *guard, new_value.clone());
		drop(guard);
		self.publish(old_value, new_value);
	}

	fn publish(&self, old_value: T, new_value: T) {
		let id = self.inner.id;
		let tracker = &self.inner.runtime.tracker;
		let subscribers = &self.inner.subscribers;
		self.inner.notifier.notify(id, tracker, || {
			subscribers.for_each(|listener| {
				let result = catch_unwind(AssertUnwindSafe(|| listener(&old_value, &new_value)));
				if result.is_err() {
					tracing::error!(node = ?id, "cell watcher panicked");
				}
			});
		});
	}

	/// Registers `listener` to run with `(new_value)` whenever [`Self::set`]
	/// / [`Self::update`] publishes a distinct value.
	pub fn watch(&self, mut listener: impl FnMut(&T) + Send + Sync + 'static) -> Subscription {
		self.inner
			.subscribers
			.add(Arc::new(move |_old: &T, new: &T| listener(new)))
	}

	/// Registers `listener` to run with `(old_value, new_value)` whenever
	/// [`Self::set`] / [`Self::update`] publishes a distinct value.
	pub fn watch_with_previous(
		&self,
		listener: impl Fn(&T, &T) + Send + Sync + 'static,
	) -> Subscription {
		self.inner.subscribers.add(Arc::new(listener))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::runtime::{Runtime, RuntimeOptions};
	use std::sync::atomic::{AtomicUsize, Ordering};

	#[test]
	fn equality_gate_suppresses_redundant_notifications() {
		Runtime::scoped(RuntimeOptions::default(), || {
			let c = Cell::new(5).unwrap();
			assert_eq!(c.get(), 5);

			let hits = Arc::new(AtomicUsize::new(0));
			let hits2 = hits.clone();
			let _sub = c.watch(move |_| {
				hits2.fetch_add(1, Ordering::SeqCst);
			});

			c.set(10);
			assert_eq!(hits.load(Ordering::SeqCst), 1);

			c.set(10);
			assert_eq!(hits.load(Ordering::SeqCst), 1, "equal value must not notify");
		});
	}

	#[test]
	fn watch_added_after_first_set_only_sees_later_changes() {
		Runtime::scoped(RuntimeOptions::default(), || {
			let c = Cell::new(1).unwrap();
			c.set(2);

			let hits = Arc::new(AtomicUsize::new(0));
			let hits2 = hits.clone();
			let _sub = c.watch(move |_| {
				hits2.fetch_add(1, Ordering::SeqCst);
			});
			c.set(2); // equal to current value
			assert_eq!(hits.load(Ordering::SeqCst), 0);

			c.set(3);
			assert_eq!(hits.load(Ordering::SeqCst), 1);
		});
	}

	#[test]
	fn update_uses_the_same_equality_gate() {
		Runtime::scoped(RuntimeOptions::default(), || {
			let c = Cell::new(1).unwrap();
			let hits = Arc::new(AtomicUsize::new(0));
			let hits2 = hits.clone();
			let _sub = c.watch(move |_| {
				hits2.fetch_add(1, Ordering::SeqCst);
			});
			c.update(|v| *v); // unchanged
			assert_eq!(hits.load(Ordering::SeqCst), 0);
			c.update(|v| v + 1);
			assert_eq!(c.get(), 2);
			assert_eq!(hits.load(Ordering::SeqCst), 1);
		});
	}

	#[test]
	fn watch_with_previous_sees_both_values() {
		Runtime::scoped(RuntimeOptions::default(), || {
			let c = Cell::new(1).unwrap();
			let seen = Arc::new(Mutex::new(Vec::new()));
			let seen2 = seen.clone();
			let _sub = c.watch_with_previous(move |old, new| {
				seen2.lock().push((*old, *new));
			});
			c.set(2);
			c.set(5);
			assert_eq!(*seen.lock(), vec![(1, 2), (2, 5)]);
		});
	}

	#[test]
	fn construction_without_runtime_fails() {
		assert!(Cell::new(0).is_err());
	}
}
