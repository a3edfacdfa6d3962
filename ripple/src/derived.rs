//! `DerivedCell[T]`: the lazy (or eager) cache of a pure computation over
//! other nodes.

use std::{
	cell::RefCell,
	collections::HashSet,
	panic::{catch_unwind, AssertUnwindSafe},
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc, Weak,
	},
};

use parking_lot::RwLock;
use ripple_core::{subscription::Subscription, Dependent, NodeId, Notifier, SubscriptionList};

use crate::{error::CycleError, runtime};

type Listener<T> = dyn Fn(&T, &T) + Send + Sync;

thread_local! {
	/// Node ids currently mid-`compute()` on *this* thread. A node appearing
	/// here while its own `get` is re-entered (synchronously, on the same
	/// thread) is exactly the cycle we need to detect — a concurrent *other*
	/// thread racing for the same node's write lock is legitimate
	/// contention, not a cycle, and is left to the lock.
	static IN_PROGRESS: RefCell<HashSet<NodeId>> = RefCell::new(HashSet::new());
}

/// Whether a [`DerivedCell`] recomputes eagerly in the background as soon
/// as a dependency changes, or lazily on its next read.
///
/// A cell with `Mode::Lazy` still recomputes eagerly once it gains its first
/// live subscriber, so watchers never see a stale value; `Mode::Eager`
/// simply opts in unconditionally, even with zero subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
	/// Recompute only when next read.
	Lazy,
	/// Recompute in the background as soon as a dependency changes.
	Eager,
}

fn default_mode(rt: &runtime::RuntimeInner) -> Mode {
	if rt.options.eager_by_default {
		Mode::Eager
	} else {
		Mode::Lazy
	}
}

struct Inner<T> {
	id: NodeId,
	compute: Box<dyn Fn() -> Result<T, CycleError> + Send + Sync>,
	cached: RwLock<Option<T>>,
	dirty: AtomicBool,
	mode: Mode,
	subscribers: SubscriptionList<Listener<T>>,
	notifier: Notifier,
	runtime: Arc<runtime::RuntimeInner>,
	self_weak: Weak<Inner<T>>,
}

/// A read-only reactive value computed from other nodes, cached until one
/// of its dependencies changes.
pub struct DerivedCell<T> {
	inner: Arc<Inner<T>>,
}

impl<T> Clone for DerivedCell<T> {
	fn clone(&self) -> Self {
		Self {
			inner: self.inner.clone(),
		}
	}
}

impl<T: Clone + PartialEq + Send + Sync + 'static> DerivedCell<T> {
	/// Constructs a derived cell bound to the ambient runtime. Lazy unless
	/// the runtime's [`RuntimeOptions::eager_by_default`](crate::RuntimeOptions::eager_by_default)
	/// is set, in which case it behaves as [`Self::new_eager`] would.
	pub fn new(compute: impl Fn() -> T + Send + Sync + 'static) -> Result<Self, crate::RuntimeError> {
		let rt = runtime::current()?;
		let mode = default_mode(&rt);
		Ok(Self::build(rt, Box::new(move || Ok(compute())), mode))
	}

	/// Constructs a derived cell that recomputes in the background as soon
	/// as a dependency changes, without waiting for a read, regardless of
	/// the runtime's default.
	pub fn new_eager(
		compute: impl Fn() -> T + Send + Sync + 'static,
	) -> Result<Self, crate::RuntimeError> {
		let rt = runtime::current()?;
		Ok(Self::build(rt, Box::new(move || Ok(compute())), Mode::Eager))
	}

	/// Like [`Self::new`], but for a compute closure that can itself
	/// surface a nested [`CycleError`] (e.g. one produced by reading another
	/// `DerivedCell` via `?`) instead of panicking on it. Used by the
	/// combinators in [`crate::combinators`] so a cycle propagates through
	/// `get()`'s `Result` the same way it does for a hand-written cell.
	pub(crate) fn new_fallible(
		compute: impl Fn() -> Result<T, CycleError> + Send + Sync + 'static,
	) -> Result<Self, crate::RuntimeError> {
		let rt = runtime::current()?;
		let mode = default_mode(&rt);
		Ok(Self::build(rt, Box::new(compute), mode))
	}

	fn build(
		rt: Arc<runtime::RuntimeInner>,
		compute: Box<dyn Fn() -> Result<T, CycleError> + Send + Sync>,
		mode: Mode,
	) -> Self {
		let inner = Arc::new_cyclic(|weak| Inner {
			id: NodeId::fresh(),
			compute,
			cached: RwLock::new(None),
			dirty: AtomicBool::new(true),
			mode,
			subscribers: SubscriptionList::new(),
			notifier: Notifier::new(),
			runtime: rt,
			self_weak: weak.clone(),
		});
		Self { inner }
	}

	pub(crate) fn id(&self) -> NodeId {
		self.inner.id
	}

	/// Runs the fast (clean-cache) or slow (recompute) path and returns the
	/// resulting value, or [`CycleError`] if this thread re-entered its own
	/// computation.
	///
	/// A panic inside the compute closure propagates as an ordinary Rust
	/// panic (the node is left `dirty`, its computing marker cleared).
	pub fn get(&self) -> Result<T, CycleError> {
		Self::get_or_compute(&self.inner)
	}

	/// Reads the cached value without forcing recomputation, tracking this
	/// cell as a dependency. Returns the stale value if dirty, or `None` if
	/// never computed.
	pub fn peek(&self) -> Option<T> {
		self.inner.runtime.tracker.track_access(self.inner.id);
		self.inner.cached.read().clone()
	}

	/// Forces `dirty = true` and notifies dependents, without recomputing.
	/// Used to invalidate a stale cache from outside the dependency graph.
	pub fn invalidate(&self) {
		self.inner.dirty.store(true, Ordering::Release);
		self.inner
			.runtime
			.tracker
			.notify_dependents(self.inner.id);
	}

	/// Registers `listener` to run with `(new_value)` whenever
	/// recomputation actually changes the cached value.
	pub fn watch(&self, mut listener: impl FnMut(&T) + Send + Sync + 'static) -> Subscription {
		self.inner
			.subscribers
			.add(Arc::new(move |_old: &T, new: &T| listener(new)))
	}

	/// Registers `listener` to run with `(old_value, new_value)`.
	pub fn watch_with_previous(
		&self,
		listener: impl Fn(&T, &T) + Send + Sync + 'static,
	) -> Subscription {
		self.inner.subscribers.add(Arc::new(listener))
	}

	fn get_or_compute(this: &Arc<Inner<T>>) -> Result<T, CycleError> {
		this.runtime.tracker.track_access(this.id);

		if !this.dirty.load(Ordering::Acquire) {
			if let Some(value) = this.cached.read().clone() {
				return Ok(value);
			}
		}

		let already_in_progress =
			IN_PROGRESS.with(|set| !set.borrow_mut().insert(this.id));
		if already_in_progress {
			return Err(CycleError);
		}
		struct InProgressGuard(NodeId);
		impl Drop for InProgressGuard {
			fn drop(&mut self) {
				IN_PROGRESS.with(|set| {
					set.borrow_mut().remove(&self.0);
				});
			}
		}
		let _guard = InProgressGuard(this.id);

		let mut cached = this.cached.write();
		if !this.dirty.load(Ordering::Acquire) {
			if let Some(value) = cached.clone() {
				return Ok(value);
			}
		}

		let dependent: Arc<dyn Dependent> = this.clone();
		this.runtime.tracker.start_tracking(&dependent);
		let compute_result = catch_unwind(AssertUnwindSafe(|| (this.compute)()));
		this.runtime.tracker.stop_tracking();

		let new_value = match compute_result {
			Ok(Ok(value)) => value,
			// A nested cycle surfaced through the Result instead of a panic
			// (see `new_fallible`): leave this node exactly as a panic would
			// have (dirty, lock and in-progress marker dropped on return).
			Ok(Err(cycle)) => return Err(cycle),
			Err(payload) => std::panic::resume_unwind(payload),
		};

		let old_value = cached.clone();
		let changed = old_value.as_ref() != Some(&new_value);
		*cached = Some(new_value.clone());
		this.dirty.store(false, Ordering::Release);
		drop(cached);

		if changed {
			let old_for_listeners = old_value.unwrap_or_else(|| new_value.clone());
			let new_for_listeners = new_value.clone();
			let id = this.id;
			let tracker = &this.runtime.tracker;
			let subscribers = &this.subscribers;
			this.notifier.notify(id, tracker, || {
				subscribers.for_each(|listener| {
					let result = catch_unwind(AssertUnwindSafe(|| {
						listener(&old_for_listeners, &new_for_listeners);
					}));
					if result.is_err() {
						tracing::error!(node = ?id, "derived cell watcher panicked");
					}
				});
			});
		}

		Ok(new_value)
	}
}

impl<T: Clone + PartialEq + Send + Sync + 'static> Dependent for Inner<T> {
	fn id(&self) -> NodeId {
		self.id
	}

	fn on_dependency_changed(&self) {
		if self
			.dirty
			.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
			.is_err()
		{
			return;
		}
		self.runtime.tracker.notify_dependents(self.id);

		let eager = self.mode == Mode::Eager || !self.subscribers.is_empty();
		if eager {
			if let Some(strong) = self.self_weak.upgrade() {
				self.runtime.executor.spawn(move || {
					let _ = DerivedCell::<T>::get_or_compute(&strong);
				});
			}
		}
	}
}
