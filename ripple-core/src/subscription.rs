//! Thread-safe, copy-on-write listener lists with idempotent disposables.

use std::sync::{
	atomic::{AtomicBool, AtomicU64, Ordering},
	Arc, Weak,
};

use parking_lot::Mutex;

struct Entry<L: ?Sized> {
	id: u64,
	disposed: Arc<AtomicBool>,
	listener: Arc<L>,
}

/// A copy-on-write list of listener handles, generic over the listener's
/// call signature (e.g. `dyn Fn(&T) + Send + Sync` or
/// `dyn Fn(&T, &T) + Send + Sync`).
///
/// Notification walks snapshot the current `Arc<Vec<_>>` (an `Arc::clone`,
/// not a deep copy) so that a listener disposing itself or another listener
/// mid-walk never invalidates the iterator; such concurrent dispose/add is
/// safe by construction.
pub struct SubscriptionList<L: ?Sized> {
	state: Arc<Mutex<Arc<Vec<Entry<L>>>>>,
	next_id: AtomicU64,
}

impl<L: ?Sized> Default for SubscriptionList<L> {
	fn default() -> Self {
		Self::new()
	}
}

impl<L: ?Sized> SubscriptionList<L> {
	/// Creates an empty list.
	#[must_use]
	pub fn new() -> Self {
		Self {
			state: Arc::new(Mutex::new(Arc::new(Vec::new()))),
			next_id: AtomicU64::new(1),
		}
	}

	/// Registers `listener` and returns a [`Subscription`] that removes it
	/// on disposal.
	pub fn add(&self, listener: Arc<L>) -> Subscription
	where
		L: Send + Sync + 'static,
	{
		let id = self.next_id.fetch_add(1, Ordering::Relaxed);
		let disposed = Arc::new(AtomicBool::new(false));
		{
			let mut guard = self.state.lock();
			let mut next = Vec::with_capacity(guard.len() + 1);
			next.extend(guard.iter().map(|e| Entry {
				id: e.id,
				disposed: e.disposed.clone(),
				listener: e.listener.clone(),
			}));
			next.push(Entry {
				id,
				disposed: disposed.clone(),
				listener,
			});
			*guard = Arc::new(next);
		}
		let owner: Weak<dyn RemoveById> = Arc::downgrade(&self.state);
		Subscription { id, disposed, owner }
	}

	/// Snapshot-iterates the current listeners, skipping any already
	/// disposed (lazily filtered, since a concurrent `dispose` may not have
	/// reached the eager-removal step yet for this particular snapshot).
	pub fn for_each(&self, mut f: impl FnMut(&L)) {
		let snapshot = self.state.lock().clone();
		for entry in snapshot.iter() {
			if !entry.disposed.load(Ordering::Acquire) {
				f(&entry.listener);
			}
		}
	}

	/// Number of listeners not yet disposed. Used by eager-mode `DerivedCell`
	/// to decide whether it has live subscribers.
	#[must_use]
	pub fn len(&self) -> usize {
		self.state
			.lock()
			.iter()
			.filter(|e| !e.disposed.load(Ordering::Acquire))
			.count()
	}

	/// `true` iff there are no live listeners.
	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

/// An opaque, idempotent disposable tied to exactly one listener
/// registration (in a [`SubscriptionList`]) or one node (for effects).
///
/// `dispose` never panics and never invokes the listener again once it
/// returns, even if a notification pass was already in flight on another
/// thread — such an in-flight pass may observe the listener at most once
/// more.
#[must_use = "dropping a Subscription does not dispose it; call dispose() explicitly"]
pub struct Subscription {
	id: u64,
	disposed: Arc<AtomicBool>,
	owner: Weak<dyn RemoveById>,
}

trait RemoveById: Send + Sync {
	fn remove(&self, id: u64);
}

impl<L: Send + Sync + ?Sized + 'static> RemoveById for Mutex<Arc<Vec<Entry<L>>>> {
	fn remove(&self, id: u64) {
		let mut guard = self.lock();
		if guard.iter().any(|e| e.id == id) {
			let next: Vec<Entry<L>> = guard
				.iter()
				.filter(|e| e.id != id)
				.map(|e| Entry {
					id: e.id,
					disposed: e.disposed.clone(),
					listener: e.listener.clone(),
				})
				.collect();
			*guard = Arc::new(next);
		}
	}
}

impl Subscription {
	/// Marks the listener as disposed (so in-flight notification snapshots
	/// stop calling it) and eagerly removes it from the owning list so
	/// future notifications never see it at all. Safe to call more than
	/// once; the second and later calls are no-ops.
	pub fn dispose(&self) {
		if self.disposed.swap(true, Ordering::AcqRel) {
			return;
		}
		if let Some(owner) = self.owner.upgrade() {
			owner.remove(self.id);
		}
	}

	/// `true` iff [`Self::dispose`] has already run.
	#[must_use]
	pub fn is_disposed(&self) -> bool {
		self.disposed.load(Ordering::Acquire)
	}
}
