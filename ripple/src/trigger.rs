//! `Trigger`: a stateless, valueless reactive event source.

use std::{
	panic::{catch_unwind, AssertUnwindSafe},
	sync::Arc,
};

use ripple_core::{id::NodeId, subscription::Subscription, Notifier, SubscriptionList};

use crate::{error::RuntimeError, runtime};

type Listener = dyn Fn() + Send + Sync;

struct Inner {
	id: NodeId,
	notifier: Notifier,
	subscribers: SubscriptionList<Listener>,
	runtime: Arc<runtime::RuntimeInner>,
}

/// A reactive event source that carries no value and has no cache or
/// equality gate: every [`Trigger::fire`] is an observable event, even if
/// identical in effect to the previous one.
pub struct Trigger {
	inner: Arc<Inner>,
}

impl Clone for Trigger {
	fn clone(&self) -> Self {
		Self {
			inner: self.inner.clone(),
		}
	}
}

impl Trigger {
	/// Constructs a trigger bound to the ambient runtime.
	pub fn new() -> Result<Self, RuntimeError> {
		let rt = runtime::current()?;
		Ok(Self {
			inner: Arc::new(Inner {
				id: NodeId::fresh(),
				notifier: Notifier::new(),
				subscribers: SubscriptionList::new(),
				runtime: rt,
			}),
		})
	}

	pub(crate) fn id(&self) -> NodeId {
		self.inner.id
	}

	/// Records this trigger as a dependency of the surrounding computation,
	/// without firing it.
	pub fn track(&self) {
		self.inner.runtime.tracker.track_access(self.inner.id);
	}

	/// Fires an event: runs direct listeners, then notifies tracked
	/// dependents. Always runs (no equality gate), unless suppressed by
	/// re-entrancy (a listener firing the same trigger again is ignored).
	pub fn fire(&self) {
		let id = self.inner.id;
		let tracker = &self.inner.runtime.tracker;
		let subscribers = &self.inner.subscribers;
		self.inner.notifier.notify(id, tracker, || {
			subscribers.for_each(|listener| {
				let result = catch_unwind(AssertUnwindSafe(listener));
				if result.is_err() {
					tracing::error!(node = ?id, "trigger listener panicked");
				}
			});
		});
	}

	/// Directly subscribes `listener` to this trigger's firings.
	pub fn watch(&self, listener: impl Fn() + Send + Sync + 'static) -> Subscription {
		self.inner.subscribers.add(Arc::new(listener))
	}
}

impl Default for Trigger {
	/// Panics if no runtime is ambient; prefer [`Trigger::new`] when a
	/// fallible constructor is wanted.
	fn default() -> Self {
		Self::new().expect("Trigger::default requires an ambient runtime")
	}
}
