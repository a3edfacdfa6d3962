//! `EffectRunner`: a side-effecting dependent that re-runs its body whenever
//! a dependency it read changes.

use std::{
	panic::{catch_unwind, AssertUnwindSafe},
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc, Weak,
	},
};

use parking_lot::Mutex;
use ripple_core::{Dependent, NodeId};

use crate::{error::RuntimeError, runtime};

struct Inner {
	id: NodeId,
	body: Mutex<Box<dyn FnMut() + Send>>,
	disposed: AtomicBool,
	runtime: Arc<runtime::RuntimeInner>,
	self_weak: Weak<Inner>,
}

/// A disposable handle to a running side effect.
///
/// Dropping the handle does *not* dispose the effect — it stays alive (and
/// keeps re-running) as long as the dependency tracker's weak back-edges
/// resolve, i.e. until [`EffectRunner::dispose`] is called explicitly or the
/// runtime itself is torn down.
pub struct EffectRunner {
	inner: Arc<Inner>,
}

impl Clone for EffectRunner {
	fn clone(&self) -> Self {
		Self {
			inner: self.inner.clone(),
		}
	}
}

impl EffectRunner {
	/// Creates a dependent handle, runs `body` once under tracking, and
	/// returns the resulting handle. `body` re-runs synchronously whenever
	/// one of the dependencies it read last time changes.
	pub fn new(body: impl FnMut() + Send + 'static) -> Result<Self, RuntimeError> {
		let rt = runtime::current()?;
		let inner = Arc::new_cyclic(|weak| Inner {
			id: NodeId::fresh(),
			body: Mutex::new(Box::new(body)),
			disposed: AtomicBool::new(false),
			runtime: rt,
			self_weak: weak.clone(),
		});
		Inner::run(&inner);
		Ok(Self { inner })
	}

	pub(crate) fn id(&self) -> NodeId {
		self.inner.id
	}

	/// Tears down the effect: clears its dependency back-edges and marks it
	/// disposed so a dependency change already queued for this node does
	/// not re-run the body.
	pub fn dispose(&self) {
		self.inner.disposed.store(true, Ordering::Release);
		self.inner.runtime.tracker.forget(self.inner.id);
	}

	/// `true` once [`Self::dispose`] has been called.
	#[must_use]
	pub fn is_disposed(&self) -> bool {
		self.inner.disposed.load(Ordering::Acquire)
	}
}

impl Inner {
	fn run(this: &Arc<Inner>) {
		if this.disposed.load(Ordering::Acquire) {
			return;
		}
		let dependent: Arc<dyn Dependent> = this.clone();
		this.runtime.tracker.start_tracking(&dependent);
		let result = catch_unwind(AssertUnwindSafe(|| (this.body.lock())()));
		this.runtime.tracker.stop_tracking();
		if let Err(payload) = result {
			tracing::error!(node = ?this.id, "effect body panicked");
			std::panic::resume_unwind(payload);
		}
	}
}

impl Dependent for Inner {
	fn id(&self) -> NodeId {
		self.id
	}

	fn on_dependency_changed(&self) {
		if self.disposed.load(Ordering::Acquire) {
			return;
		}
		if let Some(strong) = self.self_weak.upgrade() {
			Inner::run(&strong);
		}
	}
}
