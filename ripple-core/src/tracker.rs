//! The dependency tracker: a per-thread stack of computation contexts plus
//! the two process-wide interdependency maps described in the design notes
//! (`dependents[dep]` and `depsOf[dependent]`).
//!
//! This is a safe, `Weak`-keyed reimagining of `isoprenoid`'s
//! `Interdependencies` (`subscribers_by_dependency` / `all_by_dependent` /
//! `all_by_dependency`), without that module's raw-pointer `ASymbol`
//! callback tables — see DESIGN.md.

use std::{
	collections::{HashMap, HashSet},
	panic::{catch_unwind, AssertUnwindSafe},
	sync::{Arc, Weak},
	thread::{self, ThreadId},
};

use parking_lot::Mutex;

use crate::id::NodeId;

/// Anything that can sit on the dependent side of an edge: [`DerivedCell`],
/// [`ResourceCell`], or an effect handle.
///
/// [`DerivedCell`]: https://docs.rs/ripple/latest/ripple/struct.DerivedCell.html
/// [`ResourceCell`]: https://docs.rs/ripple/latest/ripple/struct.ResourceCell.html
pub trait Dependent: Send + Sync {
	/// This dependent's stable identity.
	fn id(&self) -> NodeId;

	/// Called by [`DependencyTracker::notify_dependents`] when one of this
	/// dependent's tracked dependencies has changed. Implementations decide
	/// for themselves whether to go dirty, re-fetch, or re-run.
	fn on_dependency_changed(&self);
}

struct Context {
	dependent_id: NodeId,
	dependent: Weak<dyn Dependent>,
	accumulated: HashSet<NodeId>,
}

#[derive(Default)]
struct Inner {
	/// `dependents[dep] = { dependent_id -> weak<Dependent> }`
	dependents: HashMap<NodeId, HashMap<NodeId, Weak<dyn Dependent>>>,
	/// `depsOf[dependent] = { dep_id, ... }`
	deps_of: HashMap<NodeId, HashSet<NodeId>>,
	/// One context stack per OS thread, so nested `start_tracking` calls on
	/// distinct threads never see each other's accumulated dependency set.
	stacks: HashMap<ThreadId, Vec<Context>>,
}

/// The dependency tracker owned by a [`crate::Executor`]/`Runtime`.
///
/// All reads are lock-free with respect to each other only in the sense
/// that the single internal mutex is held for the shortest possible spans;
/// true lock-free concurrent maps aren't needed here, only that reads and
/// recomputation never deadlock against each other.
pub struct DependencyTracker {
	inner: Mutex<Inner>,
}

impl Default for DependencyTracker {
	fn default() -> Self {
		Self::new()
	}
}

impl DependencyTracker {
	/// Creates an empty tracker.
	#[must_use]
	pub fn new() -> Self {
		Self {
			inner: Mutex::new(Inner::default()),
		}
	}

	/// Clears `depsOf[dependent]`, prunes stale back-edges for those former
	/// dependencies, then pushes a new context for `dependent` onto the
	/// calling thread's stack.
	pub fn start_tracking(&self, dependent: &Arc<dyn Dependent>) {
		let dependent_id = dependent.id();
		let weak: Weak<dyn Dependent> = Arc::downgrade(dependent);
		let mut inner = self.inner.lock();
		if let Some(old_deps) = inner.deps_of.remove(&dependent_id) {
			for dep in old_deps {
				if let Some(back_edges) = inner.dependents.get_mut(&dep) {
					back_edges.remove(&dependent_id);
				}
			}
		}
		let tid = thread::current().id();
		inner.stacks.entry(tid).or_default().push(Context {
			dependent_id,
			dependent: weak,
			accumulated: HashSet::new(),
		});
	}

	/// Records `dep` as a dependency of the context on top of the calling
	/// thread's stack, if any, registering a weak back-edge deduplicated by
	/// dependent identity.
	pub fn track_access(&self, dep: NodeId) {
		let tid = thread::current().id();
		let mut inner = self.inner.lock();
		let Some(stack) = inner.stacks.get_mut(&tid) else {
			return;
		};
		let Some(ctx) = stack.last_mut() else {
			return;
		};
		ctx.accumulated.insert(dep);
		let dependent_id = ctx.dependent_id;
		let weak = ctx.dependent.clone();
		inner
			.dependents
			.entry(dep)
			.or_default()
			.insert(dependent_id, weak);
	}

	/// Pops the calling thread's top context, installs its accumulated set
	/// as the new `depsOf[dependent]`, and returns that set.
	pub fn stop_tracking(&self) -> HashSet<NodeId> {
		let tid = thread::current().id();
		let mut inner = self.inner.lock();
		let Some(stack) = inner.stacks.get_mut(&tid) else {
			return HashSet::new();
		};
		let Some(ctx) = stack.pop() else {
			return HashSet::new();
		};
		if stack.is_empty() {
			inner.stacks.remove(&tid);
		}
		inner
			.deps_of
			.insert(ctx.dependent_id, ctx.accumulated.clone());
		ctx.accumulated
	}

	/// `true` iff the calling thread currently has an open tracking context
	/// (used by cycle detection to decide whether a read is "inside" a
	/// computation at all).
	#[must_use]
	pub fn is_tracking(&self) -> bool {
		let tid = thread::current().id();
		let inner = self.inner.lock();
		inner
			.stacks
			.get(&tid)
			.is_some_and(|stack| !stack.is_empty())
	}

	/// Snapshots the weak back-edge set for `dep`, drops cleared references,
	/// and invokes [`Dependent::on_dependency_changed`] on each live
	/// dependent. A panicking dependent is caught, logged, and never aborts
	/// the walk — mirroring the `Notifier`'s listener-failure semantics.
	pub fn notify_dependents(&self, dep: NodeId) {
		let snapshot: Vec<(NodeId, Weak<dyn Dependent>)> = {
			let mut inner = self.inner.lock();
			let Some(back_edges) = inner.dependents.get_mut(&dep) else {
				return;
			};
			back_edges.retain(|_, weak| weak.strong_count() > 0);
			back_edges
				.iter()
				.map(|(id, weak)| (*id, weak.clone()))
				.collect()
		};
		for (dependent_id, weak) in snapshot {
			let Some(strong) = weak.upgrade() else {
				continue;
			};
			let result = catch_unwind(AssertUnwindSafe(|| strong.on_dependency_changed()));
			if result.is_err() {
				tracing::error!(
					dependent = ?dependent_id,
					dependency = ?dep,
					"dependent panicked while handling a dependency change"
				);
			}
		}
	}

	/// Removes every trace of `dependent_id`: its `depsOf` entry and any
	/// back-edges pointing to it. Used when an effect or resource is
	/// disposed explicitly rather than merely dropped.
	pub fn forget(&self, dependent_id: NodeId) {
		let mut inner = self.inner.lock();
		if let Some(old_deps) = inner.deps_of.remove(&dependent_id) {
			for dep in old_deps {
				if let Some(back_edges) = inner.dependents.get_mut(&dep) {
					back_edges.remove(&dependent_id);
				}
			}
		}
	}

	/// Number of live back-edges currently registered for `dep` (test/debug
	/// helper).
	#[must_use]
	pub fn dependent_count(&self, dep: NodeId) -> usize {
		let inner = self.inner.lock();
		inner
			.dependents
			.get(&dep)
			.map_or(0, |edges| edges.values().filter(|w| w.strong_count() > 0).count())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::{AtomicUsize, Ordering};

	struct Counter {
		id: NodeId,
		hits: AtomicUsize,
	}

	impl Dependent for Counter {
		fn id(&self) -> NodeId {
			self.id
		}
		fn on_dependency_changed(&self) {
			self.hits.fetch_add(1, Ordering::SeqCst);
		}
	}

	fn counter() -> Arc<Counter> {
		Arc::new(Counter {
			id: NodeId::fresh(),
			hits: AtomicUsize::new(0),
		})
	}

	#[test]
	fn basic_tracking_and_notify() {
		let tracker = DependencyTracker::new();
		let dep = NodeId::fresh();
		let c = counter();
		let dyn_c: Arc<dyn Dependent> = c.clone();

		tracker.start_tracking(&dyn_c);
		tracker.track_access(dep);
		tracker.stop_tracking();

		assert_eq!(tracker.dependent_count(dep), 1);
		tracker.notify_dependents(dep);
		assert_eq!(c.hits.load(Ordering::SeqCst), 1);
	}

	#[test]
	fn retracking_clears_old_dependencies() {
		let tracker = DependencyTracker::new();
		let a = NodeId::fresh();
		let b = NodeId::fresh();
		let c = counter();
		let dyn_c: Arc<dyn Dependent> = c.clone();

		tracker.start_tracking(&dyn_c);
		tracker.track_access(a);
		tracker.stop_tracking();
		assert_eq!(tracker.dependent_count(a), 1);

		tracker.start_tracking(&dyn_c);
		tracker.track_access(b);
		tracker.stop_tracking();

		assert_eq!(tracker.dependent_count(a), 0);
		assert_eq!(tracker.dependent_count(b), 1);
	}

	#[test]
	fn nested_contexts_are_independent() {
		let tracker = DependencyTracker::new();
		let s1 = NodeId::fresh();
		let s2 = NodeId::fresh();
		let outer = counter();
		let inner = counter();
		let dyn_outer: Arc<dyn Dependent> = outer.clone();
		let dyn_inner: Arc<dyn Dependent> = inner.clone();

		tracker.start_tracking(&dyn_outer);
		tracker.track_access(s1);

		tracker.start_tracking(&dyn_inner);
		tracker.track_access(s2);
		tracker.stop_tracking();

		tracker.track_access(s1);
		tracker.stop_tracking();

		assert_eq!(tracker.dependent_count(s1), 1);
		assert_eq!(tracker.dependent_count(s2), 1);
	}

	#[test]
	fn dropped_dependent_is_pruned_lazily() {
		let tracker = DependencyTracker::new();
		let dep = NodeId::fresh();
		let c = counter();
		let dyn_c: Arc<dyn Dependent> = c.clone();

		tracker.start_tracking(&dyn_c);
		tracker.track_access(dep);
		tracker.stop_tracking();
		drop(dyn_c);
		drop(c);

		assert_eq!(tracker.dependent_count(dep), 0);
		// Must not panic or invoke anything on the collected dependent.
		tracker.notify_dependents(dep);
	}

	struct Panicker {
		id: NodeId,
	}

	impl Dependent for Panicker {
		fn id(&self) -> NodeId {
			self.id
		}
		fn on_dependency_changed(&self) {
			panic!("boom");
		}
	}

	#[test]
	fn a_panicking_dependent_is_logged_and_does_not_stop_the_others() {
		// Installs a real subscriber so the `tracing::error!` call below runs
		// against a live dispatcher instead of the no-op default.
		let _ = tracing_subscriber::fmt()
			.with_test_writer()
			.with_env_filter("error")
			.try_init();

		let tracker = DependencyTracker::new();
		let dep = NodeId::fresh();
		let panicker: Arc<dyn Dependent> = Arc::new(Panicker { id: NodeId::fresh() });
		let counter = counter();
		let dyn_counter: Arc<dyn Dependent> = counter.clone();

		tracker.start_tracking(&panicker);
		tracker.track_access(dep);
		tracker.stop_tracking();

		tracker.start_tracking(&dyn_counter);
		tracker.track_access(dep);
		tracker.stop_tracking();

		tracker.notify_dependents(dep);
		assert_eq!(counter.hits.load(Ordering::SeqCst), 1, "a panicking dependent must not stop later ones");
	}
}
