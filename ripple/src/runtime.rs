//! Runtime lifecycle: the shared executor and dependency tracker, reached
//! implicitly by node constructors through a per-thread ambient stack
//! rather than a hidden process-wide singleton.

use std::{cell::RefCell, sync::Arc};

use ripple_core::{DependencyTracker, Executor, RuntimeNotInitialized};
pub use ripple_core::RuntimeOptions;

use crate::error::RuntimeError;

pub(crate) struct RuntimeInner {
	pub(crate) executor: Executor,
	pub(crate) tracker: DependencyTracker,
	pub(crate) options: RuntimeOptions,
}

thread_local! {
	static CURRENT: RefCell<Vec<Arc<RuntimeInner>>> = const { RefCell::new(Vec::new()) };
}

pub(crate) fn current() -> Result<Arc<RuntimeInner>, RuntimeError> {
	CURRENT
		.with(|stack| stack.borrow().last().cloned())
		.ok_or(RuntimeError(RuntimeNotInitialized))
}

/// A handle to an initialised runtime (shared executor + dependency
/// tracker).
///
/// Dropping a `Runtime` value does not by itself stop anything: the
/// executor and tracker stay alive for as long as any node still holds a
/// reference to them (every node captures the ambient runtime at
/// construction time). Call [`Runtime::shutdown`] to also remove it from
/// the ambient per-thread stack so that *later* constructors on this
/// thread fail with [`RuntimeError`] instead of reusing it.
#[must_use = "dropping a Runtime does not shut it down; call shutdown() or use Runtime::scoped"]
pub struct Runtime {
	inner: Arc<RuntimeInner>,
}

impl Runtime {
	/// Creates a new executor + tracker and pushes it onto this thread's
	/// ambient runtime stack, so that node constructors called on this
	/// thread (directly, or via closures that run here) resolve to it.
	#[must_use]
	pub fn init(options: RuntimeOptions) -> Self {
		let inner = Arc::new(RuntimeInner {
			executor: Executor::start(options),
			tracker: DependencyTracker::new(),
			options,
		});
		CURRENT.with(|stack| stack.borrow_mut().push(inner.clone()));
		tracing::debug!(worker_threads = options.worker_threads, "runtime initialised");
		Self { inner }
	}

	/// Pops this runtime off the ambient stack. The executor and tracker
	/// themselves keep running until the last node referencing them is
	/// dropped.
	pub fn shutdown(self) {
		CURRENT.with(|stack| {
			let mut stack = stack.borrow_mut();
			if let Some(pos) = stack.iter().rposition(|rt| Arc::ptr_eq(rt, &self.inner)) {
				stack.remove(pos);
			}
		});
		tracing::debug!("runtime removed from ambient scope");
	}

	/// Runs `body` with a freshly initialised runtime ambient on this
	/// thread, guaranteeing [`Runtime::shutdown`] runs on every exit path
	/// (including a panic unwinding through `body`).
	pub fn scoped<R>(options: RuntimeOptions, body: impl FnOnce() -> R) -> R {
		struct ShutdownGuard(Option<Runtime>);
		impl Drop for ShutdownGuard {
			fn drop(&mut self) {
				if let Some(rt) = self.0.take() {
					rt.shutdown();
				}
			}
		}
		let _guard = ShutdownGuard(Some(Runtime::init(options)));
		body()
	}

	/// Number of jobs currently executing on this runtime's worker pool
	/// (test/debug helper).
	#[must_use]
	pub fn active_job_count(&self) -> u64 {
		self.inner.executor.active_count()
	}
}

/// Initialises a runtime with `options` and makes it ambient for this
/// thread. Equivalent to `Runtime::init(options)`, offered as a free
/// function for callers that prefer it.
pub fn init_runtime(options: RuntimeOptions) -> Runtime {
	Runtime::init(options)
}

/// Shuts down `runtime`. Equivalent to `runtime.shutdown()`.
pub fn shutdown_runtime(runtime: Runtime) {
	runtime.shutdown();
}
