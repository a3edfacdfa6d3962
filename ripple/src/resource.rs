//! `ResourceCell[T]`: the asynchronous fetch state machine, with debounce
//! and request supersession.

use std::{
	fmt,
	future::Future,
	panic::{catch_unwind, AssertUnwindSafe},
	pin::Pin,
	sync::{
		atomic::{AtomicU64, Ordering},
		Arc, Weak,
	},
	task::{Context, Poll},
	time::Duration,
};

use futures_channel::oneshot;
use parking_lot::{Mutex, RwLock};
use ripple_core::{subscription::Subscription, Dependent, NodeId, Notifier, SubscriptionList, TimerHandle};

use crate::{error::FetchError, error::RuntimeError, runtime};

type PinBoxFuture<T> = Pin<Box<dyn Future<Output = Result<T, FetchError>> + Send>>;
type Listener<T> = dyn Fn(&ResourceState<T>) + Send + Sync;

/// Which phase of the state machine a [`ResourceState`] snapshot is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourcePhase {
	/// No fetch has run, or the resource was explicitly [`ResourceCell::cancel`]led.
	Idle,
	/// A request is in flight (possibly after a debounce delay elapses).
	Loading,
	/// The most recent request completed successfully.
	Success,
	/// The most recent request failed.
	Error,
	/// The most recent request was cancelled, superseded, or explicitly stopped.
	Cancelled,
}

/// A point-in-time snapshot of a [`ResourceCell`]: its phase, tagged with
/// the last-known-good value (carried across `Loading`/`Error`/`Cancelled`
/// transitions) and, for `Error`, the failure.
#[derive(Debug, Clone)]
pub struct ResourceState<T> {
	/// The current phase.
	pub phase: ResourcePhase,
	/// The most recent successfully fetched value, if any, regardless of
	/// the current phase.
	pub data: Option<T>,
	/// Populated only when `phase == Error`.
	pub error: Option<FetchError>,
}

impl<T: Clone> ResourceState<T> {
	fn idle(last: Option<T>) -> Self {
		Self {
			phase: ResourcePhase::Idle,
			data: last,
			error: None,
		}
	}
	fn loading(last: Option<T>) -> Self {
		Self {
			phase: ResourcePhase::Loading,
			data: last,
			error: None,
		}
	}
	fn success(value: T) -> Self {
		Self {
			phase: ResourcePhase::Success,
			data: Some(value),
			error: None,
		}
	}
	fn error(error: FetchError, last: Option<T>) -> Self {
		Self {
			phase: ResourcePhase::Error,
			data: last,
			error: Some(error),
		}
	}
	fn cancelled(last: Option<T>) -> Self {
		Self {
			phase: ResourcePhase::Cancelled,
			data: last,
			error: None,
		}
	}
}

/// The terminal outcome a [`FetchFuture`] resolves with.
#[derive(Debug, Clone)]
pub enum FetchOutcome<T> {
	/// The request succeeded.
	Success(T),
	/// The request failed.
	Error(FetchError),
	/// The request was cancelled, explicitly or by a superseding `fetch()`.
	Cancelled,
}

/// The future returned by [`ResourceCell::fetch`]. Resolves when the
/// request it represents completes, is cancelled, or is superseded.
pub struct FetchFuture<T> {
	rx: oneshot::Receiver<FetchOutcome<T>>,
}

impl<T> Future for FetchFuture<T> {
	type Output = FetchOutcome<T>;

	fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
		let this = self.get_mut();
		match Pin::new(&mut this.rx).poll(cx) {
			Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
			Poll::Ready(Err(oneshot::Canceled)) => Poll::Ready(FetchOutcome::Cancelled),
			Poll::Pending => Poll::Pending,
		}
	}
}

/// Construction-time options for a [`ResourceCell`].
#[derive(Debug, Clone, Copy)]
pub struct ResourceOptions {
	/// If `true`, a fetch is started immediately at construction; otherwise
	/// the first fetch is on-demand.
	pub auto_fetch: bool,
	/// `None` inherits the ambient runtime's [`RuntimeOptions::default_debounce`](crate::RuntimeOptions::default_debounce).
	/// `Some(Duration::ZERO)` disables debouncing even if the runtime default
	/// is non-zero; any other `Some` value collapses repeated `fetch()`
	/// calls within the window into a single scheduled run.
	pub debounce_delay: Option<Duration>,
}

impl Default for ResourceOptions {
	fn default() -> Self {
		Self {
			auto_fetch: false,
			debounce_delay: None,
		}
	}
}

struct Control<T> {
	pending_senders: Vec<oneshot::Sender<FetchOutcome<T>>>,
	debounce_timer: Option<TimerHandle>,
}

struct Inner<T> {
	id: NodeId,
	fetcher: Box<dyn Fn() -> PinBoxFuture<T> + Send + Sync>,
	options: ResourceOptions,
	debounce_delay: Duration,
	snapshot: RwLock<ResourceState<T>>,
	control: Mutex<Control<T>>,
	generation: AtomicU64,
	notifier: Notifier,
	subscribers: SubscriptionList<Listener<T>>,
	runtime: Arc<runtime::RuntimeInner>,
	self_weak: Weak<Inner<T>>,
}

/// A reactive wrapper over an asynchronous request: tracks the fetcher's
/// synchronous dependency reads, re-fetches when they change, and exposes
/// a non-blocking state snapshot plus a completion future per `fetch()`.
pub struct ResourceCell<T> {
	inner: Arc<Inner<T>>,
}

impl<T> Clone for ResourceCell<T> {
	fn clone(&self) -> Self {
		Self {
			inner: self.inner.clone(),
		}
	}
}

impl<T: Clone + Send + Sync + 'static> ResourceCell<T> {
	/// Constructs a resource cell around `fetcher`, bound to the ambient
	/// runtime. `fetcher` is called synchronously to produce each request's
	/// future; only that synchronous portion is dependency-tracked.
	pub fn new<F, Fut, E>(fetcher: F, options: ResourceOptions) -> Result<Self, RuntimeError>
	where
		F: Fn() -> Fut + Send + Sync + 'static,
		Fut: Future<Output = Result<T, E>> + Send + 'static,
		E: fmt::Display,
	{
		let rt = runtime::current()?;
		let boxed_fetcher: Box<dyn Fn() -> PinBoxFuture<T> + Send + Sync> = Box::new(move || {
			let fut = fetcher();
			Box::pin(async move { fut.await.map_err(FetchError::new) }) as PinBoxFuture<T>
		});
		let debounce_delay = options
			.debounce_delay
			.unwrap_or(rt.options.default_debounce);
		let inner = Arc::new_cyclic(|weak| Inner {
			id: NodeId::fresh(),
			fetcher: boxed_fetcher,
			options,
			debounce_delay,
			snapshot: RwLock::new(ResourceState::idle(None)),
			control: Mutex::new(Control {
				pending_senders: Vec::new(),
				debounce_timer: None,
			}),
			generation: AtomicU64::new(0),
			notifier: Notifier::new(),
			subscribers: SubscriptionList::new(),
			runtime: rt,
			self_weak: weak.clone(),
		});
		let cell = Self { inner };
		if cell.inner.options.auto_fetch {
			let _ = Self::start_or_schedule(&cell.inner);
		}
		Ok(cell)
	}

	pub(crate) fn id(&self) -> NodeId {
		self.inner.id
	}

	/// Returns the current snapshot, tracking this resource as a dependency.
	/// Never blocks on the in-flight request.
	pub fn get(&self) -> ResourceState<T> {
		self.inner.runtime.tracker.track_access(self.inner.id);
		self.inner.snapshot.read().clone()
	}

	/// Returns the current snapshot without tracking a dependency.
	pub fn peek(&self) -> ResourceState<T> {
		self.inner.snapshot.read().clone()
	}

	/// Starts (or joins, under debounce) a fetch. Returns a future that
	/// resolves with this request's outcome — success, failure, explicit
	/// cancellation, or supersession by a later `fetch()`.
	pub fn fetch(&self) -> FetchFuture<T> {
		Self::start_or_schedule(&self.inner)
	}

	/// Alias for [`Self::fetch`], for callers that prefer the name that
	/// makes a re-fetch of an already-loaded resource read more clearly.
	pub fn refetch(&self) -> FetchFuture<T> {
		self.fetch()
	}

	/// Cancels any in-flight request (and any pending debounce timer),
	/// moving to `Idle` while retaining the last-known-good value.
	pub fn cancel(&self) {
		let this = &self.inner;
		let mut control = this.control.lock();
		if let Some(timer) = control.debounce_timer.take() {
			timer.cancel();
		}
		flush_pending(&mut control, FetchOutcome::Cancelled);
		drop(control);
		this.generation.fetch_add(1, Ordering::AcqRel);
		let last = this.snapshot.read().data.clone();
		set_snapshot(this, ResourceState::idle(last));
	}

	/// Registers `listener` to run on every state transition.
	pub fn watch(&self, listener: impl Fn(&ResourceState<T>) + Send + Sync + 'static) -> Subscription {
		self.inner.subscribers.add(Arc::new(listener))
	}

	fn start_or_schedule(this: &Arc<Inner<T>>) -> FetchFuture<T> {
		let (tx, rx) = oneshot::channel();
		let mut control = this.control.lock();
		if let Some(timer) = control.debounce_timer.take() {
			timer.cancel();
		}
		if this.debounce_delay.is_zero() {
			let superseded = !control.pending_senders.is_empty();
			flush_pending(&mut control, FetchOutcome::Cancelled);
			control.pending_senders.push(tx);
			drop(control);
			if superseded {
				let last = this.snapshot.read().data.clone();
				set_snapshot(this, ResourceState::cancelled(last));
			}
			let last = this.snapshot.read().data.clone();
			set_snapshot(this, ResourceState::loading(last));
			spawn_request(this);
		} else {
			control.pending_senders.push(tx);
			let weak = this.self_weak.clone();
			let delay = this.debounce_delay;
			let handle = this.runtime.executor.schedule_after(delay, move || {
				if let Some(strong) = weak.upgrade() {
					fire_debounced(&strong);
				}
			});
			control.debounce_timer = Some(handle);
		}
		FetchFuture { rx }
	}
}

fn flush_pending<T>(control: &mut Control<T>, outcome: FetchOutcome<T>)
where
	T: Clone,
{
	for tx in control.pending_senders.drain(..) {
		let _ = tx.send(outcome.clone());
	}
}

fn set_snapshot<T>(this: &Arc<Inner<T>>, new_state: ResourceState<T>)
where
	T: Clone + Send + Sync + 'static,
{
	*this.snapshot.write() = new_state.clone();
	let id = this.id;
	let tracker = &this.runtime.tracker;
	let subscribers = &this.subscribers;
	this.notifier.notify(id, tracker, || {
		subscribers.for_each(|listener| {
			let result = catch_unwind(AssertUnwindSafe(|| listener(&new_state)));
			if result.is_err() {
				tracing::error!(node = ?id, "resource cell watcher panicked");
			}
		});
	});
}

fn spawn_request<T>(this: &Arc<Inner<T>>)
where
	T: Clone + Send + Sync + 'static,
{
	let generation = this.generation.fetch_add(1, Ordering::AcqRel) + 1;
	let dependent: Arc<dyn Dependent> = this.clone();
	this.runtime.tracker.start_tracking(&dependent);
	let future = (this.fetcher)();
	this.runtime.tracker.stop_tracking();

	let this2 = this.clone();
	this.runtime.executor.spawn(move || {
		let result = futures_lite::future::block_on(future);
		complete_request(&this2, generation, result);
	});
}

fn fire_debounced<T>(this: &Arc<Inner<T>>)
where
	T: Clone + Send + Sync + 'static,
{
	this.control.lock().debounce_timer = None;
	let last = this.snapshot.read().data.clone();
	set_snapshot(this, ResourceState::loading(last));
	spawn_request(this);
}

fn complete_request<T>(this: &Arc<Inner<T>>, generation: u64, result: Result<T, FetchError>)
where
	T: Clone + Send + Sync + 'static,
{
	if this.generation.load(Ordering::Acquire) != generation {
		// Superseded: the superseding call already flushed our senders with
		// `FetchOutcome::Cancelled` when it started.
		return;
	}
	let pending = std::mem::take(&mut this.control.lock().pending_senders);
	let last = this.snapshot.read().data.clone();
	match result {
		Ok(value) => {
			set_snapshot(this, ResourceState::success(value.clone()));
			for tx in pending {
				let _ = tx.send(FetchOutcome::Success(value.clone()));
			}
		}
		Err(err) => {
			set_snapshot(this, ResourceState::error(err.clone(), last));
			for tx in pending {
				let _ = tx.send(FetchOutcome::Error(err.clone()));
			}
		}
	}
}

impl<T: Clone + Send + Sync + 'static> Dependent for Inner<T> {
	fn id(&self) -> NodeId {
		self.id
	}

	fn on_dependency_changed(&self) {
		if let Some(strong) = self.self_weak.upgrade() {
			let _ = ResourceCell::start_or_schedule(&strong);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{
		cell::Cell,
		runtime::{Runtime, RuntimeOptions as RtOptions},
	};
	use std::{
		sync::atomic::{AtomicUsize, Ordering as AOrdering},
		time::Duration,
	};

	fn block_on_future<F: Future>(future: F) -> F::Output {
		futures_lite::future::block_on(future)
	}

	#[test]
	fn successful_fetch_reaches_success_state() {
		Runtime::scoped(RtOptions::default(), || {
			let r = ResourceCell::new(
				|| async { Ok::<_, String>(42) },
				ResourceOptions::default(),
			)
			.unwrap();
			let outcome = block_on_future(r.fetch());
			assert!(matches!(outcome, FetchOutcome::Success(42)));
			assert_eq!(r.peek().phase, ResourcePhase::Success);
			assert_eq!(r.peek().data, Some(42));
		});
	}

	#[test]
	fn failed_fetch_keeps_last_known_good_value() {
		Runtime::scoped(RtOptions::default(), || {
			let attempt = Arc::new(AtomicUsize::new(0));
			let attempt2 = attempt.clone();
			let r = ResourceCell::new(
				move || {
					let n = attempt2.fetch_add(1, AOrdering::SeqCst);
					async move {
						if n == 0 {
							Ok::<_, String>(7)
						} else {
							Err("boom".to_string())
						}
					}
				},
				ResourceOptions::default(),
			)
			.unwrap();
			block_on_future(r.fetch());
			assert_eq!(r.peek().data, Some(7));

			block_on_future(r.fetch());
			let state = r.peek();
			assert_eq!(state.phase, ResourcePhase::Error);
			assert_eq!(state.data, Some(7), "last-known-good must survive an error");
			assert!(state.error.is_some());
		});
	}

	#[test]
	fn refetch_on_dependency_change() {
		Runtime::scoped(RtOptions::default(), || {
			let q = Cell::new(1).unwrap();
			let calls = Arc::new(AtomicUsize::new(0));
			let calls2 = calls.clone();
			let q2 = q.clone();
			let r = ResourceCell::new(
				move || {
					calls2.fetch_add(1, AOrdering::SeqCst);
					let value = q2.get();
					async move { Ok::<_, String>(value * 10) }
				},
				ResourceOptions::default(),
			)
			.unwrap();
			block_on_future(r.fetch());
			assert_eq!(calls.load(AOrdering::SeqCst), 1);

			q.set(2);
			std::thread::sleep(Duration::from_millis(100));
			assert_eq!(calls.load(AOrdering::SeqCst), 2, "dependency change must trigger a refetch");
		});
	}

	#[test]
	fn supersession_cancels_the_first_request() {
		Runtime::scoped(RtOptions::default(), || {
			// A fetcher whose future never completes.
			let r: ResourceCell<i32> = ResourceCell::new(
				|| futures_lite::future::pending::<Result<i32, String>>(),
				ResourceOptions::default(),
			)
			.unwrap();
			let first = r.fetch();
			let _second = r.fetch();
			let outcome = block_on_future(first);
			assert!(matches!(outcome, FetchOutcome::Cancelled));
			assert_eq!(r.peek().phase, ResourcePhase::Loading);
		});
	}

	#[test]
	fn debounced_calls_collapse_into_one_request() {
		Runtime::scoped(RtOptions::default(), || {
			let q = Cell::new(String::new()).unwrap();
			let calls = Arc::new(AtomicUsize::new(0));
			let seen = Arc::new(Mutex::new(Vec::new()));
			let calls2 = calls.clone();
			let seen2 = seen.clone();
			let q2 = q.clone();
			let r = ResourceCell::new(
				move || {
					calls2.fetch_add(1, AOrdering::SeqCst);
					let value = q2.get();
					seen2.lock().push(value.clone());
					async move { Ok::<_, String>(value) }
				},
				ResourceOptions {
					auto_fetch: false,
					debounce_delay: Some(Duration::from_millis(60)),
				},
			)
			.unwrap();

			q.set("j".into());
			let f1 = r.fetch();
			std::thread::sleep(Duration::from_millis(10));
			q.set("ja".into());
			let f2 = r.fetch();
			std::thread::sleep(Duration::from_millis(10));
			q.set("java".into());
			let f3 = r.fetch();

			let o1 = block_on_future(f1);
			let o2 = block_on_future(f2);
			let o3 = block_on_future(f3);

			assert_eq!(calls.load(AOrdering::SeqCst), 1, "exactly one fetcher invocation");
			assert_eq!(*seen.lock(), vec!["java".to_string()]);
			for outcome in [o1, o2, o3] {
				assert!(matches!(outcome, FetchOutcome::Success(ref v) if v == "java"));
			}
		});
	}

	#[test]
	fn explicit_cancel_moves_to_idle() {
		Runtime::scoped(RtOptions::default(), || {
			let r: ResourceCell<i32> = ResourceCell::new(
				|| futures_lite::future::pending::<Result<i32, String>>(),
				ResourceOptions::default(),
			)
			.unwrap();
			let pending = r.fetch();
			r.cancel();
			let outcome = block_on_future(pending);
			assert!(matches!(outcome, FetchOutcome::Cancelled));
			assert_eq!(r.peek().phase, ResourcePhase::Idle);
		});
	}
}
