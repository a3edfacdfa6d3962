//! The pooled lightweight-thread executor and the single timer thread used
//! for debounced / scheduled work.
//!
//! A fixed pool of worker threads plus one dedicated timer thread, built on
//! `crossbeam-channel`: the pool only ever needs to run plain `FnOnce`
//! closures, never splittable sub-tasks, so a bounded channel-backed queue
//! is enough.

use std::{
	cmp::Reverse,
	collections::{BinaryHeap, HashMap},
	sync::{
		atomic::{AtomicU64, Ordering},
		Arc,
	},
	thread::{self, JoinHandle},
	time::{Duration, Instant},
};

use crossbeam_channel::{unbounded, Sender};
use parking_lot::{Condvar, Mutex};

/// A unit of work submitted to the [`Executor`]'s pool.
type Job = Box<dyn FnOnce() + Send + 'static>;

/// Configuration recognised when constructing a [`crate::Executor`] /
/// `Runtime`. Purely programmatic — there is no file format to parse.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeOptions {
	/// Number of worker threads in the pool. Must be at least 1.
	pub worker_threads: usize,
	/// Default `debounceDelay` for resources constructed without an
	/// explicit one.
	pub default_debounce: Duration,
	/// Default eagerness for derived cells constructed without an explicit
	/// mode (an explicit ≥1 subscriber still makes a cell eager regardless
	/// of this default; see `DerivedCell` invariants).
	pub eager_by_default: bool,
	/// Granularity the timer thread rounds scheduled delays up to, so
	/// near-simultaneous debounce/delay requests wake the timer thread once
	/// instead of once each. `Duration::ZERO` (the default) disables
	/// coalescing: every request fires at its exact requested delay.
	pub timer_tick: Duration,
}

impl Default for RuntimeOptions {
	fn default() -> Self {
		Self {
			worker_threads: thread::available_parallelism().map_or(4, std::num::NonZero::get),
			default_debounce: Duration::ZERO,
			eager_by_default: false,
			timer_tick: Duration::ZERO,
		}
	}
}

struct TimerState {
	heap: BinaryHeap<Reverse<(Instant, u64)>>,
	jobs: HashMap<u64, Job>,
	next_seq: u64,
	shutdown: bool,
}

struct Timer {
	state: Arc<Mutex<TimerState>>,
	wake: Arc<Condvar>,
	thread: Option<JoinHandle<()>>,
	tick: Duration,
}

/// Rounds `delay` up to the next multiple of `tick`. A zero `tick` disables
/// coalescing and returns `delay` unchanged.
fn quantize(delay: Duration, tick: Duration) -> Duration {
	if tick.is_zero() {
		return delay;
	}
	let delay_nanos = delay.as_nanos();
	let tick_nanos = tick.as_nanos();
	let rounded = delay_nanos.div_ceil(tick_nanos) * tick_nanos;
	Duration::from_nanos(rounded.min(u128::from(u64::MAX)) as u64)
}

impl Timer {
	fn start(pool: Sender<Job>, tick: Duration) -> Self {
		let state = Arc::new(Mutex::new(TimerState {
			heap: BinaryHeap::new(),
			jobs: HashMap::new(),
			next_seq: 0,
			shutdown: false,
		}));
		let wake = Arc::new(Condvar::new());

		let thread_state = state.clone();
		let thread_wake = wake.clone();
		let thread = thread::Builder::new()
			.name("ripple-timer".into())
			.spawn(move || Self::run(&thread_state, &thread_wake, &pool))
			.expect("failed to spawn ripple timer thread");

		Self {
			state,
			wake,
			thread: Some(thread),
			tick,
		}
	}

	fn run(state: &Mutex<TimerState>, wake: &Condvar, pool: &Sender<Job>) {
		let mut guard = state.lock();
		loop {
			if guard.shutdown {
				return;
			}
			match guard.heap.peek().copied() {
				None => {
					wake.wait(&mut guard);
				}
				Some(Reverse((at, seq))) => {
					let now = Instant::now();
					if at <= now {
						guard.heap.pop();
						if let Some(job) = guard.jobs.remove(&seq) {
							// Never run the job on the timer thread itself:
							// a slow fetcher must not stall other timers.
							let _ = pool.send(job);
						}
					} else {
						wake.wait_for(&mut guard, at - now);
					}
				}
			}
		}
	}

	/// Schedules `job` to run (on the pool) after `delay`, rounded up to the
	/// timer's tick granularity. Returns a handle that can cancel the
	/// scheduled run before it fires.
	fn schedule(&self, delay: Duration, job: Job) -> TimerHandle {
		let delay = quantize(delay, self.tick);
		let mut guard = self.state.lock();
		let seq = guard.next_seq;
		guard.next_seq += 1;
		let at = Instant::now() + delay;
		guard.heap.push(Reverse((at, seq)));
		guard.jobs.insert(seq, job);
		drop(guard);
		self.wake.notify_one();
		TimerHandle {
			seq,
			state: self.state.clone(),
		}
	}
}

impl Drop for Timer {
	fn drop(&mut self) {
		self.state.lock().shutdown = true;
		self.wake.notify_all();
		if let Some(thread) = self.thread.take() {
			let _ = thread.join();
		}
	}
}

/// A handle to a timer-scheduled job, allowing best-effort cancellation.
///
/// Cancellation never interrupts a job that has already been handed to the
/// pool — it can only prevent a job that has not fired yet from firing.
#[derive(Clone)]
pub struct TimerHandle {
	seq: u64,
	state: Arc<Mutex<TimerState>>,
}

impl TimerHandle {
	/// Best-effort cancellation: removes the pending job if it has not
	/// already been dispatched to the pool.
	pub fn cancel(&self) {
		self.state.lock().jobs.remove(&self.seq);
	}
}

/// Pool of lightweight worker threads plus the dedicated timer thread for
/// delayed/debounced submissions.
///
/// This is the `Runtime`'s concrete backing: `init_runtime`/`Runtime::scoped`
/// construct exactly one `Executor` and keep it alive for the scope's
/// duration.
pub struct Executor {
	job_tx: Sender<Job>,
	workers: Vec<JoinHandle<()>>,
	timer: Timer,
	active: Arc<AtomicU64>,
}

impl Executor {
	/// Starts the worker pool and timer thread described by `options`.
	#[must_use]
	pub fn start(options: RuntimeOptions) -> Self {
		let worker_count = options.worker_threads.max(1);
		let (job_tx, job_rx) = unbounded::<Job>();
		let active = Arc::new(AtomicU64::new(0));

		let mut workers = Vec::with_capacity(worker_count);
		for index in 0..worker_count {
			let job_rx = job_rx.clone();
			let active = active.clone();
			let handle = thread::Builder::new()
				.name(format!("ripple-worker-{index}"))
				.spawn(move || {
					for job in job_rx {
						active.fetch_add(1, Ordering::Relaxed);
						job();
						active.fetch_sub(1, Ordering::Relaxed);
					}
				})
				.expect("failed to spawn ripple worker thread");
			workers.push(handle);
		}

		let timer = Timer::start(job_tx.clone(), options.timer_tick);

		Self {
			job_tx,
			workers,
			timer,
			active,
		}
	}

	/// Submits `job` to the pool immediately. Returns without waiting for
	/// it to run.
	pub fn spawn(&self, job: impl FnOnce() + Send + 'static) {
		let _ = self.job_tx.send(Box::new(job));
	}

	/// Schedules `job` to run after `delay`, via the timer thread, which
	/// hands it back to the pool when it fires.
	pub fn schedule_after(&self, delay: Duration, job: impl FnOnce() + Send + 'static) -> TimerHandle {
		self.timer.schedule(delay, Box::new(job))
	}

	/// Number of jobs currently executing across the pool (test/debug
	/// helper).
	#[must_use]
	pub fn active_count(&self) -> u64 {
		self.active.load(Ordering::Relaxed)
	}
}

impl Drop for Executor {
	fn drop(&mut self) {
		// Dropping job_tx's clones (held by workers) happens once we drop
		// our own sender below; workers exit their `for job in job_rx` loop
		// once every sender is gone, including the timer's.
		let (dummy_tx, _dummy_rx) = unbounded::<Job>();
		let old_tx = std::mem::replace(&mut self.job_tx, dummy_tx);
		drop(old_tx);
		for worker in self.workers.drain(..) {
			let _ = worker.join();
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::{
		atomic::{AtomicBool, AtomicUsize},
		mpsc,
	};
	use std::time::Duration;

	#[test]
	fn spawn_runs_on_pool() {
		let exec = Executor::start(RuntimeOptions {
			worker_threads: 2,
			..RuntimeOptions::default()
		});
		let (tx, rx) = mpsc::channel();
		exec.spawn(move || tx.send(42).unwrap());
		assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), 42);
	}

	#[test]
	fn schedule_after_fires_once_past_delay() {
		let exec = Executor::start(RuntimeOptions {
			worker_threads: 1,
			..RuntimeOptions::default()
		});
		let (tx, rx) = mpsc::channel();
		exec.schedule_after(Duration::from_millis(20), move || tx.send(()).unwrap());
		assert!(rx.recv_timeout(Duration::from_secs(1)).is_ok());
	}

	#[test]
	fn cancelling_before_fire_prevents_run() {
		let exec = Executor::start(RuntimeOptions {
			worker_threads: 1,
			..RuntimeOptions::default()
		});
		let ran = Arc::new(AtomicBool::new(false));
		let ran2 = ran.clone();
		let handle = exec.schedule_after(Duration::from_millis(200), move || {
			ran2.store(true, Ordering::SeqCst);
		});
		handle.cancel();
		thread::sleep(Duration::from_millis(400));
		assert!(!ran.load(Ordering::SeqCst));
	}

	#[test]
	fn multiple_schedules_run_in_order() {
		let exec = Executor::start(RuntimeOptions {
			worker_threads: 1,
			..RuntimeOptions::default()
		});
		let order = Arc::new(Mutex::new(Vec::new()));
		let (tx, rx) = mpsc::channel();
		for i in 0..3u32 {
			let order = order.clone();
			let tx = tx.clone();
			exec.schedule_after(Duration::from_millis(10 * u64::from(3 - i)), move || {
				order.lock().push(i);
				let _ = tx.send(());
			});
		}
		for _ in 0..3 {
			rx.recv_timeout(Duration::from_secs(1)).unwrap();
		}
		assert_eq!(*order.lock(), vec![2, 1, 0]);
	}

	#[test]
	fn zero_tick_leaves_delay_unchanged() {
		assert_eq!(quantize(Duration::from_millis(37), Duration::ZERO), Duration::from_millis(37));
	}

	#[test]
	fn nonzero_tick_rounds_delay_up_to_the_next_boundary() {
		assert_eq!(quantize(Duration::from_millis(1), Duration::from_millis(16)), Duration::from_millis(16));
		assert_eq!(quantize(Duration::from_millis(16), Duration::from_millis(16)), Duration::from_millis(16));
		assert_eq!(quantize(Duration::from_millis(17), Duration::from_millis(16)), Duration::from_millis(32));
	}

	#[test]
	fn schedules_within_a_tick_fire_together() {
		let exec = Executor::start(RuntimeOptions {
			worker_threads: 1,
			timer_tick: Duration::from_millis(50),
			..RuntimeOptions::default()
		});
		let order = Arc::new(Mutex::new(Vec::new()));
		let (tx, rx) = mpsc::channel();
		for i in 0..3u32 {
			let order = order.clone();
			let tx = tx.clone();
			exec.schedule_after(Duration::from_millis(5 * u64::from(i)), move || {
				order.lock().push(i);
				let _ = tx.send(());
			});
		}
		for _ in 0..3 {
			rx.recv_timeout(Duration::from_secs(1)).unwrap();
		}
		assert_eq!(order.lock().len(), 3, "all three requests should have fired on the shared tick");
	}

	#[test]
	fn active_count_tracks_in_flight_jobs() {
		let exec = Executor::start(RuntimeOptions {
			worker_threads: 2,
			..RuntimeOptions::default()
		});
		let gate = Arc::new((Mutex::new(false), Condvar::new()));
		let gate2 = gate.clone();
		exec.spawn(move || {
			let (lock, cvar) = &*gate2;
			let mut started = lock.lock();
			while !*started {
				cvar.wait(&mut started);
			}
		});
		thread::sleep(Duration::from_millis(50));
		let (lock, cvar) = &*gate;
		*lock.lock() = true;
		cvar.notify_all();
		thread::sleep(Duration::from_millis(50));
		assert_eq!(exec.active_count(), 0);
	}
}
