//! Fine-grained reactive cells, derived caches, triggers, and async
//! resources.
//!
//! A [`Runtime`] must be ambient on the current thread — via
//! [`Runtime::scoped`] or [`init_runtime`] — before any node constructor in
//! this crate can succeed; see [`runtime`] for why this is a per-thread
//! stack rather than a process-wide singleton.

#![warn(clippy::pedantic)]
#![warn(missing_docs)]
#![warn(unreachable_pub)]

pub mod cell;
pub mod combinators;
pub mod derived;
pub mod effect;
pub mod error;
pub mod resource;
pub mod runtime;
pub mod trigger;

pub use cell::Cell;
pub use combinators::{flat_map, FlatMapCache};
pub use derived::{DerivedCell, Mode as DerivedMode};
pub use effect::EffectRunner;
pub use error::{
	CancelledError, CycleError, FetchError, IndexOutOfRange, ListenerError, NullArgument,
	RuntimeError,
};
pub use resource::{FetchFuture, FetchOutcome, ResourceCell, ResourceOptions, ResourcePhase, ResourceState};
pub use runtime::{init_runtime, shutdown_runtime, Runtime, RuntimeOptions};
pub use trigger::Trigger;

/// Constructs a [`Cell`] holding `initial`, bound to the ambient runtime.
pub fn cell<T: Clone + PartialEq + Send + 'static>(initial: T) -> Result<Cell<T>, RuntimeError> {
	Cell::new(initial)
}

/// Constructs a [`Cell`] holding `T::default()`. A separate function from
/// [`cell`] since Rust has no argument-count overloading.
pub fn cell_default<T>() -> Result<Cell<T>, RuntimeError>
where
	T: Clone + PartialEq + Send + Default + 'static,
{
	Cell::new(T::default())
}

/// Constructs a lazily-recomputed [`DerivedCell`] around `compute`.
pub fn derived<T: Clone + PartialEq + Send + Sync + 'static>(
	compute: impl Fn() -> T + Send + Sync + 'static,
) -> Result<DerivedCell<T>, RuntimeError> {
	DerivedCell::new(compute)
}

/// Constructs an eagerly-recomputed [`DerivedCell`] around `compute`.
pub fn derived_eager<T: Clone + PartialEq + Send + Sync + 'static>(
	compute: impl Fn() -> T + Send + Sync + 'static,
) -> Result<DerivedCell<T>, RuntimeError> {
	DerivedCell::new_eager(compute)
}

/// Constructs a valueless [`Trigger`] bound to the ambient runtime.
pub fn trigger() -> Result<Trigger, RuntimeError> {
	Trigger::new()
}

/// Constructs a [`ResourceCell`] around `fetcher`, with `options` controlling
/// auto-fetch and debounce behaviour.
pub fn resource<T, F, Fut, E>(
	fetcher: F,
	options: ResourceOptions,
) -> Result<ResourceCell<T>, RuntimeError>
where
	T: Clone + Send + Sync + 'static,
	F: Fn() -> Fut + Send + Sync + 'static,
	Fut: std::future::Future<Output = Result<T, E>> + Send + 'static,
	E: std::fmt::Display,
{
	ResourceCell::new(fetcher, options)
}

/// Registers `body` as an [`EffectRunner`], running it immediately and again
/// on every change to a dependency it read.
pub fn effect(body: impl FnMut() + Send + 'static) -> Result<EffectRunner, RuntimeError> {
	EffectRunner::new(body)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn counter_and_doubled_scenario() {
		Runtime::scoped(RuntimeOptions::default(), || {
			let counter = cell(0).unwrap();
			let counter2 = counter.clone();
			let doubled = derived(move || counter2.get() * 2).unwrap();
			assert_eq!(doubled.get().unwrap(), 0);
			counter.set(21);
			assert_eq!(doubled.get().unwrap(), 42);
		});
	}

	#[test]
	fn effect_disposal_scenario() {
		Runtime::scoped(RuntimeOptions::default(), || {
			let counter = cell(0).unwrap();
			let runs = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
			let runs2 = runs.clone();
			let counter2 = counter.clone();
			let handle = effect(move || {
				counter2.get();
				runs2.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
			})
			.unwrap();

			counter.set(1);
			assert_eq!(runs.load(std::sync::atomic::Ordering::SeqCst), 2);

			handle.dispose();
			counter.set(2);
			assert_eq!(runs.load(std::sync::atomic::Ordering::SeqCst), 2);
		});
	}
}
