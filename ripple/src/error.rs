//! Node-level error kinds. Runtime-plumbing errors
//! ([`ripple_core::RuntimeNotInitialized`]) are re-exported as
//! [`RuntimeError`] so callers only ever need to import from this module.

use std::fmt;

use thiserror::Error;

/// Raised when a [`crate::DerivedCell`]'s `compute()` reads itself,
/// directly or transitively, while already computing.
///
/// Surfaces to the triggering `get()` caller; the node is left `dirty` and
/// `computing == false` (never left mid-computation), so a later `get()`
/// from outside the cyclic call chain can still attempt recomputation.
#[derive(Debug, Error, Clone, Copy)]
#[error("cyclic dependency detected while recomputing a derived cell")]
pub struct CycleError;

/// Raised when an API that requires an initialised runtime ([`crate::init_runtime`]
/// / [`crate::Runtime::scoped`]) is called without one.
#[derive(Debug, Error, Clone, Copy)]
#[error(transparent)]
pub struct RuntimeError(#[from] pub(crate) ripple_core::RuntimeNotInitialized);

/// Carried as the `Error` state of a [`crate::ResourceCell`]; never raised
/// directly from `fetch()` itself (fetch always succeeds in *starting* a
/// request).
#[derive(Debug, Error, Clone)]
#[error("resource fetch failed: {message}")]
pub struct FetchError {
	message: String,
}

impl FetchError {
	/// Wraps an arbitrary fetcher failure, capturing its `Display` text so
	/// `ResourceCell<T>` does not need `E: 'static` bounds on the original
	/// error type.
	pub fn new(cause: impl fmt::Display) -> Self {
		Self {
			message: cause.to_string(),
		}
	}
}

/// Carried as the `Cancelled` state of a [`crate::ResourceCell`], either
/// because of an explicit `cancel()` or because a newer `fetch()`
/// superseded this one.
#[derive(Debug, Error, Clone, Copy, Default)]
#[error("resource fetch was cancelled")]
pub struct CancelledError;

/// Index passed to a list-like API fell outside its bounds.
#[derive(Debug, Error, Clone, Copy)]
#[error("index {index} out of range (length {length})")]
pub struct IndexOutOfRange {
	/// The offending index.
	pub index: usize,
	/// The collection's length at the time of the call.
	pub length: usize,
}

/// Caught, logged (via `tracing::error!`), and swallowed whenever a
/// `watch` listener panics during notification. Never returned from a
/// public API; it exists so the catching code has a named error to log.
#[derive(Debug, Error, Clone, Copy)]
#[error("a listener panicked during notification")]
pub struct ListenerError;

/// A required argument (e.g. a mapper closure) was missing where the API
/// eagerly validates its inputs.
#[derive(Debug, Error, Clone, Copy)]
#[error("required argument was not provided")]
pub struct NullArgument;
