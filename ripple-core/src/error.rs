//! Errors raised by the runtime plumbing itself, as opposed to node-level
//! errors (cycle detection, fetch failures, ...) which live in `ripple::error`.

use thiserror::Error;

/// Raised when an API that requires an initialised [`crate::Executor`] is
/// called without one having been created (or after it has been shut down).
#[derive(Debug, Error, Clone, Copy)]
#[error("no runtime is initialised on this thread; call init_runtime() or Runtime::scoped() first")]
pub struct RuntimeNotInitialized;
