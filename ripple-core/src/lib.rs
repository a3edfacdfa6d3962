#![warn(clippy::pedantic)]
#![warn(missing_docs)]
#![warn(unreachable_pub)]

//! Runtime primitives backing the `ripple` reactive crate.
//!
//! This crate has no notion of "cells" or "signals" — it only provides the
//! plumbing that the user-facing node kinds in `ripple` are built on:
//!
//! - [`id`]: stable per-process node identities.
//! - [`tracker`]: the dependency tracker (context stack + weak back-edges).
//! - [`notifier`]: the per-node re-entrancy guard around notification.
//! - [`subscription`]: copy-on-write listener lists with disposables.
//! - [`executor`]: the worker pool and debounce/delay timer.
//! - [`weak_lru`]: the bounded, weak-keyed cache used by dynamic combinators.

pub mod error;
pub mod executor;
pub mod id;
pub mod notifier;
pub mod subscription;
pub mod tracker;
pub mod weak_lru;

pub use error::RuntimeNotInitialized;
pub use executor::{Executor, RuntimeOptions, TimerHandle};
pub use id::NodeId;
pub use notifier::Notifier;
pub use subscription::{Subscription, SubscriptionList};
pub use tracker::{Dependent, DependencyTracker};
pub use weak_lru::WeakKeyedLru;
