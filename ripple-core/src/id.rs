//! Stable, process-local node identities.

use std::sync::atomic::{AtomicU64, Ordering};

/// Stable identity of a reactive node (cell, derived cell, trigger, resource
/// cell, or effect handle), used as the key for weak back-edges in
/// [`crate::tracker::DependencyTracker`].
///
/// Identities are only ever compared to each other and never dereferenced;
/// they are deliberately opaque so that nodes can be stored behind `Arc`,
/// `Pin<Arc<_>>`, or similar without the tracker caring about the concrete
/// type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(u64);

impl NodeId {
	/// Allocates a fresh, never-reused identity.
	pub fn fresh() -> Self {
		static COUNTER: AtomicU64 = AtomicU64::new(1);
		Self(COUNTER.fetch_add(1, Ordering::Relaxed))
	}
}
