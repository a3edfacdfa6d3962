//! Per-node re-entrancy guard coordinating the two notification phases
//! (direct subscribers, then tracked dependents).

use std::sync::atomic::{AtomicBool, Ordering};

use scopeguard::guard;

use crate::{id::NodeId, tracker::DependencyTracker};

/// Serialises the "notification phase" of a single node.
///
/// A write that arrives while the node is already mid-notification (i.e. a
/// listener calling back into the same node) is suppressed rather than
/// queued or re-entered — this is what keeps a subscriber that writes back
/// to its own source from looping forever. Writes to *other* nodes from
/// inside a listener are unaffected.
pub struct Notifier {
	notifying: AtomicBool,
}

impl Default for Notifier {
	fn default() -> Self {
		Self::new()
	}
}

impl Notifier {
	/// Creates a notifier in the idle state.
	#[must_use]
	pub fn new() -> Self {
		Self {
			notifying: AtomicBool::new(false),
		}
	}

	/// Runs `direct` (typically: iterate and call subscribers), then asks
	/// `tracker` to notify `self_id`'s dependents. If this notifier is
	/// already mid-notification, returns immediately without running
	/// `direct` at all.
	pub fn notify(&self, self_id: NodeId, tracker: &DependencyTracker, direct: impl FnOnce()) {
		if self
			.notifying
			.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
			.is_err()
		{
			return;
		}
		let notifying = &self.notifying;
		let _reset = guard((), move |()| notifying.store(false, Ordering::Release));
		direct();
		tracker.notify_dependents(self_id);
	}
}
