//! The scheduler interface.
//!
//! Schedulers are collaborators, not components of this workspace: anything
//! with a `schedule` method yielding a sender of `()` can carry work onto its
//! execution context. Timed schedulers conventionally add `schedule_after`
//! and `schedule_at` constructors in the same shape; they are not required
//! here because no adapter in this workspace is time-aware (timeouts are
//! composed as `stop_when(work, delay)`).

use crate::sender::Sender;

/// Hands out senders that complete on this scheduler's execution context.
pub trait Scheduler {
	/// The error a schedule operation may produce (queue shutdown and the
	/// like).
	type Error;
	/// The sender returned by [`schedule`](`Scheduler::schedule`).
	type Schedule: Sender<Value = (), Error = Self::Error>;

	/// Returns a sender that completes with `()` on this scheduler's context.
	///
	/// # Logic
	///
	/// The returned sender **should** complete with `Done` instead when the
	/// operation observes a stop request through its receiver's token.
	fn schedule(&self) -> Self::Schedule;
}
