//! The descriptive half of the protocol.

use crate::{operation::OperationState, receiver::Receiver};

/// Where a sender's completion signal runs relative to
/// [`start`](`OperationState::start`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Blocking {
	/// Completion happens on the calling thread before `start` returns.
	AlwaysInline,
	/// Completion happens on the calling thread before the calling thread
	/// next returns to its event loop, though possibly after `start` returns.
	Always,
	/// Completion never happens on the thread that called `start`.
	Never,
	/// No static guarantee. The conventional default.
	Maybe,
}

impl Blocking {
	/// Combines the categories of two child senders into the category of an
	/// adapter that starts both and completes when both have completed.
	///
	/// `AlwaysInline` if both are; `Always` if both complete on the starting
	/// thread; `Never` if neither can complete inline; `Maybe` otherwise.
	#[must_use]
	pub const fn combine(self, other: Self) -> Self {
		match (self, other) {
			(Self::AlwaysInline, Self::AlwaysInline) => Self::AlwaysInline,
			(
				Self::AlwaysInline | Self::Always,
				Self::AlwaysInline | Self::Always,
			) => Self::Always,
			(Self::Never, Self::Never) => Self::Never,
			_ => Self::Maybe,
		}
	}

	/// [`combine`](`Blocking::combine`) folded over a whole child list.
	#[must_use]
	pub const fn combine_all(kinds: &[Self]) -> Self {
		if kinds.is_empty() {
			return Self::AlwaysInline;
		}
		let mut combined = kinds[0];
		let mut i = 1;
		while i < kinds.len() {
			combined = combined.combine(kinds[i]);
			i += 1;
		}
		combined
	}

	/// Combines the categories of two child senders into the category of an
	/// adapter that runs them one after the other.
	///
	/// Weaker than [`combine`](`Blocking::combine`) in the `Never` case: the
	/// second child starts on the first child's completing thread, so nothing
	/// can be promised about where it completes.
	#[must_use]
	pub const fn sequence(self, then: Self) -> Self {
		match (self, then) {
			(Self::AlwaysInline, Self::AlwaysInline) => Self::AlwaysInline,
			(
				Self::AlwaysInline | Self::Always,
				Self::AlwaysInline | Self::Always,
			) => Self::Always,
			_ => Self::Maybe,
		}
	}

	/// Whether completion is guaranteed to happen on the starting thread.
	#[must_use]
	pub const fn is_always(self) -> bool {
		matches!(self, Self::AlwaysInline | Self::Always)
	}
}

/// Describes an asynchronous operation without starting one.
///
/// A sender is a movable value. Binding it to a [`Receiver`] with
/// [`connect`](`Sender::connect`) yields an [`OperationState`]; only
/// [`start`](`OperationState::start`)ing that state begins work.
///
/// # Logic
///
/// `connect` **must not** start work; it may allocate bounded state.
///
/// An operation started from this sender completes exactly once, with
/// `set_value(Value)`, `set_error(Error)`, or (iff
/// [`SENDS_DONE`](`Sender::SENDS_DONE`)) `set_done`.
pub trait Sender {
	/// The value payload, as a single type. A sender with several possible
	/// value shapes advertises their closed sum as an `enum`.
	type Value;
	/// The error payload.
	type Error;

	/// The operation state produced by [`connect`](`Sender::connect`).
	type Operation<R>: OperationState
	where
		R: Receiver<Value = Self::Value, Error = Self::Error>;

	/// Whether operations from this sender may complete with `set_done`.
	const SENDS_DONE: bool;

	/// The static blocking category; see [`Blocking`].
	const BLOCKING: Blocking = Blocking::Maybe;

	/// Whether operations from this sender complete on the same scheduler
	/// context they began on. Purely an advertisement consumed by scheduler
	/// collaborators; nothing in this workspace branches on it.
	const SCHEDULER_AFFINE: bool = true;

	/// Binds this sender to `receiver`, producing an inert operation state.
	fn connect<R>(self, receiver: R) -> Self::Operation<R>
	where
		R: Receiver<Value = Self::Value, Error = Self::Error>;
}
