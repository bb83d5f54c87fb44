//! The reified completion-signal vocabulary.

/// One completion signal, reified as a value.
///
/// Every operation completes exactly once with exactly one of these.
/// Aggregating adapters use this to store a child's outcome until it can be
/// re-delivered downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Completion<T, E> {
	/// Successful completion with a value payload.
	Value(T),
	/// Failed completion with an error payload.
	Error(E),
	/// Cancellation without failure. Carries nothing.
	Done,
}

impl<T, E> Completion<T, E> {
	/// `true` iff this is [`Completion::Value`].
	#[must_use]
	pub const fn is_value(&self) -> bool {
		matches!(self, Self::Value(_))
	}

	/// Collapses into the conventional blocking-wait shape: `Done` becomes
	/// `Ok(None)`.
	///
	/// # Errors
	///
	/// Returns the error payload of [`Completion::Error`].
	pub fn into_result(self) -> Result<Option<T>, E> {
		match self {
			Self::Value(value) => Ok(Some(value)),
			Self::Error(error) => Err(error),
			Self::Done => Ok(None),
		}
	}
}
