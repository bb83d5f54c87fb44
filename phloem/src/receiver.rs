//! The consumer half of the protocol.

use crate::stop::StopToken;

/// Consumes exactly one completion signal.
///
/// A receiver is bound to an operation state at
/// [`connect`](`crate::sender::Sender::connect`) time and consumed by
/// whichever of the three signal handlers fires. Exactly one handler is
/// invoked, exactly once, before the receiver is dropped.
///
/// # Logic
///
/// [`set_error`](`Receiver::set_error`) and [`set_done`](`Receiver::set_done`)
/// **must not** panic; operation states call them from contexts that cannot
/// unwind meaningfully.
pub trait Receiver {
	/// The value payload this receiver accepts. A receiver for a sender with
	/// several possible value shapes accepts their closed sum as an `enum`.
	type Value;
	/// The error payload this receiver accepts.
	type Error;

	/// Consumes the receiver with a value.
	fn set_value(self, value: Self::Value);

	/// Consumes the receiver with an error.
	fn set_error(self, error: Self::Error);

	/// Consumes the receiver with the cancellation-without-failure signal.
	fn set_done(self);

	/// The stop token an operation bound to this receiver observes.
	///
	/// Cancellation-aware operations register a
	/// [`StopCallback`](`crate::stop::StopCallback`) on it. The default is the
	/// unstoppable token.
	fn stop_token(&self) -> StopToken<'_> {
		StopToken::never()
	}
}
