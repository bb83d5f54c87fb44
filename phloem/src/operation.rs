//! The operation-state half of the connect/start protocol.

use core::pin::Pin;

/// An operation produced by [`connect`](`crate::sender::Sender::connect`),
/// inert until [`start`](`OperationState::start`)ed.
///
/// # Logic
///
/// An operation value may be moved between `connect` and `start`; pinning
/// makes it address-stable from `start` on, which is what lets child
/// operations hold pointers back into the parent that embeds them.
///
/// `start` **must** be called at most once. It **must not** panic. It may
/// complete the operation synchronously, in which case the receiver's signal
/// handler has already run when `start` returns.
///
/// The bound receiver's signal handler is always invoked before the operation
/// becomes destructible, and an operation **must not** touch its own state
/// after delivering its completion signal: delivering the signal is what
/// hands ownership of the operation's storage back to whoever embeds it.
pub trait OperationState {
	/// Starts the operation. At most once.
	fn start(self: Pin<&mut Self>);
}
