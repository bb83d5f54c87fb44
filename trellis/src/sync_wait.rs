//! The blocking bridge out of the sender world. See [`sync_wait`].

use core::{cell::Cell, pin::pin};

use parking_lot::{Condvar, Mutex};
use phloem::{
	completion::Completion,
	operation::OperationState,
	receiver::Receiver,
	sender::Sender,
	stop::StopToken,
};

/// Drives `sender` to completion on the current thread.
///
/// `Done` maps to `Ok(None)`, a value to `Ok(Some(value))`.
///
/// Senders whose blocking category guarantees completion before `start`
/// returns are driven through a thread-unsafe promise; everything else waits
/// on a condition variable.
///
/// # Errors
///
/// Propagates the sender's error signal.
pub fn sync_wait<S: Sender>(sender: S) -> Result<Option<S::Value>, S::Error> {
	sync_wait_with_token(sender, StopToken::never())
}

/// [`sync_wait`] with a caller-supplied stop token, so the wait itself can be
/// cancelled from outside (conventionally surfacing as `Ok(None)` once the
/// sender observes the request and completes with `Done`).
///
/// # Errors
///
/// Propagates the sender's error signal.
pub fn sync_wait_with_token<S: Sender>(
	sender: S,
	token: StopToken<'_>,
) -> Result<Option<S::Value>, S::Error> {
	if S::BLOCKING.is_always() {
		let promise = InlinePromise {
			state: Cell::new(None),
		};
		let mut operation = pin!(sender.connect(InlineReceiver {
			promise: &promise,
			token,
		}));
		operation.as_mut().start();
		promise
			.state
			.take()
			.expect("an always-blocking sender completes before start returns")
			.into_result()
	} else {
		let promise = BlockingPromise {
			state: Mutex::new(None),
			completed: Condvar::new(),
		};
		let mut operation = pin!(sender.connect(BlockingReceiver {
			promise: &promise,
			token,
		}));
		operation.as_mut().start();

		let mut state = promise.state.lock();
		while state.is_none() {
			promise.completed.wait(&mut state);
		}
		let completion = state.take().expect("unreachable");
		drop(state);
		completion.into_result()
	}
}

struct InlinePromise<V, E> {
	state: Cell<Option<Completion<V, E>>>,
}

struct InlineReceiver<'a, 't, V, E> {
	promise: &'a InlinePromise<V, E>,
	token: StopToken<'t>,
}

impl<V, E> Receiver for InlineReceiver<'_, '_, V, E> {
	type Value = V;
	type Error = E;

	fn set_value(self, value: V) {
		self.promise.state.set(Some(Completion::Value(value)));
	}

	fn set_error(self, error: E) {
		self.promise.state.set(Some(Completion::Error(error)));
	}

	fn set_done(self) {
		self.promise.state.set(Some(Completion::Done));
	}

	fn stop_token(&self) -> StopToken<'_> {
		self.token
	}
}

struct BlockingPromise<V, E> {
	state: Mutex<Option<Completion<V, E>>>,
	completed: Condvar,
}

struct BlockingReceiver<'a, 't, V, E> {
	promise: &'a BlockingPromise<V, E>,
	token: StopToken<'t>,
}

impl<V, E> BlockingReceiver<'_, '_, V, E> {
	fn complete(self, completion: Completion<V, E>) {
		*self.promise.state.lock() = Some(completion);
		self.promise.completed.notify_one();
	}
}

impl<V, E> Receiver for BlockingReceiver<'_, '_, V, E> {
	type Value = V;
	type Error = E;

	fn set_value(self, value: V) {
		self.complete(Completion::Value(value));
	}

	fn set_error(self, error: E) {
		self.complete(Completion::Error(error));
	}

	fn set_done(self) {
		self.complete(Completion::Done);
	}

	fn stop_token(&self) -> StopToken<'_> {
		self.token
	}
}
