#![warn(clippy::pedantic)]

//! Structured asynchronous composition over the
//! [phloem](https://crates.io/crates/phloem) sender/receiver protocol.
//!
//! A program describes its whole computation by composing senders with the
//! adapters here, then drives the result exactly once, through
//! [`sync_wait`] or an [`AsyncScope`]. Execution is lazy, cancellable
//! through the stop-token substrate, and allocation stays inside the
//! operation states the adapters build.

pub use phloem::{
	completion::Completion,
	operation::OperationState,
	receiver::Receiver,
	scheduler::Scheduler,
	sender::{Blocking, Sender},
	stop::{FnStop, ForwardStopRequest, StopCallback, StopFn, StopSource, StopToken},
};

mod just;
pub use just::{just, just_done, just_error, just_from, Just, JustDone, JustError, JustFrom};

mod then;
pub use then::{then, Then};

mod let_value;
pub use let_value::{let_value, LetValue};

mod let_error;
pub use let_error::{let_error, LetError};

mod let_done;
pub use let_done::{let_done, LetDone};

mod when_all;
pub use when_all::{when_all, WhenAll2, WhenAll3, WhenAll4, WhenAllList};

mod when_all_range;
pub use when_all_range::{when_all_range, WhenAllRange};

mod stop_when;
pub use stop_when::{stop_when, StopWhen};

mod repeat;
pub use repeat::{repeat_effect, repeat_effect_until, RepeatEffectUntil};

mod retry_when;
pub use retry_when::{retry_when, RetryWhen};

mod detach;
pub use detach::{detach_on_cancel, DetachOnCancel};

mod sync_wait;
pub use sync_wait::{sync_wait, sync_wait_with_token};

mod event;
pub use event::{ManualResetEvent, Wait};

mod mutex;
pub use mutex::{
	AsyncMutex, AsyncMutexGuard, AsyncRwLock, AsyncRwLockReadGuard, AsyncRwLockWriteGuard, Lock,
	LockExclusive, LockShared,
};

mod scope;
pub use scope::{AsyncScope, Join, Nest};

/// Method syntax for the adapters, for senders composed left to right.
pub trait SenderExt: Sender + Sized {
	/// [`then`] with `self` as the predecessor.
	fn then<F, T>(self, func: F) -> Then<Self, F>
	where
		F: FnOnce(Self::Value) -> T,
	{
		then(self, func)
	}

	/// [`let_value`] with `self` as the predecessor.
	fn let_value<F, S>(self, func: F) -> LetValue<Self, F>
	where
		F: FnOnce(&mut Self::Value) -> S,
		S: Sender<Error = Self::Error>,
	{
		let_value(self, func)
	}

	/// [`let_error`] with `self` as the predecessor.
	fn let_error<F, S>(self, func: F) -> LetError<Self, F>
	where
		F: FnOnce(Self::Error) -> S,
		S: Sender<Value = Self::Value>,
	{
		let_error(self, func)
	}

	/// [`let_done`] with `self` as the predecessor.
	fn let_done<F, S>(self, func: F) -> LetDone<Self, F>
	where
		F: FnOnce() -> S,
		S: Sender<Value = Self::Value, Error = Self::Error>,
	{
		let_done(self, func)
	}

	/// [`stop_when`] with `self` as the source.
	fn stop_when<T: Sender>(self, trigger: T) -> StopWhen<Self, T> {
		stop_when(self, trigger)
	}

	/// [`repeat_effect_until`] with `self` as the effect.
	fn repeat_effect_until<P>(self, predicate: P) -> RepeatEffectUntil<Self, P>
	where
		Self: Sender<Value = ()> + Clone,
		P: FnMut() -> bool,
	{
		repeat_effect_until(self, predicate)
	}

	/// [`retry_when`] with `self` as the source.
	fn retry_when<F, T>(self, func: F) -> RetryWhen<Self, F>
	where
		Self: Clone,
		F: FnMut(Self::Error) -> T,
		T: Sender<Value = ()>,
	{
		retry_when(self, func)
	}

	/// [`detach_on_cancel`] around `self`.
	fn detach_on_cancel(self) -> DetachOnCancel<Self> {
		detach_on_cancel(self)
	}

	/// [`sync_wait`], consuming `self`.
	///
	/// # Errors
	///
	/// Propagates the sender's error signal.
	fn sync_wait(self) -> Result<Option<Self::Value>, Self::Error> {
		sync_wait(self)
	}
}

impl<S: Sender> SenderExt for S {}
