//! Error-driven retry loop. See [`retry_when`].

use core::{marker::PhantomPinned, pin::Pin, ptr::NonNull};

use phloem::{
	operation::OperationState,
	receiver::Receiver,
	sender::{Blocking, Sender},
	slot::{OpSlot, Slot},
	stop::StopToken,
};

/// Sender adapter retrying its source on error. See [`retry_when`].
#[derive(Debug, Clone)]
#[must_use = "senders do nothing unless connected and started"]
pub struct RetryWhen<S, F> {
	source: S,
	func: F,
}

/// Runs `source`; on an error, hands it to `func`, starts the *trigger*
/// sender it returns, and reconnects a clone of the source once the trigger
/// completes with a value (backoff delays are the canonical trigger). A
/// trigger `Error` or `Done` propagates downstream instead, as do the
/// source's value and `Done` signals.
///
/// The adapter's error type is the trigger's, since source errors are always
/// consumed by `func`.
pub fn retry_when<S, F, T>(source: S, func: F) -> RetryWhen<S, F>
where
	S: Sender + Clone,
	F: FnMut(S::Error) -> T,
	T: Sender<Value = ()>,
{
	RetryWhen { source, func }
}

impl<S, F, T> Sender for RetryWhen<S, F>
where
	S: Sender + Clone,
	F: FnMut(S::Error) -> T,
	T: Sender<Value = ()>,
{
	type Value = S::Value;
	type Error = T::Error;
	type Operation<R>
		= RetryWhenOperation<S, F, T, R>
	where
		R: Receiver<Value = S::Value, Error = T::Error>;

	const SENDS_DONE: bool = S::SENDS_DONE || T::SENDS_DONE;
	const BLOCKING: Blocking = S::BLOCKING.sequence(T::BLOCKING);

	fn connect<R>(self, receiver: R) -> Self::Operation<R>
	where
		R: Receiver<Value = S::Value, Error = T::Error>,
	{
		RetryWhenOperation {
			source: Slot::with(self.source),
			func: Slot::with(self.func),
			receiver: Slot::with(receiver),
			source_op: OpSlot::empty(),
			trigger_op: OpSlot::empty(),
			_pinned: PhantomPinned,
		}
	}
}

/// The source and trigger operations alternate; at most one of the two slots
/// is occupied at a time.
pub struct RetryWhenOperation<S, F, T, R>
where
	S: Sender + Clone,
	F: FnMut(S::Error) -> T,
	T: Sender<Value = ()>,
	R: Receiver<Value = S::Value, Error = T::Error>,
{
	source: Slot<S>,
	func: Slot<F>,
	receiver: Slot<R>,
	source_op: OpSlot<S, RetrySourceReceiver<S, F, T, R>>,
	trigger_op: OpSlot<T, RetryTriggerReceiver<S, F, T, R>>,
	_pinned: PhantomPinned,
}

impl<S, F, T, R> RetryWhenOperation<S, F, T, R>
where
	S: Sender + Clone,
	F: FnMut(S::Error) -> T,
	T: Sender<Value = ()>,
	R: Receiver<Value = S::Value, Error = T::Error>,
{
	fn connect_source(&self) {
		let op = NonNull::from(self);
		let source = unsafe { self.source.get() }.clone();
		unsafe {
			self.source_op
				.connect_and_start(source, || RetrySourceReceiver { op });
		}
	}
}

impl<S, F, T, R> OperationState for RetryWhenOperation<S, F, T, R>
where
	S: Sender + Clone,
	F: FnMut(S::Error) -> T,
	T: Sender<Value = ()>,
	R: Receiver<Value = S::Value, Error = T::Error>,
{
	fn start(self: Pin<&mut Self>) {
		self.into_ref().get_ref().connect_source();
	}
}

pub struct RetrySourceReceiver<S, F, T, R>
where
	S: Sender + Clone,
	F: FnMut(S::Error) -> T,
	T: Sender<Value = ()>,
	R: Receiver<Value = S::Value, Error = T::Error>,
{
	op: NonNull<RetryWhenOperation<S, F, T, R>>,
}

/// # Safety
///
/// A completing attempt hands the retry loop to its thread; everything it may
/// touch there is required to be [`Send`].
unsafe impl<S, F, T, R> Send for RetrySourceReceiver<S, F, T, R>
where
	S: Sender + Clone + Send,
	S::Value: Send,
	S::Error: Send,
	F: FnMut(S::Error) -> T + Send,
	T: Sender<Value = ()>,
	R: Receiver<Value = S::Value, Error = T::Error> + Send,
{
}

impl<S, F, T, R> Receiver for RetrySourceReceiver<S, F, T, R>
where
	S: Sender + Clone,
	F: FnMut(S::Error) -> T,
	T: Sender<Value = ()>,
	R: Receiver<Value = S::Value, Error = T::Error>,
{
	type Value = S::Value;
	type Error = S::Error;

	fn set_value(self, value: S::Value) {
		let op = unsafe { self.op.as_ref() };
		unsafe { op.receiver.take() }
			.expect("completes once")
			.set_value(value);
	}

	fn set_error(self, error: S::Error) {
		let op_ptr = self.op;
		let op = unsafe { op_ptr.as_ref() };
		unsafe {
			op.source_op.vacate();
			let trigger = op.func.get_mut()(error);
			op.trigger_op
				.connect_and_start(trigger, || RetryTriggerReceiver { op: op_ptr });
		}
	}

	fn set_done(self) {
		let op = unsafe { self.op.as_ref() };
		unsafe { op.receiver.take() }
			.expect("completes once")
			.set_done();
	}

	fn stop_token(&self) -> StopToken<'_> {
		let op = unsafe { self.op.as_ref() };
		unsafe { op.receiver.get() }.stop_token()
	}
}

pub struct RetryTriggerReceiver<S, F, T, R>
where
	S: Sender + Clone,
	F: FnMut(S::Error) -> T,
	T: Sender<Value = ()>,
	R: Receiver<Value = S::Value, Error = T::Error>,
{
	op: NonNull<RetryWhenOperation<S, F, T, R>>,
}

/// # Safety
///
/// See [`RetrySourceReceiver`]'s [`Send`] implementation.
unsafe impl<S, F, T, R> Send for RetryTriggerReceiver<S, F, T, R>
where
	S: Sender + Clone + Send,
	S::Value: Send,
	S::Error: Send,
	F: FnMut(S::Error) -> T + Send,
	T: Sender<Value = ()>,
	T::Error: Send,
	R: Receiver<Value = S::Value, Error = T::Error> + Send,
{
}

impl<S, F, T, R> Receiver for RetryTriggerReceiver<S, F, T, R>
where
	S: Sender + Clone,
	F: FnMut(S::Error) -> T,
	T: Sender<Value = ()>,
	R: Receiver<Value = S::Value, Error = T::Error>,
{
	type Value = ();
	type Error = T::Error;

	fn set_value(self, (): ()) {
		let op = unsafe { self.op.as_ref() };
		unsafe { op.trigger_op.vacate() };
		op.connect_source();
	}

	fn set_error(self, error: T::Error) {
		let op = unsafe { self.op.as_ref() };
		unsafe {
			op.trigger_op.vacate();
			op.receiver
				.take()
				.expect("completes once")
				.set_error(error);
		}
	}

	fn set_done(self) {
		let op = unsafe { self.op.as_ref() };
		unsafe {
			op.trigger_op.vacate();
			op.receiver.take().expect("completes once").set_done();
		}
	}

	fn stop_token(&self) -> StopToken<'_> {
		let op = unsafe { self.op.as_ref() };
		unsafe { op.receiver.get() }.stop_token()
	}
}
