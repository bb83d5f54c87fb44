//! Dynamic-scope extension on the error path. See [`let_error`].

use core::{marker::PhantomPinned, pin::Pin, ptr::NonNull};

use phloem::{
	operation::OperationState,
	receiver::Receiver,
	sender::{Blocking, Sender},
	slot::{OpSlot, Slot},
	stop::StopToken,
};

/// Sender adapter intercepting the predecessor's error with a successor
/// sender. See [`let_error`].
#[derive(Debug, Clone)]
#[must_use = "senders do nothing unless connected and started"]
pub struct LetError<P, F> {
	pred: P,
	func: F,
}

/// When `pred` completes with an error, starts the sender built by
/// `func(error)` in its place; the successor must produce the same value
/// type, and its error type becomes the adapter's.
///
/// `Value` and `Done` from `pred` propagate unchanged.
pub fn let_error<P, F, S>(pred: P, func: F) -> LetError<P, F>
where
	P: Sender,
	F: FnOnce(P::Error) -> S,
	S: Sender<Value = P::Value>,
{
	LetError { pred, func }
}

impl<P, F, S> Sender for LetError<P, F>
where
	P: Sender,
	F: FnOnce(P::Error) -> S,
	S: Sender<Value = P::Value>,
{
	type Value = P::Value;
	type Error = S::Error;
	type Operation<R>
		= LetErrorOperation<P, F, S, R>
	where
		R: Receiver<Value = P::Value, Error = S::Error>;

	const SENDS_DONE: bool = P::SENDS_DONE || S::SENDS_DONE;
	const BLOCKING: Blocking = P::BLOCKING.sequence(S::BLOCKING);

	fn connect<R>(self, receiver: R) -> Self::Operation<R>
	where
		R: Receiver<Value = P::Value, Error = S::Error>,
	{
		LetErrorOperation {
			pred_sender: Slot::with(self.pred),
			func: Slot::with(self.func),
			receiver: Slot::with(receiver),
			pred_op: OpSlot::empty(),
			succ_op: OpSlot::empty(),
			_pinned: PhantomPinned,
		}
	}
}

/// The successor connects directly to the downstream receiver; only the
/// predecessor needs a parent-pointing wrapper.
pub struct LetErrorOperation<P, F, S, R>
where
	P: Sender,
	F: FnOnce(P::Error) -> S,
	S: Sender<Value = P::Value>,
	R: Receiver<Value = P::Value, Error = S::Error>,
{
	pred_sender: Slot<P>,
	func: Slot<F>,
	receiver: Slot<R>,
	pred_op: OpSlot<P, LetErrorPredReceiver<P, F, S, R>>,
	succ_op: OpSlot<S, R>,
	_pinned: PhantomPinned,
}

impl<P, F, S, R> OperationState for LetErrorOperation<P, F, S, R>
where
	P: Sender,
	F: FnOnce(P::Error) -> S,
	S: Sender<Value = P::Value>,
	R: Receiver<Value = P::Value, Error = S::Error>,
{
	fn start(self: Pin<&mut Self>) {
		let this = self.into_ref().get_ref();
		let op = NonNull::from(this);
		unsafe {
			let pred = this.pred_sender.take().expect("started at most once");
			this.pred_op
				.connect_and_start(pred, || LetErrorPredReceiver { op });
		}
	}
}

pub struct LetErrorPredReceiver<P, F, S, R>
where
	P: Sender,
	F: FnOnce(P::Error) -> S,
	S: Sender<Value = P::Value>,
	R: Receiver<Value = P::Value, Error = S::Error>,
{
	op: NonNull<LetErrorOperation<P, F, S, R>>,
}

/// # Safety
///
/// A completing predecessor hands the parent operation to this thread; the
/// payloads that cross with it are required to be [`Send`].
unsafe impl<P, F, S, R> Send for LetErrorPredReceiver<P, F, S, R>
where
	P: Sender,
	P::Value: Send,
	P::Error: Send,
	F: FnOnce(P::Error) -> S + Send,
	S: Sender<Value = P::Value>,
	R: Receiver<Value = P::Value, Error = S::Error> + Send,
{
}

impl<P, F, S, R> Receiver for LetErrorPredReceiver<P, F, S, R>
where
	P: Sender,
	F: FnOnce(P::Error) -> S,
	S: Sender<Value = P::Value>,
	R: Receiver<Value = P::Value, Error = S::Error>,
{
	type Value = P::Value;
	type Error = P::Error;

	fn set_value(self, value: P::Value) {
		let op = unsafe { self.op.as_ref() };
		unsafe {
			op.func.clear();
			op.receiver.take().expect("completes once").set_value(value);
		}
	}

	fn set_error(self, error: P::Error) {
		let op = unsafe { self.op.as_ref() };
		unsafe {
			op.pred_op.vacate();
			let func = op.func.take().expect("predecessor completes once");
			let succ = func(error);
			op.succ_op.connect_and_start(succ, || {
				op.receiver.take().expect("completes once")
			});
		}
	}

	fn set_done(self) {
		let op = unsafe { self.op.as_ref() };
		unsafe {
			op.func.clear();
			op.receiver.take().expect("completes once").set_done();
		}
	}

	fn stop_token(&self) -> StopToken<'_> {
		let op = unsafe { self.op.as_ref() };
		unsafe { op.receiver.get() }.stop_token()
	}
}
