//! Dynamic-scope extension on the cancellation path. See [`let_done`].

use core::{marker::PhantomPinned, pin::Pin, ptr::NonNull};

use phloem::{
	operation::OperationState,
	receiver::Receiver,
	sender::{Blocking, Sender},
	slot::{OpSlot, Slot},
	stop::StopToken,
};

/// Sender adapter replacing the predecessor's `Done` with a successor sender.
/// See [`let_done`].
#[derive(Debug, Clone)]
#[must_use = "senders do nothing unless connected and started"]
pub struct LetDone<P, F> {
	pred: P,
	func: F,
}

/// When `pred` completes with `Done`, starts the sender built by `func()` in
/// its place; the successor must match the predecessor's value and error
/// types.
///
/// `Value` and `Error` from `pred` propagate unchanged. The adapter sends
/// `Done` only if the successor does.
pub fn let_done<P, F, S>(pred: P, func: F) -> LetDone<P, F>
where
	P: Sender,
	F: FnOnce() -> S,
	S: Sender<Value = P::Value, Error = P::Error>,
{
	LetDone { pred, func }
}

impl<P, F, S> Sender for LetDone<P, F>
where
	P: Sender,
	F: FnOnce() -> S,
	S: Sender<Value = P::Value, Error = P::Error>,
{
	type Value = P::Value;
	type Error = P::Error;
	type Operation<R>
		= LetDoneOperation<P, F, S, R>
	where
		R: Receiver<Value = P::Value, Error = P::Error>;

	const SENDS_DONE: bool = S::SENDS_DONE;
	const BLOCKING: Blocking = P::BLOCKING.sequence(S::BLOCKING);

	fn connect<R>(self, receiver: R) -> Self::Operation<R>
	where
		R: Receiver<Value = P::Value, Error = P::Error>,
	{
		LetDoneOperation {
			pred_sender: Slot::with(self.pred),
			func: Slot::with(self.func),
			receiver: Slot::with(receiver),
			pred_op: OpSlot::empty(),
			succ_op: OpSlot::empty(),
			_pinned: PhantomPinned,
		}
	}
}

pub struct LetDoneOperation<P, F, S, R>
where
	P: Sender,
	F: FnOnce() -> S,
	S: Sender<Value = P::Value, Error = P::Error>,
	R: Receiver<Value = P::Value, Error = P::Error>,
{
	pred_sender: Slot<P>,
	func: Slot<F>,
	receiver: Slot<R>,
	pred_op: OpSlot<P, LetDonePredReceiver<P, F, S, R>>,
	succ_op: OpSlot<S, R>,
	_pinned: PhantomPinned,
}

impl<P, F, S, R> OperationState for LetDoneOperation<P, F, S, R>
where
	P: Sender,
	F: FnOnce() -> S,
	S: Sender<Value = P::Value, Error = P::Error>,
	R: Receiver<Value = P::Value, Error = P::Error>,
{
	fn start(self: Pin<&mut Self>) {
		let this = self.into_ref().get_ref();
		let op = NonNull::from(this);
		unsafe {
			let pred = this.pred_sender.take().expect("started at most once");
			this.pred_op
				.connect_and_start(pred, || LetDonePredReceiver { op });
		}
	}
}

pub struct LetDonePredReceiver<P, F, S, R>
where
	P: Sender,
	F: FnOnce() -> S,
	S: Sender<Value = P::Value, Error = P::Error>,
	R: Receiver<Value = P::Value, Error = P::Error>,
{
	op: NonNull<LetDoneOperation<P, F, S, R>>,
}

/// # Safety
///
/// A completing predecessor hands the parent operation to this thread; the
/// payloads that cross with it are required to be [`Send`].
unsafe impl<P, F, S, R> Send for LetDonePredReceiver<P, F, S, R>
where
	P: Sender,
	P::Value: Send,
	P::Error: Send,
	F: FnOnce() -> S + Send,
	S: Sender<Value = P::Value, Error = P::Error>,
	R: Receiver<Value = P::Value, Error = P::Error> + Send,
{
}

impl<P, F, S, R> Receiver for LetDonePredReceiver<P, F, S, R>
where
	P: Sender,
	F: FnOnce() -> S,
	S: Sender<Value = P::Value, Error = P::Error>,
	R: Receiver<Value = P::Value, Error = P::Error>,
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
			op.func.clear();
			op.receiver.take().expect("completes once").set_error(error);
		}
	}

	fn set_done(self) {
		let op = unsafe { self.op.as_ref() };
		unsafe {
			op.pred_op.vacate();
			let func = op.func.take().expect("predecessor completes once");
			let succ = func();
			op.succ_op.connect_and_start(succ, || {
				op.receiver.take().expect("completes once")
			});
		}
	}

	fn stop_token(&self) -> StopToken<'_> {
		let op = unsafe { self.op.as_ref() };
		unsafe { op.receiver.get() }.stop_token()
	}
}
