//! Dynamic-scope extension on the value path. See [`let_value`].

use core::{marker::PhantomPinned, pin::Pin, ptr::NonNull};

use phloem::{
	operation::OperationState,
	receiver::Receiver,
	sender::{Blocking, Sender},
	slot::{OpSlot, Slot},
	stop::StopToken,
};

/// Sender adapter extending the predecessor's value's lifetime across a
/// successor operation. See [`let_value`].
#[derive(Debug, Clone)]
#[must_use = "senders do nothing unless connected and started"]
pub struct LetValue<P, F> {
	pred: P,
	func: F,
}

/// When `pred` completes with a value, stores it inside the operation and
/// starts the sender built by `func` over it; the stored value is dropped
/// only after that successor has completed, just before the downstream
/// receiver is signalled with the successor's result.
///
/// `Error` and `Done` from `pred` propagate unchanged.
///
/// The successor cannot borrow from the `&mut` argument; what the storage
/// buys is the drop ordering, which side-effectful payloads can observe.
pub fn let_value<P, F, S>(pred: P, func: F) -> LetValue<P, F>
where
	P: Sender,
	F: FnOnce(&mut P::Value) -> S,
	S: Sender<Error = P::Error>,
{
	LetValue { pred, func }
}

impl<P, F, S> Sender for LetValue<P, F>
where
	P: Sender,
	F: FnOnce(&mut P::Value) -> S,
	S: Sender<Error = P::Error>,
{
	type Value = S::Value;
	type Error = P::Error;
	type Operation<R>
		= LetValueOperation<P, F, S, R>
	where
		R: Receiver<Value = S::Value, Error = P::Error>;

	const SENDS_DONE: bool = P::SENDS_DONE || S::SENDS_DONE;
	const BLOCKING: Blocking = P::BLOCKING.sequence(S::BLOCKING);

	fn connect<R>(self, receiver: R) -> Self::Operation<R>
	where
		R: Receiver<Value = S::Value, Error = P::Error>,
	{
		LetValueOperation {
			pred_sender: Slot::with(self.pred),
			func: Slot::with(self.func),
			value: Slot::empty(),
			receiver: Slot::with(receiver),
			pred_op: OpSlot::empty(),
			succ_op: OpSlot::empty(),
			_pinned: PhantomPinned,
		}
	}
}

/// Construction order: predecessor operation first; stored value only on its
/// value signal; successor operation only after the value is stored.
/// Teardown in reverse, with the value outliving the successor operation.
pub struct LetValueOperation<P, F, S, R>
where
	P: Sender,
	F: FnOnce(&mut P::Value) -> S,
	S: Sender<Error = P::Error>,
	R: Receiver<Value = S::Value, Error = P::Error>,
{
	pred_sender: Slot<P>,
	func: Slot<F>,
	value: Slot<P::Value>,
	receiver: Slot<R>,
	pred_op: OpSlot<P, LetValuePredReceiver<P, F, S, R>>,
	succ_op: OpSlot<S, LetValueSuccReceiver<P, F, S, R>>,
	_pinned: PhantomPinned,
}

impl<P, F, S, R> OperationState for LetValueOperation<P, F, S, R>
where
	P: Sender,
	F: FnOnce(&mut P::Value) -> S,
	S: Sender<Error = P::Error>,
	R: Receiver<Value = S::Value, Error = P::Error>,
{
	fn start(self: Pin<&mut Self>) {
		let this = self.into_ref().get_ref();
		let op = NonNull::from(this);
		unsafe {
			let pred = this.pred_sender.take().expect("started at most once");
			this.pred_op
				.connect_and_start(pred, || LetValuePredReceiver { op });
		}
	}
}

pub struct LetValuePredReceiver<P, F, S, R>
where
	P: Sender,
	F: FnOnce(&mut P::Value) -> S,
	S: Sender<Error = P::Error>,
	R: Receiver<Value = S::Value, Error = P::Error>,
{
	op: NonNull<LetValueOperation<P, F, S, R>>,
}

/// # Safety
///
/// A completing predecessor hands the parent operation to this thread; the
/// payloads that cross with it are required to be [`Send`].
unsafe impl<P, F, S, R> Send for LetValuePredReceiver<P, F, S, R>
where
	P: Sender,
	P::Value: Send,
	P::Error: Send,
	F: FnOnce(&mut P::Value) -> S + Send,
	S: Sender<Error = P::Error>,
	R: Receiver<Value = S::Value, Error = P::Error> + Send,
{
}

impl<P, F, S, R> Receiver for LetValuePredReceiver<P, F, S, R>
where
	P: Sender,
	F: FnOnce(&mut P::Value) -> S,
	S: Sender<Error = P::Error>,
	R: Receiver<Value = S::Value, Error = P::Error>,
{
	type Value = P::Value;
	type Error = P::Error;

	fn set_value(self, value: P::Value) {
		let op_ptr = self.op;
		let op = unsafe { op_ptr.as_ref() };
		unsafe {
			op.value.set(value);
			// The predecessor operation delivered its signal; drop it before
			// anything of the successor exists.
			op.pred_op.vacate();
			let func = op.func.take().expect("predecessor completes once");
			let succ = func(op.value.get_mut());
			op.succ_op
				.connect_and_start(succ, || LetValueSuccReceiver { op: op_ptr });
		}
	}

	fn set_error(self, error: P::Error) {
		let op = unsafe { self.op.as_ref() };
		unsafe {
			op.pred_op.vacate();
			op.func.clear();
			op.receiver
				.take()
				.expect("completes once")
				.set_error(error);
		}
	}

	fn set_done(self) {
		let op = unsafe { self.op.as_ref() };
		unsafe {
			op.pred_op.vacate();
			op.func.clear();
			op.receiver.take().expect("completes once").set_done();
		}
	}

	fn stop_token(&self) -> StopToken<'_> {
		let op = unsafe { self.op.as_ref() };
		unsafe { op.receiver.get() }.stop_token()
	}
}

pub struct LetValueSuccReceiver<P, F, S, R>
where
	P: Sender,
	F: FnOnce(&mut P::Value) -> S,
	S: Sender<Error = P::Error>,
	R: Receiver<Value = S::Value, Error = P::Error>,
{
	op: NonNull<LetValueOperation<P, F, S, R>>,
}

/// # Safety
///
/// See [`LetValuePredReceiver`]'s [`Send`] implementation.
unsafe impl<P, F, S, R> Send for LetValueSuccReceiver<P, F, S, R>
where
	P: Sender,
	P::Value: Send,
	P::Error: Send,
	F: FnOnce(&mut P::Value) -> S + Send,
	S: Sender<Error = P::Error>,
	S::Value: Send,
	R: Receiver<Value = S::Value, Error = P::Error> + Send,
{
}

impl<P, F, S, R> LetValueSuccReceiver<P, F, S, R>
where
	P: Sender,
	F: FnOnce(&mut P::Value) -> S,
	S: Sender<Error = P::Error>,
	R: Receiver<Value = S::Value, Error = P::Error>,
{
	/// Tears down the successor operation, then the stored value, then takes
	/// the downstream receiver.
	fn finish(self) -> R {
		let op = unsafe { self.op.as_ref() };
		unsafe {
			op.succ_op.vacate();
			op.value.clear();
			op.receiver.take().expect("completes once")
		}
	}
}

impl<P, F, S, R> Receiver for LetValueSuccReceiver<P, F, S, R>
where
	P: Sender,
	F: FnOnce(&mut P::Value) -> S,
	S: Sender<Error = P::Error>,
	R: Receiver<Value = S::Value, Error = P::Error>,
{
	type Value = S::Value;
	type Error = P::Error;

	fn set_value(self, value: S::Value) {
		self.finish().set_value(value);
	}

	fn set_error(self, error: P::Error) {
		self.finish().set_error(error);
	}

	fn set_done(self) {
		self.finish().set_done();
	}

	fn stop_token(&self) -> StopToken<'_> {
		let op = unsafe { self.op.as_ref() };
		unsafe { op.receiver.get() }.stop_token()
	}
}
