//! Value transform. See [`then`].

use core::marker::PhantomData;

use phloem::{
	receiver::Receiver,
	sender::{Blocking, Sender},
	stop::StopToken,
};

/// Sender adapter mapping the predecessor's value through a closure.
/// See [`then`].
#[derive(Debug, Clone)]
#[must_use = "senders do nothing unless connected and started"]
pub struct Then<P, F> {
	pred: P,
	func: F,
}

/// Wraps `pred` so that a value `v` completes downstream as `func(v)`.
///
/// `Error` and `Done` propagate unchanged, as do the blocking category and
/// the done bit. A fallible transform should return a [`Result`] value and
/// branch downstream; a panicking transform is a programming error and
/// unwinds.
pub fn then<P, F, T>(pred: P, func: F) -> Then<P, F>
where
	P: Sender,
	F: FnOnce(P::Value) -> T,
{
	Then { pred, func }
}

impl<P, F, T> Sender for Then<P, F>
where
	P: Sender,
	F: FnOnce(P::Value) -> T,
{
	type Value = T;
	type Error = P::Error;
	// The transform lives entirely in the wrapped receiver, so the operation
	// *is* the predecessor's.
	type Operation<R>
		= P::Operation<ThenReceiver<P, F, R>>
	where
		R: Receiver<Value = T, Error = P::Error>;

	const SENDS_DONE: bool = P::SENDS_DONE;
	const BLOCKING: Blocking = P::BLOCKING;
	const SCHEDULER_AFFINE: bool = P::SCHEDULER_AFFINE;

	fn connect<R>(self, receiver: R) -> Self::Operation<R>
	where
		R: Receiver<Value = T, Error = P::Error>,
	{
		self.pred.connect(ThenReceiver {
			func: self.func,
			receiver,
			_pred: PhantomData,
		})
	}
}

/// Receiver wrapper applying the transform on the value path.
#[derive(Debug)]
pub struct ThenReceiver<P, F, R> {
	func: F,
	receiver: R,
	_pred: PhantomData<fn(P)>,
}

impl<P, F, T, R> Receiver for ThenReceiver<P, F, R>
where
	P: Sender,
	F: FnOnce(P::Value) -> T,
	R: Receiver<Value = T, Error = P::Error>,
{
	type Value = P::Value;
	type Error = P::Error;

	fn set_value(self, value: P::Value) {
		self.receiver.set_value((self.func)(value));
	}

	fn set_error(self, error: P::Error) {
		self.receiver.set_error(error);
	}

	fn set_done(self) {
		self.receiver.set_done();
	}

	fn stop_token(&self) -> StopToken<'_> {
		self.receiver.stop_token()
	}
}
