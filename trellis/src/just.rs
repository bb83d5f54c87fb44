//! Value factories: senders that complete immediately on `start`.
//!
//! The channels a factory does not use are phantom, so that the concrete
//! type is inferred from the composition it takes part in (annotate with a
//! turbofish where nothing constrains it, as with `futures`' `ok`/`err`).

use core::{marker::PhantomData, pin::Pin};

use phloem::{
	operation::OperationState,
	receiver::Receiver,
	sender::{Blocking, Sender},
};

/// Sender that completes inline with a value. See [`just`].
#[derive(Debug, Clone)]
#[must_use = "senders do nothing unless connected and started"]
pub struct Just<T, E> {
	value: T,
	_error: PhantomData<fn() -> E>,
}

/// Returns a sender that completes inline with `value`.
pub fn just<T, E>(value: T) -> Just<T, E> {
	Just {
		value,
		_error: PhantomData,
	}
}

impl<T, E> Sender for Just<T, E> {
	type Value = T;
	type Error = E;
	type Operation<R>
		= InlineOperation<WithValue<T>, R>
	where
		R: Receiver<Value = T, Error = E>;

	const SENDS_DONE: bool = false;
	const BLOCKING: Blocking = Blocking::AlwaysInline;

	fn connect<R>(self, receiver: R) -> Self::Operation<R>
	where
		R: Receiver<Value = T, Error = E>,
	{
		InlineOperation {
			inner: Some((WithValue(self.value), receiver)),
		}
	}
}

/// Sender that completes inline with an error. See [`just_error`].
#[derive(Debug, Clone)]
#[must_use = "senders do nothing unless connected and started"]
pub struct JustError<T, E> {
	error: E,
	_value: PhantomData<fn() -> T>,
}

/// Returns a sender that completes inline with `error`.
pub fn just_error<T, E>(error: E) -> JustError<T, E> {
	JustError {
		error,
		_value: PhantomData,
	}
}

impl<T, E> Sender for JustError<T, E> {
	type Value = T;
	type Error = E;
	type Operation<R>
		= InlineOperation<WithError<E>, R>
	where
		R: Receiver<Value = T, Error = E>;

	const SENDS_DONE: bool = false;
	const BLOCKING: Blocking = Blocking::AlwaysInline;

	fn connect<R>(self, receiver: R) -> Self::Operation<R>
	where
		R: Receiver<Value = T, Error = E>,
	{
		InlineOperation {
			inner: Some((WithError(self.error), receiver)),
		}
	}
}

/// Sender that completes inline with `Done`. See [`just_done`].
#[derive(Debug, Clone)]
#[must_use = "senders do nothing unless connected and started"]
pub struct JustDone<T, E> {
	_payloads: PhantomData<fn() -> (T, E)>,
}

/// Returns a sender that completes inline with the cancellation signal.
pub fn just_done<T, E>() -> JustDone<T, E> {
	JustDone {
		_payloads: PhantomData,
	}
}

impl<T, E> Sender for JustDone<T, E> {
	type Value = T;
	type Error = E;
	type Operation<R>
		= InlineOperation<WithDone, R>
	where
		R: Receiver<Value = T, Error = E>;

	const SENDS_DONE: bool = true;
	const BLOCKING: Blocking = Blocking::AlwaysInline;

	fn connect<R>(self, receiver: R) -> Self::Operation<R>
	where
		R: Receiver<Value = T, Error = E>,
	{
		InlineOperation {
			inner: Some((WithDone, receiver)),
		}
	}
}

/// Sender that invokes a closure on `start` and completes inline with its
/// result. See [`just_from`].
#[derive(Debug, Clone)]
#[must_use = "senders do nothing unless connected and started"]
pub struct JustFrom<F, E> {
	func: F,
	_error: PhantomData<fn() -> E>,
}

/// Returns a sender that completes inline with `func()`.
pub fn just_from<F, T, E>(func: F) -> JustFrom<F, E>
where
	F: FnOnce() -> T,
{
	JustFrom {
		func,
		_error: PhantomData,
	}
}

impl<F, T, E> Sender for JustFrom<F, E>
where
	F: FnOnce() -> T,
{
	type Value = T;
	type Error = E;
	type Operation<R>
		= InlineOperation<FromFn<F>, R>
	where
		R: Receiver<Value = T, Error = E>;

	const SENDS_DONE: bool = false;
	const BLOCKING: Blocking = Blocking::AlwaysInline;

	fn connect<R>(self, receiver: R) -> Self::Operation<R>
	where
		R: Receiver<Value = T, Error = E>,
	{
		InlineOperation {
			inner: Some((FromFn(self.func), receiver)),
		}
	}
}

/// The one thing an [`InlineOperation`] does when started.
pub trait InlineSignal<R: Receiver> {
	fn deliver(self, receiver: R);
}

#[derive(Debug)]
pub struct WithValue<T>(T);
#[derive(Debug)]
pub struct WithError<E>(E);
#[derive(Debug)]
pub struct WithDone;
#[derive(Debug)]
pub struct FromFn<F>(F);

impl<T, R> InlineSignal<R> for WithValue<T>
where
	R: Receiver<Value = T>,
{
	fn deliver(self, receiver: R) {
		receiver.set_value(self.0);
	}
}

impl<E, R> InlineSignal<R> for WithError<E>
where
	R: Receiver<Error = E>,
{
	fn deliver(self, receiver: R) {
		receiver.set_error(self.0);
	}
}

impl<R: Receiver> InlineSignal<R> for WithDone {
	fn deliver(self, receiver: R) {
		receiver.set_done();
	}
}

impl<F, T, R> InlineSignal<R> for FromFn<F>
where
	F: FnOnce() -> T,
	R: Receiver<Value = T>,
{
	fn deliver(self, receiver: R) {
		receiver.set_value((self.0)());
	}
}

/// Shared operation state of the factories: delivers one prepared signal.
#[derive(Debug)]
pub struct InlineOperation<D, R> {
	inner: Option<(D, R)>,
}

impl<D, R> OperationState for InlineOperation<D, R>
where
	D: InlineSignal<R>,
	R: Receiver,
{
	fn start(self: Pin<&mut Self>) {
		// No address-sensitive state; completes before returning.
		let (signal, receiver) = unsafe { self.get_unchecked_mut() }
			.inner
			.take()
			.expect("started at most once");
		signal.deliver(receiver);
	}
}
