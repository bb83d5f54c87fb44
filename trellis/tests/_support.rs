//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use core::{
	marker::{PhantomData, PhantomPinned},
	mem,
	pin::Pin,
	ptr::NonNull,
	sync::atomic::{AtomicUsize, Ordering},
	time::Duration,
};
use std::{
	fmt::Debug,
	sync::{Arc, Mutex},
	thread,
};

use phloem::{
	operation::OperationState,
	receiver::Receiver,
	sender::{Blocking, Sender},
	slot::Slot,
	stop::{StopCallback, StopFn},
};
use thiserror::Error;

/// The error type the tests compose over.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TestError {
	#[error("synthetic failure")]
	Boom,
	#[error("attempt {0} failed")]
	Attempt(usize),
}

/// Event recorder in the style of a stack: push from anywhere, then assert
/// and clear in one step.
pub struct Validator<T>(Mutex<Vec<T>>);

impl<T: Debug + PartialEq> Validator<T> {
	pub fn new() -> Self {
		Self(Mutex::new(Vec::new()))
	}

	pub fn push(&self, value: T) {
		self.0.lock().expect("unpoisoned").push(value);
	}

	pub fn expect(&self, expected: impl IntoIterator<Item = T>) {
		let mut recorded = self.0.lock().expect("unpoisoned");
		assert_eq!(
			*recorded,
			expected.into_iter().collect::<Vec<_>>(),
		);
		recorded.clear();
	}
}

/// Pushes a tag into a [`Validator`] when dropped.
pub struct DropTag<'v> {
	pub validator: &'v Validator<&'static str>,
	pub tag: &'static str,
}

impl Debug for DropTag<'_> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_tuple("DropTag").field(&self.tag).finish()
	}
}

impl Drop for DropTag<'_> {
	fn drop(&mut self) {
		self.validator.push(self.tag);
	}
}

/// Sender completing with `()` on a helper thread after `duration`.
#[derive(Debug, Clone)]
pub struct Delay<E> {
	duration: Duration,
	_error: PhantomData<fn() -> E>,
}

pub fn delay<E>(duration: Duration) -> Delay<E> {
	Delay {
		duration,
		_error: PhantomData,
	}
}

impl<E> Sender for Delay<E> {
	type Value = ();
	type Error = E;
	type Operation<R>
		= DelayOperation<R>
	where
		R: Receiver<Value = (), Error = E>;

	const SENDS_DONE: bool = false;
	const BLOCKING: Blocking = Blocking::Never;

	fn connect<R>(self, receiver: R) -> Self::Operation<R>
	where
		R: Receiver<Value = (), Error = E>,
	{
		DelayOperation {
			duration: self.duration,
			receiver: Some(receiver),
		}
	}
}

struct AssertSend<T>(T);
unsafe impl<T> Send for AssertSend<T> {}

pub struct DelayOperation<R> {
	duration: Duration,
	receiver: Option<R>,
}

impl<R> OperationState for DelayOperation<R>
where
	R: Receiver<Value = ()>,
{
	fn start(self: Pin<&mut Self>) {
		let this = unsafe { self.get_unchecked_mut() };
		let duration = this.duration;
		let receiver = this.receiver.take().expect("started at most once");
		let thunk: Box<dyn FnOnce() + '_> = Box::new(move || {
			thread::sleep(duration);
			receiver.set_value(());
		});
		// The protocol keeps everything the receiver refers to alive until
		// the signal lands, and the receivers these tests drive are
		// thread-safe.
		let thunk: Box<dyn FnOnce() + 'static> = unsafe { mem::transmute(thunk) };
		let thunk = AssertSend(thunk);
		thread::spawn(move || {
			let thunk = thunk;
			(thunk.0)()
		});
	}
}

/// Sender that never completes on its own; a stop request completes it with
/// `Done` on the requesting thread.
#[derive(Debug, Clone)]
pub struct Pending<T, E> {
	_payloads: PhantomData<fn() -> (T, E)>,
}

pub fn pending<T, E>() -> Pending<T, E> {
	Pending {
		_payloads: PhantomData,
	}
}

impl<T, E> Sender for Pending<T, E> {
	type Value = T;
	type Error = E;
	type Operation<R>
		= PendingOperation<R>
	where
		R: Receiver<Value = T, Error = E>;

	const SENDS_DONE: bool = true;

	fn connect<R>(self, receiver: R) -> Self::Operation<R>
	where
		R: Receiver<Value = T, Error = E>,
	{
		PendingOperation {
			receiver: Slot::with(receiver),
			callback: Slot::empty(),
			_pinned: PhantomPinned,
		}
	}
}

pub struct PendingOperation<R: Receiver> {
	receiver: Slot<R>,
	callback: Slot<StopCallback<'static, PendingCancel<R>>>,
	_pinned: PhantomPinned,
}

pub struct PendingCancel<R: Receiver> {
	op: NonNull<PendingOperation<R>>,
}

// Test-only: the receivers driven through `pending` are thread-safe.
unsafe impl<R: Receiver> Send for PendingCancel<R> {}

impl<R: Receiver> StopFn for PendingCancel<R> {
	fn on_stop(self) {
		let op = unsafe { self.op.as_ref() };
		unsafe { op.receiver.take() }
			.expect("completes once")
			.set_done();
	}
}

impl<R: Receiver> OperationState for PendingOperation<R> {
	fn start(self: Pin<&mut Self>) {
		let this = self.into_ref().get_ref();
		let op = NonNull::from(this);
		unsafe {
			let token = this.receiver.get().stop_token().detached();
			this.callback
				.set(StopCallback::new(token, PendingCancel { op }));
			Pin::new_unchecked(this.callback.get()).register();
		}
	}
}

/// Cloneable sender that fails its first `failures` attempts with
/// [`TestError::Attempt`], then completes with the (1-based) attempt number.
#[derive(Debug, Clone)]
pub struct Flaky {
	failures: usize,
	attempts: Arc<AtomicUsize>,
}

pub fn flaky(failures: usize) -> Flaky {
	Flaky {
		failures,
		attempts: Arc::new(AtomicUsize::new(0)),
	}
}

impl Sender for Flaky {
	type Value = usize;
	type Error = TestError;
	type Operation<R>
		= FlakyOperation<R>
	where
		R: Receiver<Value = usize, Error = TestError>;

	const SENDS_DONE: bool = false;
	const BLOCKING: Blocking = Blocking::AlwaysInline;

	fn connect<R>(self, receiver: R) -> Self::Operation<R>
	where
		R: Receiver<Value = usize, Error = TestError>,
	{
		FlakyOperation {
			inner: Some((self, receiver)),
		}
	}
}

pub struct FlakyOperation<R> {
	inner: Option<(Flaky, R)>,
}

impl<R> OperationState for FlakyOperation<R>
where
	R: Receiver<Value = usize, Error = TestError>,
{
	fn start(self: Pin<&mut Self>) {
		let (flaky, receiver) = unsafe { self.get_unchecked_mut() }
			.inner
			.take()
			.expect("started at most once");
		let attempt = flaky.attempts.fetch_add(1, Ordering::Relaxed) + 1;
		if attempt <= flaky.failures {
			receiver.set_error(TestError::Attempt(attempt));
		} else {
			receiver.set_value(attempt);
		}
	}
}
