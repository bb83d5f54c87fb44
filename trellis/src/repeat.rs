//! Effect loops. See [`repeat_effect_until`] and [`repeat_effect`].

use core::{
	marker::PhantomPinned,
	pin::Pin,
	ptr::NonNull,
	sync::atomic::{AtomicU8, Ordering},
};

use phloem::{
	completion::Completion,
	operation::OperationState,
	receiver::Receiver,
	sender::{Blocking, Sender},
	slot::{OpSlot, Slot},
	stop::StopToken,
};

/// Sender adapter rerunning an effect until a predicate holds.
/// See [`repeat_effect_until`].
#[derive(Debug, Clone)]
#[must_use = "senders do nothing unless connected and started"]
pub struct RepeatEffectUntil<S, P> {
	source: S,
	predicate: P,
}

/// Runs `source` (cloned for every iteration), evaluating `predicate` after
/// each value; once it returns `true` the adapter completes with `()`.
/// `Error` and `Done` from the source propagate and end the loop.
///
/// The iteration state lives in a single slot that is torn down and
/// reconnected in place. Inline completions are folded into a drive loop
/// rather than recursing, so the stack depth stays flat no matter how many
/// iterations complete synchronously.
pub fn repeat_effect_until<S, P>(source: S, predicate: P) -> RepeatEffectUntil<S, P>
where
	S: Sender<Value = ()> + Clone,
	P: FnMut() -> bool,
{
	RepeatEffectUntil { source, predicate }
}

/// [`repeat_effect_until`] with an always-false predicate: loops until the
/// source completes with `Error` or `Done`.
pub fn repeat_effect<S>(source: S) -> RepeatEffectUntil<S, fn() -> bool>
where
	S: Sender<Value = ()> + Clone,
{
	repeat_effect_until(source, never_done as fn() -> bool)
}

fn never_done() -> bool {
	false
}

impl<S, P> Sender for RepeatEffectUntil<S, P>
where
	S: Sender<Value = ()> + Clone,
	P: FnMut() -> bool,
{
	type Value = ();
	type Error = S::Error;
	type Operation<R>
		= RepeatOperation<S, P, R>
	where
		R: Receiver<Value = (), Error = S::Error>;

	const SENDS_DONE: bool = S::SENDS_DONE;
	const BLOCKING: Blocking = S::BLOCKING.sequence(S::BLOCKING);

	fn connect<R>(self, receiver: R) -> Self::Operation<R>
	where
		R: Receiver<Value = (), Error = S::Error>,
	{
		RepeatOperation {
			source: Slot::with(self.source),
			predicate: Slot::with(self.predicate),
			receiver: Slot::with(receiver),
			outcome: Slot::empty(),
			child: OpSlot::empty(),
			drive: AtomicU8::new(DRIVING),
			_pinned: PhantomPinned,
		}
	}
}

/// Drive-loop handshake. Whoever holds `DRIVING` owns the slot: it
/// reconnects on `AGAIN` and delivers the stored outcome on `FINISHED`. A
/// completion that observes `WAITING` instead becomes the driver (or
/// deliverer) itself. Terminal completions never signal past a live driver,
/// so the driver's final look at this word cannot race the operation's
/// destruction.
const DRIVING: u8 = 0;
const WAITING: u8 = 1;
const AGAIN: u8 = 2;
const FINISHED: u8 = 3;

pub struct RepeatOperation<S, P, R>
where
	S: Sender<Value = ()> + Clone,
	P: FnMut() -> bool,
	R: Receiver<Value = (), Error = S::Error>,
{
	source: Slot<S>,
	predicate: Slot<P>,
	receiver: Slot<R>,
	outcome: Slot<Completion<(), S::Error>>,
	child: OpSlot<S, RepeatReceiver<S, P, R>>,
	drive: AtomicU8,
	_pinned: PhantomPinned,
}

impl<S, P, R> RepeatOperation<S, P, R>
where
	S: Sender<Value = ()> + Clone,
	P: FnMut() -> bool,
	R: Receiver<Value = (), Error = S::Error>,
{
	fn drive(&self) {
		let op = NonNull::from(self);
		loop {
			let source = unsafe { self.source.get() }.clone();
			unsafe {
				self.child
					.connect_and_start(source, || RepeatReceiver { op });
			}
			match self.drive.compare_exchange(
				DRIVING,
				WAITING,
				Ordering::AcqRel,
				Ordering::Acquire,
			) {
				// Parked; an asynchronous completion takes over.
				Ok(_) => return,
				// The iteration completed inline and wants another round.
				Err(AGAIN) => self.drive.store(DRIVING, Ordering::Relaxed),
				// The iteration completed inline with a terminal signal.
				Err(_finished) => {
					self.deliver();
					return;
				}
			}
		}
	}

	/// Consumes the stored outcome. The operation must not be touched after
	/// this.
	fn deliver(&self) {
		let receiver = unsafe { self.receiver.take() }.expect("completes once");
		match unsafe { self.outcome.take() }.expect("outcome stored") {
			Completion::Value(()) => receiver.set_value(()),
			Completion::Error(error) => receiver.set_error(error),
			Completion::Done => receiver.set_done(),
		}
	}

	/// Called by a completing iteration with its terminal outcome; hands
	/// delivery to the driver when one is still active.
	fn finish(&self, outcome: Completion<(), S::Error>) {
		unsafe { self.outcome.set(outcome) };
		if self
			.drive
			.compare_exchange(DRIVING, FINISHED, Ordering::AcqRel, Ordering::Acquire)
			.is_err()
		{
			// The driver is parked; deliver from here.
			self.deliver();
		}
	}
}

impl<S, P, R> OperationState for RepeatOperation<S, P, R>
where
	S: Sender<Value = ()> + Clone,
	P: FnMut() -> bool,
	R: Receiver<Value = (), Error = S::Error>,
{
	fn start(self: Pin<&mut Self>) {
		self.into_ref().get_ref().drive();
	}
}

pub struct RepeatReceiver<S, P, R>
where
	S: Sender<Value = ()> + Clone,
	P: FnMut() -> bool,
	R: Receiver<Value = (), Error = S::Error>,
{
	op: NonNull<RepeatOperation<S, P, R>>,
}

/// # Safety
///
/// A completing iteration hands the loop to its thread; everything it may
/// touch there is required to be [`Send`].
unsafe impl<S, P, R> Send for RepeatReceiver<S, P, R>
where
	S: Sender<Value = ()> + Clone + Send,
	S::Error: Send,
	P: FnMut() -> bool + Send,
	R: Receiver<Value = (), Error = S::Error> + Send,
{
}

impl<S, P, R> Receiver for RepeatReceiver<S, P, R>
where
	S: Sender<Value = ()> + Clone,
	P: FnMut() -> bool,
	R: Receiver<Value = (), Error = S::Error>,
{
	type Value = ();
	type Error = S::Error;

	fn set_value(self, (): ()) {
		let op = unsafe { self.op.as_ref() };
		unsafe { op.child.vacate() };
		if unsafe { op.predicate.get_mut() }() {
			op.finish(Completion::Value(()));
			return;
		}
		match op
			.drive
			.compare_exchange(DRIVING, AGAIN, Ordering::AcqRel, Ordering::Acquire)
		{
			// Inline completion: the running drive loop reconnects.
			Ok(_) => {}
			// Asynchronous completion: this thread becomes the driver.
			Err(_) => {
				op.drive.store(DRIVING, Ordering::Relaxed);
				op.drive();
			}
		}
	}

	fn set_error(self, error: S::Error) {
		let op = unsafe { self.op.as_ref() };
		unsafe { op.child.vacate() };
		op.finish(Completion::Error(error));
	}

	fn set_done(self) {
		let op = unsafe { self.op.as_ref() };
		unsafe { op.child.vacate() };
		op.finish(Completion::Done);
	}

	fn stop_token(&self) -> StopToken<'_> {
		let op = unsafe { self.op.as_ref() };
		unsafe { op.receiver.get() }.stop_token()
	}
}
