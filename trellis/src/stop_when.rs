//! Race a source against a cancellation trigger. See [`stop_when`].

use core::{
	marker::PhantomPinned,
	pin::Pin,
	ptr::NonNull,
	sync::atomic::{AtomicUsize, Ordering},
};

use phloem::{
	completion::Completion,
	operation::OperationState,
	receiver::Receiver,
	sender::{Blocking, Sender},
	slot::{OpSlot, Slot},
	stop::{ForwardStopRequest, StopCallback, StopSource, StopToken},
};

/// Sender adapter racing `source` against `trigger`. See [`stop_when`].
#[derive(Debug, Clone)]
#[must_use = "senders do nothing unless connected and started"]
pub struct StopWhen<S, T> {
	source: S,
	trigger: T,
}

/// Starts `source` and `trigger` together. Whichever completes first asks the
/// other to stop through the adapter's embedded stop source; once both have
/// completed, the downstream receiver is signalled with the **source's**
/// result. The trigger's own payloads are discarded.
///
/// Timeouts are the canonical instance: `stop_when(work, delay)`.
pub fn stop_when<S, T>(source: S, trigger: T) -> StopWhen<S, T>
where
	S: Sender,
	T: Sender,
{
	StopWhen { source, trigger }
}

impl<S, T> Sender for StopWhen<S, T>
where
	S: Sender,
	T: Sender,
{
	type Value = S::Value;
	type Error = S::Error;
	type Operation<R>
		= StopWhenOperation<S, T, R>
	where
		R: Receiver<Value = S::Value, Error = S::Error>;

	const SENDS_DONE: bool = S::SENDS_DONE;
	const BLOCKING: Blocking = S::BLOCKING.combine(T::BLOCKING);
	const SCHEDULER_AFFINE: bool = false;

	fn connect<R>(self, receiver: R) -> Self::Operation<R>
	where
		R: Receiver<Value = S::Value, Error = S::Error>,
	{
		StopWhenOperation {
			remaining: AtomicUsize::new(2),
			stop_source: StopSource::new(),
			stop_callback: Slot::empty(),
			result: Slot::empty(),
			receiver: Slot::with(receiver),
			source_sender: Slot::with(self.source),
			trigger_sender: Slot::with(self.trigger),
			source_op: OpSlot::empty(),
			trigger_op: OpSlot::empty(),
			_pinned: PhantomPinned,
		}
	}
}

/// Join state shared by both children; only the source side writes `result`.
pub struct StopWhenOperation<S, T, R>
where
	S: Sender,
	T: Sender,
	R: Receiver<Value = S::Value, Error = S::Error>,
{
	remaining: AtomicUsize,
	stop_source: StopSource,
	stop_callback: Slot<StopCallback<'static, ForwardStopRequest>>,
	result: Slot<Completion<S::Value, S::Error>>,
	receiver: Slot<R>,
	source_sender: Slot<S>,
	trigger_sender: Slot<T>,
	source_op: OpSlot<S, StopWhenSourceReceiver<S, T, R>>,
	trigger_op: OpSlot<T, StopWhenTriggerReceiver<S, T, R>>,
	_pinned: PhantomPinned,
}

impl<S, T, R> StopWhenOperation<S, T, R>
where
	S: Sender,
	T: Sender,
	R: Receiver<Value = S::Value, Error = S::Error>,
{
	/// Either child landing here stops the other; the second one through
	/// delivers the source's result.
	fn child_complete(&self) {
		self.stop_source.request_stop();
		if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
			unsafe { self.stop_callback.clear() };
			let receiver = unsafe { self.receiver.take() }.expect("delivered once");
			match unsafe { self.result.take() }.expect("source completed") {
				Completion::Value(value) => receiver.set_value(value),
				Completion::Error(error) => receiver.set_error(error),
				Completion::Done => receiver.set_done(),
			}
		}
	}
}

impl<S, T, R> OperationState for StopWhenOperation<S, T, R>
where
	S: Sender,
	T: Sender,
	R: Receiver<Value = S::Value, Error = S::Error>,
{
	fn start(self: Pin<&mut Self>) {
		let this = self.into_ref().get_ref();
		let op = NonNull::from(this);
		unsafe {
			let token = this.receiver.get().stop_token().detached();
			this.stop_callback.set(StopCallback::new(
				token,
				ForwardStopRequest::new(&this.stop_source),
			));
			Pin::new_unchecked(this.stop_callback.get()).register();

			let source = this.source_sender.take().expect("started at most once");
			this.source_op
				.connect_and_start(source, || StopWhenSourceReceiver { op });
			let trigger = this.trigger_sender.take().expect("started at most once");
			this.trigger_op
				.connect_and_start(trigger, || StopWhenTriggerReceiver { op });
		}
	}
}

pub struct StopWhenSourceReceiver<S, T, R>
where
	S: Sender,
	T: Sender,
	R: Receiver<Value = S::Value, Error = S::Error>,
{
	op: NonNull<StopWhenOperation<S, T, R>>,
}

/// # Safety
///
/// A completing child may hand delivery to its thread; the payloads that
/// cross with it are required to be [`Send`].
unsafe impl<S, T, R> Send for StopWhenSourceReceiver<S, T, R>
where
	S: Sender,
	S::Value: Send,
	S::Error: Send,
	T: Sender,
	R: Receiver<Value = S::Value, Error = S::Error> + Send,
{
}

impl<S, T, R> Receiver for StopWhenSourceReceiver<S, T, R>
where
	S: Sender,
	T: Sender,
	R: Receiver<Value = S::Value, Error = S::Error>,
{
	type Value = S::Value;
	type Error = S::Error;

	fn set_value(self, value: S::Value) {
		let op = unsafe { self.op.as_ref() };
		unsafe { op.result.set(Completion::Value(value)) };
		op.child_complete();
	}

	fn set_error(self, error: S::Error) {
		let op = unsafe { self.op.as_ref() };
		unsafe { op.result.set(Completion::Error(error)) };
		op.child_complete();
	}

	fn set_done(self) {
		let op = unsafe { self.op.as_ref() };
		unsafe { op.result.set(Completion::Done) };
		op.child_complete();
	}

	fn stop_token(&self) -> StopToken<'_> {
		unsafe { self.op.as_ref() }.stop_source.token()
	}
}

pub struct StopWhenTriggerReceiver<S, T, R>
where
	S: Sender,
	T: Sender,
	R: Receiver<Value = S::Value, Error = S::Error>,
{
	op: NonNull<StopWhenOperation<S, T, R>>,
}

/// # Safety
///
/// See [`StopWhenSourceReceiver`]'s [`Send`] implementation.
unsafe impl<S, T, R> Send for StopWhenTriggerReceiver<S, T, R>
where
	S: Sender,
	S::Value: Send,
	S::Error: Send,
	T: Sender,
	R: Receiver<Value = S::Value, Error = S::Error> + Send,
{
}

impl<S, T, R> Receiver for StopWhenTriggerReceiver<S, T, R>
where
	S: Sender,
	T: Sender,
	R: Receiver<Value = S::Value, Error = S::Error>,
{
	type Value = T::Value;
	type Error = T::Error;

	fn set_value(self, _value: T::Value) {
		unsafe { self.op.as_ref() }.child_complete();
	}

	fn set_error(self, _error: T::Error) {
		unsafe { self.op.as_ref() }.child_complete();
	}

	fn set_done(self) {
		unsafe { self.op.as_ref() }.child_complete();
	}

	fn stop_token(&self) -> StopToken<'_> {
		unsafe { self.op.as_ref() }.stop_source.token()
	}
}
