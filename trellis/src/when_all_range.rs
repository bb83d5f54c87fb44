//! Fan-in over a runtime-sized batch of senders. See [`when_all_range`].

use core::{
	marker::PhantomPinned,
	pin::Pin,
	ptr::NonNull,
	sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};
use std::cell::UnsafeCell;

use phloem::{
	operation::OperationState,
	receiver::Receiver,
	sender::{Blocking, Sender},
	slot::{OpSlot, Slot},
	stop::{ForwardStopRequest, StopCallback, StopSource, StopToken},
};

/// The runtime-arity counterpart of [`when_all`](`crate::when_all`): starts
/// every sender in `senders` and completes with the `Vec` of their values in
/// input order, or with the first observed terminal `Error`/`Done` while the
/// rest are asked to stop.
///
/// An empty batch completes inline with an empty `Vec`.
pub fn when_all_range<S: Sender>(senders: Vec<S>) -> WhenAllRange<S> {
	WhenAllRange { senders }
}

/// Fan-in sender over a `Vec` of senders. See [`when_all_range`].
#[derive(Debug, Clone)]
#[must_use = "senders do nothing unless connected and started"]
pub struct WhenAllRange<S> {
	senders: Vec<S>,
}

impl<S: Sender> Sender for WhenAllRange<S> {
	type Value = Vec<S::Value>;
	type Error = S::Error;
	type Operation<R>
		= WhenAllRangeOperation<S, R>
	where
		R: Receiver<Value = Vec<S::Value>, Error = S::Error>;

	const SENDS_DONE: bool = true;
	// An empty batch completes inline, so a `Never` child category cannot be
	// promised for the whole.
	const BLOCKING: Blocking = match S::BLOCKING {
		Blocking::AlwaysInline => Blocking::AlwaysInline,
		Blocking::Always => Blocking::Always,
		Blocking::Never | Blocking::Maybe => Blocking::Maybe,
	};
	const SCHEDULER_AFFINE: bool = false;

	fn connect<R>(self, receiver: R) -> Self::Operation<R>
	where
		R: Receiver<Value = Vec<S::Value>, Error = S::Error>,
	{
		let count = self.senders.len();
		WhenAllRangeOperation {
			remaining: AtomicUsize::new(count),
			done_or_error: AtomicBool::new(false),
			error: Slot::empty(),
			stop_source: StopSource::new(),
			stop_callback: Slot::empty(),
			receiver: Slot::with(receiver),
			pending: UnsafeCell::new(self.senders),
			children: UnsafeCell::new(Vec::with_capacity(count)),
			_pinned: PhantomPinned,
		}
	}
}

struct RangeChild<S, R>
where
	S: Sender,
	R: Receiver<Value = Vec<S::Value>, Error = S::Error>,
{
	value: Slot<S::Value>,
	op: OpSlot<S, WhenAllRangeReceiver<S, R>>,
}

/// Child operations and value slots live in a vector sized once at `start`;
/// it never reallocates afterwards, which is what keeps their addresses
/// stable.
pub struct WhenAllRangeOperation<S, R>
where
	S: Sender,
	R: Receiver<Value = Vec<S::Value>, Error = S::Error>,
{
	remaining: AtomicUsize,
	done_or_error: AtomicBool,
	error: Slot<S::Error>,
	stop_source: StopSource,
	stop_callback: Slot<StopCallback<'static, ForwardStopRequest>>,
	receiver: Slot<R>,
	pending: UnsafeCell<Vec<S>>,
	children: UnsafeCell<Vec<RangeChild<S, R>>>,
	_pinned: PhantomPinned,
}

impl<S, R> WhenAllRangeOperation<S, R>
where
	S: Sender,
	R: Receiver<Value = Vec<S::Value>, Error = S::Error>,
{
	fn element_complete(&self) {
		if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
			self.deliver();
		}
	}

	fn deliver(&self) {
		unsafe { self.stop_callback.clear() };
		let receiver = unsafe { self.receiver.take() }.expect("delivered once");
		if receiver.stop_token().stop_requested() {
			receiver.set_done();
		} else if self.done_or_error.load(Ordering::Relaxed) {
			match unsafe { self.error.take() } {
				Some(error) => receiver.set_error(error),
				None => receiver.set_done(),
			}
		} else {
			let children = unsafe { &*self.children.get() };
			let values = children
				.iter()
				.map(|child| {
					unsafe { child.value.take() }.expect("every child delivered a value")
				})
				.collect();
			receiver.set_value(values);
		}
	}
}

impl<S, R> OperationState for WhenAllRangeOperation<S, R>
where
	S: Sender,
	R: Receiver<Value = Vec<S::Value>, Error = S::Error>,
{
	fn start(self: Pin<&mut Self>) {
		let this = self.into_ref().get_ref();
		let op = NonNull::from(this);
		unsafe {
			let pending = core::mem::take(&mut *this.pending.get());
			if pending.is_empty() {
				this.receiver
					.take()
					.expect("started at most once")
					.set_value(Vec::new());
				return;
			}

			let token = this.receiver.get().stop_token().detached();
			this.stop_callback.set(StopCallback::new(
				token,
				ForwardStopRequest::new(&this.stop_source),
			));
			Pin::new_unchecked(this.stop_callback.get()).register();

			{
				// The capacity was reserved in `connect`; pushes never
				// reallocate. No child runs yet, so the exclusive borrow is
				// sound.
				let children = &mut *this.children.get();
				for _ in 0..pending.len() {
					children.push(RangeChild {
						value: Slot::empty(),
						op: OpSlot::empty(),
					});
				}
			}
			let children = &*this.children.get();
			for (index, sender) in pending.into_iter().enumerate() {
				children[index]
					.op
					.connect_and_start(sender, || WhenAllRangeReceiver { op, index });
			}
		}
	}
}

pub struct WhenAllRangeReceiver<S, R>
where
	S: Sender,
	R: Receiver<Value = Vec<S::Value>, Error = S::Error>,
{
	op: NonNull<WhenAllRangeOperation<S, R>>,
	index: usize,
}

/// # Safety
///
/// A completing child may hand the aggregation (and, when it is the last one,
/// delivery) to its thread; the payloads that cross with it are required to
/// be [`Send`].
unsafe impl<S, R> Send for WhenAllRangeReceiver<S, R>
where
	S: Sender,
	S::Value: Send,
	S::Error: Send,
	R: Receiver<Value = Vec<S::Value>, Error = S::Error> + Send,
{
}

impl<S, R> Receiver for WhenAllRangeReceiver<S, R>
where
	S: Sender,
	R: Receiver<Value = Vec<S::Value>, Error = S::Error>,
{
	type Value = S::Value;
	type Error = S::Error;

	fn set_value(self, value: S::Value) {
		let op = unsafe { self.op.as_ref() };
		let children = unsafe { &*op.children.get() };
		unsafe { children[self.index].value.set(value) };
		op.element_complete();
	}

	fn set_error(self, error: S::Error) {
		let op = unsafe { self.op.as_ref() };
		if !op.done_or_error.swap(true, Ordering::Relaxed) {
			unsafe { op.error.set(error) };
			op.stop_source.request_stop();
		}
		op.element_complete();
	}

	fn set_done(self) {
		let op = unsafe { self.op.as_ref() };
		if !op.done_or_error.swap(true, Ordering::Relaxed) {
			op.stop_source.request_stop();
		}
		op.element_complete();
	}

	fn stop_token(&self) -> StopToken<'_> {
		unsafe { self.op.as_ref() }.stop_source.token()
	}
}
