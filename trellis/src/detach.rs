//! Abandon-on-cancellation wrapper. See [`detach_on_cancel`].

use core::{
	cell::Cell,
	mem::MaybeUninit,
	pin::Pin,
	ptr::{self, NonNull},
	sync::atomic::{AtomicUsize, Ordering},
};

use phloem::{
	operation::OperationState,
	receiver::Receiver,
	sender::{Blocking, Sender},
	slot::Slot,
	stop::{StopCallback, StopFn, StopSource, StopToken},
};

/// Sender adapter that emits `Done` immediately on downstream cancellation,
/// leaving its child running detached. See [`detach_on_cancel`].
#[derive(Debug, Clone)]
#[must_use = "senders do nothing unless connected and started"]
pub struct DetachOnCancel<S> {
	source: S,
}

/// Wraps `source` so that a downstream stop request completes the outer
/// operation with `Done` *without waiting for the child*: the child keeps
/// running in the background (hurried along by a stop request on an inner
/// source it observes) and its eventual completion is discarded, reaching no
/// receiver.
///
/// The in-flight child lives in a heap-allocated detached state whose
/// ownership is split between the outer operation and the stop callback via
/// a two-bit refcount packed into the low bits of the outer operation's
/// address; whichever side loses the race frees it.
///
/// Because cancellation consumes the downstream receiver on the requesting
/// thread, the wrapped payloads travel with it; the child's own `Send`
/// requirements bound which threads can be involved.
pub fn detach_on_cancel<S: Sender>(source: S) -> DetachOnCancel<S> {
	DetachOnCancel { source }
}

const REFCOUNT_MASK: usize = 3;

impl<S: Sender> Sender for DetachOnCancel<S> {
	type Value = S::Value;
	type Error = S::Error;
	type Operation<R>
		= DetachOperation<S, R>
	where
		R: Receiver<Value = S::Value, Error = S::Error>;

	const SENDS_DONE: bool = true;
	// A `Never` child can still complete the *outer* operation inline, on the
	// thread that requests stop.
	const BLOCKING: Blocking = match S::BLOCKING {
		Blocking::Never => Blocking::Maybe,
		blocking => blocking,
	};

	fn connect<R>(self, receiver: R) -> Self::Operation<R>
	where
		R: Receiver<Value = S::Value, Error = S::Error>,
	{
		// Two-phase init: the child's receiver needs the state's (heap,
		// stable) address before the child operation can be written into it.
		let mut state = Box::new(MaybeUninit::<DetachedState<S, R>>::uninit());
		let raw = state.as_mut_ptr();
		unsafe {
			ptr::addr_of_mut!((*raw).parent_and_refcount).write(AtomicUsize::new(1));
			ptr::addr_of_mut!((*raw).stop_source).write(StopSource::new());
			let state_ptr = NonNull::new_unchecked(raw);
			ptr::addr_of_mut!((*raw).child_op)
				.write(self.source.connect(DetachReceiver { state: state_ptr }));
		}
		let state = unsafe {
			NonNull::new_unchecked(Box::into_raw(state).cast::<DetachedState<S, R>>())
		};
		DetachOperation {
			receiver: Slot::with(receiver),
			callback: Slot::empty(),
			state: Cell::new(Some(state)),
		}
	}
}

/// The refcount lives in the low bits of this operation's address.
#[repr(align(4))]
pub struct DetachOperation<S, R>
where
	S: Sender,
	R: Receiver<Value = S::Value, Error = S::Error>,
{
	receiver: Slot<R>,
	callback: Slot<StopCallback<'static, DetachCancel<S, R>>>,
	/// `Some` while this operation owns the detached state; the abandonment
	/// path takes it over.
	state: Cell<Option<NonNull<DetachedState<S, R>>>>,
}

impl<S, R> Drop for DetachOperation<S, R>
where
	S: Sender,
	R: Receiver<Value = S::Value, Error = S::Error>,
{
	fn drop(&mut self) {
		if let Some(state) = self.state.get() {
			unsafe { drop(Box::from_raw(state.as_ptr())) };
		}
	}
}

impl<S, R> OperationState for DetachOperation<S, R>
where
	S: Sender,
	R: Receiver<Value = S::Value, Error = S::Error>,
{
	fn start(self: Pin<&mut Self>) {
		let this = self.into_ref().get_ref();
		let state = this.state.get().expect("started at most once");
		let addr = ptr::from_ref(this) as usize;
		debug_assert_eq!(addr & REFCOUNT_MASK, 0);
		unsafe {
			state
				.as_ref()
				.parent_and_refcount
				.store(addr | 1, Ordering::Release);
			// May fire inline, abandoning the child before it even starts;
			// the state outlives that, so starting afterwards stays valid.
			let token = this.receiver.get().stop_token().detached();
			this.callback
				.set(StopCallback::new(token, DetachCancel { state }));
			Pin::new_unchecked(this.callback.get()).register();
			Pin::new_unchecked(&mut (*state.as_ptr()).child_op).start();
		}
	}
}

/// Heap state owning the in-flight child operation.
///
/// `parent_and_refcount` packs the outer operation's address with a refcount
/// of 0, 1 or 2 in the low two bits; the address is nulled once the stop
/// callback has claimed the downstream completion.
struct DetachedState<S, R>
where
	S: Sender,
	R: Receiver<Value = S::Value, Error = S::Error>,
{
	parent_and_refcount: AtomicUsize,
	stop_source: StopSource,
	child_op: S::Operation<DetachReceiver<S, R>>,
}

impl<S, R> DetachedState<S, R>
where
	S: Sender,
	R: Receiver<Value = S::Value, Error = S::Error>,
{
	/// The stop-callback path: claim the downstream completion, hurry the
	/// child, emit `Done` immediately.
	unsafe fn abandon(&self) {
		let expected = self.parent_and_refcount.load(Ordering::Relaxed);
		if expected & REFCOUNT_MASK == 0 {
			// The child already delivered downstream.
			return;
		}
		debug_assert_eq!(expected & REFCOUNT_MASK, 1);
		// Claim: refcount to 2, address nulled. Failure means the child just
		// delivered.
		if self
			.parent_and_refcount
			.compare_exchange(expected, 2, Ordering::AcqRel, Ordering::Relaxed)
			.is_err()
		{
			return;
		}
		self.stop_source.request_stop();
		let prev = self.parent_and_refcount.fetch_sub(1, Ordering::AcqRel);
		let op = &*((expected & !REFCOUNT_MASK) as *const DetachOperation<S, R>);
		// Dropping the callback from inside its own invocation is permitted.
		op.callback.clear();
		op.state.set(None);
		let receiver = op.receiver.take().expect("completes once");
		log::trace!("detach_on_cancel: abandoning child operation");
		if prev & REFCOUNT_MASK == 1 {
			// The child completed in the meantime; the state is ours to free.
			// Nothing may touch `self` past this point.
			drop(Box::from_raw(ptr::from_ref(self).cast_mut()));
		}
		receiver.set_done();
	}

	/// The child-completion path: `Some` hands back the outer operation for
	/// a normal completion, `None` means the completion was abandoned.
	unsafe fn try_get_op(&self) -> Option<NonNull<DetachOperation<S, R>>> {
		let prev = self.parent_and_refcount.fetch_sub(1, Ordering::AcqRel);
		if prev & REFCOUNT_MASK != 1 {
			debug_assert_eq!(prev & REFCOUNT_MASK, 2);
			debug_assert_eq!(prev & !REFCOUNT_MASK, 0);
			// Lost the race mid-abandonment; the callback frees the state.
			return None;
		}
		let addr = prev & !REFCOUNT_MASK;
		if addr == 0 {
			// Abandoned earlier; nobody else will free the state.
			// Nothing may touch `self` past this point.
			drop(Box::from_raw(ptr::from_ref(self).cast_mut()));
			return None;
		}
		let op = NonNull::new_unchecked(addr as *mut DetachOperation<S, R>);
		// Blocks until a concurrently executing stop callback finishes.
		op.as_ref().callback.clear();
		Some(op)
	}
}

/// What the downstream stop callback runs.
pub struct DetachCancel<S, R>
where
	S: Sender,
	R: Receiver<Value = S::Value, Error = S::Error>,
{
	state: NonNull<DetachedState<S, R>>,
}

/// # Safety
///
/// The callback only runs on a thread that holds the downstream stop source;
/// consuming the receiver there is this adapter's documented contract, and
/// the detached state it touches is synchronised by the packed refcount.
unsafe impl<S, R> Send for DetachCancel<S, R>
where
	S: Sender,
	R: Receiver<Value = S::Value, Error = S::Error>,
{
}

impl<S, R> StopFn for DetachCancel<S, R>
where
	S: Sender,
	R: Receiver<Value = S::Value, Error = S::Error>,
{
	fn on_stop(self) {
		unsafe { self.state.as_ref().abandon() };
	}
}

pub struct DetachReceiver<S, R>
where
	S: Sender,
	R: Receiver<Value = S::Value, Error = S::Error>,
{
	state: NonNull<DetachedState<S, R>>,
}

/// # Safety
///
/// A completing child hands the downstream delivery (or the state teardown)
/// to its thread; the payloads that cross with it are required to be
/// [`Send`].
unsafe impl<S, R> Send for DetachReceiver<S, R>
where
	S: Sender,
	S::Value: Send,
	S::Error: Send,
	R: Receiver<Value = S::Value, Error = S::Error> + Send,
{
}

impl<S, R> Receiver for DetachReceiver<S, R>
where
	S: Sender,
	R: Receiver<Value = S::Value, Error = S::Error>,
{
	type Value = S::Value;
	type Error = S::Error;

	fn set_value(self, value: S::Value) {
		if let Some(op) = unsafe { self.state.as_ref().try_get_op() } {
			let receiver = unsafe { op.as_ref().receiver.take() }.expect("completes once");
			receiver.set_value(value);
		} else {
			log::trace!("detach_on_cancel: discarding abandoned value");
		}
	}

	fn set_error(self, error: S::Error) {
		if let Some(op) = unsafe { self.state.as_ref().try_get_op() } {
			let receiver = unsafe { op.as_ref().receiver.take() }.expect("completes once");
			receiver.set_error(error);
		} else {
			log::trace!("detach_on_cancel: discarding abandoned error");
		}
	}

	fn set_done(self) {
		if let Some(op) = unsafe { self.state.as_ref().try_get_op() } {
			let receiver = unsafe { op.as_ref().receiver.take() }.expect("completes once");
			receiver.set_done();
		}
	}

	fn stop_token(&self) -> StopToken<'_> {
		unsafe { self.state.as_ref() }.stop_source.token()
	}
}
