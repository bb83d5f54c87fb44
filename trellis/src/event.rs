//! An async manual-reset event. See [`ManualResetEvent`].

use core::{
	marker::{PhantomData, PhantomPinned},
	pin::Pin,
	ptr,
	sync::atomic::{AtomicUsize, Ordering},
};

use phloem::{
	operation::OperationState,
	receiver::Receiver,
	sender::{Blocking, Sender},
	slot::Slot,
};

/// "Already set": waiters arriving now complete inline. Waiter nodes are
/// pointer-aligned, so this value can never collide with one.
const SET: usize = 1;
const UNSET: usize = 0;

/// A latch for senders: once [`set`](`ManualResetEvent::set`), every pending
/// [`wait`](`ManualResetEvent::wait`) operation completes, and later ones
/// complete inline.
///
/// The whole state is one atomic word: unset-and-empty, set, or the head of
/// an intrusive list of waiters (each embedded in its wait operation, so
/// nothing allocates).
#[derive(Debug)]
pub struct ManualResetEvent {
	state: AtomicUsize,
}

impl Default for ManualResetEvent {
	fn default() -> Self {
		Self::new()
	}
}

impl ManualResetEvent {
	/// Creates the event in the unset state.
	#[must_use]
	pub const fn new() -> Self {
		Self {
			state: AtomicUsize::new(UNSET),
		}
	}

	/// Creates the event already set.
	#[must_use]
	pub const fn new_set() -> Self {
		Self {
			state: AtomicUsize::new(SET),
		}
	}

	/// Whether the event is set.
	#[must_use]
	pub fn ready(&self) -> bool {
		self.state.load(Ordering::Acquire) == SET
	}

	/// Sets the event, completing every pending waiter on this thread.
	pub fn set(&self) {
		let old = self.state.swap(SET, Ordering::AcqRel);
		if old == SET || old == UNSET {
			return;
		}
		let mut node = old as *mut WaiterNode;
		while !node.is_null() {
			// The resumed operation may be destroyed by its owner right
			// away; read the link first.
			unsafe {
				let next = (*node).next;
				((*node).resume)(node);
				node = next;
			}
		}
	}

	/// Returns the event to the unset state, unless waiters are pending (in
	/// which case it was never set and there is nothing to do).
	pub fn reset(&self) {
		let _ = self
			.state
			.compare_exchange(SET, UNSET, Ordering::AcqRel, Ordering::Relaxed);
	}

	/// Returns a sender completing with `()` once the event is set.
	///
	/// The error channel is phantom. The wait is not cancellation-aware;
	/// compose with [`stop_when`](`crate::stop_when`) when it needs to be.
	pub fn wait<E>(&self) -> Wait<'_, E> {
		Wait {
			event: self,
			_error: PhantomData,
		}
	}
}

/// Sender of a [`ManualResetEvent`] becoming set. See
/// [`wait`](`ManualResetEvent::wait`).
#[derive(Debug, Clone)]
#[must_use = "senders do nothing unless connected and started"]
pub struct Wait<'e, E> {
	event: &'e ManualResetEvent,
	_error: PhantomData<fn() -> E>,
}

impl<'e, E> Sender for Wait<'e, E> {
	type Value = ();
	type Error = E;
	type Operation<R>
		= WaitOperation<'e, R>
	where
		R: Receiver<Value = (), Error = E>;

	const SENDS_DONE: bool = false;
	const BLOCKING: Blocking = Blocking::Maybe;

	fn connect<R>(self, receiver: R) -> Self::Operation<R>
	where
		R: Receiver<Value = (), Error = E>,
	{
		WaitOperation {
			node: WaiterNode {
				next: ptr::null_mut(),
				resume: WaitOperation::<R>::resume,
			},
			event: self.event,
			receiver: Slot::with(receiver),
			_pinned: PhantomPinned,
		}
	}
}

struct WaiterNode {
	next: *mut WaiterNode,
	resume: unsafe fn(*mut WaiterNode),
}

/// Lives at offset zero of a [`WaitOperation`] so `resume` can recover the
/// container.
#[repr(C)]
pub struct WaitOperation<'e, R> {
	node: WaiterNode,
	event: &'e ManualResetEvent,
	receiver: Slot<R>,
	_pinned: PhantomPinned,
}

/// # Safety
///
/// The node is only reachable through the event, which hands each waiter to
/// exactly one `set` call; the receiver crossing to that thread is `Send` by
/// bound.
unsafe impl<R: Send> Send for WaitOperation<'_, R> {}
/// # Safety
///
/// See the [`Send`] implementation.
unsafe impl<R: Send> Sync for WaitOperation<'_, R> {}

impl<R> WaitOperation<'_, R>
where
	R: Receiver<Value = ()>,
{
	unsafe fn resume(node: *mut WaiterNode) {
		let this = &*node.cast::<Self>();
		this.receiver
			.take()
			.expect("resumed at most once")
			.set_value(());
	}
}

impl<R> OperationState for WaitOperation<'_, R>
where
	R: Receiver<Value = ()>,
{
	fn start(self: Pin<&mut Self>) {
		let this = unsafe { self.get_unchecked_mut() };
		let node = ptr::addr_of_mut!(this.node);
		let mut state = this.event.state.load(Ordering::Acquire);
		loop {
			if state == SET {
				unsafe {
					this.receiver
						.take()
						.expect("started at most once")
						.set_value(());
				}
				return;
			}
			unsafe { (*node).next = state as *mut WaiterNode };
			match this.event.state.compare_exchange_weak(
				state,
				node as usize,
				Ordering::AcqRel,
				Ordering::Acquire,
			) {
				// Parked; a `set` call resumes the operation.
				Ok(_) => return,
				Err(actual) => state = actual,
			}
		}
	}
}
