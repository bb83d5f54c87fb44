//! The intrusive cancellation triple: [`StopSource`], [`StopToken`] and [`StopCallback`].
//!
//! A [`StopSource`] owns the shared stopping state. [`StopToken`]s are cheap
//! [`Copy`] handles borrowed from it. A [`StopCallback`] is an intrusively
//! linked node that runs exactly once when (and only when) stop is requested.
//! Nothing here allocates.
//!
//! # Logic
//!
//! Callbacks run synchronously on the thread that calls
//! [`request_stop`](`StopSource::request_stop`), while *no* lock is held.
//! A callback's destructor synchronises with a concurrent invocation: the
//! callback never runs after its destructor has returned, except that a
//! callback may drop itself from inside its own invocation.

use core::{
	cell::{Cell, UnsafeCell},
	fmt::{self, Debug, Formatter},
	hint,
	marker::PhantomPinned,
	mem,
	pin::Pin,
	ptr::{self, NonNull},
	sync::atomic::{AtomicBool, AtomicU8, Ordering},
};
use std::thread::{self, ThreadId};

const STOP_REQUESTED: u8 = 1;
const LOCKED: u8 = 2;

/// Owner of the shared stopping state: a packed flag-plus-spinlock byte and
/// an intrusive list of registered callbacks.
///
/// The source is address-sensitive while tokens or callbacks refer to it,
/// which the borrow in [`StopToken`] enforces.
pub struct StopSource {
	state: AtomicU8,
	/// Head of the doubly-linked callback list. Guarded by [`LOCKED`].
	head: UnsafeCell<*mut CallbackNode>,
	/// Thread currently walking the list in [`request_stop`](`Self::request_stop`). Guarded by [`LOCKED`].
	notifying_thread: UnsafeCell<Option<ThreadId>>,
}

/// # Safety
///
/// The [`UnsafeCell`] fields are only accessed while the [`LOCKED`] bit of
/// `state` is held (plus the executing-callback handshake documented on
/// [`CallbackNode`]).
unsafe impl Send for StopSource {}
/// # Safety
///
/// See the [`Send`] implementation.
unsafe impl Sync for StopSource {}

impl Debug for StopSource {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		f.debug_struct("StopSource")
			.field("stop_requested", &self.stop_requested())
			.finish_non_exhaustive()
	}
}

impl Default for StopSource {
	fn default() -> Self {
		Self::new()
	}
}

impl StopSource {
	/// Creates a source in the not-stopped state with no registered callbacks.
	#[must_use]
	pub const fn new() -> Self {
		Self {
			state: AtomicU8::new(0),
			head: UnsafeCell::new(ptr::null_mut()),
			notifying_thread: UnsafeCell::new(None),
		}
	}

	/// Borrows a token referring to this source.
	#[must_use]
	pub fn token(&self) -> StopToken<'_> {
		StopToken {
			source: Some(self),
		}
	}

	/// Whether [`request_stop`](`Self::request_stop`) has been called.
	#[must_use]
	pub fn stop_requested(&self) -> bool {
		self.state.load(Ordering::Acquire) & STOP_REQUESTED != 0
	}

	/// Atomically transitions to the stopped state and synchronously runs every
	/// registered callback on the calling thread.
	///
	/// Returns `true` iff this call performed the transition. Concurrent and
	/// subsequent calls return `false` without running anything.
	///
	/// # Logic
	///
	/// No lock is held while a callback runs, so callbacks may freely register
	/// and deregister other callbacks (and may drop themselves).
	pub fn request_stop(&self) -> bool {
		if !self.try_lock_unless_stop_requested(true) {
			return false;
		}

		// The lock is held and the stop flag is set; late registrations now
		// run inline on their own threads.
		unsafe {
			*self.notifying_thread.get() = Some(thread::current().id());

			while !(*self.head.get()).is_null() {
				// Pop the head. Clearing `prev` marks the node as "no longer
				// linked" towards a concurrent deregistration.
				let node = *self.head.get();
				(*node).prev = ptr::null_mut();
				*self.head.get() = (*node).next;
				if !(*node).next.is_null() {
					(*(*node).next).prev = self.head.get();
				}

				self.state.store(STOP_REQUESTED, Ordering::Release);

				let mut removed_during_callback = false;
				(*node).removed_during_callback = &mut removed_during_callback;

				((*node).execute)(node);

				if !removed_during_callback {
					(*node).removed_during_callback = ptr::null_mut();
					// The owner may spin on this in `deregister`; the node must
					// not be touched past this store.
					(*node).completed.store(true, Ordering::Release);
				}

				self.lock();
			}
		}

		self.state.store(STOP_REQUESTED, Ordering::Release);
		true
	}

	/// Spins until the lock bit is acquired. Returns the prior flag bits.
	fn lock(&self) -> u8 {
		let mut old = self.state.load(Ordering::Relaxed);
		loop {
			if old & LOCKED != 0 {
				hint::spin_loop();
				old = self.state.load(Ordering::Relaxed);
				continue;
			}
			match self.state.compare_exchange_weak(
				old,
				old | LOCKED,
				Ordering::Acquire,
				Ordering::Relaxed,
			) {
				Ok(_) => return old,
				Err(actual) => old = actual,
			}
		}
	}

	fn unlock(&self, old_flags: u8) {
		self.state.store(old_flags, Ordering::Release);
	}

	/// Acquires the lock unless stop was already requested, optionally setting
	/// the stop flag in the same exchange.
	fn try_lock_unless_stop_requested(&self, set_stop_requested: bool) -> bool {
		let mut old = self.state.load(Ordering::Acquire);
		loop {
			if old & STOP_REQUESTED != 0 {
				return false;
			}
			if old & LOCKED != 0 {
				hint::spin_loop();
				old = self.state.load(Ordering::Acquire);
				continue;
			}
			let new = if set_stop_requested {
				LOCKED | STOP_REQUESTED
			} else {
				LOCKED
			};
			match self
				.state
				.compare_exchange_weak(old, new, Ordering::Acquire, Ordering::Relaxed)
			{
				Ok(_) => return true,
				Err(actual) => old = actual,
			}
		}
	}

	/// Links `node` at the head of the list, or returns `false` when stop was
	/// already requested (in which case the caller runs the callback inline).
	///
	/// # Safety
	///
	/// `node` must stay valid until executed or deregistered.
	unsafe fn try_register(&self, node: *mut CallbackNode) -> bool {
		if !self.try_lock_unless_stop_requested(false) {
			return false;
		}
		let head = self.head.get();
		(*node).next = *head;
		(*node).prev = head;
		if !(*head).is_null() {
			(**head).prev = ptr::addr_of_mut!((*node).next);
		}
		*head = node;
		self.unlock(0);
		true
	}

	/// Unlinks `node`, synchronising with a concurrent or self-invoked
	/// execution as documented on [`StopCallback`].
	///
	/// # Safety
	///
	/// `node` must previously have been registered with this source.
	unsafe fn deregister(&self, node: *mut CallbackNode) {
		let old_flags = self.lock();
		if !(*node).prev.is_null() {
			// Still linked, so it has not started executing; unlink and done.
			*(*node).prev = (*node).next;
			if !(*node).next.is_null() {
				(*(*node).next).prev = (*node).prev;
			}
			self.unlock(old_flags);
		} else {
			let notifying_thread = *self.notifying_thread.get();
			self.unlock(old_flags);
			if notifying_thread == Some(thread::current().id()) {
				// The callback is deregistering itself from inside its own
				// invocation; tell `request_stop` not to touch the node again.
				let flag = (*node).removed_during_callback;
				if !flag.is_null() {
					*flag = true;
				}
			} else {
				// Executing concurrently on the notifying thread; the contract
				// is that it never runs past its destructor, so wait it out.
				while !(*node).completed.load(Ordering::Acquire) {
					hint::spin_loop();
				}
			}
		}
	}
}

/// A cheap [`Copy`] handle to a [`StopSource`], or the detached token that can
/// never stop.
///
/// Tokens borrow their source, which is what makes
/// [`stop_possible`](`Self::stop_possible`) meaningful: a token only ever
/// refers to a live source.
#[derive(Clone, Copy)]
pub struct StopToken<'a> {
	source: Option<&'a StopSource>,
}

impl Debug for StopToken<'_> {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		f.debug_struct("StopToken")
			.field("stop_possible", &self.stop_possible())
			.field("stop_requested", &self.stop_requested())
			.finish()
	}
}

impl PartialEq for StopToken<'_> {
	fn eq(&self, other: &Self) -> bool {
		match (self.source, other.source) {
			(Some(a), Some(b)) => ptr::eq(a, b),
			(None, None) => true,
			_ => false,
		}
	}
}
impl Eq for StopToken<'_> {}

impl Default for StopToken<'_> {
	fn default() -> Self {
		Self::never()
	}
}

impl<'a> StopToken<'a> {
	/// The detached token: [`stop_possible`](`Self::stop_possible`) is `false`
	/// and registered callbacks never run.
	#[must_use]
	pub const fn never() -> Self {
		Self { source: None }
	}

	/// Whether this token refers to a live source.
	#[must_use]
	pub fn stop_possible(&self) -> bool {
		self.source.is_some()
	}

	/// Whether stop has been requested on the referred-to source.
	#[must_use]
	pub fn stop_requested(&self) -> bool {
		self.source.is_some_and(StopSource::stop_requested)
	}

	/// Severs the borrow, yielding a token of an arbitrary lifetime.
	///
	/// Used by operation states that store a callback registered on their own
	/// downstream token next to the source it forwards into.
	///
	/// # Safety
	///
	/// The source this token refers to must outlive every use of the returned
	/// token, including the deregistration of any callback registered through
	/// it.
	#[must_use]
	pub unsafe fn detached<'b>(self) -> StopToken<'b> {
		mem::transmute(self)
	}
}

/// What runs when stop is requested.
///
/// This is a dedicated trait rather than [`FnOnce`] so that operation states
/// can *name* their callback types; closures are wrapped in [`FnStop`].
pub trait StopFn {
	/// Consumes the handler. Must not panic.
	fn on_stop(self);
}

/// Wraps any closure as a [`StopFn`].
#[derive(Debug)]
pub struct FnStop<F: FnOnce()>(
	/// The wrapped closure.
	pub F,
);

impl<F: FnOnce()> StopFn for FnStop<F> {
	fn on_stop(self) {
		(self.0)();
	}
}

/// A [`StopFn`] that forwards the stop request into another [`StopSource`].
///
/// This is the composition glue of the substrate: an adapter that owns a local
/// source subscribes a `ForwardStopRequest` on its downstream token and hands
/// the local source's tokens to its children.
pub struct ForwardStopRequest {
	target: NonNull<StopSource>,
}

impl ForwardStopRequest {
	/// # Safety
	///
	/// `target` must outlive the callback this is registered through.
	#[must_use]
	pub unsafe fn new(target: &StopSource) -> Self {
		Self {
			target: NonNull::from(target),
		}
	}
}

impl StopFn for ForwardStopRequest {
	fn on_stop(self) {
		unsafe { self.target.as_ref() }.request_stop();
	}
}

/// # Safety
///
/// The target source is required (by `ForwardStopRequest::new`) to outlive the
/// registration, and [`StopSource`] is [`Sync`].
unsafe impl Send for ForwardStopRequest {}

/// The intrusive list node. Lives at offset zero of a [`StopCallback`].
///
/// `next`/`prev` are guarded by the source's lock bit. `removed_during_callback`
/// is only touched on the notifying thread. `completed` is the cross-thread
/// handshake for blocking deregistration.
struct CallbackNode {
	next: *mut CallbackNode,
	/// Pointer to the predecessor's `next` field (or the list head), or null
	/// once the node has been popped for execution.
	prev: *mut *mut CallbackNode,
	removed_during_callback: *mut bool,
	completed: AtomicBool,
	execute: unsafe fn(*mut CallbackNode),
}

/// An intrusively registered stop callback.
///
/// Construction is inert; the callback participates only once
/// [`register`](`Self::register`)ed, which requires pinning because the node
/// is linked by address. Dropping deregisters:
///
/// - a callback that has not started executing is unlinked and never runs;
/// - a callback executing concurrently on another thread blocks the
///   destructor until it completes;
/// - a callback dropping itself from inside its own invocation neither blocks
///   nor runs again.
#[repr(C)]
pub struct StopCallback<'a, F: StopFn> {
	// Must stay the first field; `execute` recovers the container from the
	// node address.
	node: UnsafeCell<CallbackNode>,
	source: Cell<Option<&'a StopSource>>,
	func: UnsafeCell<Option<F>>,
	registered: Cell<bool>,
	_pinned: PhantomPinned,
}

/// # Safety
///
/// The node is only mutated under the source's lock discipline, and `func` is
/// taken exactly once by whichever thread wins the execute/deregister
/// handshake; `F: Send` is required at the registration site.
unsafe impl<F: StopFn + Send> Send for StopCallback<'_, F> {}
/// # Safety
///
/// See the [`Send`] implementation.
unsafe impl<F: StopFn + Send> Sync for StopCallback<'_, F> {}

impl<F: StopFn> Debug for StopCallback<'_, F> {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		f.debug_struct("StopCallback")
			.field("registered", &self.registered.get())
			.finish_non_exhaustive()
	}
}

impl<'a, F: StopFn> StopCallback<'a, F> {
	/// Creates an unregistered callback for `token`.
	#[must_use]
	pub fn new(token: StopToken<'a>, func: F) -> Self {
		Self {
			node: UnsafeCell::new(CallbackNode {
				next: ptr::null_mut(),
				prev: ptr::null_mut(),
				removed_during_callback: ptr::null_mut(),
				completed: AtomicBool::new(false),
				execute: Self::execute,
			}),
			source: Cell::new(token.source),
			func: UnsafeCell::new(Some(func)),
			registered: Cell::new(false),
			_pinned: PhantomPinned,
		}
	}

	/// Links this callback into its source's list, or runs it inline right
	/// here when stop was already requested. At most once per callback.
	pub fn register(self: Pin<&Self>)
	where
		F: Send,
	{
		let this = self.get_ref();
		debug_assert!(!this.registered.get());
		let Some(source) = this.source.get() else {
			return;
		};
		if unsafe { source.try_register(this.node.get()) } {
			this.registered.set(true);
		} else {
			this.source.set(None);
			unsafe { Self::execute(this.node.get()) };
		}
	}

	/// # Safety
	///
	/// `node` must be the node embedded in a live `StopCallback<'a, F>` whose
	/// `func` has not been taken.
	unsafe fn execute(node: *mut CallbackNode) {
		let this = &*node.cast::<Self>();
		let func = (*this.func.get())
			.take()
			.expect("callbacks execute at most once");
		func.on_stop();
	}
}

impl<F: StopFn> Drop for StopCallback<'_, F> {
	fn drop(&mut self) {
		if self.registered.get() {
			if let Some(source) = self.source.get() {
				unsafe { source.deregister(self.node.get()) };
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use core::pin::pin;
	use std::sync::Mutex;

	#[test]
	fn request_stop_transitions_once() {
		let source = StopSource::new();
		assert!(!source.stop_requested());
		assert!(source.request_stop());
		assert!(source.stop_requested());
		assert!(!source.request_stop());
	}

	#[test]
	fn never_token() {
		let token = StopToken::never();
		assert!(!token.stop_possible());
		assert!(!token.stop_requested());
	}

	#[test]
	fn callback_runs_on_request() {
		let source = StopSource::new();
		let ran = AtomicBool::new(false);
		let callback = pin!(StopCallback::new(
			source.token(),
			FnStop(|| ran.store(true, Ordering::Relaxed))
		));
		callback.as_ref().register();
		assert!(!ran.load(Ordering::Relaxed));
		source.request_stop();
		assert!(ran.load(Ordering::Relaxed));
	}

	#[test]
	fn late_registration_runs_inline() {
		let source = StopSource::new();
		source.request_stop();
		let ran = AtomicBool::new(false);
		let callback = pin!(StopCallback::new(
			source.token(),
			FnStop(|| ran.store(true, Ordering::Relaxed))
		));
		callback.as_ref().register();
		assert!(ran.load(Ordering::Relaxed));
	}

	#[test]
	fn dropped_callback_does_not_run() {
		let source = StopSource::new();
		let ran = AtomicBool::new(false);
		{
			let callback = pin!(StopCallback::new(
				source.token(),
				FnStop(|| ran.store(true, Ordering::Relaxed))
			));
			callback.as_ref().register();
		}
		source.request_stop();
		assert!(!ran.load(Ordering::Relaxed));
	}

	#[test]
	fn unregistered_callback_is_inert() {
		let source = StopSource::new();
		let _callback = StopCallback::new(source.token(), FnStop(|| unreachable!()));
		source.request_stop();
	}

	#[test]
	fn callbacks_run_in_reverse_registration_order() {
		let source = StopSource::new();
		let order = Mutex::new(Vec::new());
		let first = pin!(StopCallback::new(
			source.token(),
			FnStop(|| order.lock().expect("unpoisoned").push(1))
		));
		let second = pin!(StopCallback::new(
			source.token(),
			FnStop(|| order.lock().expect("unpoisoned").push(2))
		));
		first.as_ref().register();
		second.as_ref().register();
		source.request_stop();
		assert_eq!(*order.lock().expect("unpoisoned"), [2, 1]);
	}
}
