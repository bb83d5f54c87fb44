//! Structured concurrency for fire-and-forget work. See [`AsyncScope`].

use core::{
	fmt::Debug,
	marker::{PhantomData, PhantomPinned},
	pin::Pin,
	ptr::NonNull,
	sync::atomic::{AtomicUsize, Ordering},
};

use pin_project::pin_project;
use scopeguard::ScopeGuard;

use phloem::{
	operation::OperationState,
	receiver::Receiver,
	sender::{Blocking, Sender},
	slot::{OpSlot, Slot},
	stop::StopToken,
};

use crate::event::{ManualResetEvent, WaitOperation};

/// `(opstate & 1)` is 1 until the scope has been ended by a starting `join`;
/// `(opstate >> 1)` is the number of outstanding nested operations and
/// references.
const NOT_ENDED: usize = 1;

/// An anchor that tracks nested operations and can be drained.
///
/// Lifecycle: open → any number of [`nest`](`AsyncScope::nest`)s and
/// [`spawn_detached`](`AsyncScope::spawn_detached`)s → a started
/// [`join`](`AsyncScope::join`) ends the scope → in-flight work drains →
/// `join` completes and the scope is droppable.
///
/// Ending the scope only *drains*: it does not cancel in-flight work. A
/// caller who wants cancel-on-close composes the nested senders with its own
/// [`StopSource`](`phloem::stop::StopSource`) (e.g. via
/// [`stop_when`](`crate::stop_when`)) and requests stop before joining.
///
/// Dropping a scope that has not drained is a usage error, caught by a debug
/// assertion.
#[derive(Debug)]
pub struct AsyncScope {
	opstate: AtomicUsize,
	event: ManualResetEvent,
}

impl Default for AsyncScope {
	fn default() -> Self {
		Self::new()
	}
}

impl Drop for AsyncScope {
	fn drop(&mut self) {
		debug_assert!(
			self.joined(),
			"async scope dropped with outstanding operations or without joining"
		);
	}
}

impl AsyncScope {
	/// Creates an open, empty scope.
	#[must_use]
	pub const fn new() -> Self {
		Self {
			opstate: AtomicUsize::new(NOT_ENDED),
			event: ManualResetEvent::new(),
		}
	}

	/// The number of outstanding nested operations and references.
	#[must_use]
	pub fn use_count(&self) -> usize {
		self.opstate.load(Ordering::Relaxed) >> 1
	}

	/// Whether a `join` has started (ending the scope).
	#[must_use]
	pub fn join_started(&self) -> bool {
		self.opstate.load(Ordering::Relaxed) & NOT_ENDED == 0
	}

	/// Whether the scope has ended *and* drained.
	#[must_use]
	pub fn joined(&self) -> bool {
		self.opstate.load(Ordering::Relaxed) == 0
	}

	/// Wraps `sender` in the scope: the result behaves like `sender` while
	/// the scope is open, and completes immediately with `Done` when the
	/// scope has already ended.
	///
	/// The scope reference is held until just after the nested operation's
	/// completion has been forwarded downstream.
	pub fn nest<S: Sender>(&self, sender: S) -> Nest<'_, S> {
		match ScopeRef::try_new(self) {
			Some(scope_ref) => Nest {
				inner: Some((scope_ref, sender)),
			},
			None => {
				log::trace!("async_scope: nest on ended scope degrades to done");
				Nest { inner: None }
			}
		}
	}

	/// Connects `sender` (nested in this scope) to an internal heap-backed
	/// receiver and starts it, detached. Completion frees the allocation;
	/// an error outcome is logged and dropped.
	///
	/// On an already-ended scope this is a no-op (the nested sender completes
	/// `Done` inline). If connecting unwinds, nothing has started and
	/// nothing leaks.
	pub fn spawn_detached<S>(&self, sender: S)
	where
		S: Sender<Value = ()>,
		S::Error: Debug,
	{
		let nested = self.nest(sender);
		let task = Box::into_raw(Box::new(SpawnTask { op: OpSlot::empty() }));
		let task_ptr = unsafe { NonNull::new_unchecked(task) };
		// Frees the allocation if `connect` unwinds; defused once the
		// operation owns itself.
		let alloc = scopeguard::guard((), |()| unsafe { drop(Box::from_raw(task)) });
		log::trace!("async_scope: spawning detached operation");
		unsafe {
			(*task)
				.op
				.connect_and_start(nested, || SpawnReceiver { task: task_ptr });
		}
		ScopeGuard::into_inner(alloc);
	}

	/// Returns a sender that ends the scope when started and completes with
	/// `()` once every outstanding nested operation has drained.
	///
	/// Nests attempted after the `join` has started degrade to `Done`.
	pub fn join<E>(&self) -> Join<'_, E> {
		Join {
			scope: self,
			_error: PhantomData,
		}
	}

	fn end_scope(&self) {
		let old = self.opstate.fetch_and(!NOT_ENDED, Ordering::AcqRel);
		log::trace!(
			"async_scope: ending scope with {} outstanding operation(s)",
			old >> 1
		);
		if old >> 1 == 0 {
			self.event.set();
		}
	}

	fn try_record_start(&self) -> bool {
		let mut opstate = self.opstate.load(Ordering::Relaxed);
		loop {
			if opstate & NOT_ENDED == 0 {
				return false;
			}
			debug_assert!(opstate <= usize::MAX - 2);
			match self.opstate.compare_exchange_weak(
				opstate,
				opstate + 2,
				Ordering::Relaxed,
				Ordering::Relaxed,
			) {
				Ok(_) => return true,
				Err(actual) => opstate = actual,
			}
		}
	}

	fn record_completion(&self) {
		let old = self.opstate.fetch_sub(2, Ordering::AcqRel);
		if old & NOT_ENDED == 0 && old >> 1 == 1 {
			// The scope has ended and this was the last outstanding
			// operation.
			self.event.set();
		}
	}
}

/// An owned use-count increment on a scope.
struct ScopeRef<'s> {
	scope: &'s AsyncScope,
}

impl<'s> ScopeRef<'s> {
	fn try_new(scope: &'s AsyncScope) -> Option<Self> {
		scope.try_record_start().then(|| Self { scope })
	}
}

impl Drop for ScopeRef<'_> {
	fn drop(&mut self) {
		self.scope.record_completion();
	}
}

/// A sender nested in an [`AsyncScope`]. See [`nest`](`AsyncScope::nest`).
#[must_use = "senders do nothing unless connected and started"]
pub struct Nest<'s, S> {
	/// `None` when the scope had already ended at `nest` time.
	inner: Option<(ScopeRef<'s>, S)>,
}

impl<'s, S: Sender> Sender for Nest<'s, S> {
	type Value = S::Value;
	type Error = S::Error;
	type Operation<R>
		= NestOperation<'s, S, R>
	where
		R: Receiver<Value = S::Value, Error = S::Error>;

	const SENDS_DONE: bool = true;
	const BLOCKING: Blocking = match S::BLOCKING {
		// The degenerate (ended-scope) operation completes inline.
		Blocking::Never => Blocking::Maybe,
		blocking => blocking,
	};

	fn connect<R>(self, receiver: R) -> Self::Operation<R>
	where
		R: Receiver<Value = S::Value, Error = S::Error>,
	{
		let (scope_ref, sender) = match self.inner {
			Some((scope_ref, sender)) => (Slot::with(scope_ref), Slot::with(sender)),
			None => (Slot::empty(), Slot::empty()),
		};
		NestOperation {
			scope_ref,
			sender,
			receiver: Slot::with(receiver),
			child: OpSlot::empty(),
			_pinned: PhantomPinned,
		}
	}
}

pub struct NestOperation<'s, S, R>
where
	S: Sender,
	R: Receiver<Value = S::Value, Error = S::Error>,
{
	scope_ref: Slot<ScopeRef<'s>>,
	sender: Slot<S>,
	receiver: Slot<R>,
	child: OpSlot<S, NestReceiver<'s, S, R>>,
	_pinned: PhantomPinned,
}

impl<'s, S, R> OperationState for NestOperation<'s, S, R>
where
	S: Sender,
	R: Receiver<Value = S::Value, Error = S::Error>,
{
	fn start(self: Pin<&mut Self>) {
		let this = self.into_ref().get_ref();
		let op = NonNull::from(this);
		unsafe {
			match this.sender.take() {
				Some(sender) => this.child.connect_and_start(sender, || NestReceiver { op }),
				None => this
					.receiver
					.take()
					.expect("started at most once")
					.set_done(),
			}
		}
	}
}

pub struct NestReceiver<'s, S, R>
where
	S: Sender,
	R: Receiver<Value = S::Value, Error = S::Error>,
{
	op: NonNull<NestOperation<'s, S, R>>,
}

/// # Safety
///
/// A completing nested operation hands delivery (and the scope-reference
/// release) to its thread; the payloads that cross with it are required to
/// be [`Send`], and the scope itself is [`Sync`].
unsafe impl<S, R> Send for NestReceiver<'_, S, R>
where
	S: Sender,
	S::Value: Send,
	S::Error: Send,
	R: Receiver<Value = S::Value, Error = S::Error> + Send,
{
}

impl<'s, S, R> NestReceiver<'s, S, R>
where
	S: Sender,
	R: Receiver<Value = S::Value, Error = S::Error>,
{
	/// Tears down the nested operation and hands back the receiver; the
	/// scope reference is released only after the downstream signal, when
	/// the returned holder drops.
	fn finish(self) -> (R, Option<ScopeRef<'s>>) {
		let op = unsafe { self.op.as_ref() };
		unsafe {
			let scope_ref = op.scope_ref.take();
			op.child.vacate();
			(op.receiver.take().expect("completes once"), scope_ref)
		}
	}
}

impl<S, R> Receiver for NestReceiver<'_, S, R>
where
	S: Sender,
	R: Receiver<Value = S::Value, Error = S::Error>,
{
	type Value = S::Value;
	type Error = S::Error;

	fn set_value(self, value: S::Value) {
		let (receiver, _scope_ref) = self.finish();
		receiver.set_value(value);
	}

	fn set_error(self, error: S::Error) {
		let (receiver, _scope_ref) = self.finish();
		receiver.set_error(error);
	}

	fn set_done(self) {
		let (receiver, _scope_ref) = self.finish();
		receiver.set_done();
	}

	fn stop_token(&self) -> StopToken<'_> {
		let op = unsafe { self.op.as_ref() };
		unsafe { op.receiver.get() }.stop_token()
	}
}

/// The detached holder of one spawned operation; owns itself once started
/// and is freed by its receiver on completion.
struct SpawnTask<'s, S>
where
	S: Sender<Value = ()>,
	S::Error: Debug,
{
	op: OpSlot<Nest<'s, S>, SpawnReceiver<'s, S>>,
}

struct SpawnReceiver<'s, S>
where
	S: Sender<Value = ()>,
	S::Error: Debug,
{
	task: NonNull<SpawnTask<'s, S>>,
}

/// # Safety
///
/// Completion frees the holder on the completing thread; the sender's
/// artefacts crossing with it are required to be [`Send`].
unsafe impl<S> Send for SpawnReceiver<'_, S>
where
	S: Sender<Value = ()> + Send,
	S::Error: Send + Debug,
{
}

impl<'s, S> SpawnReceiver<'s, S>
where
	S: Sender<Value = ()>,
	S::Error: Debug,
{
	fn free(self) {
		unsafe { drop(Box::from_raw(self.task.as_ptr())) };
	}
}

impl<S> Receiver for SpawnReceiver<'_, S>
where
	S: Sender<Value = ()>,
	S::Error: Debug,
{
	type Value = ();
	type Error = S::Error;

	fn set_value(self, (): ()) {
		log::trace!("async_scope: detached operation completed");
		self.free();
	}

	fn set_error(self, error: S::Error) {
		log::error!("async_scope: detached operation failed: {error:?}");
		self.free();
	}

	fn set_done(self) {
		log::trace!("async_scope: detached operation cancelled");
		self.free();
	}
}

/// Sender draining an [`AsyncScope`]. See [`join`](`AsyncScope::join`).
#[derive(Debug, Clone)]
#[must_use = "senders do nothing unless connected and started"]
pub struct Join<'s, E> {
	scope: &'s AsyncScope,
	_error: PhantomData<fn() -> E>,
}

impl<'s, E> Sender for Join<'s, E> {
	type Value = ();
	type Error = E;
	type Operation<R>
		= JoinOperation<'s, R>
	where
		R: Receiver<Value = (), Error = E>;

	const SENDS_DONE: bool = false;
	const BLOCKING: Blocking = Blocking::Maybe;

	fn connect<R>(self, receiver: R) -> Self::Operation<R>
	where
		R: Receiver<Value = (), Error = E>,
	{
		JoinOperation {
			scope: self.scope,
			wait: self.scope.event.wait::<E>().connect(receiver),
		}
	}
}

/// Ends the scope, then awaits the drained event.
#[pin_project]
pub struct JoinOperation<'s, R> {
	scope: &'s AsyncScope,
	#[pin]
	wait: WaitOperation<'s, R>,
}

impl<R> OperationState for JoinOperation<'_, R>
where
	R: Receiver<Value = ()>,
{
	fn start(self: Pin<&mut Self>) {
		let this = self.project();
		this.scope.end_scope();
		this.wait.start();
	}
}
