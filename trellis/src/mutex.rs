//! Async mutual exclusion. See [`AsyncMutex`] and [`AsyncRwLock`].
//!
//! Both locks follow the same discipline: a spinlock bit guards an intrusive
//! FIFO queue of waiters (each embedded in its lock operation, so nothing
//! allocates), and unlocking hands the lock to the front waiter directly,
//! resuming it inline after the queue bit is released. No lock is ever held
//! across a call to user code.
//!
//! Lock senders are not cancellation-aware; compose with
//! [`stop_when`](`crate::stop_when`) where a bounded wait is needed.

use core::{
	cell::UnsafeCell,
	fmt::{self, Debug, Formatter},
	hint,
	marker::{PhantomData, PhantomPinned},
	ops::{Deref, DerefMut},
	pin::Pin,
	ptr,
	sync::atomic::{AtomicU8, Ordering},
};

use phloem::{
	operation::OperationState,
	receiver::Receiver,
	sender::{Blocking, Sender},
	slot::Slot,
};

const LOCKED: u8 = 1;
const QUEUE_LOCKED: u8 = 2;

/// A sender-based mutex protecting a `T`.
///
/// [`lock`](`AsyncMutex::lock`) yields a sender of a guard; contended lock
/// operations park intrusively and are resumed in FIFO order by the
/// releasing guard.
pub struct AsyncMutex<T> {
	state: AtomicU8,
	/// Guarded by [`QUEUE_LOCKED`].
	head: UnsafeCell<*mut MutexWaiter>,
	/// Guarded by [`QUEUE_LOCKED`].
	tail: UnsafeCell<*mut MutexWaiter>,
	data: UnsafeCell<T>,
}

/// # Safety
///
/// The queue cells are only touched under the queue bit and the data only
/// under the lock; `T` crossing threads with the guard needs [`Send`].
unsafe impl<T: Send> Send for AsyncMutex<T> {}
/// # Safety
///
/// See the [`Send`] implementation.
unsafe impl<T: Send> Sync for AsyncMutex<T> {}

impl<T: Debug> Debug for AsyncMutex<T> {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		f.debug_struct("AsyncMutex").finish_non_exhaustive()
	}
}

struct MutexWaiter {
	next: *mut MutexWaiter,
	resume: unsafe fn(*mut MutexWaiter),
}

impl<T> AsyncMutex<T> {
	/// Creates an unlocked mutex around `value`.
	pub const fn new(value: T) -> Self {
		Self {
			state: AtomicU8::new(0),
			head: UnsafeCell::new(ptr::null_mut()),
			tail: UnsafeCell::new(ptr::null_mut()),
			data: UnsafeCell::new(value),
		}
	}

	/// Consumes the mutex, returning the protected value.
	pub fn into_inner(self) -> T {
		self.data.into_inner()
	}

	/// Plain mutable access; no locking needed through `&mut self`.
	pub fn get_mut(&mut self) -> &mut T {
		self.data.get_mut()
	}

	/// Attempts to acquire the lock without waiting.
	pub fn try_lock(&self) -> Option<AsyncMutexGuard<'_, T>> {
		let flags = self.lock_queue();
		if flags & LOCKED == 0 {
			self.unlock_queue(LOCKED);
			Some(AsyncMutexGuard { mutex: self })
		} else {
			self.unlock_queue(flags);
			None
		}
	}

	/// Returns a sender completing with the guard once the lock is acquired.
	///
	/// Uncontended acquisition completes inline. The error channel is
	/// phantom.
	pub fn lock<E>(&self) -> Lock<'_, T, E> {
		Lock {
			mutex: self,
			_error: PhantomData,
		}
	}

	/// Spins until the queue bit is acquired; returns the other flag bits.
	fn lock_queue(&self) -> u8 {
		loop {
			let flags = self.state.fetch_or(QUEUE_LOCKED, Ordering::Acquire);
			if flags & QUEUE_LOCKED == 0 {
				return flags;
			}
			hint::spin_loop();
		}
	}

	fn unlock_queue(&self, flags: u8) {
		debug_assert_eq!(flags & QUEUE_LOCKED, 0);
		self.state.store(flags, Ordering::Release);
	}

	fn unlock(&self) {
		let flags = self.lock_queue();
		debug_assert_ne!(flags & LOCKED, 0);
		unsafe {
			let head = *self.head.get();
			if head.is_null() {
				self.unlock_queue(flags & !LOCKED);
			} else {
				// Hand-off: the lock stays held, on the front waiter's
				// behalf.
				*self.head.get() = (*head).next;
				if (*self.head.get()).is_null() {
					*self.tail.get() = ptr::null_mut();
				}
				self.unlock_queue(flags);
				((*head).resume)(head);
			}
		}
	}

	/// # Safety
	///
	/// Must be called with the queue bit held; `waiter` must stay valid until
	/// resumed.
	unsafe fn enqueue(&self, waiter: *mut MutexWaiter) {
		(*waiter).next = ptr::null_mut();
		let tail = *self.tail.get();
		if tail.is_null() {
			*self.head.get() = waiter;
		} else {
			(*tail).next = waiter;
		}
		*self.tail.get() = waiter;
	}
}

/// Owned lock on an [`AsyncMutex`]; unlocks (and hands off) on drop.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct AsyncMutexGuard<'m, T> {
	mutex: &'m AsyncMutex<T>,
}

impl<T: Debug> Debug for AsyncMutexGuard<'_, T> {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		f.debug_tuple("AsyncMutexGuard").field(&&**self).finish()
	}
}

impl<T> Deref for AsyncMutexGuard<'_, T> {
	type Target = T;

	fn deref(&self) -> &T {
		unsafe { &*self.mutex.data.get() }
	}
}

impl<T> DerefMut for AsyncMutexGuard<'_, T> {
	fn deref_mut(&mut self) -> &mut T {
		unsafe { &mut *self.mutex.data.get() }
	}
}

impl<T> Drop for AsyncMutexGuard<'_, T> {
	fn drop(&mut self) {
		self.mutex.unlock();
	}
}

/// Sender acquiring an [`AsyncMutex`]. See [`lock`](`AsyncMutex::lock`).
#[derive(Debug, Clone)]
#[must_use = "senders do nothing unless connected and started"]
pub struct Lock<'m, T, E> {
	mutex: &'m AsyncMutex<T>,
	_error: PhantomData<fn() -> E>,
}

impl<'m, T, E> Sender for Lock<'m, T, E> {
	type Value = AsyncMutexGuard<'m, T>;
	type Error = E;
	type Operation<R>
		= LockOperation<'m, T, R>
	where
		R: Receiver<Value = AsyncMutexGuard<'m, T>, Error = E>;

	const SENDS_DONE: bool = false;
	const BLOCKING: Blocking = Blocking::Maybe;

	fn connect<R>(self, receiver: R) -> Self::Operation<R>
	where
		R: Receiver<Value = AsyncMutexGuard<'m, T>, Error = E>,
	{
		LockOperation {
			node: MutexWaiter {
				next: ptr::null_mut(),
				resume: LockOperation::<T, R>::resume,
			},
			mutex: self.mutex,
			receiver: Slot::with(receiver),
			_pinned: PhantomPinned,
		}
	}
}

/// Lives at offset zero of the operation so `resume` can recover the
/// container.
#[repr(C)]
pub struct LockOperation<'m, T, R> {
	node: MutexWaiter,
	mutex: &'m AsyncMutex<T>,
	receiver: Slot<R>,
	_pinned: PhantomPinned,
}

/// # Safety
///
/// A parked operation is only reachable through the mutex queue, which hands
/// it to exactly one unlocker; the receiver crossing to that thread is
/// [`Send`] by bound.
unsafe impl<T: Send, R: Send> Send for LockOperation<'_, T, R> {}
/// # Safety
///
/// See the [`Send`] implementation.
unsafe impl<T: Send, R: Send> Sync for LockOperation<'_, T, R> {}

impl<'m, T, R> LockOperation<'m, T, R>
where
	R: Receiver<Value = AsyncMutexGuard<'m, T>>,
{
	unsafe fn resume(node: *mut MutexWaiter) {
		let this = &*node.cast::<Self>();
		let guard = AsyncMutexGuard { mutex: this.mutex };
		this.receiver
			.take()
			.expect("resumed at most once")
			.set_value(guard);
	}
}

impl<'m, T, R> OperationState for LockOperation<'m, T, R>
where
	R: Receiver<Value = AsyncMutexGuard<'m, T>>,
{
	fn start(self: Pin<&mut Self>) {
		let this = unsafe { self.get_unchecked_mut() };
		let mutex = this.mutex;
		let flags = mutex.lock_queue();
		if flags & LOCKED == 0 {
			mutex.unlock_queue(LOCKED);
			let guard = AsyncMutexGuard { mutex };
			unsafe { this.receiver.take() }
				.expect("started at most once")
				.set_value(guard);
		} else {
			unsafe { mutex.enqueue(ptr::addr_of_mut!(this.node)) };
			mutex.unlock_queue(flags);
		}
	}
}

/// A sender-based reader/writer lock, built on the same queue discipline as
/// [`AsyncMutex`] with a reader count on the side.
///
/// Waiters are granted strictly in FIFO order (a pending writer blocks later
/// readers); a releasing writer wakes either the front writer or the whole
/// leading run of readers.
pub struct AsyncRwLock<T> {
	state: AtomicU8,
	/// Guarded by [`QUEUE_LOCKED`].
	inner: UnsafeCell<RwState>,
	data: UnsafeCell<T>,
}

struct RwState {
	writer: bool,
	readers: usize,
	head: *mut RwWaiter,
	tail: *mut RwWaiter,
}

struct RwWaiter {
	next: *mut RwWaiter,
	exclusive: bool,
	resume: unsafe fn(*mut RwWaiter),
}

/// # Safety
///
/// As for [`AsyncMutex`]; shared guards additionally alias `T`, hence the
/// [`Sync`] bound there.
unsafe impl<T: Send> Send for AsyncRwLock<T> {}
/// # Safety
///
/// Shared guards hand out `&T` from several threads at once.
unsafe impl<T: Send + Sync> Sync for AsyncRwLock<T> {}

impl<T: Debug> Debug for AsyncRwLock<T> {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		f.debug_struct("AsyncRwLock").finish_non_exhaustive()
	}
}

impl<T> AsyncRwLock<T> {
	/// Creates an unlocked lock around `value`.
	pub const fn new(value: T) -> Self {
		Self {
			state: AtomicU8::new(0),
			inner: UnsafeCell::new(RwState {
				writer: false,
				readers: 0,
				head: ptr::null_mut(),
				tail: ptr::null_mut(),
			}),
			data: UnsafeCell::new(value),
		}
	}

	/// Consumes the lock, returning the protected value.
	pub fn into_inner(self) -> T {
		self.data.into_inner()
	}

	/// Plain mutable access; no locking needed through `&mut self`.
	pub fn get_mut(&mut self) -> &mut T {
		self.data.get_mut()
	}

	/// Returns a sender completing with a shared guard.
	pub fn lock_shared<E>(&self) -> LockShared<'_, T, E> {
		LockShared {
			lock: self,
			_error: PhantomData,
		}
	}

	/// Returns a sender completing with an exclusive guard.
	pub fn lock_exclusive<E>(&self) -> LockExclusive<'_, T, E> {
		LockExclusive {
			lock: self,
			_error: PhantomData,
		}
	}

	fn lock_queue(&self) {
		loop {
			let flags = self.state.fetch_or(QUEUE_LOCKED, Ordering::Acquire);
			if flags & QUEUE_LOCKED == 0 {
				return;
			}
			hint::spin_loop();
		}
	}

	fn unlock_queue(&self) {
		self.state.store(0, Ordering::Release);
	}

	/// # Safety
	///
	/// Must be called with the queue bit held.
	unsafe fn enqueue(&self, waiter: *mut RwWaiter) {
		let inner = &mut *self.inner.get();
		(*waiter).next = ptr::null_mut();
		if inner.tail.is_null() {
			inner.head = waiter;
		} else {
			(*inner.tail).next = waiter;
		}
		inner.tail = waiter;
	}

	fn unlock_shared(&self) {
		self.lock_queue();
		let granted = unsafe {
			let inner = &mut *self.inner.get();
			inner.readers -= 1;
			if inner.readers == 0 {
				Self::grant(inner)
			} else {
				ptr::null_mut()
			}
		};
		self.unlock_queue();
		unsafe { Self::resume_all(granted) };
	}

	fn unlock_exclusive(&self) {
		self.lock_queue();
		let granted = unsafe {
			let inner = &mut *self.inner.get();
			inner.writer = false;
			Self::grant(inner)
		};
		self.unlock_queue();
		unsafe { Self::resume_all(granted) };
	}

	/// Pops the grantable prefix of the queue (one writer, or the leading
	/// run of readers), updating the lock accounting. Returns a detached,
	/// null-terminated chain. Must run with the queue bit held and the lock
	/// free.
	unsafe fn grant(inner: &mut RwState) -> *mut RwWaiter {
		debug_assert!(!inner.writer);
		debug_assert_eq!(inner.readers, 0);
		let head = inner.head;
		if head.is_null() {
			return ptr::null_mut();
		}
		if (*head).exclusive {
			inner.head = (*head).next;
			if inner.head.is_null() {
				inner.tail = ptr::null_mut();
			}
			(*head).next = ptr::null_mut();
			inner.writer = true;
			return head;
		}
		let mut last = head;
		let mut count = 1;
		while !(*last).next.is_null() && !(*(*last).next).exclusive {
			last = (*last).next;
			count += 1;
		}
		inner.head = (*last).next;
		if inner.head.is_null() {
			inner.tail = ptr::null_mut();
		}
		(*last).next = ptr::null_mut();
		inner.readers = count;
		head
	}

	/// Resumes a detached chain, reading each link before its operation can
	/// go away.
	unsafe fn resume_all(mut waiter: *mut RwWaiter) {
		while !waiter.is_null() {
			let next = (*waiter).next;
			((*waiter).resume)(waiter);
			waiter = next;
		}
	}
}

/// Shared lock on an [`AsyncRwLock`]; releases on drop.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct AsyncRwLockReadGuard<'m, T> {
	lock: &'m AsyncRwLock<T>,
}

impl<T> Deref for AsyncRwLockReadGuard<'_, T> {
	type Target = T;

	fn deref(&self) -> &T {
		unsafe { &*self.lock.data.get() }
	}
}

impl<T> Drop for AsyncRwLockReadGuard<'_, T> {
	fn drop(&mut self) {
		self.lock.unlock_shared();
	}
}

/// Exclusive lock on an [`AsyncRwLock`]; releases (and hands off) on drop.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct AsyncRwLockWriteGuard<'m, T> {
	lock: &'m AsyncRwLock<T>,
}

impl<T> Deref for AsyncRwLockWriteGuard<'_, T> {
	type Target = T;

	fn deref(&self) -> &T {
		unsafe { &*self.lock.data.get() }
	}
}

impl<T> DerefMut for AsyncRwLockWriteGuard<'_, T> {
	fn deref_mut(&mut self) -> &mut T {
		unsafe { &mut *self.lock.data.get() }
	}
}

impl<T> Drop for AsyncRwLockWriteGuard<'_, T> {
	fn drop(&mut self) {
		self.lock.unlock_exclusive();
	}
}

macro_rules! rw_lock_sender {
	($sender_name:ident, $op_name:ident, $guard:ident, $exclusive:literal, $acquire:ident) => {
		/// Lock-acquisition sender for [`AsyncRwLock`].
		#[derive(Debug, Clone)]
		#[must_use = "senders do nothing unless connected and started"]
		pub struct $sender_name<'m, T, E> {
			lock: &'m AsyncRwLock<T>,
			_error: PhantomData<fn() -> E>,
		}

		impl<'m, T, E> Sender for $sender_name<'m, T, E> {
			type Value = $guard<'m, T>;
			type Error = E;
			type Operation<R>
				= $op_name<'m, T, R>
			where
				R: Receiver<Value = $guard<'m, T>, Error = E>;

			const SENDS_DONE: bool = false;
			const BLOCKING: Blocking = Blocking::Maybe;

			fn connect<R>(self, receiver: R) -> Self::Operation<R>
			where
				R: Receiver<Value = $guard<'m, T>, Error = E>,
			{
				$op_name {
					node: RwWaiter {
						next: ptr::null_mut(),
						exclusive: $exclusive,
						resume: $op_name::<T, R>::resume,
					},
					lock: self.lock,
					receiver: Slot::with(receiver),
					_pinned: PhantomPinned,
				}
			}
		}

		/// Lives at offset zero of the operation so `resume` can recover the
		/// container.
		#[repr(C)]
		pub struct $op_name<'m, T, R> {
			node: RwWaiter,
			lock: &'m AsyncRwLock<T>,
			receiver: Slot<R>,
			_pinned: PhantomPinned,
		}

		/// # Safety
		///
		/// As for [`LockOperation`].
		unsafe impl<T: Send, R: Send> Send for $op_name<'_, T, R> {}
		/// # Safety
		///
		/// As for [`LockOperation`].
		unsafe impl<T: Send, R: Send> Sync for $op_name<'_, T, R> {}

		impl<'m, T, R> $op_name<'m, T, R>
		where
			R: Receiver<Value = $guard<'m, T>>,
		{
			unsafe fn resume(node: *mut RwWaiter) {
				let this = &*node.cast::<Self>();
				let guard = $guard { lock: this.lock };
				this.receiver
					.take()
					.expect("resumed at most once")
					.set_value(guard);
			}
		}

		impl<'m, T, R> OperationState for $op_name<'m, T, R>
		where
			R: Receiver<Value = $guard<'m, T>>,
		{
			fn start(self: Pin<&mut Self>) {
				let this = unsafe { self.get_unchecked_mut() };
				let lock = this.lock;
				lock.lock_queue();
				let acquired = unsafe {
					let inner = &mut *lock.inner.get();
					if inner.head.is_null() && $op_name::<T, R>::$acquire(inner) {
						true
					} else {
						lock.enqueue(ptr::addr_of_mut!(this.node));
						false
					}
				};
				lock.unlock_queue();
				if acquired {
					let guard = $guard { lock };
					unsafe { this.receiver.take() }
						.expect("started at most once")
						.set_value(guard);
				}
			}
		}
	};
}

impl<'m, T, R> LockSharedOperation<'m, T, R> {
	fn try_acquire_shared(inner: &mut RwState) -> bool {
		if inner.writer {
			false
		} else {
			inner.readers += 1;
			true
		}
	}
}

impl<'m, T, R> LockExclusiveOperation<'m, T, R> {
	fn try_acquire_exclusive(inner: &mut RwState) -> bool {
		if inner.writer || inner.readers > 0 {
			false
		} else {
			inner.writer = true;
			true
		}
	}
}

rw_lock_sender!(
	LockShared,
	LockSharedOperation,
	AsyncRwLockReadGuard,
	false,
	try_acquire_shared
);
rw_lock_sender!(
	LockExclusive,
	LockExclusiveOperation,
	AsyncRwLockWriteGuard,
	true,
	try_acquire_exclusive
);
