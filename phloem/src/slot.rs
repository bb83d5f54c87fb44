//! In-place storage primitives for operation states.
//!
//! Adapters embed child operations by value. Because a Rust operation only
//! becomes address-stable once pinned (see
//! [`OperationState`](`crate::operation::OperationState`)), adapters whose
//! child receivers point back into the parent hold the child *sender* until
//! `start`, then connect and start it in place through an [`OpSlot`].
//! [`Slot`] is the accompanying interior-mutable payload cell for state that
//! the surrounding machine constructs and tears down out of band.
//!
//! Both cells track their own occupancy, so an operation built from them gets
//! a correct `Drop` for every intermediate state for free.
//!
//! # Safety
//!
//! Neither type synchronises; the operation-state protocol does (one
//! completion, serialised, happens-after `start`). Every access goes through
//! a fresh pointer derived from the interior [`UnsafeCell`], so that a child
//! completing inline may legally re-enter the slot that holds it.

use core::{
	cell::UnsafeCell,
	fmt::{self, Debug, Formatter},
	pin::Pin,
};

use crate::{operation::OperationState, receiver::Receiver, sender::Sender};

/// An interior-mutable optional payload cell.
pub struct Slot<T> {
	inner: UnsafeCell<Option<T>>,
}

impl<T> Debug for Slot<T> {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		f.debug_struct("Slot").finish_non_exhaustive()
	}
}

impl<T> Default for Slot<T> {
	fn default() -> Self {
		Self::empty()
	}
}

impl<T> Slot<T> {
	/// Creates an empty slot.
	#[must_use]
	pub const fn empty() -> Self {
		Self {
			inner: UnsafeCell::new(None),
		}
	}

	/// Creates a slot holding `value`.
	#[must_use]
	pub fn with(value: T) -> Self {
		Self {
			inner: UnsafeCell::new(Some(value)),
		}
	}

	/// Writes `value` into the slot.
	///
	/// # Safety
	///
	/// The slot must be empty, and the caller must have exclusive access.
	pub unsafe fn set(&self, value: T) {
		let inner = &mut *self.inner.get();
		debug_assert!(inner.is_none());
		*inner = Some(value);
	}

	/// Moves the contained value out, leaving the slot empty.
	///
	/// # Safety
	///
	/// The caller must have exclusive access.
	pub unsafe fn take(&self) -> Option<T> {
		(*self.inner.get()).take()
	}

	/// Borrows the contained value.
	///
	/// # Safety
	///
	/// The slot must be occupied, and no exclusive access may be concurrent.
	pub unsafe fn get(&self) -> &T {
		(*self.inner.get()).as_ref().expect("occupied")
	}

	/// Borrows the contained value mutably.
	///
	/// # Safety
	///
	/// The slot must be occupied, and the caller must have exclusive access.
	#[allow(clippy::mut_from_ref)]
	pub unsafe fn get_mut(&self) -> &mut T {
		(*self.inner.get()).as_mut().expect("occupied")
	}

	/// Drops the contained value in place, if any.
	///
	/// # Safety
	///
	/// The caller must have exclusive access.
	pub unsafe fn clear(&self) {
		*self.inner.get() = None;
	}
}

/// In-place storage for a child operation that is connected (and immediately
/// started) only once the parent is pinned.
///
/// The slot must not move once [`connect_and_start`](`OpSlot::connect_and_start`)
/// has run; in practice it is embedded in a pinned parent operation.
pub struct OpSlot<S, R>
where
	S: Sender,
	R: Receiver<Value = S::Value, Error = S::Error>,
{
	op: UnsafeCell<Option<S::Operation<R>>>,
}

impl<S, R> Debug for OpSlot<S, R>
where
	S: Sender,
	R: Receiver<Value = S::Value, Error = S::Error>,
{
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		f.debug_struct("OpSlot").finish_non_exhaustive()
	}
}

impl<S, R> Default for OpSlot<S, R>
where
	S: Sender,
	R: Receiver<Value = S::Value, Error = S::Error>,
{
	fn default() -> Self {
		Self::empty()
	}
}

impl<S, R> OpSlot<S, R>
where
	S: Sender,
	R: Receiver<Value = S::Value, Error = S::Error>,
{
	/// Creates a vacant slot.
	#[must_use]
	pub fn empty() -> Self {
		Self {
			op: UnsafeCell::new(None),
		}
	}

	/// Connects `sender` to the receiver produced by `make_receiver` and
	/// starts the operation in place.
	///
	/// `make_receiver` runs before `connect`, so it may capture the parent's
	/// (stable) address; a panicking `connect` leaves the slot vacant.
	///
	/// # Safety
	///
	/// The slot must be vacant and must not move again, and the caller must
	/// have exclusive access at the call.
	pub unsafe fn connect_and_start(&self, sender: S, make_receiver: impl FnOnce() -> R) {
		let slot = self.op.get();
		debug_assert!((*slot).is_none());
		*slot = Some(sender.connect(make_receiver()));
		let op = (*slot).as_mut().expect("occupied") as *mut S::Operation<R>;
		// The operation may complete inline and re-enter this slot through
		// `vacate`/a fresh `connect_and_start`; no borrow of the cell is held
		// across the call.
		Pin::new_unchecked(&mut *op).start();
	}

	/// Drops the contained operation in place, if any.
	///
	/// # Safety
	///
	/// The contained operation must either be unstarted or have delivered its
	/// completion signal, and the caller must have exclusive access.
	pub unsafe fn vacate(&self) {
		*self.op.get() = None;
	}
}
