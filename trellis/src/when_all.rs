//! Fan-in over a fixed tuple of senders. See [`when_all`].

use core::{
	marker::PhantomPinned,
	pin::Pin,
	ptr::NonNull,
	sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};

use phloem::{
	operation::OperationState,
	receiver::Receiver,
	sender::{Blocking, Sender},
	slot::{OpSlot, Slot},
	stop::{ForwardStopRequest, StopCallback, StopSource, StopToken},
};

/// Starts every sender in `list` concurrently and completes with the tuple of
/// their values once all of them have completed with one.
///
/// The first terminal `Error` or `Done` wins instead: it is recorded, every
/// other child is asked to stop through the adapter's embedded stop source,
/// and the remaining completions (including their values) are discarded. A
/// stop request arriving from downstream is forwarded into the same embedded
/// source and surfaces as `Done`.
///
/// All senders in the tuple must agree on one error type. Arities 2 to 4 are
/// provided.
pub fn when_all<L: WhenAllList>(list: L) -> L::WhenAll {
	list.into_when_all()
}

/// Tuples of senders accepted by [`when_all`].
pub trait WhenAllList {
	/// The fan-in sender for this tuple.
	type WhenAll: Sender;
	/// Wraps the tuple.
	fn into_when_all(self) -> Self::WhenAll;
}

macro_rules! when_all_arity {
	(
		$sender_name:ident, $op_name:ident,
		all($($SAll:ident),+),
		$(child($S:ident, $rcv:ident, $sender_field:ident, $value_field:ident, $child_field:ident, all($($SAll2:ident),+))),+
	) => {
		/// Fan-in sender over one tuple arity. See [`when_all`].
		#[derive(Debug, Clone)]
		#[must_use = "senders do nothing unless connected and started"]
		pub struct $sender_name<$($SAll),+> {
			senders: ($($SAll,)+),
		}

		impl<E, $($SAll),+> WhenAllList for ($($SAll,)+)
		where
			$($SAll: Sender<Error = E>,)+
		{
			type WhenAll = $sender_name<$($SAll),+>;

			fn into_when_all(self) -> Self::WhenAll {
				$sender_name { senders: self }
			}
		}

		impl<E, $($SAll),+> Sender for $sender_name<$($SAll),+>
		where
			$($SAll: Sender<Error = E>,)+
		{
			type Value = ($(<$SAll as Sender>::Value,)+);
			type Error = E;
			type Operation<R>
				= $op_name<E, $($SAll,)+ R>
			where
				R: Receiver<Value = ($(<$SAll as Sender>::Value,)+), Error = E>;

			const SENDS_DONE: bool = true;
			const BLOCKING: Blocking =
				Blocking::combine_all(&[$(<$SAll as Sender>::BLOCKING),+]);
			const SCHEDULER_AFFINE: bool = false;

			fn connect<R>(self, receiver: R) -> Self::Operation<R>
			where
				R: Receiver<Value = ($(<$SAll as Sender>::Value,)+), Error = E>,
			{
				let ($($sender_field,)+) = self.senders;
				$op_name {
					remaining: AtomicUsize::new([$(stringify!($SAll)),+].len()),
					done_or_error: AtomicBool::new(false),
					error: Slot::empty(),
					stop_source: StopSource::new(),
					stop_callback: Slot::empty(),
					receiver: Slot::with(receiver),
					$($sender_field: Slot::with($sender_field),)+
					$($value_field: Slot::empty(),)+
					$($child_field: OpSlot::empty(),)+
					_pinned: PhantomPinned,
				}
			}
		}

		pub struct $op_name<E, $($SAll,)+ R>
		where
			$($SAll: Sender<Error = E>,)+
			R: Receiver<Value = ($(<$SAll as Sender>::Value,)+), Error = E>,
		{
			remaining: AtomicUsize,
			done_or_error: AtomicBool,
			error: Slot<E>,
			stop_source: StopSource,
			stop_callback: Slot<StopCallback<'static, ForwardStopRequest>>,
			receiver: Slot<R>,
			$($sender_field: Slot<$S>,)+
			$($value_field: Slot<<$S as Sender>::Value>,)+
			$($child_field: OpSlot<$S, $rcv<E, $($SAll2,)+ R>>,)+
			_pinned: PhantomPinned,
		}

		impl<E, $($SAll,)+ R> $op_name<E, $($SAll,)+ R>
		where
			$($SAll: Sender<Error = E>,)+
			R: Receiver<Value = ($(<$SAll as Sender>::Value,)+), Error = E>,
		{
			fn element_complete(&self) {
				if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
					self.deliver();
				}
			}

			/// Runs on whichever thread completed the last child.
			fn deliver(&self) {
				// Synchronises with (or absorbs, when re-entered from) a
				// concurrently executing downstream stop callback.
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
					receiver.set_value(($(
						unsafe { self.$value_field.take() }
							.expect("every child delivered a value"),
					)+));
				}
			}
		}

		impl<E, $($SAll,)+ R> OperationState for $op_name<E, $($SAll,)+ R>
		where
			$($SAll: Sender<Error = E>,)+
			R: Receiver<Value = ($(<$SAll as Sender>::Value,)+), Error = E>,
		{
			fn start(self: Pin<&mut Self>) {
				let this = self.into_ref().get_ref();
				let op = NonNull::from(this);
				unsafe {
					// Safety: the source and the callback live in this
					// operation, and the callback is deregistered in
					// `deliver` before the receiver is consumed.
					let token = this.receiver.get().stop_token().detached();
					this.stop_callback.set(StopCallback::new(
						token,
						ForwardStopRequest::new(&this.stop_source),
					));
					Pin::new_unchecked(this.stop_callback.get()).register();
					$(
						let $sender_field =
							this.$sender_field.take().expect("started at most once");
						this.$child_field
							.connect_and_start($sender_field, || $rcv { op });
					)+
				}
			}
		}

		$(
			pub struct $rcv<E, $($SAll2,)+ R>
			where
				$($SAll2: Sender<Error = E>,)+
				R: Receiver<Value = ($(<$SAll2 as Sender>::Value,)+), Error = E>,
			{
				op: NonNull<$op_name<E, $($SAll2,)+ R>>,
			}

			/// # Safety
			///
			/// A completing child may hand the aggregation (and, when it is
			/// the last one, delivery) to its thread; the payloads that cross
			/// with it are required to be [`Send`].
			unsafe impl<E, $($SAll2,)+ R> Send for $rcv<E, $($SAll2,)+ R>
			where
				E: Send,
				$($SAll2: Sender<Error = E>, <$SAll2 as Sender>::Value: Send,)+
				R: Receiver<Value = ($(<$SAll2 as Sender>::Value,)+), Error = E> + Send,
			{
			}

			impl<E, $($SAll2,)+ R> Receiver for $rcv<E, $($SAll2,)+ R>
			where
				$($SAll2: Sender<Error = E>,)+
				R: Receiver<Value = ($(<$SAll2 as Sender>::Value,)+), Error = E>,
			{
				type Value = <$S as Sender>::Value;
				type Error = E;

				fn set_value(self, value: Self::Value) {
					let op = unsafe { self.op.as_ref() };
					unsafe { op.$value_field.set(value) };
					op.element_complete();
				}

				fn set_error(self, error: E) {
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
		)+
	};
}

when_all_arity!(
	WhenAll2, WhenAll2Operation,
	all(SA, SB),
	child(SA, WhenAll2ReceiverA, sender_a, value_a, child_a, all(SA, SB)),
	child(SB, WhenAll2ReceiverB, sender_b, value_b, child_b, all(SA, SB))
);

when_all_arity!(
	WhenAll3, WhenAll3Operation,
	all(SA, SB, SC),
	child(SA, WhenAll3ReceiverA, sender_a, value_a, child_a, all(SA, SB, SC)),
	child(SB, WhenAll3ReceiverB, sender_b, value_b, child_b, all(SA, SB, SC)),
	child(SC, WhenAll3ReceiverC, sender_c, value_c, child_c, all(SA, SB, SC))
);

when_all_arity!(
	WhenAll4, WhenAll4Operation,
	all(SA, SB, SC, SD),
	child(SA, WhenAll4ReceiverA, sender_a, value_a, child_a, all(SA, SB, SC, SD)),
	child(SB, WhenAll4ReceiverB, sender_b, value_b, child_b, all(SA, SB, SC, SD)),
	child(SC, WhenAll4ReceiverC, sender_c, value_c, child_c, all(SA, SB, SC, SD)),
	child(SD, WhenAll4ReceiverD, sender_d, value_d, child_d, all(SA, SB, SC, SD))
);
