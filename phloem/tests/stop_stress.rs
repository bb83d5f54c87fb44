//! Interleaving stress for the stop-token substrate: across any mix of
//! `request_stop`, registration and deregistration, every callback runs zero
//! or one times and never after its destructor has returned.

use core::{
	pin::pin,
	sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};
use std::thread;

use phloem::stop::{FnStop, StopCallback, StopSource};

#[test]
fn racing_registration_with_request_stop() {
	for _ in 0..2000 {
		let source = StopSource::new();
		let ran = AtomicUsize::new(0);

		thread::scope(|threads| {
			threads.spawn(|| {
				source.request_stop();
			});
			threads.spawn(|| {
				let callback = pin!(StopCallback::new(
					source.token(),
					FnStop(|| {
						ran.fetch_add(1, Ordering::Relaxed);
					})
				));
				callback.as_ref().register();
			});
		});

		assert!(source.stop_requested());
		// Ran inline, ran during the walk, or was deregistered first; never
		// twice.
		assert!(ran.load(Ordering::Relaxed) <= 1);
	}
}

#[test]
fn deregistration_blocks_out_concurrent_execution() {
	// After `drop` of the callback returns, its closure must never run, even
	// with a `request_stop` in flight; the flag it touches goes dead right
	// after.
	for _ in 0..2000 {
		let source = StopSource::new();
		let alive = AtomicBool::new(true);

		thread::scope(|threads| {
			threads.spawn(|| {
				source.request_stop();
			});
			threads.spawn(|| {
				{
					let callback = pin!(StopCallback::new(
						source.token(),
						FnStop(|| {
							assert!(alive.load(Ordering::Relaxed));
						})
					));
					callback.as_ref().register();
				}
				// The callback is gone; anything still running finished
				// before the destructor returned.
				alive.store(false, Ordering::Relaxed);
			});
		});
	}
}

#[test]
fn many_callbacks_each_run_exactly_once() {
	for _ in 0..200 {
		let source = StopSource::new();
		let ran = AtomicUsize::new(0);

		thread::scope(|threads| {
			for _ in 0..8 {
				threads.spawn(|| {
					let callback = pin!(StopCallback::new(
						source.token(),
						FnStop(|| {
							ran.fetch_add(1, Ordering::Relaxed);
						})
					));
					callback.as_ref().register();
					// Hold the registration until the source stops, so every
					// callback is either executed or runs inline.
					while !source.stop_requested() {
						std::hint::spin_loop();
					}
					// A callback may still be mid-walk here; dropping
					// synchronises with it.
				});
			}
			threads.spawn(|| {
				source.request_stop();
			});
		});

		assert_eq!(ran.load(Ordering::Relaxed), 8);
	}
}

#[test]
fn deregistering_on_the_notifying_thread_is_a_no_op_after_execution() {
	// Deregistration on the thread that ran the walk takes the
	// executing-here path and must neither spin nor run anything again.
	let outer = StopSource::new();
	let ran = AtomicUsize::new(0);

	{
		let callback = pin!(StopCallback::new(
			outer.token(),
			FnStop(|| {
				ran.fetch_add(1, Ordering::Relaxed);
			})
		));
		callback.as_ref().register();

		let second = pin!(StopCallback::new(
			outer.token(),
			FnStop(|| {
				ran.fetch_add(10, Ordering::Relaxed);
			})
		));
		second.as_ref().register();

		outer.request_stop();
	}

	assert_eq!(ran.load(Ordering::Relaxed), 11);
}

#[test]
fn tokens_compare_by_source() {
	let a = StopSource::new();
	let b = StopSource::new();
	assert_eq!(a.token(), a.token());
	assert_ne!(a.token(), b.token());
	assert_eq!(
		phloem::stop::StopToken::never(),
		phloem::stop::StopToken::never()
	);
}
