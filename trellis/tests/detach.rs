use core::time::Duration;
use std::time::Instant;

use phloem::stop::StopSource;
use trellis::{detach_on_cancel, sync_wait, sync_wait_with_token, SenderExt};

mod _support;
use _support::{delay, TestError};

#[test]
fn completes_normally_without_cancellation() {
	let _ = env_logger::builder().is_test(true).try_init();
	let sender = detach_on_cancel(delay::<TestError>(Duration::from_millis(5)).then(|()| 9));
	assert_eq!(sync_wait(sender), Ok(Some(9)));
}

#[test]
fn cancellation_completes_done_without_waiting() {
	let source = StopSource::new();
	let slow = delay::<TestError>(Duration::from_millis(250)).then(|()| 1);

	let started = Instant::now();
	std::thread::scope(|scope| {
		let token = source.token();
		scope.spawn(|| {
			std::thread::sleep(Duration::from_millis(10));
			source.request_stop();
		});
		assert_eq!(sync_wait_with_token(detach_on_cancel(slow), token), Ok(None));
	});
	// Done arrived promptly; the slow sender is still running detached.
	assert!(started.elapsed() < Duration::from_millis(200));

	// Let the abandoned operation finish and free itself.
	std::thread::sleep(Duration::from_millis(300));
}

#[test]
fn already_stopped_token_completes_done_inline() {
	let source = StopSource::new();
	source.request_stop();
	let sender = detach_on_cancel(delay::<TestError>(Duration::from_millis(50)));
	assert_eq!(sync_wait_with_token(sender, source.token()), Ok(None));
	std::thread::sleep(Duration::from_millis(80));
}

#[test]
fn races_between_stop_and_completion_are_clean() {
	// Race the stop request against natural completion; every outcome must
	// be either the value or Done, with no use-after-free either way.
	for i in 0..200_u64 {
		let source = StopSource::new();
		let sender =
			detach_on_cancel(delay::<TestError>(Duration::from_micros(50)).then(|()| 1));
		let outcome = std::thread::scope(|scope| {
			let token = source.token();
			scope.spawn(|| {
				std::thread::sleep(Duration::from_micros(25 + i % 50));
				source.request_stop();
			});
			sync_wait_with_token(sender, token)
		});
		match outcome {
			Ok(Some(1) | None) => {}
			other => panic!("unexpected outcome: {other:?}"),
		}
	}
	// Drain any still-detached operations before the test ends.
	std::thread::sleep(Duration::from_millis(50));
}
