use core::time::Duration;

use trellis::{sync_wait, ManualResetEvent};

mod _support;
use _support::TestError;

#[test]
fn wait_after_set_completes_inline() {
	let event = ManualResetEvent::new_set();
	assert!(event.ready());
	let waited: Result<Option<()>, TestError> = sync_wait(event.wait());
	assert_eq!(waited, Ok(Some(())));
}

#[test]
fn set_releases_a_parked_waiter() {
	let event = ManualResetEvent::new();
	assert!(!event.ready());

	std::thread::scope(|threads| {
		threads.spawn(|| {
			std::thread::sleep(Duration::from_millis(10));
			event.set();
		});
		let waited: Result<Option<()>, TestError> = sync_wait(event.wait());
		assert_eq!(waited, Ok(Some(())));
	});
	assert!(event.ready());
}

#[test]
fn set_releases_every_parked_waiter() {
	let event = ManualResetEvent::new();

	std::thread::scope(|threads| {
		for _ in 0..8 {
			threads.spawn(|| {
				let waited: Result<Option<()>, TestError> = sync_wait(event.wait());
				assert_eq!(waited, Ok(Some(())));
			});
		}
		std::thread::sleep(Duration::from_millis(20));
		event.set();
	});
}

#[test]
fn reset_returns_to_unset() {
	let event = ManualResetEvent::new_set();
	event.reset();
	assert!(!event.ready());

	// A reset with pending waiters is a no-op.
	let unset = ManualResetEvent::new();
	unset.reset();
	assert!(!unset.ready());
}
