use trellis::{sync_wait, AsyncMutex, AsyncRwLock};

mod _support;
use _support::TestError;

#[test]
fn uncontended_lock_completes_inline() {
	let mutex = AsyncMutex::new(1);
	let guard = sync_wait(mutex.lock::<TestError>())
		.expect("no error")
		.expect("no cancellation");
	assert_eq!(*guard, 1);
	drop(guard);
	assert_eq!(mutex.into_inner(), 1);
}

#[test]
fn try_lock_respects_the_holder() {
	let mutex = AsyncMutex::new(());
	let held = mutex.try_lock().expect("uncontended");
	assert!(mutex.try_lock().is_none());
	drop(held);
	assert!(mutex.try_lock().is_some());
}

#[test]
fn contended_increments_serialise() {
	let mutex = AsyncMutex::new(0_u64);

	std::thread::scope(|threads| {
		for _ in 0..8 {
			threads.spawn(|| {
				for _ in 0..1000 {
					let mut guard = sync_wait(mutex.lock::<TestError>())
						.expect("no error")
						.expect("no cancellation");
					*guard += 1;
				}
			});
		}
	});
	assert_eq!(mutex.into_inner(), 8 * 1000);
}

#[test]
fn rw_lock_shares_readers() {
	let lock = AsyncRwLock::new(5);
	let a = sync_wait(lock.lock_shared::<TestError>())
		.expect("no error")
		.expect("no cancellation");
	let b = sync_wait(lock.lock_shared::<TestError>())
		.expect("no error")
		.expect("no cancellation");
	assert_eq!(*a + *b, 10);
}

#[test]
fn rw_lock_writer_is_exclusive() {
	let lock = AsyncRwLock::new(0_u64);

	std::thread::scope(|threads| {
		for _ in 0..4 {
			threads.spawn(|| {
				for _ in 0..500 {
					let mut guard = sync_wait(lock.lock_exclusive::<TestError>())
						.expect("no error")
						.expect("no cancellation");
					*guard += 1;
				}
			});
		}
		for _ in 0..4 {
			threads.spawn(|| {
				for _ in 0..500 {
					let guard = sync_wait(lock.lock_shared::<TestError>())
						.expect("no error")
						.expect("no cancellation");
					assert!(*guard <= 2000);
				}
			});
		}
	});
	assert_eq!(lock.into_inner(), 2000);
}
