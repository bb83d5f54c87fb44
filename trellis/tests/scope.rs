use core::{
	sync::atomic::{AtomicBool, Ordering},
	time::Duration,
};

use trellis::{just_from, sync_wait, AsyncScope, SenderExt};

mod _support;
use _support::{delay, pending, TestError};

#[test]
fn spawned_work_runs_before_join_completes() {
	let _ = env_logger::builder().is_test(true).try_init();
	let scope = AsyncScope::new();
	let flag = AtomicBool::new(false);

	scope.spawn_detached(just_from::<_, _, TestError>(|| {
		flag.store(true, Ordering::Relaxed);
	}));

	let joined: Result<Option<()>, TestError> = sync_wait(scope.join());
	assert_eq!(joined, Ok(Some(())));
	assert!(flag.load(Ordering::Relaxed));
}

#[test]
fn spawn_after_join_is_a_no_op() {
	let scope = AsyncScope::new();
	let joined: Result<Option<()>, TestError> = sync_wait(scope.join());
	assert_eq!(joined, Ok(Some(())));

	let flag = AtomicBool::new(false);
	scope.spawn_detached(just_from::<_, _, TestError>(|| {
		flag.store(true, Ordering::Relaxed);
	}));
	assert!(!flag.load(Ordering::Relaxed));
	assert_eq!(scope.use_count(), 0);
}

#[test]
fn nest_behaves_like_the_inner_sender_while_open() {
	let scope = AsyncScope::new();
	let nested = scope.nest(just_from::<_, _, TestError>(|| 27));
	assert_eq!(sync_wait(nested), Ok(Some(27)));

	let joined: Result<Option<()>, TestError> = sync_wait(scope.join());
	assert_eq!(joined, Ok(Some(())));
}

#[test]
fn nest_on_an_ended_scope_is_done() {
	let scope = AsyncScope::new();
	let joined: Result<Option<()>, TestError> = sync_wait(scope.join());
	assert_eq!(joined, Ok(Some(())));

	let nested = scope.nest(just_from::<_, _, TestError>(|| -> i32 {
		unreachable!("must not run in an ended scope")
	}));
	assert_eq!(sync_wait(nested), Ok(None));
}

#[test]
fn join_waits_for_in_flight_work() {
	let scope = AsyncScope::new();
	let done = AtomicBool::new(false);

	std::thread::scope(|threads| {
		scope.spawn_detached(
			delay::<TestError>(Duration::from_millis(30)).then(|()| {
				done.store(true, Ordering::Relaxed);
			}),
		);
		assert_eq!(scope.use_count(), 1);

		threads.spawn(|| {
			let joined: Result<Option<()>, TestError> = sync_wait(scope.join());
			assert_eq!(joined, Ok(Some(())));
			assert!(done.load(Ordering::Relaxed));
		});
	});
	assert!(scope.joined());
}

#[test]
fn use_count_tracks_references() {
	let scope = AsyncScope::new();
	assert_eq!(scope.use_count(), 0);
	let nested = scope.nest(just_from::<_, _, TestError>(|| ()));
	assert_eq!(scope.use_count(), 1);
	assert_eq!(sync_wait(nested), Ok(Some(())));
	assert_eq!(scope.use_count(), 0);

	let joined: Result<Option<()>, TestError> = sync_wait(scope.join());
	assert_eq!(joined, Ok(Some(())));
	assert!(scope.join_started());
	assert!(scope.joined());
}

#[test]
fn dropping_an_unconnected_nest_releases_its_reference() {
	let scope = AsyncScope::new();
	{
		let _nested = scope.nest(pending::<(), TestError>());
		assert_eq!(scope.use_count(), 1);
	}
	assert_eq!(scope.use_count(), 0);

	let joined: Result<Option<()>, TestError> = sync_wait(scope.join());
	assert_eq!(joined, Ok(Some(())));
}

#[test]
fn nest_forwards_the_downstream_stop_token() {
	let scope = AsyncScope::new();
	let source = phloem::stop::StopSource::new();

	std::thread::scope(|threads| {
		let token = source.token();
		threads.spawn(|| {
			std::thread::sleep(core::time::Duration::from_millis(10));
			source.request_stop();
		});
		let nested = scope.nest(pending::<i32, TestError>());
		assert_eq!(trellis::sync_wait_with_token(nested, token), Ok(None));
	});

	let joined: Result<Option<()>, TestError> = sync_wait(scope.join());
	assert_eq!(joined, Ok(Some(())));
}

#[test]
fn detached_errors_are_swallowed() {
	let scope = AsyncScope::new();
	scope.spawn_detached(trellis::just_error::<(), _>(TestError::Boom));
	let joined: Result<Option<()>, TestError> = sync_wait(scope.join());
	assert_eq!(joined, Ok(Some(())));
}
