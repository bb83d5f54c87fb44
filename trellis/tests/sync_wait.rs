use core::time::Duration;

use trellis::{just, just_done, just_error, just_from, sync_wait, SenderExt};

mod _support;
use _support::{delay, TestError};

#[test]
fn just_value_round_trips() {
	assert_eq!(sync_wait(just::<_, TestError>(17)), Ok(Some(17)));
}

#[test]
fn just_error_propagates() {
	assert_eq!(
		sync_wait(just_error::<i32, _>(TestError::Boom)),
		Err(TestError::Boom)
	);
}

#[test]
fn just_done_is_none() {
	assert_eq!(sync_wait(just_done::<i32, TestError>()), Ok(None));
}

#[test]
fn just_from_runs_on_start() {
	let sender = just_from::<_, _, TestError>(|| 5 + 5);
	assert_eq!(sync_wait(sender), Ok(Some(10)));
}

#[test]
fn then_maps_the_value() {
	assert_eq!(
		sync_wait(just::<_, TestError>(21).then(|n| n * 2)),
		Ok(Some(42))
	);
}

#[test]
fn then_passes_errors_through() {
	let sender = just_error::<i32, _>(TestError::Boom).then(|_| -> i32 { unreachable!() });
	assert_eq!(sync_wait(sender), Err(TestError::Boom));
}

#[test]
fn then_chains() {
	let sender = just::<_, TestError>(1)
		.then(|n| n + 1)
		.then(|n| n * 10)
		.then(|n| format!("{n}"));
	assert_eq!(sync_wait(sender), Ok(Some("20".to_owned())));
}

#[test]
fn blocking_path_waits_for_off_thread_completion() {
	let sender = delay::<TestError>(Duration::from_millis(20)).then(|()| "done");
	assert_eq!(sync_wait(sender), Ok(Some("done")));
}

#[test]
fn method_syntax_matches_free_function() {
	assert_eq!(
		just::<_, TestError>(3).then(|n| n + 1).sync_wait(),
		Ok(Some(4))
	);
}

#[test]
fn a_caller_token_cancels_the_wait() {
	let source = phloem::stop::StopSource::new();
	std::thread::scope(|threads| {
		let token = source.token();
		threads.spawn(|| {
			std::thread::sleep(Duration::from_millis(10));
			source.request_stop();
		});
		let waited = trellis::sync_wait_with_token(_support::pending::<i32, TestError>(), token);
		assert_eq!(waited, Ok(None));
	});
}
