use core::time::Duration;
use std::time::Instant;

use trellis::{just, stop_when, sync_wait, sync_wait_with_token, SenderExt};
use phloem::stop::StopSource;

mod _support;
use _support::{delay, pending, TestError};

#[test]
fn trigger_cancels_a_never_completing_source() {
	let started = Instant::now();
	let sender = stop_when(
		pending::<i32, TestError>(),
		delay::<TestError>(Duration::from_millis(10)),
	);
	assert_eq!(sync_wait(sender), Ok(None));
	assert!(started.elapsed() < Duration::from_secs(5));
}

#[test]
fn source_result_wins_when_it_completes_first() {
	let sender = stop_when(just::<_, TestError>(5), pending::<(), TestError>());
	assert_eq!(sync_wait(sender), Ok(Some(5)));
}

#[test]
fn source_value_is_kept_even_when_the_trigger_races() {
	// The trigger completes first, but the source still reports its value:
	// it is not cancellation-aware, so the stop request does not affect it.
	let sender = stop_when(
		delay::<TestError>(Duration::from_millis(20)).then(|()| "slow value"),
		just::<_, TestError>(()),
	);
	assert_eq!(sync_wait(sender), Ok(Some("slow value")));
}

#[test]
fn downstream_stop_reaches_both_children() {
	let source = StopSource::new();
	let outer = stop_when(pending::<i32, TestError>(), pending::<(), TestError>());

	std::thread::scope(|scope| {
		let token = source.token();
		scope.spawn(|| {
			std::thread::sleep(Duration::from_millis(10));
			source.request_stop();
		});
		assert_eq!(sync_wait_with_token(outer, token), Ok(None));
	});
}

#[test]
fn timeout_shape_composes() {
	// The canonical timeout: a bounded wait around work that never finishes.
	let work = pending::<&'static str, TestError>();
	let sender = work.stop_when(delay::<TestError>(Duration::from_millis(15)));
	assert_eq!(sync_wait(sender), Ok(None));
}
