use core::{
	sync::atomic::{AtomicUsize, Ordering},
	time::Duration,
};
use std::sync::Arc;

use trellis::{just, just_from, repeat_effect_until, retry_when, sync_wait, SenderExt};

mod _support;
use _support::{delay, flaky, TestError};

#[test]
fn runs_until_the_predicate_holds() {
	let runs = Arc::new(AtomicUsize::new(0));
	let effect = just_from::<_, _, TestError>({
		let runs = Arc::clone(&runs);
		move || {
			runs.fetch_add(1, Ordering::Relaxed);
		}
	});
	let mut countdown = 5;
	let sender = repeat_effect_until(effect, move || {
		countdown -= 1;
		countdown == 0
	});
	assert_eq!(sync_wait(sender), Ok(Some(())));
	assert_eq!(runs.load(Ordering::Relaxed), 5);
}

#[test]
fn deep_inline_loops_do_not_recurse() {
	// With an always-inline effect, every iteration completes during the
	// drive loop; a recursive formulation would blow the stack here.
	let mut remaining = 200_000_u32;
	let sender = repeat_effect_until(just_from::<_, _, TestError>(|| ()), move || {
		remaining -= 1;
		remaining == 0
	});
	assert_eq!(sync_wait(sender), Ok(Some(())));
}

#[test]
fn loops_across_threads() {
	let mut remaining = 4;
	let sender = repeat_effect_until(delay::<TestError>(Duration::from_millis(5)), move || {
		remaining -= 1;
		remaining == 0
	});
	assert_eq!(sync_wait(sender), Ok(Some(())));
}

#[test]
fn source_error_ends_the_loop() {
	let sender = repeat_effect_until(
		flaky(1).then(|_| ()),
		|| unreachable!("the effect never succeeds"),
	);
	assert_eq!(sync_wait(sender), Err(TestError::Attempt(1)));
}

#[test]
fn retries_until_the_source_succeeds() {
	let triggers = Arc::new(AtomicUsize::new(0));
	let sender = retry_when(flaky(2), {
		let triggers = Arc::clone(&triggers);
		move |error| {
			assert!(matches!(error, TestError::Attempt(_)));
			triggers.fetch_add(1, Ordering::Relaxed);
			just::<_, TestError>(())
		}
	});
	assert_eq!(sync_wait(sender), Ok(Some(3)));
	assert_eq!(triggers.load(Ordering::Relaxed), 2);
}

#[test]
fn first_attempt_success_needs_no_trigger() {
	let sender = retry_when(flaky(0), |_| -> trellis::Just<(), TestError> {
		unreachable!("no error to map")
	});
	assert_eq!(sync_wait(sender), Ok(Some(1)));
}

#[test]
fn trigger_error_propagates() {
	let sender = retry_when(flaky(3), |error| match error {
		TestError::Attempt(2) => trellis::just_error::<(), _>(TestError::Boom),
		_ => trellis::just_error(error),
	});
	// The first trigger already fails, surfacing that error downstream.
	assert_eq!(sync_wait(sender), Err(TestError::Attempt(1)));
}

#[test]
fn trigger_delay_backs_off_across_threads() {
	let sender = retry_when(flaky(2), |_| delay::<TestError>(Duration::from_millis(5)));
	assert_eq!(sync_wait(sender), Ok(Some(3)));
}
