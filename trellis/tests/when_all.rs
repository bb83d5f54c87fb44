use core::time::Duration;

use phloem::stop::StopSource;
use trellis::{
	just, just_done, just_error, sync_wait, sync_wait_with_token, when_all, when_all_range,
	SenderExt,
};

mod _support;
use _support::{delay, pending, DropTag, TestError, Validator};

#[test]
fn aggregates_heterogeneous_values() {
	let sender = when_all((just::<_, TestError>(1), just('a'), just(3.14)));
	assert_eq!(sync_wait(sender), Ok(Some((1, 'a', 3.14))));
}

#[test]
fn first_error_wins_and_values_are_discarded() {
	let v = &Validator::new();

	let sender = when_all((
		just::<_, TestError>(DropTag {
			validator: v,
			tag: "value",
		}),
		just_error::<i32, _>(TestError::Boom),
	));
	match sync_wait(sender) {
		Err(TestError::Boom) => {}
		other => panic!("expected the error, got {other:?}"),
	}
	// The first child's value was stored, then destroyed unobserved.
	v.expect(["value"]);
}

#[test]
fn done_wins_over_values() {
	let sender = when_all((just::<_, TestError>(1), just_done::<char, _>()));
	assert_eq!(sync_wait(sender), Ok(None));
}

#[test]
fn a_failing_sibling_cancels_the_rest() {
	// The first child never completes on its own; the second child's error
	// reaches the embedded stop source and cancels it.
	let sender = when_all((
		pending::<i32, TestError>(),
		just_error::<char, _>(TestError::Boom),
	));
	assert_eq!(sync_wait(sender), Err(TestError::Boom));
}

#[test]
fn downstream_stop_cancels_every_child() {
	let source = StopSource::new();
	let sender = when_all((pending::<i32, TestError>(), pending::<char, _>()));

	std::thread::scope(|threads| {
		let token = source.token();
		threads.spawn(|| {
			std::thread::sleep(Duration::from_millis(10));
			source.request_stop();
		});
		assert_eq!(sync_wait_with_token(sender, token), Ok(None));
	});
}

#[test]
fn all_four_arities_complete() {
	assert_eq!(
		sync_wait(when_all((just::<_, TestError>(1), just(2)))),
		Ok(Some((1, 2)))
	);
	assert_eq!(
		sync_wait(when_all((just::<_, TestError>(1), just(2), just(3)))),
		Ok(Some((1, 2, 3)))
	);
	assert_eq!(
		sync_wait(when_all((
			just::<_, TestError>(1),
			just(2),
			just(3),
			just(4)
		))),
		Ok(Some((1, 2, 3, 4)))
	);
}

#[test]
fn joins_off_thread_completions() {
	let sender = when_all((
		delay::<TestError>(Duration::from_millis(10)).then(|()| 1),
		delay(Duration::from_millis(25)).then(|()| 2),
		just(3),
	));
	assert_eq!(sync_wait(sender), Ok(Some((1, 2, 3))));
}

#[test]
fn range_collects_in_input_order() {
	let senders = (0..10).map(|n| just::<_, TestError>(n * n)).collect();
	assert_eq!(
		sync_wait(when_all_range(senders)),
		Ok(Some((0..10).map(|n| n * n).collect()))
	);
}

#[test]
fn empty_range_completes_inline() {
	assert_eq!(
		sync_wait(when_all_range(Vec::<trellis::Just<i32, TestError>>::new())),
		Ok(Some(Vec::new()))
	);
}

#[test]
fn range_propagates_an_error() {
	let senders = vec![
		_support::flaky(0),
		_support::flaky(1),
	];
	match sync_wait(when_all_range(senders)) {
		Err(TestError::Attempt(1)) => {}
		other => panic!("expected the error, got {other:?}"),
	}
}

#[test]
fn range_with_off_thread_children() {
	let senders = (1..=4)
		.map(|n| delay::<TestError>(Duration::from_millis(5 * n)))
		.collect();
	assert_eq!(sync_wait(when_all_range(senders)), Ok(Some(vec![(); 4])));
}
