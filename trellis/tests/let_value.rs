use trellis::{just, just_done, just_error, let_done, let_error, let_value, sync_wait, SenderExt};

mod _support;
use _support::{DropTag, TestError, Validator};

#[test]
fn extends_the_value_across_the_successor() {
	let sender = let_value(just::<_, TestError>(42), |n| just(*n + 1));
	assert_eq!(sync_wait(sender), Ok(Some(43)));
}

#[test]
fn stored_value_outlives_the_successor_operation() {
	let v = &Validator::new();

	let sender = let_value(
		just::<_, TestError>(DropTag {
			validator: v,
			tag: "stored",
		}),
		|_| trellis::just_from(move || v.push("successor completed")),
	);
	assert_eq!(sync_wait(sender), Ok(Some(())));
	v.expect(["successor completed", "stored"]);
}

#[test]
fn factory_sees_the_stored_value_mutably() {
	let sender = let_value(just::<_, TestError>(String::from("tick")), |s| {
		s.push_str("-tock");
		just(s.len())
	});
	assert_eq!(sync_wait(sender), Ok(Some(9)));
}

#[test]
fn predecessor_error_short_circuits() {
	let sender = let_value(
		just_error::<i32, _>(TestError::Boom),
		|_| -> trellis::Just<i32, TestError> { unreachable!("the factory must not run") },
	);
	assert_eq!(sync_wait(sender), Err(TestError::Boom));
}

#[test]
fn predecessor_done_short_circuits() {
	let sender = let_value(
		just_done::<i32, TestError>(),
		|_| -> trellis::Just<i32, TestError> { unreachable!("the factory must not run") },
	);
	assert_eq!(sync_wait(sender), Ok(None));
}

#[test]
fn successor_error_propagates() {
	let sender = let_value(just::<_, TestError>(1), |_| {
		just_error::<i32, _>(TestError::Boom)
	});
	assert_eq!(sync_wait(sender), Err(TestError::Boom));
}

#[test]
fn let_error_recovers() {
	let sender = let_error(just_error::<i32, _>(TestError::Boom), |error| {
		assert_eq!(error, TestError::Boom);
		just::<_, TestError>(7)
	});
	assert_eq!(sync_wait(sender), Ok(Some(7)));
}

#[test]
fn let_error_passes_values_through() {
	let sender = let_error(just::<_, TestError>(3), |_| just::<_, TestError>(0));
	assert_eq!(sync_wait(sender), Ok(Some(3)));
}

#[test]
fn let_done_replaces_cancellation() {
	let sender = let_done(just_done::<i32, TestError>(), || just(11));
	assert_eq!(sync_wait(sender), Ok(Some(11)));
}

#[test]
fn let_done_passes_values_through() {
	let sender = just::<_, TestError>(5).let_done(|| just(0));
	assert_eq!(sync_wait(sender), Ok(Some(5)));
}
