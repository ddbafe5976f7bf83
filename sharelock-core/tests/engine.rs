use std::time::Duration;

use sharelock_core::{Engine, EngineConfig, Outcome};
use tokio_util::sync::CancellationToken;

fn test_config() -> EngineConfig {
	EngineConfig {
		submission_channel_capacity: 64,
		per_key_inbox_capacity: 64,
		holder_timeout_cap_ms: 60_000,
		idle_tick_ms: 60_000,
	}
}

#[tokio::test]
async fn acquire_then_release_round_trip() {
	agent_core::telemetry::testing::setup_test_logging();
	let handle = Engine::new(test_config()).start(CancellationToken::new());

	let outcome = handle.lock("alice".into(), "widgets".into(), None, CancellationToken::new()).await;
	assert_eq!(outcome, Outcome::Acquired);

	let outcome = handle.unlock("alice".into(), "widgets".into()).await;
	assert_eq!(outcome, Outcome::Released);
}

#[tokio::test]
async fn unlock_by_non_holder_is_unknown_lock() {
	let handle = Engine::new(test_config()).start(CancellationToken::new());

	assert_eq!(handle.lock("alice".into(), "widgets".into(), None, CancellationToken::new()).await, Outcome::Acquired);
	assert_eq!(handle.unlock("mallory".into(), "widgets".into()).await, Outcome::UnknownLock);

	// alice is still the holder; her own unlock still works.
	assert_eq!(handle.unlock("alice".into(), "widgets".into()).await, Outcome::Released);
}

#[tokio::test]
async fn unlock_with_no_holder_is_unknown_lock() {
	let handle = Engine::new(test_config()).start(CancellationToken::new());
	assert_eq!(handle.unlock("alice".into(), "never-locked".into()).await, Outcome::UnknownLock);
}

#[tokio::test]
async fn empty_client_id_or_key_is_invalid_request() {
	let handle = Engine::new(test_config()).start(CancellationToken::new());
	assert_eq!(handle.lock("".into(), "widgets".into(), None, CancellationToken::new()).await, Outcome::InvalidRequest);
	assert_eq!(handle.lock("alice".into(), "".into(), None, CancellationToken::new()).await, Outcome::InvalidRequest);
	assert_eq!(handle.unlock("".into(), "widgets".into()).await, Outcome::InvalidRequest);
}

#[tokio::test]
async fn waiters_are_granted_in_fifo_order() {
	let handle = Engine::new(test_config()).start(CancellationToken::new());

	assert_eq!(handle.lock("alice".into(), "widgets".into(), None, CancellationToken::new()).await, Outcome::Acquired);

	let h1 = handle.clone();
	let bob = tokio::spawn(async move { h1.lock("bob".into(), "widgets".into(), None, CancellationToken::new()).await });
	// Give bob's submission a chance to actually land in the queue before carol's.
	tokio::task::yield_now().await;
	let h2 = handle.clone();
	let carol = tokio::spawn(async move { h2.lock("carol".into(), "widgets".into(), None, CancellationToken::new()).await });
	tokio::task::yield_now().await;

	assert_eq!(handle.unlock("alice".into(), "widgets".into()).await, Outcome::Released);
	assert_eq!(bob.await.unwrap(), Outcome::Acquired);

	assert_eq!(handle.unlock("bob".into(), "widgets".into()).await, Outcome::Released);
	assert_eq!(carol.await.unwrap(), Outcome::Acquired);
}

#[tokio::test]
async fn a_cancelled_waiter_is_skipped_without_blocking_the_next_one() {
	let handle = Engine::new(test_config()).start(CancellationToken::new());
	assert_eq!(handle.lock("alice".into(), "widgets".into(), None, CancellationToken::new()).await, Outcome::Acquired);

	let bob_cancel = CancellationToken::new();
	let h1 = handle.clone();
	let bob_cancel2 = bob_cancel.clone();
	let bob = tokio::spawn(async move { h1.lock("bob".into(), "widgets".into(), None, bob_cancel2).await });
	tokio::task::yield_now().await;

	let h2 = handle.clone();
	let carol = tokio::spawn(async move { h2.lock("carol".into(), "widgets".into(), None, CancellationToken::new()).await });
	tokio::task::yield_now().await;

	// Bob gives up before his turn arrives.
	bob_cancel.cancel();
	assert_eq!(bob.await.unwrap(), Outcome::Timeout);

	assert_eq!(handle.unlock("alice".into(), "widgets".into()).await, Outcome::Released);
	assert_eq!(carol.await.unwrap(), Outcome::Acquired);
}

#[tokio::test(start_paused = true)]
async fn holder_timeout_reclaims_the_key_for_the_next_waiter() {
	let mut config = test_config();
	config.holder_timeout_cap_ms = 50;
	let handle = Engine::new(config).start(CancellationToken::new());

	assert_eq!(handle.lock("alice".into(), "widgets".into(), None, CancellationToken::new()).await, Outcome::Acquired);

	let h1 = handle.clone();
	let bob = tokio::spawn(async move { h1.lock("bob".into(), "widgets".into(), None, CancellationToken::new()).await });
	tokio::task::yield_now().await;

	tokio::time::advance(Duration::from_millis(200)).await;
	assert_eq!(bob.await.unwrap(), Outcome::Acquired);

	// Alice's late unlock no longer matches; bob is the holder now.
	assert_eq!(handle.unlock("alice".into(), "widgets".into()).await, Outcome::UnknownLock);
	assert_eq!(handle.unlock("bob".into(), "widgets".into()).await, Outcome::Released);
}

#[tokio::test(start_paused = true)]
async fn a_holders_own_requested_timeout_bounds_the_grant_even_under_a_looser_cap() {
	// The service-wide cap is generous, but alice only asked for a 50ms hold; the
	// key-state should reclaim on her request's own timeout, not wait for the cap.
	let mut config = test_config();
	config.holder_timeout_cap_ms = 60_000;
	let handle = Engine::new(config).start(CancellationToken::new());

	assert_eq!(
		handle.lock("alice".into(), "widgets".into(), Some(Duration::from_millis(50)), CancellationToken::new()).await,
		Outcome::Acquired
	);

	let h1 = handle.clone();
	let bob = tokio::spawn(async move { h1.lock("bob".into(), "widgets".into(), None, CancellationToken::new()).await });
	tokio::task::yield_now().await;

	tokio::time::advance(Duration::from_millis(200)).await;
	assert_eq!(bob.await.unwrap(), Outcome::Acquired);
	assert_eq!(handle.unlock("alice".into(), "widgets".into()).await, Outcome::UnknownLock);
}

#[tokio::test]
async fn lock_honours_a_caller_supplied_timeout_when_the_key_stays_held() {
	let handle = Engine::new(test_config()).start(CancellationToken::new());
	assert_eq!(handle.lock("alice".into(), "widgets".into(), None, CancellationToken::new()).await, Outcome::Acquired);

	let outcome = handle.lock("bob".into(), "widgets".into(), Some(Duration::from_millis(20)), CancellationToken::new()).await;
	assert_eq!(outcome, Outcome::Timeout);

	// alice is unaffected and can still release normally.
	assert_eq!(handle.unlock("alice".into(), "widgets".into()).await, Outcome::Released);
}

#[tokio::test]
async fn independent_keys_do_not_contend_with_each_other() {
	let handle = Engine::new(test_config()).start(CancellationToken::new());
	assert_eq!(handle.lock("alice".into(), "a".into(), None, CancellationToken::new()).await, Outcome::Acquired);
	assert_eq!(handle.lock("bob".into(), "b".into(), None, CancellationToken::new()).await, Outcome::Acquired);
	assert_eq!(handle.unlock("alice".into(), "a".into()).await, Outcome::Released);
	assert_eq!(handle.unlock("bob".into(), "b".into()).await, Outcome::Released);
}
