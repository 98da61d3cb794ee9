//! Backoff retrier timing and call counts.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use aegis::retry::{retry, RetryOutcome, RetryPolicy};

fn policy(attempts: u32) -> RetryPolicy {
    RetryPolicy {
        attempts,
        base_delay_ms: 100,
        max_delay_ms: 400,
        jitter: 0.3,
    }
}

#[tokio::test(start_paused = true)]
async fn always_failing_op_is_called_exactly_attempts_times() {
    let calls = AtomicU32::new(0);
    let policy = policy(4);
    let started = tokio::time::Instant::now();

    let outcome: RetryOutcome<()> = retry(&policy, |_| {
        calls.fetch_add(1, Ordering::SeqCst);
        async { Err("backend down".to_owned()) }
    })
    .await;

    assert_eq!(calls.load(Ordering::SeqCst), 4);
    assert!(!outcome.is_ok());
    assert_eq!(outcome.attempts(), 4);
    assert_eq!(
        outcome.exhausted_reason().as_deref(),
        Some("retry_exhausted: backend down")
    );

    // Three waits, none longer than the largest single delay (plus timer
    // granularity).
    let bound = policy
        .max_single_delay()
        .saturating_mul(3)
        .saturating_add(Duration::from_millis(3));
    assert!(started.elapsed() <= bound, "waited {:?}", started.elapsed());
    assert!(started.elapsed() > Duration::ZERO);
}

#[tokio::test(start_paused = true)]
async fn success_stops_further_calls() {
    let calls = AtomicU32::new(0);

    let outcome = retry(&policy(5), |attempt| {
        calls.fetch_add(1, Ordering::SeqCst);
        async move {
            if attempt < 3 {
                Err(format!("attempt {attempt} failed"))
            } else {
                Ok(attempt)
            }
        }
    })
    .await;

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(
        outcome,
        RetryOutcome::Succeeded {
            value: 3,
            attempts: 3
        }
    );
    assert_eq!(outcome.exhausted_reason(), None);
}

#[tokio::test(start_paused = true)]
async fn single_attempt_never_sleeps() {
    let started = tokio::time::Instant::now();
    let outcome: RetryOutcome<()> = retry(&policy(1), |_| async { Err("nope".to_owned()) }).await;
    assert_eq!(outcome.attempts(), 1);
    assert_eq!(started.elapsed(), Duration::ZERO);
}

#[tokio::test(start_paused = true)]
async fn waits_follow_the_backoff_curve_without_jitter() {
    let policy = RetryPolicy {
        jitter: 0.0,
        ..policy(4)
    };
    let started = tokio::time::Instant::now();
    let _: RetryOutcome<()> = retry(&policy, |_| async { Err("down".to_owned()) }).await;

    // 100 + 150 + 225 ms, give or take timer granularity.
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(475), "waited {elapsed:?}");
    assert!(elapsed < Duration::from_millis(480), "waited {elapsed:?}");
}

#[tokio::test(start_paused = true)]
async fn sleeping_request_does_not_block_others() {
    let slow_calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&slow_calls);
    let slow = tokio::spawn(async move {
        let policy = RetryPolicy {
            jitter: 0.0,
            ..policy(3)
        };
        let _: RetryOutcome<()> = retry(&policy, |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err("down".to_owned()) }
        })
        .await;
    });
    while slow_calls.load(Ordering::SeqCst) == 0 {
        tokio::task::yield_now().await;
    }
    let started = tokio::time::Instant::now();

    let fast = retry(&policy(3), |_| async { Ok::<_, String>("done") }).await;

    assert!(fast.is_ok());
    assert_eq!(started.elapsed(), Duration::ZERO);
    // The slow request is parked in its first 100 ms backoff.
    assert!(!slow.is_finished());
    assert_eq!(slow_calls.load(Ordering::SeqCst), 1);

    slow.await.expect("slow task");
    assert_eq!(slow_calls.load(Ordering::SeqCst), 3);
    assert!(started.elapsed() >= Duration::from_millis(250));
}

#[test]
fn retry_policy_deserializes_with_defaults() {
    let policy: RetryPolicy = toml::from_str("attempts = 2").expect("parse");
    assert_eq!(policy.attempts, 2);
    assert_eq!(policy.base_delay_ms, RetryPolicy::default().base_delay_ms);
}
