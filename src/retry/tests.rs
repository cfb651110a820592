use super::*;
use std::sync::Arc;

#[test]
fn test_default_policy() {
    let policy = RetryPolicy::default();
    assert_eq!(policy.max_attempts, 3);
    assert_eq!(policy.max_poison_retries, 3);
    assert_eq!(policy.backoff_unit, Duration::from_secs(1));
}

#[test]
fn test_poison_delays_are_2_4_8_seconds() {
    let policy = RetryPolicy::default();
    assert_eq!(policy.poison_delay(1), Duration::from_secs(2));
    assert_eq!(policy.poison_delay(2), Duration::from_secs(4));
    assert_eq!(policy.poison_delay(3), Duration::from_secs(8));
}

#[test]
fn test_poison_delay_scales_with_unit() {
    let policy = RetryPolicy {
        backoff_unit: Duration::from_millis(10),
        ..Default::default()
    };
    assert_eq!(policy.poison_delay(3), Duration::from_millis(80));
}

#[test]
fn test_allows_poison_retry_below_budget() {
    let policy = RetryPolicy::default();
    assert!(policy.allows_poison_retry(0));
    assert!(policy.allows_poison_retry(2));
    assert!(!policy.allows_poison_retry(3));
    assert!(!policy.allows_poison_retry(7));
}

#[test]
fn test_tracker_escalates_on_third_failure() {
    let tracker = RetryTracker::new(3);
    assert_eq!(tracker.record_failure("m"), RetryDecision::Retry { attempt: 1 });
    assert_eq!(tracker.record_failure("m"), RetryDecision::Retry { attempt: 2 });
    assert_eq!(
        tracker.record_failure("m"),
        RetryDecision::Escalate { attempts: 3 }
    );
    // Kept until the caller confirms the hand-off
    assert_eq!(tracker.attempts("m"), 3);

    tracker.clear("m");
    assert_eq!(tracker.attempts("m"), 0);
    assert!(tracker.is_empty());
}

#[test]
fn test_tracker_keys_are_independent() {
    let tracker = RetryTracker::new(3);
    tracker.record_failure("a");
    tracker.record_failure("a");
    tracker.record_failure("b");

    assert_eq!(tracker.attempts("a"), 2);
    assert_eq!(tracker.attempts("b"), 1);
    assert_eq!(tracker.len(), 2);

    tracker.clear("a");
    assert_eq!(tracker.attempts("b"), 1);
}

#[test]
fn test_tracker_from_policy() {
    let policy = RetryPolicy {
        max_attempts: 1,
        ..Default::default()
    };
    let tracker = RetryTracker::from_policy(&policy);
    assert_eq!(
        tracker.record_failure("m"),
        RetryDecision::Escalate { attempts: 1 }
    );
}

#[tokio::test]
async fn test_tracker_concurrent_failures_are_all_counted() {
    let tracker = Arc::new(RetryTracker::new(1000));
    let mut handles = Vec::new();
    for _ in 0..8 {
        let tracker = Arc::clone(&tracker);
        handles.push(tokio::spawn(async move {
            for _ in 0..50 {
                tracker.record_failure("shared");
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }
    assert_eq!(tracker.attempts("shared"), 400);
}
