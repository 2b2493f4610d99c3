use pgrelay::core::health::stats::HealthStats;
use std::time::Duration;

#[test]
fn test_success_updates_counters_and_durations() {
    let stats = HealthStats::new(2);
    stats.record_success(0, Duration::from_millis(30));
    stats.record_success(0, Duration::from_millis(10));

    let snapshot = stats.snapshot();
    assert_eq!(snapshot[0].total_count, 2);
    assert_eq!(snapshot[0].success_count, 2);
    assert_eq!(snapshot[0].fail_count, 0);
    assert_eq!(snapshot[0].max_duration_ms, 30);
    assert_eq!(snapshot[0].min_duration_ms, 10);
    assert_eq!(snapshot[0].average_duration_ms(), 20);
    assert!(snapshot[0].last_successful_health_check.is_some());
    assert!(snapshot[0].last_failed_health_check.is_none());

    // The other node's record is untouched.
    assert_eq!(snapshot[1].total_count, 0);
}

#[test]
fn test_failure_tracks_retries() {
    let stats = HealthStats::new(1);
    stats.record_failure(0, Duration::from_millis(50), 3);
    stats.record_failure(0, Duration::from_millis(70), 1);

    let snapshot = stats.snapshot();
    assert_eq!(snapshot[0].fail_count, 2);
    assert_eq!(snapshot[0].retry_count, 4);
    assert_eq!(snapshot[0].max_retry_count, 3);
    assert!(snapshot[0].last_failed_health_check.is_some());
}

#[test]
fn test_skip_only_touches_skip_fields() {
    let stats = HealthStats::new(1);
    stats.record_skip(0);

    let snapshot = stats.snapshot();
    assert_eq!(snapshot[0].total_count, 1);
    assert_eq!(snapshot[0].skip_count, 1);
    assert_eq!(snapshot[0].success_count, 0);
    assert_eq!(snapshot[0].fail_count, 0);
    assert!(snapshot[0].last_skipped_health_check.is_some());
    assert!(snapshot[0].last_successful_health_check.is_none());
}

#[test]
fn test_out_of_range_node_is_ignored() {
    let stats = HealthStats::new(1);
    stats.record_success(9, Duration::from_millis(5));
    assert_eq!(stats.snapshot()[0].total_count, 0);
}

#[test]
fn test_average_with_no_probes_is_zero() {
    let stats = HealthStats::new(1);
    assert_eq!(stats.snapshot()[0].average_duration_ms(), 0);
}
