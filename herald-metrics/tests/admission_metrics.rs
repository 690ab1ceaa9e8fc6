//! Verifies that the local counters mirror the recorded events.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use herald_metrics::{AdmissionMetrics, LockOutcome, MetricsConfig};

#[test]
fn test_suppression_counters() {
    let metrics = AdmissionMetrics::new(10);

    for suppressed in [true, false, false, true, true] {
        metrics.record_suppression_check(suppressed);
    }

    assert_eq!(metrics.suppression_checks(), 5);
    assert_eq!(metrics.suppressed(), 3);
}

#[test]
fn test_throttle_denials_exclude_allowed() {
    let metrics = AdmissionMetrics::new(10);

    metrics.record_throttle_decision("allowed");
    metrics.record_throttle_decision("hourly_limit");
    metrics.record_throttle_decision("backoff");
    metrics.record_backoff("microsoft");

    assert_eq!(metrics.throttle_denials(), 2);
    assert_eq!(metrics.backoffs(), 1);
}

#[test]
fn test_selection_and_failover_counters() {
    let metrics = AdmissionMetrics::new(1);

    metrics.record_selection("sendgrid", false);
    metrics.record_selection("ses", true);
    metrics.record_selection("mailgun", true);

    assert_eq!(metrics.selections(), 3);
    assert_eq!(metrics.failovers(), 2);
}

#[test]
fn test_lock_counters() {
    let metrics = AdmissionMetrics::new(10);

    metrics.record_lock(LockOutcome::Acquired);
    metrics.record_lock(LockOutcome::Contended);
    metrics.record_lock(LockOutcome::Failed);
    metrics.record_lock(LockOutcome::Acquired);

    assert_eq!(metrics.locks_acquired(), 2);
}

#[test]
fn test_disabled_metrics_are_a_no_op() {
    let config = MetricsConfig::default();
    herald_metrics::init_metrics(&config).expect("disabled init never fails");

    assert!(!herald_metrics::is_enabled());
    assert!(herald_metrics::try_metrics().is_none());
}

#[test]
fn test_endpoint_must_be_http() {
    let config = MetricsConfig {
        enabled: true,
        endpoint: "localhost:4318".to_string(),
        max_label_cardinality: 10,
    };

    let err = herald_metrics::init_metrics(&config).unwrap_err();
    assert!(matches!(err, herald_metrics::MetricsError::InvalidEndpoint(_)));
    assert!(!herald_metrics::is_enabled());
}
