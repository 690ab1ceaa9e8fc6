//! Admission metrics
//!
//! Tracks every decision the admission engine hands out:
//! - Suppression checks by verdict
//! - Throttle decisions by outcome, and backoffs triggered
//! - ESP selections by profile, and failovers
//! - Lock acquisitions by outcome
//!
//! Each counter is mirrored in a local atomic so totals can be read back
//! without an exporter.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashSet;
use opentelemetry::{
    KeyValue,
    metrics::{Counter, Meter},
};

/// Label used once the cardinality budget is spent
const OVERFLOW_LABEL: &str = "other";

/// Caps the number of distinct values a label may take.
#[derive(Debug)]
struct LabelBudget {
    max: usize,
    seen: DashSet<String>,
}

impl LabelBudget {
    fn new(max: usize) -> Self {
        Self {
            max,
            seen: DashSet::new(),
        }
    }

    fn label(&self, value: &str) -> String {
        if self.seen.contains(value) {
            return value.to_string();
        }
        if self.seen.len() < self.max {
            self.seen.insert(value.to_string());
            return value.to_string();
        }
        OVERFLOW_LABEL.to_string()
    }
}

/// Outcome of a lock acquisition attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    Acquired,
    Contended,
    Failed,
}

impl LockOutcome {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Acquired => "acquired",
            Self::Contended => "contended",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug)]
pub struct AdmissionMetrics {
    suppression_checks: Counter<u64>,
    throttle_decisions: Counter<u64>,
    backoffs_triggered: Counter<u64>,
    esp_selections: Counter<u64>,
    failovers: Counter<u64>,
    lock_acquisitions: Counter<u64>,

    profile_labels: LabelBudget,
    unit_labels: LabelBudget,

    suppressed_count: AtomicU64,
    checked_count: AtomicU64,
    throttle_denied_count: AtomicU64,
    backoff_count: AtomicU64,
    selection_count: AtomicU64,
    failover_count: AtomicU64,
    lock_acquired_count: AtomicU64,
}

impl AdmissionMetrics {
    /// Create a new admission metrics collector. Profile and unit labels each
    /// get their own budget of `max_label_cardinality` values.
    #[must_use]
    pub fn new(max_label_cardinality: usize) -> Self {
        let meter = meter();

        let suppression_checks = meter
            .u64_counter("herald.suppression.checks.total")
            .with_description("Suppression checks by verdict")
            .build();

        let throttle_decisions = meter
            .u64_counter("herald.throttle.decisions.total")
            .with_description("Throttle decisions by outcome")
            .build();

        let backoffs_triggered = meter
            .u64_counter("herald.throttle.backoffs.total")
            .with_description("Backoffs written after a bounce-rate breach")
            .build();

        let esp_selections = meter
            .u64_counter("herald.distribution.selections.total")
            .with_description("ESP profile selections by profile")
            .build();

        let failovers = meter
            .u64_counter("herald.distribution.failovers.total")
            .with_description("Selections that skipped at least one unhealthy profile")
            .build();

        let lock_acquisitions = meter
            .u64_counter("herald.lock.acquisitions.total")
            .with_description("Distributed lock acquisition attempts by outcome")
            .build();

        Self {
            suppression_checks,
            throttle_decisions,
            backoffs_triggered,
            esp_selections,
            failovers,
            lock_acquisitions,
            profile_labels: LabelBudget::new(max_label_cardinality),
            unit_labels: LabelBudget::new(max_label_cardinality),
            suppressed_count: AtomicU64::new(0),
            checked_count: AtomicU64::new(0),
            throttle_denied_count: AtomicU64::new(0),
            backoff_count: AtomicU64::new(0),
            selection_count: AtomicU64::new(0),
            failover_count: AtomicU64::new(0),
            lock_acquired_count: AtomicU64::new(0),
        }
    }

    pub fn record_suppression_check(&self, suppressed: bool) {
        let verdict = if suppressed { "suppressed" } else { "clear" };
        self.suppression_checks
            .add(1, &[KeyValue::new("verdict", verdict)]);
        self.checked_count.fetch_add(1, Ordering::Relaxed);
        if suppressed {
            self.suppressed_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// `outcome` is `allowed` or the deny reason kind.
    pub fn record_throttle_decision(&self, outcome: &'static str) {
        self.throttle_decisions
            .add(1, &[KeyValue::new("outcome", outcome)]);
        if outcome != "allowed" {
            self.throttle_denied_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_backoff(&self, unit: &str) {
        self.backoffs_triggered
            .add(1, &[KeyValue::new("unit", self.unit_labels.label(unit))]);
        self.backoff_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_selection(&self, profile: &str, failover: bool) {
        self.esp_selections
            .add(1, &[KeyValue::new("profile", self.profile_labels.label(profile))]);
        self.selection_count.fetch_add(1, Ordering::Relaxed);

        if failover {
            self.failovers.add(1, &[]);
            self.failover_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_lock(&self, outcome: LockOutcome) {
        self.lock_acquisitions
            .add(1, &[KeyValue::new("outcome", outcome.as_str())]);
        if outcome == LockOutcome::Acquired {
            self.lock_acquired_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[must_use]
    pub fn suppression_checks(&self) -> u64 {
        self.checked_count.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn suppressed(&self) -> u64 {
        self.suppressed_count.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn throttle_denials(&self) -> u64 {
        self.throttle_denied_count.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn backoffs(&self) -> u64 {
        self.backoff_count.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn selections(&self) -> u64 {
        self.selection_count.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn failovers(&self) -> u64 {
        self.failover_count.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn locks_acquired(&self) -> u64 {
        self.lock_acquired_count.load(Ordering::Relaxed)
    }
}

/// Get the OpenTelemetry meter for admission metrics
fn meter() -> Meter {
    opentelemetry::global::meter("herald.admission")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_budget_folds_overflow() {
        let budget = LabelBudget::new(2);
        assert_eq!(budget.label("a"), "a");
        assert_eq!(budget.label("b"), "b");
        assert_eq!(budget.label("c"), OVERFLOW_LABEL);
        // Already tracked values keep their own label
        assert_eq!(budget.label("a"), "a");
    }

    #[test]
    fn test_units_do_not_spend_profile_budget() {
        let metrics = AdmissionMetrics::new(1);
        metrics.record_backoff("microsoft");
        metrics.record_backoff("gmail");

        assert_eq!(metrics.profile_labels.label("ses"), "ses");
        assert_eq!(metrics.unit_labels.label("microsoft"), "microsoft");
        assert_eq!(metrics.unit_labels.label("yahoo"), OVERFLOW_LABEL);
    }

    #[test]
    fn test_zero_budget_always_overflows() {
        let budget = LabelBudget::new(0);
        assert_eq!(budget.label("sendgrid"), OVERFLOW_LABEL);
    }
}
