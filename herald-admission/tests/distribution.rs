#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::{collections::HashMap, sync::Arc};

use herald_admission::distribution::{
    DistributionConfig, EspDistributor, EspQuota, validate_quotas,
};
use herald_common::ManualClock;
use herald_store::MemoryStore;

fn quotas() -> Vec<EspQuota> {
    vec![
        EspQuota::new("A", 40.0),
        EspQuota::new("B", 30.0),
        EspQuota::new("C", 30.0),
    ]
}

fn distributor(threshold: u64) -> Arc<EspDistributor> {
    let clock = Arc::new(ManualClock::at_unix(1_700_000_000));
    let store = Arc::new(MemoryStore::new(clock.clone()));
    let config = DistributionConfig {
        failure_threshold: threshold,
        failure_window_secs: 300,
    };
    Arc::new(EspDistributor::new(config, store, clock).unwrap())
}

fn assert_within_ten_points(counts: &HashMap<String, u64>, total: u64) {
    for quota in quotas() {
        let sent = counts.get(&quota.profile).copied().unwrap_or(0);
        #[allow(clippy::cast_precision_loss)]
        let share = sent as f64 * 100.0 / total as f64;
        assert!(
            (share - quota.percentage).abs() <= 10.0,
            "{} got {share:.1}% for a {}% quota",
            quota.profile,
            quota.percentage
        );
    }
}

#[test]
fn quota_sets_must_sum_to_one_hundred() {
    assert!(validate_quotas(&quotas()).is_ok());
    assert!(
        validate_quotas(&[
            EspQuota::new("A", 40.0),
            EspQuota::new("B", 30.0),
            EspQuota::new("C", 20.0),
        ])
        .is_err()
    );
}

#[tokio::test]
async fn selection_converges_on_quota_split() {
    let distributor = distributor(10);
    let quotas = quotas();
    let mut counts = HashMap::new();

    for _ in 0..1_000 {
        let selection = distributor.select("spring", &quotas).await.unwrap();
        distributor
            .record_send("spring", &selection.profile)
            .await
            .unwrap();
        *counts.entry(selection.profile).or_insert(0) += 1;
    }

    assert_within_ten_points(&counts, 1_000);

    let stats = distributor.stats("spring").await.unwrap();
    assert_eq!(stats.iter().map(|s| s.sent).sum::<u64>(), 1_000);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn selection_converges_under_concurrency() {
    let distributor = distributor(10);

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let distributor = distributor.clone();
        tasks.push(tokio::spawn(async move {
            let quotas = quotas();
            for _ in 0..125 {
                let selection = distributor.select("summer", &quotas).await.unwrap();
                distributor
                    .record_send("summer", &selection.profile)
                    .await
                    .unwrap();
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let counts: HashMap<String, u64> = distributor
        .stats("summer")
        .await
        .unwrap()
        .into_iter()
        .map(|stats| (stats.profile, stats.sent))
        .collect();
    assert_eq!(counts.values().sum::<u64>(), 1_000);
    assert_within_ten_points(&counts, 1_000);
}

#[tokio::test]
async fn failed_profile_excluded_while_others_healthy() {
    let distributor = distributor(5);
    let quotas = quotas();

    for _ in 0..5 {
        distributor.record_failure("autumn", "A").await.unwrap();
    }
    for _ in 0..3 {
        distributor.record_failure("autumn", "B").await.unwrap();
    }

    for _ in 0..50 {
        let selection = distributor.select("autumn", &quotas).await.unwrap();
        assert_ne!(selection.profile, "A");
        assert!(selection.failover);
        distributor
            .record_send("autumn", &selection.profile)
            .await
            .unwrap();
    }

    let failures: HashMap<String, u64> = distributor
        .stats("autumn")
        .await
        .unwrap()
        .into_iter()
        .map(|stats| (stats.profile, stats.failed))
        .collect();
    assert_eq!(failures.get("A"), Some(&5));
    assert_eq!(failures.get("B"), Some(&3));
    assert_eq!(failures.get("C"), Some(&0));
}
