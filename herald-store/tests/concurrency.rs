#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::{sync::Arc, time::Duration};

use herald_common::ManualClock;
use herald_store::{LimitCheck, MemoryStore, SharedStore, WindowCounter};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_admissions_never_exceed_limit() {
    let clock = Arc::new(ManualClock::at_unix(1_700_000_000));
    let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new(clock));
    let counters = Arc::new(vec![
        WindowCounter::new("throttle:acme:gmail.com:h:1", 250, Duration::from_secs(3600)),
        WindowCounter::new("throttle:acme:gmail.com:d:1", 1_000, Duration::from_secs(86_400)),
    ]);

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let store = store.clone();
            let counters = counters.clone();
            tokio::spawn(async move {
                let mut admitted = 0_u32;
                for _ in 0..50 {
                    if store.incr_within_limits(&counters).await.unwrap() == LimitCheck::Admitted {
                        admitted += 1;
                    }
                }
                admitted
            })
        })
        .collect();

    let mut total = 0;
    for handle in handles {
        total += handle.await.unwrap();
    }

    assert_eq!(total, 250);
    assert_eq!(
        store.get("throttle:acme:gmail.com:h:1").await.unwrap().as_deref(),
        Some("250")
    );
    assert_eq!(
        store.get("throttle:acme:gmail.com:d:1").await.unwrap().as_deref(),
        Some("250")
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_set_nx_has_single_winner() {
    let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::default());

    let handles: Vec<_> = (0..32)
        .map(|i| {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .set_nx("lock:cleanup", &format!("owner-{i}"), Duration::from_secs(30))
                    .await
                    .unwrap()
            })
        })
        .collect();

    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_hash_increments_are_not_lost() {
    let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::default());

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let store = store.clone();
            tokio::spawn(async move {
                for _ in 0..100 {
                    store
                        .hash_incr("dist:c1", &[("a:sent", 1), ("a:failed", 0)], None)
                        .await
                        .unwrap();
                }
            })
        })
        .collect();

    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(
        store.hash_get_all("dist:c1").await.unwrap(),
        vec![("a:failed".to_string(), 0), ("a:sent".to_string(), 800)]
    );
}
