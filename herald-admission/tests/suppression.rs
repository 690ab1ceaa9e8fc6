#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::time::{Duration, Instant};

use herald_admission::suppression::{Digest, Scope, SuppressionEngine};

fn address(i: usize) -> String {
    format!("member{i}@example.com")
}

#[test]
fn hundred_thousand_hashes_under_one_list() {
    let engine = SuppressionEngine::new();
    let digests: Vec<String> = (0..100_000)
        .map(|i| Digest::of_address(&address(i)).unwrap().to_hex())
        .collect();

    let report = engine
        .load_digests("L1", "Unsubscribed", Scope::List, &digests)
        .unwrap();
    assert_eq!(report.accepted, 100_000);
    assert_eq!(engine.count("L1"), Some(100_000));

    assert!(engine.is_suppressed(&address(54_321), &["L1"]));
    assert!(engine.is_suppressed("  MEMBER54321@Example.COM ", &["L1"]));
    assert!(!engine.is_suppressed(&address(54_321), &["other"]));
    assert!(!engine.is_suppressed(&address(100_001), &["L1"]));
}

#[test]
fn only_global_and_requested_lists_apply() {
    let engine = SuppressionEngine::new();
    engine
        .load_list("global", "Global", Scope::Global, ["everyone@example.com"])
        .unwrap();
    for list in 0..12 {
        engine
            .load_list(
                &format!("list-{list}"),
                &format!("List {list}"),
                Scope::List,
                [format!("only-{list}@example.com")],
            )
            .unwrap();
    }
    assert_eq!(engine.lists().len(), 13);

    for list in 0..12 {
        let own = format!("list-{list}");
        let neighbour = format!("list-{}", (list + 1) % 12);
        let email = format!("only-{list}@example.com");

        assert!(engine.is_suppressed(&email, &[own.as_str()]));
        assert!(!engine.is_suppressed(&email, &[neighbour.as_str()]));
        assert!(engine.is_suppressed(&email, &[neighbour.as_str(), own.as_str()]));
        assert!(engine.is_suppressed("everyone@example.com", &[neighbour.as_str()]));
    }

    assert!(engine.is_suppressed::<&str>("everyone@example.com", &[]));
    assert!(!engine.is_suppressed::<&str>("only-3@example.com", &[]));
}

#[test]
fn normalized_equal_addresses_share_a_verdict() {
    let engine = SuppressionEngine::new();
    engine
        .load_list("L1", "L1", Scope::List, ["Jane.Doe@Example.org"])
        .unwrap();

    for variant in ["jane.doe@example.org", "  JANE.DOE@EXAMPLE.ORG", "Jane.Doe@example.ORG\t"] {
        assert_eq!(
            Digest::of_address(variant),
            Digest::of_address("jane.doe@example.org")
        );
        assert!(engine.is_suppressed(variant, &["L1"]));
    }
}

fn average_lookup(engine: &SuppressionEngine, rounds: usize) -> Duration {
    let start = Instant::now();
    for i in 0..rounds {
        std::hint::black_box(engine.is_suppressed(&address(i * 7), &["L1"]));
    }
    start.elapsed() / u32::try_from(rounds).unwrap()
}

#[test]
fn lookup_cost_does_not_grow_with_list_size() {
    let small = SuppressionEngine::new();
    small
        .load_list("L1", "L1", Scope::List, (0..100).map(address))
        .unwrap();

    let large = SuppressionEngine::new();
    large
        .load_list("L1", "L1", Scope::List, (0..200_000).map(address))
        .unwrap();

    // Warm both up before measuring
    average_lookup(&small, 1_000);
    average_lookup(&large, 1_000);

    let small_avg = average_lookup(&small, 20_000);
    let large_avg = average_lookup(&large, 20_000);

    assert!(
        large_avg < small_avg * 10 + Duration::from_micros(20),
        "small {small_avg:?} large {large_avg:?}"
    );
}
