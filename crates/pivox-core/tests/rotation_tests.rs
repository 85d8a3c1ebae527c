//! Tests for rotation strategies
//!
//! This module tests:
//! - Round-robin ordering and wraparound
//! - Weighted sampling distribution
//! - Least-recently-used selection
//! - Strategy behavior over fixed snapshots

use pivox_core::proxy::{Proxy, ProxyProtocol};
use pivox_core::rotation::{Candidate, RotationKind, RotationStrategy};

// ============================================================================
// Test Fixtures
// ============================================================================

fn candidate(host: &str, score: f64, last_used: i64) -> Candidate {
    Candidate {
        proxy: Proxy::new(host, 8080, ProxyProtocol::Http),
        score,
        last_used_epoch_ms: last_used,
    }
}

// ============================================================================
// Round-robin
// ============================================================================

#[test]
fn test_round_robin_insertion_order() {
    let snapshot = vec![
        candidate("1.1.1.1", 0.1, 0),
        candidate("2.2.2.2", 0.9, 0),
        candidate("3.3.3.3", 0.5, 0),
    ];
    let mut strategy = RotationStrategy::new(RotationKind::RoundRobin);
    let picks: Vec<usize> = (0..6).map(|_| strategy.select(&snapshot).unwrap()).collect();
    assert_eq!(picks, vec![0, 1, 2, 0, 1, 2]);
}

#[test]
fn test_round_robin_cursor_survives_shrink() {
    let mut strategy = RotationStrategy::new(RotationKind::RoundRobin);
    let three = vec![
        candidate("1.1.1.1", 0.5, 0),
        candidate("2.2.2.2", 0.5, 0),
        candidate("3.3.3.3", 0.5, 0),
    ];
    strategy.select(&three);
    strategy.select(&three);

    // Snapshot shrank under the cursor; selection stays in bounds.
    let one = vec![candidate("1.1.1.1", 0.5, 0)];
    assert_eq!(strategy.select(&one), Some(0));
}

// ============================================================================
// Weighted
// ============================================================================

#[test]
fn test_weighted_distribution_tracks_scores() {
    let snapshot = vec![candidate("a", 0.9, 0), candidate("b", 0.1, 0)];
    let mut strategy = RotationStrategy::new(RotationKind::Weighted);

    let mut a_count = 0u32;
    const DRAWS: u32 = 10_000;
    for _ in 0..DRAWS {
        if strategy.select(&snapshot) == Some(0) {
            a_count += 1;
        }
    }
    // Expected 9000 with sigma = sqrt(10000 * 0.9 * 0.1) = 30; allow 3 sigma
    // plus margin, matching 8700..=9100.
    assert!(
        (8700..=9100).contains(&a_count),
        "a selected {a_count} times out of {DRAWS}"
    );
}

#[test]
fn test_weighted_zero_scores_get_floor() {
    let snapshot = vec![
        candidate("a", 0.95, 0),
        candidate("b", 0.0, 0),
    ];
    let mut strategy = RotationStrategy::new(RotationKind::Weighted);
    let mut b_seen = false;
    for _ in 0..20_000 {
        if strategy.select(&snapshot) == Some(1) {
            b_seen = true;
            break;
        }
    }
    assert!(b_seen, "zero-score proxy should still be sampled occasionally");
}

// ============================================================================
// Least-recently-used
// ============================================================================

#[test]
fn test_lru_picks_oldest_use() {
    let snapshot = vec![
        candidate("a", 0.5, 3000),
        candidate("b", 0.5, 1000),
        candidate("c", 0.5, 2000),
    ];
    let mut strategy = RotationStrategy::new(RotationKind::LeastRecentlyUsed);
    assert_eq!(strategy.select(&snapshot), Some(1));
}

#[test]
fn test_kind_round_trip() {
    for kind in [
        RotationKind::RoundRobin,
        RotationKind::Random,
        RotationKind::Weighted,
        RotationKind::LeastRecentlyUsed,
    ] {
        assert_eq!(RotationKind::parse(kind.as_str()), Some(kind));
        assert_eq!(RotationStrategy::new(kind).kind(), kind);
    }
}

#[test]
fn test_random_covers_set() {
    let snapshot = vec![candidate("a", 0.5, 0), candidate("b", 0.5, 0)];
    let mut strategy = RotationStrategy::new(RotationKind::Random);
    let mut seen = [false, false];
    for _ in 0..1000 {
        if let Some(i) = strategy.select(&snapshot) {
            seen[i] = true;
        }
    }
    assert_eq!(seen, [true, true]);
}
