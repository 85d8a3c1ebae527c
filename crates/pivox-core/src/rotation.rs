//! Pluggable proxy selection strategies.
//!
//! A strategy is a tagged variant holding only its own state (the
//! round-robin cursor). Selection operates on an immutable snapshot the
//! pool manager builds under its lock, so the choice is pure given that
//! snapshot.

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::proxy::Proxy;

/// Floor weight share granted to zero-score proxies under `Weighted`.
const ZERO_SCORE_FLOOR: f64 = 0.05;

/// Snapshot row the pool hands to a strategy, in insertion order.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub proxy: Proxy,
    pub score: f64,
    pub last_used_epoch_ms: i64,
}

/// Strategy tag, for configuration and per-request overrides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RotationKind {
    RoundRobin,
    Random,
    Weighted,
    LeastRecentlyUsed,
}

impl RotationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RotationKind::RoundRobin => "round-robin",
            RotationKind::Random => "random",
            RotationKind::Weighted => "weighted",
            RotationKind::LeastRecentlyUsed => "least-recently-used",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "round-robin" | "roundrobin" => Some(RotationKind::RoundRobin),
            "random" => Some(RotationKind::Random),
            "weighted" => Some(RotationKind::Weighted),
            "least-recently-used" | "lru" => Some(RotationKind::LeastRecentlyUsed),
            _ => None,
        }
    }
}

impl std::fmt::Display for RotationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone)]
pub enum RotationStrategy {
    RoundRobin { cursor: usize },
    Random,
    Weighted,
    LeastRecentlyUsed,
}

impl RotationStrategy {
    pub fn new(kind: RotationKind) -> Self {
        match kind {
            RotationKind::RoundRobin => RotationStrategy::RoundRobin { cursor: 0 },
            RotationKind::Random => RotationStrategy::Random,
            RotationKind::Weighted => RotationStrategy::Weighted,
            RotationKind::LeastRecentlyUsed => RotationStrategy::LeastRecentlyUsed,
        }
    }

    pub fn kind(&self) -> RotationKind {
        match self {
            RotationStrategy::RoundRobin { .. } => RotationKind::RoundRobin,
            RotationStrategy::Random => RotationKind::Random,
            RotationStrategy::Weighted => RotationKind::Weighted,
            RotationStrategy::LeastRecentlyUsed => RotationKind::LeastRecentlyUsed,
        }
    }

    /// Pick an index into `candidates`, or `None` when empty.
    pub fn select(&mut self, candidates: &[Candidate]) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        match self {
            RotationStrategy::RoundRobin { cursor } => {
                let index = *cursor % candidates.len();
                *cursor = (index + 1) % candidates.len();
                Some(index)
            }
            RotationStrategy::Random => {
                Some(rand::thread_rng().gen_range(0..candidates.len()))
            }
            RotationStrategy::Weighted => Some(weighted_index(candidates)),
            RotationStrategy::LeastRecentlyUsed => {
                // Oldest use wins; ties prefer the better score.
                candidates
                    .iter()
                    .enumerate()
                    .min_by(|(_, a), (_, b)| {
                        a.last_used_epoch_ms
                            .cmp(&b.last_used_epoch_ms)
                            .then_with(|| {
                                b.score
                                    .partial_cmp(&a.score)
                                    .unwrap_or(std::cmp::Ordering::Equal)
                            })
                    })
                    .map(|(i, _)| i)
            }
        }
    }
}

/// Sample proportionally to score, with a floor so zero-score proxies are
/// still occasionally explored.
fn weighted_index(candidates: &[Candidate]) -> usize {
    let floor = ZERO_SCORE_FLOOR / candidates.len() as f64;
    let weights: Vec<f64> = candidates
        .iter()
        .map(|c| if c.score > 0.0 { c.score } else { floor })
        .collect();
    let total: f64 = weights.iter().sum();

    let mut roll = rand::thread_rng().gen::<f64>() * total;
    for (i, weight) in weights.iter().enumerate() {
        roll -= weight;
        if roll <= 0.0 {
            return i;
        }
    }
    candidates.len() - 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::ProxyProtocol;

    fn candidate(host: &str, score: f64, last_used: i64) -> Candidate {
        Candidate {
            proxy: Proxy::new(host, 80, ProxyProtocol::Http),
            score,
            last_used_epoch_ms: last_used,
        }
    }

    #[test]
    fn test_empty_snapshot() {
        let mut strategy = RotationStrategy::new(RotationKind::RoundRobin);
        assert_eq!(strategy.select(&[]), None);
    }

    #[test]
    fn test_round_robin_wraps() {
        let snapshot = vec![candidate("a", 0.5, 0), candidate("b", 0.5, 0)];
        let mut strategy = RotationStrategy::new(RotationKind::RoundRobin);
        assert_eq!(strategy.select(&snapshot), Some(0));
        assert_eq!(strategy.select(&snapshot), Some(1));
        assert_eq!(strategy.select(&snapshot), Some(0));
    }

    #[test]
    fn test_lru_tie_prefers_higher_score() {
        let snapshot = vec![
            candidate("a", 0.2, 100),
            candidate("b", 0.9, 100),
            candidate("c", 0.5, 200),
        ];
        let mut strategy = RotationStrategy::new(RotationKind::LeastRecentlyUsed);
        assert_eq!(strategy.select(&snapshot), Some(1));
    }

    #[test]
    fn test_weighted_never_panics_on_zero_scores() {
        let snapshot = vec![candidate("a", 0.0, 0), candidate("b", 0.0, 0)];
        let mut strategy = RotationStrategy::new(RotationKind::Weighted);
        for _ in 0..100 {
            assert!(strategy.select(&snapshot).is_some());
        }
    }
}
