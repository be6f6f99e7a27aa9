//! Deterministic scoring and ranking of backlog items.
//!
//! `priority = impact * 2 - effort`, with both inputs clamped to `[1,10]`.
//! Ties break on higher impact, then earlier discovery.

use std::cmp::Ordering;

use crate::review::findings::Improvement;
use crate::store::models::BacklogItem;

pub const MIN_SCORE: i64 = 1;
pub const MAX_SCORE: i64 = 10;

pub fn clamp_score(score: i64) -> i64 {
    score.clamp(MIN_SCORE, MAX_SCORE)
}

/// `impact * 2 - effort` over clamped inputs.
pub fn priority_score(impact: i64, effort: i64) -> i64 {
    clamp_score(impact) * 2 - clamp_score(effort)
}

/// Anything the ranking can order.
pub trait Rankable {
    fn impact(&self) -> i64;
    fn effort(&self) -> i64;
    fn discovery_order(&self) -> i64;
    fn domain(&self) -> &str;

    fn priority(&self) -> i64 {
        priority_score(self.impact(), self.effort())
    }
}

impl Rankable for BacklogItem {
    fn impact(&self) -> i64 {
        self.impact_score
    }

    fn effort(&self) -> i64 {
        self.effort_score
    }

    fn discovery_order(&self) -> i64 {
        self.discovery_order
    }

    fn domain(&self) -> &str {
        &self.domain
    }
}

/// An improvement paired with the order in which it was discovered.
#[derive(Debug, Clone)]
pub struct Discovered {
    pub order: i64,
    pub improvement: Improvement,
}

impl Rankable for Discovered {
    fn impact(&self) -> i64 {
        clamp_score(self.improvement.impact_score)
    }

    fn effort(&self) -> i64 {
        clamp_score(self.improvement.effort_score)
    }

    fn discovery_order(&self) -> i64 {
        self.order
    }

    fn domain(&self) -> &str {
        &self.improvement.domain
    }
}

fn tie_break<T: Rankable>(a: &T, b: &T) -> Ordering {
    b.impact()
        .cmp(&a.impact())
        .then_with(|| a.discovery_order().cmp(&b.discovery_order()))
}

/// Sort by raw priority, highest first.
pub fn rank<T: Rankable>(items: &mut [T]) {
    items.sort_by(|a, b| b.priority().cmp(&a.priority()).then_with(|| tie_break(a, b)));
}

/// Sort by `priority * weight(domain)` for display. Scores are not modified.
pub fn rank_weighted<T: Rankable>(items: &mut [T], weight: impl Fn(&str) -> f64) {
    let display = |item: &T| item.priority() as f64 * weight(item.domain());
    items.sort_by(|a, b| {
        display(b)
            .partial_cmp(&display(a))
            .unwrap_or(Ordering::Equal)
            .then_with(|| tie_break(a, b))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn discovered(order: i64, domain: &str, impact: i64, effort: i64) -> Discovered {
        Discovered {
            order,
            improvement: Improvement::new(&format!("item {order}"), domain, impact, effort),
        }
    }

    fn orders(items: &[Discovered]) -> Vec<i64> {
        items.iter().map(|d| d.order).collect()
    }

    #[test]
    fn test_priority_formula_over_full_grid() {
        for impact in 1..=10 {
            for effort in 1..=10 {
                let p = priority_score(impact, effort);
                assert_eq!(p, impact * 2 - effort);
                assert!((-9..=19).contains(&p));
            }
        }
    }

    #[test]
    fn test_priority_clamps_inputs() {
        assert_eq!(priority_score(15, -3), 19);
        assert_eq!(priority_score(0, 99), -8);
    }

    #[test]
    fn test_rank_by_priority_then_impact_then_discovery() {
        // p: 13, 13 (impact 7), 13 (impact 7, later), 5
        let mut items = vec![
            discovered(0, "a", 5, 5),
            discovered(1, "a", 7, 1),
            discovered(2, "a", 8, 3),
            discovered(3, "a", 7, 1),
        ];
        rank(&mut items);
        assert_eq!(orders(&items), vec![2, 1, 3, 0]);
    }

    #[test]
    fn test_rank_weighted_does_not_mutate_scores() {
        let mut items = vec![discovered(0, "reliability", 8, 3), discovered(1, "security", 6, 3)];
        rank_weighted(&mut items, |d| if d == "security" { 2.0 } else { 1.0 });
        assert_eq!(orders(&items), vec![1, 0]);
        assert_eq!(items[0].improvement.impact_score, 6);
        assert_eq!(items[0].priority(), 9);
    }
}
