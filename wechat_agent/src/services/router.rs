use std::cmp::Ordering;
use std::collections::HashMap;

use crate::repository::{SourceHealth, Subscription};
use crate::schemas::SourceCandidate;

/// Ranks candidates by the composite key: pinned flag, preferred-provider
/// bonus plus health score, priority (smaller wins), discovery recency.
#[derive(Default)]
pub struct SourceRouter;

impl SourceRouter {
    pub fn new() -> Self {
        Self
    }

    pub fn rank(
        &self,
        sub: &Subscription,
        mut candidates: Vec<SourceCandidate>,
        health: &HashMap<(String, String), SourceHealth>,
    ) -> Vec<SourceCandidate> {
        let key = |candidate: &SourceCandidate| -> (i64, f64, i64, f64) {
            let score = health
                .get(&(candidate.provider.clone(), candidate.url.clone()))
                .map(|h| h.score)
                .unwrap_or(candidate.confidence * 100.0);
            let preferred_bonus = match sub.preferred_provider.as_deref() {
                Some(preferred) if preferred == candidate.provider => 1.0,
                _ => 0.0,
            };
            let discovered = candidate
                .discovered_at
                .map(|dt| dt.timestamp() as f64)
                .unwrap_or(0.0);
            (
                i64::from(candidate.is_pinned),
                preferred_bonus * 1000.0 + score,
                -candidate.priority,
                discovered,
            )
        };

        candidates.sort_by(|a, b| {
            let ka = key(a);
            let kb = key(b);
            // High-first on every component.
            kb.0.cmp(&ka.0)
                .then_with(|| kb.1.partial_cmp(&ka.1).unwrap_or(Ordering::Equal))
                .then_with(|| kb.2.cmp(&ka.2))
                .then_with(|| kb.3.partial_cmp(&ka.3).unwrap_or(Ordering::Equal))
        });
        candidates
    }

    pub fn pick_best(
        &self,
        sub: &Subscription,
        candidates: Vec<SourceCandidate>,
        health: &HashMap<(String, String), SourceHealth>,
    ) -> Option<SourceCandidate> {
        self.rank(sub, candidates, health).into_iter().next()
    }
}
