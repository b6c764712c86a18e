//! Query-vs-gallery identification.

use crate::gallery::GallerySnapshot;
use crate::types::{Embedding, EmployeeId};
use serde::Serialize;
use std::cmp::Ordering;
use thiserror::Error;

/// Default cosine similarity an employee's best embedding must reach.
pub const DEFAULT_THRESHOLD: f32 = 0.6;
/// Default required lead of the best employee over the runner-up.
pub const DEFAULT_MIN_MARGIN: f32 = 0.05;

/// Runner-up score used when fewer than two employees are enrolled.
const NO_RUNNER_UP: f32 = -1.0;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MatchError {
    #[error("query has {actual} dimensions, gallery expects {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
}

/// Outcome of identifying a query. Transient; never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    pub accepted: bool,
    /// Set only when `accepted`.
    pub employee_id: Option<EmployeeId>,
    /// Best employee's score (cosine similarity in [-1, 1]); 0.0 for an empty gallery.
    pub score: f32,
    /// Second-best distinct employee's score.
    pub runner_up_score: f32,
}

impl MatchResult {
    fn rejected(score: f32, runner_up_score: f32) -> Self {
        Self {
            accepted: false,
            employee_id: None,
            score,
            runner_up_score,
        }
    }

    pub fn margin(&self) -> f32 {
        self.score - self.runner_up_score
    }
}

/// Strategy for identifying a query embedding against a gallery snapshot.
pub trait Matcher: Send + Sync {
    /// Identify `query`, ignoring `excluded`'s embeddings if given.
    fn find(
        &self,
        query: &Embedding,
        gallery: &GallerySnapshot,
        excluded: Option<&EmployeeId>,
    ) -> Result<MatchResult, MatchError>;
}

/// Cosine similarity matcher with a confidence threshold and an ambiguity margin.
///
/// Always visits every gallery entry; the result depends only on the
/// snapshot and the query.
#[derive(Debug, Clone, Copy)]
pub struct CosineMatcher {
    pub threshold: f32,
    pub min_margin: f32,
}

impl Default for CosineMatcher {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            min_margin: DEFAULT_MIN_MARGIN,
        }
    }
}

impl CosineMatcher {
    pub fn new(threshold: f32, min_margin: f32) -> Self {
        Self {
            threshold,
            min_margin,
        }
    }

    /// Per-employee best similarity, sorted by score descending then employee id ascending.
    pub fn rank(
        &self,
        query: &Embedding,
        gallery: &GallerySnapshot,
        excluded: Option<&EmployeeId>,
    ) -> Result<Vec<(EmployeeId, f32)>, MatchError> {
        if query.dim() != gallery.dimension() {
            return Err(MatchError::DimensionMismatch {
                expected: gallery.dimension(),
                actual: query.dim(),
            });
        }

        let mut ranked: Vec<(EmployeeId, f32)> = Vec::with_capacity(gallery.employee_count());
        for (employee_id, embeddings) in gallery.iter() {
            if excluded == Some(employee_id) || embeddings.is_empty() {
                continue;
            }
            let mut best = f32::NEG_INFINITY;
            for stored in embeddings {
                let sim = query.similarity(&stored.embedding);
                if sim > best {
                    best = sim;
                }
            }
            ranked.push((employee_id.clone(), best));
        }

        ranked.sort_by(|(id_a, a), (id_b, b)| match b.total_cmp(a) {
            Ordering::Equal => id_a.cmp(id_b),
            other => other,
        });
        Ok(ranked)
    }
}

impl Matcher for CosineMatcher {
    fn find(
        &self,
        query: &Embedding,
        gallery: &GallerySnapshot,
        excluded: Option<&EmployeeId>,
    ) -> Result<MatchResult, MatchError> {
        let ranked = self.rank(query, gallery, excluded)?;

        let Some((best_id, best)) = ranked.first() else {
            return Ok(MatchResult::rejected(0.0, NO_RUNNER_UP));
        };
        let runner_up = ranked.get(1).map(|(_, s)| *s).unwrap_or(NO_RUNNER_UP);

        // NaN scores fail both comparisons and are rejected.
        if *best >= self.threshold && (*best - runner_up) >= self.min_margin {
            Ok(MatchResult {
                accepted: true,
                employee_id: Some(best_id.clone()),
                score: *best,
                runner_up_score: runner_up,
            })
        } else {
            Ok(MatchResult::rejected(*best, runner_up))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gallery::EmbeddingStore;

    fn gallery<const D: usize>(entries: &[(&str, [f32; D])]) -> std::sync::Arc<GallerySnapshot> {
        let store = EmbeddingStore::new(D, 5);
        for (id, values) in entries {
            store
                .put(&EmployeeId::from(*id), Embedding::new(values.to_vec()), 0.9)
                .unwrap();
        }
        store.snapshot()
    }

    fn query(values: &[f32]) -> Embedding {
        Embedding::new(values.to_vec())
    }

    #[test]
    fn test_matches_best_employee_last_in_gallery() {
        let g = gallery(&[
            ("a", [0.0, 1.0, 0.0]),
            ("b", [0.0, 0.0, 1.0]),
            ("c", [1.0, 0.0, 0.0]),
        ]);
        let result = CosineMatcher::default().find(&query(&[1.0, 0.0, 0.0]), &g, None).unwrap();
        assert!(result.accepted);
        assert_eq!(result.employee_id.as_ref().map(|e| e.as_str()), Some("c"));
        assert!((result.score - 1.0).abs() < 1e-6);
        assert!(result.runner_up_score.abs() < 1e-6);
    }

    #[test]
    fn test_below_threshold_rejected() {
        let g = gallery(&[("a", [0.0, 1.0, 0.0]), ("b", [0.0, 0.0, 1.0])]);
        let result = CosineMatcher::default().find(&query(&[1.0, 0.0, 0.0]), &g, None).unwrap();
        assert!(!result.accepted);
        assert!(result.employee_id.is_none());
    }

    #[test]
    fn test_ambiguous_lookalikes_rejected() {
        // Both employees score ~0.99; the margin is far below 0.05.
        let g = gallery(&[("a", [1.0, 0.1, 0.0]), ("b", [1.0, 0.0, 0.1])]);
        let result = CosineMatcher::default().find(&query(&[1.0, 0.05, 0.05]), &g, None).unwrap();
        assert!(result.score >= DEFAULT_THRESHOLD);
        assert!(result.margin() < DEFAULT_MIN_MARGIN);
        assert!(!result.accepted);
        assert!(result.employee_id.is_none());
    }

    #[test]
    fn test_employee_score_is_max_over_embeddings() {
        let store = EmbeddingStore::new(2, 5);
        let a = EmployeeId::from("a");
        store.put(&a, Embedding::new(vec![0.0, 1.0]), 0.9).unwrap();
        store.put(&a, Embedding::new(vec![1.0, 0.0]), 0.9).unwrap();
        store.put(&EmployeeId::from("b"), Embedding::new(vec![-1.0, 0.0]), 0.9).unwrap();
        let result = CosineMatcher::default()
            .find(&query(&[1.0, 0.0]), &store.snapshot(), None)
            .unwrap();
        assert!(result.accepted);
        assert_eq!(result.employee_id, Some(a));
        assert!((result.runner_up_score + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_ties_broken_by_lowest_employee_id() {
        let g = gallery(&[("zed", [1.0, 0.0]), ("amy", [1.0, 0.0])]);
        let ranked = CosineMatcher::default().rank(&query(&[1.0, 0.0]), &g, None).unwrap();
        assert_eq!(ranked[0].0.as_str(), "amy");
        assert_eq!(ranked[1].0.as_str(), "zed");

        // Exact tie means zero margin: ambiguous.
        let result = CosineMatcher::default().find(&query(&[1.0, 0.0]), &g, None).unwrap();
        assert!(!result.accepted);
    }

    #[test]
    fn test_deterministic_for_fixed_snapshot() {
        let g = gallery(&[("a", [0.9, 0.1]), ("b", [0.1, 0.9]), ("c", [0.7, 0.7])]);
        let m = CosineMatcher::default();
        let first = m.find(&query(&[1.0, 0.2]), &g, None).unwrap();
        for _ in 0..10 {
            assert_eq!(m.find(&query(&[1.0, 0.2]), &g, None).unwrap(), first);
        }
    }

    #[test]
    fn test_excluded_employee_ignored() {
        let g = gallery(&[("a", [1.0, 0.0]), ("b", [0.0, 1.0])]);
        let a = EmployeeId::from("a");
        let result = CosineMatcher::default().find(&query(&[1.0, 0.0]), &g, Some(&a)).unwrap();
        assert!(!result.accepted);
        assert!(result.score.abs() < 1e-6);
    }

    #[test]
    fn test_single_employee_margin_uses_floor() {
        let g = gallery(&[("a", [1.0, 0.0])]);
        let result = CosineMatcher::default().find(&query(&[0.8, 0.2]), &g, None).unwrap();
        assert!(result.accepted);
        assert_eq!(result.runner_up_score, NO_RUNNER_UP);
    }

    #[test]
    fn test_empty_gallery() {
        let store = EmbeddingStore::new(2, 5);
        let result = CosineMatcher::default()
            .find(&query(&[1.0, 0.0]), &store.snapshot(), None)
            .unwrap();
        assert!(!result.accepted);
        assert_eq!(result.score, 0.0);
    }

    #[test]
    fn test_query_dimension_mismatch() {
        let g = gallery(&[("a", [1.0, 0.0, 0.0])]);
        let err = CosineMatcher::default().find(&query(&[1.0, 0.0]), &g, None).unwrap_err();
        assert_eq!(err, MatchError::DimensionMismatch { expected: 3, actual: 2 });
    }
}
