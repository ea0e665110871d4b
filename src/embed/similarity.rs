//! Similarity metrics and nearest-label lookup.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::embed::{EmbeddingModel, embed_checked};
use crate::logging::{Stage, log_embedding_failure};
use crate::model::UNKNOWN_LABEL;
use crate::vocabulary::ServiceLabel;

/// Pairwise similarity between two vectors of equal length.
pub trait SimilarityMetric: Send + Sync {
    fn similarity(&self, a: &[f32], b: &[f32]) -> f32;

    fn name(&self) -> &str;
}

/// Cosine similarity. Zero when either vector has zero length.
#[derive(Debug, Clone, Copy, Default)]
pub struct Cosine;

impl SimilarityMetric for Cosine {
    fn similarity(&self, a: &[f32], b: &[f32]) -> f32 {
        let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
        let na = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        let nb = b.iter().map(|x| x * x).sum::<f32>().sqrt();
        if na <= f32::EPSILON || nb <= f32::EPSILON {
            return 0.0;
        }
        dot / (na * nb)
    }

    fn name(&self) -> &str {
        "cosine"
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DotProduct;

impl SimilarityMetric for DotProduct {
    fn similarity(&self, a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b).map(|(x, y)| x * y).sum()
    }

    fn name(&self) -> &str {
        "dot"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    #[default]
    Cosine,
    Dot,
}

impl MetricKind {
    pub fn metric(self) -> Box<dyn SimilarityMetric> {
        match self {
            MetricKind::Cosine => Box::new(Cosine),
            MetricKind::Dot => Box::new(DotProduct),
        }
    }
}

// ---------------------------------------------------------------------------
// Reference set
// ---------------------------------------------------------------------------

/// Embedded vocabulary, sorted by label id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReferenceSet {
    entries: Vec<(String, Vec<f32>)>,
}

impl ReferenceSet {
    pub fn new(entries: impl IntoIterator<Item = (String, Vec<f32>)>) -> Self {
        let mut entries: Vec<_> = entries.into_iter().collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries.dedup_by(|a, b| a.0 == b.0);
        Self { entries }
    }

    /// Embeds each label's description through `model`. Labels that fail to
    /// embed are left out and counted in the second return value.
    pub fn build(
        model: &dyn EmbeddingModel,
        labels: &[ServiceLabel],
        timeout: Duration,
    ) -> (Self, usize) {
        let mut failed = 0;
        let mut entries = Vec::with_capacity(labels.len());
        for label in labels {
            match embed_checked(model, &label.description, timeout) {
                Ok(vector) => entries.push((label.id.clone(), vector)),
                Err(err) => {
                    failed += 1;
                    log_embedding_failure(model.name(), label.description.len(), &err);
                    warn!(stage = %Stage::Embed, label = %label.id, "reference label skipped");
                }
            }
        }
        (Self::new(entries), failed)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(label, _)| label.as_str())
    }
}

/// Best-matching label for `vector`.
///
/// Ties resolve to the smallest label id. An empty reference set or an
/// all-zero vector yields `("unknown", 0.0)`.
pub fn nearest(vector: &[f32], reference: &ReferenceSet, metric: &dyn SimilarityMetric) -> (String, f32) {
    let unknown = (UNKNOWN_LABEL.to_string(), 0.0);
    if reference.is_empty() || vector.iter().all(|&x| x == 0.0) {
        return unknown;
    }

    let mut best: Option<(&str, f32)> = None;
    for (label, candidate) in &reference.entries {
        let score = metric.similarity(vector, candidate);
        if !score.is_finite() {
            continue;
        }
        match best {
            Some((_, top)) if score <= top => {}
            _ => best = Some((label.as_str(), score)),
        }
    }

    best.map(|(label, score)| (label.to_string(), score))
        .unwrap_or(unknown)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embed::HashedTermModel;
    use crate::vocabulary::default_labels;

    fn reference() -> ReferenceSet {
        ReferenceSet::new(vec![
            ("lab".to_string(), vec![1.0, 0.0, 0.0]),
            ("imaging".to_string(), vec![0.0, 1.0, 0.0]),
        ])
    }

    #[test]
    fn test_cosine_handles_zero_vector() {
        assert_eq!(Cosine.similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert!((Cosine.similarity(&[2.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_nearest_picks_most_similar() {
        let (label, score) = nearest(&[0.1, 0.9, 0.0], &reference(), &Cosine);
        assert_eq!(label, "imaging");
        assert!(score > 0.9);
    }

    #[test]
    fn test_ties_go_to_smallest_label() {
        let (label, _) = nearest(&[1.0, 1.0, 0.0], &reference(), &Cosine);
        assert_eq!(label, "imaging", "imaging < lab alphabetically");
    }

    #[test]
    fn test_empty_reference_or_zero_vector_is_unknown() {
        assert_eq!(nearest(&[1.0, 0.0], &ReferenceSet::default(), &Cosine), ("unknown".to_string(), 0.0));
        assert_eq!(nearest(&[0.0, 0.0, 0.0], &reference(), &Cosine), ("unknown".to_string(), 0.0));
    }

    #[test]
    fn test_dot_product_is_swappable() {
        let reference = ReferenceSet::new(vec![
            ("long".to_string(), vec![10.0, 0.0]),
            ("aligned".to_string(), vec![0.6, 0.8]),
        ]);
        let query = [0.6, 0.8];
        assert_eq!(nearest(&query, &reference, &Cosine).0, "aligned");
        assert_eq!(nearest(&query, &reference, &DotProduct).0, "long");
    }

    #[test]
    fn test_build_embeds_default_vocabulary() {
        let model = HashedTermModel::new(64, 11);
        let (set, failed) = ReferenceSet::build(&model, &default_labels(), Duration::from_millis(50));
        assert_eq!(failed, 0);
        assert_eq!(set.len(), default_labels().len());

        let labels: Vec<_> = set.labels().collect();
        let mut sorted = labels.clone();
        sorted.sort();
        assert_eq!(labels, sorted, "reference set is kept sorted by label");
    }
}
