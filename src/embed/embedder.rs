//! Description embedding pass.
//!
//! Each distinct normalized description is sent to the model at most once
//! per run; results, failures included, are kept in an [`EmbeddingCache`]
//! owned by the caller. Uncached texts are embedded in parallel, then every
//! description is matched against the reference vocabulary in input order.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use rayon::prelude::*;
use serde::Serialize;

use crate::embed::similarity::{ReferenceSet, SimilarityMetric, nearest};
use crate::embed::{EmbeddingModel, embed_checked};
use crate::error::EmbeddingError;
use crate::logging::{Stage, log_embedding_failure, log_stage_summary};
use crate::model::{DescriptionVector, TemporalRecord, UNKNOWN_LABEL};

/// Cache key for a description: trimmed, whitespace collapsed, lower-cased.
pub fn normalize_text(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

/// Per-run memo of model results keyed by normalized text.
#[derive(Debug, Default)]
pub struct EmbeddingCache {
    entries: HashMap<String, Result<Vec<f32>, EmbeddingError>>,
}

impl EmbeddingCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Result<Vec<f32>, EmbeddingError>> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of cached texts whose embedding failed.
    pub fn failures(&self) -> usize {
        self.entries.values().filter(|r| r.is_err()).count()
    }
}

// ---------------------------------------------------------------------------
// Embedding pass
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EmbeddingStats {
    pub descriptions: usize,
    pub empty_descriptions: usize,
    pub model_calls: usize,
    pub cache_hits: usize,
    /// Records labeled `unknown` because their text could not be embedded.
    pub fallbacks: usize,
    /// Records whose best match scored below the similarity threshold.
    pub below_threshold: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Embedded {
    pub vectors: Vec<DescriptionVector>,
    pub stats: EmbeddingStats,
}

pub struct DescriptionEmbedder<'a> {
    model: &'a dyn EmbeddingModel,
    metric: &'a dyn SimilarityMetric,
    reference: &'a ReferenceSet,
    timeout: Duration,
    similarity_threshold: f32,
}

impl<'a> DescriptionEmbedder<'a> {
    pub fn new(
        model: &'a dyn EmbeddingModel,
        metric: &'a dyn SimilarityMetric,
        reference: &'a ReferenceSet,
        timeout: Duration,
    ) -> Self {
        Self {
            model,
            metric,
            reference,
            timeout,
            similarity_threshold: f32::NEG_INFINITY,
        }
    }

    /// Best matches scoring below `threshold` are reported as `unknown`.
    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.similarity_threshold = threshold;
        self
    }

    pub fn embed_records(&self, records: &[TemporalRecord], cache: &mut EmbeddingCache) -> Embedded {
        let pairs: Vec<(&str, &str)> = records
            .iter()
            .map(|r| (r.id.as_str(), r.description.as_str()))
            .collect();
        self.embed(&pairs, cache)
    }

    /// Embed `(record_id, description)` pairs, returning one vector per pair
    /// in input order.
    pub fn embed(&self, descriptions: &[(&str, &str)], cache: &mut EmbeddingCache) -> Embedded {
        let keys: Vec<String> = descriptions.iter().map(|(_, text)| normalize_text(text)).collect();

        let missing: BTreeSet<&str> = keys
            .iter()
            .map(String::as_str)
            .filter(|k| !k.is_empty() && !cache.contains(k))
            .collect();

        let fresh: Vec<(String, Result<Vec<f32>, EmbeddingError>)> = missing
            .par_iter()
            .map(|key| (key.to_string(), embed_checked(self.model, key, self.timeout)))
            .collect();

        let mut stats = EmbeddingStats {
            descriptions: descriptions.len(),
            model_calls: fresh.len(),
            ..EmbeddingStats::default()
        };

        for (key, result) in fresh {
            if let Err(err) = &result {
                log_embedding_failure(self.model.name(), key.len(), err);
            }
            cache.entries.insert(key, result);
        }

        let mut vectors = Vec::with_capacity(descriptions.len());
        for ((record_id, _), key) in descriptions.iter().zip(&keys) {
            let record_id = record_id.to_string();
            if key.is_empty() {
                stats.empty_descriptions += 1;
                vectors.push(unknown(record_id));
                continue;
            }

            match cache.get(key) {
                Some(Ok(embedding)) => {
                    let (label, score) = nearest(embedding, self.reference, self.metric);
                    let label = if score < self.similarity_threshold {
                        stats.below_threshold += 1;
                        UNKNOWN_LABEL.to_string()
                    } else {
                        label
                    };
                    vectors.push(DescriptionVector {
                        record_id,
                        embedding: Some(embedding.clone()),
                        nearest_label: label,
                        similarity_score: score,
                    });
                }
                _ => {
                    stats.fallbacks += 1;
                    vectors.push(unknown(record_id));
                }
            }
        }

        let non_empty = stats.descriptions - stats.empty_descriptions;
        stats.cache_hits = non_empty.saturating_sub(stats.model_calls);
        log_stage_summary(Stage::Embed, non_empty, non_empty - stats.fallbacks, stats.fallbacks);

        Embedded { vectors, stats }
    }
}

fn unknown(record_id: String) -> DescriptionVector {
    DescriptionVector {
        record_id,
        embedding: None,
        nearest_label: UNKNOWN_LABEL.to_string(),
        similarity_score: 0.0,
    }
}
