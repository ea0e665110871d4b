/// End-to-end run of the visit analysis pipeline
///
/// normalize → profile → clean → profile → (detect ∥ embed) → aggregate.
///
/// Detection and embedding only read the cleaned dataset, so they run on
/// two rayon workers. The embedding cache is created per run and dropped
/// with it. Nothing in a run is fatal once `Pipeline::new` has accepted the
/// configuration; problems are reported in `Diagnostics`.

use std::collections::BTreeMap;
use std::time::Instant;

use serde::Serialize;
use tracing::{info, warn};

use crate::analysis::outliers::{DetectorConfig, detect, insufficient_buckets};
use crate::analysis::profile::{FieldProfile, profile};
use crate::clean::{CleaningCounters, clean};
use crate::config::PipelineConfig;
use crate::embed::{DescriptionEmbedder, EmbeddingCache, EmbeddingModel, EmbeddingStats, ReferenceSet, SimilarityMetric};
use crate::error::ConfigError;
use crate::ingest::normalize::normalize;
use crate::logging::Stage;
use crate::model::{DescriptionVector, OutlierFlag, RawRow, RejectedRow};
use crate::report::{DemandPoint, ReportConfig, ReportSummary, aggregate, demand_profile};
use crate::vocabulary::ServiceLabel;

/// Run counters for operators. Serialized next to the report.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Diagnostics {
    pub rows_read: usize,
    pub records_normalized: usize,
    pub rejected_by_reason: BTreeMap<String, usize>,
    pub records_cleaned: usize,
    pub duplicates_removed: usize,
    pub dropped_missing: usize,
    pub clipped: BTreeMap<String, usize>,
    pub imputed: BTreeMap<String, usize>,
    pub failed_imputations: BTreeMap<String, usize>,
    pub flags_evaluated: usize,
    pub outliers: usize,
    pub insufficient_buckets: usize,
    pub reference_labels: usize,
    pub reference_failures: usize,
    pub embedding: EmbeddingStats,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineOutput {
    pub summary: ReportSummary,
    pub flags: Vec<OutlierFlag>,
    pub vectors: Vec<DescriptionVector>,
    pub rejected: Vec<RejectedRow>,
    pub cleaning: CleaningCounters,
    pub profile_before: Vec<FieldProfile>,
    pub profile_after: Vec<FieldProfile>,
    pub demand: Vec<DemandPoint>,
    pub diagnostics: Diagnostics,
}

pub struct Pipeline {
    config: PipelineConfig,
    detector: DetectorConfig,
    report: ReportConfig,
    vocabulary: Vec<ServiceLabel>,
    model: Box<dyn EmbeddingModel>,
    metric: Box<dyn SimilarityMetric>,
}

impl Pipeline {
    /// Validates `config` and binds it to `model`.
    pub fn new(config: PipelineConfig, model: Box<dyn EmbeddingModel>) -> Result<Self, ConfigError> {
        config.validate()?;
        if model.dimensions() == 0 {
            return Err(ConfigError::invalid("embedding.dimensions", "model declares zero dimensions"));
        }
        Ok(Self {
            detector: config.detector_config(),
            report: config.report_config(),
            vocabulary: config.vocabulary(),
            metric: config.embedding.similarity.metric(),
            model,
            config,
        })
    }

    /// Builds the model named in `config`; `new` then validates everything.
    pub fn from_config(config: PipelineConfig) -> Result<Self, ConfigError> {
        let model = config.build_model()?;
        Self::new(config, model)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn run(&self, rows: &[RawRow]) -> PipelineOutput {
        let started = Instant::now();
        info!(stage = %Stage::System, rows = rows.len(), model = self.model.name(), "run started");

        let normalized = normalize(rows, &self.config.normalizer);
        let profile_before = profile(&normalized.records);
        let cleaned = clean(&normalized.records, &self.config.cleaning);
        let profile_after = profile(&cleaned.records);

        let mut cache = EmbeddingCache::new();
        let (flags, (embedded, reference_labels, reference_failures)) = rayon::join(
            || detect(&cleaned, &self.detector),
            || {
                let timeout = self.config.embedding_timeout();
                let (reference, failures) = ReferenceSet::build(self.model.as_ref(), &self.vocabulary, timeout);
                if reference.is_empty() {
                    warn!(stage = %Stage::Embed, "no reference labels available, every description will be unknown");
                }
                let embedder = DescriptionEmbedder::new(self.model.as_ref(), self.metric.as_ref(), &reference, timeout)
                    .with_threshold(self.config.embedding.similarity_threshold);
                (embedder.embed_records(&cleaned.records, &mut cache), reference.len(), failures)
            },
        );

        let summary = aggregate(&cleaned, &flags, &embedded.vectors, &self.report);
        let demand = demand_profile(&cleaned);

        let mut rejected_by_reason = BTreeMap::new();
        for row in &normalized.rejected {
            *rejected_by_reason.entry(row.reason.to_string()).or_insert(0) += 1;
        }
        let counters = cleaned.counters.clone();
        let diagnostics = Diagnostics {
            rows_read: rows.len(),
            records_normalized: normalized.records.len(),
            rejected_by_reason,
            records_cleaned: cleaned.records.len(),
            duplicates_removed: counters.duplicates_removed,
            dropped_missing: counters.dropped_missing,
            clipped: counters.clipped.clone(),
            imputed: counters.imputed.clone(),
            failed_imputations: counters.failed_imputations.clone(),
            flags_evaluated: flags.len(),
            outliers: flags.iter().filter(|f| f.is_outlier).count(),
            insufficient_buckets: insufficient_buckets(&flags),
            reference_labels,
            reference_failures,
            embedding: embedded.stats,
        };

        info!(
            stage = %Stage::System,
            records = diagnostics.records_cleaned,
            rejected = normalized.rejected.len(),
            outliers = diagnostics.outliers,
            fallbacks = diagnostics.embedding.fallbacks,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "run finished"
        );

        PipelineOutput {
            summary,
            flags,
            vectors: embedded.vectors,
            rejected: normalized.rejected,
            cleaning: counters,
            profile_before,
            profile_after,
            demand,
            diagnostics,
        }
    }
}
