//! Run configuration loaded from TOML.
//!
//! Every key has a default, so an empty file is a valid configuration.
//! `validate` runs before any record is processed; an invalid value is the
//! only error that stops a run.
//!
//! ```toml
//! [pipeline]
//! granularity = "hour"
//! metrics = ["wait_time", "service_time"]
//! z_threshold = 3.0
//!
//! [cleaning.fields]
//! wait_time = [{ rule = "clip_to_range", min = 0.0, max = 240.0 }, { rule = "impute_median" }]
//!
//! [embedding]
//! model = "hashed"
//! dimensions = 128
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::analysis::outliers::{
    DEFAULT_IQR_K, DEFAULT_MIN_BUCKET_SAMPLES, DEFAULT_Z_THRESHOLD, DetectionMethod, DetectorConfig,
};
use crate::clean::CleaningPolicy;
use crate::embed::{EmbeddingModel, HashedTermModel, HttpEmbeddingModel, MetricKind};
use crate::error::ConfigError;
use crate::ingest::database::SourceSettings;
use crate::ingest::normalize::NormalizerConfig;
use crate::model::{FIELD_SERVICE_TIME, FIELD_WAIT_TIME, Granularity};
use crate::report::ReportConfig;
use crate::report::aggregate::{DEFAULT_SLA_MAX_MINUTES, DEFAULT_TOP_N_LABELS};
use crate::vocabulary::{ServiceLabel, default_labels, is_valid_label_id};

pub const DEFAULT_DIMENSIONS: usize = 128;
pub const DEFAULT_TIMEOUT_MS: u64 = 2_000;
pub const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.1;

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// `[pipeline]`: bucketing and detection settings shared by the detector
/// and the report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    pub granularity: Granularity,
    pub metrics: Vec<String>,
    pub z_threshold: f64,
    pub min_bucket_samples: usize,
    pub method: DetectionMethod,
    pub iqr_k: f64,
    pub top_n_labels: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            granularity: Granularity::Hour,
            metrics: vec![FIELD_WAIT_TIME.to_string(), FIELD_SERVICE_TIME.to_string()],
            z_threshold: DEFAULT_Z_THRESHOLD,
            min_bucket_samples: DEFAULT_MIN_BUCKET_SAMPLES,
            method: DetectionMethod::Zscore,
            iqr_k: DEFAULT_IQR_K,
            top_n_labels: DEFAULT_TOP_N_LABELS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
    #[default]
    Hashed,
    Http,
}

/// `[embedding]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingSettings {
    pub model: ModelKind,
    pub dimensions: usize,
    /// Hash seed for the hashed model.
    pub seed: u64,
    /// URL of the embedding endpoint for the http model.
    pub endpoint: Option<String>,
    pub model_name: Option<String>,
    pub timeout_ms: u64,
    pub similarity: MetricKind,
    pub similarity_threshold: f32,
    /// Replaces the built-in vocabulary when non-empty.
    pub vocabulary: Vec<ServiceLabel>,
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            model: ModelKind::Hashed,
            dimensions: DEFAULT_DIMENSIONS,
            seed: 0,
            endpoint: None,
            model_name: None,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            similarity: MetricKind::Cosine,
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
            vocabulary: Vec::new(),
        }
    }
}

/// `[report]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportSettings {
    /// Field checked for SLA compliance; an empty string disables the check.
    pub sla_metric: String,
    pub sla_max: f64,
}

impl Default for ReportSettings {
    fn default() -> Self {
        Self {
            sla_metric: FIELD_WAIT_TIME.to_string(),
            sla_max: DEFAULT_SLA_MAX_MINUTES,
        }
    }
}

// ---------------------------------------------------------------------------
// Top level
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub pipeline: PipelineSettings,
    pub normalizer: NormalizerConfig,
    pub cleaning: CleaningPolicy,
    pub embedding: EmbeddingSettings,
    pub report: ReportSettings,
    pub source: SourceSettings,
}

impl PipelineConfig {
    /// Read, parse and validate a config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Parse and validate config text.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.detector_config().validate()?;
        self.cleaning.validate()?;

        if self.pipeline.metrics.is_empty() {
            return Err(ConfigError::invalid("pipeline.metrics", "at least one metric is required"));
        }
        if self.pipeline.top_n_labels == 0 {
            return Err(ConfigError::invalid("pipeline.top_n_labels", "must be >= 1"));
        }
        for derived in &self.normalizer.derived {
            if derived.name.trim().is_empty() || derived.components.is_empty() {
                return Err(ConfigError::invalid(
                    "normalizer.derived",
                    format!("derived field {:?} needs a name and components", derived.name),
                ));
            }
        }

        let emb = &self.embedding;
        if emb.dimensions == 0 {
            return Err(ConfigError::invalid("embedding.dimensions", "must be >= 1"));
        }
        if emb.timeout_ms == 0 {
            return Err(ConfigError::invalid("embedding.timeout_ms", "must be >= 1"));
        }
        if !emb.similarity_threshold.is_finite() {
            return Err(ConfigError::invalid("embedding.similarity_threshold", "must be finite"));
        }
        if emb.model == ModelKind::Http {
            if emb.endpoint.as_deref().is_none_or(|e| e.trim().is_empty()) {
                return Err(ConfigError::invalid("embedding.endpoint", "required for the http model"));
            }
            if emb.model_name.as_deref().is_none_or(|m| m.trim().is_empty()) {
                return Err(ConfigError::invalid("embedding.model_name", "required for the http model"));
            }
        }
        let mut seen = std::collections::HashSet::new();
        for label in &emb.vocabulary {
            if !is_valid_label_id(&label.id) {
                return Err(ConfigError::invalid(
                    "embedding.vocabulary",
                    format!("label id {:?} must be lowercase snake_case and not \"unknown\"", label.id),
                ));
            }
            if !seen.insert(label.id.as_str()) {
                return Err(ConfigError::invalid(
                    "embedding.vocabulary",
                    format!("duplicate label id {:?}", label.id),
                ));
            }
        }

        if !(self.report.sla_max.is_finite() && self.report.sla_max >= 0.0) {
            return Err(ConfigError::invalid(
                "report.sla_max",
                format!("must be a finite number >= 0, got {}", self.report.sla_max),
            ));
        }
        Ok(())
    }

    pub fn detector_config(&self) -> DetectorConfig {
        let p = &self.pipeline;
        let mut metrics = p.metrics.clone();
        metrics.sort();
        metrics.dedup();
        DetectorConfig {
            granularity: p.granularity,
            metrics,
            z_threshold: p.z_threshold,
            min_bucket_samples: p.min_bucket_samples,
            method: p.method,
            iqr_k: p.iqr_k,
        }
    }

    pub fn report_config(&self) -> ReportConfig {
        let sla_metric = self.report.sla_metric.trim();
        ReportConfig {
            granularity: self.pipeline.granularity,
            metrics: self.pipeline.metrics.clone(),
            top_n_labels: self.pipeline.top_n_labels,
            sla_metric: (!sla_metric.is_empty()).then(|| sla_metric.to_string()),
            sla_max: self.report.sla_max,
        }
    }

    pub fn embedding_timeout(&self) -> Duration {
        Duration::from_millis(self.embedding.timeout_ms)
    }

    /// Configured vocabulary, or the built-in one when none is configured.
    pub fn vocabulary(&self) -> Vec<ServiceLabel> {
        if self.embedding.vocabulary.is_empty() {
            default_labels()
        } else {
            self.embedding.vocabulary.clone()
        }
    }

    /// Construct the configured embedding model.
    pub fn build_model(&self) -> Result<Box<dyn EmbeddingModel>, ConfigError> {
        let emb = &self.embedding;
        match emb.model {
            ModelKind::Hashed => Ok(Box::new(HashedTermModel::new(emb.dimensions, emb.seed))),
            ModelKind::Http => {
                let endpoint = emb
                    .endpoint
                    .clone()
                    .ok_or_else(|| ConfigError::invalid("embedding.endpoint", "required for the http model"))?;
                let name = emb
                    .model_name
                    .clone()
                    .ok_or_else(|| ConfigError::invalid("embedding.model_name", "required for the http model"))?;
                let model = HttpEmbeddingModel::new(endpoint, name, emb.dimensions)
                    .map_err(|e| ConfigError::invalid("embedding", e.to_string()))?;
                Ok(Box::new(model))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clean::FieldRule;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = PipelineConfig::from_toml_str("").expect("empty config is valid");
        assert_eq!(config, PipelineConfig::default());
        assert_eq!(config.pipeline.z_threshold, 3.0);
        assert_eq!(config.pipeline.min_bucket_samples, 2);
        assert_eq!(config.embedding.model, ModelKind::Hashed);
        assert_eq!(config.vocabulary().len(), default_labels().len());
    }

    #[test]
    fn test_full_config_parses() {
        let config = PipelineConfig::from_toml_str(
            r#"
            [pipeline]
            granularity = "weekday"
            metrics = ["wait_time"]
            z_threshold = 2.5
            method = "iqr"

            [normalizer]
            min_timestamp = "1980-01-01T00:00:00Z"
            derived = [{ name = "total_time", components = ["wait_time", "service_time"] }]

            [cleaning.fields]
            wait_time = [{ rule = "clip_to_range", min = 0.0, max = 240.0 }, { rule = "impute_median" }]

            [embedding]
            model = "http"
            endpoint = "http://localhost:11434/api/embeddings"
            model_name = "nomic-embed-text"
            dimensions = 768
            similarity = "dot"
            vocabulary = [{ id = "dental", description = "dental cleaning tooth extraction" }]

            [report]
            sla_metric = ""

            [source]
            table = "visits"
            branch_column = "sucursal"
            "#,
        )
        .expect("config should parse");

        assert_eq!(config.pipeline.granularity, Granularity::Weekday);
        assert_eq!(config.detector_config().method, DetectionMethod::Iqr);
        assert!(config.normalizer.min_timestamp.is_some());
        assert_eq!(config.normalizer.derived[0].name, "total_time");
        assert_eq!(
            config.cleaning.rules("wait_time")[0],
            FieldRule::ClipToRange { min: 0.0, max: 240.0 }
        );
        assert_eq!(config.embedding.similarity, MetricKind::Dot);
        assert_eq!(config.vocabulary()[0].id, "dental");
        assert_eq!(config.report_config().sla_metric, None, "empty sla_metric disables the check");
        assert_eq!(config.source.columns.branch_column, "sucursal");
    }

    // --- Validation ---

    #[test]
    fn test_negative_threshold_is_config_error() {
        let err = PipelineConfig::from_toml_str("[pipeline]\nz_threshold = -1.0\n").unwrap_err();
        assert!(err.to_string().contains("z_threshold"), "error should name the field: {err}");
    }

    #[test]
    fn test_http_model_requires_endpoint() {
        let err = PipelineConfig::from_toml_str("[embedding]\nmodel = \"http\"\n").unwrap_err();
        assert!(err.to_string().contains("embedding.endpoint"));
    }

    #[test]
    fn test_inverted_clip_range_is_rejected() {
        let err = PipelineConfig::from_toml_str(
            "[cleaning.fields]\nwait_time = [{ rule = \"clip_to_range\", min = 10.0, max = 1.0 }]\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("cleaning.fields.wait_time"));
    }

    #[test]
    fn test_reserved_vocabulary_label_is_rejected() {
        let err = PipelineConfig::from_toml_str(
            "[embedding]\nvocabulary = [{ id = \"unknown\", description = \"x\" }]\n",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn test_malformed_toml_is_parse_error() {
        let err = PipelineConfig::from_toml_str("[pipeline\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_build_model_uses_configured_dimensions() {
        let config = PipelineConfig::from_toml_str("[embedding]\ndimensions = 32\nseed = 7\n").unwrap();
        let model = config.build_model().unwrap();
        assert_eq!(model.dimensions(), 32);
        assert_eq!(model.name(), "hashed-term");
    }
}
