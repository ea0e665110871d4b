//! Error types for the visit monitoring pipeline.
//!
//! Only configuration errors are fatal to a run. Per-row and per-bucket
//! problems are reported through rejection lists and counters, and
//! embedding failures degrade to the `unknown` label.

use std::path::PathBuf;
use std::time::Duration;

/// Invalid configuration. Raised before any record is processed.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: String, reason: String },
}

impl ConfigError {
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Failure of the external embedding model.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EmbeddingError {
    #[error("embedding request timed out after {0:?}")]
    Timeout(Duration),

    #[error("embedding service returned HTTP {0}")]
    HttpStatus(u16),

    #[error("embedding request failed: {0}")]
    Transport(String),

    #[error("embedding response could not be decoded: {0}")]
    Decode(String),

    #[error("embedding has {actual} dimensions, model declares {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
}

/// Failure reading raw rows from an input source.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("database error: {0}")]
    Database(#[from] postgres::Error),

    #[error("failed to read input: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV line {line}: {reason}")]
    Csv { line: usize, reason: String },

    #[error("invalid identifier {0:?}")]
    InvalidIdentifier(String),

    #[error("no source table configured")]
    MissingTable,
}

/// Top-level error for callers that drive the whole pipeline.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error("failed to write output: {0}")]
    Output(#[from] std::io::Error),

    #[error("failed to encode output: {0}")]
    Encode(#[from] serde_json::Error),
}
