/// Structured logging for the visit monitoring pipeline
///
/// Provides context-rich logging with pipeline stage identifiers and
/// severity levels on top of `tracing`. Supports console output and an
/// optional log file for scheduled runs.

use std::fmt;
use std::fs::OpenOptions;
use std::sync::Mutex;

use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::error::EmbeddingError;

// ---------------------------------------------------------------------------
// Pipeline Stages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Normalize,
    Clean,
    Detect,
    Embed,
    Report,
    System,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Normalize => write!(f, "NORM"),
            Stage::Clean => write!(f, "CLEAN"),
            Stage::Detect => write!(f, "DETECT"),
            Stage::Embed => write!(f, "EMBED"),
            Stage::Report => write!(f, "REPORT"),
            Stage::System => write!(f, "SYS"),
        }
    }
}

// ---------------------------------------------------------------------------
// Failure Classification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureType {
    /// Expected failure - e.g. the service is shedding load
    Expected,
    /// Unexpected failure - indicates a broken model or a configuration issue
    Unexpected,
    /// Unknown - cannot determine if this is expected or not
    Unknown,
}

impl fmt::Display for FailureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureType::Expected => write!(f, "EXPECTED"),
            FailureType::Unexpected => write!(f, "UNEXPECTED"),
            FailureType::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

// ---------------------------------------------------------------------------
// Subscriber Setup
// ---------------------------------------------------------------------------

/// Initialize the global subscriber.
///
/// `default_directive` applies when `RUST_LOG` is unset (e.g. `"info"`).
/// With `log_file`, lines are appended there without ANSI colors instead of
/// going to stderr. Calling this twice is harmless; the second call is a no-op.
pub fn init_logging(default_directive: &str, log_file: Option<&str>) -> std::io::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);

    let result = match log_file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            builder.with_ansi(false).with_writer(Mutex::new(file)).try_init()
        }
        None => builder.with_writer(std::io::stderr).try_init(),
    };

    if result.is_err() {
        debug!("logging already initialized");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Failure Classification Helpers
// ---------------------------------------------------------------------------

/// Classify an embedding model failure
pub fn classify_embedding_failure(err: &EmbeddingError) -> FailureType {
    match err {
        // Slow or overloaded service; a later run will likely succeed
        EmbeddingError::Timeout(_) => FailureType::Expected,
        EmbeddingError::HttpStatus(code) if *code == 429 || *code == 503 => FailureType::Expected,
        // The model answered with something we cannot use
        EmbeddingError::DimensionMismatch { .. } | EmbeddingError::Decode(_) => {
            FailureType::Unexpected
        }
        EmbeddingError::HttpStatus(code) if *code >= 400 && *code < 500 => FailureType::Unexpected,
        _ => FailureType::Unknown,
    }
}

// ---------------------------------------------------------------------------
// Structured Failure Logging
// ---------------------------------------------------------------------------

/// Log an embedding failure with automatic classification
pub fn log_embedding_failure(model: &str, text_len: usize, err: &EmbeddingError) {
    let failure_type = classify_embedding_failure(err);
    let stage = Stage::Embed;

    match failure_type {
        FailureType::Expected => {
            debug!(%stage, model, text_len, failure = %failure_type, "embedding failed: {err}")
        }
        FailureType::Unexpected => {
            error!(%stage, model, text_len, failure = %failure_type, "embedding failed: {err}")
        }
        FailureType::Unknown => {
            warn!(%stage, model, text_len, failure = %failure_type, "embedding failed: {err}")
        }
    }
}

// ---------------------------------------------------------------------------
// Stage Summary Logging
// ---------------------------------------------------------------------------

/// Log a summary of one pipeline stage
pub fn log_stage_summary(stage: Stage, total: usize, successful: usize, failed: usize) {
    if failed == 0 {
        info!(%stage, total, successful, failed, "stage complete");
    } else if successful == 0 && total > 0 {
        error!(%stage, total, successful, failed, "stage complete, nothing succeeded");
    } else {
        warn!(%stage, total, successful, failed, "stage complete with failures");
    }
}
