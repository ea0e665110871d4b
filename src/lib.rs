//! Visit monitoring service.
//!
//! Normalizes visit records from the operational store, cleans them, flags
//! temporal outliers per branch and time bucket, matches free-text service
//! descriptions to a reference vocabulary and aggregates everything into a
//! per-branch report.

pub mod analysis;
pub mod clean;
pub mod config;
pub mod embed;
pub mod error;
pub mod ingest;
pub mod logging;
pub mod model;
pub mod pipeline;
pub mod report;
pub mod vocabulary;

pub use config::PipelineConfig;
pub use error::{ConfigError, EmbeddingError, PipelineError, SourceError};
pub use pipeline::{Diagnostics, Pipeline, PipelineOutput};
