/// Description embedding and vocabulary matching.
///
/// Submodules:
/// - `hashed`:     deterministic seeded hashed-term model, always available.
/// - `http`:       remote model behind a JSON embedding endpoint.
/// - `similarity`: similarity metrics, reference sets and nearest-label lookup.
/// - `embedder`:   per-run cache and the description embedding pass.

pub mod embedder;
pub mod hashed;
pub mod http;
pub mod similarity;

use std::time::Duration;

use crate::error::EmbeddingError;

pub use embedder::{DescriptionEmbedder, Embedded, EmbeddingCache, EmbeddingStats, normalize_text};
pub use hashed::HashedTermModel;
pub use http::HttpEmbeddingModel;
pub use similarity::{Cosine, DotProduct, MetricKind, ReferenceSet, SimilarityMetric, nearest};

/// A text embedding model.
///
/// Implementations must be usable from several threads at once and must
/// honor `timeout` for any call that leaves the process.
pub trait EmbeddingModel: Send + Sync {
    fn embed(&self, text: &str, timeout: Duration) -> Result<Vec<f32>, EmbeddingError>;

    /// Length of every vector this model returns.
    fn dimensions(&self) -> usize;

    fn name(&self) -> &str;
}

/// Embeds `text` and checks the result has the model's declared length.
pub fn embed_checked(
    model: &dyn EmbeddingModel,
    text: &str,
    timeout: Duration,
) -> Result<Vec<f32>, EmbeddingError> {
    let vector = model.embed(text, timeout)?;
    if vector.len() != model.dimensions() {
        return Err(EmbeddingError::DimensionMismatch {
            expected: model.dimensions(),
            actual: vector.len(),
        });
    }
    Ok(vector)
}
