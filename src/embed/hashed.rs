//! Seeded hashed-term embedding model.
//!
//! Hashes lower-cased terms into a fixed number of buckets with FNV-1a,
//! weights each bucket by term frequency and L2-normalizes the result.
//! Output depends only on (text, dimensions, seed), so it doubles as the
//! deterministic model in tests and as the offline default.

use std::collections::BTreeMap;
use std::time::Duration;

use crate::embed::EmbeddingModel;
use crate::error::EmbeddingError;

const FNV_OFFSET_BASIS: u64 = 0xcbf29ce484222325;
const FNV_PRIME: u64 = 0x100000001b3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashedTermModel {
    dimensions: usize,
    seed: u64,
}

impl HashedTermModel {
    pub fn new(dimensions: usize, seed: u64) -> Self {
        Self { dimensions, seed }
    }

    fn bucket(&self, term: &str) -> usize {
        let mut h = FNV_OFFSET_BASIS ^ self.seed;
        for b in term.as_bytes() {
            h ^= *b as u64;
            h = h.wrapping_mul(FNV_PRIME);
        }
        (h % self.dimensions as u64) as usize
    }

    fn tokenize(text: &str) -> Vec<String> {
        text.split(|c: char| !c.is_alphanumeric())
            .filter(|s| s.chars().count() >= 2)
            .map(str::to_lowercase)
            .collect()
    }

    fn vector(&self, text: &str) -> Vec<f32> {
        let mut vec = vec![0.0f32; self.dimensions];
        let tokens = Self::tokenize(text);
        if tokens.is_empty() || self.dimensions == 0 {
            return vec;
        }

        // BTreeMap keeps float accumulation order stable across runs.
        let mut tf: BTreeMap<&str, f32> = BTreeMap::new();
        for tok in &tokens {
            *tf.entry(tok.as_str()).or_default() += 1.0;
        }

        let total = tokens.len() as f32;
        for (term, count) in tf {
            // Longer terms carry more meaning than short connectives.
            let weight = 1.0 + (term.chars().count() as f32).ln();
            vec[self.bucket(term)] += count / total * weight;
        }

        let norm: f32 = vec.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            for v in &mut vec {
                *v /= norm;
            }
        }
        vec
    }
}

impl EmbeddingModel for HashedTermModel {
    fn embed(&self, text: &str, _timeout: Duration) -> Result<Vec<f32>, EmbeddingError> {
        Ok(self.vector(text))
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn name(&self) -> &str {
        "hashed-term"
    }
}
