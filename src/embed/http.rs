/// Remote embedding model over HTTP
///
/// Posts `{"model": ..., "input": ...}` to a JSON endpoint with a blocking
/// `reqwest` client. Accepts the common response shapes:
/// `{"embedding": [...]}`, `{"embeddings": [[...]]}` and
/// `{"data": [{"embedding": [...]}]}`.

use std::time::Duration;

use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::embed::EmbeddingModel;
use crate::error::EmbeddingError;
use crate::logging::Stage;

#[derive(Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum EmbedResponse {
    Single { embedding: Vec<f32> },
    Batch { embeddings: Vec<Vec<f32>> },
    Data { data: Vec<DataItem> },
}

#[derive(Debug, Deserialize)]
struct DataItem {
    embedding: Vec<f32>,
}

impl EmbedResponse {
    fn into_vector(self) -> Result<Vec<f32>, EmbeddingError> {
        let vector = match self {
            EmbedResponse::Single { embedding } => Some(embedding),
            EmbedResponse::Batch { embeddings } => embeddings.into_iter().next(),
            EmbedResponse::Data { data } => data.into_iter().next().map(|d| d.embedding),
        };
        vector.ok_or_else(|| EmbeddingError::Decode("response contained no embedding".to_string()))
    }
}

pub struct HttpEmbeddingModel {
    client: Client,
    endpoint: String,
    model_name: String,
    dimensions: usize,
}

impl HttpEmbeddingModel {
    pub fn new(endpoint: impl Into<String>, model_name: impl Into<String>, dimensions: usize) -> Result<Self, EmbeddingError> {
        let client = Client::builder()
            .build()
            .map_err(|e| EmbeddingError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            model_name: model_name.into(),
            dimensions,
        })
    }
}

impl EmbeddingModel for HttpEmbeddingModel {
    fn embed(&self, text: &str, timeout: Duration) -> Result<Vec<f32>, EmbeddingError> {
        let request = EmbedRequest { model: &self.model_name, input: text };

        let response = self
            .client
            .post(&self.endpoint)
            .timeout(timeout)
            .json(&request)
            .send()
            .map_err(|e| {
                if e.is_timeout() {
                    EmbeddingError::Timeout(timeout)
                } else {
                    EmbeddingError::Transport(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            return Err(EmbeddingError::HttpStatus(response.status().as_u16()));
        }

        let body: EmbedResponse = response.json().map_err(|e| {
            if e.is_timeout() {
                EmbeddingError::Timeout(timeout)
            } else {
                EmbeddingError::Decode(e.to_string())
            }
        })?;
        let vector = body.into_vector()?;
        debug!(stage = %Stage::Embed, model = %self.model_name, dims = vector.len(), "embedding received");
        Ok(vector)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn name(&self) -> &str {
        &self.model_name
    }
}
