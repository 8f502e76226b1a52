// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Embedding Client
//!
//! Turns captured interaction text into fixed-dimension vectors.
//!
//! Two implementations ship:
//!
//! - [`HashingEmbedder`]: deterministic feature hashing over word unigrams and
//!   bigrams. Needs no network and is the default, so capture works out of the
//!   box and tests are reproducible.
//! - [`HttpEmbedder`]: any OpenAI-compatible `/embeddings` endpoint.
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure Layer
//! - **Purpose:** Implements embedding generation

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Duration;

use crate::domain::CortexError;

#[async_trait]
pub trait Embedder: Send + Sync {
    /// Stable identifier recorded on the index generation.
    fn name(&self) -> &str;

    fn dimension(&self) -> usize;

    async fn embed(&self, text: &str) -> Result<Vec<f32>, CortexError>;
}

/// Signed feature hashing into `dimension` buckets, L2-normalised.
pub struct HashingEmbedder {
    dimension: usize,
    name: String,
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            name: format!("hashing-{dimension}"),
        }
    }

    fn add_feature(&self, vector: &mut [f32], feature: &str) {
        let mut hasher = DefaultHasher::new();
        feature.hash(&mut hasher);
        let hash = hasher.finish();

        let bucket = (hash % self.dimension as u64) as usize;
        // Top bit picks the sign so unrelated features tend to cancel.
        let sign = if hash >> 63 == 0 { 1.0 } else { -1.0 };
        vector[bucket] += sign;
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(384)
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    fn name(&self) -> &str {
        &self.name
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, CortexError> {
        if self.dimension == 0 {
            return Err(CortexError::Embedding("dimension must be non-zero".into()));
        }

        let tokens: Vec<String> = text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(|t| t.to_lowercase())
            .collect();

        let mut vector = vec![0.0f32; self.dimension];
        for token in &tokens {
            self.add_feature(&mut vector, token);
        }
        for pair in tokens.windows(2) {
            self.add_feature(&mut vector, &format!("{} {}", pair[0], pair[1]));
        }

        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|x| *x /= norm);
        }
        Ok(vector)
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

/// Client for an OpenAI-compatible embeddings endpoint.
pub struct HttpEmbedder {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    dimension: usize,
}

impl HttpEmbedder {
    /// `endpoint` is the API base, e.g. `https://api.openai.com/v1`.
    pub fn new(
        endpoint: impl Into<String>,
        model: impl Into<String>,
        api_key: Option<String>,
        dimension: usize,
    ) -> Result<Self, CortexError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| CortexError::Embedding(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            model: model.into(),
            api_key,
            dimension,
        })
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    fn name(&self) -> &str {
        &self.model
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, CortexError> {
        let url = format!("{}/embeddings", self.endpoint);
        let mut request = self.client.post(&url).json(&EmbeddingRequest {
            model: &self.model,
            input: text,
        });
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| CortexError::Embedding(format!("request to {url} failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CortexError::Embedding(format!(
                "embedding endpoint returned {status}: {body}"
            )));
        }

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| CortexError::Embedding(format!("invalid embedding response: {e}")))?;

        let vector = parsed
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| CortexError::Embedding("embedding response had no data".into()))?;

        if vector.len() != self.dimension {
            return Err(CortexError::DimensionMismatch {
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        Ok(vector)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_hashing_embedding_dimension_and_norm() {
        let embedder = HashingEmbedder::new(384);
        let v = embedder.embed("rush hour near the stadium").await.unwrap();

        assert_eq!(v.len(), 384);
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn test_consistent_embeddings() {
        let embedder = HashingEmbedder::default();
        let a = embedder.embed("Same Text").await.unwrap();
        let b = embedder.embed("same text").await.unwrap();

        assert_eq!(a, b, "Tokenisation is case-insensitive");
    }

    #[tokio::test]
    async fn test_empty_text_is_zero_vector() {
        let embedder = HashingEmbedder::new(8);
        let v = embedder.embed("  ...  ").await.unwrap();
        assert!(v.iter().all(|x| *x == 0.0));
    }

    #[tokio::test]
    async fn test_http_embedder_parses_response() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/embeddings")
            .match_header("authorization", "Bearer sk-test")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"data":[{"embedding":[0.5,0.5,0.0]}]}"#)
            .create_async()
            .await;

        let embedder = HttpEmbedder::new(
            format!("{}/v1/", server.url()),
            "text-embedding-3-small",
            Some("sk-test".into()),
            3,
        )
        .unwrap();
        let v = embedder.embed("hello").await.unwrap();

        assert_eq!(v, vec![0.5, 0.5, 0.0]);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_http_embedder_rejects_wrong_dimension() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/embeddings")
            .with_status(200)
            .with_body(r#"{"data":[{"embedding":[1.0,0.0]}]}"#)
            .create_async()
            .await;

        let embedder = HttpEmbedder::new(server.url(), "m", None, 3).unwrap();
        let err = embedder.embed("hello").await.unwrap_err();

        assert!(matches!(
            err,
            CortexError::DimensionMismatch {
                expected: 3,
                actual: 2
            }
        ));
    }
}
