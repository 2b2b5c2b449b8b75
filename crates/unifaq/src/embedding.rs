//! Embedding model seam. The model itself is an external service; the
//! engine only needs text → fixed-dimension vector.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;

#[async_trait]
pub trait EmbeddingModel: Send + Sync {
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>>;
    fn dimension(&self) -> usize;
}

/// HTTP client for an OpenAI-compatible `/embeddings` endpoint.
pub struct RemoteEmbedder {
    client: Client,
    endpoint: String,
    model: String,
    api_key: String,
    dimension: usize,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

impl RemoteEmbedder {
    pub fn new(endpoint: String, model: String, api_key: String, dimension: usize) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(std::time::Duration::from_secs(15))
            .timeout(std::time::Duration::from_secs(60))
            .build()?;
        Ok(Self {
            client,
            endpoint,
            model,
            api_key,
            dimension,
        })
    }
}

#[async_trait]
impl EmbeddingModel for RemoteEmbedder {
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        let request = json!({
            "model": self.model,
            "input": text,
        });

        let response = self
            .client
            .post(&self.endpoint)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    anyhow!("Embedding request to {} timed out", self.endpoint)
                } else {
                    anyhow!("Embedding request to {} failed: {}", self.endpoint, e)
                }
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(status = %status, body = %body, "Embedding API error");
            return Err(anyhow!("Embedding API returned HTTP {}", status));
        }

        let parsed: EmbeddingResponse = response.json().await?;
        let vector = parsed
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| anyhow!("Embedding API returned no data"))?;

        if vector.len() != self.dimension {
            return Err(anyhow!(
                "Embedding dimension mismatch: expected {}, got {}",
                self.dimension,
                vector.len()
            ));
        }
        Ok(vector)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// Cosine similarity between two vectors of equal length.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}
