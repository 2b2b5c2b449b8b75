//! Vector store seam. The engine treats nearest-neighbor search as a
//! managed remote service with namespaced collections and metadata.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;

use crate::types::{CandidateMetadata, Namespace};

/// One raw match from the vector store, before boosting/reranking.
#[derive(Debug, Clone)]
pub struct VectorMatch {
    pub id: String,
    pub score: f32,
    pub text: String,
    pub metadata: CandidateMetadata,
}

/// Optional server-side filter, passed through opaquely as a JSON object.
pub type MetadataFilter = serde_json::Value;

#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn query(
        &self,
        namespace: Namespace,
        vector: &[f32],
        top_k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<VectorMatch>>;
}

/// HTTP client for a managed vector search service exposing a POST
/// `/query` endpoint with namespace, vector, top_k and metadata filters.
pub struct RemoteVectorStore {
    client: Client,
    endpoint: String,
    api_key: String,
}

#[derive(Deserialize)]
struct QueryResponse {
    #[serde(default)]
    matches: Vec<RawMatch>,
}

#[derive(Deserialize)]
struct RawMatch {
    id: String,
    score: f32,
    #[serde(default)]
    metadata: serde_json::Value,
}

impl RemoteVectorStore {
    pub fn new(endpoint: String, api_key: String) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(std::time::Duration::from_secs(15))
            .timeout(std::time::Duration::from_secs(60))
            .build()?;
        Ok(Self {
            client,
            endpoint,
            api_key,
        })
    }

    fn parse_match(raw: RawMatch) -> VectorMatch {
        // The chunk text travels inside metadata; everything else maps to
        // the typed metadata fields.
        let text = raw
            .metadata
            .get("text")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        let metadata = CandidateMetadata {
            table_name: raw
                .metadata
                .get("table_name")
                .and_then(|v| v.as_str())
                .map(String::from),
            primary_key: raw.metadata.get("primary_key").and_then(|v| v.as_i64()),
            source_file: raw
                .metadata
                .get("source_file")
                .and_then(|v| v.as_str())
                .map(String::from),
            page: raw
                .metadata
                .get("page")
                .and_then(|v| v.as_u64())
                .map(|p| p as u32),
            section: raw
                .metadata
                .get("section")
                .and_then(|v| v.as_str())
                .map(String::from),
        };

        VectorMatch {
            id: raw.id,
            score: raw.score,
            text,
            metadata,
        }
    }
}

#[async_trait]
impl VectorStore for RemoteVectorStore {
    async fn query(
        &self,
        namespace: Namespace,
        vector: &[f32],
        top_k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<VectorMatch>> {
        let mut request = json!({
            "namespace": namespace.as_str(),
            "vector": vector,
            "topK": top_k,
            "includeMetadata": true,
        });
        if let Some(f) = filter {
            request["filter"] = f.clone();
        }

        let response = self
            .client
            .post(&self.endpoint)
            .header("Api-Key", &self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() {
                    anyhow!("Failed to connect to vector store at {}: {}", self.endpoint, e)
                } else {
                    anyhow!("Vector store request failed: {}", e)
                }
            })?;

        if !response.status().is_success() {
            let status = response.status();
            tracing::warn!(status = %status, namespace = namespace.as_str(), "Vector store query error");
            return Err(anyhow!("Vector store returned HTTP {}", status));
        }

        let parsed: QueryResponse = response
            .json()
            .await
            .map_err(|e| anyhow!("Vector store returned malformed data: {}", e))?;

        Ok(parsed.matches.into_iter().map(Self::parse_match).collect())
    }
}
