//! Generator seam: prompt → text, one-shot or token-streaming.
//! The model itself is an external service reached over HTTP.

pub mod streaming;

pub use streaming::TokenStream;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures_util::stream::StreamExt;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;

use crate::config::GenerationEndpointConfig;

#[derive(Debug, Clone)]
pub struct GenerationOptions {
    pub max_tokens: usize,
    pub temperature: f32,
    pub stop: Vec<String>,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            max_tokens: 1024,
            temperature: 0.2,
            stop: Vec::new(),
        }
    }
}

#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, prompt: &str, options: &GenerationOptions) -> Result<String>;

    async fn generate_stream(
        &self,
        prompt: &str,
        options: &GenerationOptions,
    ) -> Result<TokenStream>;
}

/// Client for an OpenAI-compatible chat completions endpoint (Ollama,
/// vLLM, OpenAI itself). Streaming uses SSE `data:` frames.
pub struct OpenAiCompatGenerator {
    client: Client,
    endpoint: String,
    model: String,
    api_key: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: String,
}

impl OpenAiCompatGenerator {
    pub fn new(config: &GenerationEndpointConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(std::time::Duration::from_secs(config.connect_timeout_secs))
            .timeout(std::time::Duration::from_secs(config.request_timeout_secs))
            .tcp_nodelay(true)
            .build()?;

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            model: config.model.clone(),
            api_key: config.api_key.clone(),
        })
    }

    fn build_request(&self, prompt: &str, options: &GenerationOptions, stream: bool) -> serde_json::Value {
        let mut request = json!({
            "model": self.model,
            "messages": [
                {"role": "user", "content": prompt}
            ],
            "max_tokens": options.max_tokens,
            "temperature": options.temperature,
            "stream": stream,
        });
        if !options.stop.is_empty() {
            request["stop"] = json!(options.stop);
        }
        request
    }
}

#[async_trait]
impl Generator for OpenAiCompatGenerator {
    async fn generate(&self, prompt: &str, options: &GenerationOptions) -> Result<String> {
        let request = self.build_request(prompt, options, false);

        let response = self
            .client
            .post(&self.endpoint)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    anyhow!("Request to {} timed out", self.endpoint)
                } else if e.is_connect() {
                    anyhow!("Failed to connect to {}: {}", self.endpoint, e)
                } else {
                    anyhow!("Request to {} failed: {}", self.endpoint, e)
                }
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(status = %status, body = %body, "Generator API error");
            return Err(anyhow!("Generator returned HTTP {}", status));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| anyhow!("Generator returned malformed JSON: {}", e))?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| anyhow!("Generator returned empty choices array"))
    }

    async fn generate_stream(
        &self,
        prompt: &str,
        options: &GenerationOptions,
    ) -> Result<TokenStream> {
        let (tx, rx) = mpsc::channel(100);

        let client = self.client.clone();
        let endpoint = self.endpoint.clone();
        let api_key = self.api_key.clone();
        let request = self.build_request(prompt, options, true);

        tokio::spawn(async move {
            stream_chat_completions(client, endpoint, api_key, request, tx).await;
        });

        Ok(TokenStream::new(rx))
    }
}

async fn stream_chat_completions(
    client: Client,
    endpoint: String,
    api_key: String,
    request: serde_json::Value,
    tx: mpsc::Sender<String>,
) {
    let response = match client
        .post(&endpoint)
        .header("Authorization", format!("Bearer {}", api_key))
        .header("Content-Type", "application/json")
        .json(&request)
        .send()
        .await
    {
        Ok(r) => r,
        Err(e) => {
            tracing::error!("Streaming request to {} failed: {}", endpoint, e);
            return;
        }
    };

    if !response.status().is_success() {
        tracing::error!("Streaming API error from {}: {}", endpoint, response.status());
        return;
    }

    let mut stream = response.bytes_stream();
    // SSE frames may split across chunk boundaries; keep a carry buffer.
    let mut buffer = String::new();

    while let Some(chunk_result) = stream.next().await {
        let chunk = match chunk_result {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!("Stream chunk error: {}", e);
                break;
            }
        };
        buffer.push_str(&String::from_utf8_lossy(&chunk));

        while let Some(newline) = buffer.find('\n') {
            let line = buffer[..newline].trim_end_matches('\r').to_string();
            buffer.drain(..=newline);

            let Some(data) = line.strip_prefix("data: ") else {
                continue;
            };
            if data == "[DONE]" {
                return;
            }
            if let Some(content) = extract_delta_content(data) {
                if tx.send(content).await.is_err() {
                    return;
                }
            }
        }
    }
}

/// Pull `choices[0].delta.content` out of one SSE data frame.
fn extract_delta_content(data: &str) -> Option<String> {
    let parsed: serde_json::Value = serde_json::from_str(data).ok()?;
    parsed
        .get("choices")?
        .as_array()?
        .first()?
        .get("delta")?
        .get("content")?
        .as_str()
        .map(String::from)
}
