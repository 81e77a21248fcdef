//! Embedding provider adapters.
//!
//! Concrete [`EmbeddingProvider`]s for the pipeline:
//! - **[`DisabledProvider`]**: every call fails permanently; used when
//!   `embedding.provider = "disabled"`.
//! - **[`OpenAIProvider`]**: `POST https://api.openai.com/v1/embeddings`.
//! - **[`OllamaProvider`]**: `POST <url>/api/embed` on a local Ollama.
//!
//! # Retry Strategy
//!
//! Retrying lives here, not in the processor. Each provider call makes up
//! to `max_retries + 1` attempts with exponential backoff (1s, 2s, 4s, ...
//! capped at 32s):
//! - HTTP 429 and 5xx, timeouts, connection errors: retry, then
//!   [`ProviderError::Transient`]
//! - other HTTP 4xx: no retry, [`ProviderError::Permanent`]
//! - a 2xx body that does not parse: [`ProviderError::Permanent`]

use anyhow::{bail, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

use chat_kb_core::embedding::EmbeddingProvider;
use chat_kb_core::error::ProviderError;

use crate::config::EmbeddingConfig;

const OPENAI_EMBEDDINGS_URL: &str = "https://api.openai.com/v1/embeddings";
const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";

/// Build the provider named by `config.provider`.
pub fn create_provider(config: &EmbeddingConfig) -> Result<Box<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "disabled" => Ok(Box::new(DisabledProvider)),
        "openai" => Ok(Box::new(OpenAIProvider::new(config)?)),
        "ollama" => Ok(Box::new(OllamaProvider::new(config)?)),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

// ============ Disabled Provider ============

pub struct DisabledProvider;

#[async_trait]
impl EmbeddingProvider for DisabledProvider {
    fn model_name(&self) -> &str {
        "disabled"
    }

    fn dims(&self) -> usize {
        0
    }

    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        Err(ProviderError::Permanent(
            "embedding provider is disabled".into(),
        ))
    }
}

// ============ Shared HTTP plumbing ============

fn http_client(config: &EmbeddingConfig) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()?)
}

fn required_model_and_dims(config: &EmbeddingConfig, provider: &str) -> Result<(String, usize)> {
    let model = config
        .model
        .clone()
        .ok_or_else(|| anyhow::anyhow!("embedding.model required for {} provider", provider))?;
    let dims = config
        .dims
        .ok_or_else(|| anyhow::anyhow!("embedding.dims required for {} provider", provider))?;
    Ok((model, dims))
}

/// Map a non-success HTTP status to a provider error.
fn classify_status(label: &str, status: StatusCode, body: &str) -> ProviderError {
    let message = format!("{} API error {}: {}", label, status, body);
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        ProviderError::Transient(message)
    } else if status.is_client_error() {
        ProviderError::Permanent(message)
    } else {
        ProviderError::Unknown(message)
    }
}

fn backoff(attempt: u32) -> Duration {
    Duration::from_secs(1 << (attempt - 1).min(5))
}

/// Send `request` with retries, returning the parsed JSON body.
async fn send_with_retry(
    label: &str,
    max_retries: u32,
    request: impl Fn() -> reqwest::RequestBuilder,
) -> Result<Value, ProviderError> {
    let mut last_err = None;

    for attempt in 0..=max_retries {
        if attempt > 0 {
            let delay = backoff(attempt);
            debug!(attempt, delay_secs = delay.as_secs(), "retrying {} embedding call", label);
            tokio::time::sleep(delay).await;
        }

        match request().send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    return response.json::<Value>().await.map_err(|e| {
                        ProviderError::Permanent(format!("{} returned invalid JSON: {}", label, e))
                    });
                }

                let body = response.text().await.unwrap_or_default();
                let err = classify_status(label, status, &body);
                if !err.is_transient() {
                    return Err(err);
                }
                warn!(attempt, %status, "{} embedding call failed; will retry", label);
                last_err = Some(err);
            }
            Err(e) => {
                warn!(attempt, error = %e, "{} embedding request failed; will retry", label);
                last_err = Some(ProviderError::Transient(format!(
                    "{} request failed: {}",
                    label, e
                )));
            }
        }
    }

    Err(last_err.unwrap_or_else(|| {
        ProviderError::Unknown(format!("{} embedding failed after retries", label))
    }))
}

fn parse_vector(value: &Value, label: &str) -> Result<Vec<f32>, ProviderError> {
    value
        .as_array()
        .ok_or_else(|| ProviderError::Permanent(format!("Invalid {} response: embedding is not an array", label)))?
        .iter()
        .map(|v| {
            v.as_f64().map(|f| f as f32).ok_or_else(|| {
                ProviderError::Permanent(format!("Invalid {} response: non-numeric component", label))
            })
        })
        .collect()
}

// ============ OpenAI Provider ============

pub struct OpenAIProvider {
    client: reqwest::Client,
    api_key: String,
    model: String,
    dims: usize,
    max_retries: u32,
}

impl OpenAIProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let (model, dims) = required_model_and_dims(config, "OpenAI")?;
        let api_key = match std::env::var("OPENAI_API_KEY") {
            Ok(key) if !key.is_empty() => key,
            _ => bail!("OPENAI_API_KEY environment variable not set"),
        };

        Ok(Self {
            client: http_client(config)?,
            api_key,
            model,
            dims,
            max_retries: config.max_retries,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAIProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let json = send_with_retry("OpenAI", self.max_retries, || {
            self.client
                .post(OPENAI_EMBEDDINGS_URL)
                .bearer_auth(&self.api_key)
                .json(&body)
        })
        .await?;

        parse_openai_response(&json)
    }
}

/// Extract vectors from an OpenAI response, ordered by each item's `index`.
fn parse_openai_response(json: &Value) -> Result<Vec<Vec<f32>>, ProviderError> {
    let data = json.get("data").and_then(|d| d.as_array()).ok_or_else(|| {
        ProviderError::Permanent("Invalid OpenAI response: missing data array".into())
    })?;

    let mut indexed = Vec::with_capacity(data.len());
    for (position, item) in data.iter().enumerate() {
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map_or(position, |i| i as usize);
        let embedding = item.get("embedding").ok_or_else(|| {
            ProviderError::Permanent("Invalid OpenAI response: missing embedding".into())
        })?;
        indexed.push((index, parse_vector(embedding, "OpenAI")?));
    }

    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

// ============ Ollama Provider ============

pub struct OllamaProvider {
    client: reqwest::Client,
    url: String,
    model: String,
    dims: usize,
    max_retries: u32,
}

impl OllamaProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let (model, dims) = required_model_and_dims(config, "Ollama")?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| DEFAULT_OLLAMA_URL.to_string());

        Ok(Self {
            client: http_client(config)?,
            url: url.trim_end_matches('/').to_string(),
            model,
            dims,
            max_retries: config.max_retries,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        let endpoint = format!("{}/api/embed", self.url);

        let json = send_with_retry("Ollama", self.max_retries, || {
            self.client.post(&endpoint).json(&body)
        })
        .await?;

        parse_ollama_response(&json)
    }
}

fn parse_ollama_response(json: &Value) -> Result<Vec<Vec<f32>>, ProviderError> {
    json.get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| {
            ProviderError::Permanent("Invalid Ollama response: missing embeddings array".into())
        })?
        .iter()
        .map(|v| parse_vector(v, "Ollama"))
        .collect()
}
