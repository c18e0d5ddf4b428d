//! Embedding providers.
//!
//! Implements [`Embedder`] for each configured backend:
//!
//! | `embedding.provider` | Type | Notes |
//! |----------------------|------|-------|
//! | `disabled` | [`DisabledEmbedder`] | every call fails with [`EmbeddingError::Disabled`] |
//! | `hash` | [`HashEmbedder`] | offline feature hashing, no model |
//! | `openai` | [`OpenAiEmbedder`] | `POST {url}/embeddings`, needs `OPENAI_API_KEY` |
//! | `ollama` | [`OllamaEmbedder`] | `POST {url}/api/embed` on a local Ollama |
//! | `fastembed` | `FastEmbedder` | ONNX models in-process, behind the `local-embeddings-fastembed` feature |
//!
//! [`create_embedder`] wraps the chosen backend in a [`ResilientEmbedder`],
//! which bounds every call with a timeout and retries transient failures:
//!
//! - HTTP 429, 5xx, network errors, timeouts → retry with exponential backoff
//! - other HTTP 4xx, malformed responses, dimension mismatches → fail at once
//! - backoff: `backoff_ms × 2^(attempt-1)`, exponent capped at 5

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use folio_core::embedding::{Embedder, HashEmbedder};
use folio_core::error::EmbeddingError;

use crate::config::EmbeddingConfig;

const DEFAULT_HASH_DIMS: usize = 256;
const DEFAULT_OPENAI_URL: &str = "https://api.openai.com/v1";
const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";

// ============ Disabled ============

pub struct DisabledEmbedder;

#[async_trait]
impl Embedder for DisabledEmbedder {
    fn model_name(&self) -> &str {
        "disabled"
    }
    fn dims(&self) -> usize {
        0
    }
    async fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbeddingError> {
        Err(EmbeddingError::Disabled)
    }
}

// ============ Retry and timeout ============

/// Adds a per-attempt timeout and bounded retries to any [`Embedder`].
pub struct ResilientEmbedder {
    inner: Arc<dyn Embedder>,
    timeout: Duration,
    max_retries: u32,
    backoff: Duration,
}

impl ResilientEmbedder {
    pub fn new(
        inner: Arc<dyn Embedder>,
        timeout: Duration,
        max_retries: u32,
        backoff: Duration,
    ) -> Self {
        Self {
            inner,
            timeout,
            max_retries,
            backoff,
        }
    }

    fn delay(&self, attempt: u32) -> Duration {
        self.backoff * (1u32 << (attempt - 1).min(5))
    }

    async fn with_retry<F, Fut>(&self, what: &str, call: F) -> Result<Vec<Vec<f32>>, EmbeddingError>
    where
        F: Fn() -> Fut + Send,
        Fut: std::future::Future<Output = Result<Vec<Vec<f32>>, EmbeddingError>> + Send,
    {
        let mut last = EmbeddingError::Unavailable("no attempt made".to_string());
        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = self.delay(attempt);
                debug!(attempt, ?delay, "retrying {}", what);
                tokio::time::sleep(delay).await;
            }

            let result = match tokio::time::timeout(self.timeout, call()).await {
                Ok(r) => r,
                Err(_) => Err(EmbeddingError::Timeout(self.timeout)),
            };

            match result {
                Ok(vectors) => {
                    let dims = self.inner.dims();
                    if let Some(bad) = vectors.iter().find(|v| v.len() != dims) {
                        return Err(EmbeddingError::Dimension {
                            expected: dims,
                            actual: bad.len(),
                        });
                    }
                    return Ok(vectors);
                }
                Err(e) if e.is_transient() => {
                    warn!(attempt, error = %e, "{} failed", what);
                    last = e;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last)
    }
}

#[async_trait]
impl Embedder for ResilientEmbedder {
    fn model_name(&self) -> &str {
        self.inner.model_name()
    }

    fn dims(&self) -> usize {
        self.inner.dims()
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let mut out = self
            .with_retry("embedding", || async move {
                self.inner.embed(text).await.map(|v| vec![v])
            })
            .await?;
        out.pop()
            .ok_or_else(|| EmbeddingError::Rejected("empty embedding response".to_string()))
    }

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let mut out = self
            .with_retry("query embedding", || async move {
                self.inner.embed_query(text).await.map(|v| vec![v])
            })
            .await?;
        out.pop()
            .ok_or_else(|| EmbeddingError::Rejected("empty embedding response".to_string()))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let vectors = self
            .with_retry("batch embedding", || self.inner.embed_batch(texts))
            .await?;
        if vectors.len() != texts.len() {
            return Err(EmbeddingError::Rejected(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                vectors.len()
            )));
        }
        Ok(vectors)
    }
}

// ============ HTTP helpers ============

fn http_client() -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder().build()?)
}

/// Map a non-success HTTP status to an error: 429 and 5xx are transient.
fn status_error(provider: &str, status: reqwest::StatusCode, body: &str) -> EmbeddingError {
    let message = format!("{} API error {}: {}", provider, status, body);
    if status.as_u16() == 429 || status.is_server_error() {
        EmbeddingError::Unavailable(message)
    } else {
        EmbeddingError::Rejected(message)
    }
}

async fn post_json(
    provider: &str,
    request: reqwest::RequestBuilder,
    body: &serde_json::Value,
) -> Result<serde_json::Value, EmbeddingError> {
    let response = request
        .json(body)
        .send()
        .await
        .map_err(|e| EmbeddingError::Unavailable(format!("{} connection error: {}", provider, e)))?;

    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        return Err(status_error(provider, status, &text));
    }
    response
        .json()
        .await
        .map_err(|e| EmbeddingError::Unavailable(format!("{} response error: {}", provider, e)))
}

fn json_vector(value: &serde_json::Value) -> Option<Vec<f32>> {
    value
        .as_array()
        .map(|arr| arr.iter().map(|v| v.as_f64().unwrap_or(0.0) as f32).collect())
}

// ============ OpenAI ============

/// OpenAI-compatible embeddings endpoint.
pub struct OpenAiEmbedder {
    client: reqwest::Client,
    api_key: String,
    url: String,
    model: String,
    dims: usize,
}

impl OpenAiEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for OpenAI provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for OpenAI provider"))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| DEFAULT_OPENAI_URL.to_string());

        Ok(Self {
            client: http_client()?,
            api_key,
            url: url.trim_end_matches('/').to_string(),
            model,
            dims,
        })
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let mut out = self.embed_batch(&[text.to_string()]).await?;
        out.pop()
            .ok_or_else(|| EmbeddingError::Rejected("empty OpenAI response".to_string()))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let body = serde_json::json!({ "model": self.model, "input": texts });
        let request = self
            .client
            .post(format!("{}/embeddings", self.url))
            .bearer_auth(&self.api_key);
        let json = post_json("OpenAI", request, &body).await?;
        parse_openai_response(&json)
    }
}

/// Extract `data[].embedding`, ordered by each item's `index`.
fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| EmbeddingError::Rejected("invalid OpenAI response: missing data".into()))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (pos, item) in data.iter().enumerate() {
        let vector = item.get("embedding").and_then(json_vector).ok_or_else(|| {
            EmbeddingError::Rejected("invalid OpenAI response: missing embedding".into())
        })?;
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(pos);
        indexed.push((index, vector));
    }
    indexed.sort_by_key(|(i, _)| *i);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

// ============ Ollama ============

/// Local Ollama instance.
pub struct OllamaEmbedder {
    client: reqwest::Client,
    url: String,
    model: String,
    dims: usize,
}

impl OllamaEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for Ollama provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for Ollama provider"))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| DEFAULT_OLLAMA_URL.to_string());

        Ok(Self {
            client: http_client()?,
            url: url.trim_end_matches('/').to_string(),
            model,
            dims,
        })
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let mut out = self.embed_batch(&[text.to_string()]).await?;
        out.pop()
            .ok_or_else(|| EmbeddingError::Rejected("empty Ollama response".to_string()))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let body = serde_json::json!({ "model": self.model, "input": texts });
        let request = self.client.post(format!("{}/api/embed", self.url));
        let json = post_json("Ollama", request, &body).await?;
        parse_ollama_response(&json)
    }
}

fn parse_ollama_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    let embeddings = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| {
            EmbeddingError::Rejected("invalid Ollama response: missing embeddings".into())
        })?;

    embeddings
        .iter()
        .map(|e| {
            json_vector(e).ok_or_else(|| {
                EmbeddingError::Rejected(
                    "invalid Ollama response: embedding is not an array".into(),
                )
            })
        })
        .collect()
}

// ============ fastembed ============

#[cfg(feature = "local-embeddings-fastembed")]
mod local {
    use super::*;
    use std::sync::Mutex;

    /// In-process ONNX embedding via fastembed. The model is downloaded on
    /// first use and cached; afterwards no network is needed.
    pub struct FastEmbedder {
        model: Arc<Mutex<fastembed::TextEmbedding>>,
        name: String,
        dims: usize,
        /// E5 models expect `query: ` / `passage: ` prefixes.
        e5: bool,
    }

    impl FastEmbedder {
        pub fn new(config: &EmbeddingConfig) -> Result<Self> {
            let name = config
                .model
                .clone()
                .unwrap_or_else(|| "multilingual-e5-small".to_string());
            let (kind, default_dims) = model_for_name(&name)?;
            let model = fastembed::TextEmbedding::try_new(
                fastembed::InitOptions::new(kind).with_show_download_progress(true),
            )
            .map_err(|e| anyhow::anyhow!("Failed to initialize local embedding model: {}", e))?;

            Ok(Self {
                model: Arc::new(Mutex::new(model)),
                e5: name.contains("e5"),
                dims: config.dims.unwrap_or(default_dims),
                name,
            })
        }

        async fn run(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            let model = self.model.clone();
            tokio::task::spawn_blocking(move || {
                let mut guard = model
                    .lock()
                    .map_err(|_| EmbeddingError::Unavailable("embedding model poisoned".into()))?;
                guard
                    .embed(texts, None)
                    .map_err(|e| EmbeddingError::Rejected(format!("local embedding failed: {}", e)))
            })
            .await
            .map_err(|e| EmbeddingError::Unavailable(format!("embedding worker failed: {}", e)))?
        }

        fn prefixed(&self, prefix: &str, text: &str) -> String {
            if self.e5 {
                format!("{}{}", prefix, text)
            } else {
                text.to_string()
            }
        }
    }

    fn model_for_name(name: &str) -> Result<(fastembed::EmbeddingModel, usize)> {
        use fastembed::EmbeddingModel as M;
        Ok(match name {
            "all-minilm-l6-v2" => (M::AllMiniLML6V2, 384),
            "bge-small-en-v1.5" => (M::BGESmallENV15, 384),
            "bge-base-en-v1.5" => (M::BGEBaseENV15, 768),
            "nomic-embed-text-v1.5" => (M::NomicEmbedTextV15, 768),
            "multilingual-e5-small" => (M::MultilingualE5Small, 384),
            "multilingual-e5-base" => (M::MultilingualE5Base, 768),
            "multilingual-e5-large" => (M::MultilingualE5Large, 1024),
            other => bail!(
                "Unknown local embedding model: '{}'. Supported models: \
                 all-minilm-l6-v2, bge-small-en-v1.5, bge-base-en-v1.5, nomic-embed-text-v1.5, \
                 multilingual-e5-small, multilingual-e5-base, multilingual-e5-large",
                other
            ),
        })
    }

    #[async_trait]
    impl Embedder for FastEmbedder {
        fn model_name(&self) -> &str {
            &self.name
        }
        fn dims(&self) -> usize {
            self.dims
        }

        async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
            let mut out = self.run(vec![self.prefixed("passage: ", text)]).await?;
            out.pop()
                .ok_or_else(|| EmbeddingError::Rejected("empty local embedding".into()))
        }

        async fn embed_query(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
            let mut out = self.run(vec![self.prefixed("query: ", text)]).await?;
            out.pop()
                .ok_or_else(|| EmbeddingError::Rejected("empty local embedding".into()))
        }

        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            let inputs = texts.iter().map(|t| self.prefixed("passage: ", t)).collect();
            self.run(inputs).await
        }
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
pub use local::FastEmbedder;

/// Build the configured embedder, wrapped with timeout and retry.
///
/// # Errors
///
/// Unknown provider names, missing model or dims for HTTP providers, a
/// missing `OPENAI_API_KEY`, or `fastembed` without its cargo feature.
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>> {
    let inner: Arc<dyn Embedder> = match config.provider.as_str() {
        "disabled" => return Ok(Arc::new(DisabledEmbedder)),
        "hash" => Arc::new(HashEmbedder::new(config.dims.unwrap_or(DEFAULT_HASH_DIMS))),
        "openai" => Arc::new(OpenAiEmbedder::new(config)?),
        "ollama" => Arc::new(OllamaEmbedder::new(config)?),
        #[cfg(feature = "local-embeddings-fastembed")]
        "fastembed" => Arc::new(FastEmbedder::new(config)?),
        #[cfg(not(feature = "local-embeddings-fastembed"))]
        "fastembed" => bail!(
            "The fastembed provider requires building with --features local-embeddings-fastembed"
        ),
        other => bail!("Unknown embedding provider: {}", other),
    };

    Ok(Arc::new(ResilientEmbedder::new(
        inner,
        config.timeout(),
        config.max_retries,
        config.backoff(),
    )))
}
