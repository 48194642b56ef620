//! Embedding provider abstraction.
//!
//! The [`Embedder`] trait hides the embedding model behind a
//! deterministic `text -> fixed-length vector` contract. Implementations:
//!
//! - **[`HashEmbedder`]** — local feature hashing over character trigrams;
//!   fully deterministic and offline, meant for development and tests.
//! - **[`OpenAiEmbedder`]** — `POST /v1/embeddings` with batching and
//!   exponential backoff on 429/5xx.
//! - **[`OllamaEmbedder`]** — a local Ollama instance's `/api/embed`.
//!
//! Also provides the BLOB codec and cosine similarity used by the SQLite
//! vector store.

use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;

use crate::config::EmbeddingConfig;
use crate::error::{Result, ServiceError};

#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embedding vector dimensionality.
    fn dims(&self) -> usize;

    /// Embed a batch of texts, one vector per input, in order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Embed a single query text.
    async fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed(std::slice::from_ref(&text.to_string())).await?;
        vectors
            .pop()
            .ok_or_else(|| ServiceError::Upstream("empty embedding response".to_string()))
    }
}

/// Instantiate the configured provider.
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Box<dyn Embedder>> {
    match config.provider.as_str() {
        "hash" => Ok(Box::new(HashEmbedder::new(config.dims))),
        "openai" => Ok(Box::new(OpenAiEmbedder::from_config(config)?)),
        "ollama" => Ok(Box::new(OllamaEmbedder::from_config(config)?)),
        other => Err(ServiceError::Upstream(format!(
            "unknown embedding provider: {}",
            other
        ))),
    }
}

// ============ Vector utilities ============

/// Encode a float vector as little-endian f32 bytes for BLOB storage.
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity in `[-1.0, 1.0]`; `0.0` for empty or mismatched vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

// ============ Hash provider ============

/// Deterministic local embedder: character trigrams feature-hashed into a
/// fixed-width L2-normalized vector. Identical input always yields an
/// identical vector, and texts sharing vocabulary land near each other.
/// That is enough signal for development and tests without a model download.
pub struct HashEmbedder {
    dims: usize,
}

impl HashEmbedder {
    pub fn new(dims: usize) -> Self {
        Self { dims }
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let vectors = texts
            .iter()
            .map(|text| {
                let mut v = vec![0.0f32; self.dims];
                let lowered = text.to_lowercase();
                let chars: Vec<char> = lowered.chars().collect();
                for window in chars.windows(3) {
                    let gram: String = window.iter().collect();
                    let idx = (fnv1a(gram.as_bytes()) % self.dims as u64) as usize;
                    v[idx] += 1.0;
                }
                let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
                if norm > f32::EPSILON {
                    for x in &mut v {
                        *x /= norm;
                    }
                }
                v
            })
            .collect();
        Ok(vectors)
    }
}

// ============ HTTP providers ============

/// Shared retry loop: 429 and 5xx back off exponentially (1s, 2s, 4s...);
/// other 4xx fail immediately.
async fn post_with_retry(
    client: &reqwest::Client,
    url: &str,
    auth_header: Option<&str>,
    body: serde_json::Value,
    max_retries: u32,
) -> Result<serde_json::Value> {
    let mut attempt = 0u32;
    loop {
        let mut request = client.post(url).json(&body);
        if let Some(auth) = auth_header {
            request = request.header("Authorization", auth);
        }

        match request.send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    return response
                        .json()
                        .await
                        .map_err(|e| ServiceError::Upstream(e.to_string()));
                }
                let retryable = status.as_u16() == 429 || status.is_server_error();
                if !retryable || attempt >= max_retries {
                    let text = response.text().await.unwrap_or_default();
                    return Err(ServiceError::Upstream(format!(
                        "{} returned {}: {}",
                        url, status, text
                    )));
                }
            }
            Err(e) => {
                if attempt >= max_retries {
                    return Err(ServiceError::Upstream(e.to_string()));
                }
            }
        }

        let backoff = Duration::from_secs(1 << attempt.min(5));
        tokio::time::sleep(backoff).await;
        attempt += 1;
    }
}

/// OpenAI embeddings API provider. Requires `OPENAI_API_KEY`.
pub struct OpenAiEmbedder {
    client: reqwest::Client,
    url: String,
    api_key: String,
    model: String,
    dims: usize,
    max_retries: u32,
}

impl OpenAiEmbedder {
    pub fn from_config(config: &EmbeddingConfig) -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY").map_err(|_| {
            ServiceError::Upstream("OPENAI_API_KEY not set in environment".to_string())
        })?;
        let base = config
            .base_url
            .clone()
            .unwrap_or_else(|| "https://api.openai.com".to_string());
        let model = config
            .model
            .clone()
            .unwrap_or_else(|| "text-embedding-3-small".to_string());

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ServiceError::Upstream(e.to_string()))?;

        Ok(Self {
            client,
            url: format!("{}/v1/embeddings", base.trim_end_matches('/')),
            api_key,
            model,
            dims: config.dims,
            max_retries: config.max_retries,
        })
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let auth = format!("Bearer {}", self.api_key);
        let body = json!({ "model": self.model, "input": texts });
        let response =
            post_with_retry(&self.client, &self.url, Some(&auth), body, self.max_retries).await?;

        let data = response["data"]
            .as_array()
            .ok_or_else(|| ServiceError::Upstream("malformed embeddings response".to_string()))?;

        data.iter()
            .map(|item| {
                item["embedding"]
                    .as_array()
                    .map(|values| {
                        values
                            .iter()
                            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
                            .collect()
                    })
                    .ok_or_else(|| {
                        ServiceError::Upstream("embedding item missing vector".to_string())
                    })
            })
            .collect()
    }
}

/// Ollama `/api/embed` provider for local models.
pub struct OllamaEmbedder {
    client: reqwest::Client,
    url: String,
    model: String,
    dims: usize,
    max_retries: u32,
}

impl OllamaEmbedder {
    pub fn from_config(config: &EmbeddingConfig) -> Result<Self> {
        let base = config
            .base_url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string());
        let model = config.model.clone().ok_or_else(|| {
            ServiceError::Upstream("embedding.model required for ollama".to_string())
        })?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ServiceError::Upstream(e.to_string()))?;

        Ok(Self {
            client,
            url: format!("{}/api/embed", base.trim_end_matches('/')),
            model,
            dims: config.dims,
            max_retries: config.max_retries,
        })
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = json!({ "model": self.model, "input": texts });
        let response =
            post_with_retry(&self.client, &self.url, None, body, self.max_retries).await?;

        let embeddings = response["embeddings"]
            .as_array()
            .ok_or_else(|| ServiceError::Upstream("malformed embed response".to_string()))?;

        Ok(embeddings
            .iter()
            .map(|item| {
                item.as_array()
                    .map(|values| {
                        values
                            .iter()
                            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
                            .collect()
                    })
                    .unwrap_or_default()
            })
            .collect())
    }
}
