use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub generator: GeneratorConfig,
    pub server: ServerConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_chunk_chars")]
    pub max_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chars: default_max_chunk_chars(),
        }
    }
}

fn default_max_chunk_chars() -> usize {
    2000
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
        }
    }
}

fn default_top_k() -> usize {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// `openai`, `ollama`, or `hash` (deterministic local feature hashing,
    /// intended for development and tests).
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_dims")]
    pub dims: usize,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: None,
            dims: default_dims(),
            base_url: None,
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_embedding_provider() -> String {
    "hash".to_string()
}
fn default_dims() -> usize {
    384
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct GeneratorConfig {
    /// Default provider when an API key has no per-key override:
    /// `groq`, `openai`, or `ollama`.
    #[serde(default = "default_generator_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_generator_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            provider: default_generator_provider(),
            model: None,
            base_url: None,
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            timeout_secs: default_generator_timeout_secs(),
        }
    }
}

fn default_generator_provider() -> String {
    "groq".to_string()
}
fn default_max_tokens() -> u32 {
    512
}
fn default_temperature() -> f32 {
    0.7
}
fn default_generator_timeout_secs() -> u64 {
    120
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LimitsConfig {
    /// Hard, plan-independent ceiling on a single ingestion payload.
    #[serde(default = "default_max_single_upload_chars")]
    pub max_single_upload_chars: i64,
    /// Fixed rate-limit window length in seconds.
    #[serde(default = "default_rate_window_secs")]
    pub rate_window_secs: i64,
    /// Assumed output size when pre-checking quota for streaming chat.
    #[serde(default = "default_stream_output_budget_chars")]
    pub stream_output_budget_chars: i64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_single_upload_chars: default_max_single_upload_chars(),
            rate_window_secs: default_rate_window_secs(),
            stream_output_budget_chars: default_stream_output_budget_chars(),
        }
    }
}

fn default_max_single_upload_chars() -> i64 {
    500_000
}
fn default_rate_window_secs() -> i64 {
    60
}
fn default_stream_output_budget_chars() -> i64 {
    512
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.chunking.max_chars == 0 {
        anyhow::bail!("chunking.max_chars must be > 0");
    }

    if config.retrieval.top_k == 0 {
        anyhow::bail!("retrieval.top_k must be >= 1");
    }

    if config.embedding.dims == 0 {
        anyhow::bail!("embedding.dims must be > 0");
    }

    match config.embedding.provider.as_str() {
        "hash" | "openai" | "ollama" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be hash, openai, or ollama.",
            other
        ),
    }

    if config.embedding.provider != "hash" && config.embedding.model.is_none() {
        anyhow::bail!(
            "embedding.model must be specified when provider is '{}'",
            config.embedding.provider
        );
    }

    match config.generator.provider.as_str() {
        "groq" | "openai" | "ollama" => {}
        other => anyhow::bail!(
            "Unknown generator provider: '{}'. Must be groq, openai, or ollama.",
            other
        ),
    }

    if config.limits.max_single_upload_chars <= 0 {
        anyhow::bail!("limits.max_single_upload_chars must be > 0");
    }
    if config.limits.rate_window_secs <= 0 {
        anyhow::bail!("limits.rate_window_secs must be > 0");
    }

    Ok(config)
}
