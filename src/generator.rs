//! Text generation providers.
//!
//! The [`Generator`] trait treats the language model as a black box:
//! `prompt -> text`, blocking or as a finite, non-restartable fragment
//! stream. Provider failure surfaces as `Upstream`, distinct from quota
//! and validation errors.
//!
//! Providers are selected once per request, from the API key's per-key
//! override or the configured default, and passed by value into the
//! orchestrator.

use async_trait::async_trait;
use futures::stream::Stream;
use futures::StreamExt;
use serde_json::json;
use std::pin::Pin;
use std::time::Duration;

use crate::config::GeneratorConfig;
use crate::error::{Result, ServiceError};

/// Finite stream of generated text fragments. Dropping it cancels the
/// underlying request.
pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String>;
    async fn generate_stream(&self, prompt: &str) -> Result<FragmentStream>;
}

/// Instantiate a provider by name: the key's override if present,
/// otherwise the configured default.
pub fn create_generator(
    name: Option<&str>,
    config: &GeneratorConfig,
) -> Result<Box<dyn Generator>> {
    let name = name.unwrap_or(&config.provider);
    match name {
        "groq" => {
            let api_key = require_env("GROQ_API_KEY")?;
            Ok(Box::new(OpenAiCompatGenerator::new(
                config
                    .base_url
                    .clone()
                    .unwrap_or_else(|| "https://api.groq.com/openai".to_string()),
                api_key,
                config
                    .model
                    .clone()
                    .unwrap_or_else(|| "llama-3.3-70b-versatile".to_string()),
                config,
            )?))
        }
        "openai" => {
            let api_key = require_env("OPENAI_API_KEY")?;
            Ok(Box::new(OpenAiCompatGenerator::new(
                config
                    .base_url
                    .clone()
                    .unwrap_or_else(|| "https://api.openai.com".to_string()),
                api_key,
                config
                    .model
                    .clone()
                    .unwrap_or_else(|| "gpt-4o-mini".to_string()),
                config,
            )?))
        }
        "ollama" => Ok(Box::new(OllamaGenerator::new(
            config
                .base_url
                .clone()
                .unwrap_or_else(|| "http://localhost:11434".to_string()),
            config.model.clone().unwrap_or_else(|| "llama3".to_string()),
            config,
        )?)),
        other => Err(ServiceError::Upstream(format!(
            "unknown generator provider: {}",
            other
        ))),
    }
}

fn require_env(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| ServiceError::Upstream(format!("{} not set in environment", name)))
}

fn build_client(timeout_secs: u64) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| ServiceError::Upstream(e.to_string()))
}

// ============ OpenAI-compatible chat completions (Groq, OpenAI) ============

pub struct OpenAiCompatGenerator {
    client: reqwest::Client,
    url: String,
    api_key: String,
    model: String,
    max_tokens: u32,
    temperature: f32,
}

impl OpenAiCompatGenerator {
    fn new(base_url: String, api_key: String, model: String, config: &GeneratorConfig) -> Result<Self> {
        Ok(Self {
            client: build_client(config.timeout_secs)?,
            url: format!("{}/v1/chat/completions", base_url.trim_end_matches('/')),
            api_key,
            model,
            max_tokens: config.max_tokens,
            temperature: config.temperature,
        })
    }

    fn request_body(&self, prompt: &str, stream: bool) -> serde_json::Value {
        json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": prompt }],
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
            "stream": stream,
        })
    }

    async fn send(&self, prompt: &str, stream: bool) -> Result<reqwest::Response> {
        let response = self
            .client
            .post(&self.url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&self.request_body(prompt, stream))
            .send()
            .await
            .map_err(|e| ServiceError::Upstream(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ServiceError::Upstream(format!(
                "generator returned {}: {}",
                status, text
            )));
        }
        Ok(response)
    }
}

#[async_trait]
impl Generator for OpenAiCompatGenerator {
    async fn generate(&self, prompt: &str) -> Result<String> {
        let response = self.send(prompt, false).await?;
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ServiceError::Upstream(e.to_string()))?;

        body["choices"][0]["message"]["content"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| ServiceError::Upstream("malformed completion response".to_string()))
    }

    async fn generate_stream(&self, prompt: &str) -> Result<FragmentStream> {
        let response = self.send(prompt, true).await?;
        let mut bytes = response.bytes_stream();

        // Server-sent `data:` frames, one JSON delta per line, terminated
        // by `data: [DONE]`.
        let stream = async_stream::stream! {
            let mut buffer = String::new();
            while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        yield Err(ServiceError::Upstream(e.to_string()));
                        return;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&chunk));

                while let Some(newline) = buffer.find('\n') {
                    let line = buffer[..newline].trim().to_string();
                    buffer.drain(..=newline);

                    let Some(payload) = line.strip_prefix("data:") else {
                        continue;
                    };
                    let payload = payload.trim();
                    if payload == "[DONE]" {
                        return;
                    }
                    match serde_json::from_str::<serde_json::Value>(payload) {
                        Ok(value) => {
                            if let Some(content) = value["choices"][0]["delta"]["content"].as_str()
                            {
                                if !content.is_empty() {
                                    yield Ok(content.to_string());
                                }
                            }
                        }
                        Err(e) => {
                            yield Err(ServiceError::Upstream(format!(
                                "bad stream frame: {}",
                                e
                            )));
                            return;
                        }
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }
}

// ============ Ollama ============

pub struct OllamaGenerator {
    client: reqwest::Client,
    url: String,
    model: String,
}

impl OllamaGenerator {
    fn new(base_url: String, model: String, config: &GeneratorConfig) -> Result<Self> {
        Ok(Self {
            client: build_client(config.timeout_secs)?,
            url: format!("{}/api/generate", base_url.trim_end_matches('/')),
            model,
        })
    }

    async fn send(&self, prompt: &str, stream: bool) -> Result<reqwest::Response> {
        let response = self
            .client
            .post(&self.url)
            .json(&json!({
                "model": self.model,
                "prompt": prompt,
                "stream": stream,
            }))
            .send()
            .await
            .map_err(|e| ServiceError::Upstream(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ServiceError::Upstream(format!(
                "ollama returned {}: {}",
                status, text
            )));
        }
        Ok(response)
    }
}

#[async_trait]
impl Generator for OllamaGenerator {
    async fn generate(&self, prompt: &str) -> Result<String> {
        let response = self.send(prompt, false).await?;
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ServiceError::Upstream(e.to_string()))?;

        body["response"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| ServiceError::Upstream("malformed ollama response".to_string()))
    }

    async fn generate_stream(&self, prompt: &str) -> Result<FragmentStream> {
        let response = self.send(prompt, true).await?;
        let mut bytes = response.bytes_stream();

        // Ollama streams newline-delimited JSON objects ending with
        // `"done": true`.
        let stream = async_stream::stream! {
            let mut buffer = String::new();
            while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        yield Err(ServiceError::Upstream(e.to_string()));
                        return;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&chunk));

                while let Some(newline) = buffer.find('\n') {
                    let line = buffer[..newline].trim().to_string();
                    buffer.drain(..=newline);
                    if line.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<serde_json::Value>(&line) {
                        Ok(value) => {
                            if let Some(fragment) = value["response"].as_str() {
                                if !fragment.is_empty() {
                                    yield Ok(fragment.to_string());
                                }
                            }
                            if value["done"].as_bool() == Some(true) {
                                return;
                            }
                        }
                        Err(e) => {
                            yield Err(ServiceError::Upstream(format!(
                                "bad stream frame: {}",
                                e
                            )));
                            return;
                        }
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }
}
