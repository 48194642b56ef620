//! Core data models.
//!
//! These types mirror the relational rows that flow through the metering,
//! ingestion, and retrieval pipeline. Timestamps are Unix seconds (UTC).

use serde::Serialize;

/// The billing and isolation unit. Owns API keys, documents, one usage
/// record, and one plan assignment.
#[derive(Debug, Clone)]
pub struct Tenant {
    pub id: String,
    pub email: String,
    pub is_active: bool,
    pub created_at: i64,
}

/// A credential scoped to one tenant. Only the SHA-256 hash of the raw
/// secret is ever persisted.
#[derive(Debug, Clone)]
pub struct ApiKey {
    pub id: String,
    pub tenant_id: String,
    /// Optional per-key generator provider override (`groq`, `openai`, `ollama`).
    pub generator: Option<String>,
    pub is_active: bool,
    pub created_at: i64,
}

/// A named subscription tier. Immutable reference data.
#[derive(Debug, Clone, Serialize)]
pub struct Plan {
    pub id: String,
    pub name: String,
    /// Chars ingested per billing period.
    pub max_ingested_chars: i64,
    /// Total knowledge-base size, a high-water mark.
    pub max_stored_chars: i64,
    /// Chat tokens per billing period.
    pub max_chat_tokens: i64,
    /// Advisory request-rate ceiling.
    pub requests_per_minute: i64,
}

/// Per-tenant running counters. Reset only by the billing-period rollover
/// (ingested_chars, chat_tokens) or document deletion (stored_chars).
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct Usage {
    pub ingested_chars: i64,
    pub stored_chars: i64,
    pub chat_tokens: i64,
}

/// A committed document owned by one API key.
#[derive(Debug, Clone, Serialize)]
pub struct Document {
    pub id: String,
    pub api_key_id: String,
    pub filename: String,
    /// SHA-256 hex of the full extracted text, used for duplicate detection.
    pub fingerprint: String,
    pub char_count: i64,
    pub chunk_count: i64,
    pub created_at: i64,
}
