//! Service error taxonomy.
//!
//! Every fallible operation in the pipeline returns [`ServiceError`].
//! Variants are distinguishable by the caller: a quota rejection, a rate
//! limit, a duplicate, and an upstream failure each carry a stable
//! machine code so clients can branch without parsing messages.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ServiceError>;

/// Which metered resource a quota rejection names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaKind {
    Ingestion,
    Storage,
    ChatTokens,
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{0}")]
    Validation(String),

    #[error("invalid or inactive API key")]
    Unauthorized,

    #[error("document already exists as '{0}'")]
    DuplicateDocument(String),

    #[error("{message}")]
    QuotaExceeded { kind: QuotaKind, message: String },

    #[error("rate limit of {limit} requests per {window_secs}s exceeded")]
    RateLimited { limit: i64, window_secs: i64 },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("tenant is not fully configured: {0}")]
    NotConfigured(String),

    #[error("upstream provider error: {0}")]
    Upstream(String),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),
}

impl ServiceError {
    pub fn quota(kind: QuotaKind, message: impl Into<String>) -> Self {
        ServiceError::QuotaExceeded {
            kind,
            message: message.into(),
        }
    }

    /// Stable machine-readable code carried in every error response body.
    pub fn code(&self) -> &'static str {
        match self {
            ServiceError::Validation(_) => "validation_error",
            ServiceError::Unauthorized => "unauthorized",
            ServiceError::DuplicateDocument(_) => "duplicate_document",
            ServiceError::QuotaExceeded { kind, .. } => match kind {
                QuotaKind::Ingestion => "quota_ingestion",
                QuotaKind::Storage => "quota_storage",
                QuotaKind::ChatTokens => "quota_chat_tokens",
            },
            ServiceError::RateLimited { .. } => "rate_limited",
            ServiceError::NotFound(_) => "not_found",
            ServiceError::NotConfigured(_) => "not_configured",
            ServiceError::Upstream(_) => "upstream_error",
            ServiceError::Storage(_) => "storage_error",
        }
    }
}
