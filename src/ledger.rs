//! Usage ledger.
//!
//! Durable per-tenant counters with atomic read-modify-write semantics.
//! Every mutation is a single conditional UPDATE so concurrent requests
//! for the same tenant never race a separate read+write. No quota logic
//! lives here; this is pure storage.

use sqlx::{Row, SqlitePool};

use crate::error::{Result, ServiceError};
use crate::models::Usage;

#[derive(Clone)]
pub struct UsageLedger {
    pool: SqlitePool,
}

impl UsageLedger {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Fetch the tenant's counters. The row is created at tenant creation,
    /// never lazily; a missing row is an internal invariant violation.
    pub async fn get(&self, tenant_id: &str) -> Result<Usage> {
        let row = sqlx::query(
            "SELECT ingested_chars, stored_chars, chat_tokens FROM usage WHERE tenant_id = ?",
        )
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;

        let row = row.ok_or_else(|| ServiceError::NotConfigured(tenant_id.to_string()))?;

        Ok(Usage {
            ingested_chars: row.get("ingested_chars"),
            stored_chars: row.get("stored_chars"),
            chat_tokens: row.get("chat_tokens"),
        })
    }

    /// Record a successful ingestion: chars count against both the monthly
    /// flow and the storage high-water mark.
    pub async fn record_ingest(&self, tenant_id: &str, chars: i64) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE usage
            SET ingested_chars = ingested_chars + ?,
                stored_chars = stored_chars + ?
            WHERE tenant_id = ?
            "#,
        )
        .bind(chars)
        .bind(chars)
        .bind(tenant_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(ServiceError::NotConfigured(tenant_id.to_string()));
        }
        Ok(())
    }

    /// Record a completed chat exchange.
    pub async fn record_chat(&self, tenant_id: &str, tokens: i64) -> Result<()> {
        let result = sqlx::query(
            "UPDATE usage SET chat_tokens = chat_tokens + ? WHERE tenant_id = ?",
        )
        .bind(tokens)
        .bind(tenant_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(ServiceError::NotConfigured(tenant_id.to_string()));
        }
        Ok(())
    }

    /// Free stored chars after a document deletion. Floors at zero so the
    /// counter can never go negative.
    pub async fn decrement_stored(&self, tenant_id: &str, chars: i64) -> Result<()> {
        let result = sqlx::query(
            "UPDATE usage SET stored_chars = MAX(0, stored_chars - ?) WHERE tenant_id = ?",
        )
        .bind(chars)
        .bind(tenant_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(ServiceError::NotConfigured(tenant_id.to_string()));
        }
        Ok(())
    }

    /// Billing-period rollover: zero the monthly counters. stored_chars is a
    /// high-water mark and survives the rollover.
    pub async fn reset_period(&self, tenant_id: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE usage SET ingested_chars = 0, chat_tokens = 0 WHERE tenant_id = ?",
        )
        .bind(tenant_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(ServiceError::NotConfigured(tenant_id.to_string()));
        }
        Ok(())
    }
}
