//! Tenant and plan registry.
//!
//! Durable records of tenants, their API keys, and plan assignments.
//! Raw key secrets exist only in the creation response; the database
//! holds their SHA-256 hash.

use sha2::{Digest, Sha256};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::error::{Result, ServiceError};
use crate::models::{ApiKey, Plan, Tenant};

/// Everything the orchestrators need about the caller, resolved once per
/// request from the bearer key.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub api_key: ApiKey,
    pub tenant: Tenant,
    pub plan: Plan,
}

/// Generate a fresh opaque key. Returns `(raw, hash)`; only the hash is
/// ever persisted.
pub fn generate_api_key() -> (String, String) {
    let raw = format!(
        "sk_{}{}",
        Uuid::new_v4().simple(),
        Uuid::new_v4().simple()
    );
    let hash = hash_api_key(&raw);
    (raw, hash)
}

pub fn hash_api_key(raw: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw.as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Clone)]
pub struct Registry {
    pool: SqlitePool,
}

impl Registry {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Resolve a raw bearer key to its key, tenant, and plan. Fails with
    /// `Unauthorized` for unknown, revoked, or deactivated-tenant keys;
    /// a missing plan assignment is `NotConfigured`.
    pub async fn resolve_api_key(&self, raw_key: &str) -> Result<AuthContext> {
        let key_hash = hash_api_key(raw_key);

        let row = sqlx::query(
            r#"
            SELECT k.id, k.tenant_id, k.generator, k.is_active, k.created_at,
                   t.email, t.is_active AS tenant_active, t.created_at AS tenant_created_at
            FROM api_keys k
            JOIN tenants t ON t.id = k.tenant_id
            WHERE k.key_hash = ?
            "#,
        )
        .bind(&key_hash)
        .fetch_optional(&self.pool)
        .await?;

        let row = row.ok_or(ServiceError::Unauthorized)?;

        let key_active: bool = row.get("is_active");
        let tenant_active: bool = row.get("tenant_active");
        if !key_active || !tenant_active {
            return Err(ServiceError::Unauthorized);
        }

        let api_key = ApiKey {
            id: row.get("id"),
            tenant_id: row.get("tenant_id"),
            generator: row.get("generator"),
            is_active: key_active,
            created_at: row.get("created_at"),
        };
        let tenant = Tenant {
            id: api_key.tenant_id.clone(),
            email: row.get("email"),
            is_active: tenant_active,
            created_at: row.get("tenant_created_at"),
        };

        let plan = self.plan_for_tenant(&tenant.id).await?;

        Ok(AuthContext {
            api_key,
            tenant,
            plan,
        })
    }

    pub async fn plan_for_tenant(&self, tenant_id: &str) -> Result<Plan> {
        let row = sqlx::query(
            r#"
            SELECT p.id, p.name, p.max_ingested_chars, p.max_stored_chars,
                   p.max_chat_tokens, p.requests_per_minute
            FROM tenant_plans tp
            JOIN plans p ON p.id = tp.plan_id
            WHERE tp.tenant_id = ?
            "#,
        )
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;

        let row = row.ok_or_else(|| {
            ServiceError::NotConfigured(format!("no plan assigned to tenant {}", tenant_id))
        })?;

        Ok(plan_from_row(&row))
    }

    pub async fn list_plans(&self) -> Result<Vec<Plan>> {
        let rows = sqlx::query(
            r#"
            SELECT id, name, max_ingested_chars, max_stored_chars,
                   max_chat_tokens, requests_per_minute
            FROM plans ORDER BY max_ingested_chars
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(plan_from_row).collect())
    }

    /// Create a tenant with its plan assignment and usage ledger row in one
    /// transaction. The ledger row is never created lazily.
    pub async fn create_tenant(&self, email: &str, plan_name: &str) -> Result<Tenant> {
        let plan_id: Option<String> = sqlx::query_scalar("SELECT id FROM plans WHERE name = ?")
            .bind(plan_name)
            .fetch_optional(&self.pool)
            .await?;
        let plan_id =
            plan_id.ok_or_else(|| ServiceError::NotFound(format!("plan '{}'", plan_name)))?;

        let tenant = Tenant {
            id: Uuid::new_v4().to_string(),
            email: email.to_string(),
            is_active: true,
            created_at: chrono::Utc::now().timestamp(),
        };

        let mut tx = self.pool.begin().await?;

        sqlx::query("INSERT INTO tenants (id, email, is_active, created_at) VALUES (?, ?, 1, ?)")
            .bind(&tenant.id)
            .bind(&tenant.email)
            .bind(tenant.created_at)
            .execute(&mut *tx)
            .await?;

        sqlx::query("INSERT INTO tenant_plans (tenant_id, plan_id) VALUES (?, ?)")
            .bind(&tenant.id)
            .bind(&plan_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "INSERT INTO usage (tenant_id, ingested_chars, stored_chars, chat_tokens) VALUES (?, 0, 0, 0)",
        )
        .bind(&tenant.id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(tenant)
    }

    /// Upgrade or downgrade a tenant's plan assignment. Limits themselves
    /// never change per-tenant.
    pub async fn assign_plan(&self, tenant_id: &str, plan_name: &str) -> Result<Plan> {
        let row = sqlx::query(
            r#"
            SELECT id, name, max_ingested_chars, max_stored_chars,
                   max_chat_tokens, requests_per_minute
            FROM plans WHERE name = ?
            "#,
        )
        .bind(plan_name)
        .fetch_optional(&self.pool)
        .await?;
        let row = row.ok_or_else(|| ServiceError::NotFound(format!("plan '{}'", plan_name)))?;
        let plan = plan_from_row(&row);

        let result = sqlx::query("UPDATE tenant_plans SET plan_id = ? WHERE tenant_id = ?")
            .bind(&plan.id)
            .bind(tenant_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(ServiceError::NotConfigured(format!(
                "no plan assignment for tenant {}",
                tenant_id
            )));
        }
        Ok(plan)
    }

    /// Create a key for a tenant. Returns the raw secret exactly once.
    pub async fn create_key(&self, tenant_id: &str, generator: Option<&str>) -> Result<String> {
        let exists: Option<String> = sqlx::query_scalar("SELECT id FROM tenants WHERE id = ?")
            .bind(tenant_id)
            .fetch_optional(&self.pool)
            .await?;
        if exists.is_none() {
            return Err(ServiceError::NotFound(format!("tenant {}", tenant_id)));
        }

        let (raw, hash) = generate_api_key();
        sqlx::query(
            r#"
            INSERT INTO api_keys (id, key_hash, tenant_id, generator, is_active, created_at)
            VALUES (?, ?, ?, ?, 1, ?)
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&hash)
        .bind(tenant_id)
        .bind(generator)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await?;

        Ok(raw)
    }

    /// All keys belonging to one tenant, newest first.
    pub async fn list_keys(&self, tenant_id: &str) -> Result<Vec<ApiKey>> {
        let rows = sqlx::query(
            r#"
            SELECT id, tenant_id, generator, is_active, created_at
            FROM api_keys WHERE tenant_id = ?
            ORDER BY created_at DESC
            "#,
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| ApiKey {
                id: row.get("id"),
                tenant_id: row.get("tenant_id"),
                generator: row.get("generator"),
                is_active: row.get("is_active"),
                created_at: row.get("created_at"),
            })
            .collect())
    }

    /// Soft-disable a key. Its documents and vectors stay in place.
    pub async fn revoke_key(&self, key_id: &str) -> Result<()> {
        let result = sqlx::query("UPDATE api_keys SET is_active = 0 WHERE id = ?")
            .bind(key_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(ServiceError::NotFound(format!("api key {}", key_id)));
        }
        Ok(())
    }

    /// Look up a key row by id (for hard-delete cascades).
    pub async fn get_key(&self, key_id: &str) -> Result<ApiKey> {
        let row = sqlx::query(
            "SELECT id, tenant_id, generator, is_active, created_at FROM api_keys WHERE id = ?",
        )
        .bind(key_id)
        .fetch_optional(&self.pool)
        .await?;

        let row = row.ok_or_else(|| ServiceError::NotFound(format!("api key {}", key_id)))?;

        Ok(ApiKey {
            id: row.get("id"),
            tenant_id: row.get("tenant_id"),
            generator: row.get("generator"),
            is_active: row.get("is_active"),
            created_at: row.get("created_at"),
        })
    }

    /// Remove the key row itself. Callers must cascade documents and
    /// vectors first via the document store.
    pub async fn delete_key_row(&self, key_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM api_keys WHERE id = ?")
            .bind(key_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Freeze or unfreeze all operations for a tenant without deleting data.
    pub async fn set_tenant_active(&self, tenant_id: &str, active: bool) -> Result<()> {
        let result = sqlx::query("UPDATE tenants SET is_active = ? WHERE id = ?")
            .bind(active)
            .bind(tenant_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(ServiceError::NotFound(format!("tenant {}", tenant_id)));
        }
        Ok(())
    }
}

fn plan_from_row(row: &sqlx::sqlite::SqliteRow) -> Plan {
    Plan {
        id: row.get("id"),
        name: row.get("name"),
        max_ingested_chars: row.get("max_ingested_chars"),
        max_stored_chars: row.get("max_stored_chars"),
        max_chat_tokens: row.get("max_chat_tokens"),
        requests_per_minute: row.get("requests_per_minute"),
    }
}
