//! Schema migrations and plan seeding.
//!
//! All statements are idempotent; running `init` repeatedly is safe.

use anyhow::Result;
use sqlx::SqlitePool;

pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tenants (
            id TEXT PRIMARY KEY,
            email TEXT NOT NULL UNIQUE,
            is_active INTEGER NOT NULL DEFAULT 1,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS api_keys (
            id TEXT PRIMARY KEY,
            key_hash TEXT NOT NULL UNIQUE,
            tenant_id TEXT NOT NULL,
            generator TEXT,
            is_active INTEGER NOT NULL DEFAULT 1,
            created_at INTEGER NOT NULL,
            FOREIGN KEY (tenant_id) REFERENCES tenants(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS plans (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            max_ingested_chars INTEGER NOT NULL,
            max_stored_chars INTEGER NOT NULL,
            max_chat_tokens INTEGER NOT NULL,
            requests_per_minute INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tenant_plans (
            tenant_id TEXT PRIMARY KEY,
            plan_id TEXT NOT NULL,
            FOREIGN KEY (tenant_id) REFERENCES tenants(id),
            FOREIGN KEY (plan_id) REFERENCES plans(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS usage (
            tenant_id TEXT PRIMARY KEY,
            ingested_chars INTEGER NOT NULL DEFAULT 0,
            stored_chars INTEGER NOT NULL DEFAULT 0,
            chat_tokens INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY (tenant_id) REFERENCES tenants(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // status: 'pending' while chunk upserts are in flight, 'committed' after
    // every vector write succeeded. Retrieval and listing see only committed.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            id TEXT PRIMARY KEY,
            api_key_id TEXT NOT NULL,
            filename TEXT NOT NULL,
            fingerprint TEXT NOT NULL,
            char_count INTEGER NOT NULL,
            chunk_count INTEGER NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            created_at INTEGER NOT NULL,
            UNIQUE(api_key_id, fingerprint),
            FOREIGN KEY (api_key_id) REFERENCES api_keys(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS vectors (
            id TEXT PRIMARY KEY,
            api_key_id TEXT NOT NULL,
            document_id TEXT NOT NULL,
            text TEXT NOT NULL,
            embedding BLOB NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_vectors_api_key_id ON vectors(api_key_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_vectors_document_id ON vectors(document_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_documents_api_key_id ON documents(api_key_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_api_keys_tenant_id ON api_keys(tenant_id)")
        .execute(pool)
        .await?;

    Ok(())
}

/// Seed the built-in plan tiers. Existing rows are left untouched so
/// operator edits survive re-running `init`.
pub async fn seed_plans(pool: &SqlitePool) -> Result<()> {
    let tiers: [(&str, i64, i64, i64, i64); 3] = [
        ("free", 100_000, 200_000, 50_000, 10),
        ("pro", 2_000_000, 10_000_000, 1_000_000, 60),
        ("enterprise", 50_000_000, 200_000_000, 20_000_000, 300),
    ];

    for (name, ingested, stored, tokens, rpm) in tiers {
        sqlx::query(
            r#"
            INSERT INTO plans (id, name, max_ingested_chars, max_stored_chars,
                               max_chat_tokens, requests_per_minute)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(name) DO NOTHING
            "#,
        )
        .bind(name)
        .bind(name)
        .bind(ingested)
        .bind(stored)
        .bind(tokens)
        .bind(rpm)
        .execute(pool)
        .await?;
    }

    Ok(())
}
