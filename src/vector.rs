//! Vector store abstraction.
//!
//! The [`VectorStore`] trait models the nearest-neighbor engine the
//! pipeline depends on: `upsert`, filtered `query`, and filtered deletes.
//! The tenant tag is part of every operation's signature: a query cannot
//! be constructed without one, so no caller can forget the isolation
//! filter.
//!
//! [`SqliteVectorStore`] keeps vectors as little-endian f32 BLOBs and does
//! brute-force cosine similarity, which is exact and plenty for the
//! per-tenant corpus sizes this service targets.

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};

use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::error::Result;

/// One embedded chunk, tagged with its owning key and document.
#[derive(Debug, Clone)]
pub struct VectorPoint {
    pub id: String,
    pub api_key_id: String,
    pub document_id: String,
    pub text: String,
    pub vector: Vec<f32>,
}

/// A query hit, most relevant first.
#[derive(Debug, Clone)]
pub struct ScoredPoint {
    pub text: String,
    pub score: f32,
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Insert or replace a point. Upserts are independent and
    /// order-insensitive.
    async fn upsert(&self, point: VectorPoint) -> Result<()>;

    /// Top-k nearest neighbors among the given key's committed documents.
    async fn query(&self, api_key_id: &str, vector: &[f32], k: usize) -> Result<Vec<ScoredPoint>>;

    /// Delete every point tagged with this document.
    async fn delete_document(&self, document_id: &str) -> Result<()>;

    /// Delete every point tagged with this key.
    async fn delete_api_key(&self, api_key_id: &str) -> Result<()>;
}

pub struct SqliteVectorStore {
    pool: SqlitePool,
}

impl SqliteVectorStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl VectorStore for SqliteVectorStore {
    async fn upsert(&self, point: VectorPoint) -> Result<()> {
        let blob = vec_to_blob(&point.vector);
        sqlx::query(
            r#"
            INSERT INTO vectors (id, api_key_id, document_id, text, embedding)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                api_key_id = excluded.api_key_id,
                document_id = excluded.document_id,
                text = excluded.text,
                embedding = excluded.embedding
            "#,
        )
        .bind(&point.id)
        .bind(&point.api_key_id)
        .bind(&point.document_id)
        .bind(&point.text)
        .bind(&blob)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn query(&self, api_key_id: &str, vector: &[f32], k: usize) -> Result<Vec<ScoredPoint>> {
        // The key filter is baked into the SQL; the committed join hides
        // vectors from in-flight or abandoned ingest attempts.
        let rows = sqlx::query(
            r#"
            SELECT v.text, v.embedding
            FROM vectors v
            JOIN documents d ON d.id = v.document_id
            WHERE v.api_key_id = ? AND d.status = 'committed'
            "#,
        )
        .bind(api_key_id)
        .fetch_all(&self.pool)
        .await?;

        let mut scored: Vec<ScoredPoint> = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                let stored = blob_to_vec(&blob);
                ScoredPoint {
                    text: row.get("text"),
                    score: cosine_similarity(vector, &stored),
                }
            })
            .collect();

        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(k);

        Ok(scored)
    }

    async fn delete_document(&self, document_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM vectors WHERE document_id = ?")
            .bind(document_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_api_key(&self, api_key_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM vectors WHERE api_key_id = ?")
            .bind(api_key_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
