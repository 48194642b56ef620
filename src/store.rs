//! Document store gateway.
//!
//! Owns the mapping from API key + content fingerprint to chunk records
//! and drives all vector writes and deletes. A document is staged as
//! `pending`, its chunks embedded and upserted, and only then flipped to
//! `committed`, so a failure partway through never yields a visible
//! document referencing half-written vectors. Re-uploading the same
//! content clears any stale pending attempt before retrying.

use sha2::{Digest, Sha256};
use sqlx::{Row, SqlitePool};
use std::sync::Arc;
use uuid::Uuid;

use crate::chunk::chunk_text;
use crate::embedding::Embedder;
use crate::error::{Result, ServiceError};
use crate::models::Document;
use crate::vector::{VectorPoint, VectorStore};

/// SHA-256 hex of the full text; the document's duplicate-detection
/// identity. A hash match is treated as a true duplicate.
pub fn fingerprint(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

pub struct DocumentStore {
    pool: SqlitePool,
    vectors: Arc<dyn VectorStore>,
    embedder: Arc<dyn Embedder>,
    max_chunk_chars: usize,
}

impl DocumentStore {
    pub fn new(
        pool: SqlitePool,
        vectors: Arc<dyn VectorStore>,
        embedder: Arc<dyn Embedder>,
        max_chunk_chars: usize,
    ) -> Self {
        Self {
            pool,
            vectors,
            embedder,
            max_chunk_chars,
        }
    }

    /// Fails with `DuplicateDocument` if this key already committed a
    /// document with this fingerprint. Called by the ingest orchestrator
    /// before any quota lookup or billable work.
    pub async fn check_duplicate(&self, api_key_id: &str, fp: &str) -> Result<()> {
        let existing: Option<String> = sqlx::query_scalar(
            "SELECT filename FROM documents WHERE api_key_id = ? AND fingerprint = ? AND status = 'committed'",
        )
        .bind(api_key_id)
        .bind(fp)
        .fetch_optional(&self.pool)
        .await?;

        match existing {
            Some(filename) => Err(ServiceError::DuplicateDocument(filename)),
            None => Ok(()),
        }
    }

    /// Chunk, embed, and store a document's full text for one key.
    /// Returns the committed document.
    pub async fn put(&self, api_key_id: &str, filename: &str, full_text: &str) -> Result<Document> {
        let fp = fingerprint(full_text);
        self.check_duplicate(api_key_id, &fp).await?;

        // A previous attempt may have died between staging and commit;
        // clear its row and vectors so the unique constraint can't trip.
        self.clear_pending(api_key_id, &fp).await?;

        let chunks = chunk_text(full_text, self.max_chunk_chars);
        if chunks.is_empty() {
            return Err(ServiceError::Validation("document has no text".to_string()));
        }

        let document = Document {
            id: Uuid::new_v4().to_string(),
            api_key_id: api_key_id.to_string(),
            filename: filename.to_string(),
            fingerprint: fp,
            char_count: full_text.chars().count() as i64,
            chunk_count: chunks.len() as i64,
            created_at: chrono::Utc::now().timestamp(),
        };

        sqlx::query(
            r#"
            INSERT INTO documents (id, api_key_id, filename, fingerprint,
                                   char_count, chunk_count, status, created_at)
            VALUES (?, ?, ?, ?, ?, ?, 'pending', ?)
            "#,
        )
        .bind(&document.id)
        .bind(&document.api_key_id)
        .bind(&document.filename)
        .bind(&document.fingerprint)
        .bind(document.char_count)
        .bind(document.chunk_count)
        .bind(document.created_at)
        .execute(&self.pool)
        .await?;

        let embeddings = self.embedder.embed(&chunks).await?;
        if embeddings.len() != chunks.len() {
            return Err(ServiceError::Upstream(format!(
                "embedder returned {} vectors for {} chunks",
                embeddings.len(),
                chunks.len()
            )));
        }

        for (text, vector) in chunks.into_iter().zip(embeddings) {
            self.vectors
                .upsert(VectorPoint {
                    id: Uuid::new_v4().to_string(),
                    api_key_id: api_key_id.to_string(),
                    document_id: document.id.clone(),
                    text,
                    vector,
                })
                .await?;
        }

        // Every chunk landed; make the document visible.
        sqlx::query("UPDATE documents SET status = 'committed' WHERE id = ?")
            .bind(&document.id)
            .execute(&self.pool)
            .await?;

        Ok(document)
    }

    async fn clear_pending(&self, api_key_id: &str, fp: &str) -> Result<()> {
        let stale: Option<String> = sqlx::query_scalar(
            "SELECT id FROM documents WHERE api_key_id = ? AND fingerprint = ? AND status = 'pending'",
        )
        .bind(api_key_id)
        .bind(fp)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(doc_id) = stale {
            self.vectors.delete_document(&doc_id).await?;
            sqlx::query("DELETE FROM documents WHERE id = ?")
                .bind(&doc_id)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    /// Delete one of the key's documents and all its vectors. Vectors go
    /// first: a failure there leaves the row intact and the delete
    /// retryable, never silently orphaned vectors. Returns the freed
    /// char count for the caller's ledger decrement.
    pub async fn delete(&self, api_key_id: &str, document_id: &str) -> Result<i64> {
        let row = sqlx::query(
            "SELECT char_count FROM documents WHERE id = ? AND api_key_id = ?",
        )
        .bind(document_id)
        .bind(api_key_id)
        .fetch_optional(&self.pool)
        .await?;

        let row =
            row.ok_or_else(|| ServiceError::NotFound(format!("document {}", document_id)))?;
        let char_count: i64 = row.get("char_count");

        self.vectors.delete_document(document_id).await?;

        sqlx::query("DELETE FROM documents WHERE id = ?")
            .bind(document_id)
            .execute(&self.pool)
            .await?;

        Ok(char_count)
    }

    /// Wipe everything a key owns: vectors first, then document rows.
    /// Returns `(documents_deleted, freed_chars)`; freed chars count only
    /// committed documents, matching what was ever recorded.
    pub async fn delete_all_for_key(&self, api_key_id: &str) -> Result<(u64, i64)> {
        let freed: Option<i64> = sqlx::query_scalar(
            "SELECT SUM(char_count) FROM documents WHERE api_key_id = ? AND status = 'committed'",
        )
        .bind(api_key_id)
        .fetch_one(&self.pool)
        .await?;

        self.vectors.delete_api_key(api_key_id).await?;

        let result = sqlx::query("DELETE FROM documents WHERE api_key_id = ?")
            .bind(api_key_id)
            .execute(&self.pool)
            .await?;

        Ok((result.rows_affected(), freed.unwrap_or(0)))
    }

    /// Committed documents for one key, newest first.
    pub async fn list(&self, api_key_id: &str) -> Result<Vec<Document>> {
        let rows = sqlx::query(
            r#"
            SELECT id, api_key_id, filename, fingerprint, char_count, chunk_count, created_at
            FROM documents
            WHERE api_key_id = ? AND status = 'committed'
            ORDER BY created_at DESC
            "#,
        )
        .bind(api_key_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| Document {
                id: row.get("id"),
                api_key_id: row.get("api_key_id"),
                filename: row.get("filename"),
                fingerprint: row.get("fingerprint"),
                char_count: row.get("char_count"),
                chunk_count: row.get("chunk_count"),
                created_at: row.get("created_at"),
            })
            .collect())
    }
}
