//! Ingestion orchestrator.
//!
//! Order of operations is the contract: validate, duplicate-check, quota
//! admission, billable work, then the usage record. A rejected or failed
//! request never increments the ledger, and the record happens only after
//! the document is committed.

use serde::Serialize;
use tracing::info;

use crate::error::{Result, ServiceError};
use crate::ledger::UsageLedger;
use crate::models::{Document, Plan};
use crate::quota;
use crate::store::DocumentStore;

#[derive(Debug, Serialize)]
pub struct IngestOutcome {
    pub document: Document,
    pub chars_added: i64,
    pub chunks_added: i64,
}

pub struct IngestRequest<'a> {
    pub api_key_id: &'a str,
    pub tenant_id: &'a str,
    pub plan: &'a Plan,
    pub filename: &'a str,
    pub text: &'a str,
}

pub async fn run_ingest(
    store: &DocumentStore,
    ledger: &UsageLedger,
    max_single_upload_chars: i64,
    req: IngestRequest<'_>,
) -> Result<IngestOutcome> {
    if req.text.trim().is_empty() {
        return Err(ServiceError::Validation(
            "document contains no text".to_string(),
        ));
    }
    if req.filename.trim().is_empty() {
        return Err(ServiceError::Validation("filename is required".to_string()));
    }

    let char_count = req.text.chars().count() as i64;
    quota::check_upload_ceiling(char_count, max_single_upload_chars)?;

    // Re-sending known content is free: refuse before quota is consulted.
    let fp = crate::store::fingerprint(req.text);
    store.check_duplicate(req.api_key_id, &fp).await?;

    let usage = ledger.get(req.tenant_id).await?;
    quota::check_ingest(req.plan, &usage, char_count)?;

    let document = store.put(req.api_key_id, req.filename, req.text).await?;

    ledger.record_ingest(req.tenant_id, char_count).await?;

    info!(
        tenant = req.tenant_id,
        document = %document.id,
        chars = char_count,
        chunks = document.chunk_count,
        "document ingested"
    );

    Ok(IngestOutcome {
        chars_added: char_count,
        chunks_added: document.chunk_count,
        document,
    })
}
