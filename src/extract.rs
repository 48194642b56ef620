//! Text extraction for binary uploads.
//!
//! Plain text and markdown arrive as UTF-8 in the request body; PDFs are
//! the one binary format accepted and are flattened to plain text here
//! before the ingest pipeline sees them.

use crate::error::{Result, ServiceError};

pub const MIME_PDF: &str = "application/pdf";

/// Extract plain text from a PDF. A file that cannot be parsed is the
/// caller's mistake, not ours, so failures map to `Validation`.
pub fn extract_pdf(bytes: &[u8]) -> Result<String> {
    pdf_extract::extract_text_from_mem(bytes)
        .map_err(|e| ServiceError::Validation(format!("could not extract PDF text: {}", e)))
}
