//! Quota enforcement.
//!
//! Pure decision logic over (plan limits, current usage, proposed cost).
//! Nothing here mutates state; callers record usage via the ledger only
//! after the guarded action has fully succeeded.

use crate::error::{QuotaKind, Result, ServiceError};
use crate::models::{Plan, Usage};

/// Approximate token count from a character count: `max(1, ceil(chars / 4))`.
/// Deterministic; never consults the generator.
pub fn approx_tokens(chars: i64) -> i64 {
    std::cmp::max(1, (chars + 3) / 4)
}

/// Hard, plan-independent ceiling on a single ingestion payload. Checked
/// before any quota lookup to bound the worst case of one request.
pub fn check_upload_ceiling(char_count: i64, max_single_upload_chars: i64) -> Result<()> {
    if char_count > max_single_upload_chars {
        return Err(ServiceError::quota(
            QuotaKind::Ingestion,
            format!(
                "single upload of {} chars exceeds the {} char ceiling",
                char_count, max_single_upload_chars
            ),
        ));
    }
    Ok(())
}

/// Admission check for an ingestion of `new_chars`. Both the monthly flow
/// and the storage high-water mark are enforced.
pub fn check_ingest(plan: &Plan, usage: &Usage, new_chars: i64) -> Result<()> {
    if usage.ingested_chars + new_chars > plan.max_ingested_chars {
        return Err(ServiceError::quota(
            QuotaKind::Ingestion,
            format!(
                "monthly ingestion limit of {} chars reached on plan '{}'. Upgrade your plan.",
                plan.max_ingested_chars, plan.name
            ),
        ));
    }

    if usage.stored_chars + new_chars > plan.max_stored_chars {
        return Err(ServiceError::quota(
            QuotaKind::Storage,
            format!(
                "knowledge base storage limit of {} chars reached on plan '{}'. Upgrade your plan.",
                plan.max_stored_chars, plan.name
            ),
        ));
    }

    Ok(())
}

/// Admission check for a chat exchange of `input_chars` + `output_chars`.
pub fn check_chat(plan: &Plan, usage: &Usage, input_chars: i64, output_chars: i64) -> Result<()> {
    let tokens = approx_tokens(input_chars + output_chars);

    if usage.chat_tokens + tokens > plan.max_chat_tokens {
        return Err(ServiceError::quota(
            QuotaKind::ChatTokens,
            format!(
                "chat token limit of {} reached on plan '{}'. Upgrade your plan.",
                plan.max_chat_tokens, plan.name
            ),
        ));
    }

    Ok(())
}
