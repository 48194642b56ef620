//! Chat orchestrator.
//!
//! Retrieval, prompt assembly, generation, and token accounting for one
//! exchange. Admission is checked before the upstream call; tokens are
//! recorded only after a complete answer, from actual output size. A
//! stream abandoned mid-flight records nothing.

use serde::Serialize;
use tracing::{error, info};

use crate::error::{Result, ServiceError};
use crate::generator::{FragmentStream, Generator};
use crate::ledger::UsageLedger;
use crate::models::Plan;
use crate::prompt::build_prompt;
use crate::quota;
use crate::retrieve::RetrievalGateway;

#[derive(Debug, Serialize)]
pub struct ChatOutcome {
    pub answer: String,
    pub tokens_used: i64,
}

pub struct ChatRequest<'a> {
    pub api_key_id: &'a str,
    pub tenant_id: &'a str,
    pub plan: &'a Plan,
    pub question: &'a str,
}

async fn prepare_prompt(retrieval: &RetrievalGateway, req: &ChatRequest<'_>) -> Result<String> {
    if req.question.trim().is_empty() {
        return Err(ServiceError::Validation("question is required".to_string()));
    }

    let context = retrieval.retrieve(req.api_key_id, req.question).await?;
    if context.is_empty() {
        return Err(ServiceError::NotFound(
            "No documents found. Please upload documents first.".to_string(),
        ));
    }

    Ok(build_prompt(&context, req.question))
}

pub async fn run_chat(
    retrieval: &RetrievalGateway,
    generator: &dyn Generator,
    ledger: &UsageLedger,
    req: ChatRequest<'_>,
) -> Result<ChatOutcome> {
    let prompt = prepare_prompt(retrieval, &req).await?;

    // Billing counts the tenant's own text: question in, answer out.
    // Retrieved context and template boilerplate are not charged.
    let input_chars = req.question.chars().count() as i64;

    // Reject before paying for generation if the input alone busts the
    // budget; the final check below uses the actual output size.
    let usage = ledger.get(req.tenant_id).await?;
    quota::check_chat(req.plan, &usage, input_chars, 0)?;

    let answer = generator.generate(&prompt).await?;
    let output_chars = answer.chars().count() as i64;

    quota::check_chat(req.plan, &usage, input_chars, output_chars)?;

    let tokens = quota::approx_tokens(input_chars + output_chars);
    ledger.record_chat(req.tenant_id, tokens).await?;

    info!(tenant = req.tenant_id, tokens, "chat completed");

    Ok(ChatOutcome {
        answer,
        tokens_used: tokens,
    })
}

/// Streamed variant. Frames are raw text fragments, terminated by a
/// `[DONE]` sentinel; a mid-stream upstream failure emits one
/// `[ERROR] <message>` frame instead. Admission is checked up front
/// against the input plus a fixed output allowance, since the real output
/// size is unknown until the stream ends.
pub async fn run_chat_stream(
    retrieval: &RetrievalGateway,
    generator: Box<dyn Generator>,
    ledger: UsageLedger,
    stream_output_budget_chars: i64,
    req: ChatRequest<'_>,
) -> Result<FragmentStream> {
    let prompt = prepare_prompt(retrieval, &req).await?;
    let input_chars = req.question.chars().count() as i64;

    let usage = ledger.get(req.tenant_id).await?;
    quota::check_chat(req.plan, &usage, input_chars, stream_output_budget_chars)?;

    let mut fragments = generator.generate_stream(&prompt).await?;
    let tenant_id = req.tenant_id.to_string();

    // Usage is recorded inside the stream, after the last fragment and
    // before [DONE]. If the client disconnects, the stream is dropped and
    // the exchange was never delivered, so nothing is billed.
    let stream = async_stream::stream! {
        use futures::StreamExt;

        let mut output_chars: i64 = 0;
        while let Some(fragment) = fragments.next().await {
            match fragment {
                Ok(text) => {
                    output_chars += text.chars().count() as i64;
                    yield Ok(text);
                }
                Err(e) => {
                    error!(tenant = %tenant_id, error = %e, "generator stream failed");
                    yield Ok(format!("[ERROR] {}", e));
                    return;
                }
            }
        }

        let tokens = quota::approx_tokens(input_chars + output_chars);
        if let Err(e) = ledger.record_chat(&tenant_id, tokens).await {
            error!(tenant = %tenant_id, error = %e, "failed to record chat usage");
        } else {
            info!(tenant = %tenant_id, tokens, "chat stream completed");
        }

        yield Ok("[DONE]".to_string());
    };

    Ok(Box::pin(stream))
}
