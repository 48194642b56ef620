//! HTTP API server.
//!
//! Every tenant-facing route authenticates with a bearer API key and is
//! counted against the tenant's per-minute rate limit before any work
//! happens. Error responses share one JSON shape:
//!
//! ```json
//! { "error": { "code": "quota_ingestion", "message": "..." } }
//! ```
//!
//! # Endpoints
//!
//! | Method   | Path                | Description |
//! |----------|---------------------|-------------|
//! | `POST`   | `/ingest`           | Upload a document (JSON text or PDF) |
//! | `POST`   | `/chat`             | Ask a question, blocking answer |
//! | `POST`   | `/chat/stream`      | Ask a question, SSE fragment stream |
//! | `GET`    | `/usage`            | Current counters, limits, remaining |
//! | `GET`    | `/documents`        | List the key's committed documents |
//! | `DELETE` | `/documents/{id}`   | Delete a document and free storage |
//! | `GET`    | `/plans`            | Public plan catalog |
//! | `GET`    | `/health`           | Liveness check |

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::sse::{Event, KeepAlive, Sse},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::chat::{run_chat, run_chat_stream, ChatRequest};
use crate::config::Config;
use crate::db::connect;
use crate::embedding::create_embedder;
use crate::error::ServiceError;
use crate::extract::{extract_pdf, MIME_PDF};
use crate::generator::create_generator;
use crate::ingest::{run_ingest, IngestRequest};
use crate::ledger::UsageLedger;
use crate::migrate::{run_migrations, seed_plans};
use crate::models::{Plan, Usage};
use crate::ratelimit::{FixedWindowLimiter, SystemClock};
use crate::registry::{AuthContext, Registry};
use crate::retrieve::RetrievalGateway;
use crate::store::DocumentStore;
use crate::vector::SqliteVectorStore;

#[derive(Clone)]
struct AppState {
    config: Arc<Config>,
    registry: Registry,
    ledger: UsageLedger,
    store: Arc<DocumentStore>,
    retrieval: Arc<RetrievalGateway>,
    limiter: Arc<FixedWindowLimiter>,
}

/// Binds to `[server].bind` and serves until the process is terminated.
/// Migrations and plan seeding run on startup, so a fresh database file
/// is usable immediately.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let pool = connect(&config.db.path).await?;
    run_migrations(&pool).await?;
    seed_plans(&pool).await?;

    let embedder: Arc<dyn crate::embedding::Embedder> =
        Arc::from(create_embedder(&config.embedding)?);
    let vectors: Arc<dyn crate::vector::VectorStore> =
        Arc::new(SqliteVectorStore::new(pool.clone()));

    let state = AppState {
        registry: Registry::new(pool.clone()),
        ledger: UsageLedger::new(pool.clone()),
        store: Arc::new(DocumentStore::new(
            pool.clone(),
            vectors.clone(),
            embedder.clone(),
            config.chunking.max_chars,
        )),
        retrieval: Arc::new(RetrievalGateway::new(
            embedder,
            vectors,
            config.retrieval.top_k,
        )),
        limiter: Arc::new(FixedWindowLimiter::new(
            config.limits.rate_window_secs,
            Arc::new(SystemClock),
        )),
        config: Arc::new(config.clone()),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/ingest", post(handle_ingest))
        .route("/chat", post(handle_chat))
        .route("/chat/stream", post(handle_chat_stream))
        .route("/usage", get(handle_usage))
        .route("/documents", get(handle_list_documents))
        .route("/documents/{id}", delete(handle_delete_document))
        .route("/plans", get(handle_plans))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state);

    info!(bind = %config.server.bind, "server listening");

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = match &self {
            ServiceError::Validation(_) => StatusCode::BAD_REQUEST,
            ServiceError::Unauthorized => StatusCode::UNAUTHORIZED,
            ServiceError::QuotaExceeded { .. } => StatusCode::PAYMENT_REQUIRED,
            ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
            ServiceError::DuplicateDocument(_) => StatusCode::CONFLICT,
            ServiceError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ServiceError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ServiceError::NotConfigured(_) | ServiceError::Storage(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code().to_string(),
                message: self.to_string(),
            },
        };

        (status, Json(body)).into_response()
    }
}

// ============ Auth ============

/// Resolve the bearer key and count the request against the tenant's
/// rate limit. Every tenant-facing handler goes through here first.
async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<AuthContext, ServiceError> {
    let raw_key = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(ServiceError::Unauthorized)?;

    let auth = state.registry.resolve_api_key(raw_key).await?;
    state
        .limiter
        .check(&auth.tenant.id, auth.plan.requests_per_minute)?;

    Ok(auth)
}

// ============ POST /ingest ============

#[derive(Deserialize)]
struct IngestBody {
    filename: String,
    text: String,
}

/// Accepts either a JSON body `{filename, text}` or a raw PDF body with
/// an `X-Filename` header.
async fn handle_ingest(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ServiceError> {
    let auth = authenticate(&state, &headers).await?;

    let content_type = headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/json");

    let (filename, text) = if content_type.starts_with(MIME_PDF) {
        let filename = headers
            .get("x-filename")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("upload.pdf")
            .to_string();
        (filename, extract_pdf(&body)?)
    } else {
        let parsed: IngestBody = serde_json::from_slice(&body)
            .map_err(|e| ServiceError::Validation(format!("invalid request body: {}", e)))?;
        (parsed.filename, parsed.text)
    };

    let outcome = run_ingest(
        &state.store,
        &state.ledger,
        state.config.limits.max_single_upload_chars,
        IngestRequest {
            api_key_id: &auth.api_key.id,
            tenant_id: &auth.tenant.id,
            plan: &auth.plan,
            filename: &filename,
            text: &text,
        },
    )
    .await?;

    Ok((StatusCode::CREATED, Json(outcome)))
}

// ============ POST /chat ============

#[derive(Deserialize)]
struct ChatBody {
    question: String,
}

async fn handle_chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ChatBody>,
) -> Result<impl IntoResponse, ServiceError> {
    let auth = authenticate(&state, &headers).await?;

    let generator = create_generator(auth.api_key.generator.as_deref(), &state.config.generator)?;
    let outcome = run_chat(
        &state.retrieval,
        generator.as_ref(),
        &state.ledger,
        ChatRequest {
            api_key_id: &auth.api_key.id,
            tenant_id: &auth.tenant.id,
            plan: &auth.plan,
            question: &body.question,
        },
    )
    .await?;

    Ok(Json(outcome))
}

// ============ POST /chat/stream ============

async fn handle_chat_stream(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ChatBody>,
) -> Result<Sse<impl Stream<Item = Result<Event, ServiceError>>>, ServiceError> {
    let auth = authenticate(&state, &headers).await?;

    let generator = create_generator(auth.api_key.generator.as_deref(), &state.config.generator)?;
    let fragments = run_chat_stream(
        &state.retrieval,
        generator,
        state.ledger.clone(),
        state.config.limits.stream_output_budget_chars,
        ChatRequest {
            api_key_id: &auth.api_key.id,
            tenant_id: &auth.tenant.id,
            plan: &auth.plan,
            question: &body.question,
        },
    )
    .await?;

    let events = futures::StreamExt::map(fragments, |fragment| {
        fragment.map(|text| Event::default().data(text))
    });

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

// ============ GET /usage ============

#[derive(Serialize)]
struct UsageResponse {
    plan: Plan,
    usage: Usage,
    remaining: serde_json::Value,
}

async fn handle_usage(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ServiceError> {
    let auth = authenticate(&state, &headers).await?;
    let usage = state.ledger.get(&auth.tenant.id).await?;

    let remaining = json!({
        "ingested_chars": (auth.plan.max_ingested_chars - usage.ingested_chars).max(0),
        "stored_chars": (auth.plan.max_stored_chars - usage.stored_chars).max(0),
        "chat_tokens": (auth.plan.max_chat_tokens - usage.chat_tokens).max(0),
    });

    Ok(Json(UsageResponse {
        plan: auth.plan,
        usage,
        remaining,
    }))
}

// ============ Documents ============

async fn handle_list_documents(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ServiceError> {
    let auth = authenticate(&state, &headers).await?;
    let documents = state.store.list(&auth.api_key.id).await?;
    Ok(Json(json!({ "documents": documents })))
}

/// Deleting a document frees its stored chars immediately; the monthly
/// ingestion counter is unaffected.
async fn handle_delete_document(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ServiceError> {
    let auth = authenticate(&state, &headers).await?;

    let freed = state.store.delete(&auth.api_key.id, &id).await?;
    state.ledger.decrement_stored(&auth.tenant.id, freed).await?;

    info!(tenant = %auth.tenant.id, document = %id, freed, "document deleted");

    Ok(Json(json!({ "deleted": id, "freed_chars": freed })))
}

// ============ GET /plans ============

async fn handle_plans(State(state): State<AppState>) -> Result<impl IntoResponse, ServiceError> {
    let plans = state.registry.list_plans().await?;
    Ok(Json(json!({ "plans": plans })))
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}
