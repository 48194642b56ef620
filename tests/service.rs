//! End-to-end pipeline tests against a real temporary SQLite database,
//! using the deterministic hash embedder and a scripted generator so no
//! network is involved.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::StreamExt;
use tempfile::TempDir;

use kbserve::chat::{run_chat, run_chat_stream, ChatRequest};
use kbserve::db::connect;
use kbserve::embedding::HashEmbedder;
use kbserve::error::{QuotaKind, ServiceError};
use kbserve::generator::{FragmentStream, Generator};
use kbserve::ingest::{run_ingest, IngestRequest};
use kbserve::ledger::UsageLedger;
use kbserve::migrate::{run_migrations, seed_plans};
use kbserve::models::Plan;
use kbserve::registry::Registry;
use kbserve::retrieve::RetrievalGateway;
use kbserve::store::DocumentStore;
use kbserve::vector::{ScoredPoint, SqliteVectorStore, VectorPoint, VectorStore};

const MAX_UPLOAD: i64 = 500_000;

struct TestEnv {
    _tmp: TempDir,
    pool: sqlx::SqlitePool,
    registry: Registry,
    ledger: UsageLedger,
    store: DocumentStore,
    retrieval: RetrievalGateway,
}

struct Caller {
    api_key_id: String,
    tenant_id: String,
    plan: Plan,
}

async fn setup() -> TestEnv {
    let tmp = TempDir::new().unwrap();
    let pool = connect(&tmp.path().join("kb.sqlite")).await.unwrap();
    run_migrations(&pool).await.unwrap();
    seed_plans(&pool).await.unwrap();

    let embedder: Arc<dyn kbserve::embedding::Embedder> = Arc::new(HashEmbedder::new(128));
    let vectors: Arc<dyn kbserve::vector::VectorStore> =
        Arc::new(SqliteVectorStore::new(pool.clone()));

    TestEnv {
        registry: Registry::new(pool.clone()),
        ledger: UsageLedger::new(pool.clone()),
        store: DocumentStore::new(pool.clone(), vectors.clone(), embedder.clone(), 2000),
        retrieval: RetrievalGateway::new(embedder, vectors, 3),
        pool,
        _tmp: tmp,
    }
}

async fn new_caller(env: &TestEnv, email: &str) -> Caller {
    let tenant = env.registry.create_tenant(email, "free").await.unwrap();
    let raw = env.registry.create_key(&tenant.id, None).await.unwrap();
    let auth = env.registry.resolve_api_key(&raw).await.unwrap();

    Caller {
        api_key_id: auth.api_key.id,
        tenant_id: tenant.id,
        plan: auth.plan,
    }
}

async fn ingest(
    env: &TestEnv,
    caller: &Caller,
    filename: &str,
    text: &str,
) -> Result<kbserve::ingest::IngestOutcome, ServiceError> {
    run_ingest(
        &env.store,
        &env.ledger,
        MAX_UPLOAD,
        IngestRequest {
            api_key_id: &caller.api_key_id,
            tenant_id: &caller.tenant_id,
            plan: &caller.plan,
            filename,
            text,
        },
    )
    .await
}

/// Generator that replays a fixed script, optionally failing partway
/// through the stream.
struct ScriptedGenerator {
    fragments: Vec<String>,
    fail_after: Option<usize>,
}

impl ScriptedGenerator {
    fn new(fragments: &[&str]) -> Self {
        Self {
            fragments: fragments.iter().map(|s| s.to_string()).collect(),
            fail_after: None,
        }
    }
}

#[async_trait::async_trait]
impl Generator for ScriptedGenerator {
    async fn generate(&self, _prompt: &str) -> Result<String, ServiceError> {
        Ok(self.fragments.concat())
    }

    async fn generate_stream(&self, _prompt: &str) -> Result<FragmentStream, ServiceError> {
        let fragments = self.fragments.clone();
        let fail_after = self.fail_after;
        let stream = async_stream::stream! {
            for (i, fragment) in fragments.into_iter().enumerate() {
                if fail_after == Some(i) {
                    yield Err(ServiceError::Upstream("connection reset".to_string()));
                    return;
                }
                yield Ok(fragment);
            }
        };
        Ok(Box::pin(stream))
    }
}

/// Vector store that fails exactly one upsert (by call index), then
/// behaves normally, for exercising the pending/committed protocol.
struct FlakyVectorStore {
    inner: SqliteVectorStore,
    calls: AtomicUsize,
    fail_on_call: usize,
}

#[async_trait::async_trait]
impl VectorStore for FlakyVectorStore {
    async fn upsert(&self, point: VectorPoint) -> Result<(), ServiceError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == self.fail_on_call {
            return Err(ServiceError::Upstream(
                "vector store unavailable".to_string(),
            ));
        }
        self.inner.upsert(point).await
    }

    async fn query(
        &self,
        api_key_id: &str,
        vector: &[f32],
        k: usize,
    ) -> Result<Vec<ScoredPoint>, ServiceError> {
        self.inner.query(api_key_id, vector, k).await
    }

    async fn delete_document(&self, document_id: &str) -> Result<(), ServiceError> {
        self.inner.delete_document(document_id).await
    }

    async fn delete_api_key(&self, api_key_id: &str) -> Result<(), ServiceError> {
        self.inner.delete_api_key(api_key_id).await
    }
}

#[tokio::test]
async fn retrieval_never_crosses_tenants() {
    let env = setup().await;
    let alice = new_caller(&env, "alice@example.com").await;
    let bob = new_caller(&env, "bob@example.com").await;

    let alice_text = "Refund policy: customers receive full refunds within 30 days of purchase.";
    let bob_text = "Shipping policy: orders ship within 2 business days via ground carrier.";

    ingest(&env, &alice, "refunds.txt", alice_text).await.unwrap();
    ingest(&env, &bob, "shipping.txt", bob_text).await.unwrap();

    // Bob asks a question whose best global match is Alice's document.
    let hits = env
        .retrieval
        .retrieve(&bob.api_key_id, "What is the refund policy?")
        .await
        .unwrap();

    assert!(!hits.is_empty());
    for hit in &hits {
        assert!(
            bob_text.contains(hit.as_str()),
            "retrieved chunk from another tenant: {}",
            hit
        );
    }
}

#[tokio::test]
async fn duplicate_upload_is_rejected_without_billing() {
    let env = setup().await;
    let caller = new_caller(&env, "dup@example.com").await;

    let text = "Warranty coverage lasts one year from the delivery date.";
    let chars = text.chars().count() as i64;

    ingest(&env, &caller, "warranty.txt", text).await.unwrap();
    let after_first = env.ledger.get(&caller.tenant_id).await.unwrap();
    assert_eq!(after_first.ingested_chars, chars);
    assert_eq!(after_first.stored_chars, chars);

    // Same content under a different filename is still the same document.
    let err = ingest(&env, &caller, "warranty-copy.txt", text)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::DuplicateDocument(_)));

    let after_second = env.ledger.get(&caller.tenant_id).await.unwrap();
    assert_eq!(after_second.ingested_chars, after_first.ingested_chars);
    assert_eq!(after_second.stored_chars, after_first.stored_chars);
}

#[tokio::test]
async fn same_content_is_allowed_for_different_keys() {
    let env = setup().await;
    let alice = new_caller(&env, "a2@example.com").await;
    let bob = new_caller(&env, "b2@example.com").await;

    let text = "Support hours are 9am to 5pm, Monday through Friday.";
    ingest(&env, &alice, "hours.txt", text).await.unwrap();
    ingest(&env, &bob, "hours.txt", text).await.unwrap();
}

#[tokio::test]
async fn delete_frees_stored_chars_and_hides_chunks() {
    let env = setup().await;
    let caller = new_caller(&env, "del@example.com").await;

    let text = "Returns must include the original packaging and receipt.";
    let chars = text.chars().count() as i64;
    let outcome = ingest(&env, &caller, "returns.txt", text).await.unwrap();

    let freed = env
        .store
        .delete(&caller.api_key_id, &outcome.document.id)
        .await
        .unwrap();
    assert_eq!(freed, chars);
    env.ledger
        .decrement_stored(&caller.tenant_id, freed)
        .await
        .unwrap();

    let usage = env.ledger.get(&caller.tenant_id).await.unwrap();
    assert_eq!(usage.stored_chars, 0);
    // Monthly flow is not refunded by deletion.
    assert_eq!(usage.ingested_chars, chars);

    let hits = env
        .retrieval
        .retrieve(&caller.api_key_id, "original packaging")
        .await
        .unwrap();
    assert!(hits.is_empty());

    // The same content can be re-uploaded after deletion.
    ingest(&env, &caller, "returns.txt", text).await.unwrap();
}

#[tokio::test]
async fn failed_chunk_upsert_leaves_nothing_visible_and_allows_retry() {
    let tmp = TempDir::new().unwrap();
    let pool = connect(&tmp.path().join("kb.sqlite")).await.unwrap();
    run_migrations(&pool).await.unwrap();
    seed_plans(&pool).await.unwrap();

    let registry = Registry::new(pool.clone());
    let ledger = UsageLedger::new(pool.clone());
    let embedder: Arc<dyn kbserve::embedding::Embedder> = Arc::new(HashEmbedder::new(128));
    let vectors: Arc<dyn VectorStore> = Arc::new(FlakyVectorStore {
        inner: SqliteVectorStore::new(pool.clone()),
        calls: AtomicUsize::new(0),
        fail_on_call: 1,
    });
    // Small chunk budget so the document spans two chunks and the second
    // upsert can fail.
    let store = DocumentStore::new(pool.clone(), vectors.clone(), embedder.clone(), 40);
    let retrieval = RetrievalGateway::new(embedder, vectors, 3);

    let tenant = registry
        .create_tenant("flaky@example.com", "free")
        .await
        .unwrap();
    let raw = registry.create_key(&tenant.id, None).await.unwrap();
    let auth = registry.resolve_api_key(&raw).await.unwrap();

    let text = "Refunds are issued within 30 days.\n\nExchanges are free for members.";
    let request = || IngestRequest {
        api_key_id: &auth.api_key.id,
        tenant_id: &tenant.id,
        plan: &auth.plan,
        filename: "policy.txt",
        text,
    };

    let err = run_ingest(&store, &ledger, MAX_UPLOAD, request())
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Upstream(_)));

    // The half-written document stays pending: invisible to listing and
    // retrieval, and nothing is billed.
    assert!(store.list(&auth.api_key.id).await.unwrap().is_empty());
    assert!(retrieval
        .retrieve(&auth.api_key.id, "refund policy")
        .await
        .unwrap()
        .is_empty());
    let usage = ledger.get(&tenant.id).await.unwrap();
    assert_eq!(usage.ingested_chars, 0);
    assert_eq!(usage.stored_chars, 0);

    // Retrying the same content clears the stale pending attempt and lands.
    let outcome = run_ingest(&store, &ledger, MAX_UPLOAD, request())
        .await
        .unwrap();
    assert_eq!(outcome.chunks_added, 2);
    assert_eq!(store.list(&auth.api_key.id).await.unwrap().len(), 1);

    let usage = ledger.get(&tenant.id).await.unwrap();
    assert_eq!(usage.ingested_chars, outcome.chars_added);
    assert_eq!(usage.stored_chars, outcome.chars_added);

    assert!(!retrieval
        .retrieve(&auth.api_key.id, "refund policy")
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn deleting_a_foreign_document_is_not_found() {
    let env = setup().await;
    let alice = new_caller(&env, "a3@example.com").await;
    let bob = new_caller(&env, "b3@example.com").await;

    let outcome = ingest(&env, &alice, "doc.txt", "Tenant A's private notes about pricing.")
        .await
        .unwrap();

    let err = env
        .store
        .delete(&bob.api_key_id, &outcome.document.id)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::NotFound(_)));
}

#[tokio::test]
async fn ingest_quota_boundary_is_exact() {
    let env = setup().await;
    let caller = new_caller(&env, "quota@example.com").await;

    // free plan: 100_000 ingested chars per period.
    sqlx::query("UPDATE usage SET ingested_chars = 99990 WHERE tenant_id = ?")
        .bind(&caller.tenant_id)
        .execute(&env.pool)
        .await
        .unwrap();

    // 11 chars would land at 100_001.
    let err = ingest(&env, &caller, "over.txt", "12345678901")
        .await
        .unwrap_err();
    match err {
        ServiceError::QuotaExceeded { kind, .. } => assert_eq!(kind, QuotaKind::Ingestion),
        other => panic!("expected quota rejection, got {:?}", other),
    }

    // A rejected ingest bills nothing and stores nothing.
    let usage = env.ledger.get(&caller.tenant_id).await.unwrap();
    assert_eq!(usage.ingested_chars, 99_990);
    assert_eq!(usage.stored_chars, 0);

    // 10 chars lands exactly on the limit.
    ingest(&env, &caller, "exact.txt", "1234567890").await.unwrap();
    let usage = env.ledger.get(&caller.tenant_id).await.unwrap();
    assert_eq!(usage.ingested_chars, 100_000);
}

#[tokio::test]
async fn storage_quota_is_separate_from_ingestion_flow() {
    let env = setup().await;
    let caller = new_caller(&env, "storage@example.com").await;

    // free plan: 200_000 stored chars. Flow counter stays low.
    sqlx::query("UPDATE usage SET stored_chars = 199995 WHERE tenant_id = ?")
        .bind(&caller.tenant_id)
        .execute(&env.pool)
        .await
        .unwrap();

    let err = ingest(&env, &caller, "full.txt", "1234567890")
        .await
        .unwrap_err();
    match err {
        ServiceError::QuotaExceeded { kind, .. } => assert_eq!(kind, QuotaKind::Storage),
        other => panic!("expected storage rejection, got {:?}", other),
    }
}

#[tokio::test]
async fn chat_records_tokens_from_actual_output() {
    let env = setup().await;
    let caller = new_caller(&env, "chat@example.com").await;

    ingest(
        &env,
        &caller,
        "refunds.txt",
        "Refund policy: customers receive full refunds within 30 days of purchase.",
    )
    .await
    .unwrap();

    let generator = ScriptedGenerator::new(&["Refunds are available ", "within 30 days."]);
    let outcome = run_chat(
        &env.retrieval,
        &generator,
        &env.ledger,
        ChatRequest {
            api_key_id: &caller.api_key_id,
            tenant_id: &caller.tenant_id,
            plan: &caller.plan,
            question: "What is the refund policy?",
        },
    )
    .await
    .unwrap();

    assert_eq!(outcome.answer, "Refunds are available within 30 days.");
    // Question (26 chars) + answer (37 chars) = 63 chars -> ceil(63/4) = 16.
    // Retrieved context in the prompt is not part of the bill.
    assert_eq!(outcome.tokens_used, 16);

    let usage = env.ledger.get(&caller.tenant_id).await.unwrap();
    assert_eq!(usage.chat_tokens, 16);
}

#[tokio::test]
async fn chat_with_empty_knowledge_base_is_not_found() {
    let env = setup().await;
    let caller = new_caller(&env, "empty@example.com").await;

    let generator = ScriptedGenerator::new(&["never called"]);
    let err = run_chat(
        &env.retrieval,
        &generator,
        &env.ledger,
        ChatRequest {
            api_key_id: &caller.api_key_id,
            tenant_id: &caller.tenant_id,
            plan: &caller.plan,
            question: "Anything there?",
        },
    )
    .await
    .unwrap_err();

    assert!(matches!(err, ServiceError::NotFound(_)));
    let usage = env.ledger.get(&caller.tenant_id).await.unwrap();
    assert_eq!(usage.chat_tokens, 0);
}

#[tokio::test]
async fn completed_stream_records_tokens_and_ends_with_done() {
    let env = setup().await;
    let caller = new_caller(&env, "stream@example.com").await;

    ingest(&env, &caller, "faq.txt", "Orders ship within two business days.")
        .await
        .unwrap();

    let generator = Box::new(ScriptedGenerator::new(&["Two ", "business ", "days."]));
    let stream = run_chat_stream(
        &env.retrieval,
        generator,
        env.ledger.clone(),
        512,
        ChatRequest {
            api_key_id: &caller.api_key_id,
            tenant_id: &caller.tenant_id,
            plan: &caller.plan,
            question: "How fast is shipping?",
        },
    )
    .await
    .unwrap();

    let frames: Vec<String> = stream.map(|f| f.unwrap()).collect().await;
    assert_eq!(frames.last().unwrap(), "[DONE]");
    assert_eq!(frames[..frames.len() - 1].concat(), "Two business days.");

    // Question (21 chars) + streamed answer (18 chars) = 39 -> ceil(39/4) = 10.
    let usage = env.ledger.get(&caller.tenant_id).await.unwrap();
    assert_eq!(usage.chat_tokens, 10);
}

#[tokio::test]
async fn abandoned_stream_bills_nothing() {
    let env = setup().await;
    let caller = new_caller(&env, "cancel@example.com").await;

    ingest(&env, &caller, "faq.txt", "Orders ship within two business days.")
        .await
        .unwrap();

    let generator = Box::new(ScriptedGenerator::new(&["a", "b", "c", "d", "e"]));
    let mut stream = run_chat_stream(
        &env.retrieval,
        generator,
        env.ledger.clone(),
        512,
        ChatRequest {
            api_key_id: &caller.api_key_id,
            tenant_id: &caller.tenant_id,
            plan: &caller.plan,
            question: "How fast is shipping?",
        },
    )
    .await
    .unwrap();

    // Client reads two fragments, then disconnects.
    assert_eq!(stream.next().await.unwrap().unwrap(), "a");
    assert_eq!(stream.next().await.unwrap().unwrap(), "b");
    drop(stream);

    let usage = env.ledger.get(&caller.tenant_id).await.unwrap();
    assert_eq!(usage.chat_tokens, 0);
}

#[tokio::test]
async fn upstream_failure_mid_stream_emits_error_frame_and_bills_nothing() {
    let env = setup().await;
    let caller = new_caller(&env, "fail@example.com").await;

    ingest(&env, &caller, "faq.txt", "Orders ship within two business days.")
        .await
        .unwrap();

    let generator = Box::new(ScriptedGenerator {
        fragments: vec!["partial ".to_string(), "answer".to_string()],
        fail_after: Some(1),
    });
    let stream = run_chat_stream(
        &env.retrieval,
        generator,
        env.ledger.clone(),
        512,
        ChatRequest {
            api_key_id: &caller.api_key_id,
            tenant_id: &caller.tenant_id,
            plan: &caller.plan,
            question: "How fast is shipping?",
        },
    )
    .await
    .unwrap();

    let frames: Vec<String> = stream.map(|f| f.unwrap()).collect().await;
    assert_eq!(frames[0], "partial ");
    assert!(frames.last().unwrap().starts_with("[ERROR]"));
    assert!(!frames.contains(&"[DONE]".to_string()));

    let usage = env.ledger.get(&caller.tenant_id).await.unwrap();
    assert_eq!(usage.chat_tokens, 0);
}

#[tokio::test]
async fn stream_pre_check_rejects_an_exhausted_token_budget() {
    let env = setup().await;
    let caller = new_caller(&env, "budget@example.com").await;

    ingest(&env, &caller, "faq.txt", "Orders ship within two business days.")
        .await
        .unwrap();

    // free plan: 50_000 chat tokens.
    sqlx::query("UPDATE usage SET chat_tokens = 50000 WHERE tenant_id = ?")
        .bind(&caller.tenant_id)
        .execute(&env.pool)
        .await
        .unwrap();

    let generator = Box::new(ScriptedGenerator::new(&["never called"]));
    let err = run_chat_stream(
        &env.retrieval,
        generator,
        env.ledger.clone(),
        512,
        ChatRequest {
            api_key_id: &caller.api_key_id,
            tenant_id: &caller.tenant_id,
            plan: &caller.plan,
            question: "How fast is shipping?",
        },
    )
    .await
    .err()
    .expect("stream should be rejected before any generation");

    match err {
        ServiceError::QuotaExceeded { kind, .. } => assert_eq!(kind, QuotaKind::ChatTokens),
        other => panic!("expected token rejection, got {:?}", other),
    }
}

#[tokio::test]
async fn revoked_key_no_longer_resolves() {
    let env = setup().await;
    let tenant = env
        .registry
        .create_tenant("revoke@example.com", "free")
        .await
        .unwrap();
    let raw = env.registry.create_key(&tenant.id, None).await.unwrap();
    let auth = env.registry.resolve_api_key(&raw).await.unwrap();

    env.registry.revoke_key(&auth.api_key.id).await.unwrap();

    let err = env.registry.resolve_api_key(&raw).await.unwrap_err();
    assert!(matches!(err, ServiceError::Unauthorized));
}

#[tokio::test]
async fn deactivated_tenant_is_frozen_but_data_survives() {
    let env = setup().await;
    let caller = new_caller(&env, "freeze@example.com").await;
    ingest(&env, &caller, "doc.txt", "Some retained content.")
        .await
        .unwrap();

    env.registry
        .set_tenant_active(&caller.tenant_id, false)
        .await
        .unwrap();

    // A fresh key for the frozen tenant still fails resolution.
    let raw = env.registry.create_key(&caller.tenant_id, None).await.unwrap();
    let err = env.registry.resolve_api_key(&raw).await.unwrap_err();
    assert!(matches!(err, ServiceError::Unauthorized));

    env.registry
        .set_tenant_active(&caller.tenant_id, true)
        .await
        .unwrap();
    env.registry.resolve_api_key(&raw).await.unwrap();

    let docs = env.store.list(&caller.api_key_id).await.unwrap();
    assert_eq!(docs.len(), 1);
}

#[tokio::test]
async fn period_reset_keeps_the_storage_high_water_mark() {
    let env = setup().await;
    let caller = new_caller(&env, "reset@example.com").await;

    let text = "Loyalty members earn double points every October.";
    let chars = text.chars().count() as i64;
    ingest(&env, &caller, "promo.txt", text).await.unwrap();
    env.ledger.record_chat(&caller.tenant_id, 42).await.unwrap();

    env.ledger.reset_period(&caller.tenant_id).await.unwrap();

    let usage = env.ledger.get(&caller.tenant_id).await.unwrap();
    assert_eq!(usage.ingested_chars, 0);
    assert_eq!(usage.chat_tokens, 0);
    assert_eq!(usage.stored_chars, chars);
}

#[tokio::test]
async fn single_upload_ceiling_applies_before_plan_quota() {
    let env = setup().await;
    let caller = new_caller(&env, "ceiling@example.com").await;

    let big = "x".repeat(11);
    let err = run_ingest(
        &env.store,
        &env.ledger,
        10,
        IngestRequest {
            api_key_id: &caller.api_key_id,
            tenant_id: &caller.tenant_id,
            plan: &caller.plan,
            filename: "big.txt",
            text: &big,
        },
    )
    .await
    .unwrap_err();

    assert!(matches!(err, ServiceError::QuotaExceeded { .. }));
}
