//! End-to-end tests for the knowledge-base pipeline.
//!
//! Everything runs against `InMemoryStore` with scripted embedding
//! providers, so the tests exercise the processor, archiver and search
//! exactly as the SQLite-backed CLI does, minus the I/O.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chat_kb_core::archiver::SessionArchiver;
use chat_kb_core::config::PipelineConfig;
use chat_kb_core::embedding::EmbeddingProvider;
use chat_kb_core::error::{PipelineError, ProviderError};
use chat_kb_core::ingest::ingest_document;
use chat_kb_core::models::{
    ChatSession, ChunkLocation, Message, NewChunk, NewSource, Role, SessionStatus, SessionType,
    SourceStatus, SourceType,
};
use chat_kb_core::processor::EmbeddingProcessor;
use chat_kb_core::search::{similarity_search, SearchFilters};
use chat_kb_core::store::memory::InMemoryStore;
use chat_kb_core::store::{KnowledgeStore, SessionStore};
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::{json, Value};

const DIMS: usize = 4;

// ─── Scripted providers ─────────────────────────────────────────────

/// Returns a deterministic vector per text and fails any batch containing
/// a text with `poison` in it.
struct ScriptedProvider {
    calls: AtomicUsize,
    poison: Option<&'static str>,
    failure: fn(String) -> ProviderError,
}

impl ScriptedProvider {
    fn healthy() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            poison: None,
            failure: ProviderError::Transient,
        }
    }

    fn failing_on(poison: &'static str, failure: fn(String) -> ProviderError) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            poison: Some(poison),
            failure,
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

fn vector_for(text: &str) -> Vec<f32> {
    let mut v = vec![0.1f32; DIMS];
    for (i, b) in text.bytes().enumerate() {
        v[i % DIMS] += f32::from(b) / 255.0;
    }
    v
}

#[async_trait]
impl EmbeddingProvider for ScriptedProvider {
    fn model_name(&self) -> &str {
        "scripted"
    }

    fn dims(&self) -> usize {
        DIMS
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(poison) = self.poison {
            if texts.iter().any(|t| t.contains(poison)) {
                return Err((self.failure)(format!("scripted failure on {poison:?}")));
            }
        }
        Ok(texts.iter().map(|t| vector_for(t)).collect())
    }
}

// ─── Helpers ────────────────────────────────────────────────────────

fn config(batch_size: usize, max_concurrent: usize) -> PipelineConfig {
    PipelineConfig {
        batch_size,
        max_concurrent,
        embedding_dims: DIMS,
        ..PipelineConfig::default()
    }
}

async fn add_source(
    store: &InMemoryStore,
    source_type: SourceType,
    uri: &str,
    metadata: Value,
    contents: &[&str],
) -> i64 {
    let sid = store
        .save_source(&NewSource {
            source_type,
            title: uri.to_string(),
            uri: uri.to_string(),
            metadata,
            status: SourceStatus::Pending,
        })
        .await
        .unwrap();
    for (i, content) in contents.iter().enumerate() {
        store
            .save_chunk(
                sid,
                &NewChunk {
                    content: content.to_string(),
                    location: ChunkLocation::Document {
                        url: uri.to_string(),
                        label: format!("§{}", i + 1),
                    },
                    token_count: 20,
                    hash: String::new(),
                },
            )
            .await
            .unwrap();
    }
    sid
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
}

fn session_at(key: &str, channel_id: u64, last_active: DateTime<Utc>) -> ChatSession {
    let mut s = ChatSession::new(key, SessionType::Thread, last_active - Duration::minutes(5));
    s.guild_id = Some(42);
    s.channel_id = Some(channel_id);
    s.push_message(Message {
        role: Role::User,
        content: "what port does the staging db listen on?".into(),
        timestamp: last_active - Duration::minutes(5),
    });
    s.push_message(Message {
        role: Role::Assistant,
        content: "5433, it moved off the default last spring.".into(),
        timestamp: last_active,
    });
    s
}

// ─── Embedding processor ────────────────────────────────────────────

#[tokio::test]
async fn test_all_pending_chunks_get_embedded() {
    let store = InMemoryStore::new();
    let contents = ["one", "two", "three", "four", "five"];
    let sid = add_source(&store, SourceType::DocumentFile, "file:///five", json!({}), &contents).await;

    let provider = ScriptedProvider::healthy();
    let report = EmbeddingProcessor::new(&store, &provider, config(2, 2))
        .process_pending_embeddings()
        .await
        .unwrap();

    assert_eq!(report.embedded, 5);
    assert_eq!(report.failed, 0);
    for chunk in store.all_chunks().unwrap() {
        let embedding = chunk.embedding.expect("chunk left pending");
        assert_eq!(embedding.len(), DIMS);
    }
    let source = store.get_source(sid).await.unwrap().unwrap();
    assert_eq!(source.status, SourceStatus::Completed);
}

#[tokio::test]
async fn test_second_sweep_is_a_no_op() {
    let store = InMemoryStore::new();
    add_source(&store, SourceType::DocumentFile, "file:///a", json!({}), &["a", "b", "c"]).await;

    let provider = ScriptedProvider::healthy();
    let processor = EmbeddingProcessor::new(&store, &provider, config(2, 4));
    processor.process_pending_embeddings().await.unwrap();
    let calls_after_first = provider.calls();
    let before: Vec<_> = store
        .all_chunks()
        .unwrap()
        .into_iter()
        .map(|c| (c.id, c.embedding))
        .collect();

    let report = processor.process_pending_embeddings().await.unwrap();

    assert_eq!(provider.calls(), calls_after_first);
    assert_eq!(report.batches, 0);
    assert_eq!(report.embedded, 0);
    let after: Vec<_> = store
        .all_chunks()
        .unwrap()
        .into_iter()
        .map(|c| (c.id, c.embedding))
        .collect();
    assert_eq!(before, after);
}

#[tokio::test]
async fn test_failed_batch_does_not_stop_siblings() {
    let store = InMemoryStore::new();
    let healthy = add_source(
        &store,
        SourceType::DocumentFile,
        "file:///healthy",
        json!({}),
        &["alpha", "beta", "gamma"],
    )
    .await;
    let broken = add_source(
        &store,
        SourceType::DocumentFile,
        "file:///broken",
        json!({}),
        &["delta", "poison pill"],
    )
    .await;

    let provider = ScriptedProvider::failing_on("poison", ProviderError::Transient);
    let report = EmbeddingProcessor::new(&store, &provider, config(1, 3))
        .process_pending_embeddings()
        .await
        .unwrap();

    assert_eq!(report.batches, 5);
    assert_eq!(report.failed_batches, 1);
    assert_eq!(report.embedded, 4);
    assert_eq!(report.failed, 1);

    let chunks = store.all_chunks().unwrap();
    for chunk in &chunks {
        assert_eq!(chunk.is_pending(), chunk.content.contains("poison"));
    }

    // Completed iff every chunk of the source is embedded.
    let healthy = store.get_source(healthy).await.unwrap().unwrap();
    let broken = store.get_source(broken).await.unwrap().unwrap();
    assert_eq!(healthy.status, SourceStatus::Completed);
    assert_eq!(broken.status, SourceStatus::Pending);
}

#[tokio::test]
async fn test_failed_chunks_retried_on_next_sweep() {
    let store = InMemoryStore::new();
    let sid = add_source(
        &store,
        SourceType::DocumentFile,
        "file:///retry",
        json!({}),
        &["fine", "poison"],
    )
    .await;

    let flaky = ScriptedProvider::failing_on("poison", ProviderError::Transient);
    EmbeddingProcessor::new(&store, &flaky, config(1, 2))
        .process_pending_embeddings()
        .await
        .unwrap();
    assert_eq!(store.pending_chunk_count(sid).await.unwrap(), 1);

    let healthy = ScriptedProvider::healthy();
    let report = EmbeddingProcessor::new(&store, &healthy, config(1, 2))
        .process_pending_embeddings()
        .await
        .unwrap();
    assert_eq!(healthy.calls(), 1);
    assert_eq!(report.embedded, 1);
    assert_eq!(report.sources_completed, 1);
    let source = store.get_source(sid).await.unwrap().unwrap();
    assert_eq!(source.status, SourceStatus::Completed);
}

#[tokio::test]
async fn test_every_batch_failing_is_surfaced() {
    let store = InMemoryStore::new();
    add_source(&store, SourceType::DocumentFile, "file:///x", json!({}), &["poison a", "poison b"]).await;

    let provider = ScriptedProvider::failing_on("poison", ProviderError::Transient);
    let err = EmbeddingProcessor::new(&store, &provider, config(1, 2))
        .process_pending_embeddings()
        .await
        .unwrap_err();
    match err {
        PipelineError::AllBatchesFailed { failed, last } => {
            assert_eq!(failed, 2);
            assert!(last.is_transient());
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(store.all_chunks().unwrap().iter().all(|c| c.is_pending()));
}

#[tokio::test]
async fn test_permanent_failure_everywhere_halts_sweep() {
    let store = InMemoryStore::new();
    let contents: Vec<String> = (0..6).map(|i| format!("poison {i}")).collect();
    let refs: Vec<&str> = contents.iter().map(String::as_str).collect();
    add_source(&store, SourceType::DocumentFile, "file:///auth", json!({}), &refs).await;

    let provider = ScriptedProvider::failing_on("poison", ProviderError::Permanent);
    let err = EmbeddingProcessor::new(&store, &provider, config(1, 2))
        .process_pending_embeddings()
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::Provider(ProviderError::Permanent(_))));
    // Only the first page (2 batches) was attempted.
    assert_eq!(provider.calls(), 2);
}

// ─── Similarity search ──────────────────────────────────────────────

async fn embedded_corpus() -> InMemoryStore {
    let store = InMemoryStore::new();
    add_source(
        &store,
        SourceType::DiscordSession,
        "discord-session://thread:1",
        json!({"channel_id": 111111, "guild_id": 42}),
        &["deploys happen on tuesdays"],
    )
    .await;
    add_source(
        &store,
        SourceType::DiscordSession,
        "discord-session://thread:2",
        json!({"channel_id": 222222, "guild_id": 42}),
        &["deploys are frozen in december"],
    )
    .await;
    add_source(
        &store,
        SourceType::DocumentFile,
        "file:///runbook.md",
        json!({"path": "runbook.md"}),
        &["runbook: how to deploy", "runbook: rollback steps"],
    )
    .await;

    let provider = ScriptedProvider::healthy();
    EmbeddingProcessor::new(&store, &provider, config(8, 2))
        .process_pending_embeddings()
        .await
        .unwrap();
    store
}

#[tokio::test]
async fn test_search_respects_top_k_and_bounds() {
    let store = embedded_corpus().await;
    let query = vector_for("deploy");

    for top_k in [0, 1, 2, 10] {
        let results = similarity_search(&store, &config(8, 2), &query, top_k, &SearchFilters::new())
            .await
            .unwrap();
        assert!(results.len() <= top_k);
        assert_eq!(results.len(), top_k.min(4));
        for r in &results {
            assert!((0.0..=1.0).contains(&r.similarity));
        }
        for pair in results.windows(2) {
            assert!(
                pair[0].similarity > pair[1].similarity
                    || (pair[0].similarity == pair[1].similarity
                        && pair[0].chunk_id < pair[1].chunk_id)
            );
        }
    }
}

#[tokio::test]
async fn test_channel_filter_isolates_sources() {
    let store = embedded_corpus().await;
    let filters = SearchFilters::from_json(&json!({"channel_id": 111111})).unwrap();

    let results = similarity_search(&store, &config(8, 2), &vector_for("deploy"), 10, &filters)
        .await
        .unwrap();

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].content, "deploys happen on tuesdays");
    assert_eq!(results[0].source_metadata["channel_id"], json!(111111));
}

#[tokio::test]
async fn test_source_type_filter_excludes_documents() {
    let store = embedded_corpus().await;
    let filters = SearchFilters::from_json(&json!({"source_type": "discord_session"})).unwrap();

    let results = similarity_search(&store, &config(8, 2), &vector_for("deploy"), 10, &filters)
        .await
        .unwrap();

    assert_eq!(results.len(), 2);
    assert!(results
        .iter()
        .all(|r| r.source_type == SourceType::DiscordSession));
}

#[tokio::test]
async fn test_search_skips_pending_chunks() {
    let store = InMemoryStore::new();
    add_source(&store, SourceType::DocumentFile, "file:///p", json!({}), &["not embedded"]).await;

    let results = similarity_search(
        &store,
        &config(8, 2),
        &vector_for("x"),
        5,
        &SearchFilters::new(),
    )
    .await
    .unwrap();
    assert!(results.is_empty());
}

#[tokio::test]
async fn test_search_rejects_wrong_query_dimension() {
    let store = embedded_corpus().await;
    let err = similarity_search(&store, &config(8, 2), &[1.0, 0.0], 5, &SearchFilters::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PipelineError::DimensionMismatch {
            expected: DIMS,
            actual: 2
        }
    ));
}

/// Embeds every text as the same fixed vector.
struct ConstantProvider(Vec<f32>);

#[async_trait]
impl EmbeddingProvider for ConstantProvider {
    fn model_name(&self) -> &str {
        "constant"
    }

    fn dims(&self) -> usize {
        DIMS
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        Ok(texts.iter().map(|_| self.0.clone()).collect())
    }
}

#[tokio::test]
async fn test_huge_magnitudes_still_score_in_range() {
    let store = InMemoryStore::new();
    add_source(&store, SourceType::DocumentFile, "file:///big", json!({}), &["big"]).await;
    let huge = vec![1e20f32, 0.0, 0.0, 0.0];
    EmbeddingProcessor::new(&store, &ConstantProvider(huge.clone()), config(8, 2))
        .process_pending_embeddings()
        .await
        .unwrap();

    let results = similarity_search(&store, &config(8, 2), &huge, 5, &SearchFilters::new())
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    assert!(!results[0].similarity.is_nan());
    assert!((results[0].similarity - 1.0).abs() < 1e-6);

    let opposite = [-f32::MAX, 0.0, 0.0, 0.0];
    let results = similarity_search(&store, &config(8, 2), &opposite, 5, &SearchFilters::new())
        .await
        .unwrap();
    assert!((0.0..=1.0).contains(&results[0].similarity));
    assert!(results[0].similarity < 1e-6);
}

#[tokio::test]
async fn test_search_rejects_non_finite_query() {
    let store = embedded_corpus().await;
    for query in [[f32::NAN, 0.0, 0.0, 0.0], [f32::INFINITY, 1.0, 0.0, 0.0]] {
        let err = similarity_search(&store, &config(8, 2), &query, 5, &SearchFilters::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::NonFiniteEmbedding));
    }
}

#[tokio::test]
async fn test_non_finite_embeddings_are_never_stored() {
    let store = InMemoryStore::new();
    let sid = add_source(
        &store,
        SourceType::DocumentFile,
        "file:///nan",
        json!({}),
        &["a", "b"],
    )
    .await;

    let err = EmbeddingProcessor::new(
        &store,
        &ConstantProvider(vec![f32::NAN, 0.0, 0.0, 0.0]),
        config(8, 2),
    )
    .process_pending_embeddings()
    .await
    .unwrap_err();
    assert!(matches!(err, PipelineError::Provider(ProviderError::Permanent(_))));

    assert_eq!(store.pending_chunk_count(sid).await.unwrap(), 2);
    let source = store.get_source(sid).await.unwrap().unwrap();
    assert_eq!(source.status, SourceStatus::Pending);
}

// ─── Session archiver ───────────────────────────────────────────────

#[tokio::test]
async fn test_stale_session_archived_recent_untouched() {
    let store = InMemoryStore::new();
    let now = t0();
    store
        .save_session(&session_at("thread:100", 111111, now - Duration::hours(30)))
        .await
        .unwrap();
    store
        .save_session(&session_at("thread:200", 222222, now - Duration::hours(2)))
        .await
        .unwrap();

    let provider = ScriptedProvider::healthy();
    let cfg = config(8, 2);
    let archiver = SessionArchiver::new(&store, &store, cfg.clone())
        .with_processor(EmbeddingProcessor::new(&store, &provider, cfg));
    let report = archiver.archive_inactive_sessions_at(now).await.unwrap();

    assert_eq!(report.due, 1);
    assert_eq!(report.archived, 1);
    assert!(report.chunks_created >= 1);
    assert_eq!(report.embedding.as_ref().map(|e| e.embedded), Some(report.chunks_created));

    let stale = store.load_session("thread:100").await.unwrap().unwrap();
    let recent = store.load_session("thread:200").await.unwrap().unwrap();
    assert_eq!(stale.status, SessionStatus::Archived);
    assert_eq!(recent.status, SessionStatus::Active);

    let source = store
        .find_source_by_uri(SourceType::DiscordSession, "discord-session://thread:100")
        .await
        .unwrap()
        .expect("archived session has a source");
    assert_eq!(source.metadata["channel_id"], json!(111111));
    assert_eq!(source.status, SourceStatus::Completed);
    let chunks = store.chunks_for_source(source.id).await.unwrap();
    assert!(!chunks.is_empty());
    assert!(chunks.iter().all(|c| !c.content.trim().is_empty()));

    assert!(store
        .find_source_by_uri(SourceType::DiscordSession, "discord-session://thread:200")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_archive_without_processor_leaves_chunks_pending() {
    let store = InMemoryStore::new();
    let now = t0();
    store
        .save_session(&session_at("thread:7", 111111, now - Duration::days(2)))
        .await
        .unwrap();

    let report = SessionArchiver::new(&store, &store, config(8, 2))
        .archive_inactive_sessions_at(now)
        .await
        .unwrap();

    assert_eq!(report.archived, 1);
    assert!(report.embedding.is_none());
    assert!(store.all_chunks().unwrap().iter().all(|c| c.is_pending()));
}

#[tokio::test]
async fn test_archive_survives_embedding_failure() {
    let store = InMemoryStore::new();
    let now = t0();
    store
        .save_session(&session_at("thread:8", 111111, now - Duration::days(2)))
        .await
        .unwrap();

    let provider = ScriptedProvider::failing_on("port", ProviderError::Permanent);
    let cfg = config(8, 2);
    let report = SessionArchiver::new(&store, &store, cfg.clone())
        .with_processor(EmbeddingProcessor::new(&store, &provider, cfg))
        .archive_inactive_sessions_at(now)
        .await
        .unwrap();

    assert_eq!(report.archived, 1);
    assert!(report.embedding_error.is_some());
    let session = store.load_session("thread:8").await.unwrap().unwrap();
    assert!(session.is_archived());
    assert!(store.all_chunks().unwrap().iter().all(|c| c.is_pending()));
}

#[tokio::test]
async fn test_archived_session_rejects_new_messages() {
    let store = InMemoryStore::new();
    let now = t0();
    let session = session_at("thread:9", 111111, now - Duration::days(2));
    store.save_session(&session).await.unwrap();
    SessionArchiver::new(&store, &store, config(8, 2))
        .archive_inactive_sessions_at(now)
        .await
        .unwrap();

    let late = Message {
        role: Role::User,
        content: "anyone there?".into(),
        timestamp: now,
    };
    assert!(store.append_message(&session, &late).await.is_err());
}

// ─── Zero-content sources ───────────────────────────────────────────

#[tokio::test]
async fn test_zero_content_sources_complete_with_no_chunks() {
    let store = InMemoryStore::new();
    let now = t0();

    let mut blank = ChatSession::new("mention:5", SessionType::Mention, now - Duration::days(3));
    blank.push_message(Message {
        role: Role::User,
        content: "   ".into(),
        timestamp: now - Duration::days(3),
    });
    store.save_session(&blank).await.unwrap();

    let report = SessionArchiver::new(&store, &store, config(8, 2))
        .archive_inactive_sessions_at(now)
        .await
        .unwrap();
    assert_eq!(report.archived, 1);
    assert_eq!(report.chunks_created, 0);

    let doc = ingest_document(&store, &config(8, 2), "file:///blank.md", "blank", "\n\n", json!({}))
        .await
        .unwrap();
    assert_eq!(doc.chunks, 0);

    let sources = store.list_sources(None).await.unwrap();
    assert_eq!(sources.len(), 2);
    for source in sources {
        assert_eq!(source.status, SourceStatus::Completed);
        assert!(store.chunks_for_source(source.id).await.unwrap().is_empty());
    }
}
