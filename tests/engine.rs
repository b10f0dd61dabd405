//! End-to-end engine tests over the in-memory store with scripted
//! chat/embedding fakes: tenant isolation, hybrid fusion and fallback, and
//! the corrective pipeline's control flow.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use quarry::access::{AccessFilter, SharingGrant};
use quarry::chat::{ChatMessage, ChatProvider};
use quarry::config::ChunkingConfig;
use quarry::embedding::Embedder;
use quarry::error::{Error, Result};
use quarry::ingest::{IngestRequest, Ingestor};
use quarry::models::Caller;
use quarry::retriever::{format_citations, CorrectiveRetriever, RetrieveRequest};
use quarry::search::{SearchEngine, SearchMode};
use quarry::store::memory::InMemoryStore;
use quarry::store::{FieldFilter, Store};

// ============ Fakes ============

/// Deterministic embedder: letter-frequency vectors, so texts sharing words
/// land near each other. Dimension is fixed at 26.
struct BagEmbedder;

fn letter_vector(text: &str) -> Vec<f32> {
    let mut v = vec![0.0f32; 26];
    for c in text.to_lowercase().chars() {
        if c.is_ascii_lowercase() {
            v[(c as u8 - b'a') as usize] += 1.0;
        }
    }
    v
}

#[async_trait]
impl Embedder for BagEmbedder {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| letter_vector(t)).collect())
    }

    fn model_name(&self) -> &str {
        "bag-of-letters"
    }

    fn dims(&self) -> usize {
        26
    }
}

/// Embedder that always fails, to exercise the hybrid fallback path.
struct BrokenEmbedder;

#[async_trait]
impl Embedder for BrokenEmbedder {
    async fn embed_batch(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Err(Error::upstream("embedding endpoint unreachable"))
    }

    fn model_name(&self) -> &str {
        "broken"
    }

    fn dims(&self) -> usize {
        26
    }
}

/// Chat provider that replays a scripted sequence of responses.
struct ScriptedChat {
    replies: Mutex<VecDeque<Result<String>>>,
}

impl ScriptedChat {
    fn new(replies: Vec<Result<String>>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into_iter().collect()),
        })
    }
}

#[async_trait]
impl ChatProvider for ScriptedChat {
    async fn complete(&self, _messages: &[ChatMessage]) -> Result<String> {
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(Error::upstream("script exhausted")))
    }
}

/// Chat provider that hangs long enough for any deadline to expire.
struct SlowChat;

#[async_trait]
impl ChatProvider for SlowChat {
    async fn complete(&self, _messages: &[ChatMessage]) -> Result<String> {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok("too late".to_string())
    }
}

/// Store wrapper whose search legs report a cold index.
struct ColdStore(InMemoryStore);

#[async_trait]
impl Store for ColdStore {
    async fn upsert_document(&self, doc: &quarry::models::Document) -> Result<String> {
        self.0.upsert_document(doc).await
    }

    async fn replace_chunks(
        &self,
        document_id: &str,
        chunks: &[quarry::models::Chunk],
    ) -> Result<()> {
        self.0.replace_chunks(document_id, chunks).await
    }

    async fn get_document(
        &self,
        id: &str,
        access: &AccessFilter,
    ) -> Result<quarry::models::Document> {
        self.0.get_document(id, access).await
    }

    async fn update_sharing(
        &self,
        id: &str,
        grant: &SharingGrant,
        caller: &Caller,
    ) -> Result<quarry::models::Document> {
        self.0.update_sharing(id, grant, caller).await
    }

    async fn delete_document(&self, id: &str, caller: &Caller) -> Result<()> {
        self.0.delete_document(id, caller).await
    }

    async fn keyword_search(
        &self,
        _query: &str,
        _limit: usize,
        _access: &AccessFilter,
        _filter: Option<&FieldFilter>,
    ) -> Result<Vec<quarry::store::ChunkHit>> {
        Err(Error::IndexNotReady("chunks_fts".to_string()))
    }

    async fn vector_search(
        &self,
        _query_vec: &[f32],
        _limit: usize,
        _access: &AccessFilter,
        _filter: Option<&FieldFilter>,
    ) -> Result<Vec<quarry::store::ChunkHit>> {
        Err(Error::IndexNotReady("chunk_vectors".to_string()))
    }
}

// ============ Setup helpers ============

fn caller(id: &str) -> Caller {
    Caller {
        id: id.to_string(),
        label: format!("{id}@example.com"),
        groups: vec![],
        is_admin: false,
    }
}

fn admin() -> Caller {
    Caller {
        id: "root".to_string(),
        label: "root@example.com".to_string(),
        groups: vec![],
        is_admin: true,
    }
}

fn auth_guide_request() -> IngestRequest {
    IngestRequest {
        content: "Authentication is the process of verifying identity.".to_string(),
        title: "Auth Guide".to_string(),
        source: "https://example.com/auth".to_string(),
        owner_id: "alice".to_string(),
        owner_label: "alice@example.com".to_string(),
        ..IngestRequest::default()
    }
}

async fn ingest_auth_guide(store: Arc<InMemoryStore>) -> String {
    let ingestor = Ingestor::new(
        store,
        Arc::new(BagEmbedder),
        None,
        ChunkingConfig::default(),
        100,
    );
    ingestor
        .ingest(auth_guide_request(), None)
        .await
        .unwrap()
        .document_id
}

fn engine(store: Arc<InMemoryStore>) -> SearchEngine {
    SearchEngine::new(store, Arc::new(BagEmbedder), 4)
}

// ============ Search + access control ============

#[tokio::test]
async fn test_owner_hybrid_search_finds_auth_guide() {
    let store = Arc::new(InMemoryStore::new());
    ingest_auth_guide(Arc::clone(&store)).await;

    let engine = engine(store);
    let access = AccessFilter::for_caller(&caller("alice"));
    let results = engine
        .hybrid_search("authentication", 5, &access, None)
        .await
        .unwrap();

    assert_eq!(results.len(), 1);
    assert!(results[0].content.contains("Authentication"));
}

#[tokio::test]
async fn test_unshared_document_invisible_to_other_caller() {
    let store = Arc::new(InMemoryStore::new());
    ingest_auth_guide(Arc::clone(&store)).await;

    let engine = engine(store);
    let access = AccessFilter::for_caller(&caller("mallory"));

    for mode in [SearchMode::Semantic, SearchMode::Text, SearchMode::Hybrid] {
        let results = engine
            .search(mode, "authentication", 5, &access, None)
            .await
            .unwrap();
        assert!(results.is_empty(), "mode {mode:?} leaked a private document");
    }
}

#[tokio::test]
async fn test_admin_sees_everything() {
    let store = Arc::new(InMemoryStore::new());
    ingest_auth_guide(Arc::clone(&store)).await;

    let engine = engine(store);
    let access = AccessFilter::for_caller(&admin());
    let results = engine
        .hybrid_search("authentication", 5, &access, None)
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
}

#[tokio::test]
async fn test_sharing_grant_makes_document_visible() {
    let store = Arc::new(InMemoryStore::new());
    let doc_id = ingest_auth_guide(Arc::clone(&store)).await;

    let engine = engine(Arc::clone(&store));
    let bob_access = AccessFilter::for_caller(&caller("bob"));

    let before = engine
        .hybrid_search("authentication", 5, &bob_access, None)
        .await
        .unwrap();
    assert!(before.is_empty());

    let mut grant = SharingGrant::default();
    grant.shared_with.insert("bob".to_string());
    store
        .update_sharing(&doc_id, &grant, &caller("alice"))
        .await
        .unwrap();

    let after = engine
        .hybrid_search("authentication", 5, &bob_access, None)
        .await
        .unwrap();
    assert_eq!(after.len(), 1);
}

#[tokio::test]
async fn test_group_grant_makes_document_visible() {
    let store = Arc::new(InMemoryStore::new());
    let doc_id = ingest_auth_guide(Arc::clone(&store)).await;

    let mut grant = SharingGrant::default();
    grant.group_ids.insert("eng".to_string());
    store
        .update_sharing(&doc_id, &grant, &caller("alice"))
        .await
        .unwrap();

    let engine = engine(store);
    let mut carol = caller("carol");
    carol.groups = vec!["eng".to_string()];
    let access = AccessFilter::for_caller(&carol);

    let results = engine
        .hybrid_search("authentication", 5, &access, None)
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
}

#[tokio::test]
async fn test_hybrid_count_never_exceeds_match_count() {
    let store = Arc::new(InMemoryStore::new());
    let ingestor = Ingestor::new(
        Arc::clone(&store) as Arc<dyn Store>,
        Arc::new(BagEmbedder),
        None,
        ChunkingConfig {
            chunk_size: 80,
            chunk_overlap: 16,
            max_chunk_size: 100,
            max_tokens: 8192,
        },
        100,
    );
    let long_content = "Authentication and authorization concepts. ".repeat(30);
    ingestor
        .ingest(
            IngestRequest {
                content: long_content,
                ..auth_guide_request()
            },
            None,
        )
        .await
        .unwrap();

    let engine = engine(store);
    let access = AccessFilter::for_caller(&caller("alice"));
    let results = engine
        .hybrid_search("authentication", 3, &access, None)
        .await
        .unwrap();
    assert!(results.len() <= 3);
    assert!(!results.is_empty());
}

#[tokio::test]
async fn test_hybrid_falls_back_to_text_when_semantic_fails() {
    let store = Arc::new(InMemoryStore::new());
    ingest_auth_guide(Arc::clone(&store)).await;

    let access = AccessFilter::for_caller(&caller("alice"));

    // Broken embedder: the semantic leg errors on every query.
    let broken_engine = SearchEngine::new(Arc::clone(&store) as Arc<dyn Store>, Arc::new(BrokenEmbedder), 4);
    let hybrid = broken_engine
        .hybrid_search("authentication", 5, &access, None)
        .await
        .unwrap();

    let text_engine = engine(Arc::clone(&store));
    let text_only = text_engine
        .text_search("authentication", 5, &access, None)
        .await
        .unwrap();

    assert_eq!(hybrid.len(), text_only.len());
    assert_eq!(hybrid[0].chunk_id, text_only[0].chunk_id);
    assert!((hybrid[0].similarity - text_only[0].similarity).abs() < 1e-9);
}

#[tokio::test]
async fn test_cold_index_yields_empty_results_not_errors() {
    let store = Arc::new(ColdStore(InMemoryStore::new()));
    let engine = SearchEngine::new(store, Arc::new(BagEmbedder), 4);
    let access = AccessFilter::for_caller(&caller("alice"));

    for mode in [SearchMode::Semantic, SearchMode::Text, SearchMode::Hybrid] {
        let results = engine
            .search(mode, "anything", 5, &access, None)
            .await
            .unwrap();
        assert!(results.is_empty());
    }
}

#[tokio::test]
async fn test_field_filter_composes_with_access() {
    let store = Arc::new(InMemoryStore::new());
    ingest_auth_guide(Arc::clone(&store)).await;

    let engine = engine(store);
    let access = AccessFilter::for_caller(&caller("alice"));

    let mut matching = FieldFilter::default();
    matching.entries.insert(
        "source".to_string(),
        "https://example.com/auth".to_string(),
    );
    let results = engine
        .hybrid_search("authentication", 5, &access, Some(&matching))
        .await
        .unwrap();
    assert_eq!(results.len(), 1);

    let mut other = FieldFilter::default();
    other
        .entries
        .insert("source".to_string(), "https://example.com/other".to_string());
    let results = engine
        .hybrid_search("authentication", 5, &access, Some(&other))
        .await
        .unwrap();
    assert!(results.is_empty());
}

#[tokio::test]
async fn test_search_validation_errors() {
    let store = Arc::new(InMemoryStore::new());
    let engine = engine(store);
    let access = AccessFilter::for_caller(&caller("alice"));

    let err = engine.hybrid_search("   ", 5, &access, None).await;
    assert!(matches!(err, Err(Error::Validation(_))));

    let err = engine.hybrid_search("q", 0, &access, None).await;
    assert!(matches!(err, Err(Error::Validation(_))));

    let err = engine.hybrid_search("q", 51, &access, None).await;
    assert!(matches!(err, Err(Error::Validation(_))));
}

// ============ Corrective pipeline ============

fn retriever(store: Arc<InMemoryStore>, chat: Arc<dyn ChatProvider>) -> CorrectiveRetriever {
    CorrectiveRetriever::new(engine(store), chat, 1)
}

fn ask(query: &str, as_caller: &Caller) -> RetrieveRequest {
    RetrieveRequest {
        query: query.to_string(),
        match_count: 5,
        mode: SearchMode::Hybrid,
        caller: as_caller.clone(),
        filter: None,
        deadline: None,
    }
}

#[tokio::test]
async fn test_decompose_no_returns_original_query() {
    let store = Arc::new(InMemoryStore::new());
    let chat = ScriptedChat::new(vec![Ok("No".to_string())]);
    let retriever = retriever(store, chat);

    let (decomposed, sub_queries) = retriever.decompose_query("what is authentication?").await;
    assert!(!decomposed);
    assert_eq!(sub_queries, vec!["what is authentication?".to_string()]);
}

#[tokio::test]
async fn test_decompose_chat_failure_degrades_to_original() {
    let store = Arc::new(InMemoryStore::new());
    let chat = ScriptedChat::new(vec![Err(Error::upstream("down"))]);
    let retriever = retriever(store, chat);

    let (decomposed, sub_queries) = retriever.decompose_query("query").await;
    assert!(!decomposed);
    assert_eq!(sub_queries, vec!["query".to_string()]);
}

#[tokio::test]
async fn test_decompose_unparseable_list_degrades_to_original() {
    let store = Arc::new(InMemoryStore::new());
    let chat = ScriptedChat::new(vec![
        Ok("yes".to_string()),
        Ok("Here are some thoughts without numbering.".to_string()),
    ]);
    let retriever = retriever(store, chat);

    let (decomposed, sub_queries) = retriever.decompose_query("query").await;
    assert!(!decomposed);
    assert_eq!(sub_queries, vec!["query".to_string()]);
}

#[tokio::test]
async fn test_decompose_yes_parses_numbered_list() {
    let store = Arc::new(InMemoryStore::new());
    let chat = ScriptedChat::new(vec![
        Ok("yes".to_string()),
        Ok("1. What is OAuth?\n2) How do sessions work?".to_string()),
    ]);
    let retriever = retriever(store, chat);

    let (decomposed, sub_queries) = retriever.decompose_query("explain auth").await;
    assert!(decomposed);
    assert_eq!(
        sub_queries,
        vec!["What is OAuth?".to_string(), "How do sessions work?".to_string()]
    );
}

#[tokio::test]
async fn test_grading_keeps_yes_drops_no() {
    let store = Arc::new(InMemoryStore::new());
    ingest_auth_guide(Arc::clone(&store)).await;

    let chat = ScriptedChat::new(vec![Ok("yes".to_string()), Ok("No".to_string())]);
    let retriever = retriever(store, chat);

    let results = vec![
        quarry::models::SearchResult {
            chunk_id: "c1".to_string(),
            document_id: "d1".to_string(),
            content: "relevant".to_string(),
            similarity: 0.9,
            metadata: Default::default(),
        },
        quarry::models::SearchResult {
            chunk_id: "c2".to_string(),
            document_id: "d2".to_string(),
            content: "irrelevant".to_string(),
            similarity: 0.8,
            metadata: Default::default(),
        },
    ];

    let graded = retriever.grade_documents("query", &results).await;
    assert_eq!(graded.len(), 2);
    assert_eq!(graded[0].result.chunk_id, "c1");
    assert_eq!(graded[0].score, 1.0);
    assert_eq!(graded[1].result.chunk_id, "c2");
    assert_eq!(graded[1].score, 0.0);

    let kept: Vec<_> = graded.iter().filter(|g| g.score >= 0.5).collect();
    assert_eq!(kept.len(), 1);
    assert_eq!(kept[0].result.chunk_id, "c1");
}

#[tokio::test]
async fn test_grading_call_failure_drops_document() {
    let store = Arc::new(InMemoryStore::new());
    let chat = ScriptedChat::new(vec![Err(Error::upstream("down"))]);
    let retriever = retriever(store, chat);

    let results = vec![quarry::models::SearchResult {
        chunk_id: "c1".to_string(),
        document_id: "d1".to_string(),
        content: "text".to_string(),
        similarity: 0.9,
        metadata: Default::default(),
    }];

    let graded = retriever.grade_documents("query", &results).await;
    assert_eq!(graded.len(), 1);
    assert_eq!(graded[0].score, 0.0);
}

#[tokio::test]
async fn test_answer_single_subquery_with_citations() {
    let store = Arc::new(InMemoryStore::new());
    ingest_auth_guide(Arc::clone(&store)).await;

    // decide: no decomposition; grade: yes; answer synthesis.
    let chat = ScriptedChat::new(vec![
        Ok("no".to_string()),
        Ok("yes".to_string()),
        Ok("Authentication verifies identity.".to_string()),
    ]);
    let retriever = retriever(store, chat);

    let answer = retriever
        .answer(&ask("what is authentication?", &caller("alice")))
        .await
        .unwrap();

    assert_eq!(answer.answer, "Authentication verifies identity.");
    assert_eq!(answer.citations.len(), 1);
    assert_eq!(answer.citations[0].id, 1);
    assert_eq!(answer.citations[0].title, "Auth Guide");
    assert_eq!(answer.sources, vec!["https://example.com/auth".to_string()]);

    let formatted = format_citations(&answer.citations);
    assert!(formatted.contains("Auth Guide"));
    assert!(formatted.contains("https://example.com/auth"));
}

#[tokio::test]
async fn test_answer_multi_subquery_synthesis() {
    let store = Arc::new(InMemoryStore::new());
    ingest_auth_guide(Arc::clone(&store)).await;

    // decide: yes; decompose: two sub-questions; one grade per unique
    // chunk (the same chunk comes back for both sub-queries); synthesis.
    let chat = ScriptedChat::new(vec![
        Ok("yes".to_string()),
        Ok("1. What is authentication?\n2. Why verify identity?".to_string()),
        Ok("yes".to_string()),
        Ok("Combined answer.".to_string()),
    ]);
    let retriever = retriever(store, chat);

    let answer = retriever
        .answer(&ask("explain authentication", &caller("alice")))
        .await
        .unwrap();

    assert_eq!(answer.answer, "Combined answer.");
    assert_eq!(answer.citations.len(), 1);
}

#[tokio::test]
async fn test_synthesis_failure_surfaces() {
    let store = Arc::new(InMemoryStore::new());
    ingest_auth_guide(Arc::clone(&store)).await;

    let chat = ScriptedChat::new(vec![
        Ok("no".to_string()),
        Ok("yes".to_string()),
        Err(Error::upstream("synthesis down")),
    ]);
    let retriever = retriever(store, chat);

    let err = retriever
        .answer(&ask("what is authentication?", &caller("alice")))
        .await;
    assert!(matches!(err, Err(Error::Upstream(_))));
}

#[tokio::test]
async fn test_pipeline_respects_access_control() {
    let store = Arc::new(InMemoryStore::new());
    ingest_auth_guide(Arc::clone(&store)).await;

    // Every stage degrades gracefully; with no visible documents the
    // pipeline must answer without leaking anything.
    let chat = ScriptedChat::new(vec![Ok("no".to_string())]);
    let retriever = retriever(store, chat);

    let answer = retriever
        .answer(&ask("what is authentication?", &caller("mallory")))
        .await
        .unwrap();
    assert!(answer.citations.is_empty());
    assert!(answer.sources.is_empty());
}

#[tokio::test]
async fn test_deadline_cancels_pipeline() {
    let store = Arc::new(InMemoryStore::new());
    ingest_auth_guide(Arc::clone(&store)).await;

    let retriever = CorrectiveRetriever::new(
        engine(Arc::clone(&store)),
        Arc::new(SlowChat),
        1,
    );

    let mut request = ask("what is authentication?", &caller("alice"));
    request.deadline = Some(Duration::from_millis(50));

    let err = retriever.answer(&request).await;
    assert!(matches!(err, Err(Error::Cancelled)));
}

#[tokio::test]
async fn test_answer_validation() {
    let store = Arc::new(InMemoryStore::new());
    let chat = ScriptedChat::new(vec![]);
    let retriever = retriever(store, chat);

    let mut request = ask("", &caller("alice"));
    assert!(matches!(
        retriever.answer(&request).await,
        Err(Error::Validation(_))
    ));

    request.query = "q".to_string();
    request.match_count = 0;
    assert!(matches!(
        retriever.answer(&request).await,
        Err(Error::Validation(_))
    ));
}

#[tokio::test]
async fn test_rewrite_query_failure_returns_original() {
    let store = Arc::new(InMemoryStore::new());
    let chat = ScriptedChat::new(vec![Err(Error::upstream("down"))]);
    let retriever = retriever(store, chat);

    let rewritten = retriever.rewrite_query("auth?").await;
    assert_eq!(rewritten, "auth?");
}

#[tokio::test]
async fn test_rewrite_query_uses_chat_reply() {
    let store = Arc::new(InMemoryStore::new());
    let chat = ScriptedChat::new(vec![Ok(
        "How does user authentication work end to end?".to_string()
    )]);
    let retriever = retriever(store, chat);

    let rewritten = retriever.rewrite_query("auth?").await;
    assert_eq!(rewritten, "How does user authentication work end to end?");
}
