//! End-to-end retrieval tests: ingest into a temporary database, then
//! exercise vector search, threshold filtering, hybrid fusion, and
//! version replacement.

use std::sync::Arc;

use tempfile::TempDir;

use hearth::config::{ChunkingConfig, RetrievalConfig};
use hearth::embedding::{create_embedding_model, EmbeddingModel};
use hearth::error::RetrievalError;
use hearth::models::{Chunk, SourceDocument};
use hearth::retriever::{HybridRetriever, SearchMode};
use hearth::store::VectorStore;
use hearth::{db, ingest, migrate};

async fn setup() -> (TempDir, sqlx::SqlitePool) {
    let dir = TempDir::new().unwrap();
    let pool = db::connect(&dir.path().join("test.sqlite")).await.unwrap();
    migrate::run_migrations(&pool).await.unwrap();
    (dir, pool)
}

fn hash_embedder() -> Arc<dyn EmbeddingModel> {
    create_embedding_model(&Default::default()).unwrap()
}

fn chunk(id: &str, doc: &str, ordinal: i64, text: &str) -> Chunk {
    Chunk {
        id: id.to_string(),
        document_id: doc.to_string(),
        ordinal,
        start_char: 0,
        end_char: text.chars().count() as i64,
        text: text.to_string(),
        hash: format!("hash-{}", id),
    }
}

/// Store a document with chunks whose vectors we control exactly. Cosine
/// against the query [1, 0] is the first component of each unit vector.
async fn seed_crafted_vectors(
    pool: &sqlx::SqlitePool,
    store: &VectorStore,
    cosines: &[f64],
) -> Vec<String> {
    let doc_id = ingest::upsert_document(
        pool,
        &SourceDocument {
            origin: "test:crafted".to_string(),
            body: "crafted".to_string(),
        },
    )
    .await
    .unwrap();

    let chunks: Vec<Chunk> = cosines
        .iter()
        .enumerate()
        .map(|(i, _)| chunk(&format!("chunk-{}", i), &doc_id, i as i64, &format!("text {}", i)))
        .collect();
    ingest::replace_chunks(pool, &doc_id, &chunks).await.unwrap();

    for (chunk, &c) in chunks.iter().zip(cosines) {
        let vector = vec![c as f32, (1.0 - c * c).sqrt() as f32];
        store.insert(chunk, &vector, "crafted").await.unwrap();
    }
    chunks.into_iter().map(|c| c.id).collect()
}

#[tokio::test]
async fn test_threshold_filters_after_candidate_fetch() {
    let (_dir, pool) = setup().await;
    let store = VectorStore::open(pool.clone()).await.unwrap();

    seed_crafted_vectors(&pool, &store, &[0.9, 0.8, 0.7, 0.4, 0.2]).await;

    // top_k 5 with threshold 0.5: only three candidates clear it, and the
    // result is three, never padded back up to five.
    let results = store.search(&[1.0, 0.0], 5, 0.5, 10).await.unwrap();
    assert_eq!(results.len(), 3);
    assert!(results.iter().all(|r| r.score >= 0.5));

    // Scores are non-increasing and ranks are dense from zero.
    for window in results.windows(2) {
        assert!(window[0].score >= window[1].score);
    }
    assert_eq!(results.iter().map(|r| r.rank).collect::<Vec<_>>(), vec![0, 1, 2]);
}

#[tokio::test]
async fn test_equal_scores_keep_insertion_order() {
    let (_dir, pool) = setup().await;
    let store = VectorStore::open(pool.clone()).await.unwrap();

    let ids = seed_crafted_vectors(&pool, &store, &[0.6, 0.6, 0.6]).await;

    let first = store.search(&[1.0, 0.0], 3, 0.0, 10).await.unwrap();
    let second = store.search(&[1.0, 0.0], 3, 0.0, 10).await.unwrap();

    let order: Vec<&str> = first.iter().map(|r| r.chunk_id.as_str()).collect();
    assert_eq!(order, ids.iter().map(String::as_str).collect::<Vec<_>>());
    // Identical runs return identical order.
    assert_eq!(
        order,
        second.iter().map(|r| r.chunk_id.as_str()).collect::<Vec<_>>()
    );
}

#[tokio::test]
async fn test_dimension_mismatch_rejected() {
    let (_dir, pool) = setup().await;
    let store = VectorStore::open(pool.clone()).await.unwrap();

    seed_crafted_vectors(&pool, &store, &[0.9]).await;

    let result = store.search(&[1.0, 0.0, 0.0], 5, 0.0, 10).await;
    assert!(matches!(
        result,
        Err(RetrievalError::DimensionMismatch { expected: 2, got: 3 })
    ));
}

#[tokio::test]
async fn test_store_unavailable_before_migration() {
    let dir = TempDir::new().unwrap();
    let pool = db::connect(&dir.path().join("bare.sqlite")).await.unwrap();

    let result = VectorStore::open(pool).await;
    assert!(matches!(result, Err(RetrievalError::StoreUnavailable)));
}

#[tokio::test]
async fn test_ingest_then_hybrid_retrieve() {
    let (_dir, pool) = setup().await;
    let store = Arc::new(VectorStore::open(pool.clone()).await.unwrap());
    let embedder = hash_embedder();

    let items = vec![
        SourceDocument {
            origin: "test:sourdough".to_string(),
            body: "Sourdough bread needs a mature starter. Feed the starter twice daily \
                   and keep it warm until it doubles reliably."
                .to_string(),
        },
        SourceDocument {
            origin: "test:espresso".to_string(),
            body: "Espresso extraction depends on grind size and water temperature. \
                   A finer grind slows the shot and increases body."
                .to_string(),
        },
    ];
    let chunking = ChunkingConfig {
        chunk_size: 200,
        overlap: 20,
    };
    let outcome = ingest::ingest_batch(&pool, &store, embedder.as_ref(), &chunking, &items)
        .await
        .unwrap();
    assert_eq!(outcome.documents, 2);
    assert!(outcome.embedded > 0);

    let retriever = HybridRetriever::new(
        pool.clone(),
        Arc::clone(&store),
        embedder,
        RetrievalConfig {
            similarity_threshold: 0.0,
            ..Default::default()
        },
    );

    let results = retriever.retrieve("sourdough starter").await.unwrap();
    assert!(!results.is_empty());
    assert!(results[0].text.contains("starter"));

    // No duplicate chunks after fusion.
    let mut ids: Vec<&str> = results.iter().map(|r| r.chunk_id.as_str()).collect();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), results.len());
}

#[tokio::test]
async fn test_empty_query_returns_empty() {
    let (_dir, pool) = setup().await;
    let store = Arc::new(VectorStore::open(pool.clone()).await.unwrap());
    let retriever = HybridRetriever::new(
        pool,
        store,
        hash_embedder(),
        RetrievalConfig::default(),
    );

    assert!(retriever.retrieve("   ").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_lexical_only_when_embeddings_disabled() {
    let (_dir, pool) = setup().await;
    let store = Arc::new(VectorStore::open(pool.clone()).await.unwrap());

    // Index with working embeddings first.
    let embedder = hash_embedder();
    let items = vec![SourceDocument {
        origin: "test:doc".to_string(),
        body: "The migration playbook covers rollback procedures in detail.".to_string(),
    }];
    ingest::ingest_batch(
        &pool,
        &store,
        embedder.as_ref(),
        &ChunkingConfig::default(),
        &items,
    )
    .await
    .unwrap();

    // Query with a disabled embedder: the semantic channel fails and the
    // retriever degrades to keyword results instead of erroring.
    let disabled = create_embedding_model(&hearth::config::EmbeddingConfig {
        provider: "disabled".to_string(),
        ..Default::default()
    })
    .unwrap();
    let retriever = HybridRetriever::new(pool, store, disabled, RetrievalConfig::default());

    let results = retriever.retrieve("rollback procedures").await.unwrap();
    assert!(!results.is_empty());
    assert!(results[0].text.contains("rollback"));
}

#[tokio::test]
async fn test_single_channel_modes() {
    let (_dir, pool) = setup().await;
    let store = Arc::new(VectorStore::open(pool.clone()).await.unwrap());
    let embedder = hash_embedder();

    ingest::ingest_batch(
        &pool,
        &store,
        embedder.as_ref(),
        &ChunkingConfig::default(),
        &[SourceDocument {
            origin: "test:modes".to_string(),
            body: "Kubernetes liveness probes restart unhealthy containers.".to_string(),
        }],
    )
    .await
    .unwrap();

    let retriever = HybridRetriever::new(
        pool,
        store,
        embedder,
        RetrievalConfig {
            similarity_threshold: 0.0,
            ..Default::default()
        },
    );

    let keyword = retriever
        .retrieve_with_mode("liveness probes", SearchMode::Keyword)
        .await
        .unwrap();
    assert!(!keyword.is_empty());

    let semantic = retriever
        .retrieve_with_mode("liveness probes", SearchMode::Semantic)
        .await
        .unwrap();
    assert!(!semantic.is_empty());
    assert!(semantic[0].score > 0.0);

    let hybrid = retriever
        .retrieve_with_mode("liveness probes", SearchMode::Hybrid)
        .await
        .unwrap();
    assert_eq!(hybrid[0].chunk_id, keyword[0].chunk_id);
}

#[tokio::test]
async fn test_reingest_changed_content_replaces_version() {
    let (_dir, pool) = setup().await;
    let store = Arc::new(VectorStore::open(pool.clone()).await.unwrap());
    let embedder = hash_embedder();
    let chunking = ChunkingConfig::default();

    let v1 = vec![SourceDocument {
        origin: "test:notes".to_string(),
        body: "The answer is the old procedure.".to_string(),
    }];
    ingest::ingest_batch(&pool, &store, embedder.as_ref(), &chunking, &v1)
        .await
        .unwrap();

    let v2 = vec![SourceDocument {
        origin: "test:notes".to_string(),
        body: "The answer is the new procedure.".to_string(),
    }];
    ingest::ingest_batch(&pool, &store, embedder.as_ref(), &chunking, &v2)
        .await
        .unwrap();

    // Only one document remains for the origin, and search only ever sees
    // the new content.
    let docs: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents WHERE origin = ?")
        .bind("test:notes")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(docs, 1);

    let retriever = HybridRetriever::new(
        pool,
        store,
        embedder,
        RetrievalConfig {
            similarity_threshold: 0.0,
            ..Default::default()
        },
    );
    let results = retriever.retrieve("procedure").await.unwrap();
    assert!(!results.is_empty());
    assert!(results.iter().all(|r| !r.text.contains("old procedure")));
}

#[tokio::test]
async fn test_identical_reingest_is_noop() {
    let (_dir, pool) = setup().await;
    let store = Arc::new(VectorStore::open(pool.clone()).await.unwrap());
    let embedder = hash_embedder();
    let chunking = ChunkingConfig::default();

    let items = vec![SourceDocument {
        origin: "test:stable".to_string(),
        body: "Unchanged content.".to_string(),
    }];
    ingest::ingest_batch(&pool, &store, embedder.as_ref(), &chunking, &items)
        .await
        .unwrap();
    let id_before: String = sqlx::query_scalar("SELECT id FROM documents WHERE origin = ?")
        .bind("test:stable")
        .fetch_one(&pool)
        .await
        .unwrap();

    ingest::ingest_batch(&pool, &store, embedder.as_ref(), &chunking, &items)
        .await
        .unwrap();
    let id_after: String = sqlx::query_scalar("SELECT id FROM documents WHERE origin = ?")
        .bind("test:stable")
        .fetch_one(&pool)
        .await
        .unwrap();

    assert_eq!(id_before, id_after);
}
