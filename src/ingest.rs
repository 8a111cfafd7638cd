//! Ingestion pipeline.
//!
//! Coordinates document intake: dedup hash → document upsert → chunking →
//! embedding → storage. Embedding failure is non-fatal; chunks land in the
//! lexical index either way and vectors are backfilled on a later pass.
//! Unreadable or empty documents are skipped and logged, never aborting
//! the batch.

use anyhow::Result;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use tracing::warn;
use uuid::Uuid;
use walkdir::WalkDir;

use crate::chunk::chunk_document;
use crate::config::ChunkingConfig;
use crate::embedding::EmbeddingModel;
use crate::error::IngestionError;
use crate::models::{Chunk, SourceDocument};
use crate::store::VectorStore;

/// Counters reported after a batch.
#[derive(Debug, Default, Clone)]
pub struct IngestOutcome {
    pub documents: u64,
    pub chunks: u64,
    pub embedded: u64,
    pub pending_embeddings: u64,
    pub skipped: u64,
}

/// Ingest a batch of (text, origin) pairs.
pub async fn ingest_batch(
    pool: &SqlitePool,
    store: &VectorStore,
    embedder: &dyn EmbeddingModel,
    chunking: &ChunkingConfig,
    items: &[SourceDocument],
) -> Result<IngestOutcome> {
    let mut outcome = IngestOutcome::default();

    for item in items {
        let chunks = match prepare_chunks(pool, item, chunking).await {
            Ok(chunks) => chunks,
            Err(IngestionError::Storage(e)) => return Err(e.into()),
            Err(e) => {
                warn!(origin = %item.origin, error = %e, "skipping document");
                outcome.skipped += 1;
                continue;
            }
        };

        outcome.documents += 1;
        outcome.chunks += chunks.len() as u64;

        // Inline embedding, non-fatal: on failure the chunks stay
        // keyword-searchable and the vectors are counted as pending.
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        match embedder.embed_batch(&texts).await {
            Ok(vectors) => {
                for (chunk, vector) in chunks.iter().zip(vectors.iter()) {
                    store.insert(chunk, vector, embedder.model_name()).await?;
                    outcome.embedded += 1;
                }
            }
            Err(e) => {
                warn!(origin = %item.origin, error = %e, "embedding failed, chunks stored without vectors");
                outcome.pending_embeddings += chunks.len() as u64;
            }
        }
    }

    Ok(outcome)
}

/// Upsert the document row and replace its chunks. Returns the stored
/// chunks so the caller can embed them.
async fn prepare_chunks(
    pool: &SqlitePool,
    item: &SourceDocument,
    chunking: &ChunkingConfig,
) -> Result<Vec<Chunk>, IngestionError> {
    let doc_id = upsert_document(pool, item).await?;
    let chunks = chunk_document(&doc_id, &item.body, chunking.chunk_size, chunking.overlap)?;
    replace_chunks(pool, &doc_id, &chunks).await?;
    Ok(chunks)
}

/// Insert the document if its content is new for this origin; otherwise
/// reuse the existing row. Identical content re-ingested is a no-op.
pub async fn upsert_document(pool: &SqlitePool, item: &SourceDocument) -> Result<String, sqlx::Error> {
    let mut hasher = Sha256::new();
    hasher.update(item.body.as_bytes());
    let dedup_hash = format!("{:x}", hasher.finalize());

    let existing: Option<String> =
        sqlx::query_scalar("SELECT id FROM documents WHERE origin = ? AND dedup_hash = ?")
            .bind(&item.origin)
            .bind(&dedup_hash)
            .fetch_optional(pool)
            .await?;

    if let Some(id) = existing {
        return Ok(id);
    }

    // Changed content under the same origin becomes a new version; prior
    // versions are removed. FKs cascade to chunks and vectors, the FTS
    // table needs an explicit delete.
    let stale_ids: Vec<String> = sqlx::query_scalar("SELECT id FROM documents WHERE origin = ?")
        .bind(&item.origin)
        .fetch_all(pool)
        .await?;
    for stale in &stale_ids {
        sqlx::query("DELETE FROM chunks_fts WHERE document_id = ?")
            .bind(stale)
            .execute(pool)
            .await?;
        sqlx::query("DELETE FROM documents WHERE id = ?")
            .bind(stale)
            .execute(pool)
            .await?;
    }

    let id = Uuid::new_v4().to_string();
    sqlx::query(
        "INSERT INTO documents (id, origin, body, dedup_hash, ingested_at) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(&item.origin)
    .bind(&item.body)
    .bind(&dedup_hash)
    .bind(chrono::Utc::now().timestamp())
    .execute(pool)
    .await?;

    Ok(id)
}

/// Replace a document's chunks and lexical index rows in one transaction.
pub async fn replace_chunks(
    pool: &SqlitePool,
    document_id: &str,
    chunks: &[Chunk],
) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;

    sqlx::query(
        "DELETE FROM chunk_vectors WHERE chunk_id IN (SELECT id FROM chunks WHERE document_id = ?)",
    )
    .bind(document_id)
    .execute(&mut *tx)
    .await?;

    sqlx::query("DELETE FROM chunks_fts WHERE document_id = ?")
        .bind(document_id)
        .execute(&mut *tx)
        .await?;

    sqlx::query("DELETE FROM chunks WHERE document_id = ?")
        .bind(document_id)
        .execute(&mut *tx)
        .await?;

    for chunk in chunks {
        sqlx::query(
            r#"
            INSERT INTO chunks (id, document_id, ordinal, start_char, end_char, text, hash)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&chunk.id)
        .bind(&chunk.document_id)
        .bind(chunk.ordinal)
        .bind(chunk.start_char)
        .bind(chunk.end_char)
        .bind(&chunk.text)
        .bind(&chunk.hash)
        .execute(&mut *tx)
        .await?;

        sqlx::query("INSERT INTO chunks_fts (chunk_id, document_id, text) VALUES (?, ?, ?)")
            .bind(&chunk.id)
            .bind(&chunk.document_id)
            .bind(&chunk.text)
            .execute(&mut *tx)
            .await?;
    }

    tx.commit().await?;
    Ok(())
}

/// Collect UTF-8 text documents from a directory tree. Files that are not
/// valid UTF-8 (or unreadable) are skipped with a warning, matching the
/// batch policy for unreadable documents.
pub fn collect_dir(root: &std::path::Path) -> Result<Vec<SourceDocument>> {
    let mut items = Vec::new();

    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let is_text = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("md") | Some("txt")
        );
        if !is_text {
            continue;
        }

        match std::fs::read_to_string(path) {
            Ok(body) => items.push(SourceDocument {
                origin: format!("file:{}", path.display()),
                body,
            }),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "skipping unreadable file");
            }
        }
    }

    // Stable order keeps ingestion deterministic across runs.
    items.sort_by(|a, b| a.origin.cmp(&b.origin));
    Ok(items)
}
