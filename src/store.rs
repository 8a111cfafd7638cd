//! SQLite-backed vector store.
//!
//! One row per chunk: id, parent document, ordinal span, embedding blob,
//! and the model tag that produced the vector. Search is brute-force
//! cosine similarity over all rows, which is exact and fast enough for a
//! single-user corpus.
//!
//! Search contract: fetch up to `candidate_k` nearest candidates first,
//! drop those below the similarity threshold afterwards, then truncate to
//! `top_k`. If fewer than `top_k` candidates clear the threshold the
//! result is shorter, never padded. Ties break by insertion order.

use sqlx::{Row, SqlitePool};

use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::error::RetrievalError;
use crate::models::{Chunk, RetrievalResult};

pub struct VectorStore {
    pool: SqlitePool,
}

impl VectorStore {
    /// Open the store over an existing pool, verifying the schema is in
    /// place. Fails with [`RetrievalError::StoreUnavailable`] before any
    /// migration has run.
    pub async fn open(pool: SqlitePool) -> Result<Self, RetrievalError> {
        let exists: bool = sqlx::query_scalar(
            "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='chunk_vectors'",
        )
        .fetch_one(&pool)
        .await?;

        if !exists {
            return Err(RetrievalError::StoreUnavailable);
        }
        Ok(Self { pool })
    }

    /// Insert (or replace) a chunk's embedding. Inserts are serialized by
    /// SQLite's writer lock; dimensionality must match whatever is already
    /// stored.
    pub async fn insert(
        &self,
        chunk: &Chunk,
        vector: &[f32],
        model: &str,
    ) -> Result<(), RetrievalError> {
        if let Some(existing) = self.stored_dims().await? {
            if existing != vector.len() {
                return Err(RetrievalError::DimensionMismatch {
                    expected: existing,
                    got: vector.len(),
                });
            }
        }

        sqlx::query(
            r#"
            INSERT INTO chunk_vectors (chunk_id, document_id, embedding, dims, model)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(chunk_id) DO UPDATE SET
                embedding = excluded.embedding,
                dims = excluded.dims,
                model = excluded.model
            "#,
        )
        .bind(&chunk.id)
        .bind(&chunk.document_id)
        .bind(vec_to_blob(vector))
        .bind(vector.len() as i64)
        .bind(model)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Nearest-neighbor search by cosine similarity.
    ///
    /// Guarantees: scores are non-increasing by rank and clamped to
    /// [0, 1]; every returned result clears `threshold`; at most `top_k`
    /// results; equal scores keep insertion order.
    pub async fn search(
        &self,
        query_vector: &[f32],
        top_k: usize,
        threshold: f64,
        candidate_k: usize,
    ) -> Result<Vec<RetrievalResult>, RetrievalError> {
        if let Some(dims) = self.stored_dims().await? {
            if dims != query_vector.len() {
                return Err(RetrievalError::DimensionMismatch {
                    expected: dims,
                    got: query_vector.len(),
                });
            }
        }

        let rows = sqlx::query(
            r#"
            SELECT cv.rowid AS insertion_order, cv.chunk_id, cv.document_id, cv.embedding, c.text
            FROM chunk_vectors cv
            JOIN chunks c ON c.id = cv.chunk_id
            ORDER BY cv.rowid
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        struct Scored {
            chunk_id: String,
            document_id: String,
            text: String,
            score: f64,
            insertion_order: i64,
        }

        let mut scored: Vec<Scored> = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                let vector = blob_to_vec(&blob);
                let score = f64::from(cosine_similarity(query_vector, &vector)).clamp(0.0, 1.0);
                Scored {
                    chunk_id: row.get("chunk_id"),
                    document_id: row.get("document_id"),
                    text: row.get("text"),
                    score,
                    insertion_order: row.get("insertion_order"),
                }
            })
            .collect();

        // Score descending; equal scores keep insertion order (stable).
        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.insertion_order.cmp(&b.insertion_order))
        });

        // Candidate headroom first, threshold after, top_k last.
        scored.truncate(candidate_k.max(top_k));
        scored.retain(|s| s.score >= threshold);
        scored.truncate(top_k);

        Ok(scored
            .into_iter()
            .enumerate()
            .map(|(rank, s)| RetrievalResult {
                chunk_id: s.chunk_id,
                document_id: s.document_id,
                text: s.text,
                score: s.score,
                rank,
            })
            .collect())
    }

    /// Count of stored vectors whose model tag differs from `model`;
    /// nonzero means a model change happened and re-embedding is due.
    pub async fn stale_count(&self, model: &str) -> Result<i64, RetrievalError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM chunk_vectors WHERE model != ?")
                .bind(model)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    async fn stored_dims(&self) -> Result<Option<usize>, RetrievalError> {
        let dims: Option<i64> =
            sqlx::query_scalar("SELECT dims FROM chunk_vectors ORDER BY rowid LIMIT 1")
                .fetch_optional(&self.pool)
                .await?;
        Ok(dims.map(|d| d as usize))
    }
}
