//! Embedding model abstraction and implementations.
//!
//! Defines the [`EmbeddingModel`] trait and three backends:
//! - **[`HashEmbedding`]** — deterministic local character-trigram hashing;
//!   no model download, suitable for tests and offline use.
//! - **[`OpenAiEmbedding`]** — any OpenAI-compatible `/embeddings` endpoint,
//!   with batching, retry, and exponential backoff.
//! - **[`DisabledEmbedding`]** — always fails with
//!   [`EmbeddingError::ModelUnavailable`]; used when embeddings are not
//!   configured.
//!
//! Also provides vector utilities:
//! - [`cosine_similarity`] — similarity between two embedding vectors
//! - [`vec_to_blob`] / [`blob_to_vec`] — little-endian f32 codec for
//!   SQLite BLOB storage
//!
//! All vectors produced by one model share its `dims()`; a model change
//! requires re-embedding, which the store detects via its model tag.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;

use crate::config::EmbeddingConfig;
use crate::error::EmbeddingError;

/// Interface all embedding backends implement. `embed_batch` must preserve
/// input order; every returned vector has exactly `dims()` entries.
#[async_trait]
pub trait EmbeddingModel: Send + Sync {
    /// Model identifier stored alongside each vector.
    fn model_name(&self) -> &str;

    /// Vector dimensionality, constant for a loaded model.
    fn dims(&self) -> usize;

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }
}

/// Instantiate the configured embedding backend.
pub fn create_embedding_model(
    config: &EmbeddingConfig,
) -> anyhow::Result<Arc<dyn EmbeddingModel>> {
    match config.provider.as_str() {
        "hash" => Ok(Arc::new(HashEmbedding::new(config.dims))),
        "openai" => Ok(Arc::new(OpenAiEmbedding::new(config)?)),
        "disabled" => Ok(Arc::new(DisabledEmbedding)),
        other => anyhow::bail!("Unknown embedding provider: {}", other),
    }
}

// ============ Disabled ============

/// Backend used when embeddings are not configured. Every call fails with
/// [`EmbeddingError::ModelUnavailable`] so the retriever degrades to
/// keyword-only search.
pub struct DisabledEmbedding;

#[async_trait]
impl EmbeddingModel for DisabledEmbedding {
    fn model_name(&self) -> &str {
        "disabled"
    }

    fn dims(&self) -> usize {
        0
    }

    async fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbeddingError> {
        Err(EmbeddingError::ModelUnavailable("disabled".to_string()))
    }
}

// ============ Local hashing ============

/// Deterministic local embedding via character-trigram feature hashing.
///
/// Each lowercase trigram is hashed into one of `dims` buckets and the
/// resulting count vector is L2-normalized. Not semantically deep, but
/// fully offline, order-preserving in batches, and exactly repeatable,
/// which is what the retrieval tests need.
pub struct HashEmbedding {
    dims: usize,
}

impl HashEmbedding {
    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(1) }
    }

    fn bucket(&self, trigram: &str) -> usize {
        let digest = Sha256::digest(trigram.as_bytes());
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&digest[..8]);
        (u64::from_le_bytes(raw) % self.dims as u64) as usize
    }
}

#[async_trait]
impl EmbeddingModel for HashEmbedding {
    fn model_name(&self) -> &str {
        "hash-trigram-v1"
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let mut vector = vec![0.0f32; self.dims];
        let normalized: Vec<char> = text
            .to_lowercase()
            .chars()
            .map(|c| if c.is_alphanumeric() { c } else { ' ' })
            .collect();

        for window in normalized.windows(3) {
            let trigram: String = window.iter().collect();
            if trigram.trim().len() < 2 {
                continue;
            }
            vector[self.bucket(&trigram)] += 1.0;
        }

        let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            for v in &mut vector {
                *v /= norm;
            }
        }
        Ok(vector)
    }
}

// ============ OpenAI-compatible HTTP ============

/// Embedding backend for OpenAI-compatible `/embeddings` endpoints.
///
/// Retry strategy:
/// - HTTP 429 and 5xx → retry with exponential backoff (1s, 2s, 4s, ... capped)
/// - other 4xx → fail immediately
/// - network errors → retry
pub struct OpenAiEmbedding {
    model: String,
    dims: usize,
    base_url: String,
    api_key: String,
    batch_size: usize,
    max_retries: u32,
    client: reqwest::Client,
}

impl OpenAiEmbedding {
    pub fn new(config: &EmbeddingConfig) -> anyhow::Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for openai provider"))?;
        let api_key = std::env::var(&config.api_key_env)
            .map_err(|_| anyhow::anyhow!("{} environment variable not set", config.api_key_env))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            model,
            dims: config.dims,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            batch_size: config.batch_size.max(1),
            max_retries: config.max_retries,
            client,
        })
    }

    async fn embed_request(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let mut last_err: Option<EmbeddingError> = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .client
                .post(format!("{}/embeddings", self.base_url))
                .bearer_auth(&self.api_key)
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let json: serde_json::Value = response
                            .json()
                            .await
                            .map_err(|e| EmbeddingError::Backend(e.to_string()))?;
                        return parse_embeddings_response(&json);
                    }

                    let text = response.text().await.unwrap_or_default();
                    if status.as_u16() == 429 || status.is_server_error() {
                        last_err = Some(EmbeddingError::Backend(format!(
                            "embeddings API error {}: {}",
                            status, text
                        )));
                        continue;
                    }
                    return Err(EmbeddingError::Backend(format!(
                        "embeddings API error {}: {}",
                        status, text
                    )));
                }
                Err(e) => {
                    last_err = Some(EmbeddingError::Backend(e.to_string()));
                    continue;
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| EmbeddingError::Backend("embedding failed after retries".into())))
    }
}

#[async_trait]
impl EmbeddingModel for OpenAiEmbedding {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let results = self.embed_request(&[text.to_string()]).await?;
        results.into_iter().next().ok_or(EmbeddingError::EmptyResponse)
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            out.extend(self.embed_request(batch).await?);
        }
        Ok(out)
    }
}

fn parse_embeddings_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| EmbeddingError::Backend("response missing data array".into()))?;

    let mut embeddings = Vec::with_capacity(data.len());
    for item in data {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| EmbeddingError::Backend("response missing embedding".into()))?;
        let vec: Vec<f32> = embedding
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        embeddings.push(vec);
    }
    Ok(embeddings)
}

// ============ Vector utilities ============

/// Encode a float vector as little-endian f32 bytes for BLOB storage.
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity in [-1, 1]. Returns 0.0 for empty or mismatched
/// vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }
    dot / denom
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vec_blob_roundtrip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        let blob = vec_to_blob(&vec);
        assert_eq!(blob.len(), 20);
        assert_eq!(blob_to_vec(&blob), vec);
    }

    #[test]
    fn test_cosine_identical() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal() {
        let a = vec![1.0, 0.0];
        let b = vec![0.0, 1.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_mismatched_lengths() {
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }

    #[tokio::test]
    async fn test_hash_embedding_dims_constant() {
        let model = HashEmbedding::new(128);
        let a = model.embed("the quick brown fox").await.unwrap();
        let b = model.embed("an entirely different sentence").await.unwrap();
        assert_eq!(a.len(), 128);
        assert_eq!(b.len(), 128);
    }

    #[tokio::test]
    async fn test_hash_embedding_near_determinism() {
        // Repeated calls with identical input must agree to cosine >= 0.999.
        let model = HashEmbedding::new(256);
        let a = model.embed("retrieval augmented generation").await.unwrap();
        let b = model.embed("retrieval augmented generation").await.unwrap();
        assert!(cosine_similarity(&a, &b) >= 0.999);
    }

    #[tokio::test]
    async fn test_hash_embedding_related_texts_closer() {
        let model = HashEmbedding::new(256);
        let base = model.embed("rust async runtime scheduling").await.unwrap();
        let near = model.embed("rust async runtime internals").await.unwrap();
        let far = model.embed("banana bread baking tips").await.unwrap();
        assert!(cosine_similarity(&base, &near) > cosine_similarity(&base, &far));
    }

    #[tokio::test]
    async fn test_batch_preserves_order() {
        let model = HashEmbedding::new(64);
        let texts = vec![
            "first".to_string(),
            "second".to_string(),
            "third".to_string(),
        ];
        let batch = model.embed_batch(&texts).await.unwrap();
        assert_eq!(batch.len(), 3);
        for (text, vec) in texts.iter().zip(batch.iter()) {
            let single = model.embed(text).await.unwrap();
            assert!(cosine_similarity(vec, &single) >= 0.999);
        }
    }

    #[tokio::test]
    async fn test_disabled_model_unavailable() {
        let model = DisabledEmbedding;
        let result = model.embed("anything").await;
        assert!(matches!(result, Err(EmbeddingError::ModelUnavailable(_))));
    }
}
