//! Error taxonomy for the assistant core.
//!
//! Each pipeline stage has its own error type so callers can tell a
//! recoverable retrieval failure apart from a fatal generation failure.
//! Recovery policy lives with the caller: the retriever degrades to a
//! single modality, the pipeline degrades to an empty context, the task
//! queue retries across its provider list. Nothing is swallowed without
//! a log record.

use thiserror::Error;

/// Failures while turning raw documents into stored chunks.
#[derive(Debug, Error)]
pub enum IngestionError {
    #[error("document is empty")]
    EmptyDocument,

    #[error("document unreadable: {0}")]
    Unreadable(String),

    #[error("invalid chunk window: size={size} overlap={overlap}")]
    InvalidWindow { size: usize, overlap: usize },

    #[error(transparent)]
    Storage(#[from] sqlx::Error),
}

/// Failures producing embedding vectors.
#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("embedding model '{0}' is not loaded")]
    ModelUnavailable(String),

    #[error("embedding backend error: {0}")]
    Backend(String),

    #[error("embedding response was empty")]
    EmptyResponse,
}

/// Failures answering a retrieval query.
#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("vector store is not initialized")]
    StoreUnavailable,

    #[error("vector dimensionality mismatch: store has {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error(transparent)]
    Embedding(#[from] EmbeddingError),

    #[error(transparent)]
    Storage(#[from] sqlx::Error),
}

/// Failures in the generation engine. Fatal to the call, not the engine.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("engine is not ready (state: {0})")]
    NotReady(&'static str),

    #[error("model load failed: {0}")]
    LoadFailed(String),

    #[error("resources exhausted mid-generation: {0}")]
    Exhausted(String),

    #[error("generation backend error: {0}")]
    Backend(String),

    #[error("generation was cancelled")]
    Cancelled,
}

/// Failures inside the background task queue. Provider-level variants are
/// retried across the fallback list; a task is only `Failed` once every
/// provider has been attempted.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("provider '{0}' timed out")]
    Timeout(String),

    #[error("provider '{provider}' quota exhausted: {message}")]
    Quota { provider: String, message: String },

    #[error("provider '{provider}' transport error: {message}")]
    Transport { provider: String, message: String },

    #[error("provider '{provider}' does not support this job kind")]
    Unsupported { provider: String },

    #[error("estimated cost {estimate:.4} exceeds budget ceiling {ceiling:.4}")]
    BudgetExceeded { estimate: f64, ceiling: f64 },

    #[error("unknown task: {0}")]
    UnknownTask(String),

    #[error("no providers in preference list")]
    NoProviders,
}

/// Configuration problems. Optional settings produce startup warnings;
/// required ones fail the operation that needs them.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required setting: {0}")]
    Missing(String),

    #[error("invalid setting {field}: {reason}")]
    Invalid { field: String, reason: String },
}
