//! Core data models used throughout hearth.
//!
//! These types represent the documents, chunks, sessions, and background
//! tasks that flow through the ingestion, retrieval, and generation
//! pipelines.

use serde::{Deserialize, Serialize};

/// Raw input to the ingestion pipeline before normalization: UTF-8 text
/// plus where it came from. Collector mechanics live outside the core.
#[derive(Debug, Clone)]
pub struct SourceDocument {
    pub origin: String,
    pub body: String,
}

/// Normalized document stored in SQLite. Immutable once stored;
/// re-ingestion with changed content produces a new version.
#[derive(Debug, Clone)]
pub struct Document {
    pub id: String,
    pub origin: String,
    pub body: String,
    pub dedup_hash: String,
    pub ingested_at: i64,
}

/// A bounded span of a document's body text, the unit of retrieval.
/// `start_char..end_char` is the character span within the parent body.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub ordinal: i64,
    pub start_char: i64,
    pub end_char: i64,
    pub text: String,
    pub hash: String,
}

/// A ranked retrieval hit. Ephemeral, never persisted.
///
/// For pure vector search `score` is cosine similarity clamped to [0, 1];
/// after hybrid fusion it is the RRF sum, which has no fixed range but is
/// still non-increasing by `rank`.
#[derive(Debug, Clone)]
pub struct RetrievalResult {
    pub chunk_id: String,
    pub document_id: String,
    pub text: String,
    pub score: f64,
    pub rank: usize,
}

/// Conversation role of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }

    pub fn parse(s: &str) -> Option<Role> {
        match s {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            "system" => Some(Role::System),
            _ => None,
        }
    }
}

/// A persisted conversation.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub title: String,
    pub created_at: i64,
    pub updated_at: i64,
}

/// One turn in a session. Messages are immutable once written; `sequence`
/// is strictly increasing within a session and never reused.
#[derive(Debug, Clone)]
pub struct Message {
    pub id: String,
    pub session_id: String,
    pub role: Role,
    pub content: String,
    pub sequence: i64,
    pub created_at: i64,
}

/// Sampling parameters handed to the generation backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationParams {
    pub temperature: f32,
    pub top_p: f32,
    pub max_tokens: u32,
    pub context_window: u32,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_p: 0.9,
            max_tokens: 2048,
            context_window: 4096,
        }
    }
}

/// What kind of output a background job produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Image,
    Video,
    Text,
}

/// Lifecycle of a background task. Terminal states are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled
        )
    }
}

/// A request handed to the task queue.
#[derive(Debug, Clone)]
pub struct TaskRequest {
    pub kind: TaskKind,
    pub payload: serde_json::Value,
    /// Billable units of work (e.g. seconds of video, number of images).
    pub units: f64,
    /// Optional hard cap on spend; enqueue rejects requests whose cheapest
    /// preferred provider already exceeds it.
    pub budget_ceiling: Option<f64>,
}

/// The queue's view of a task, returned from status polling. Once the
/// state is terminal the record never changes again.
#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub id: String,
    pub kind: TaskKind,
    pub state: TaskState,
    /// Provider currently attempting, or the one that ultimately serviced
    /// the task once completed.
    pub provider: Option<String>,
    /// Realized cost. Zero until a provider call succeeds; always zero for
    /// tasks cancelled while pending.
    pub cost: f64,
    /// Output reference (URL or path) on completion.
    pub result: Option<String>,
    /// Last error per attempted provider, in attempt order.
    pub errors: Vec<(String, String)>,
    pub created_at: i64,
    pub finished_at: Option<i64>,
}
