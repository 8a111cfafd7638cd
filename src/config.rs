use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::ConfigError;

fn invalid(field: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub tasks: TasksConfig,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    /// Chunk size in characters.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Overlap between consecutive chunks in characters. Must be < chunk_size.
    #[serde(default = "default_overlap")]
    pub overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            overlap: default_overlap(),
        }
    }
}

fn default_chunk_size() -> usize {
    800
}
fn default_overlap() -> usize {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    /// Final number of fused results returned to the caller.
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Candidates fetched per channel before filtering. Must be >= top_k;
    /// the headroom lets the threshold filter drop candidates without
    /// starving the final list.
    #[serde(default = "default_candidate_k")]
    pub candidate_k: usize,
    /// Minimum cosine similarity a vector hit must clear.
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f64,
    /// Reciprocal Rank Fusion constant.
    #[serde(default = "default_rrf_k")]
    pub rrf_k: f64,
    /// Maximum candidates handed to the reranker in one scoring call.
    #[serde(default = "default_rerank_cutoff")]
    pub rerank_cutoff: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            candidate_k: default_candidate_k(),
            similarity_threshold: default_similarity_threshold(),
            rrf_k: default_rrf_k(),
            rerank_cutoff: default_rerank_cutoff(),
        }
    }
}

fn default_top_k() -> usize {
    6
}
fn default_candidate_k() -> usize {
    40
}
fn default_similarity_threshold() -> f64 {
    0.25
}
fn default_rrf_k() -> f64 {
    60.0
}
fn default_rerank_cutoff() -> usize {
    8
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// One of `hash`, `openai`, `disabled`.
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_dims")]
    pub dims: usize,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Environment variable holding the API key for remote providers.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: None,
            dims: default_dims(),
            base_url: default_base_url(),
            api_key_env: default_api_key_env(),
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_embedding_provider() -> String {
    "hash".to_string()
}
fn default_dims() -> usize {
    256
}
fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    /// One of `disabled`, `openai-compat` (llama.cpp server, LM Studio, ...).
    #[serde(default = "default_generation_backend")]
    pub backend: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_generation_base_url")]
    pub base_url: String,
    #[serde(default = "default_generation_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_context_window")]
    pub context_window: u32,
    /// Character budget for the assembled prompt's reference section.
    #[serde(default = "default_prompt_budget")]
    pub prompt_budget_chars: usize,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            backend: default_generation_backend(),
            model: None,
            base_url: default_generation_base_url(),
            api_key_env: default_generation_api_key_env(),
            temperature: default_temperature(),
            top_p: default_top_p(),
            max_tokens: default_max_tokens(),
            context_window: default_context_window(),
            prompt_budget_chars: default_prompt_budget(),
        }
    }
}

fn default_generation_backend() -> String {
    "disabled".to_string()
}
fn default_generation_base_url() -> String {
    "http://127.0.0.1:8080/v1".to_string()
}
fn default_generation_api_key_env() -> String {
    "HEARTH_LLM_API_KEY".to_string()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_top_p() -> f32 {
    0.9
}
fn default_max_tokens() -> u32 {
    2048
}
fn default_context_window() -> u32 {
    4096
}
fn default_prompt_budget() -> usize {
    6000
}

#[derive(Debug, Deserialize, Clone)]
pub struct TasksConfig {
    /// Maximum simultaneously running background tasks.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Grace period before a running task is marked cancelled without
    /// provider acknowledgement.
    #[serde(default = "default_cancel_grace_secs")]
    pub cancel_grace_secs: u64,
}

impl Default for TasksConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            cancel_grace_secs: default_cancel_grace_secs(),
        }
    }
}

fn default_max_concurrent() -> usize {
    3
}
fn default_cancel_grace_secs() -> u64 {
    5
}

/// One external generation provider, read-only to the core.
#[derive(Debug, Deserialize, Clone)]
pub struct ProviderConfig {
    pub id: String,
    /// Lower tier = preferred earlier when no explicit preference is given.
    #[serde(default)]
    pub tier: u32,
    pub cost_per_unit: f64,
    #[serde(default = "default_provider_timeout_secs")]
    pub timeout_secs: u64,
    /// Job kinds this provider can service, e.g. ["image", "video"].
    pub kinds: Vec<String>,
    pub base_url: String,
    #[serde(default)]
    pub api_key_env: Option<String>,
    /// Capability limits; requests beyond them are rejected per provider.
    #[serde(default)]
    pub max_duration_secs: Option<u64>,
    #[serde(default)]
    pub max_resolution: Option<String>,
}

fn default_provider_timeout_secs() -> u64 {
    300
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<(), ConfigError> {
    if config.chunking.chunk_size == 0 {
        return Err(invalid("chunking.chunk_size", "must be > 0"));
    }
    if config.chunking.overlap >= config.chunking.chunk_size {
        return Err(invalid("chunking.overlap", "must be < chunking.chunk_size"));
    }

    if config.retrieval.top_k < 1 {
        return Err(invalid("retrieval.top_k", "must be >= 1"));
    }
    if config.retrieval.candidate_k < config.retrieval.top_k {
        return Err(invalid("retrieval.candidate_k", "must be >= retrieval.top_k"));
    }
    if !(0.0..=1.0).contains(&config.retrieval.similarity_threshold) {
        return Err(invalid("retrieval.similarity_threshold", "must be in [0.0, 1.0]"));
    }
    if config.retrieval.rrf_k <= 0.0 {
        return Err(invalid("retrieval.rrf_k", "must be > 0"));
    }

    match config.embedding.provider.as_str() {
        "hash" | "openai" | "disabled" => {}
        _ => {
            return Err(invalid(
                "embedding.provider",
                "must be hash, openai, or disabled",
            ))
        }
    }
    if config.embedding.dims == 0 {
        return Err(invalid("embedding.dims", "must be > 0"));
    }
    if config.embedding.provider == "openai" && config.embedding.model.is_none() {
        return Err(ConfigError::Missing("embedding.model".to_string()));
    }

    match config.generation.backend.as_str() {
        "disabled" | "openai-compat" => {}
        _ => {
            return Err(invalid(
                "generation.backend",
                "must be disabled or openai-compat",
            ))
        }
    }
    if !(0.0..=2.0).contains(&config.generation.temperature) {
        return Err(invalid("generation.temperature", "must be in [0.0, 2.0]"));
    }
    if !(0.0..=1.0).contains(&config.generation.top_p) {
        return Err(invalid("generation.top_p", "must be in [0.0, 1.0]"));
    }

    if config.tasks.max_concurrent < 1 {
        return Err(invalid("tasks.max_concurrent", "must be >= 1"));
    }

    for provider in &config.providers {
        let field = format!("providers.{}", provider.id);
        if provider.id.is_empty() {
            return Err(invalid("providers.id", "must not be empty"));
        }
        if provider.cost_per_unit < 0.0 {
            return Err(invalid(&field, "cost_per_unit must be >= 0"));
        }
        if provider.kinds.is_empty() {
            return Err(invalid(&field, "kinds must not be empty"));
        }
        for kind in &provider.kinds {
            match kind.as_str() {
                "image" | "video" | "text" => {}
                _ => return Err(invalid(&field, "kinds entries must be image, video, or text")),
            }
        }
    }

    Ok(())
}

/// Warn about optional settings that limit functionality. Called once at
/// startup; nothing here is fatal until an operation actually needs the
/// missing piece.
pub fn warn_optional(config: &Config) {
    if config.generation.backend == "disabled" {
        tracing::warn!("generation backend is disabled; ask/rerank will be unavailable");
    }
    for provider in &config.providers {
        if let Some(env) = &provider.api_key_env {
            if std::env::var(env).is_err() {
                tracing::warn!(
                    provider = %provider.id,
                    env = %env,
                    "provider API key not set; tasks routed to it will fail over"
                );
            }
        }
    }
}
