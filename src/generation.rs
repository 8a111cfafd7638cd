//! Streaming generation engine.
//!
//! The engine owns at most one resident model behind an explicit state
//! machine:
//!
//! ```text
//! Unloaded → Loading → Ready ⇄ Generating
//!               ↓
//!            Failed
//! ```
//!
//! Switching models requires unloading first; unload releases all backend
//! resources before the next load begins. `generate_stream` hands back a
//! finite, non-restartable [`TokenStream`] fed by the backend through a
//! channel and terminated by an explicit [`TokenEvent::Done`] marker.
//! Cancellation is a flag the backend checks between increments; after it
//! is set no further increments are produced.
//!
//! Only one generation runs at a time system-wide. Concurrent callers
//! queue on a fair async mutex in front of the backend, giving FIFO
//! ordering without an explicit queue structure.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tracing::warn;

use crate::config::GenerationConfig;
use crate::error::GenerationError;
use crate::models::GenerationParams;

/// Engine lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Unloaded,
    Loading,
    Ready,
    Generating,
    Failed,
}

impl EngineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineState::Unloaded => "unloaded",
            EngineState::Loading => "loading",
            EngineState::Ready => "ready",
            EngineState::Generating => "generating",
            EngineState::Failed => "failed",
        }
    }
}

/// One increment of a generation stream.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenEvent {
    /// An incremental piece of generated text.
    Delta(String),
    /// Explicit end-of-stream marker. Nothing follows it.
    Done,
    /// Fatal mid-stream failure. Nothing follows it; partial output
    /// should be discarded by the consumer.
    Error(String),
}

/// A finite, non-restartable sequence of token events.
///
/// Dropping the stream without consuming it releases the generation slot
/// once the backend notices the cancellation flag or the closed channel.
pub struct TokenStream {
    rx: mpsc::Receiver<TokenEvent>,
    cancel: Arc<AtomicBool>,
}

impl TokenStream {
    /// Next event, or `None` once the stream is exhausted.
    pub async fn next(&mut self) -> Option<TokenEvent> {
        self.rx.recv().await
    }

    /// Request cancellation. The backend stops at its next increment
    /// check; no further deltas arrive after that.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    /// Drain the stream into a single string. A mid-stream error discards
    /// the partial output and surfaces the failure; cancellation surfaces
    /// [`GenerationError::Cancelled`].
    pub async fn collect_text(mut self) -> Result<String, GenerationError> {
        let mut out = String::new();
        while let Some(event) = self.next().await {
            match event {
                TokenEvent::Delta(piece) => out.push_str(&piece),
                TokenEvent::Done => return Ok(out),
                TokenEvent::Error(message) => return Err(GenerationError::Exhausted(message)),
            }
        }
        Err(GenerationError::Cancelled)
    }
}

/// What the engine drives. Backends push deltas into `tx` and must check
/// `cancel` between increments, returning promptly once it is set.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    async fn load(&self, model: &str) -> Result<(), GenerationError>;

    /// Release all model resources. Must leave the backend ready for a
    /// subsequent `load` of a different model.
    async fn unload(&self);

    async fn generate(
        &self,
        prompt: &str,
        params: &GenerationParams,
        tx: mpsc::Sender<TokenEvent>,
        cancel: Arc<AtomicBool>,
    ) -> Result<(), GenerationError>;
}

pub struct GenerationEngine {
    backend: Arc<dyn GenerationBackend>,
    state: Arc<StdMutex<EngineState>>,
    /// Fair mutex in front of the backend; queued lockers acquire in FIFO
    /// order, serializing generations system-wide.
    gate: Arc<tokio::sync::Mutex<()>>,
    model: StdMutex<Option<String>>,
    defaults: GenerationParams,
}

impl GenerationEngine {
    pub fn new(backend: Arc<dyn GenerationBackend>, defaults: GenerationParams) -> Self {
        Self {
            backend,
            state: Arc::new(StdMutex::new(EngineState::Unloaded)),
            gate: Arc::new(tokio::sync::Mutex::new(())),
            model: StdMutex::new(None),
            defaults,
        }
    }

    pub fn state(&self) -> EngineState {
        *self.state.lock().unwrap()
    }

    pub fn loaded_model(&self) -> Option<String> {
        self.model.lock().unwrap().clone()
    }

    pub fn default_params(&self) -> GenerationParams {
        self.defaults.clone()
    }

    /// Load a model. Only legal from `Unloaded`; switching models requires
    /// an explicit [`unload`](Self::unload) first so at most one model is
    /// ever resident.
    pub async fn load(&self, model: &str) -> Result<(), GenerationError> {
        {
            let mut state = self.state.lock().unwrap();
            match *state {
                EngineState::Unloaded => *state = EngineState::Loading,
                other => return Err(GenerationError::NotReady(other.as_str())),
            }
        }

        match self.backend.load(model).await {
            Ok(()) => {
                *self.model.lock().unwrap() = Some(model.to_string());
                *self.state.lock().unwrap() = EngineState::Ready;
                Ok(())
            }
            Err(e) => {
                *self.state.lock().unwrap() = EngineState::Failed;
                Err(GenerationError::LoadFailed(e.to_string()))
            }
        }
    }

    /// Unload the resident model, releasing backend resources. Waits for
    /// an in-flight generation to finish first. A `Failed` engine can be
    /// unloaded to recover to `Unloaded`.
    pub async fn unload(&self) {
        // Taking the gate waits out any in-flight generation.
        let _permit = self.gate.lock().await;
        self.backend.unload().await;
        *self.model.lock().unwrap() = None;
        *self.state.lock().unwrap() = EngineState::Unloaded;
    }

    /// Start a generation. Returns a [`TokenStream`] of increments; the
    /// backend runs on a spawned task holding the generation slot.
    ///
    /// Callers arriving while another generation runs are queued FIFO.
    /// Fails with [`GenerationError::NotReady`] when no model is resident.
    pub async fn generate_stream(
        &self,
        prompt: &str,
        params: Option<GenerationParams>,
    ) -> Result<TokenStream, GenerationError> {
        match self.state() {
            EngineState::Ready | EngineState::Generating => {}
            other => return Err(GenerationError::NotReady(other.as_str())),
        }

        let permit = self.gate.clone().lock_owned().await;

        // The model may have been unloaded while we queued.
        {
            let mut state = self.state.lock().unwrap();
            match *state {
                EngineState::Ready => *state = EngineState::Generating,
                other => return Err(GenerationError::NotReady(other.as_str())),
            }
        }

        let (tx, rx) = mpsc::channel(64);
        let cancel = Arc::new(AtomicBool::new(false));
        let backend = Arc::clone(&self.backend);
        let state = Arc::clone(&self.state);
        let prompt = prompt.to_string();
        let params = params.unwrap_or_else(|| self.defaults.clone());
        let task_cancel = Arc::clone(&cancel);

        tokio::spawn(async move {
            let result = backend.generate(&prompt, &params, tx.clone(), task_cancel.clone()).await;

            match result {
                Ok(()) => {
                    // A cancelled call produces no end marker; the channel
                    // simply closes with nothing further.
                    if !task_cancel.load(Ordering::SeqCst) {
                        let _ = tx.send(TokenEvent::Done).await;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "generation failed mid-stream");
                    let _ = tx.send(TokenEvent::Error(e.to_string())).await;
                }
            }

            // Fatal for the call, not the engine: always return to Ready.
            let mut state = state.lock().unwrap();
            if *state == EngineState::Generating {
                *state = EngineState::Ready;
            }
            drop(permit);
        });

        Ok(TokenStream { rx, cancel })
    }

    /// Convenience wrapper: run one generation to completion and return
    /// the full text.
    pub async fn generate(
        &self,
        prompt: &str,
        params: Option<GenerationParams>,
    ) -> Result<String, GenerationError> {
        let stream = self.generate_stream(prompt, params).await?;
        stream.collect_text().await
    }
}

/// Build the configured backend and engine. `disabled` yields an engine
/// that stays `Unloaded` and reports `NotReady` on use.
pub fn create_engine(config: &GenerationConfig) -> anyhow::Result<Arc<GenerationEngine>> {
    let defaults = GenerationParams {
        temperature: config.temperature,
        top_p: config.top_p,
        max_tokens: config.max_tokens,
        context_window: config.context_window,
    };

    let backend: Arc<dyn GenerationBackend> = match config.backend.as_str() {
        "openai-compat" => Arc::new(OpenAiCompatBackend::new(config)),
        "disabled" => Arc::new(DisabledBackend),
        other => anyhow::bail!("Unknown generation backend: {}", other),
    };

    Ok(Arc::new(GenerationEngine::new(backend, defaults)))
}

// ============ Disabled backend ============

/// Backend used when generation is not configured; loads always fail.
pub struct DisabledBackend;

#[async_trait]
impl GenerationBackend for DisabledBackend {
    async fn load(&self, _model: &str) -> Result<(), GenerationError> {
        Err(GenerationError::Backend(
            "generation backend is disabled".to_string(),
        ))
    }

    async fn unload(&self) {}

    async fn generate(
        &self,
        _prompt: &str,
        _params: &GenerationParams,
        _tx: mpsc::Sender<TokenEvent>,
        _cancel: Arc<AtomicBool>,
    ) -> Result<(), GenerationError> {
        Err(GenerationError::Backend(
            "generation backend is disabled".to_string(),
        ))
    }
}

// ============ Scripted backend ============

/// Backend that replays a fixed token script, optionally pausing between
/// increments. Used by tests and offline demos.
pub struct ScriptedBackend {
    tokens: Vec<String>,
    delay: Duration,
}

impl ScriptedBackend {
    pub fn new(tokens: Vec<String>) -> Self {
        Self {
            tokens,
            delay: Duration::ZERO,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl GenerationBackend for ScriptedBackend {
    async fn load(&self, _model: &str) -> Result<(), GenerationError> {
        Ok(())
    }

    async fn unload(&self) {}

    async fn generate(
        &self,
        _prompt: &str,
        _params: &GenerationParams,
        tx: mpsc::Sender<TokenEvent>,
        cancel: Arc<AtomicBool>,
    ) -> Result<(), GenerationError> {
        for token in &self.tokens {
            if cancel.load(Ordering::SeqCst) {
                return Ok(());
            }
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if tx.send(TokenEvent::Delta(token.clone())).await.is_err() {
                // Consumer dropped the stream.
                return Ok(());
            }
        }
        Ok(())
    }
}

// ============ OpenAI-compatible streaming backend ============

/// Streaming backend for OpenAI-compatible `/chat/completions` servers
/// (llama.cpp server, LM Studio, vLLM). Deltas arrive as SSE `data:`
/// lines and are forwarded as they decode.
pub struct OpenAiCompatBackend {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: StdMutex<Option<String>>,
}

impl OpenAiCompatBackend {
    pub fn new(config: &GenerationConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: std::env::var(&config.api_key_env).ok(),
            model: StdMutex::new(None),
        }
    }
}

#[async_trait]
impl GenerationBackend for OpenAiCompatBackend {
    async fn load(&self, model: &str) -> Result<(), GenerationError> {
        // Server-resident models: loading is a reachability check plus
        // remembering which model subsequent calls address.
        let mut request = self.client.get(format!("{}/models", self.base_url));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| GenerationError::LoadFailed(e.to_string()))?;
        if !response.status().is_success() {
            return Err(GenerationError::LoadFailed(format!(
                "model server returned {}",
                response.status()
            )));
        }

        *self.model.lock().unwrap() = Some(model.to_string());
        Ok(())
    }

    async fn unload(&self) {
        *self.model.lock().unwrap() = None;
    }

    async fn generate(
        &self,
        prompt: &str,
        params: &GenerationParams,
        tx: mpsc::Sender<TokenEvent>,
        cancel: Arc<AtomicBool>,
    ) -> Result<(), GenerationError> {
        let model = self
            .model
            .lock()
            .unwrap()
            .clone()
            .ok_or(GenerationError::NotReady("unloaded"))?;

        let body = serde_json::json!({
            "model": model,
            "messages": [{"role": "user", "content": prompt}],
            "temperature": params.temperature,
            "top_p": params.top_p,
            "max_tokens": params.max_tokens,
            "stream": true,
        });

        let mut request = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| GenerationError::Backend(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            if status.as_u16() == 429 || status.is_server_error() {
                return Err(GenerationError::Exhausted(format!("{}: {}", status, text)));
            }
            return Err(GenerationError::Backend(format!("{}: {}", status, text)));
        }

        let mut stream = response.bytes_stream();
        let mut buffer = String::new();

        while let Some(chunk) = stream.next().await {
            if cancel.load(Ordering::SeqCst) {
                return Ok(());
            }

            let bytes = chunk.map_err(|e| GenerationError::Exhausted(e.to_string()))?;
            buffer.push_str(&String::from_utf8_lossy(&bytes));

            while let Some(newline) = buffer.find('\n') {
                let line = buffer[..newline].trim().to_string();
                buffer.drain(..=newline);

                let Some(data) = line.strip_prefix("data:") else {
                    continue;
                };
                let data = data.trim();
                if data == "[DONE]" {
                    return Ok(());
                }

                let Ok(json) = serde_json::from_str::<serde_json::Value>(data) else {
                    continue;
                };
                let delta = json["choices"][0]["delta"]["content"]
                    .as_str()
                    .or_else(|| json["choices"][0]["text"].as_str());
                if let Some(piece) = delta {
                    if !piece.is_empty() && tx.send(TokenEvent::Delta(piece.to_string())).await.is_err() {
                        return Ok(());
                    }
                }
            }
        }

        Ok(())
    }
}
