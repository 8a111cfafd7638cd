//! End-to-end question answering over a session.
//!
//! One turn: append the user message, retrieve and rerank context,
//! assemble the prompt, stream the answer, append the assistant message.
//! The session's turn lock is held for the whole turn so concurrent turns
//! on one session land as whole user/assistant pairs.
//!
//! Retrieval failure degrades the turn to an empty context rather than
//! failing it; generation failure fails the turn and leaves no assistant
//! message behind.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::OwnedMutexGuard;
use tracing::warn;

use crate::generation::{GenerationEngine, TokenStream};
use crate::models::{RetrievalResult, Role};
use crate::prompt::PromptAssembler;
use crate::rerank::Reranker;
use crate::retriever::HybridRetriever;
use crate::session::SessionStore;

pub struct Assistant {
    pub retriever: Arc<HybridRetriever>,
    pub reranker: Arc<Reranker>,
    pub assembler: PromptAssembler,
    pub engine: Arc<GenerationEngine>,
    pub sessions: Arc<SessionStore>,
}

/// A turn in progress: context already chosen, answer still streaming.
/// Holds the session's turn lock until it is consumed by
/// [`Assistant::finish_turn`] or dropped, so no other turn on the same
/// session can start in between.
pub struct TurnStream {
    pub context: Vec<RetrievalResult>,
    pub stream: TokenStream,
    guard: OwnedMutexGuard<()>,
}

impl Assistant {
    /// Run one complete turn and return the answer text plus the context
    /// that informed it.
    pub async fn run_turn(
        &self,
        session_id: &str,
        question: &str,
    ) -> Result<(String, Vec<RetrievalResult>)> {
        let lock = self.sessions.turn_lock(session_id).await;
        let _guard = lock.lock().await;

        self.sessions
            .append_message_locked(session_id, Role::User, question)
            .await
            .context("Failed to record user message")?;

        let context = self.gather_context(question).await;
        let prompt = self.assembler.assemble(&context, question);

        let answer = self
            .engine
            .generate(&prompt, None)
            .await
            .context("Generation failed")?;

        self.sessions
            .append_message_locked(session_id, Role::Assistant, &answer)
            .await
            .context("Failed to record assistant message")?;

        Ok((answer, context))
    }

    /// Streaming variant for interactive use: the user message is recorded
    /// and the token stream handed back for the caller to drain. The
    /// caller persists the answer via [`finish_turn`](Self::finish_turn).
    ///
    /// The session's turn lock travels inside the returned [`TurnStream`],
    /// so a second turn on the same session is not accepted until this one
    /// is finished or abandoned.
    pub async fn start_turn(&self, session_id: &str, question: &str) -> Result<TurnStream> {
        let guard = self
            .sessions
            .turn_lock(session_id)
            .await
            .lock_owned()
            .await;

        self.sessions
            .append_message_locked(session_id, Role::User, question)
            .await
            .context("Failed to record user message")?;

        let context = self.gather_context(question).await;
        let prompt = self.assembler.assemble(&context, question);

        let stream = self
            .engine
            .generate_stream(&prompt, None)
            .await
            .context("Generation failed to start")?;

        Ok(TurnStream {
            context,
            stream,
            guard,
        })
    }

    /// Persist the drained answer and release the turn lock.
    pub async fn finish_turn(
        &self,
        session_id: &str,
        turn: TurnStream,
        answer: &str,
    ) -> Result<()> {
        self.sessions
            .append_message_locked(session_id, Role::Assistant, answer)
            .await
            .context("Failed to record assistant message")?;
        drop(turn.guard);
        Ok(())
    }

    /// Retrieve and rerank, degrading to no context on retrieval failure.
    async fn gather_context(&self, question: &str) -> Vec<RetrievalResult> {
        let fused = match self.retriever.retrieve(question).await {
            Ok(results) => results,
            Err(e) => {
                warn!(error = %e, "retrieval failed, answering without references");
                return Vec::new();
            }
        };
        self.reranker.rerank(question, fused).await
    }
}
