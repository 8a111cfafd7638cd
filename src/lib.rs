//! # Hearth
//!
//! A local-first retrieval-augmented assistant core. Documents are
//! chunked, embedded, and indexed into SQLite (FTS5 + vectors); questions
//! are answered by fusing lexical and semantic retrieval, folding the top
//! chunks into a cited prompt, and streaming tokens from a locally hosted
//! model. Long-running media jobs run on a bounded background queue with
//! ordered provider fallback and per-task cost accounting.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐   ┌──────────────┐   ┌───────────┐
//! │ Documents │──▶│ Chunk+Embed  │──▶│  SQLite   │
//! └───────────┘   └──────────────┘   │ FTS5+Vec  │
//!                                    └─────┬─────┘
//!                                          │
//!            question ──▶ retrieve ──▶ rerank ──▶ prompt ──▶ generate
//!                                          │                    │
//!                                    ┌─────┴─────┐        token stream
//!                                    │ sessions  │◀── user/assistant turns
//!                                    └───────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`error`] | Per-stage error taxonomy |
//! | [`models`] | Core data types |
//! | [`chunk`] | Sliding-window text chunking |
//! | [`embedding`] | Embedding model abstraction |
//! | [`store`] | SQLite vector store |
//! | [`ingest`] | Document ingestion pipeline |
//! | [`retriever`] | Hybrid lexical + semantic retrieval with RRF |
//! | [`rerank`] | Optional LLM reranking pass |
//! | [`prompt`] | Context-to-prompt assembly |
//! | [`generation`] | Streaming generation engine and model lifecycle |
//! | [`session`] | Conversation persistence |
//! | [`tasks`] | Background task queue with provider fallback |
//! | [`pipeline`] | End-to-end question answering |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod chunk;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod generation;
pub mod ingest;
pub mod migrate;
pub mod models;
pub mod pipeline;
pub mod prompt;
pub mod rerank;
pub mod retriever;
pub mod session;
pub mod store;
pub mod tasks;
