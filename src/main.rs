//! # Hearth CLI (`hearth`)
//!
//! Command-line interface for the Hearth assistant core: database
//! initialization, document ingestion, retrieval, sessions, question
//! answering, and background generation tasks.
//!
//! ## Usage
//!
//! ```bash
//! hearth --config ./config/hearth.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `hearth init` | Create the SQLite database and run schema migrations |
//! | `hearth ingest <dir>` | Chunk, embed, and index documents from a directory |
//! | `hearth search "<query>"` | Hybrid search over indexed chunks |
//! | `hearth ask "<question>"` | Answer a question with retrieved context |
//! | `hearth session <action>` | Create, list, show, or delete conversations |
//! | `hearth task <action>` | Submit, inspect, or cancel background tasks |
//! | `hearth providers` | List configured task providers |
//! | `hearth stats` | Database and index statistics |

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use hearth::config::{self, Config};
use hearth::generation::TokenEvent;
use hearth::models::{TaskKind, TaskRecord, TaskRequest};
use hearth::pipeline::Assistant;
use hearth::prompt::PromptAssembler;
use hearth::rerank::Reranker;
use hearth::retriever::{HybridRetriever, SearchMode};
use hearth::session::SessionStore;
use hearth::store::VectorStore;
use hearth::{db, embedding, generation, ingest, migrate, tasks};

/// Hearth — a local-first retrieval-augmented assistant.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/hearth.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "hearth",
    about = "Hearth — a local-first retrieval-augmented assistant",
    version,
    long_about = "Hearth indexes local documents into SQLite (FTS5 + vectors), answers \
    questions by fusing keyword and semantic retrieval into a cited prompt for a locally \
    hosted model, and runs long media-generation jobs on a bounded background queue with \
    provider fallback."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/hearth.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables. Idempotent;
    /// running it multiple times is safe.
    Init,

    /// Ingest documents from a directory tree.
    ///
    /// Reads `.md` and `.txt` files, chunks them with the configured window,
    /// embeds the chunks, and indexes everything for hybrid search.
    /// Re-ingesting unchanged files is a no-op; changed files replace their
    /// prior version.
    Ingest {
        /// Directory to scan recursively.
        dir: PathBuf,
    },

    /// Hybrid search over indexed chunks.
    ///
    /// Runs keyword (FTS5) and semantic (vector) retrieval and fuses the
    /// two rankings. Falls back to whichever channel is available when the
    /// other fails.
    Search {
        /// The search query string.
        query: String,

        /// Search mode: `keyword` (FTS5), `semantic` (vector), or `hybrid`.
        #[arg(long, default_value = "hybrid")]
        mode: String,

        /// Maximum number of results.
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Answer a question using retrieved context.
    ///
    /// Retrieves and reranks relevant chunks, assembles a cited prompt, and
    /// streams the model's answer. Requires a generation backend in the
    /// configuration. With `--session`, the turn is appended to that
    /// conversation's history.
    Ask {
        /// The question to answer.
        question: String,

        /// Session id to record the turn under. Omit for a one-off answer.
        #[arg(long)]
        session: Option<String>,
    },

    /// Manage conversation sessions.
    Session {
        #[command(subcommand)]
        action: SessionAction,
    },

    /// Manage background generation tasks.
    Task {
        #[command(subcommand)]
        action: TaskAction,
    },

    /// List configured task providers.
    Providers,

    /// Database and index statistics.
    ///
    /// Shows document, chunk, vector, and session counts plus embedding
    /// coverage, to confirm ingestion and embedding are working.
    Stats,
}

#[derive(Subcommand)]
enum SessionAction {
    /// Create a new session.
    New {
        /// Human-readable title.
        #[arg(default_value = "Untitled")]
        title: String,
    },
    /// List all sessions, most recently active first.
    List,
    /// Print a session's full message history in order.
    Show { id: String },
    /// Delete a session and all of its messages.
    Delete { id: String },
}

#[derive(Subcommand)]
enum TaskAction {
    /// Submit a background generation task and wait for it to finish.
    Submit {
        /// Task kind: `image`, `video`, or `text`.
        kind: String,

        /// Prompt for the generation.
        prompt: String,

        /// Billable units (e.g. seconds of video, number of images).
        #[arg(long, default_value_t = 1.0)]
        units: f64,

        /// Hard cap on spend; submission is rejected when even the cheapest
        /// provider would exceed it.
        #[arg(long)]
        budget: Option<f64>,

        /// Comma-separated provider ids to try in order, overriding the
        /// configured tier order.
        #[arg(long)]
        providers: Option<String>,
    },
    /// Show a task's current state, cost, and attempt errors.
    Status { id: String },
    /// Cancel a task. Free if it has not started running yet.
    Cancel { id: String },
    /// List all tasks submitted this run.
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    config::warn_optional(&cfg);

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&cfg.db.path).await?;
            migrate::run_migrations(&pool).await?;
            println!("Database initialized at {}", cfg.db.path.display());
        }
        Commands::Ingest { dir } => run_ingest(&cfg, &dir).await?,
        Commands::Search { query, mode, limit } => run_search(&cfg, &query, &mode, limit).await?,
        Commands::Ask { question, session } => run_ask(&cfg, &question, session).await?,
        Commands::Session { action } => run_session(&cfg, action).await?,
        Commands::Task { action } => run_task(&cfg, action).await?,
        Commands::Providers => run_providers(&cfg),
        Commands::Stats => run_stats(&cfg).await?,
    }

    Ok(())
}

async fn run_ingest(cfg: &Config, dir: &std::path::Path) -> Result<()> {
    let pool = db::connect(&cfg.db.path).await?;
    let store = VectorStore::open(pool.clone())
        .await
        .context("Store not initialized; run `hearth init` first")?;
    let embedder = embedding::create_embedding_model(&cfg.embedding)?;

    let items = ingest::collect_dir(dir)?;
    if items.is_empty() {
        println!("No .md or .txt files found under {}", dir.display());
        return Ok(());
    }

    let outcome =
        ingest::ingest_batch(&pool, &store, embedder.as_ref(), &cfg.chunking, &items).await?;
    println!(
        "Ingested {} documents ({} chunks, {} embedded, {} pending embedding, {} skipped)",
        outcome.documents,
        outcome.chunks,
        outcome.embedded,
        outcome.pending_embeddings,
        outcome.skipped
    );

    let stale = store.stale_count(embedder.model_name()).await?;
    if stale > 0 {
        println!(
            "Note: {} vectors were produced by a different embedding model and should be re-embedded.",
            stale
        );
    }
    Ok(())
}

async fn run_search(cfg: &Config, query: &str, mode: &str, limit: Option<usize>) -> Result<()> {
    let mode = SearchMode::parse(mode)
        .with_context(|| format!("Unknown search mode: {} (keyword, semantic, or hybrid)", mode))?;

    let pool = db::connect(&cfg.db.path).await?;
    let store = Arc::new(VectorStore::open(pool.clone()).await?);
    let embedder = embedding::create_embedding_model(&cfg.embedding)?;

    let mut retrieval = cfg.retrieval.clone();
    if let Some(limit) = limit {
        retrieval.top_k = limit;
        retrieval.candidate_k = retrieval.candidate_k.max(limit);
    }
    let retriever = HybridRetriever::new(pool, store, embedder, retrieval);

    let results = retriever.retrieve_with_mode(query, mode).await?;
    if results.is_empty() {
        println!("No results.");
        return Ok(());
    }
    for result in &results {
        println!(
            "{:>2}. [{:.4}] {}",
            result.rank + 1,
            result.score,
            snippet(&result.text, 120)
        );
        println!("    chunk {} / doc {}", result.chunk_id, result.document_id);
    }
    Ok(())
}

async fn run_ask(cfg: &Config, question: &str, session: Option<String>) -> Result<()> {
    let pool = db::connect(&cfg.db.path).await?;
    let store = Arc::new(VectorStore::open(pool.clone()).await?);
    let embedder = embedding::create_embedding_model(&cfg.embedding)?;

    let engine = generation::create_engine(&cfg.generation)?;
    let model = cfg
        .generation
        .model
        .clone()
        .context("generation.model must be set to use `ask`")?;
    engine.load(&model).await?;

    let retriever = Arc::new(HybridRetriever::new(
        pool.clone(),
        store,
        embedder,
        cfg.retrieval.clone(),
    ));
    let assistant = Assistant {
        retriever,
        reranker: Arc::new(Reranker::new(Arc::clone(&engine), cfg.retrieval.rerank_cutoff)),
        assembler: PromptAssembler::new(cfg.generation.prompt_budget_chars),
        engine: Arc::clone(&engine),
        sessions: Arc::new(SessionStore::new(pool)),
    };

    let session_id = match session {
        Some(id) => id,
        None => assistant.sessions.create_session("ad-hoc").await?.id,
    };

    let mut turn = assistant.start_turn(&session_id, question).await?;

    if !turn.context.is_empty() {
        println!("References:");
        for (i, chunk) in turn.context.iter().enumerate() {
            println!("  [{}] {}", i + 1, snippet(&chunk.text, 100));
        }
        println!();
    }

    let mut answer = String::new();
    while let Some(event) = turn.stream.next().await {
        match event {
            TokenEvent::Delta(piece) => {
                print!("{}", piece);
                use std::io::Write;
                std::io::stdout().flush().ok();
                answer.push_str(&piece);
            }
            TokenEvent::Done => break,
            TokenEvent::Error(e) => bail!("Generation failed: {}", e),
        }
    }
    println!();

    assistant.finish_turn(&session_id, turn, &answer).await?;
    engine.unload().await;
    Ok(())
}

async fn run_session(cfg: &Config, action: SessionAction) -> Result<()> {
    let pool = db::connect(&cfg.db.path).await?;
    let sessions = SessionStore::new(pool);

    match action {
        SessionAction::New { title } => {
            let session = sessions.create_session(&title).await?;
            println!("{}", session.id);
        }
        SessionAction::List => {
            let all = sessions.list_sessions().await?;
            if all.is_empty() {
                println!("No sessions.");
            }
            for session in all {
                println!("{}  {}", session.id, session.title);
            }
        }
        SessionAction::Show { id } => {
            let Some(session) = sessions.get_session(&id).await? else {
                bail!("No such session: {}", id);
            };
            println!("# {} ({})", session.title, session.id);
            for message in sessions.list_messages(&id).await? {
                println!();
                println!("[{}] {}:", message.sequence, message.role.as_str());
                println!("{}", message.content);
            }
        }
        SessionAction::Delete { id } => {
            sessions.delete_session(&id).await?;
            println!("Deleted session {}", id);
        }
    }
    Ok(())
}

async fn run_task(cfg: &Config, action: TaskAction) -> Result<()> {
    let queue = tasks::create_queue(&cfg.providers, &cfg.tasks);

    match action {
        TaskAction::Submit {
            kind,
            prompt,
            units,
            budget,
            providers,
        } => {
            let kind = match kind.as_str() {
                "image" => TaskKind::Image,
                "video" => TaskKind::Video,
                "text" => TaskKind::Text,
                other => bail!("Unknown task kind: {} (image, video, or text)", other),
            };
            let preference =
                providers.map(|p| p.split(',').map(|s| s.trim().to_string()).collect());
            let request = TaskRequest {
                kind,
                payload: serde_json::json!({ "prompt": prompt }),
                units,
                budget_ceiling: budget,
            };

            if let Some(estimate) = queue.estimate_cost(&request, None) {
                println!("Estimated cost: {:.4}", estimate);
            }

            let id = queue.enqueue(request, preference)?;
            println!("Submitted task {}", id);

            let record = queue.wait_terminal(&id).await?;
            print_task(&record);
        }
        TaskAction::Status { id } => print_task(&queue.status(&id)?),
        TaskAction::Cancel { id } => {
            let state = queue.cancel(&id).await?;
            println!("Task {} is now {:?}", id, state);
        }
        TaskAction::List => {
            let records = queue.list();
            if records.is_empty() {
                println!("No tasks this run.");
            }
            for record in records {
                println!(
                    "{}  {:?}  {:?}  cost={:.4}",
                    record.id, record.kind, record.state, record.cost
                );
            }
        }
    }
    Ok(())
}

fn run_providers(cfg: &Config) {
    if cfg.providers.is_empty() {
        println!("No providers configured.");
        return;
    }
    for provider in &cfg.providers {
        println!(
            "{}  tier={}  cost/unit={:.4}  kinds={}  timeout={}s",
            provider.id,
            provider.tier,
            provider.cost_per_unit,
            provider.kinds.join(","),
            provider.timeout_secs
        );
    }
}

async fn run_stats(cfg: &Config) -> Result<()> {
    let pool = db::connect(&cfg.db.path).await?;

    let docs: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents")
        .fetch_one(&pool)
        .await?;
    let chunks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
        .fetch_one(&pool)
        .await?;
    let vectors: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunk_vectors")
        .fetch_one(&pool)
        .await?;
    let sessions: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sessions")
        .fetch_one(&pool)
        .await?;
    let messages: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages")
        .fetch_one(&pool)
        .await?;

    let db_size = std::fs::metadata(&cfg.db.path).map(|m| m.len()).unwrap_or(0);

    println!("Hearth — Database Stats");
    println!("=======================");
    println!();
    println!("  Database:   {}", cfg.db.path.display());
    println!("  Size:       {}", format_bytes(db_size));
    println!();
    println!("  Documents:  {}", docs);
    println!("  Chunks:     {}", chunks);
    println!(
        "  Embedded:   {} ({:.0}% coverage)",
        vectors,
        if chunks > 0 {
            vectors as f64 / chunks as f64 * 100.0
        } else {
            0.0
        }
    );
    println!("  Sessions:   {} ({} messages)", sessions, messages);
    Ok(())
}

fn print_task(record: &TaskRecord) {
    print!("{}", format_task(record));
}

fn format_task(record: &TaskRecord) -> String {
    let mut out = String::new();
    out.push_str(&format!("Task {}\n", record.id));
    out.push_str(&format!("  Kind:     {:?}\n", record.kind));
    out.push_str(&format!("  State:    {:?}\n", record.state));
    if let Some(provider) = &record.provider {
        out.push_str(&format!("  Provider: {}\n", provider));
    }
    out.push_str(&format!("  Cost:     {:.4}\n", record.cost));
    if let Some(result) = &record.result {
        out.push_str(&format!("  Result:   {}\n", result));
    }
    for (provider, error) in &record.errors {
        out.push_str(&format!("  Attempt {}: {}\n", provider, error));
    }
    out
}

fn snippet(text: &str, max_chars: usize) -> String {
    let flat: String = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max_chars {
        flat
    } else {
        let cut: String = flat.chars().take(max_chars).collect();
        format!("{}...", cut.trim_end())
    }
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[unit])
    } else {
        format!("{:.1} {}", size, UNITS[unit])
    }
}
