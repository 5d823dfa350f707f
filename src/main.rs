//! # Campus Chat CLI (`campus-chat`)
//!
//! Entry point for the chatbot service. Provides commands for database
//! initialization, one-shot questions, an interactive console, and the
//! HTTP/SSE server.
//!
//! ## Usage
//!
//! ```bash
//! campus-chat --config ./config/campus.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `campus-chat init` | Create the SQLite index database and run migrations |
//! | `campus-chat ask "<question>"` | Answer one question and exit (no quota gate) |
//! | `campus-chat repl` | Interactive console with the full quota/email flow |
//! | `campus-chat serve` | Start the HTTP/SSE API server |

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use campus_chat::generate::GeminiGenerator;
use campus_chat::pipeline::Pipeline;
use campus_chat::retrieval::IndexRetriever;
use campus_chat::{config, db, migrate, repl, server};

/// Campus Chat — a retrieval-augmented chatbot for the SRMIST Ramapuram
/// university website.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/campus.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "campus-chat",
    about = "Campus Chat — a retrieval-augmented chatbot for the SRMIST Ramapuram website",
    version,
    long_about = "Campus Chat answers questions about the university from a crawled document \
    index (SQLite FTS5 + vectors), streaming Gemini-generated answers behind a session-based \
    free-query limit with email capture."
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/campus.toml`. Database, retrieval, generation,
    /// session, and server settings are read from this file.
    #[arg(long, global = true, default_value = "./config/campus.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables
    /// (documents, chunks, chunks_fts, chunk_vectors, email_users,
    /// usage_logs). This command is idempotent.
    Init,

    /// Answer one question and exit.
    ///
    /// Runs the full retrieval → generation pipeline without the
    /// session gate; intended for operators and smoke tests.
    Ask {
        /// The question to answer.
        question: String,
    },

    /// Interactive console with the full quota/email flow.
    Repl,

    /// Start the HTTP/SSE API server.
    ///
    /// Binds to the address configured in `[server].bind`.
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&cfg.db.path).await?;
            migrate::run_migrations(&pool).await?;
            println!("Database initialized successfully.");
        }
        Commands::Ask { question } => {
            let pool = db::connect(&cfg.db.path).await?;
            migrate::run_migrations(&pool).await?;

            let retriever =
                IndexRetriever::new(pool, cfg.retrieval.clone(), cfg.embedding.clone());
            let generator = GeminiGenerator::new(&cfg.generation)?;
            let pipeline = Pipeline::new(
                Arc::new(retriever),
                Arc::new(generator),
                cfg.retrieval.clone(),
            );

            let (answer, sources) = pipeline.answer(&question).await;
            println!("{}", answer);
            if !sources.is_empty() {
                println!("{}", sources);
            }
        }
        Commands::Repl => {
            repl::run_repl(&cfg).await?;
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
