//! # DocuMind CLI (`docmind`)
//!
//! ## Usage
//!
//! ```bash
//! docmind --config ./config/docmind.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `docmind init` | Create the SQLite database and schema |
//! | `docmind ingest <paths…>` | Rebuild the collection from files and directories |
//! | `docmind ask "<question>"` | Answer one question, streaming the answer |
//! | `docmind chat` | Interactive multi-turn conversation |
//! | `docmind stats` | Show what the collection holds |
//! | `docmind serve` | Start the HTTP server |

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use docmind::{ask, config, ingest, logging, migrate, server, stats};

/// DocuMind: question answering over your own documents.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/docmind.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "docmind",
    about = "DocuMind — question answering over your own documents",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/docmind.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Ingest documents, replacing the configured collection.
    ///
    /// Paths may be files or directories; directories are filtered by
    /// `[ingest] include_globs`.
    Ingest {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// Ask one question and stream the answer.
    Ask {
        question: String,

        /// Conversation session id.
        #[arg(long, default_value = "default")]
        session: String,
    },

    /// Start an interactive conversation on stdin.
    Chat {
        /// Conversation session id.
        #[arg(long, default_value = "default")]
        session: String,
    },

    /// Show collection statistics.
    Stats,

    /// Start the HTTP server on `[server] bind`.
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    logging::init(cfg.logging.debug);

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Ingest { paths } => {
            migrate::run_migrations(&cfg).await?;
            ingest::run_ingest(&cfg, &paths).await?;
        }
        Commands::Ask { question, session } => {
            ask::run_ask(&cfg, &question, &session).await?;
        }
        Commands::Chat { session } => {
            ask::run_chat(&cfg, &session).await?;
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
