//! # docdex CLI
//!
//! The `docdex` binary indexes documentation crawls and local repositories
//! into a semantic search index, and serves that index over HTTP.
//!
//! ## Usage
//!
//! ```bash
//! docdex --config ./config/docdex.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `docdex init` | Create the SQLite database and run schema migrations |
//! | `docdex add-docs <crawl.json>` | Index a documentation crawl |
//! | `docdex add-repo <path> --name <name>` | Index a local repository |
//! | `docdex remove <name>` | Remove a source |
//! | `docdex search "<query>"` | Search the index |
//! | `docdex info` | Show the manifest |
//! | `docdex pages <name>` | List a source's pages or files |
//! | `docdex repair` | Recompute the manifest from stored chunks |
//! | `docdex serve` | Start the HTTP server |
//!
//! ## Examples
//!
//! ```bash
//! docdex init
//! docdex add-docs ./crawls/react.json --name react --max-pages 50
//! docdex add-repo ~/src/tokio --name tokio --progress json
//! docdex search "how do I cancel a task" --source tokio --max-results 5
//! docdex serve
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use docdex::commands;
use docdex::config;
use docdex::progress::ProgressMode;
use docdex::server;

/// docdex: semantic search over documentation and code.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/docdex.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "docdex",
    about = "docdex: semantic search over documentation and code",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/docdex.toml")]
    config: PathBuf,

    /// Progress output for add commands: `human`, `json` or `off`.
    /// Defaults to `human` when stderr is a terminal, `off` otherwise.
    #[arg(long, global = true)]
    progress: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Idempotent; running it on an existing index is safe.
    Init,

    /// Index a documentation crawl file.
    ///
    /// The file holds `{ source, pages: [{ url, title, content, wordCount }] }`
    /// as written by the crawler.
    AddDocs {
        /// Path to the crawl JSON file.
        crawl_file: PathBuf,

        /// Source name. Defaults to the crawl URL's host.
        #[arg(long)]
        name: Option<String>,

        /// Index at most this many pages, in crawl order.
        #[arg(long)]
        max_pages: Option<usize>,

        /// Re-index the source if it already exists.
        #[arg(long)]
        replace: bool,
    },

    /// Index a local repository.
    AddRepo {
        /// Repository root directory.
        path: PathBuf,

        /// Source name.
        #[arg(long)]
        name: String,

        /// Re-index the source if it already exists.
        #[arg(long)]
        replace: bool,
    },

    /// Remove a source and all its chunks.
    Remove {
        name: String,
    },

    /// Search the index.
    Search {
        query: String,

        /// Number of results, 1 to 20. Defaults to `retrieval.default_results`.
        #[arg(long)]
        max_results: Option<i64>,

        /// Only search this source.
        #[arg(long)]
        source: Option<String>,

        /// Output format: `text`, `json` or `markdown`.
        #[arg(long, default_value = "text")]
        format: String,
    },

    /// Show the index manifest.
    Info {
        #[arg(long)]
        json: bool,
    },

    /// List the pages or files of a source.
    Pages {
        name: String,

        #[arg(long)]
        json: bool,
    },

    /// Remove orphaned rows and recompute manifest counts.
    Repair,

    /// Start the HTTP server on `server.bind`.
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("docdex=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let progress = match cli.progress.as_deref() {
        Some(value) => ProgressMode::parse(value).ok_or_else(|| {
            anyhow::anyhow!("Unknown progress mode: {}. Use human, json, or off.", value)
        })?,
        None => ProgressMode::default_for_tty(),
    };

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            commands::run_init(&cfg).await?;
        }
        Commands::AddDocs {
            crawl_file,
            name,
            max_pages,
            replace,
        } => {
            commands::run_add_docs(
                &cfg,
                &crawl_file,
                name.as_deref(),
                max_pages,
                replace,
                progress,
            )
            .await?;
        }
        Commands::AddRepo {
            path,
            name,
            replace,
        } => {
            commands::run_add_repo(&cfg, &path, &name, replace, progress).await?;
        }
        Commands::Remove { name } => {
            commands::run_remove(&cfg, &name).await?;
        }
        Commands::Search {
            query,
            max_results,
            source,
            format,
        } => {
            commands::run_search(&cfg, &query, max_results, source, &format).await?;
        }
        Commands::Info { json } => {
            commands::run_info(&cfg, json).await?;
        }
        Commands::Pages { name, json } => {
            commands::run_pages(&cfg, &name, json).await?;
        }
        Commands::Repair => {
            commands::run_repair(&cfg).await?;
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
