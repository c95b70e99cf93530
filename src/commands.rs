//! CLI command implementations.
//!
//! Each `run_*` function opens the index, performs one operation and
//! prints a human-readable summary to stdout. Diagnostics and progress go
//! to stderr.

use std::path::Path;

use anyhow::{bail, Result};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use docdex_core::models::{IndexResult, SourceKind};
use docdex_core::search::SearchRequest;

use crate::config::Config;
use crate::crawl::load_crawl_file;
use crate::index::DocIndex;
use crate::lifecycle::AddOptions;
use crate::progress::{format_number, ProgressMode};
use crate::render::render_search;
use crate::sqlite_store::SqliteStore;

/// Cancellation token that fires on Ctrl-C.
fn interrupt_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted; rolling back");
            token.cancel();
        }
    });
    cancel
}

fn print_index_result(result: &IndexResult) {
    println!(
        "Indexed '{}': {} chunks from {} {}",
        result.source_name,
        format_number(result.chunks_created),
        format_number(result.total_units),
        result.kind.unit_label()
    );
    println!(
        "  {} {}, {} tokens, estimated cost ${:.4}",
        format_number(match result.kind {
            SourceKind::Documentation => result.total_words,
            SourceKind::Repository => result.total_lines,
        }),
        result.kind.volume_label(),
        format_number(result.tokens_used),
        result.estimated_cost
    );
    if result.replaced_chunks > 0 {
        println!(
            "  replaced {} chunks from the previous version",
            format_number(result.replaced_chunks)
        );
    }
}

pub async fn run_init(config: &Config) -> Result<()> {
    let store = SqliteStore::open(&config.db.path).await?;
    store.pool().close().await;
    println!("Database initialized at {}", config.db.path.display());
    Ok(())
}

pub async fn run_add_docs(
    config: &Config,
    crawl_file: &Path,
    name: Option<&str>,
    max_pages: Option<usize>,
    replace: bool,
    progress: ProgressMode,
) -> Result<()> {
    let crawl = load_crawl_file(crawl_file)?;
    let index = DocIndex::open(config).await?;
    let reporter = progress.reporter();
    let outcome = index
        .manager()
        .add_documentation(
            crawl,
            name,
            max_pages,
            AddOptions { replace },
            reporter.as_ref(),
            &interrupt_token(),
        )
        .await;
    index.close().await;
    print_index_result(&outcome?);
    Ok(())
}

pub async fn run_add_repo(
    config: &Config,
    path: &Path,
    name: &str,
    replace: bool,
    progress: ProgressMode,
) -> Result<()> {
    let index = DocIndex::open(config).await?;
    let reporter = progress.reporter();
    let outcome = index
        .manager()
        .add_repository(
            name,
            path,
            AddOptions { replace },
            reporter.as_ref(),
            &interrupt_token(),
        )
        .await;
    index.close().await;
    print_index_result(&outcome?);
    Ok(())
}

pub async fn run_remove(config: &Config, name: &str) -> Result<()> {
    let index = DocIndex::open(config).await?;
    let outcome = index.manager().remove_source(name).await;
    index.close().await;
    println!(
        "Removed '{}' ({} chunks)",
        name,
        format_number(outcome?)
    );
    Ok(())
}

pub async fn run_search(
    config: &Config,
    query: &str,
    max_results: Option<i64>,
    source: Option<String>,
    format: &str,
) -> Result<()> {
    match format {
        "text" | "json" | "markdown" => {}
        _ => bail!(
            "Unknown output format: {}. Use text, json, or markdown.",
            format
        ),
    }
    let request = SearchRequest {
        query: query.to_string(),
        max_results: max_results.unwrap_or(config.retrieval.default_results),
        source_filter: source,
    };
    // Bounds are checked before the index (and the provider) are touched.
    request.validate()?;

    let index = DocIndex::open(config).await?;
    let outcome = index.search(&request).await;
    index.close().await;
    let response = outcome?;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&response)?),
        "markdown" => print!(
            "{}",
            render_search(&response, request.source_filter.as_deref())
        ),
        _ if response.results.is_empty() => println!("No results."),
        _ => {
            for (i, r) in response.results.iter().enumerate() {
                println!(
                    "{}. [{:.3}] {} / {}",
                    i + 1,
                    r.relevance_score,
                    r.source_name,
                    r.title
                );
                println!("    {}", r.locator.as_str());
                let preview: String = r.content.chars().take(200).collect();
                println!("    {}", preview.replace('\n', " "));
                println!();
            }
        }
    }
    Ok(())
}

pub async fn run_info(config: &Config, json: bool) -> Result<()> {
    let index = DocIndex::open(config).await?;
    let outcome = index.manifest().await;
    index.close().await;
    let manifest = outcome?;

    if json {
        println!("{}", serde_json::to_string_pretty(&manifest)?);
        return Ok(());
    }

    println!(
        "{} sources, {} pages/files, {} chunks",
        manifest.total_sources,
        format_number(manifest.total_pages),
        format_number(manifest.total_chunks)
    );
    if let Some(model) = &manifest.embedding_model {
        println!(
            "embedding: {} ({} dims)",
            model,
            manifest.embedding_dims.unwrap_or(0)
        );
    }
    if manifest.sources.is_empty() {
        return Ok(());
    }
    println!();
    println!(
        "{:<24} {:<14} {:>8} {:>10} {:>12}  INDEXED",
        "NAME", "TYPE", "UNITS", "CHUNKS", "WORDS/LINES"
    );
    for s in &manifest.sources {
        println!(
            "{:<24} {:<14} {:>8} {:>10} {:>12}  {}",
            s.name,
            s.kind().as_str(),
            format_number(s.unit_count()),
            format_number(s.chunks),
            format_number(s.volume()),
            s.indexed_at.format("%Y-%m-%d %H:%M")
        );
    }
    Ok(())
}

pub async fn run_pages(config: &Config, name: &str, json: bool) -> Result<()> {
    let index = DocIndex::open(config).await?;
    let outcome = index.pages(name).await;
    index.close().await;
    let pages = outcome?;

    if json {
        println!("{}", serde_json::to_string_pretty(&pages)?);
        return Ok(());
    }
    for page in &pages {
        println!(
            "{}  ({} chunks)\n    {}",
            page.title,
            page.chunk_count,
            page.locator.as_str()
        );
    }
    println!("{} units", pages.len());
    Ok(())
}

pub async fn run_repair(config: &Config) -> Result<()> {
    let index = DocIndex::open(config).await?;
    let outcome = index.manager().repair().await;
    index.close().await;
    let report = outcome?;

    if report.is_clean() {
        println!("Index is consistent; nothing to repair.");
        return Ok(());
    }
    println!(
        "Removed {} orphan chunks and {} orphan units",
        report.orphan_chunks_removed, report.orphan_units_removed
    );
    for name in &report.sources_corrected {
        println!("  recomputed counts for '{}'", name);
    }
    Ok(())
}
