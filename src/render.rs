//! Markdown renderings of index info and search results.
//!
//! Used by the CLI and by the `search-docs` / `get-index-info` tools, whose
//! callers are language models that read markdown better than JSON.

use std::fmt::Write;

use docdex_core::models::{Manifest, SourceDetails, UnitLocator};
use docdex_core::search::SearchResponse;

use crate::progress::format_number;

pub fn render_index_info(manifest: &Manifest) -> String {
    let mut out = String::from("# Documentation Index\n\n");
    let updated = manifest
        .last_updated
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| "never".to_string());
    let _ = writeln!(out, "- **Last updated:** {}", updated);
    let _ = writeln!(out, "- **Sources:** {}", manifest.total_sources);
    let _ = writeln!(out, "- **Pages/files:** {}", format_number(manifest.total_pages));
    let _ = writeln!(out, "- **Chunks:** {}", format_number(manifest.total_chunks));
    let _ = writeln!(out, "- **Words:** {}", format_number(manifest.total_words));
    let _ = writeln!(out, "- **Lines:** {}", format_number(manifest.total_lines));
    let _ = writeln!(
        out,
        "- **Embedding model:** {}",
        manifest.embedding_model.as_deref().unwrap_or("none")
    );
    if let (Some(size), Some(overlap)) = (manifest.chunk_size, manifest.chunk_overlap) {
        let _ = writeln!(out, "- **Chunking:** {} words, {} overlap", size, overlap);
    }

    if manifest.sources.is_empty() {
        out.push_str("\nNo sources indexed.\n");
        return out;
    }

    out.push_str("\n## Sources\n");
    for source in &manifest.sources {
        let _ = writeln!(out);
        match &source.details {
            SourceDetails::Documentation { url, pages, words } => {
                let _ = writeln!(out, "### {} (documentation)\n", source.name);
                let _ = writeln!(out, "- URL: {}", url);
                let _ = writeln!(out, "- Pages: {}", format_number(*pages));
                let _ = writeln!(out, "- Words: {}", format_number(*words));
            }
            SourceDetails::Repository { path, files, lines } => {
                let _ = writeln!(out, "### {} (repository)\n", source.name);
                let _ = writeln!(out, "- Path: {}", path);
                let _ = writeln!(out, "- Files: {}", format_number(*files));
                let _ = writeln!(out, "- Lines: {}", format_number(*lines));
            }
        }
        let _ = writeln!(out, "- Chunks: {}", format_number(source.chunks));
        let _ = writeln!(out, "- Indexed: {}", source.indexed_at.to_rfc3339());
    }
    out
}

pub fn render_search(response: &SearchResponse, source_filter: Option<&str>) -> String {
    if response.results.is_empty() {
        return format!("No results found for query: '{}'\n", response.query);
    }

    let mut out = format!("# Search results for \"{}\"\n\n", response.query);
    if let Some(source) = source_filter {
        let _ = writeln!(out, "Filtered by source: **{}**\n", source);
    }
    for (i, r) in response.results.iter().enumerate() {
        let _ = writeln!(out, "## {}. {}\n", i + 1, r.title);
        let _ = writeln!(out, "- Source: {}", r.source_name);
        match &r.locator {
            UnitLocator::Url(url) => {
                let _ = writeln!(out, "- URL: {}", url);
            }
            UnitLocator::Path(path) => {
                let _ = writeln!(out, "- File: {}", path);
            }
        }
        let _ = writeln!(out, "- Relevance: {:.3}", r.relevance_score);
        let _ = writeln!(out, "\n{}\n\n---\n", r.content);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use docdex_core::models::{IndexMeta, Source, SourceKind};
    use docdex_core::search::SearchResult;

    #[test]
    fn test_index_info_lists_both_kinds() {
        let manifest = Manifest::from_sources(
            &IndexMeta::default(),
            vec![
                Source::new("alpha", SourceKind::Documentation, "https://a.dev", 3, 1500, 9, Utc::now()),
                Source::new("beta", SourceKind::Repository, "/src/beta", 2, 40, 2, Utc::now()),
            ],
        );
        let text = render_index_info(&manifest);
        assert!(text.contains("### alpha (documentation)"));
        assert!(text.contains("- Words: 1,500"));
        assert!(text.contains("### beta (repository)"));
        assert!(text.contains("- Lines: 40"));
        assert!(text.contains("- **Embedding model:** none"));
    }

    #[test]
    fn test_empty_search() {
        let response = SearchResponse {
            query: "hooks".into(),
            results: vec![],
        };
        assert_eq!(
            render_search(&response, None),
            "No results found for query: 'hooks'\n"
        );
    }

    #[test]
    fn test_search_shows_locator() {
        let response = SearchResponse {
            query: "hooks".into(),
            results: vec![SearchResult {
                chunk_id: "c1".into(),
                title: "Hooks".into(),
                locator: UnitLocator::Url("https://react.dev/hooks".into()),
                content: "useState lets you".into(),
                source_name: "react".into(),
                word_count: 3,
                relevance_score: 0.91,
            }],
        };
        let text = render_search(&response, Some("react"));
        assert!(text.contains("## 1. Hooks"));
        assert!(text.contains("- URL: https://react.dev/hooks"));
        assert!(text.contains("Filtered by source: **react**"));
    }
}
