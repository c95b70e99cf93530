//! Semantic search over an [`IndexStore`].
//!
//! The caller embeds the query (after [`SearchRequest::validate`] has
//! passed) and hands the vector to [`search`], which:
//!
//! 1. Fetches `max_results × candidate_multiplier` candidates from the
//!    store, with the source filter applied before ranking.
//! 2. Collapses candidates whose content hash was already seen, keeping
//!    the higher-ranked one. If fewer than `max_results` distinct chunks
//!    remain and the store had more, the window doubles and step 1 repeats.
//! 3. Orders by relevance (descending), then chunk id (ascending).
//! 4. Truncates to `max_results`.
//!
//! Relevance is cosine similarity mapped onto `[0, 1]`. Zero matches is
//! a valid, empty response.

use std::collections::HashSet;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::embedding::relevance_score;
use crate::error::IndexError;
use crate::models::UnitLocator;
use crate::store::{rank_candidates, IndexStore};

pub const MIN_RESULTS: i64 = 1;
pub const MAX_RESULTS: i64 = 20;

/// A search query as accepted from the CLI, HTTP API or tool calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchRequest {
    pub query: String,
    #[serde(default = "default_max_results", alias = "max_results")]
    pub max_results: i64,
    #[serde(default, alias = "source")]
    pub source_filter: Option<String>,
}

fn default_max_results() -> i64 {
    5
}

impl SearchRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            max_results: default_max_results(),
            source_filter: None,
        }
    }

    pub fn with_max_results(mut self, max_results: i64) -> Self {
        self.max_results = max_results;
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source_filter = Some(source.into());
        self
    }

    /// Cheap checks that must pass before any embedding call is made.
    pub fn validate(&self) -> Result<()> {
        if self.query.trim().is_empty() {
            return Err(IndexError::Validation("query must not be empty".into()).into());
        }
        if !(MIN_RESULTS..=MAX_RESULTS).contains(&self.max_results) {
            return Err(IndexError::Validation(format!(
                "maxResults must be between {} and {}, got {}",
                MIN_RESULTS, MAX_RESULTS, self.max_results
            ))
            .into());
        }
        if let Some(source) = &self.source_filter {
            if source.trim().is_empty() {
                return Err(
                    IndexError::Validation("source filter must not be empty".into()).into(),
                );
            }
        }
        Ok(())
    }
}

/// Retrieval tuning, decoupled from application config.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchParams {
    /// Candidates fetched per requested result, to survive deduplication.
    pub candidate_multiplier: usize,
}

impl Default for SearchParams {
    fn default() -> Self {
        Self {
            candidate_multiplier: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResult {
    pub chunk_id: String,
    pub title: String,
    #[serde(flatten)]
    pub locator: UnitLocator,
    pub content: String,
    pub source_name: String,
    pub word_count: u64,
    /// Relevance in `[0.0, 1.0]`.
    pub relevance_score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResponse {
    pub query: String,
    pub results: Vec<SearchResult>,
}

/// Rank stored chunks against a pre-computed query embedding.
pub async fn search<S: IndexStore + ?Sized>(
    store: &S,
    request: &SearchRequest,
    query_vec: &[f32],
    params: &SearchParams,
) -> Result<SearchResponse> {
    request.validate()?;
    let limit = request.max_results as usize;
    let mut fetch = limit * params.candidate_multiplier.max(1);

    let distinct = loop {
        let mut candidates = store
            .query(query_vec, fetch, request.source_filter.as_deref())
            .await?;
        rank_candidates(&mut candidates);
        let exhausted = candidates.len() < fetch;

        let mut seen = HashSet::new();
        let distinct: Vec<_> = candidates
            .into_iter()
            .filter(|c| seen.insert(c.hash.clone()))
            .take(limit)
            .collect();
        if distinct.len() >= limit || exhausted {
            break distinct;
        }
        // Duplicates crowded out the window; widen it.
        fetch *= 2;
    };

    let results = distinct
        .into_iter()
        .map(|c| SearchResult {
            relevance_score: relevance_score(c.similarity),
            chunk_id: c.chunk_id,
            title: c.title,
            locator: c.locator,
            content: c.content,
            source_name: c.source_name,
            word_count: c.word_count,
        })
        .collect();

    Ok(SearchResponse {
        query: request.query.clone(),
        results,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{chunk_id, content_hash, ChunkConfig};
    use crate::error::classify;
    use crate::models::{ChunkRecord, EmbeddingStamp, Source, SourceKind, Unit};
    use crate::store::memory::InMemoryStore;
    use crate::store::StagedSource;
    use chrono::Utc;

    async fn seed(store: &InMemoryStore, name: &str, contents: &[(&str, [f32; 2])]) {
        let locator = UnitLocator::Path(format!("{}/README.md", name));
        let chunks: Vec<ChunkRecord> = contents
            .iter()
            .enumerate()
            .map(|(i, (text, v))| ChunkRecord {
                id: chunk_id(name, &locator, i),
                source_name: name.into(),
                unit_index: 0,
                chunk_index: i as u64,
                content: text.to_string(),
                word_count: 1,
                hash: content_hash(text),
                embedding: v.to_vec(),
            })
            .collect();
        let staged = StagedSource {
            source: Source::new(
                name,
                SourceKind::Repository,
                "/repo",
                1,
                3,
                chunks.len() as u64,
                Utc::now(),
            ),
            units: vec![Unit {
                index: 0,
                locator,
                title: "README.md".into(),
                word_count: 3,
                line_count: 3,
            }],
            chunks,
            embedding: EmbeddingStamp {
                model: "fake".into(),
                dims: 2,
            },
            chunking: ChunkConfig::default(),
        };
        store.upsert_chunks(&staged).await.unwrap();
    }

    #[test]
    fn test_validate_bounds() {
        assert!(SearchRequest::new("hooks").validate().is_ok());
        assert!(SearchRequest::new("hooks").with_max_results(20).validate().is_ok());
        for bad in [0, 21, -3] {
            let err = SearchRequest::new("hooks")
                .with_max_results(bad)
                .validate()
                .unwrap_err();
            assert!(matches!(classify(&err), Some(IndexError::Validation(_))));
        }
        assert!(SearchRequest::new("   ").validate().is_err());
        assert!(SearchRequest::new("x").with_source("").validate().is_err());
    }

    #[test]
    fn test_request_defaults_from_json() {
        let req: SearchRequest = serde_json::from_str(r#"{"query":"state"}"#).unwrap();
        assert_eq!(req.max_results, 5);
        assert!(req.source_filter.is_none());

        let req: SearchRequest =
            serde_json::from_str(r#"{"query":"state","source":"react"}"#).unwrap();
        assert_eq!(req.source_filter.as_deref(), Some("react"));
    }

    #[tokio::test]
    async fn test_results_sorted_and_bounded() {
        let store = InMemoryStore::new();
        seed(
            &store,
            "a",
            &[("one", [1.0, 0.0]), ("two", [0.7, 0.7]), ("three", [0.0, 1.0])],
        )
        .await;

        let req = SearchRequest::new("q").with_max_results(2);
        let resp = search(&store, &req, &[1.0, 0.0], &SearchParams::default())
            .await
            .unwrap();
        assert_eq!(resp.results.len(), 2);
        assert_eq!(resp.results[0].content, "one");
        assert!(resp.results[0].relevance_score >= resp.results[1].relevance_score);
        for r in &resp.results {
            assert!((0.0..=1.0).contains(&r.relevance_score));
        }
    }

    #[tokio::test]
    async fn test_duplicate_content_collapsed() {
        let store = InMemoryStore::new();
        seed(&store, "a", &[("same text", [1.0, 0.0])]).await;
        seed(&store, "b", &[("same text", [1.0, 0.0]), ("other", [0.5, 0.5])]).await;

        let req = SearchRequest::new("q");
        let resp = search(&store, &req, &[1.0, 0.0], &SearchParams::default())
            .await
            .unwrap();
        let same = resp
            .results
            .iter()
            .filter(|r| r.content == "same text")
            .count();
        assert_eq!(same, 1);
        assert_eq!(resp.results.len(), 2);
    }

    #[tokio::test]
    async fn test_duplicates_do_not_starve_results() {
        let store = InMemoryStore::new();
        seed(
            &store,
            "a",
            &[
                ("dup", [1.0, 0.0]),
                ("dup", [1.0, 0.0]),
                ("dup", [1.0, 0.0]),
                ("dup", [1.0, 0.0]),
                ("unique", [0.6, 0.8]),
            ],
        )
        .await;

        let req = SearchRequest::new("q").with_max_results(2);
        let resp = search(&store, &req, &[1.0, 0.0], &SearchParams::default())
            .await
            .unwrap();
        let contents: Vec<&str> = resp.results.iter().map(|r| r.content.as_str()).collect();
        assert_eq!(contents, vec!["dup", "unique"]);
    }

    #[tokio::test]
    async fn test_source_filter() {
        let store = InMemoryStore::new();
        seed(&store, "a", &[("alpha", [1.0, 0.0])]).await;
        seed(&store, "b", &[("beta", [1.0, 0.0])]).await;

        let req = SearchRequest::new("q").with_source("b");
        let resp = search(&store, &req, &[1.0, 0.0], &SearchParams::default())
            .await
            .unwrap();
        assert_eq!(resp.results.len(), 1);
        assert!(resp.results.iter().all(|r| r.source_name == "b"));
    }

    #[tokio::test]
    async fn test_empty_index_returns_no_results() {
        let store = InMemoryStore::new();
        let req = SearchRequest::new("anything");
        let resp = search(&store, &req, &[1.0, 0.0], &SearchParams::default())
            .await
            .unwrap();
        assert!(resp.results.is_empty());
    }
}
