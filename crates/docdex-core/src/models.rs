//! Core data models for the docdex index.
//!
//! A **source** is a named corpus: either a crawled documentation site or
//! a local code repository. Each source is split into **units** (pages or
//! files), and each unit into overlapping **chunks**, which are the unit
//! of retrieval. The **manifest** is the summary view over every live
//! source together with the embedding model the index was built with.
//!
//! JSON shapes use camelCase to match the HTTP API.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::IndexError;

/// Longest accepted source name, in characters.
pub const MAX_SOURCE_NAME_LEN: usize = 128;

/// Source names are used as path segments and manifest keys: non-empty,
/// no surrounding whitespace, no `/` and no control characters.
pub fn validate_source_name(name: &str) -> Result<()> {
    let problem = if name.trim().is_empty() {
        Some("must not be empty")
    } else if name.trim() != name {
        Some("must not start or end with whitespace")
    } else if name.chars().count() > MAX_SOURCE_NAME_LEN {
        Some("is too long")
    } else if name.chars().any(|c| c == '/' || c.is_control()) {
        Some("must not contain '/' or control characters")
    } else {
        None
    };
    match problem {
        Some(p) => Err(IndexError::Validation(format!("source name '{}' {}", name, p)).into()),
        None => Ok(()),
    }
}

/// The two kinds of indexable source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Documentation,
    Repository,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Documentation => "documentation",
            SourceKind::Repository => "repository",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "documentation" => Some(SourceKind::Documentation),
            "repository" => Some(SourceKind::Repository),
            _ => None,
        }
    }

    /// Plural label for a source's units ("pages" or "files").
    pub fn unit_label(&self) -> &'static str {
        match self {
            SourceKind::Documentation => "pages",
            SourceKind::Repository => "files",
        }
    }

    /// Label for a source's volume measure ("words" or "lines").
    pub fn volume_label(&self) -> &'static str {
        match self {
            SourceKind::Documentation => "words",
            SourceKind::Repository => "lines",
        }
    }
}

/// Where a unit lives: a page URL or a repository-relative file path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitLocator {
    Url(String),
    Path(String),
}

impl UnitLocator {
    pub fn as_str(&self) -> &str {
        match self {
            UnitLocator::Url(s) | UnitLocator::Path(s) => s,
        }
    }

    pub fn for_kind(kind: SourceKind, value: String) -> Self {
        match kind {
            SourceKind::Documentation => UnitLocator::Url(value),
            SourceKind::Repository => UnitLocator::Path(value),
        }
    }
}

/// Identity of a source before it is indexed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SourceDescriptor {
    Documentation { name: String, url: String },
    Repository { name: String, path: String },
}

impl SourceDescriptor {
    pub fn name(&self) -> &str {
        match self {
            SourceDescriptor::Documentation { name, .. } | SourceDescriptor::Repository { name, .. } => {
                name
            }
        }
    }

    pub fn kind(&self) -> SourceKind {
        match self {
            SourceDescriptor::Documentation { .. } => SourceKind::Documentation,
            SourceDescriptor::Repository { .. } => SourceKind::Repository,
        }
    }

    /// Root URL or repository path.
    pub fn origin(&self) -> &str {
        match self {
            SourceDescriptor::Documentation { url, .. } => url,
            SourceDescriptor::Repository { path, .. } => path,
        }
    }
}

/// A collected page or file, ready for chunking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawUnit {
    pub locator: UnitLocator,
    pub title: String,
    pub content: String,
    /// Word count reported by the collector; recomputed when absent.
    pub word_count: Option<u64>,
}

/// Per-kind statistics of an indexed source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SourceDetails {
    Documentation { url: String, pages: u64, words: u64 },
    Repository { path: String, files: u64, lines: u64 },
}

/// One manifest row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Source {
    pub name: String,
    #[serde(flatten)]
    pub details: SourceDetails,
    pub chunks: u64,
    pub indexed_at: DateTime<Utc>,
}

impl Source {
    /// Build a manifest row from per-kind totals.
    pub fn new(
        name: impl Into<String>,
        kind: SourceKind,
        origin: impl Into<String>,
        units: u64,
        volume: u64,
        chunks: u64,
        indexed_at: DateTime<Utc>,
    ) -> Self {
        let origin = origin.into();
        let details = match kind {
            SourceKind::Documentation => SourceDetails::Documentation {
                url: origin,
                pages: units,
                words: volume,
            },
            SourceKind::Repository => SourceDetails::Repository {
                path: origin,
                files: units,
                lines: volume,
            },
        };
        Self {
            name: name.into(),
            details,
            chunks,
            indexed_at,
        }
    }

    pub fn kind(&self) -> SourceKind {
        match self.details {
            SourceDetails::Documentation { .. } => SourceKind::Documentation,
            SourceDetails::Repository { .. } => SourceKind::Repository,
        }
    }

    pub fn origin(&self) -> &str {
        match &self.details {
            SourceDetails::Documentation { url, .. } => url,
            SourceDetails::Repository { path, .. } => path,
        }
    }

    /// Pages for documentation, files for repositories.
    pub fn unit_count(&self) -> u64 {
        match self.details {
            SourceDetails::Documentation { pages, .. } => pages,
            SourceDetails::Repository { files, .. } => files,
        }
    }

    /// Words for documentation, lines for repositories.
    pub fn volume(&self) -> u64 {
        match self.details {
            SourceDetails::Documentation { words, .. } => words,
            SourceDetails::Repository { lines, .. } => lines,
        }
    }
}

/// A page or file belonging to an indexed source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Unit {
    pub index: u64,
    pub locator: UnitLocator,
    pub title: String,
    pub word_count: u64,
    pub line_count: u64,
}

/// A stored chunk with its embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkRecord {
    /// Deterministic UUID derived from source name, unit locator and chunk index.
    pub id: String,
    pub source_name: String,
    /// Back-reference to [`Unit::index`] within the same source.
    pub unit_index: u64,
    pub chunk_index: u64,
    pub content: String,
    pub word_count: u64,
    /// SHA-256 of `content`, used to collapse duplicate text in results.
    pub hash: String,
    pub embedding: Vec<f32>,
}

/// The embedding model an index (or a staged source) was built with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbeddingStamp {
    pub model: String,
    pub dims: usize,
}

impl std::fmt::Display for EmbeddingStamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({} dims)", self.model, self.dims)
    }
}

/// Index-wide metadata persisted next to the sources.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IndexMeta {
    pub embedding: Option<EmbeddingStamp>,
    pub chunk_size: Option<usize>,
    pub chunk_overlap: Option<usize>,
    pub last_updated: Option<DateTime<Utc>>,
}

/// Summary of the whole index. Totals are always derived from `sources`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub total_sources: u64,
    pub total_pages: u64,
    pub total_chunks: u64,
    pub total_words: u64,
    pub total_lines: u64,
    pub embedding_model: Option<String>,
    pub embedding_dims: Option<usize>,
    pub chunk_size: Option<usize>,
    pub chunk_overlap: Option<usize>,
    #[serde(rename = "indexedAt")]
    pub last_updated: Option<DateTime<Utc>>,
    pub sources: Vec<Source>,
}

impl Manifest {
    /// Aggregate a manifest from the live source rows, sorted by name.
    pub fn from_sources(meta: &IndexMeta, mut sources: Vec<Source>) -> Self {
        sources.sort_by(|a, b| a.name.cmp(&b.name));

        let mut total_words = 0;
        let mut total_lines = 0;
        for s in &sources {
            match s.details {
                SourceDetails::Documentation { words, .. } => total_words += words,
                SourceDetails::Repository { lines, .. } => total_lines += lines,
            }
        }

        Self {
            total_sources: sources.len() as u64,
            total_pages: sources.iter().map(Source::unit_count).sum(),
            total_chunks: sources.iter().map(|s| s.chunks).sum(),
            total_words,
            total_lines,
            embedding_model: meta.embedding.as_ref().map(|e| e.model.clone()),
            embedding_dims: meta.embedding.as_ref().map(|e| e.dims),
            chunk_size: meta.chunk_size,
            chunk_overlap: meta.chunk_overlap,
            last_updated: meta.last_updated,
            sources,
        }
    }

    pub fn source(&self, name: &str) -> Option<&Source> {
        self.sources.iter().find(|s| s.name == name)
    }
}

/// One page or file of a source, with its chunks, for browsing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitPage {
    pub title: String,
    #[serde(flatten)]
    pub locator: UnitLocator,
    pub chunk_count: u64,
    pub total_words: u64,
    pub total_lines: u64,
    pub chunks: Vec<ChunkSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkSummary {
    pub id: String,
    pub chunk_index: u64,
    pub content: String,
    pub word_count: u64,
}

/// Outcome of indexing one source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexResult {
    pub source_name: String,
    pub kind: SourceKind,
    pub chunks_created: u64,
    pub total_units: u64,
    pub total_words: u64,
    pub total_lines: u64,
    pub tokens_used: u64,
    pub estimated_cost: f64,
    /// Chunks of a previous version of the source that were replaced.
    pub replaced_chunks: u64,
}
