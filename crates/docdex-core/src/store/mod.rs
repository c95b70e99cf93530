//! Storage abstraction for the docdex index.
//!
//! The [`IndexStore`] trait covers every read and write the indexer,
//! lifecycle manager and search engine need. Writes are per source and
//! atomic: [`IndexStore::upsert_chunks`] replaces everything stored under
//! a source name (chunks, units, manifest row) in one commit, and
//! [`IndexStore::delete_source`] removes it in one commit. Readers never
//! observe a partially written source.
//!
//! Implementations must be `Send + Sync` to be shared across tasks.

pub mod memory;

use std::collections::HashSet;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

use crate::chunk::ChunkConfig;
use crate::error::IndexError;
use crate::models::{
    validate_source_name, ChunkRecord, EmbeddingStamp, IndexMeta, Manifest, Source, Unit,
    UnitLocator, UnitPage,
};

/// A fully prepared source, ready to be committed in one step.
#[derive(Debug, Clone)]
pub struct StagedSource {
    pub source: Source,
    pub units: Vec<Unit>,
    pub chunks: Vec<ChunkRecord>,
    pub embedding: EmbeddingStamp,
    pub chunking: ChunkConfig,
}

impl StagedSource {
    /// Check internal consistency before anything is written.
    pub fn validate(&self) -> Result<()> {
        let name = &self.source.name;
        validate_source_name(name)?;
        if self.source.chunks != self.chunks.len() as u64 {
            return Err(IndexError::Validation(format!(
                "source '{}' claims {} chunks but {} were staged",
                name,
                self.source.chunks,
                self.chunks.len()
            ))
            .into());
        }
        if self.source.unit_count() != self.units.len() as u64 {
            return Err(IndexError::Validation(format!(
                "source '{}' claims {} units but {} were staged",
                name,
                self.source.unit_count(),
                self.units.len()
            ))
            .into());
        }

        let unit_indices: HashSet<u64> = self.units.iter().map(|u| u.index).collect();
        let mut ids = HashSet::with_capacity(self.chunks.len());
        for c in &self.chunks {
            if c.source_name != *name {
                return Err(IndexError::Validation(format!(
                    "chunk {} belongs to '{}', not '{}'",
                    c.id, c.source_name, name
                ))
                .into());
            }
            if !unit_indices.contains(&c.unit_index) {
                return Err(IndexError::Validation(format!(
                    "chunk {} references missing unit {}",
                    c.id, c.unit_index
                ))
                .into());
            }
            if c.embedding.len() != self.embedding.dims {
                return Err(IndexError::ModelMismatch {
                    expected: self.embedding.to_string(),
                    found: format!("a {}-dim vector for chunk {}", c.embedding.len(), c.id),
                }
                .into());
            }
            if !ids.insert(c.id.as_str()) {
                return Err(
                    IndexError::Validation(format!("duplicate chunk id {}", c.id)).into(),
                );
            }
        }
        Ok(())
    }
}

/// Reject a staged model that differs from the one the index holds,
/// unless no other source still depends on it.
pub fn check_embedding_compat(
    existing: Option<&EmbeddingStamp>,
    staged: &EmbeddingStamp,
    other_chunks: u64,
) -> Result<()> {
    match existing {
        Some(current) if current != staged && other_chunks > 0 => Err(IndexError::ModelMismatch {
            expected: current.to_string(),
            found: staged.to_string(),
        }
        .into()),
        _ => Ok(()),
    }
}

/// Reject a chunk size or overlap that differs from the one recorded for
/// the index while other sources still hold chunks built with it.
pub fn check_chunking_compat(
    meta: &IndexMeta,
    staged: &ChunkConfig,
    other_chunks: u64,
) -> Result<()> {
    match (meta.chunk_size, meta.chunk_overlap) {
        (Some(size), Some(overlap))
            if (size, overlap) != (staged.chunk_size, staged.chunk_overlap) && other_chunks > 0 =>
        {
            Err(IndexError::ChunkingMismatch {
                expected: format!("chunk_size={} chunk_overlap={}", size, overlap),
                found: format!(
                    "chunk_size={} chunk_overlap={}",
                    staged.chunk_size, staged.chunk_overlap
                ),
            }
            .into())
        }
        _ => Ok(()),
    }
}

/// A scored chunk returned by [`IndexStore::query`].
///
/// Carries enough to build a search result without another round trip.
#[derive(Debug, Clone)]
pub struct ChunkCandidate {
    pub chunk_id: String,
    pub source_name: String,
    pub title: String,
    pub locator: UnitLocator,
    pub content: String,
    pub word_count: u64,
    pub hash: String,
    /// Cosine similarity against the query vector.
    pub similarity: f32,
}

/// Sort candidates by similarity descending, then chunk id ascending.
pub fn rank_candidates(candidates: &mut [ChunkCandidate]) {
    candidates.sort_by(|a, b| {
        b.similarity
            .total_cmp(&a.similarity)
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
}

/// What [`IndexStore::reconcile`] repaired.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    pub orphan_chunks_removed: u64,
    pub orphan_units_removed: u64,
    /// Sources whose manifest counts were recomputed.
    pub sources_corrected: Vec<String>,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.orphan_chunks_removed == 0
            && self.orphan_units_removed == 0
            && self.sources_corrected.is_empty()
    }
}

#[async_trait]
pub trait IndexStore: Send + Sync {
    /// Atomically replace everything stored under the staged source's
    /// name. Returns the number of chunks of the previous version that
    /// were replaced (0 for a new source).
    async fn upsert_chunks(&self, staged: &StagedSource) -> Result<u64>;

    /// Atomically remove a source. Returns the number of chunks removed;
    /// fails with [`IndexError::NotFound`] for an unknown name.
    async fn delete_source(&self, name: &str) -> Result<u64>;

    async fn get_source(&self, name: &str) -> Result<Option<Source>>;

    /// Snapshot of every live source with derived totals.
    async fn manifest(&self) -> Result<Manifest>;

    /// Units of a source in index order, each with its chunks.
    async fn list_source_pages(&self, name: &str) -> Result<Vec<UnitPage>>;

    /// The `k` chunks most similar to `vector`, optionally restricted to
    /// one source. The filter is applied before ranking, and the result
    /// is ordered by [`rank_candidates`].
    async fn query(
        &self,
        vector: &[f32],
        k: usize,
        source_filter: Option<&str>,
    ) -> Result<Vec<ChunkCandidate>>;

    /// Remove orphaned rows and recompute manifest counts.
    async fn reconcile(&self) -> Result<ReconcileReport>;

    /// Fail with [`IndexError::StoreCorruption`] if manifest and chunk
    /// data disagree. Read-only.
    async fn verify(&self) -> Result<()>;

    /// Release resources. Further calls may fail.
    async fn close(&self) {}
}

/// Fail with [`IndexError::ModelMismatch`] when a query vector does not
/// match the index dimensionality.
pub fn check_query_dims(existing: Option<&EmbeddingStamp>, vector: &[f32]) -> Result<()> {
    match existing {
        Some(stamp) if stamp.dims != vector.len() => Err(IndexError::ModelMismatch {
            expected: stamp.to_string(),
            found: format!("a {}-dim query vector", vector.len()),
        }
        .into()),
        _ => Ok(()),
    }
}
