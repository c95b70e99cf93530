//! In-memory [`IndexStore`] for tests and embedded use.
//!
//! State lives in an immutable [`Snapshot`] behind `RwLock<Arc<_>>`.
//! Readers clone the `Arc` and work on a consistent view without holding
//! the lock; writers (serialized by a mutex) build the next snapshot and
//! swap it in, so a write becomes visible all at once or not at all.
//! Vector search is brute-force cosine similarity.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;

use crate::embedding::cosine_similarity;
use crate::error::IndexError;
use crate::models::{
    ChunkRecord, ChunkSummary, IndexMeta, Manifest, Source, SourceKind, Unit, UnitPage,
};

use super::{
    check_chunking_compat, check_embedding_compat, check_query_dims, rank_candidates,
    ChunkCandidate, IndexStore, ReconcileReport, StagedSource,
};

#[derive(Clone, Default)]
struct Snapshot {
    meta: IndexMeta,
    sources: BTreeMap<String, Source>,
    units: BTreeMap<String, Arc<[Unit]>>,
    chunks: BTreeMap<String, Arc<[ChunkRecord]>>,
}

impl Snapshot {
    fn chunks_outside(&self, name: &str) -> u64 {
        self.chunks
            .iter()
            .filter(|(source, _)| source.as_str() != name)
            .map(|(_, c)| c.len() as u64)
            .sum()
    }
}

pub struct InMemoryStore {
    current: RwLock<Arc<Snapshot>>,
    writer: Mutex<()>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(Arc::new(Snapshot::default())),
            writer: Mutex::new(()),
        }
    }

    fn snapshot(&self) -> Result<Arc<Snapshot>> {
        self.current
            .read()
            .map(|s| Arc::clone(&*s))
            .map_err(|_| anyhow!("in-memory store lock poisoned"))
    }

    /// Apply `f` to a copy of the current snapshot and publish it if `f`
    /// succeeds. On error nothing changes.
    fn commit<T>(&self, f: impl FnOnce(&mut Snapshot) -> Result<T>) -> Result<T> {
        let _writer = self
            .writer
            .lock()
            .map_err(|_| anyhow!("in-memory store lock poisoned"))?;
        let mut next = (*self.snapshot()?).clone();
        let out = f(&mut next)?;
        let mut current = self
            .current
            .write()
            .map_err(|_| anyhow!("in-memory store lock poisoned"))?;
        *current = Arc::new(next);
        Ok(out)
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// A copy of `source` with counts recomputed from its stored rows.
fn recount(source: &Source, units: &[Unit], chunks: &[ChunkRecord]) -> Source {
    let volume = match source.kind() {
        SourceKind::Documentation => units.iter().map(|u| u.word_count).sum(),
        SourceKind::Repository => units.iter().map(|u| u.line_count).sum(),
    };
    Source::new(
        source.name.clone(),
        source.kind(),
        source.origin(),
        units.len() as u64,
        volume,
        chunks.len() as u64,
        source.indexed_at,
    )
}

fn problems(snap: &Snapshot) -> Vec<String> {
    let mut found = Vec::new();
    for name in snap.chunks.keys().chain(snap.units.keys()) {
        if !snap.sources.contains_key(name) {
            found.push(format!("rows stored for unknown source '{}'", name));
        }
    }
    for (name, source) in &snap.sources {
        let units = snap.units.get(name).map(|u| &u[..]).unwrap_or(&[]);
        let chunks = snap.chunks.get(name).map(|c| &c[..]).unwrap_or(&[]);
        if recount(source, units, chunks) != *source {
            found.push(format!("manifest counts for '{}' are stale", name));
        }
    }
    found.dedup();
    found
}

#[async_trait]
impl IndexStore for InMemoryStore {
    async fn upsert_chunks(&self, staged: &StagedSource) -> Result<u64> {
        staged.validate()?;
        let name = staged.source.name.clone();
        self.commit(|snap| {
            let others = snap.chunks_outside(&name);
            check_embedding_compat(snap.meta.embedding.as_ref(), &staged.embedding, others)?;
            check_chunking_compat(&snap.meta, &staged.chunking, others)?;
            let replaced = snap.chunks.get(&name).map(|c| c.len() as u64).unwrap_or(0);

            snap.chunks
                .insert(name.clone(), Arc::from(staged.chunks.clone()));
            snap.units.insert(name.clone(), Arc::from(staged.units.clone()));
            snap.sources.insert(name, staged.source.clone());
            snap.meta.embedding = Some(staged.embedding.clone());
            snap.meta.chunk_size = Some(staged.chunking.chunk_size);
            snap.meta.chunk_overlap = Some(staged.chunking.chunk_overlap);
            snap.meta.last_updated = Some(Utc::now());
            Ok(replaced)
        })
    }

    async fn delete_source(&self, name: &str) -> Result<u64> {
        self.commit(|snap| {
            if snap.sources.remove(name).is_none() {
                return Err(IndexError::NotFound(name.to_string()).into());
            }
            snap.units.remove(name);
            let removed = snap.chunks.remove(name).map(|c| c.len() as u64).unwrap_or(0);
            snap.meta.last_updated = Some(Utc::now());
            Ok(removed)
        })
    }

    async fn get_source(&self, name: &str) -> Result<Option<Source>> {
        Ok(self.snapshot()?.sources.get(name).cloned())
    }

    async fn manifest(&self) -> Result<Manifest> {
        let snap = self.snapshot()?;
        Ok(Manifest::from_sources(
            &snap.meta,
            snap.sources.values().cloned().collect(),
        ))
    }

    async fn list_source_pages(&self, name: &str) -> Result<Vec<UnitPage>> {
        let snap = self.snapshot()?;
        if !snap.sources.contains_key(name) {
            return Err(IndexError::NotFound(name.to_string()).into());
        }

        let mut by_unit: HashMap<u64, Vec<ChunkSummary>> = HashMap::new();
        if let Some(chunks) = snap.chunks.get(name) {
            for c in chunks.iter() {
                by_unit.entry(c.unit_index).or_default().push(ChunkSummary {
                    id: c.id.clone(),
                    chunk_index: c.chunk_index,
                    content: c.content.clone(),
                    word_count: c.word_count,
                });
            }
        }

        let mut units: Vec<&Unit> = snap
            .units
            .get(name)
            .map(|u| u.iter().collect())
            .unwrap_or_default();
        units.sort_by_key(|u| u.index);

        Ok(units
            .into_iter()
            .map(|u| {
                let mut chunks = by_unit.remove(&u.index).unwrap_or_default();
                chunks.sort_by_key(|c| c.chunk_index);
                UnitPage {
                    title: u.title.clone(),
                    locator: u.locator.clone(),
                    chunk_count: chunks.len() as u64,
                    total_words: u.word_count,
                    total_lines: u.line_count,
                    chunks,
                }
            })
            .collect())
    }

    async fn query(
        &self,
        vector: &[f32],
        k: usize,
        source_filter: Option<&str>,
    ) -> Result<Vec<ChunkCandidate>> {
        let snap = self.snapshot()?;
        if snap.chunks.values().any(|c| !c.is_empty()) {
            check_query_dims(snap.meta.embedding.as_ref(), vector)?;
        }

        let mut candidates = Vec::new();
        for (name, chunks) in &snap.chunks {
            if source_filter.is_some_and(|f| f != name.as_str()) {
                continue;
            }
            if !snap.sources.contains_key(name) {
                return Err(IndexError::StoreCorruption(format!(
                    "chunks stored for source '{}' which has no manifest entry",
                    name
                ))
                .into());
            }
            let units: HashMap<u64, &Unit> = snap
                .units
                .get(name)
                .map(|u| u.iter().map(|u| (u.index, u)).collect())
                .unwrap_or_default();

            for c in chunks.iter() {
                let unit = units.get(&c.unit_index).ok_or_else(|| {
                    IndexError::StoreCorruption(format!(
                        "chunk {} references missing unit {} of '{}'",
                        c.id, c.unit_index, name
                    ))
                })?;
                candidates.push(ChunkCandidate {
                    chunk_id: c.id.clone(),
                    source_name: name.clone(),
                    title: unit.title.clone(),
                    locator: unit.locator.clone(),
                    content: c.content.clone(),
                    word_count: c.word_count,
                    hash: c.hash.clone(),
                    similarity: cosine_similarity(vector, &c.embedding),
                });
            }
        }

        rank_candidates(&mut candidates);
        candidates.truncate(k);
        Ok(candidates)
    }

    async fn reconcile(&self) -> Result<ReconcileReport> {
        self.commit(|snap| {
            let mut report = ReconcileReport::default();

            let sources = &snap.sources;
            snap.chunks.retain(|name, chunks| {
                let keep = sources.contains_key(name);
                if !keep {
                    report.orphan_chunks_removed += chunks.len() as u64;
                }
                keep
            });
            snap.units.retain(|name, units| {
                let keep = sources.contains_key(name);
                if !keep {
                    report.orphan_units_removed += units.len() as u64;
                }
                keep
            });

            for (name, source) in snap.sources.iter_mut() {
                let units = snap.units.get(name).map(|u| &u[..]).unwrap_or(&[]);
                let chunks = snap.chunks.get(name).map(|c| &c[..]).unwrap_or(&[]);
                let fixed = recount(source, units, chunks);
                if fixed != *source {
                    *source = fixed;
                    report.sources_corrected.push(name.clone());
                }
            }

            if !report.is_clean() {
                snap.meta.last_updated = Some(Utc::now());
            }
            Ok(report)
        })
    }

    async fn verify(&self) -> Result<()> {
        let found = problems(&*self.snapshot()?);
        if found.is_empty() {
            Ok(())
        } else {
            Err(IndexError::StoreCorruption(found.join("; ")).into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{chunk_id, content_hash, ChunkConfig};
    use crate::error::classify;
    use crate::models::{EmbeddingStamp, UnitLocator};

    fn staged(name: &str, model: &str, vectors: &[[f32; 2]]) -> StagedSource {
        let locator = UnitLocator::Url(format!("https://{}.dev/", name));
        let units = vec![Unit {
            index: 0,
            locator: locator.clone(),
            title: format!("{} home", name),
            word_count: 10,
            line_count: 1,
        }];
        let chunks: Vec<ChunkRecord> = vectors
            .iter()
            .enumerate()
            .map(|(i, v)| {
                let content = format!("{} chunk {}", name, i);
                ChunkRecord {
                    id: chunk_id(name, &locator, i),
                    source_name: name.into(),
                    unit_index: 0,
                    chunk_index: i as u64,
                    hash: content_hash(&content),
                    content,
                    word_count: 3,
                    embedding: v.to_vec(),
                }
            })
            .collect();
        StagedSource {
            source: Source::new(
                name,
                SourceKind::Documentation,
                locator.as_str(),
                1,
                10,
                chunks.len() as u64,
                Utc::now(),
            ),
            units,
            chunks,
            embedding: EmbeddingStamp {
                model: model.into(),
                dims: 2,
            },
            chunking: ChunkConfig::default(),
        }
    }

    #[tokio::test]
    async fn test_upsert_replaces_previous_version() {
        let store = InMemoryStore::new();
        assert_eq!(
            store
                .upsert_chunks(&staged("react", "m", &[[1.0, 0.0], [0.0, 1.0], [1.0, 1.0]]))
                .await
                .unwrap(),
            0
        );
        let replaced = store
            .upsert_chunks(&staged("react", "m", &[[1.0, 0.0]]))
            .await
            .unwrap();
        assert_eq!(replaced, 3);

        let m = store.manifest().await.unwrap();
        assert_eq!(m.total_chunks, 1);
        assert_eq!(m.total_sources, 1);
        assert_eq!(m.embedding_model.as_deref(), Some("m"));
    }

    #[tokio::test]
    async fn test_delete_unknown_source() {
        let store = InMemoryStore::new();
        let err = store.delete_source("ghost").await.unwrap_err();
        assert!(matches!(classify(&err), Some(IndexError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_delete_returns_chunk_count() {
        let store = InMemoryStore::new();
        store
            .upsert_chunks(&staged("react", "m", &[[1.0, 0.0], [0.0, 1.0]]))
            .await
            .unwrap();
        store
            .upsert_chunks(&staged("vue", "m", &[[1.0, 0.0]]))
            .await
            .unwrap();
        assert_eq!(store.delete_source("react").await.unwrap(), 2);

        let m = store.manifest().await.unwrap();
        assert_eq!(m.total_sources, 1);
        assert_eq!(m.total_chunks, 1);
        assert!(store.get_source("react").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_query_filter_and_order() {
        let store = InMemoryStore::new();
        store
            .upsert_chunks(&staged("react", "m", &[[1.0, 0.0], [0.6, 0.8]]))
            .await
            .unwrap();
        store
            .upsert_chunks(&staged("vue", "m", &[[1.0, 0.05]]))
            .await
            .unwrap();

        let all = store.query(&[1.0, 0.0], 10, None).await.unwrap();
        assert_eq!(all.len(), 3);
        assert!(all.windows(2).all(|w| w[0].similarity >= w[1].similarity));

        let only_vue = store.query(&[0.0, 1.0], 10, Some("vue")).await.unwrap();
        assert_eq!(only_vue.len(), 1);
        assert_eq!(only_vue[0].source_name, "vue");

        let top = store.query(&[1.0, 0.0], 1, None).await.unwrap();
        assert_eq!(top.len(), 1);
    }

    #[tokio::test]
    async fn test_model_mismatch_rejected_when_other_sources_exist() {
        let store = InMemoryStore::new();
        store
            .upsert_chunks(&staged("react", "m1", &[[1.0, 0.0]]))
            .await
            .unwrap();
        let err = store
            .upsert_chunks(&staged("vue", "m2", &[[1.0, 0.0]]))
            .await
            .unwrap_err();
        assert!(matches!(classify(&err), Some(IndexError::ModelMismatch { .. })));

        // Replacing the only source may switch models.
        store
            .upsert_chunks(&staged("react", "m2", &[[1.0, 0.0]]))
            .await
            .unwrap();
        let m = store.manifest().await.unwrap();
        assert_eq!(m.embedding_model.as_deref(), Some("m2"));
    }

    #[tokio::test]
    async fn test_failed_upsert_leaves_store_unchanged() {
        let store = InMemoryStore::new();
        store
            .upsert_chunks(&staged("react", "m", &[[1.0, 0.0]]))
            .await
            .unwrap();
        let mut bad = staged("react", "m", &[[1.0, 0.0], [0.0, 1.0]]);
        bad.chunks[1].embedding = vec![1.0, 2.0, 3.0];
        assert!(store.upsert_chunks(&bad).await.is_err());

        let m = store.manifest().await.unwrap();
        assert_eq!(m.total_chunks, 1);
    }

    #[tokio::test]
    async fn test_pages_grouped_by_unit() {
        let store = InMemoryStore::new();
        store
            .upsert_chunks(&staged("react", "m", &[[1.0, 0.0], [0.0, 1.0]]))
            .await
            .unwrap();
        let pages = store.list_source_pages("react").await.unwrap();
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].chunk_count, 2);
        assert_eq!(pages[0].chunks[1].chunk_index, 1);

        let err = store.list_source_pages("vue").await.unwrap_err();
        assert!(matches!(classify(&err), Some(IndexError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_reconcile_clean_store() {
        let store = InMemoryStore::new();
        store
            .upsert_chunks(&staged("react", "m", &[[1.0, 0.0]]))
            .await
            .unwrap();
        store.verify().await.unwrap();
        let report = store.reconcile().await.unwrap();
        assert!(report.is_clean());
    }

    #[tokio::test]
    async fn test_query_dimension_mismatch() {
        let store = InMemoryStore::new();
        store
            .upsert_chunks(&staged("react", "m", &[[1.0, 0.0]]))
            .await
            .unwrap();
        let err = store.query(&[1.0, 0.0, 0.0], 5, None).await.unwrap_err();
        assert!(matches!(classify(&err), Some(IndexError::ModelMismatch { .. })));
    }
}
