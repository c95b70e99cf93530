//! Source indexing pipeline.
//!
//! Turns collected units into a [`StagedSource`]:
//!
//! ```text
//! RawUnit[] ─► dedupe ─► chunk_text() ─► Embedder::embed_all() ─► StagedSource
//! ```
//!
//! Nothing is written here. The caller commits the staged source through
//! [`IndexStore::upsert_chunks`](docdex_core::store::IndexStore::upsert_chunks)
//! so a failure at any stage leaves the store untouched.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use docdex_core::chunk::{chunk_id, chunk_text, content_hash, count_lines, count_words, ChunkConfig};
use docdex_core::embedding::estimate_cost;
use docdex_core::error::classify;
use docdex_core::models::{
    validate_source_name, ChunkRecord, IndexResult, RawUnit, Source, SourceDescriptor, SourceKind,
    Unit,
};
use docdex_core::store::StagedSource;
use docdex_core::{IndexError, IndexStage};

use crate::embedding::Embedder;
use crate::progress::{ProgressEvent, ProgressReporter};

/// Upper bound on chunk-stage progress events per source.
const CHUNK_PROGRESS_STEPS: usize = 50;

/// A source ready to commit, with the stats reported to the caller.
#[derive(Debug, Clone)]
pub struct IndexedSource {
    pub staged: StagedSource,
    pub result: IndexResult,
}

pub struct SourceIndexer {
    embedder: Arc<Embedder>,
    chunking: ChunkConfig,
    price_per_1k_tokens: f64,
}

impl SourceIndexer {
    pub fn new(embedder: Arc<Embedder>, chunking: ChunkConfig, price_per_1k_tokens: f64) -> Self {
        Self {
            embedder,
            chunking,
            price_per_1k_tokens,
        }
    }

    pub fn embedder(&self) -> &Arc<Embedder> {
        &self.embedder
    }

    pub fn chunking(&self) -> ChunkConfig {
        self.chunking
    }

    /// Chunk and embed `units` for `descriptor`.
    ///
    /// Fails with `Validation` when there is nothing to index, `Cancelled`
    /// when `cancel` fires, and `Indexing { stage: embed }` when the
    /// provider gives up.
    pub async fn index(
        &self,
        descriptor: &SourceDescriptor,
        units: Vec<RawUnit>,
        progress: &dyn ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<IndexedSource> {
        let name = descriptor.name();
        let kind = descriptor.kind();
        validate_source_name(name)?;

        let units = dedupe_units(name, units);
        if units.is_empty() {
            return Err(IndexError::Validation(format!(
                "no {} to index for source '{}'",
                kind.unit_label(),
                name
            ))
            .into());
        }
        progress.report(ProgressEvent::progress(
            name,
            IndexStage::Collect,
            units.len() as u64,
            units.len() as u64,
        ));

        // Chunk
        let total = units.len();
        let step = total.div_ceil(CHUNK_PROGRESS_STEPS).max(1);
        let mut stored_units = Vec::with_capacity(total);
        let mut chunks = Vec::new();
        let mut texts = Vec::new();
        for (i, raw) in units.into_iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(IndexError::Cancelled.into());
            }
            let unit_index = i as u64;
            for piece in chunk_text(&raw.content, &self.chunking) {
                chunks.push(ChunkRecord {
                    id: chunk_id(name, &raw.locator, piece.index),
                    source_name: name.to_string(),
                    unit_index,
                    chunk_index: piece.index as u64,
                    hash: content_hash(&piece.text),
                    word_count: piece.word_count as u64,
                    content: String::new(),
                    embedding: Vec::new(),
                });
                texts.push(piece.text);
            }
            stored_units.push(Unit {
                index: unit_index,
                word_count: raw
                    .word_count
                    .unwrap_or_else(|| count_words(&raw.content) as u64),
                line_count: count_lines(&raw.content) as u64,
                locator: raw.locator,
                title: raw.title,
            });
            let done = i + 1;
            if done % step == 0 || done == total {
                progress.report(ProgressEvent::progress(
                    name,
                    IndexStage::Chunk,
                    done as u64,
                    total as u64,
                ));
            }
        }
        if chunks.is_empty() {
            return Err(IndexError::Validation(format!(
                "source '{}' has no text to index",
                name
            ))
            .into());
        }
        debug!(source = name, chunks = chunks.len(), "chunked source");

        // Embed
        let embedded = self
            .embedder
            .embed_all(&texts, cancel, |done, total| {
                progress.report(ProgressEvent::progress(
                    name,
                    IndexStage::Embed,
                    done as u64,
                    total as u64,
                ));
            })
            .await
            .map_err(embed_failure)?;
        if cancel.is_cancelled() {
            return Err(IndexError::Cancelled.into());
        }

        for ((chunk, text), vector) in chunks.iter_mut().zip(texts).zip(embedded.vectors) {
            chunk.content = text;
            chunk.embedding = vector;
        }

        let total_words: u64 = stored_units.iter().map(|u| u.word_count).sum();
        let total_lines: u64 = stored_units.iter().map(|u| u.line_count).sum();
        let volume = match kind {
            SourceKind::Documentation => total_words,
            SourceKind::Repository => total_lines,
        };
        let source = Source::new(
            name,
            kind,
            descriptor.origin(),
            stored_units.len() as u64,
            volume,
            chunks.len() as u64,
            Utc::now(),
        );
        let result = IndexResult {
            source_name: name.to_string(),
            kind,
            chunks_created: chunks.len() as u64,
            total_units: stored_units.len() as u64,
            total_words,
            total_lines,
            tokens_used: embedded.tokens_used,
            estimated_cost: estimate_cost(embedded.tokens_used, self.price_per_1k_tokens),
            replaced_chunks: 0,
        };
        info!(
            source = name,
            units = result.total_units,
            chunks = result.chunks_created,
            tokens = result.tokens_used,
            "prepared source"
        );

        Ok(IndexedSource {
            staged: StagedSource {
                source,
                units: stored_units,
                chunks,
                embedding: self.embedder.stamp(),
                chunking: self.chunking,
            },
            result,
        })
    }
}

/// Keep the first unit for each locator.
fn dedupe_units(source: &str, units: Vec<RawUnit>) -> Vec<RawUnit> {
    let mut seen = HashSet::with_capacity(units.len());
    units
        .into_iter()
        .filter(|u| {
            let fresh = seen.insert(u.locator.as_str().to_string());
            if !fresh {
                warn!(source, locator = u.locator.as_str(), "skipping duplicate unit");
            }
            fresh
        })
        .collect()
}

/// Provider failures that survive the retry budget become an indexing
/// failure at the embed stage. Cancellation and model mismatches pass
/// through unchanged.
fn embed_failure(err: anyhow::Error) -> anyhow::Error {
    match classify(&err) {
        Some(IndexError::TransientProvider(msg)) | Some(IndexError::Provider(msg)) => {
            IndexError::Indexing {
                stage: IndexStage::Embed,
                message: msg.clone(),
            }
            .into()
        }
        _ => IndexError::at_stage(IndexStage::Embed, err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EmbeddingConfig;
    use crate::progress::{EventKind, NoProgress};
    use async_trait::async_trait;
    use docdex_core::embedding::{EmbeddingBatch, EmbeddingProvider};
    use docdex_core::models::UnitLocator;
    use std::sync::Mutex;
    use std::time::Duration;

    struct Fixed {
        fail: bool,
    }

    #[async_trait]
    impl EmbeddingProvider for Fixed {
        fn model_name(&self) -> &str {
            "fixed"
        }
        fn dims(&self) -> usize {
            2
        }
        async fn embed_batch(&self, texts: &[String]) -> Result<EmbeddingBatch> {
            if self.fail {
                return Err(IndexError::Provider("401 unauthorized".into()).into());
            }
            Ok(EmbeddingBatch {
                vectors: texts.iter().map(|t| vec![t.len() as f32, 1.0]).collect(),
                tokens_used: 0,
            })
        }
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<ProgressEvent>>);

    impl ProgressReporter for Recorder {
        fn report(&self, event: ProgressEvent) {
            self.0.lock().unwrap().push(event);
        }
    }

    fn indexer(fail: bool, size: usize, overlap: usize) -> SourceIndexer {
        let config = EmbeddingConfig {
            batch_size: 4,
            max_retries: 0,
            ..Default::default()
        };
        let embedder = Embedder::new(Arc::new(Fixed { fail }), &config)
            .with_base_backoff(Duration::ZERO);
        SourceIndexer::new(
            Arc::new(embedder),
            ChunkConfig::new(size, overlap).unwrap(),
            0.02,
        )
    }

    fn words(n: usize) -> String {
        (0..n).map(|i| format!("w{}", i)).collect::<Vec<_>>().join(" ")
    }

    fn page(url: &str, n: usize) -> RawUnit {
        RawUnit {
            locator: UnitLocator::Url(url.into()),
            title: url.into(),
            content: words(n),
            word_count: None,
        }
    }

    fn docs(name: &str) -> SourceDescriptor {
        SourceDescriptor::Documentation {
            name: name.into(),
            url: "https://example.com".into(),
        }
    }

    #[tokio::test]
    async fn test_three_pages_chunk_arithmetic() {
        let idx = indexer(false, 200, 50);
        let units = vec![
            page("https://example.com/a", 500),
            page("https://example.com/b", 500),
            page("https://example.com/c", 500),
        ];
        let out = idx
            .index(&docs("example"), units, &NoProgress, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out.result.chunks_created, 9);
        assert_eq!(out.result.total_words, 1500);
        assert_eq!(out.staged.source.volume(), 1500);
        assert_eq!(out.staged.chunks.len(), 9);
        assert!(out.staged.chunks.iter().all(|c| c.embedding.len() == 2));
        out.staged.validate().unwrap();
    }

    #[tokio::test]
    async fn test_ids_are_stable() {
        let idx = indexer(false, 50, 10);
        let a = idx
            .index(&docs("s"), vec![page("u", 120)], &NoProgress, &CancellationToken::new())
            .await
            .unwrap();
        let b = idx
            .index(&docs("s"), vec![page("u", 120)], &NoProgress, &CancellationToken::new())
            .await
            .unwrap();
        let ids_a: Vec<_> = a.staged.chunks.iter().map(|c| c.id.clone()).collect();
        let ids_b: Vec<_> = b.staged.chunks.iter().map(|c| c.id.clone()).collect();
        assert_eq!(ids_a, ids_b);
    }

    #[tokio::test]
    async fn test_duplicate_locators_are_dropped() {
        let idx = indexer(false, 50, 10);
        let out = idx
            .index(
                &docs("s"),
                vec![page("u", 10), page("u", 30), page("v", 5)],
                &NoProgress,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(out.result.total_units, 2);
        assert_eq!(out.result.total_words, 15);
    }

    #[tokio::test]
    async fn test_empty_input_is_validation_error() {
        let idx = indexer(false, 50, 10);
        let err = idx
            .index(&docs("s"), vec![], &NoProgress, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(classify(&err), Some(IndexError::Validation(_))));

        let err = idx
            .index(&docs("s"), vec![page("u", 0)], &NoProgress, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(classify(&err), Some(IndexError::Validation(_))));
    }

    #[tokio::test]
    async fn test_provider_failure_reports_embed_stage() {
        let idx = indexer(true, 50, 10);
        let err = idx
            .index(&docs("s"), vec![page("u", 10)], &NoProgress, &CancellationToken::new())
            .await
            .unwrap_err();
        match classify(&err) {
            Some(IndexError::Indexing { stage, .. }) => assert_eq!(*stage, IndexStage::Embed),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    struct Stuck;

    #[async_trait]
    impl EmbeddingProvider for Stuck {
        fn model_name(&self) -> &str {
            "stuck"
        }
        fn dims(&self) -> usize {
            2
        }
        async fn embed_batch(&self, _texts: &[String]) -> Result<EmbeddingBatch> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_embedding_timeouts_fail_embed_stage() {
        let config = EmbeddingConfig {
            max_retries: 1,
            ..Default::default()
        };
        let embedder = Embedder::new(Arc::new(Stuck), &config)
            .with_base_backoff(Duration::ZERO)
            .with_timeout(Duration::from_millis(20));
        let idx = SourceIndexer::new(Arc::new(embedder), ChunkConfig::new(50, 10).unwrap(), 0.0);
        let err = idx
            .index(&docs("s"), vec![page("u", 10)], &NoProgress, &CancellationToken::new())
            .await
            .unwrap_err();
        match classify(&err) {
            Some(IndexError::Indexing { stage, message }) => {
                assert_eq!(*stage, IndexStage::Embed);
                assert!(message.contains("timed out"), "got: {}", message);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let idx = indexer(false, 50, 10);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = idx
            .index(&docs("s"), vec![page("u", 10)], &NoProgress, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(classify(&err), Some(IndexError::Cancelled)));
    }

    #[tokio::test]
    async fn test_repository_volume_is_lines() {
        let idx = indexer(false, 50, 10);
        let repo = SourceDescriptor::Repository {
            name: "repo".into(),
            path: "/tmp/repo".into(),
        };
        let unit = RawUnit {
            locator: UnitLocator::Path("src/lib.rs".into()),
            title: "src/lib.rs".into(),
            content: "fn a() {}\nfn b() {}\nfn c() {}".into(),
            word_count: None,
        };
        let recorder = Recorder::default();
        let out = idx
            .index(&repo, vec![unit], &recorder, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out.result.total_lines, 3);
        assert_eq!(out.staged.source.volume(), 3);
        assert!(out.result.estimated_cost > 0.0);

        let events = recorder.0.lock().unwrap();
        assert!(events.iter().all(|e| e.kind == EventKind::Progress));
        assert!(events.iter().any(|e| e.stage == Some(IndexStage::Embed)));
    }
}
