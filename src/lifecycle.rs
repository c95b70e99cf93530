//! Source lifecycle: the only code path that mutates the index.
//!
//! Every add and remove goes through [`SourceManager`], which enforces:
//!
//! - at most one mutation in flight per source name (a second attempt
//!   fails fast with `Busy`);
//! - no silent overwrite (adding an existing name without `replace` is a
//!   `Conflict`);
//! - a single writer for the commit step across all sources.
//!
//! Collecting, chunking and embedding for different names run
//! concurrently. Only the final commit is serialized, and readers keep
//! using the store the whole time.

use std::collections::HashSet;
use std::future::Future;
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use docdex_core::models::{validate_source_name, IndexResult, RawUnit, SourceDescriptor};
use docdex_core::store::{IndexStore, ReconcileReport};
use docdex_core::{IndexError, IndexStage};

use crate::config::RepositoryConfig;
use crate::crawl::{default_source_name, CrawlOutput};
use crate::indexer::SourceIndexer;
use crate::progress::{ProgressEvent, ProgressReporter};
use crate::repo_scan::scan_repository;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AddOptions {
    /// Re-index a source that already exists instead of failing.
    pub replace: bool,
}

pub struct SourceManager {
    store: Arc<dyn IndexStore>,
    indexer: SourceIndexer,
    repository: RepositoryConfig,
    in_flight: Mutex<HashSet<String>>,
    commit_lock: AsyncMutex<()>,
}

/// Releases a claimed source name when dropped.
struct NameClaim<'a> {
    in_flight: &'a Mutex<HashSet<String>>,
    name: String,
}

impl Drop for NameClaim<'_> {
    fn drop(&mut self) {
        if let Ok(mut names) = self.in_flight.lock() {
            names.remove(&self.name);
        }
    }
}

impl SourceManager {
    pub fn new(
        store: Arc<dyn IndexStore>,
        indexer: SourceIndexer,
        repository: RepositoryConfig,
    ) -> Self {
        Self {
            store,
            indexer,
            repository,
            in_flight: Mutex::new(HashSet::new()),
            commit_lock: AsyncMutex::new(()),
        }
    }

    pub fn store(&self) -> &Arc<dyn IndexStore> {
        &self.store
    }

    pub fn indexer(&self) -> &SourceIndexer {
        &self.indexer
    }

    fn claim(&self, name: &str) -> Result<NameClaim<'_>> {
        let mut names = self
            .in_flight
            .lock()
            .map_err(|_| anyhow!("source lock poisoned"))?;
        if !names.insert(name.to_string()) {
            return Err(IndexError::Busy(name.to_string()).into());
        }
        Ok(NameClaim {
            in_flight: &self.in_flight,
            name: name.to_string(),
        })
    }

    /// Index already collected units as `descriptor`.
    pub async fn add_source(
        &self,
        descriptor: &SourceDescriptor,
        units: Vec<RawUnit>,
        options: AddOptions,
        progress: &dyn ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<IndexResult> {
        self.add_with(descriptor, options, progress, cancel, async move { Ok(units) })
            .await
    }

    /// Scan a local repository and index it under `name`.
    pub async fn add_repository(
        &self,
        name: &str,
        path: &Path,
        options: AddOptions,
        progress: &dyn ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<IndexResult> {
        let descriptor = SourceDescriptor::Repository {
            name: name.to_string(),
            path: path.display().to_string(),
        };
        let root = path.to_path_buf();
        let config = self.repository.clone();
        let collect = async move {
            tokio::task::spawn_blocking(move || scan_repository(&root, &config))
                .await
                .map_err(|e| anyhow!("repository scan task failed: {}", e))?
        };
        self.add_with(&descriptor, options, progress, cancel, collect)
            .await
    }

    /// Index a crawl. The source name defaults to the crawl URL's host.
    pub async fn add_documentation(
        &self,
        crawl: CrawlOutput,
        name: Option<&str>,
        max_pages: Option<usize>,
        options: AddOptions,
        progress: &dyn ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<IndexResult> {
        let name = match name {
            Some(name) => name.to_string(),
            None => default_source_name(&crawl.source)?,
        };
        let descriptor = SourceDescriptor::Documentation {
            name,
            url: crawl.source.clone(),
        };
        let units = crawl.into_units(max_pages);
        self.add_source(&descriptor, units, options, progress, cancel)
            .await
    }

    async fn add_with<F>(
        &self,
        descriptor: &SourceDescriptor,
        options: AddOptions,
        progress: &dyn ProgressReporter,
        cancel: &CancellationToken,
        collect: F,
    ) -> Result<IndexResult>
    where
        F: Future<Output = Result<Vec<RawUnit>>> + Send,
    {
        let name = descriptor.name();
        let outcome = self
            .run_add(descriptor, options, progress, cancel, collect)
            .await;
        match &outcome {
            Ok(result) => progress.report(ProgressEvent::complete(result.clone())),
            Err(e) => {
                warn!(source = name, error = %format!("{:#}", e), "add failed");
                progress.report(ProgressEvent::error(name, e));
            }
        }
        outcome
    }

    async fn run_add<F>(
        &self,
        descriptor: &SourceDescriptor,
        options: AddOptions,
        progress: &dyn ProgressReporter,
        cancel: &CancellationToken,
        collect: F,
    ) -> Result<IndexResult>
    where
        F: Future<Output = Result<Vec<RawUnit>>> + Send,
    {
        let name = descriptor.name();
        validate_source_name(name)?;
        let _claim = self.claim(name)?;

        if !options.replace && self.store.get_source(name).await?.is_some() {
            return Err(IndexError::Conflict(name.to_string()).into());
        }

        progress.report(ProgressEvent::start(
            name,
            format!(
                "indexing {} from {}",
                descriptor.kind().as_str(),
                descriptor.origin()
            ),
        ));

        let units = collect
            .await
            .map_err(|e| IndexError::at_stage(IndexStage::Collect, e))?;
        let indexed = self.indexer.index(descriptor, units, progress, cancel).await?;
        if cancel.is_cancelled() {
            return Err(IndexError::Cancelled.into());
        }

        progress.report(ProgressEvent::progress(name, IndexStage::Store, 0, 1));
        let replaced = {
            let _writer = self.commit_lock.lock().await;
            self.store
                .upsert_chunks(&indexed.staged)
                .await
                .map_err(|e| IndexError::at_stage(IndexStage::Store, e))?
        };

        let mut result = indexed.result;
        result.replaced_chunks = replaced;
        info!(
            source = name,
            chunks = result.chunks_created,
            replaced = replaced,
            "source indexed"
        );
        Ok(result)
    }

    /// Remove a source. Returns the number of chunks removed.
    pub async fn remove_source(&self, name: &str) -> Result<u64> {
        if name.trim().is_empty() {
            return Err(IndexError::Validation("sourceName is required".into()).into());
        }
        let _claim = self.claim(name)?;
        let _writer = self.commit_lock.lock().await;
        let removed = self.store.delete_source(name).await?;
        info!(source = name, chunks = removed, "source removed");
        Ok(removed)
    }

    /// Recompute the manifest from stored chunks and drop orphans.
    pub async fn repair(&self) -> Result<ReconcileReport> {
        let _writer = self.commit_lock.lock().await;
        let report = self.store.reconcile().await?;
        if !report.is_clean() {
            warn!(
                orphan_chunks = report.orphan_chunks_removed,
                orphan_units = report.orphan_units_removed,
                corrected = report.sources_corrected.len(),
                "index repaired"
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EmbeddingConfig;
    use crate::embedding::Embedder;
    use crate::progress::{EventKind, NoProgress};
    use async_trait::async_trait;
    use docdex_core::chunk::ChunkConfig;
    use docdex_core::embedding::{EmbeddingBatch, EmbeddingProvider};
    use docdex_core::error::classify;
    use docdex_core::models::UnitLocator;
    use docdex_core::store::memory::InMemoryStore;
    use std::time::Duration;
    use tokio::sync::Notify;

    /// Embeds instantly, or parks on `gate` when `gated` is set.
    struct Gated {
        gated: bool,
        entered: Notify,
        gate: Notify,
    }

    impl Gated {
        fn new(gated: bool) -> Self {
            Self {
                gated,
                entered: Notify::new(),
                gate: Notify::new(),
            }
        }
    }

    #[async_trait]
    impl EmbeddingProvider for Gated {
        fn model_name(&self) -> &str {
            "gated"
        }
        fn dims(&self) -> usize {
            2
        }
        async fn embed_batch(&self, texts: &[String]) -> Result<EmbeddingBatch> {
            if self.gated {
                self.entered.notify_one();
                self.gate.notified().await;
            }
            Ok(EmbeddingBatch {
                vectors: texts.iter().map(|t| vec![t.len() as f32, 1.0]).collect(),
                tokens_used: 1,
            })
        }
    }

    fn manager(provider: Arc<Gated>) -> (Arc<SourceManager>, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        let embedder = Embedder::new(provider, &EmbeddingConfig::default())
            .with_base_backoff(Duration::ZERO);
        let indexer = SourceIndexer::new(
            Arc::new(embedder),
            ChunkConfig::new(20, 5).unwrap(),
            0.0,
        );
        let mgr = SourceManager::new(store.clone(), indexer, RepositoryConfig::default());
        (Arc::new(mgr), store)
    }

    fn docs(name: &str) -> SourceDescriptor {
        SourceDescriptor::Documentation {
            name: name.into(),
            url: "https://example.com".into(),
        }
    }

    fn pages() -> Vec<RawUnit> {
        vec![RawUnit {
            locator: UnitLocator::Url("https://example.com/a".into()),
            title: "A".into(),
            content: "alpha beta gamma delta".into(),
            word_count: None,
        }]
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<EventKind>>);

    impl ProgressReporter for Recorder {
        fn report(&self, event: ProgressEvent) {
            self.0.lock().unwrap().push(event.kind);
        }
    }

    #[tokio::test]
    async fn test_add_conflict_and_replace() {
        let (mgr, store) = manager(Arc::new(Gated::new(false)));
        let cancel = CancellationToken::new();
        let first = mgr
            .add_source(&docs("a"), pages(), AddOptions::default(), &NoProgress, &cancel)
            .await
            .unwrap();
        assert_eq!(first.replaced_chunks, 0);

        let err = mgr
            .add_source(&docs("a"), pages(), AddOptions::default(), &NoProgress, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(classify(&err), Some(IndexError::Conflict(_))));

        let second = mgr
            .add_source(
                &docs("a"),
                pages(),
                AddOptions { replace: true },
                &NoProgress,
                &cancel,
            )
            .await
            .unwrap();
        assert_eq!(second.replaced_chunks, first.chunks_created);
        assert_eq!(store.manifest().await.unwrap().total_chunks, first.chunks_created);
    }

    #[tokio::test]
    async fn test_progress_events_bracket_the_add() {
        let (mgr, _) = manager(Arc::new(Gated::new(false)));
        let recorder = Recorder::default();
        mgr.add_source(
            &docs("a"),
            pages(),
            AddOptions::default(),
            &recorder,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        let kinds = recorder.0.lock().unwrap();
        assert_eq!(kinds.first(), Some(&EventKind::Start));
        assert_eq!(kinds.last(), Some(&EventKind::Complete));

        let recorder = Recorder::default();
        let _ = mgr
            .add_source(
                &docs("a"),
                pages(),
                AddOptions::default(),
                &recorder,
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(*recorder.0.lock().unwrap(), vec![EventKind::Error]);
    }

    #[tokio::test]
    async fn test_same_name_is_busy_while_indexing() {
        let provider = Arc::new(Gated::new(true));
        let (mgr, _) = manager(provider.clone());

        let task = {
            let mgr = mgr.clone();
            tokio::spawn(async move {
                mgr.add_source(
                    &docs("a"),
                    pages(),
                    AddOptions::default(),
                    &NoProgress,
                    &CancellationToken::new(),
                )
                .await
            })
        };
        provider.entered.notified().await;

        let err = mgr
            .add_source(
                &docs("a"),
                pages(),
                AddOptions { replace: true },
                &NoProgress,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(classify(&err), Some(IndexError::Busy(_))));
        let err = mgr.remove_source("a").await.unwrap_err();
        assert!(matches!(classify(&err), Some(IndexError::Busy(_))));

        provider.gate.notify_one();
        task.await.unwrap().unwrap();
        assert_eq!(mgr.remove_source("a").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_cancel_leaves_store_untouched() {
        let provider = Arc::new(Gated::new(true));
        let (mgr, store) = manager(provider.clone());
        let cancel = CancellationToken::new();

        let task = {
            let mgr = mgr.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                mgr.add_source(&docs("a"), pages(), AddOptions::default(), &NoProgress, &cancel)
                    .await
            })
        };
        provider.entered.notified().await;
        cancel.cancel();

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(classify(&err), Some(IndexError::Cancelled)));
        assert!(store.get_source("a").await.unwrap().is_none());
        assert_eq!(store.manifest().await.unwrap().total_chunks, 0);
    }

    #[tokio::test]
    async fn test_remove_unknown_is_not_found() {
        let (mgr, _) = manager(Arc::new(Gated::new(false)));
        let err = mgr.remove_source("missing").await.unwrap_err();
        assert!(matches!(classify(&err), Some(IndexError::NotFound(_))));
        let err = mgr.remove_source("  ").await.unwrap_err();
        assert!(matches!(classify(&err), Some(IndexError::Validation(_))));
    }

    #[tokio::test]
    async fn test_add_repository_rejects_missing_path() {
        let (mgr, store) = manager(Arc::new(Gated::new(false)));
        let err = mgr
            .add_repository(
                "repo",
                Path::new("/definitely/not/here"),
                AddOptions::default(),
                &NoProgress,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(classify(&err), Some(IndexError::Validation(_))));
        assert!(store.get_source("repo").await.unwrap().is_none());
    }
}
