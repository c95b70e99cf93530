//! The open index: store, embedder and lifecycle manager wired together.
//!
//! [`DocIndex`] is the handle the CLI and the HTTP server share. It owns
//! no global state; open one per process and [`close`](DocIndex::close)
//! it on shutdown.

use std::sync::Arc;

use anyhow::Result;
use tracing::debug;

use docdex_core::embedding::EmbeddingProvider;
use docdex_core::models::{Manifest, UnitPage};
use docdex_core::search::{search, SearchParams, SearchRequest, SearchResponse};
use docdex_core::store::IndexStore;
use docdex_core::IndexError;

use crate::config::Config;
use crate::embedding::{create_provider, Embedder};
use crate::indexer::SourceIndexer;
use crate::lifecycle::SourceManager;
use crate::sqlite_store::SqliteStore;

pub struct DocIndex {
    store: Arc<dyn IndexStore>,
    embedder: Arc<Embedder>,
    manager: Arc<SourceManager>,
    params: SearchParams,
}

impl DocIndex {
    /// Open the SQLite index named in `config` with the configured provider.
    pub async fn open(config: &Config) -> Result<Self> {
        let store = SqliteStore::open(&config.db.path).await?;
        let provider = create_provider(&config.embedding)?;
        Self::with_parts(Arc::new(store), provider, config)
    }

    /// Assemble an index from an existing store and provider.
    pub fn with_parts(
        store: Arc<dyn IndexStore>,
        provider: Arc<dyn EmbeddingProvider>,
        config: &Config,
    ) -> Result<Self> {
        let embedder = Arc::new(Embedder::new(provider, &config.embedding));
        Self::with_embedder(store, embedder, config)
    }

    /// Like [`with_parts`](Self::with_parts) with a preconfigured embedder.
    pub fn with_embedder(
        store: Arc<dyn IndexStore>,
        embedder: Arc<Embedder>,
        config: &Config,
    ) -> Result<Self> {
        let indexer = SourceIndexer::new(
            embedder.clone(),
            config.chunking.to_chunk_config()?,
            config.embedding.price_per_1k_tokens,
        );
        let manager = SourceManager::new(store.clone(), indexer, config.repository.clone());
        Ok(Self {
            store,
            embedder,
            manager: Arc::new(manager),
            params: config.retrieval.search_params(),
        })
    }

    pub fn store(&self) -> &Arc<dyn IndexStore> {
        &self.store
    }

    pub fn manager(&self) -> &Arc<SourceManager> {
        &self.manager
    }

    /// Embed the query and rank stored chunks against it.
    ///
    /// The request is validated before the provider is called.
    pub async fn search(&self, request: &SearchRequest) -> Result<SearchResponse> {
        request.validate()?;
        let vector = self.embedder.embed_query(&request.query).await?;
        let response = search(self.store.as_ref(), request, &vector, &self.params).await?;
        debug!(
            query = %request.query,
            results = response.results.len(),
            "search complete"
        );
        Ok(response)
    }

    pub async fn manifest(&self) -> Result<Manifest> {
        self.store.manifest().await
    }

    pub async fn pages(&self, name: &str) -> Result<Vec<UnitPage>> {
        if name.trim().is_empty() {
            return Err(IndexError::Validation("sourceName is required".into()).into());
        }
        self.store.list_source_pages(name).await
    }

    pub async fn close(&self) {
        self.store.close().await;
    }
}
