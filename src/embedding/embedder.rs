//! Batched, retrying embedding pipeline.
//!
//! [`Embedder`] wraps an [`EmbeddingProvider`] and turns "embed these N
//! texts" into provider-sized batches that run with bounded concurrency.
//! Results come back in input order regardless of completion order.
//!
//! Per batch:
//! - each attempt is bounded by `timeout_secs`;
//! - transient failures (429, 5xx, network, timeout) are retried up to
//!   `max_retries` times with exponential backoff (1s, 2s, 4s, … capped at 32s);
//! - permanent failures abort the whole call immediately.
//!
//! Cancellation is checked before every attempt and raced against every
//! in-flight call and backoff sleep.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use docdex_core::embedding::{estimate_tokens, EmbeddingBatch, EmbeddingProvider};
use docdex_core::error::classify;
use docdex_core::models::EmbeddingStamp;
use docdex_core::IndexError;

use crate::config::EmbeddingConfig;

/// Backoff doubles at most this many times.
const MAX_BACKOFF_DOUBLINGS: u32 = 5;

/// Vectors for a whole input, in input order.
#[derive(Debug, Clone, Default)]
pub struct Embeddings {
    pub vectors: Vec<Vec<f32>>,
    pub tokens_used: u64,
}

pub struct Embedder {
    provider: Arc<dyn EmbeddingProvider>,
    batch_size: usize,
    concurrency: usize,
    max_retries: u32,
    timeout: Duration,
    base_backoff: Duration,
}

impl Embedder {
    pub fn new(provider: Arc<dyn EmbeddingProvider>, config: &EmbeddingConfig) -> Self {
        Self {
            provider,
            batch_size: config.batch_size.max(1),
            concurrency: config.concurrency.max(1),
            max_retries: config.max_retries,
            timeout: Duration::from_secs(config.timeout_secs),
            base_backoff: Duration::from_secs(1),
        }
    }

    /// Override the first retry delay. Tests use a zero backoff.
    pub fn with_base_backoff(mut self, base: Duration) -> Self {
        self.base_backoff = base;
        self
    }

    /// Override the per-attempt timeout from `timeout_secs`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn stamp(&self) -> EmbeddingStamp {
        self.provider.stamp()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Number of provider batches needed for `count` texts.
    pub fn batch_count(&self, count: usize) -> usize {
        count.div_ceil(self.batch_size)
    }

    /// Embed `texts`, calling `on_batch(done, total)` after each batch
    /// completes (in order).
    pub async fn embed_all(
        &self,
        texts: &[String],
        cancel: &CancellationToken,
        mut on_batch: impl FnMut(usize, usize) + Send,
    ) -> Result<Embeddings> {
        let total = self.batch_count(texts.len());
        let mut out = Embeddings {
            vectors: Vec::with_capacity(texts.len()),
            tokens_used: 0,
        };
        if texts.is_empty() {
            return Ok(out);
        }

        let owned: Vec<Vec<String>> = texts
            .chunks(self.batch_size)
            .map(<[String]>::to_vec)
            .collect();
        let mut batches = stream::iter(owned)
            .map(|batch| async move { self.embed_with_retry(&batch, cancel).await })
            .buffered(self.concurrency);

        let mut done = 0;
        while let Some(result) = batches.next().await {
            let batch = result?;
            out.tokens_used += batch.tokens_used;
            out.vectors.extend(batch.vectors);
            done += 1;
            on_batch(done, total);
        }
        Ok(out)
    }

    /// Embed a single search query.
    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        let batch = self
            .embed_with_retry(&[text.to_string()], &CancellationToken::new())
            .await?;
        batch
            .vectors
            .into_iter()
            .next()
            .ok_or_else(|| IndexError::Provider("empty embedding response".into()).into())
    }

    fn backoff(&self, attempt: u32) -> Duration {
        self.base_backoff * (1u32 << (attempt - 1).min(MAX_BACKOFF_DOUBLINGS))
    }

    async fn embed_with_retry(
        &self,
        batch: &[String],
        cancel: &CancellationToken,
    ) -> Result<EmbeddingBatch> {
        let mut last_err: Option<anyhow::Error> = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = self.backoff(attempt);
                warn!(
                    attempt,
                    max_retries = self.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    "retrying embedding batch"
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Err(IndexError::Cancelled.into()),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            if cancel.is_cancelled() {
                return Err(IndexError::Cancelled.into());
            }

            let call = tokio::time::timeout(self.timeout, self.provider.embed_batch(batch));
            let outcome = tokio::select! {
                _ = cancel.cancelled() => return Err(IndexError::Cancelled.into()),
                outcome = call => outcome,
            };

            match outcome {
                Ok(Ok(result)) => return self.check_batch(batch, result),
                Ok(Err(e)) => match classify(&e) {
                    Some(IndexError::TransientProvider(msg)) => {
                        debug!(attempt, error = %msg, "transient embedding failure");
                        last_err = Some(e);
                    }
                    _ => return Err(e),
                },
                Err(_) => {
                    debug!(attempt, "embedding batch timed out");
                    last_err = Some(
                        IndexError::TransientProvider(format!(
                            "embedding batch timed out after {:?}",
                            self.timeout
                        ))
                        .into(),
                    );
                }
            }
        }

        let cause = last_err
            .map(|e| format!("{:#}", e))
            .unwrap_or_else(|| "no attempts made".to_string());
        Err(IndexError::TransientProvider(format!(
            "giving up after {} attempts: {}",
            self.max_retries + 1,
            cause
        ))
        .into())
    }

    fn check_batch(&self, batch: &[String], mut result: EmbeddingBatch) -> Result<EmbeddingBatch> {
        if result.vectors.len() != batch.len() {
            return Err(IndexError::Provider(format!(
                "provider returned {} vectors for {} inputs",
                result.vectors.len(),
                batch.len()
            ))
            .into());
        }
        let dims = self.provider.dims();
        if let Some(bad) = result.vectors.iter().find(|v| v.len() != dims) {
            return Err(IndexError::ModelMismatch {
                expected: self.provider.stamp().to_string(),
                found: format!("a {}-dim vector", bad.len()),
            }
            .into());
        }
        if result.tokens_used == 0 {
            result.tokens_used = batch.iter().map(|t| estimate_tokens(t)).sum();
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Returns `[len, 1.0]` per text; fails transiently the first
    /// `fail_first` calls.
    struct Scripted {
        calls: AtomicUsize,
        fail_first: usize,
        permanent: bool,
        batches: Mutex<Vec<usize>>,
    }

    impl Scripted {
        fn new(fail_first: usize, permanent: bool) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail_first,
                permanent,
                batches: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl EmbeddingProvider for Scripted {
        fn model_name(&self) -> &str {
            "scripted"
        }
        fn dims(&self) -> usize {
            2
        }
        async fn embed_batch(&self, texts: &[String]) -> Result<EmbeddingBatch> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                return Err(if self.permanent {
                    IndexError::Provider("400 bad request".into()).into()
                } else {
                    IndexError::TransientProvider("503".into()).into()
                });
            }
            self.batches.lock().unwrap().push(texts.len());
            Ok(EmbeddingBatch {
                vectors: texts.iter().map(|t| vec![t.len() as f32, 1.0]).collect(),
                tokens_used: 0,
            })
        }
    }

    fn embedder(provider: Arc<Scripted>, batch_size: usize, max_retries: u32) -> Embedder {
        let config = EmbeddingConfig {
            batch_size,
            max_retries,
            concurrency: 3,
            ..EmbeddingConfig::default()
        };
        Embedder::new(provider, &config).with_base_backoff(Duration::ZERO)
    }

    fn texts(n: usize) -> Vec<String> {
        (0..n).map(|i| "x".repeat(i + 1)).collect()
    }

    #[tokio::test]
    async fn test_batches_preserve_order() {
        let provider = Arc::new(Scripted::new(0, false));
        let e = embedder(provider.clone(), 4, 0);
        let mut progress = Vec::new();
        let out = e
            .embed_all(&texts(10), &CancellationToken::new(), |done, total| {
                progress.push((done, total))
            })
            .await
            .unwrap();

        assert_eq!(out.vectors.len(), 10);
        for (i, v) in out.vectors.iter().enumerate() {
            assert_eq!(v[0], (i + 1) as f32);
        }
        assert_eq!(progress, vec![(1, 3), (2, 3), (3, 3)]);
        let mut sizes = provider.batches.lock().unwrap().clone();
        sizes.sort();
        assert_eq!(sizes, vec![2, 4, 4]);
        assert!(out.tokens_used > 0);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let provider = Arc::new(Scripted::new(2, false));
        let e = embedder(provider.clone(), 8, 3);
        let out = e
            .embed_all(&texts(3), &CancellationToken::new(), |_, _| {})
            .await
            .unwrap();
        assert_eq!(out.vectors.len(), 3);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let provider = Arc::new(Scripted::new(10, false));
        let e = embedder(provider.clone(), 8, 2);
        let err = e
            .embed_all(&texts(3), &CancellationToken::new(), |_, _| {})
            .await
            .unwrap_err();
        assert!(matches!(
            classify(&err),
            Some(IndexError::TransientProvider(_))
        ));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_failure_not_retried() {
        let provider = Arc::new(Scripted::new(1, true));
        let e = embedder(provider.clone(), 8, 5);
        let err = e
            .embed_all(&texts(3), &CancellationToken::new(), |_, _| {})
            .await
            .unwrap_err();
        assert!(matches!(classify(&err), Some(IndexError::Provider(_))));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let provider = Arc::new(Scripted::new(0, false));
        let e = embedder(provider.clone(), 2, 0);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = e.embed_all(&texts(4), &cancel, |_, _| {}).await.unwrap_err();
        assert!(matches!(classify(&err), Some(IndexError::Cancelled)));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_embed_query() {
        let provider = Arc::new(Scripted::new(0, false));
        let e = embedder(provider, 8, 0);
        assert_eq!(e.embed_query("abc").await.unwrap(), vec![3.0, 1.0]);
    }

    /// Sleeps far past any test timeout for the first `slow_first` calls.
    struct Slow {
        calls: AtomicUsize,
        slow_first: usize,
    }

    #[async_trait]
    impl EmbeddingProvider for Slow {
        fn model_name(&self) -> &str {
            "slow"
        }
        fn dims(&self) -> usize {
            2
        }
        async fn embed_batch(&self, texts: &[String]) -> Result<EmbeddingBatch> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.slow_first {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            Ok(EmbeddingBatch {
                vectors: texts.iter().map(|_| vec![1.0, 0.0]).collect(),
                tokens_used: 0,
            })
        }
    }

    fn slow_embedder(slow_first: usize, max_retries: u32) -> (Embedder, Arc<Slow>) {
        let provider = Arc::new(Slow {
            calls: AtomicUsize::new(0),
            slow_first,
        });
        let config = EmbeddingConfig {
            max_retries,
            ..EmbeddingConfig::default()
        };
        let e = Embedder::new(provider.clone(), &config)
            .with_base_backoff(Duration::ZERO)
            .with_timeout(Duration::from_millis(50));
        (e, provider)
    }

    #[tokio::test]
    async fn test_timed_out_batch_is_retried() {
        let (e, provider) = slow_embedder(1, 2);
        let out = e
            .embed_all(&texts(2), &CancellationToken::new(), |_, _| {})
            .await
            .unwrap();
        assert_eq!(out.vectors.len(), 2);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_timeouts_exhaust_retries() {
        let (e, provider) = slow_embedder(usize::MAX, 1);
        let err = e
            .embed_all(&texts(2), &CancellationToken::new(), |_, _| {})
            .await
            .unwrap_err();
        match classify(&err) {
            Some(IndexError::TransientProvider(msg)) => assert!(msg.contains("timed out")),
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_backoff_capped() {
        let provider = Arc::new(Scripted::new(0, false));
        let e = Embedder::new(provider, &EmbeddingConfig::default());
        assert_eq!(e.backoff(1), Duration::from_secs(1));
        assert_eq!(e.backoff(3), Duration::from_secs(4));
        assert_eq!(e.backoff(9), Duration::from_secs(32));
    }
}
