//! Error taxonomy shared by every docdex component.
//!
//! Operations return `anyhow::Result`; domain failures are raised as an
//! [`IndexError`] inside the `anyhow::Error` so callers (CLI, HTTP) can
//! recover the kind with [`classify`] and map it to an exit status or a
//! response code.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

/// Pipeline stage in which an indexing failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexStage {
    Collect,
    Chunk,
    Embed,
    Store,
}

impl fmt::Display for IndexStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IndexStage::Collect => "collect",
            IndexStage::Chunk => "chunk",
            IndexStage::Embed => "embed",
            IndexStage::Store => "store",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("invalid input: {0}")]
    Validation(String),

    #[error("source not found: {0}")]
    NotFound(String),

    #[error("source already exists: {0} (pass replace to re-index it)")]
    Conflict(String),

    #[error("another operation on source '{0}' is in progress")]
    Busy(String),

    #[error("embedding provider unavailable: {0}")]
    TransientProvider(String),

    #[error("embedding provider rejected the request: {0}")]
    Provider(String),

    #[error("indexing failed during {stage} stage: {message}")]
    Indexing { stage: IndexStage, message: String },

    #[error("indexing cancelled")]
    Cancelled,

    #[error("embedding model mismatch: index was built with {expected}, got {found}")]
    ModelMismatch { expected: String, found: String },

    #[error("chunking mismatch: index was built with {expected}, got {found}")]
    ChunkingMismatch { expected: String, found: String },

    #[error("index store is inconsistent: {0}")]
    StoreCorruption(String),
}

impl IndexError {
    /// Stable machine-readable code used in HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            IndexError::Validation(_) => "bad_request",
            IndexError::NotFound(_) => "not_found",
            IndexError::Conflict(_) => "conflict",
            IndexError::Busy(_) => "busy",
            IndexError::TransientProvider(_) | IndexError::Provider(_) => "provider_error",
            IndexError::Indexing { .. } => "indexing_failed",
            IndexError::Cancelled => "cancelled",
            IndexError::ModelMismatch { .. } => "model_mismatch",
            IndexError::ChunkingMismatch { .. } => "chunking_mismatch",
            IndexError::StoreCorruption(_) => "store_corrupted",
        }
    }

    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, IndexError::TransientProvider(_) | IndexError::Busy(_))
    }

    /// Wrap a failure as an [`IndexError::Indexing`] for the given stage,
    /// keeping domain errors that already carry a more precise kind.
    pub fn at_stage(stage: IndexStage, err: anyhow::Error) -> anyhow::Error {
        match classify(&err) {
            Some(_) => err,
            None => IndexError::Indexing {
                stage,
                message: format!("{:#}", err),
            }
            .into(),
        }
    }
}

/// Find the first [`IndexError`] anywhere in an error chain.
pub fn classify(err: &anyhow::Error) -> Option<&IndexError> {
    err.chain().find_map(|e| e.downcast_ref::<IndexError>())
}
