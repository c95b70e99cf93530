//! # docdex core
//!
//! Shared, WASM-safe logic for docdex: data models, the word-window
//! chunker, the index store abstraction, search ranking, and the
//! embedding provider trait.
//!
//! This crate contains no tokio, sqlx, filesystem I/O, or other
//! native-only dependencies.

pub mod chunk;
pub mod embedding;
pub mod error;
pub mod models;
pub mod search;
pub mod store;

pub use error::{IndexError, IndexStage};
