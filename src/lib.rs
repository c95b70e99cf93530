//! # docdex
//!
//! A local-first index of documentation sites and code repositories with
//! semantic search, exposed through a CLI and an HTTP API.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────────┐   ┌──────────┐
//! │ Crawl file  │──▶│  SourceIndexer   │──▶│  SQLite   │
//! │ Repo scan   │   │ Chunk + Embed    │   │ + vectors │
//! └─────────────┘   └──────────────────┘   └────┬─────┘
//!                          ▲                     │
//!                   SourceManager          ┌─────┴─────┐
//!                (only writer path)        ▼           ▼
//!                                     ┌────────┐  ┌────────┐
//!                                     │  CLI   │  │  HTTP  │
//!                                     └────────┘  └────────┘
//! ```
//!
//! Data types, chunking, ranking and the store trait live in the
//! `docdex-core` crate; this crate adds I/O.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`sqlite_store`] | SQLite `IndexStore` |
//! | [`embedding`] | Embedding providers and the batching embedder |
//! | [`repo_scan`] | Repository file discovery |
//! | [`crawl`] | Documentation crawl input |
//! | [`indexer`] | Chunk + embed pipeline |
//! | [`lifecycle`] | Add / remove / repair sources |
//! | [`index`] | Open index handle and search |
//! | [`progress`] | Progress events and reporters |
//! | [`render`] | Markdown output |
//! | [`commands`] | CLI command implementations |
//! | [`server`] | HTTP server |

pub mod commands;
pub mod config;
pub mod crawl;
pub mod db;
pub mod embedding;
pub mod index;
pub mod indexer;
pub mod lifecycle;
pub mod migrate;
pub mod progress;
pub mod render;
pub mod repo_scan;
pub mod server;
pub mod sqlite_store;
