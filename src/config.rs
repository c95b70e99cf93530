//! TOML configuration.
//!
//! ```toml
//! [db]
//! path = "./data/docdex.sqlite"
//!
//! [chunking]
//! chunk_size = 800
//! chunk_overlap = 100
//!
//! [embedding]
//! provider = "openai"
//! model = "text-embedding-3-small"
//! dims = 1536
//!
//! [server]
//! bind = "127.0.0.1:7341"
//! ```
//!
//! Every section except `[db]` is optional.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use docdex_core::chunk::ChunkConfig;
use docdex_core::search::{SearchParams, MAX_RESULTS, MIN_RESULTS};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub repository: RepositoryConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
        }
    }
}

impl ChunkingConfig {
    pub fn to_chunk_config(&self) -> Result<ChunkConfig> {
        ChunkConfig::new(self.chunk_size, self.chunk_overlap)
    }
}

fn default_chunk_size() -> usize {
    800
}
fn default_chunk_overlap() -> usize {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_results")]
    pub default_results: i64,
    #[serde(default = "default_candidate_multiplier")]
    pub candidate_multiplier: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_results: default_results(),
            candidate_multiplier: default_candidate_multiplier(),
        }
    }
}

impl RetrievalConfig {
    pub fn search_params(&self) -> SearchParams {
        SearchParams {
            candidate_multiplier: self.candidate_multiplier,
        }
    }
}

fn default_results() -> i64 {
    5
}
fn default_candidate_multiplier() -> usize {
    2
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL override (Ollama server, OpenAI-compatible gateway).
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Batches embedded in parallel.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_price_per_1k_tokens")]
    pub price_per_1k_tokens: f64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            concurrency: default_concurrency(),
            price_per_1k_tokens: default_price_per_1k_tokens(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_concurrency() -> usize {
    4
}
fn default_price_per_1k_tokens() -> f64 {
    0.00002
}

/// Rules for walking a local repository.
#[derive(Debug, Deserialize, Clone)]
pub struct RepositoryConfig {
    /// Directory names skipped anywhere in the tree.
    #[serde(default = "default_exclude_dirs")]
    pub exclude_dirs: Vec<String>,
    /// Globs matched against repository-relative paths.
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default = "default_binary_extensions")]
    pub binary_extensions: Vec<String>,
    /// When set, only files with these extensions are indexed.
    #[serde(default)]
    pub include_extensions: Option<Vec<String>>,
    #[serde(default = "default_skip_hidden")]
    pub skip_hidden: bool,
    /// Leading bytes inspected for NUL when sniffing binaries.
    #[serde(default = "default_sniff_bytes")]
    pub sniff_bytes: usize,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            exclude_dirs: default_exclude_dirs(),
            exclude_globs: Vec::new(),
            binary_extensions: default_binary_extensions(),
            include_extensions: None,
            skip_hidden: default_skip_hidden(),
            sniff_bytes: default_sniff_bytes(),
        }
    }
}

fn default_exclude_dirs() -> Vec<String> {
    [
        "node_modules",
        ".git",
        "__pycache__",
        "venv",
        "env",
        "dist",
        "build",
        ".next",
        ".vscode",
        ".idea",
        "coverage",
        ".pytest_cache",
        ".mypy_cache",
        "vendor",
        "target",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_binary_extensions() -> Vec<String> {
    [
        "png", "jpg", "jpeg", "gif", "bmp", "ico", "webp", "pdf", "zip", "gz", "tar", "tgz",
        "7z", "rar", "exe", "dll", "so", "dylib", "a", "o", "class", "jar", "wasm", "pyc",
        "woff", "woff2", "ttf", "otf", "eot", "mp3", "mp4", "mov", "avi", "sqlite", "db", "bin",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_skip_hidden() -> bool {
    true
}
fn default_sniff_bytes() -> usize {
    8192
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7341".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

/// Parse and validate configuration text.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;

    config
        .chunking
        .to_chunk_config()
        .context("Invalid [chunking] section")?;

    if !(MIN_RESULTS..=MAX_RESULTS).contains(&config.retrieval.default_results) {
        bail!(
            "retrieval.default_results must be between {} and {}",
            MIN_RESULTS,
            MAX_RESULTS
        );
    }
    if config.retrieval.candidate_multiplier == 0 {
        bail!("retrieval.candidate_multiplier must be >= 1");
    }

    let embedding = &config.embedding;
    if embedding.batch_size == 0 {
        bail!("embedding.batch_size must be > 0");
    }
    if embedding.timeout_secs == 0 {
        bail!("embedding.timeout_secs must be > 0");
    }
    if embedding.concurrency == 0 {
        bail!("embedding.concurrency must be > 0");
    }
    if embedding.price_per_1k_tokens < 0.0 {
        bail!("embedding.price_per_1k_tokens must not be negative");
    }
    if embedding.is_enabled() {
        if embedding.dims.is_none() || embedding.dims == Some(0) {
            bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                embedding.provider
            );
        }
        if embedding.model.is_none() {
            bail!(
                "embedding.model must be specified when provider is '{}'",
                embedding.provider
            );
        }
    }

    match embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" | "local" => {}
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, ollama, or local.",
            other
        ),
    }

    Ok(config)
}
