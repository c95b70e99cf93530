//! Documentation crawl input.
//!
//! Crawling itself happens outside docdex. A crawler writes a JSON file
//! of the form:
//!
//! ```json
//! {
//!   "source": "https://react.dev/learn",
//!   "pages": [
//!     { "url": "https://react.dev/learn", "title": "Quick Start",
//!       "content": "…markdown…", "wordCount": 1234 }
//!   ]
//! }
//! ```
//!
//! and this module turns it into [`RawUnit`]s for the indexer.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use docdex_core::models::{RawUnit, UnitLocator};
use docdex_core::IndexError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrawlPage {
    pub url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default, alias = "word_count")]
    pub word_count: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrawlOutput {
    /// Root URL the crawl started from.
    pub source: String,
    #[serde(default)]
    pub pages: Vec<CrawlPage>,
}

impl CrawlOutput {
    /// Convert pages to units, keeping at most `max_pages` in crawl order.
    pub fn into_units(self, max_pages: Option<usize>) -> Vec<RawUnit> {
        let limit = max_pages.unwrap_or(usize::MAX);
        self.pages
            .into_iter()
            .take(limit)
            .map(|page| RawUnit {
                title: if page.title.trim().is_empty() {
                    page.url.clone()
                } else {
                    page.title
                },
                locator: UnitLocator::Url(page.url),
                content: page.content,
                word_count: page.word_count,
            })
            .collect()
    }
}

pub fn parse_crawl(json: &str) -> Result<CrawlOutput> {
    serde_json::from_str(json)
        .map_err(|e| IndexError::Validation(format!("invalid crawl file: {}", e)).into())
}

pub fn load_crawl_file(path: &Path) -> Result<CrawlOutput> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read crawl file: {}", path.display()))?;
    parse_crawl(&content)
}

/// Source name used when none is given: the URL's host.
pub fn default_source_name(source_url: &str) -> Result<String> {
    url::Url::parse(source_url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .filter(|h| !h.is_empty())
        .ok_or_else(|| {
            IndexError::Validation(format!(
                "cannot derive a source name from '{}'; pass one explicitly",
                source_url
            ))
            .into()
        })
}
