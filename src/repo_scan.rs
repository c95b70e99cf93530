//! Local repository scanner.
//!
//! Walks a directory tree and collects every indexable text file as a
//! [`RawUnit`] keyed by its repository-relative path. Skipped:
//!
//! - directories named in `exclude_dirs` (pruned, never descended into);
//! - hidden files and directories, when `skip_hidden` is set;
//! - paths matching any `exclude_globs` pattern;
//! - files whose extension is not in `include_extensions`, when set;
//! - binaries: known binary extensions, a NUL byte in the first
//!   `sniff_bytes` bytes, or content that is not valid UTF-8;
//! - empty and whitespace-only files.
//!
//! Results are sorted by relative path.

use std::collections::HashSet;
use std::path::Path;

use anyhow::Result;
use globset::{Glob, GlobSet, GlobSetBuilder};
use tracing::{debug, warn};
use walkdir::{DirEntry, WalkDir};

use docdex_core::models::{RawUnit, UnitLocator};
use docdex_core::IndexError;

use crate::config::RepositoryConfig;

pub fn scan_repository(root: &Path, config: &RepositoryConfig) -> Result<Vec<RawUnit>> {
    if !root.exists() {
        return Err(IndexError::Validation(format!(
            "repository path does not exist: {}",
            root.display()
        ))
        .into());
    }
    if !root.is_dir() {
        return Err(IndexError::Validation(format!(
            "repository path is not a directory: {}",
            root.display()
        ))
        .into());
    }

    let exclude_set = build_globset(&config.exclude_globs)?;
    let excluded_dirs: HashSet<&str> = config.exclude_dirs.iter().map(String::as_str).collect();
    let binary_exts: HashSet<String> = config
        .binary_extensions
        .iter()
        .map(|e| normalize_ext(e))
        .collect();
    let include_exts: Option<HashSet<String>> = config
        .include_extensions
        .as_ref()
        .map(|exts| exts.iter().map(|e| normalize_ext(e)).collect());

    let walker = WalkDir::new(root).into_iter().filter_entry(|entry| {
        entry.depth() == 0 || keep_entry(entry, &excluded_dirs, config.skip_hidden)
    });

    let mut units = Vec::new();
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(error = %e, "skipping unreadable path");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = relative_path(root, path);
        if exclude_set.is_match(&relative) {
            continue;
        }

        let ext = path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        if binary_exts.contains(&ext) {
            continue;
        }
        if let Some(include) = &include_exts {
            if !include.contains(&ext) {
                continue;
            }
        }

        let Some(content) = read_text(path, config.sniff_bytes) else {
            debug!(path = %relative, "skipping binary or unreadable file");
            continue;
        };
        if content.trim().is_empty() {
            continue;
        }

        units.push(RawUnit {
            locator: UnitLocator::Path(relative.clone()),
            title: relative,
            content,
            word_count: None,
        });
    }

    if units.is_empty() {
        return Err(IndexError::Validation(format!(
            "no files found to index in {}",
            root.display()
        ))
        .into());
    }

    units.sort_by(|a, b| a.locator.as_str().cmp(b.locator.as_str()));
    Ok(units)
}

fn keep_entry(entry: &DirEntry, excluded_dirs: &HashSet<&str>, skip_hidden: bool) -> bool {
    let name = entry.file_name().to_string_lossy();
    if skip_hidden && name.starts_with('.') {
        return false;
    }
    !(entry.file_type().is_dir() && excluded_dirs.contains(name.as_ref()))
}

/// Forward-slash path relative to `root`.
fn relative_path(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn normalize_ext(ext: &str) -> String {
    ext.trim_start_matches('.').to_lowercase()
}

/// File contents if they look like UTF-8 text.
fn read_text(path: &Path, sniff_bytes: usize) -> Option<String> {
    let bytes = std::fs::read(path).ok()?;
    let sniff = &bytes[..bytes.len().min(sniff_bytes)];
    if sniff.contains(&0) {
        return None;
    }
    String::from_utf8(bytes).ok()
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern).map_err(|e| {
            IndexError::Validation(format!("invalid exclude glob '{}': {}", pattern, e))
        })?;
        builder.add(glob);
    }
    Ok(builder.build()?)
}
