// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Incremental file-tree scanner.
//!
//! Walks the allowed roots, applies include/exclude globs and the size cap,
//! and classifies every accepted file by source tag. Content hashing is left
//! to the caller so unchanged files (same path, mtime, size) never touch the
//! disk beyond a metadata read.

use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use globset::{Glob, GlobSet, GlobSetBuilder};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::config::ScanConfig;
use crate::error::MemoryError;
use crate::path_gate::{PathGate, RootKind};
use crate::types::SourceKind;

/// One candidate file emitted by a scan.
#[derive(Debug, Clone)]
pub struct ScannedFile {
    /// Root-relative path, forward slashes.
    pub rel_path: String,
    pub abs_path: PathBuf,
    pub source: SourceKind,
    pub mtime_ns: i64,
    pub size_bytes: u64,
}

/// Enumerates candidate files under the configured roots.
pub struct Scanner {
    include_globs: GlobSet,
    exclude_globs: GlobSet,
    max_file_bytes: u64,
}

impl Scanner {
    pub fn new(config: &ScanConfig) -> Result<Self, MemoryError> {
        Ok(Self {
            include_globs: build_globset(&config.include_patterns)?,
            exclude_globs: build_globset(&config.exclude_patterns)?,
            max_file_bytes: config.max_file_bytes,
        })
    }

    /// Snapshot the candidate files under every allowed root.
    ///
    /// The result is sorted by `(source, rel_path)` so repeated scans of an
    /// unchanged tree are byte-identical.
    pub fn scan(&self, gate: &PathGate) -> Result<Vec<ScannedFile>, MemoryError> {
        let mut files = Vec::new();

        for root in gate.roots() {
            if !root.path.is_dir() {
                tracing::debug!(root = %root.path.display(), "skipping missing root");
                continue;
            }
            self.scan_root(gate, &root.path, root.kind, &mut files)?;
        }

        files.sort_by(|a, b| {
            (a.source.as_str(), a.rel_path.as_str()).cmp(&(b.source.as_str(), b.rel_path.as_str()))
        });
        Ok(files)
    }

    fn scan_root(
        &self,
        gate: &PathGate,
        root: &Path,
        kind: RootKind,
        out: &mut Vec<ScannedFile>,
    ) -> Result<(), MemoryError> {
        let walker = WalkDir::new(root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| {
                if e.path() == root {
                    return true;
                }
                // Hidden directories and files are skipped by default.
                !is_hidden(e.path())
            });

        for entry in walker {
            let entry = match entry {
                Ok(e) => e,
                Err(err) => {
                    tracing::warn!(root = %root.display(), error = %err, "walk error, skipping entry");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }

            let abs = entry.path();
            let rel = match abs.strip_prefix(root) {
                Ok(r) => r,
                Err(_) => continue,
            };
            let rel_str = rel.to_string_lossy().replace('\\', "/");

            if self.exclude_globs.is_match(rel) || !self.include_globs.is_match(rel) {
                continue;
            }

            let meta = match entry.metadata() {
                Ok(m) => m,
                Err(err) => {
                    tracing::warn!(path = %abs.display(), error = %err, "stat failed, skipping");
                    continue;
                }
            };
            if meta.len() > self.max_file_bytes {
                tracing::debug!(path = %rel_str, size = meta.len(), "skipping oversized file");
                continue;
            }

            // Per-entry guard: refuse symlinked components outright.
            if gate.check_within_root(abs, root, &rel_str).is_err() {
                tracing::debug!(path = %rel_str, "path gate refused entry");
                continue;
            }

            out.push(ScannedFile {
                source: classify_source(kind, &rel_str),
                rel_path: rel_str,
                abs_path: abs.to_path_buf(),
                mtime_ns: mtime_ns(&meta),
                size_bytes: meta.len(),
            });
        }
        Ok(())
    }
}

/// Source tag for a root-relative path.
///
/// Files under a `memory/` directory and the top-level `MEMORY.md` sentinel
/// are tagged `memory`; everything else inherits the root's base tag.
pub fn classify_source(kind: RootKind, rel_path: &str) -> SourceKind {
    if kind == RootKind::Workspace {
        let in_memory_dir = rel_path
            .split('/')
            .rev()
            .skip(1)
            .any(|segment| segment == "memory");
        let is_sentinel = !rel_path.contains('/') && rel_path.eq_ignore_ascii_case("memory.md");
        if in_memory_dir || is_sentinel {
            return SourceKind::Memory;
        }
    }
    kind.base_source()
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .map(|name| name.to_string_lossy().starts_with('.'))
        .unwrap_or(false)
}

fn mtime_ns(meta: &std::fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

fn build_globset(patterns: &[String]) -> Result<GlobSet, MemoryError> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern).map_err(|e| {
            MemoryError::ConfigInvalid(format!("invalid glob pattern '{}': {}", pattern, e))
        })?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| MemoryError::ConfigInvalid(format!("failed to build globset: {}", e)))
}

/// Compute the SHA-256 of a file's bytes, streaming.
pub fn hash_file(path: &Path) -> Result<String, MemoryError> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}

/// Compute the SHA-256 of a string.
pub fn hash_text(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}
