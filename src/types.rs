// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Shared domain types for the memory search index.

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Which root family a file was discovered under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Files under a `memory/` directory or top-level memory sentinels.
    Memory,
    /// Everything else under the workspace root.
    Workspace,
    /// Files under a configured extra root.
    Extra,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Workspace => "workspace",
            Self::Extra => "extra",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "memory" => Self::Memory,
            "extra" => Self::Extra,
            _ => Self::Workspace,
        }
    }
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One ranked passage returned by `search`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    /// Root-relative, forward-slash path of the containing file.
    pub path: String,
    pub source: SourceKind,
    /// Byte offset of the passage within the file's text.
    pub byte_offset: usize,
    /// The passage text.
    pub text: String,
    /// Fused score in `[0, 1]`.
    pub score: f32,
}

/// Per-source file/chunk tallies for `status()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceCount {
    pub source: SourceKind,
    pub files: u64,
    pub chunks: u64,
}

/// Vector subsystem availability.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct VectorStatus {
    pub enabled: bool,
    pub available: bool,
}

/// Full-text subsystem availability.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FtsStatus {
    pub available: bool,
}

/// Snapshot of the index returned by `status()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub files: u64,
    pub chunks: u64,
    pub source_counts: Vec<SourceCount>,
    pub vector: VectorStatus,
    pub fts: FtsStatus,
    /// RFC 3339 timestamp of the last successful sync, if any.
    pub last_synced_at: Option<String>,
    /// `providerId/modelId` fingerprint.
    pub embedding_model: String,
    /// Size of the store file on disk.
    pub index_size_bytes: u64,
}

/// Options for `sync`.
#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    /// Full rebuild via staging swap instead of incremental reconcile.
    pub force: bool,
    /// Free-form reason recorded in the sync log line.
    pub reason: Option<String>,
    pub cancel: CancellationToken,
}

impl SyncOptions {
    pub fn forced() -> Self {
        Self {
            force: true,
            ..Default::default()
        }
    }
}

/// Result of one sync run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncReport {
    /// Files whose rows were written this run (added or modified).
    pub files_indexed: u64,
    /// Files left untouched because `(path, mtimeNs, size)` matched.
    pub files_unchanged: u64,
    /// Files removed because they disappeared from disk.
    pub files_deleted: u64,
    /// Chunks written this run.
    pub chunks_indexed: u64,
    /// Chunks that required a provider call (cache misses).
    pub chunks_embedded: u64,
    /// Vectors served from the embedding cache.
    pub vectors_reused: u64,
    pub duration_ms: u64,
    pub forced: bool,
}

/// Options for `search`.
#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    /// Override `query.maxResults`.
    pub max_results: Option<usize>,
    /// Override `query.minScore`.
    pub min_score: Option<f32>,
    pub cancel: CancellationToken,
}
