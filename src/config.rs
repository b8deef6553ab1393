// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration schema consumed by the Manager.
//!
//! The surrounding host owns config loading and hands the Manager a typed
//! [`MemorySearchConfig`]. Field names follow the host's camelCase JSON keys.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::MemoryError;

/// Which embedding provider family to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// OpenAI-compatible `POST /embeddings` endpoint.
    OpenAi,
    /// Ollama native endpoints, with OpenAI-compatible fallback probing.
    Ollama,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Ollama => "ollama",
        }
    }

    /// Default embedding model per provider.
    pub fn default_model(&self) -> &'static str {
        match self {
            Self::OpenAi => "text-embedding-3-small",
            Self::Ollama => "nomic-embed-text",
        }
    }
}

/// Transport overrides for a provider id (`models.providers.<id>`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProviderTransportConfig {
    /// Base URL override. For openai, a URL without a path gets `/v1` appended.
    pub base_url: Option<String>,
    /// Extra headers. An `Authorization` entry here replaces Bearer auth.
    pub headers: HashMap<String, String>,
    /// API key for Bearer auth.
    pub api_key: Option<String>,
}

/// Vector side of the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VectorConfig {
    /// Whether vector search participates at all.
    pub enabled: bool,
}

impl Default for VectorConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Store location and vector toggle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreConfig {
    /// Directory holding `index.sqlite` and the embedding cache.
    pub path: PathBuf,
    #[serde(default)]
    pub vector: VectorConfig,
}

/// Sync triggers and fan-out limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncConfig {
    /// Host-driven file watching. The Manager only exposes the flag.
    pub watch: bool,
    pub on_session_start: bool,
    pub on_search: bool,
    /// Concurrent embedding batch requests during sync.
    pub max_in_flight: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            watch: false,
            on_session_start: true,
            on_search: false,
            max_in_flight: 4,
        }
    }
}

/// Hybrid fusion weights.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HybridConfig {
    pub enabled: bool,
    pub vector_weight: f32,
    pub text_weight: f32,
    /// Candidate pool per side = maxResults * candidateMultiplier.
    pub candidate_multiplier: usize,
}

impl Default for HybridConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            vector_weight: 0.7,
            text_weight: 0.3,
            candidate_multiplier: 3,
        }
    }
}

/// Query-time limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueryConfig {
    pub min_score: f32,
    pub max_results: usize,
    pub hybrid: HybridConfig,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            min_score: 0.0,
            max_results: 20,
            hybrid: HybridConfig::default(),
        }
    }
}

/// Embedding cache toggle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheConfig {
    pub enabled: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// File discovery limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScanConfig {
    /// Glob patterns to include (matched against root-relative paths).
    pub include_patterns: Vec<String>,
    /// Glob patterns to exclude.
    pub exclude_patterns: Vec<String>,
    /// Files larger than this are skipped (and refused by readFile).
    pub max_file_bytes: u64,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            include_patterns: vec![
                "**/*.md".to_string(),
                "**/*.markdown".to_string(),
                "**/*.txt".to_string(),
            ],
            exclude_patterns: vec![
                "**/node_modules/**".to_string(),
                "**/target/**".to_string(),
                "**/dist/**".to_string(),
                "**/build/**".to_string(),
            ],
            max_file_bytes: 1024 * 1024,
        }
    }
}

/// Chunk window sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChunkConfig {
    pub max_chars: usize,
    pub overlap_chars: usize,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            max_chars: 2000,
            overlap_chars: 200,
        }
    }
}

/// Full configuration for one Manager instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemorySearchConfig {
    /// Absolute workspace root.
    pub workspace: PathBuf,
    pub provider: ProviderKind,
    /// Embedding model; defaults per provider when absent.
    #[serde(default)]
    pub model: Option<String>,
    pub store: StoreConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub query: QueryConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub scan: ScanConfig,
    #[serde(default)]
    pub chunk: ChunkConfig,
    /// Extra absolute roots searchable alongside the workspace.
    #[serde(default)]
    pub extra_paths: Vec<PathBuf>,
    /// Transport overrides keyed by provider id (`models.providers.<id>`).
    #[serde(default)]
    pub providers: HashMap<String, ProviderTransportConfig>,
}

impl MemorySearchConfig {
    /// Resolved model name.
    pub fn model(&self) -> String {
        self.model
            .clone()
            .unwrap_or_else(|| self.provider.default_model().to_string())
    }

    /// `providerId + "/" + modelId`; identifies the vector space.
    pub fn embedding_fingerprint(&self) -> String {
        format!("{}/{}", self.provider.as_str(), self.model())
    }

    /// Transport overrides for the configured provider, if any.
    pub fn transport(&self) -> ProviderTransportConfig {
        self.providers
            .get(self.provider.as_str())
            .cloned()
            .unwrap_or_default()
    }

    /// Reject contradictory or incomplete configuration.
    pub fn validate(&self) -> Result<(), MemoryError> {
        if !self.workspace.is_absolute() {
            return Err(MemoryError::ConfigInvalid(format!(
                "workspace must be an absolute path: {}",
                self.workspace.display()
            )));
        }
        if !self.store.path.is_absolute() {
            return Err(MemoryError::ConfigInvalid(format!(
                "store.path must be an absolute path: {}",
                self.store.path.display()
            )));
        }
        for extra in &self.extra_paths {
            if !extra.is_absolute() {
                return Err(MemoryError::ConfigInvalid(format!(
                    "extraPaths entries must be absolute: {}",
                    extra.display()
                )));
            }
        }
        if self.query.max_results == 0 {
            return Err(MemoryError::ConfigInvalid(
                "query.maxResults must be at least 1".to_string(),
            ));
        }
        if self.query.hybrid.candidate_multiplier == 0 {
            return Err(MemoryError::ConfigInvalid(
                "query.hybrid.candidateMultiplier must be at least 1".to_string(),
            ));
        }
        let hybrid = &self.query.hybrid;
        if hybrid.enabled && hybrid.vector_weight + hybrid.text_weight <= 0.0 {
            return Err(MemoryError::ConfigInvalid(
                "query.hybrid weights must sum to a positive value".to_string(),
            ));
        }
        if self.chunk.overlap_chars >= self.chunk.max_chars {
            return Err(MemoryError::ConfigInvalid(
                "chunk.overlapChars must be smaller than chunk.maxChars".to_string(),
            ));
        }
        if self.sync.max_in_flight == 0 {
            return Err(MemoryError::ConfigInvalid(
                "sync.maxInFlight must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
