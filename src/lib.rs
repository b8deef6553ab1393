// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! memsearch - persistent, incrementally-synced hybrid memory search index.
//!
//! Given a natural-language query, returns ranked passages from a user's
//! notes/workspace, blending dense vector similarity against passage
//! embeddings with a lexical full-text score.
//!
//! # Architecture
//!
//! The crate is organized into the following modules:
//!
//! - [`types`] - Shared domain types (SearchHit, StatusReport, SyncReport, ...)
//! - [`error`] - Error types and result aliases
//! - [`config`] - Configuration schema consumed by the Manager
//! - [`path_gate`] - Sandbox constraining file access to allowed roots
//! - [`scanner`] - Incremental file-tree scanner with glob filters
//! - [`chunker`] - Deterministic overlapping text windows
//! - [`embeddings`] - OpenAI/Ollama providers, endpoint fallback, persistent cache
//! - [`store`] - Embedded sqlite store: relational + FTS5 + vec0 vector index
//! - [`sync`] - Incremental reconcile and crash-safe forced reindex
//! - [`search`] - Hybrid query planner with weighted score fusion
//! - [`manager`] - Facade wiring everything together
//! - [`telemetry`] - Tracing and metrics infrastructure
//!
//! # Example
//!
//! ```rust,ignore
//! use memsearch::{MemorySearchManager, MemorySearchConfig, SyncOptions, SearchOptions};
//!
//! let manager = MemorySearchManager::new(config).await?;
//! manager.sync(SyncOptions::forced()).await?;
//!
//! for hit in manager.search("alpha", SearchOptions::default()).await? {
//!     println!("{} (score {:.2}): {}", hit.path, hit.score, hit.text);
//! }
//! ```

pub mod chunker;
pub mod config;
pub mod embeddings;
pub mod error;
pub mod manager;
pub mod path_gate;
pub mod scanner;
pub mod search;
pub mod store;
pub mod sync;
pub mod telemetry;
pub mod types;

// Re-export commonly used types at crate root
pub use config::{
    CacheConfig, ChunkConfig, HybridConfig, MemorySearchConfig, ProviderKind,
    ProviderTransportConfig, QueryConfig, ScanConfig, StoreConfig, SyncConfig, VectorConfig,
};
pub use embeddings::{
    create_embedding_provider, EmbeddingCache, EmbeddingProvider, OllamaEmbeddingProvider,
    OpenAiEmbeddingProvider,
};
pub use error::{MemoryError, ProviderError};
pub use manager::MemorySearchManager;
pub use types::{
    FtsStatus, SearchHit, SearchOptions, SourceCount, SourceKind, StatusReport, SyncOptions,
    SyncReport, VectorStatus,
};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
