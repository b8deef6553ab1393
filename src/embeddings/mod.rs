// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Embedding providers for the memory search index.
//!
//! Provides an abstraction over the supported embedding APIs (OpenAI and
//! Ollama compatible), a shared HTTP transport with retry/fallback
//! classification, and the persistent content-addressed cache.

mod base;
mod cache;
mod ollama;
mod openai;
mod transport;

use std::sync::Arc;

pub use base::{validate_batch, EmbeddingProvider};
pub use cache::{CacheStats, EmbeddingCache};
pub use ollama::{EndpointPreference, OllamaEmbeddingProvider};
pub use openai::OpenAiEmbeddingProvider;
pub use transport::{classify_http_failure, parse_embedding_response, FailureClass};

use crate::config::{MemorySearchConfig, ProviderKind};
use crate::error::MemoryError;

/// Create an embedding provider from the configuration.
pub fn create_embedding_provider(
    config: &MemorySearchConfig,
) -> Result<Arc<dyn EmbeddingProvider>, MemoryError> {
    let model = config.model();
    let transport = config.transport();

    match config.provider {
        ProviderKind::OpenAi => {
            let provider = OpenAiEmbeddingProvider::new(&model, &transport)?;
            Ok(Arc::new(provider))
        }
        ProviderKind::Ollama => {
            let provider = OllamaEmbeddingProvider::new(&model, &transport);
            Ok(Arc::new(provider))
        }
    }
}
