// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! OpenAI-compatible embedding provider.
//!
//! Speaks `POST <baseUrl>/embeddings` with `{model, input}`. Works against
//! api.openai.com and any compatible third party; the API key is only
//! mandatory for the official endpoint.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde_json::json;

use crate::config::ProviderTransportConfig;
use crate::error::ProviderError;

use super::base::{validate_batch, EmbeddingProvider};
use super::transport::{
    check_uniform_dims, classify_http_failure, parse_embedding_response, EmbeddingTransport,
    FailureClass, PostOutcome, MAX_ATTEMPTS,
};

/// Default OpenAI API base.
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// OpenAI-compatible embedding provider.
pub struct OpenAiEmbeddingProvider {
    transport: EmbeddingTransport,
    api_key: Option<String>,
    model: String,
    base_url: String,
    dimensions: AtomicUsize,
}

impl OpenAiEmbeddingProvider {
    /// Create a provider from the model name and transport overrides.
    ///
    /// A missing API key is fatal only when the base URL is the official
    /// OpenAI endpoint; compatible proxies frequently run keyless.
    pub fn new(model: &str, transport: &ProviderTransportConfig) -> Result<Self, ProviderError> {
        let base_url = normalize_base_url(transport.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL));

        let api_key = transport
            .api_key
            .clone()
            .or_else(|| std::env::var("OPENAI_API_KEY").ok());

        let http = EmbeddingTransport::new(transport.headers.clone());
        if api_key.is_none() && base_url == DEFAULT_BASE_URL && !http.has_auth_override() {
            return Err(ProviderError::AuthMissing("openai".to_string()));
        }

        Ok(Self {
            transport: http,
            api_key,
            model: model.to_string(),
            base_url,
            dimensions: AtomicUsize::new(known_dimensions(model)),
        })
    }

    /// Make one embeddings request, retrying transient failures in place.
    async fn request_embeddings(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        let url = format!("{}/embeddings", self.base_url);
        let body = json!({ "model": self.model, "input": texts });

        let mut attempt = 1u32;
        loop {
            let outcome = match self
                .transport
                .post_json(&url, &body, self.api_key.as_deref())
                .await
            {
                Ok(outcome) => outcome,
                Err(err) if err.is_retryable() && attempt < MAX_ATTEMPTS => {
                    tracing::debug!(attempt, error = %err, "retrying openai embeddings request");
                    EmbeddingTransport::backoff(attempt).await;
                    attempt += 1;
                    continue;
                }
                Err(err) => return Err(err),
            };

            match outcome {
                PostOutcome::Success(value) => {
                    let vectors = parse_embedding_response(&value).ok_or_else(|| {
                        ProviderError::RequestFailed(
                            "unrecognized embedding response shape".to_string(),
                        )
                    })?;
                    if vectors.len() != texts.len() {
                        return Err(ProviderError::RequestFailed(format!(
                            "expected {} embeddings, got {}",
                            texts.len(),
                            vectors.len()
                        )));
                    }
                    check_uniform_dims(&vectors)?;
                    if let Some(first) = vectors.first() {
                        self.dimensions.store(first.len(), Ordering::SeqCst);
                    }
                    return Ok(vectors);
                }
                PostOutcome::Http { status, body } => {
                    let retryable =
                        classify_http_failure(status, &body) == FailureClass::Retryable;
                    if retryable && attempt < MAX_ATTEMPTS {
                        tracing::debug!(attempt, status, "retrying openai embeddings request");
                        EmbeddingTransport::backoff(attempt).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(ProviderError::Http {
                        status,
                        message: truncate_body(&body),
                    });
                }
            }
        }
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbeddingProvider {
    fn provider_id(&self) -> &str {
        "openai"
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> usize {
        self.dimensions.load(Ordering::SeqCst)
    }

    fn max_batch(&self) -> usize {
        100
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        validate_batch(texts, self.max_batch(), self.max_item_bytes())?;
        self.request_embeddings(texts).await
    }
}

/// Apply the base-URL rule: strip the trailing slash, and extend a bare
/// origin (no path) with `/v1`.
fn normalize_base_url(raw: &str) -> String {
    let trimmed = raw.trim_end_matches('/');
    let has_path = trimmed
        .splitn(2, "://")
        .nth(1)
        .map(|rest| rest.contains('/'))
        .unwrap_or(false);
    if has_path {
        trimmed.to_string()
    } else {
        format!("{}/v1", trimmed)
    }
}

/// Known dimensions for common models; 0 means discovered on first call.
fn known_dimensions(model: &str) -> usize {
    match model {
        "text-embedding-3-small" => 1536,
        "text-embedding-3-large" => 3072,
        "text-embedding-ada-002" => 1536,
        _ => 0,
    }
}

fn truncate_body(body: &str) -> String {
    const LIMIT: usize = 512;
    if body.len() <= LIMIT {
        return body.to_string();
    }
    let mut end = LIMIT;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &body[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport_with_key() -> ProviderTransportConfig {
        ProviderTransportConfig {
            api_key: Some("test-key".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_normalize_base_url() {
        assert_eq!(
            normalize_base_url("https://api.openai.com/v1"),
            "https://api.openai.com/v1"
        );
        assert_eq!(
            normalize_base_url("https://proxy.example.com"),
            "https://proxy.example.com/v1"
        );
        assert_eq!(
            normalize_base_url("https://proxy.example.com/"),
            "https://proxy.example.com/v1"
        );
        assert_eq!(
            normalize_base_url("https://proxy.example.com/openai"),
            "https://proxy.example.com/openai"
        );
    }

    #[test]
    fn test_known_dimensions() {
        let provider =
            OpenAiEmbeddingProvider::new("text-embedding-3-small", &transport_with_key()).unwrap();
        assert_eq!(provider.dimensions(), 1536);

        let provider =
            OpenAiEmbeddingProvider::new("text-embedding-3-large", &transport_with_key()).unwrap();
        assert_eq!(provider.dimensions(), 3072);
    }

    #[test]
    fn test_missing_key_ok_for_third_party_base() {
        let transport = ProviderTransportConfig {
            base_url: Some("http://localhost:8080".to_string()),
            ..Default::default()
        };
        let provider = OpenAiEmbeddingProvider::new("some-model", &transport);
        assert!(provider.is_ok());
        assert_eq!(provider.unwrap().base_url, "http://localhost:8080/v1");
    }

    #[test]
    fn test_auth_override_header_replaces_key_requirement() {
        let mut transport = ProviderTransportConfig::default();
        transport
            .headers
            .insert("Authorization".to_string(), "Basic abc".to_string());
        // Key requirement is waived when an override header is present, even
        // against the default base.
        if std::env::var("OPENAI_API_KEY").is_err() {
            let provider = OpenAiEmbeddingProvider::new("text-embedding-3-small", &transport);
            assert!(provider.is_ok());
        }
    }
}
