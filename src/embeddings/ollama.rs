// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Ollama-compatible embedding provider.
//!
//! Ollama builds differ in which embedding surface they serve: newer ones
//! expose the OpenAI-compatible `/v1/embeddings` (batch or single), older
//! ones only `/api/embed` (batch) or `/api/embeddings` (one prompt at a
//! time). The provider walks those four endpoint variants in order and
//! latches the first one that works, so later calls skip the probing.

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::config::ProviderTransportConfig;
use crate::error::ProviderError;

use super::base::{validate_batch, EmbeddingProvider};
use super::transport::{
    check_uniform_dims, classify_http_failure, parse_embedding_response, EmbeddingTransport,
    FailureClass, PostOutcome, MAX_ATTEMPTS,
};

/// Default Ollama base URL.
pub const DEFAULT_BASE_URL: &str = "http://localhost:11434";

/// Endpoint variants, in probe order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EndpointPreference {
    /// `POST <base>/v1/embeddings` with `{model, input: [...]}`.
    OpenAiBatch = 0,
    /// `POST <base>/v1/embeddings`, one text per request.
    OpenAiSingle = 1,
    /// `POST <base>/api/embed` with `{model, input: [...]}`.
    OllamaEmbed = 2,
    /// `POST <base>/api/embeddings` with `{model, prompt}`, one at a time.
    OllamaEmbeddings = 3,
}

impl EndpointPreference {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::OpenAiSingle,
            2 => Self::OllamaEmbed,
            3 => Self::OllamaEmbeddings,
            _ => Self::OpenAiBatch,
        }
    }

    fn next(self) -> Option<Self> {
        match self {
            Self::OpenAiBatch => Some(Self::OpenAiSingle),
            Self::OpenAiSingle => Some(Self::OllamaEmbed),
            Self::OllamaEmbed => Some(Self::OllamaEmbeddings),
            Self::OllamaEmbeddings => None,
        }
    }
}

/// How one endpoint attempt failed.
enum EndpointFailure {
    /// Endpoint shape not served here; advance the state machine.
    Unsupported(ProviderError),
    /// Hard stop (exhausted retries or fatal status).
    Fatal(ProviderError),
}

/// Ollama-compatible embedding provider with endpoint fallback.
pub struct OllamaEmbeddingProvider {
    transport: EmbeddingTransport,
    api_key: Option<String>,
    model: String,
    /// Base without `/v1`, for the native `/api/*` endpoints.
    native_base: String,
    /// OpenAI-compatible base, always ending in `/v1`.
    openai_base: String,
    preference: AtomicU8,
    dimensions: AtomicUsize,
}

impl OllamaEmbeddingProvider {
    pub fn new(model: &str, transport: &ProviderTransportConfig) -> Self {
        let raw = transport
            .base_url
            .as_deref()
            .unwrap_or(DEFAULT_BASE_URL)
            .trim_end_matches('/');
        let native_base = raw.trim_end_matches("/v1").trim_end_matches('/').to_string();
        let openai_base = format!("{}/v1", native_base);

        Self {
            transport: EmbeddingTransport::new(transport.headers.clone()),
            api_key: transport.api_key.clone(),
            model: model.to_string(),
            native_base,
            openai_base,
            preference: AtomicU8::new(EndpointPreference::OpenAiBatch as u8),
            dimensions: AtomicUsize::new(known_dimensions(model)),
        }
    }

    /// Currently latched endpoint preference.
    pub fn preference(&self) -> EndpointPreference {
        EndpointPreference::from_u8(self.preference.load(Ordering::SeqCst))
    }

    fn latch(&self, state: EndpointPreference) {
        self.preference.store(state as u8, Ordering::SeqCst);
    }

    /// Walk the endpoint state machine starting from the latched preference.
    async fn embed_with_fallback(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        let mut state = self.preference();
        loop {
            match self.try_endpoint(state, texts).await {
                Ok(vectors) => {
                    if state != self.preference() {
                        tracing::info!(endpoint = ?state, "latched embedding endpoint preference");
                    }
                    self.latch(state);
                    check_uniform_dims(&vectors)?;
                    if let Some(first) = vectors.first() {
                        self.dimensions.store(first.len(), Ordering::SeqCst);
                    }
                    return Ok(vectors);
                }
                Err(EndpointFailure::Unsupported(err)) => match state.next() {
                    Some(next) => {
                        tracing::debug!(endpoint = ?state, error = %err, "endpoint unsupported, trying next");
                        state = next;
                    }
                    None => return Err(err),
                },
                Err(EndpointFailure::Fatal(err)) => return Err(err),
            }
        }
    }

    async fn try_endpoint(
        &self,
        state: EndpointPreference,
        texts: &[String],
    ) -> Result<Vec<Vec<f32>>, EndpointFailure> {
        match state {
            EndpointPreference::OpenAiBatch => {
                let url = format!("{}/embeddings", self.openai_base);
                let body = json!({ "model": self.model, "input": texts });
                let vectors = self.post_with_retry(&url, &body).await?;
                expect_count(vectors, texts.len())
            }
            EndpointPreference::OpenAiSingle => {
                let url = format!("{}/embeddings", self.openai_base);
                let mut out = Vec::with_capacity(texts.len());
                for text in texts {
                    let body = json!({ "model": self.model, "input": [text] });
                    let mut vectors = self.post_with_retry(&url, &body).await?;
                    match vectors.pop() {
                        Some(vector) if vectors.is_empty() => out.push(vector),
                        _ => {
                            return Err(EndpointFailure::Fatal(ProviderError::RequestFailed(
                                "expected exactly one embedding".to_string(),
                            )))
                        }
                    }
                }
                Ok(out)
            }
            EndpointPreference::OllamaEmbed => {
                let url = format!("{}/api/embed", self.native_base);
                let body = json!({ "model": self.model, "input": texts });
                let vectors = self.post_with_retry(&url, &body).await?;
                expect_count(vectors, texts.len())
            }
            EndpointPreference::OllamaEmbeddings => {
                let url = format!("{}/api/embeddings", self.native_base);
                let mut out = Vec::with_capacity(texts.len());
                for text in texts {
                    let body = json!({ "model": self.model, "prompt": text });
                    let mut vectors = self.post_with_retry(&url, &body).await?;
                    match vectors.pop() {
                        Some(vector) if vectors.is_empty() => out.push(vector),
                        _ => {
                            return Err(EndpointFailure::Fatal(ProviderError::RequestFailed(
                                "expected exactly one embedding".to_string(),
                            )))
                        }
                    }
                }
                Ok(out)
            }
        }
    }

    /// POST one body, retrying transient failures with exponential backoff.
    async fn post_with_retry(
        &self,
        url: &str,
        body: &Value,
    ) -> Result<Vec<Vec<f32>>, EndpointFailure> {
        let mut attempt = 1u32;
        loop {
            let outcome = match self
                .transport
                .post_json(url, body, self.api_key.as_deref())
                .await
            {
                Ok(outcome) => outcome,
                Err(err) if err.is_retryable() && attempt < MAX_ATTEMPTS => {
                    tracing::debug!(attempt, url, error = %err, "retrying embedding request");
                    EmbeddingTransport::backoff(attempt).await;
                    attempt += 1;
                    continue;
                }
                Err(err) => return Err(EndpointFailure::Fatal(err)),
            };

            match outcome {
                PostOutcome::Success(value) => {
                    return parse_embedding_response(&value).ok_or_else(|| {
                        EndpointFailure::Unsupported(ProviderError::RequestFailed(
                            "unrecognized embedding response shape".to_string(),
                        ))
                    });
                }
                PostOutcome::Http { status, body } => {
                    match classify_http_failure(status, &body) {
                        FailureClass::Retryable if attempt < MAX_ATTEMPTS => {
                            tracing::debug!(attempt, status, url, "retrying embedding request");
                            EmbeddingTransport::backoff(attempt).await;
                            attempt += 1;
                        }
                        FailureClass::Retryable => {
                            return Err(EndpointFailure::Fatal(ProviderError::RequestFailed(
                                format!("exhausted retries against {}: {}", url, body),
                            )));
                        }
                        FailureClass::Unsupported => {
                            return Err(EndpointFailure::Unsupported(ProviderError::Http {
                                status,
                                message: body,
                            }));
                        }
                        FailureClass::Fatal => {
                            return Err(EndpointFailure::Fatal(ProviderError::Http {
                                status,
                                message: body,
                            }));
                        }
                    }
                }
            }
        }
    }
}

fn expect_count(
    vectors: Vec<Vec<f32>>,
    expected: usize,
) -> Result<Vec<Vec<f32>>, EndpointFailure> {
    if vectors.len() == expected {
        Ok(vectors)
    } else {
        // A batch endpoint that ignores all but one input is effectively a
        // single-item endpoint; advance the state machine.
        Err(EndpointFailure::Unsupported(ProviderError::RequestFailed(
            format!("expected {} embeddings, got {}", expected, vectors.len()),
        )))
    }
}

/// Known dimensions for common models; 0 means discovered on first call.
fn known_dimensions(model: &str) -> usize {
    match model {
        "nomic-embed-text" => 768,
        "mxbai-embed-large" => 1024,
        "all-minilm" => 384,
        "snowflake-arctic-embed" => 1024,
        _ => 0,
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaEmbeddingProvider {
    fn provider_id(&self) -> &str {
        "ollama"
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> usize {
        self.dimensions.load(Ordering::SeqCst)
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        validate_batch(texts, self.max_batch(), self.max_item_bytes())?;
        self.embed_with_fallback(texts).await
    }
}
