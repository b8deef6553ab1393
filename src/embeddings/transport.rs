// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Shared HTTP transport for embedding providers.
//!
//! Owns the connection-pooled client, the retry/backoff loop, the
//! retryable-vs-unsupported error classification, and the tolerant response
//! parsing shared by both provider families.

use std::collections::HashMap;
use std::time::Duration;

use reqwest::Client;
use serde_json::Value;

use crate::error::{is_retryable_message, ProviderError};

/// Per-request timeout.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Retry budget per endpoint.
pub const MAX_ATTEMPTS: u32 = 3;

/// Base backoff; doubles per attempt (150 ms, 300 ms).
pub const BACKOFF_BASE_MS: u64 = 150;

/// Body substrings that mean "this endpoint does not exist here".
const UNSUPPORTED_PATTERNS: &[&str] = &["not found", "unsupported", "unrecognized", "invalid"];

/// How a failed request should steer the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureClass {
    /// Transient transport trouble; retry the same endpoint.
    Retryable,
    /// The endpoint/shape is not served here; try the next endpoint variant.
    Unsupported,
    /// Hard failure; stop.
    Fatal,
}

/// Classify an HTTP response status + body.
pub fn classify_http_failure(status: u16, body: &str) -> FailureClass {
    if matches!(status, 404 | 405 | 501) {
        return FailureClass::Unsupported;
    }
    if status >= 500 && is_retryable_message(body) {
        return FailureClass::Retryable;
    }
    if status >= 400 {
        let lowered = body.to_lowercase();
        if UNSUPPORTED_PATTERNS.iter().any(|p| lowered.contains(p)) {
            return FailureClass::Unsupported;
        }
    }
    FailureClass::Fatal
}

/// Outcome of one POST.
#[derive(Debug)]
pub enum PostOutcome {
    Success(Value),
    /// Non-2xx response.
    Http { status: u16, body: String },
}

/// Shared transport: one pooled client plus caller-supplied headers.
pub struct EmbeddingTransport {
    client: Client,
    headers: HashMap<String, String>,
}

impl EmbeddingTransport {
    pub fn new(headers: HashMap<String, String>) -> Self {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self { client, headers }
    }

    /// Whether the caller supplied an explicit Authorization header.
    pub fn has_auth_override(&self) -> bool {
        self.headers
            .keys()
            .any(|k| k.eq_ignore_ascii_case("authorization"))
    }

    /// POST a JSON body. Transport-level failures come back as
    /// `ProviderError::RequestFailed`; HTTP failures are returned for the
    /// caller to classify.
    pub async fn post_json(
        &self,
        url: &str,
        body: &Value,
        bearer: Option<&str>,
    ) -> Result<PostOutcome, ProviderError> {
        let mut request = self.client.post(url).json(body);
        if let Some(key) = bearer {
            if !self.has_auth_override() {
                request = request.header("Authorization", format!("Bearer {}", key));
            }
        }
        for (name, value) in &self.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request
            .send()
            .await
            .map_err(|e| ProviderError::RequestFailed(transport_message(&e)))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ProviderError::RequestFailed(transport_message(&e)))?;

        if !status.is_success() {
            return Ok(PostOutcome::Http {
                status: status.as_u16(),
                body: text,
            });
        }

        let value: Value = serde_json::from_str(&text).map_err(|e| {
            ProviderError::RequestFailed(format!("failed to parse response body: {}", e))
        })?;
        Ok(PostOutcome::Success(value))
    }

    /// Exponential backoff before retry attempt `attempt` (1-based).
    pub async fn backoff(attempt: u32) {
        let delay = BACKOFF_BASE_MS * (1 << (attempt.saturating_sub(1)));
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }
}

/// Render a reqwest error so the retryable pattern set can match it.
fn transport_message(err: &reqwest::Error) -> String {
    if err.is_timeout() {
        format!("request timeout: {}", err)
    } else if err.is_connect() {
        format!("connection refused: {}", err)
    } else {
        err.to_string()
    }
}

/// Parse any of the accepted embedding response shapes:
/// `{data: [{embedding}]}`, `{embeddings: [[...]]}`, `{embedding: [...]}`.
pub fn parse_embedding_response(value: &Value) -> Option<Vec<Vec<f32>>> {
    if let Some(data) = value.get("data").and_then(Value::as_array) {
        let mut indexed: Vec<(usize, Vec<f32>)> = Vec::with_capacity(data.len());
        for (fallback_idx, item) in data.iter().enumerate() {
            let embedding = parse_f32_array(item.get("embedding")?)?;
            let idx = item
                .get("index")
                .and_then(Value::as_u64)
                .map(|i| i as usize)
                .unwrap_or(fallback_idx);
            indexed.push((idx, embedding));
        }
        indexed.sort_by_key(|(i, _)| *i);
        return Some(indexed.into_iter().map(|(_, e)| e).collect());
    }

    if let Some(rows) = value.get("embeddings").and_then(Value::as_array) {
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(parse_f32_array(row)?);
        }
        return Some(out);
    }

    if let Some(single) = value.get("embedding") {
        return Some(vec![parse_f32_array(single)?]);
    }

    None
}

fn parse_f32_array(value: &Value) -> Option<Vec<f32>> {
    let array = value.as_array()?;
    let mut out = Vec::with_capacity(array.len());
    for item in array {
        out.push(item.as_f64()? as f32);
    }
    Some(out)
}

/// Reject within-batch dimension disagreements and zero-dimension vectors.
pub fn check_uniform_dims(vectors: &[Vec<f32>]) -> Result<(), ProviderError> {
    let Some(first) = vectors.first() else {
        return Ok(());
    };
    if first.is_empty() {
        return Err(ProviderError::DimMismatch {
            expected: 1,
            actual: 0,
        });
    }
    for vector in vectors.iter().skip(1) {
        if vector.len() != first.len() {
            return Err(ProviderError::DimMismatch {
                expected: first.len(),
                actual: vector.len(),
            });
        }
    }
    Ok(())
}
