// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Base trait for embedding providers.

use async_trait::async_trait;

use crate::error::ProviderError;

/// Trait for embedding providers.
///
/// Implementations convert text batches into fixed-dimension vectors. A
/// provider may not know its dimension until the first successful call, in
/// which case `dimensions()` returns 0 until then.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Stable provider id ("openai", "ollama"); half of the fingerprint.
    fn provider_id(&self) -> &str;

    /// Get the model name.
    fn model(&self) -> &str;

    /// Embedding dimensions, or 0 when not yet discovered.
    fn dimensions(&self) -> usize;

    /// Maximum texts per `embed_batch` call.
    fn max_batch(&self) -> usize {
        64
    }

    /// Maximum bytes per individual text.
    fn max_item_bytes(&self) -> usize {
        16 * 1024
    }

    /// Generate embeddings for multiple texts. Empty input yields empty
    /// output without a network round-trip.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError>;

    /// Generate an embedding for a single query string.
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        let results = self.embed_batch(std::slice::from_ref(&text.to_string())).await?;
        results
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::RequestFailed("no embedding returned".to_string()))
    }
}

/// Validate batch input constraints shared by all providers.
///
/// Violations fail the request before it leaves the process, as
/// `RequestFailed` with a message naming the broken constraint.
pub fn validate_batch(
    texts: &[String],
    max_batch: usize,
    max_item_bytes: usize,
) -> Result<(), ProviderError> {
    if texts.len() > max_batch {
        return Err(ProviderError::RequestFailed(format!(
            "batch of {} exceeds limit of {}",
            texts.len(),
            max_batch
        )));
    }
    for (i, text) in texts.iter().enumerate() {
        if text.is_empty() {
            return Err(ProviderError::RequestFailed(format!(
                "text at index {} is empty",
                i
            )));
        }
        if text.len() > max_item_bytes {
            return Err(ProviderError::RequestFailed(format!(
                "text at index {} is {} bytes, limit {}",
                i,
                text.len(),
                max_item_bytes
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_batch_limits() {
        let texts: Vec<String> = (0..3).map(|i| format!("text {i}")).collect();
        assert!(validate_batch(&texts, 3, 1024).is_ok());
        assert!(validate_batch(&texts, 2, 1024).is_err());
    }

    #[test]
    fn test_validate_batch_rejects_empty_item() {
        let texts = vec!["ok".to_string(), String::new()];
        assert!(matches!(
            validate_batch(&texts, 10, 1024),
            Err(ProviderError::RequestFailed(_))
        ));
    }

    #[test]
    fn test_validate_batch_rejects_oversized_item() {
        let texts = vec!["x".repeat(64)];
        assert!(validate_batch(&texts, 10, 32).is_err());
    }
}
