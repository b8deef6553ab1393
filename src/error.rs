// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Error types for the memory search index.
//!
//! This module provides strongly-typed errors for different parts of the
//! crate, using `thiserror` for ergonomic error definitions. Every public
//! method fails with a tagged error kind from these enums.

use thiserror::Error;

/// Errors that can occur while talking to an embedding provider.
#[derive(Error, Debug, Clone)]
pub enum ProviderError {
    #[error("API key missing for provider: {0}")]
    AuthMissing(String),

    #[error("Provider HTTP error ({status}): {message}")]
    Http { status: u16, message: String },

    #[error("Provider request failed: {0}")]
    RequestFailed(String),

    #[error("Embedding dimension mismatch: expected {expected}, got {actual}")]
    DimMismatch { expected: usize, actual: usize },
}

impl ProviderError {
    /// Check if this error is retryable on the same endpoint.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RequestFailed(msg) => is_retryable_message(msg),
            Self::Http { status, message } => *status >= 500 && is_retryable_message(message),
            _ => false,
        }
    }
}

/// Substring patterns that classify a transport failure as transient.
const RETRYABLE_PATTERNS: &[&str] = &[
    "EOF",
    "EPIPE",
    "ECONNRESET",
    "ECONNREFUSED",
    "timeout",
    "socket hang up",
    "dial tcp",
    "broken pipe",
    "connection refused",
    "connection reset",
];

/// Check a transport error body/message against the retryable pattern set.
pub fn is_retryable_message(message: &str) -> bool {
    RETRYABLE_PATTERNS.iter().any(|p| message.contains(p))
}

/// Errors surfaced by the Manager facade and its components.
#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("Path denied: {0}")]
    PathDenied(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Store corrupt: {0}")]
    StoreCorrupt(String),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Operation cancelled")]
    Cancelled,
}

impl From<std::io::Error> for MemoryError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<rusqlite::Error> for MemoryError {
    fn from(err: rusqlite::Error) -> Self {
        Self::StoreCorrupt(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_patterns() {
        assert!(is_retryable_message("read tcp: connection reset by peer"));
        assert!(is_retryable_message(
            "dial tcp 127.0.0.1:11434: connect: connection refused"
        ));
        assert!(is_retryable_message("request timeout after 60s"));
        assert!(!is_retryable_message("model not found"));
        assert!(!is_retryable_message("invalid request body"));
    }

    #[test]
    fn test_provider_error_retryable() {
        assert!(ProviderError::RequestFailed("socket hang up".to_string()).is_retryable());
        assert!(!ProviderError::RequestFailed("bad model".to_string()).is_retryable());
        assert!(!ProviderError::AuthMissing("openai".to_string()).is_retryable());
        assert!(!ProviderError::Http {
            status: 404,
            message: "not found".to_string()
        }
        .is_retryable());
        assert!(ProviderError::Http {
            status: 502,
            message: "upstream timeout".to_string()
        }
        .is_retryable());
    }

    #[test]
    fn test_memory_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: MemoryError = io_err.into();
        assert!(matches!(err, MemoryError::Io(_)));
    }

    #[test]
    fn test_error_display() {
        let err = ProviderError::DimMismatch {
            expected: 768,
            actual: 1024,
        };
        let display = format!("{}", err);
        assert!(display.contains("768"));
        assert!(display.contains("1024"));
    }
}
