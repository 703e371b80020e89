//! Error types for peruse.
//!
//! Failure taxonomy:
//! - Input: unreadable subject, missing ID pattern (handled by fallbacks, rarely surfaced)
//! - Storage: snapshot directory or file could not be written or read
//! - Stage: the external stage executor failed (opaque, never retried here)
//! - Remote: endpoint failures surfaced by the LLM client
//! - Invariant: a state transition or snapshot that contradicts the pipeline model

use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for peruse.
#[derive(Debug, Error)]
pub enum PeruseError {
    // ═══════════════════════════════════════════════════════════════════
    // INPUT: expected failures
    // ═══════════════════════════════════════════════════════════════════
    #[error("Configuration error: {0}")]
    Config(#[from] super::ConfigError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    // ═══════════════════════════════════════════════════════════════════
    // STORAGE: snapshot persistence
    // ═══════════════════════════════════════════════════════════════════
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid snapshot {path}: {source}")]
    Snapshot {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Serialization error: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("Subject is locked by another run: {path}")]
    Locked {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ═══════════════════════════════════════════════════════════════════
    // STAGE: executor collaborator
    // ═══════════════════════════════════════════════════════════════════
    #[error(transparent)]
    Stage(#[from] StageError),

    // ═══════════════════════════════════════════════════════════════════
    // REMOTE: endpoint failures
    // ═══════════════════════════════════════════════════════════════════
    #[error("API error: {0}")]
    Api(#[from] ApiError),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Request timeout after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Rate limited: retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: f64 },

    // ═══════════════════════════════════════════════════════════════════
    // INVARIANT: pipeline model violated
    // ═══════════════════════════════════════════════════════════════════
    #[error("Stage output '{got}' does not match cursor '{expected}'")]
    InvalidTransition { expected: String, got: String },

    #[error("Inconsistent pipeline state: {0}")]
    InvalidState(String),
}

/// Errors returned by the chat-completions endpoint.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Authentication failed: invalid API key")]
    AuthenticationFailed,

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("API error (status {status}): {message}")]
    Status { status: u16, message: String },

    #[error("Request failed after {attempts} attempts: {last_error}")]
    MaxRetriesExceeded { attempts: u32, last_error: String },
}

/// Failure reported by a stage executor.
///
/// Opaque to the planner: it is persisted around, logged and propagated,
/// never inspected or retried.
#[derive(Debug, Error)]
#[error("Stage '{stage}' failed: {message}")]
pub struct StageError {
    pub stage: String,
    pub message: String,
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl StageError {
    pub fn new(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Wrap an underlying error, keeping it as the source.
    pub fn wrap<E>(stage: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self {
            stage: stage.into(),
            message: source.to_string(),
            source: Some(Box::new(source)),
        }
    }
}

impl PeruseError {
    /// Create an IO error with context.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Check if this error is worth retrying at the transport layer.
    ///
    /// Authentication and unknown-model failures are final.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_)
                | Self::RateLimited { .. }
                | Self::Network(_)
                | Self::Api(ApiError::Status { .. })
        )
    }
}

/// Result type alias for peruse.
pub type Result<T> = std::result::Result<T, PeruseError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn stage_error_keeps_source() {
        let io = std::io::Error::other("connection reset");
        let err = StageError::wrap("answer 2", io);
        assert_eq!(err.to_string(), "Stage 'answer 2' failed: connection reset");
        assert!(err.source().is_some());

        let wrapped: PeruseError = err.into();
        assert!(!wrapped.is_retryable());
    }

    #[test]
    fn timeout_is_retryable() {
        let err = PeruseError::Timeout(std::time::Duration::from_secs(5));
        assert!(err.is_retryable());
    }

    #[test]
    fn only_transient_api_errors_are_retryable() {
        let server = PeruseError::Api(ApiError::Status {
            status: 503,
            message: "overloaded".into(),
        });
        assert!(server.is_retryable());
        assert!(!PeruseError::Api(ApiError::AuthenticationFailed).is_retryable());
        assert!(!PeruseError::Api(ApiError::ModelNotFound("gpt-4o".into())).is_retryable());
        assert!(!PeruseError::InvalidState("cursor".into()).is_retryable());
    }
}
