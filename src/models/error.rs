//! Error types for prefclean.
//!
//! Epistemic taxonomy:
//! - B_i falsified: Expected failures (bad input, missing columns)
//! - I^B materialized: Infrastructure failures (network, timeout, remote API)
//! - K_i violated: Internal invariant violations (bugs)

use thiserror::Error;

/// Top-level error type for prefclean.
#[derive(Debug, Error)]
pub enum PipelineError {
    // ═══════════════════════════════════════════════════════════════════
    // B_i FALSIFIED: Belief proven wrong (expected failures)
    // ═══════════════════════════════════════════════════════════════════

    #[error("Configuration error: {0}")]
    Config(#[from] super::ConfigError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid record at index {index}: {reason}")]
    InvalidRecord { index: usize, reason: String },

    #[error("Step '{step}' requires missing columns: {}", columns.join(", "))]
    MissingColumns { step: String, columns: Vec<String> },

    #[error("Parse error: {0}")]
    ParseError(String),

    // ═══════════════════════════════════════════════════════════════════
    // I^B MATERIALIZED: Bounded ignorance became known-bad
    // ═══════════════════════════════════════════════════════════════════

    #[error("LLM API error: {0}")]
    LlmApi(#[from] LlmApiError),

    #[error("Curation sink error: {0}")]
    Curation(#[from] CurationError),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Request timeout after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Rate limited: retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: f64 },

    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("External command failed: {0}")]
    External(String),

    // ═══════════════════════════════════════════════════════════════════
    // K_i VIOLATED: Invariant broken (bug, should not happen)
    // ═══════════════════════════════════════════════════════════════════

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Errors returned by an OpenAI-compatible chat completions endpoint.
#[derive(Debug, Error)]
pub enum LlmApiError {
    #[error("Authentication failed: invalid API key")]
    AuthenticationFailed,

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("API error (status {status}): {message}")]
    ApiError { status: u16, message: String },

    #[error("Request failed after {attempts} attempts: {last_error}")]
    MaxRetriesExceeded { attempts: u32, last_error: String },
}

/// Errors returned by the Argilla annotation server.
#[derive(Debug, Error)]
pub enum CurationError {
    #[error("Authentication failed against {api_url}")]
    Authentication { api_url: String },

    #[error("Workspace not found: {0}")]
    WorkspaceNotFound(String),

    #[error("Dataset '{0}' exists but could not be resolved")]
    DatasetNotResolved(String),

    #[error("API error (status {status}) on {endpoint}: {message}")]
    Api {
        endpoint: String,
        status: u16,
        message: String,
    },
}

impl PipelineError {
    /// Create an IO error with context.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::RateLimited { .. } | Self::Network(_) => true,
            Self::LlmApi(LlmApiError::ApiError { status, .. }) => *status >= 500,
            _ => false,
        }
    }

    /// Get retry delay hint in seconds, if applicable.
    pub fn retry_after(&self) -> Option<f64> {
        match self {
            Self::RateLimited { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        }
    }
}

/// Result type alias for prefclean.
pub type Result<T> = std::result::Result<T, PipelineError>;
