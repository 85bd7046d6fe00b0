//! Muninn error types

use std::time::Duration;

/// Muninn error types
#[derive(Debug, thiserror::Error)]
pub enum MuninnError {
    // Backend errors
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("redis error: {0}")]
    Redis(String),

    // Pool errors
    /// The database pool is degraded (never initialized) or closed.
    #[error("database pool not available")]
    PoolUnavailable,

    /// A newly opened session was already closed by the server.
    #[error("connection is closed")]
    ConnectionClosed,

    #[error("database error: {0}")]
    Database(String),

    #[error("api client not available: {0}")]
    ClientUnavailable(&'static str),

    // External API errors
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    // Data errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Both the text and the binary codec rejected a value.
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Configuration errors
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A spawned task failed to complete (panic or cancellation).
    #[error("task failed: {0}")]
    Task(String),
}

impl MuninnError {
    /// Whether retrying the same request may succeed.
    ///
    /// Rate limits, server-side 5xx failures, request timeouts and
    /// transport-level errors are transient. Everything else is permanent.
    pub fn is_transient(&self) -> bool {
        match self {
            MuninnError::RateLimited { .. } | MuninnError::Http(_) => true,
            MuninnError::Api { status, .. } => *status == 408 || *status >= 500,
            _ => false,
        }
    }

    /// Provider-supplied retry hint, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            MuninnError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

impl From<redis::RedisError> for MuninnError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_connection_refusal() || err.is_timeout() || err.is_connection_dropped() {
            MuninnError::BackendUnavailable(err.to_string())
        } else {
            MuninnError::Redis(err.to_string())
        }
    }
}

impl From<sqlx::Error> for MuninnError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolClosed | sqlx::Error::PoolTimedOut => MuninnError::PoolUnavailable,
            other => MuninnError::Database(other.to_string()),
        }
    }
}

impl From<reqwest::Error> for MuninnError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) if status.as_u16() == 429 => MuninnError::RateLimited { retry_after: None },
            Some(status) => MuninnError::Api {
                status: status.as_u16(),
                message: err.to_string(),
            },
            None => MuninnError::Http(err.to_string()),
        }
    }
}

impl From<tokio::task::JoinError> for MuninnError {
    fn from(err: tokio::task::JoinError) -> Self {
        MuninnError::Task(err.to_string())
    }
}

/// Result type alias for Muninn operations
pub type Result<T> = std::result::Result<T, MuninnError>;
