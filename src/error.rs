use thiserror::Error;

use crate::models::{ProxyId, ProxyState};

/// Unified error type for proxy-boost
#[derive(Error, Debug)]
pub enum BoostError {
    // Proxy errors
    #[error("No proxies available")]
    NoProxyAvailable,

    #[error("Proxy connection failed: {0}")]
    ProxyConnectionFailed(String),

    #[error("Invalid proxy address: {0}")]
    InvalidProxyAddress(String),

    #[error("Unsupported proxy protocol: {0}")]
    UnsupportedProtocol(String),

    #[error("Proxy {id} cannot {operation} while {state}")]
    InvalidTransition {
        id: ProxyId,
        state: ProxyState,
        operation: &'static str,
    },

    #[error("Proxy not found: {id}")]
    ProxyNotFound { id: ProxyId },

    // Feed errors
    #[error("Feed {feed} failed: {reason}")]
    Feed { feed: String, reason: String },

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Request errors
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Operation timed out")]
    Timeout,

    #[error("Operation cancelled")]
    Cancelled,

    // I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // HTTP errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Malformed response: {0}")]
    Json(#[from] serde_json::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for proxy-boost operations
pub type Result<T> = std::result::Result<T, BoostError>;

impl BoostError {
    /// Errors that only cost one iteration: the proxy is demoted and the work retried.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BoostError::NoProxyAvailable
                | BoostError::ProxyConnectionFailed(_)
                | BoostError::Timeout
                | BoostError::Io(_)
                | BoostError::Http(_)
                | BoostError::Feed { .. }
                | BoostError::Json(_)
        )
    }

    /// Errors that abort a run instead of being contained by a worker.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BoostError::InvalidConfig(_)
                | BoostError::InvalidTransition { .. }
                | BoostError::ProxyNotFound { .. }
                | BoostError::Internal(_)
        )
    }
}

impl From<url::ParseError> for BoostError {
    fn from(err: url::ParseError) -> Self {
        BoostError::InvalidRequest(err.to_string())
    }
}

impl From<tokio::task::JoinError> for BoostError {
    fn from(err: tokio::task::JoinError) -> Self {
        BoostError::Internal(format!("worker task failed: {}", err))
    }
}
