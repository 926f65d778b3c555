//! Error types for the proxy.

use portal5_core::protocol::ProtocolError;
use thiserror::Error;

/// Proxy error type.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The upstream fetch failed.
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// The intercepted request could not be turned into an outbound one.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// A header value could not be encoded.
    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    /// JSON encoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Session envelope error.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Result type for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;
