//! Model errors

use thiserror::Error;

/// Errors produced while parsing or validating model types
#[derive(Debug, Error)]
pub enum ModelError {
    /// Malformed peer key
    #[error("invalid peer key: {0}")]
    InvalidKey(String),

    /// Malformed CIDR prefix
    #[error("invalid prefix '{prefix}': {reason}")]
    InvalidPrefix { prefix: String, reason: String },

    /// Malformed STUN/TURN URI
    #[error("invalid ICE uri '{0}'")]
    InvalidUri(String),

    /// Malformed route entry
    #[error("invalid route: {0}")]
    InvalidRoute(String),

    /// Unknown protocol in a forwarding rule
    #[error("unknown protocol '{0}' in forwarding rule")]
    UnknownProtocol(String),
}

/// Result type for model operations
pub type ModelResult<T> = Result<T, ModelError>;
