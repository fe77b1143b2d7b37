//! Error types for legendary-mcp.

use thiserror::Error;

/// Result type for legendary-mcp operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for legendary-mcp.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Scope or role catalog failed validation.
    #[error("catalog error: {0}")]
    Catalog(String),

    /// Scope not present in the catalog.
    #[error("scope not found: {0}")]
    ScopeNotFound(String),

    /// Role not present in the catalog.
    #[error("role not found: {0}")]
    RoleNotFound(String),

    /// A tool with the same name is already registered.
    #[error("duplicate tool: {0}")]
    DuplicateTool(String),

    /// Tool not present in the registry.
    #[error("unknown tool: {0}")]
    ToolNotFound(String),

    /// Bearer token could not be verified or decoded.
    #[error("invalid token: {0}")]
    InvalidToken(String),

    /// Invalid parameters.
    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    /// Protocol error.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// External collaborator (issuer, analytics collector) is unreachable.
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Timeout.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Outbound HTTP error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl From<jsonwebtoken::errors::Error> for Error {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        Self::InvalidToken(err.to_string())
    }
}
