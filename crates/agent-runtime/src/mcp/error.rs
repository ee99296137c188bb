//! Error types for the MCP client

use std::time::Duration;

use thiserror::Error;

/// Result type alias for MCP operations
pub type Result<T> = std::result::Result<T, McpError>;

/// Errors that can occur when talking to an MCP tool provider
#[derive(Error, Debug)]
pub enum McpError {
    #[error("Tool provider misconfigured: {0}")]
    Config(String),

    #[error("Failed to spawn tool provider '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Handshake with tool provider failed: {0}")]
    Handshake(String),

    #[error("Tool discovery failed: {0}")]
    Discovery(String),

    #[error("JSON-RPC error (code {code}): {message}")]
    Rpc { code: i64, message: String },

    #[error("'{method}' timed out after {after:?}")]
    Timeout { method: String, after: Duration },

    #[error("Connection to tool provider is closed")]
    Closed,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl McpError {
    /// Whether the failure happened before or during connection setup
    pub const fn is_connection_failure(&self) -> bool {
        matches!(self, McpError::Spawn { .. } | McpError::Handshake(_))
    }
}
