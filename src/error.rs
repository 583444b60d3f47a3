//! Error types for the relay

use serde::Serialize;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the relay
#[derive(Error, Debug)]
pub enum Error {
    /// HTTP request error
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error on the tool process pipes
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Error reported by the upstream chat API (status, body or mid-stream error)
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// Non-success HTTP status from the upstream API
    #[error("Upstream returned {status}: {body}")]
    UpstreamStatus { status: u16, body: String },

    /// The tool process is not connected or failed its handshake
    #[error("Tool unavailable: {0}")]
    ToolUnavailable(String),

    /// The tool process answered a call with a JSON-RPC error
    #[error("Tool execution error: {0}")]
    Tool(String),

    /// Tool-call arguments produced by the model were not valid JSON
    #[error("Invalid tool arguments: {0}")]
    InvalidArguments(String),

    /// Invalid input from the browser client
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The browser client went away while events were still being produced
    #[error("Client disconnected")]
    ClientDisconnected,

    /// Timeout error
    #[error("Request timeout: {0}")]
    Timeout(String),

    /// Other errors
    #[error("Error: {0}")]
    Other(String),
}

/// Machine-readable code attached to client-visible error events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Upstream,
    ToolUnavailable,
    ToolFailed,
    InvalidArguments,
    IterationLimit,
    Internal,
}

impl Error {
    /// Create a new config error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a new upstream error
    pub fn upstream(msg: impl Into<String>) -> Self {
        Error::Upstream(msg.into())
    }

    /// Create an error for a non-success upstream HTTP status
    pub fn upstream_status(status: u16, body: impl Into<String>) -> Self {
        Error::UpstreamStatus {
            status,
            body: body.into(),
        }
    }

    /// Create a new tool-unavailable error
    pub fn tool_unavailable(msg: impl Into<String>) -> Self {
        Error::ToolUnavailable(msg.into())
    }

    /// Create a new tool error
    pub fn tool(msg: impl Into<String>) -> Self {
        Error::Tool(msg.into())
    }

    /// Create a new invalid arguments error
    pub fn invalid_arguments(msg: impl Into<String>) -> Self {
        Error::InvalidArguments(msg.into())
    }

    /// Create a new invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Error::InvalidInput(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Error::Timeout(msg.into())
    }

    /// Create a new other error
    pub fn other(msg: impl Into<String>) -> Self {
        Error::Other(msg.into())
    }

    /// HTTP status carried by an upstream status error.
    pub fn upstream_http_status(&self) -> Option<u16> {
        match self {
            Error::UpstreamStatus { status, .. } => Some(*status),
            Error::Http(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    /// The error code reported to the browser when this error ends a run.
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Http(_) | Error::Upstream(_) | Error::UpstreamStatus { .. } => ErrorCode::Upstream,
            Error::ToolUnavailable(_) => ErrorCode::ToolUnavailable,
            Error::Tool(_) | Error::Timeout(_) => ErrorCode::ToolFailed,
            Error::InvalidArguments(_) => ErrorCode::InvalidArguments,
            Error::Json(_)
            | Error::Io(_)
            | Error::Config(_)
            | Error::InvalidInput(_)
            | Error::ClientDisconnected
            | Error::Other(_) => ErrorCode::Internal,
        }
    }
}
