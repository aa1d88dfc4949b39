//! MCP connection manager error types.
//!
//! Every failure a caller can observe is a distinct variant so that
//! recoverable conditions (a timeout) can be told apart from terminal ones
//! (the provider process died).

use thiserror::Error;

/// Errors that can occur while supervising MCP servers.
#[derive(Debug, Error)]
pub enum McpError {
    /// The server process could not be started (executable missing, not
    /// runnable, pipes unavailable).
    #[error("failed to spawn server '{server}': {reason}")]
    Spawn {
        server: String,
        reason: String,
    },

    /// The process's stdin is closed or its stdout reached end-of-stream.
    #[error("transport closed for server '{server}'")]
    TransportClosed {
        server: String,
    },

    /// The connection went away before a response arrived.
    #[error("connection to server '{server}' lost")]
    ConnectionLost {
        server: String,
    },

    /// A line could not be decoded as a JSON-RPC envelope.
    #[error("decode error: {reason}")]
    Decode {
        reason: String,
    },

    /// An outgoing message could not be serialized.
    #[error("encode error: {reason}")]
    Encode {
        reason: String,
    },

    /// No response arrived within the call's timeout.
    #[error("'{method}' on server '{server}' timed out after {timeout_ms}ms")]
    Timeout {
        server: String,
        method: String,
        timeout_ms: u64,
    },

    /// The provider answered with a JSON-RPC error envelope.
    #[error("remote error [{code}]: {message}")]
    Remote {
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// No supervisor is registered under this name.
    #[error("unknown server: '{name}'")]
    UnknownServer {
        name: String,
    },

    /// The server is registered but has no live connection.
    #[error("server '{server}' is not connected")]
    NotConnected {
        server: String,
    },

    /// The process started but the `initialize` handshake failed.
    #[error("server '{server}' initialization failed: {reason}")]
    InitFailed {
        server: String,
        reason: String,
    },

    /// The call itself is malformed (e.g. empty method name).
    #[error("invalid request: {reason}")]
    InvalidRequest {
        reason: String,
    },

    /// The process could not be stopped.
    #[error("failed to terminate server '{server}': {reason}")]
    Terminate {
        server: String,
        reason: String,
    },

    /// Configuration loading or validation error.
    #[error("config error: {reason}")]
    Config {
        reason: String,
    },
}

impl McpError {
    /// Whether retrying the same call on the same connection may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, McpError::Timeout { .. })
    }

    /// Whether this error means the connection itself is gone.
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            McpError::TransportClosed { .. }
                | McpError::ConnectionLost { .. }
                | McpError::Spawn { .. }
                | McpError::InitFailed { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_is_transient() {
        let err = McpError::Timeout {
            server: "github".into(),
            method: "tools/call".into(),
            timeout_ms: 500,
        };
        assert!(err.is_transient());
        assert!(!err.is_connection_failure());
        assert_eq!(
            err.to_string(),
            "'tools/call' on server 'github' timed out after 500ms"
        );
    }

    #[test]
    fn test_connection_lost_is_connection_failure() {
        let err = McpError::ConnectionLost {
            server: "slack".into(),
        };
        assert!(err.is_connection_failure());
        assert!(!err.is_transient());
    }

    #[test]
    fn test_remote_error_display() {
        let err = McpError::Remote {
            code: -32601,
            message: "Method not found".into(),
            data: None,
        };
        assert_eq!(err.to_string(), "remote error [-32601]: Method not found");
        assert!(!err.is_connection_failure());
    }
}
