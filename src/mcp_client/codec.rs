//! JSON-RPC line codec.
//!
//! One encoded message per line, UTF-8. Correlation ids come from a counter
//! owned by the codec, and each connection owns exactly one codec, so ids
//! are unique for that connection's lifetime.

use std::sync::atomic::{AtomicU64, Ordering};

use super::errors::McpError;
use super::types::{JsonRpcNotification, JsonRpcRequest, RawEnvelope, JSONRPC_VERSION};

/// Largest id before the counter wraps (2^53 - 1, exact in every JSON
/// number implementation).
pub const MAX_CORRELATION_ID: u64 = (1 << 53) - 1;

/// Maximum number of characters of a bad line quoted in a decode error.
const EXCERPT_LEN: usize = 120;

/// A decoded incoming message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Server-initiated request (`id` set) or notification (`id` absent).
    Request {
        id: Option<u64>,
        method: String,
        params: Option<serde_json::Value>,
    },
    /// Successful response to one of our requests.
    Response {
        id: u64,
        result: serde_json::Value,
    },
    /// Error response; `id` is absent when the server could not read ours.
    Error {
        id: Option<u64>,
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },
}

/// Per-connection encoder/decoder with its own id counter.
#[derive(Debug)]
pub struct Codec {
    next_id: AtomicU64,
}

impl Default for Codec {
    fn default() -> Self {
        Self::new()
    }
}

impl Codec {
    /// Create a codec whose first id is 1.
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    /// Create a codec whose first id is `first` (clamped into the valid range).
    pub fn starting_at(first: u64) -> Self {
        let first = if first == 0 || first > MAX_CORRELATION_ID {
            1
        } else {
            first
        };
        Self {
            next_id: AtomicU64::new(first),
        }
    }

    /// Allocate the next correlation id, wrapping at [`MAX_CORRELATION_ID`].
    pub fn next_id(&self) -> u64 {
        let mut current = self.next_id.load(Ordering::Relaxed);
        loop {
            let following = if current >= MAX_CORRELATION_ID {
                1
            } else {
                current + 1
            };
            match self.next_id.compare_exchange_weak(
                current,
                following,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return current,
                Err(actual) => current = actual,
            }
        }
    }

    /// Encode a request, returning its correlation id and the line bytes
    /// (without the trailing newline).
    pub fn encode_request(
        &self,
        method: &str,
        params: &serde_json::Value,
    ) -> Result<(u64, Vec<u8>), McpError> {
        let id = self.next_id();
        let request = JsonRpcRequest::new(id, method, params);
        let bytes = serde_json::to_vec(&request).map_err(|e| McpError::Encode {
            reason: format!("failed to serialize '{method}' request: {e}"),
        })?;
        Ok((id, bytes))
    }

    /// Encode a notification (no id, no reply expected).
    pub fn encode_notification(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<Vec<u8>, McpError> {
        let notification = JsonRpcNotification::new(method, params);
        serde_json::to_vec(&notification).map_err(|e| McpError::Encode {
            reason: format!("failed to serialize '{method}' notification: {e}"),
        })
    }
}

/// Decode one line into a [`Message`].
///
/// Any line that is not a JSON-RPC 2.0 object of a known shape is a
/// `McpError::Decode`; the caller decides whether to skip it.
pub fn decode_message(line: &[u8]) -> Result<Message, McpError> {
    let envelope: RawEnvelope = serde_json::from_slice(line).map_err(|e| McpError::Decode {
        reason: format!("{e} in line: {}", excerpt(line)),
    })?;

    if envelope.jsonrpc != JSONRPC_VERSION {
        return Err(McpError::Decode {
            reason: format!("unsupported jsonrpc version '{}'", envelope.jsonrpc),
        });
    }

    if let Some(method) = envelope.method {
        return Ok(Message::Request {
            id: envelope.id,
            method,
            params: envelope.params,
        });
    }

    match (envelope.id, envelope.result, envelope.error) {
        (id, None, Some(err)) => Ok(Message::Error {
            id,
            code: err.code,
            message: err.message,
            data: err.data,
        }),
        (Some(id), Some(result), None) => Ok(Message::Response { id, result }),
        (None, Some(_), None) => Err(McpError::Decode {
            reason: "result envelope without id".into(),
        }),
        (_, Some(_), Some(_)) => Err(McpError::Decode {
            reason: "envelope carries both result and error".into(),
        }),
        (_, None, None) => Err(McpError::Decode {
            reason: format!("envelope has neither method, result nor error: {}", excerpt(line)),
        }),
    }
}

fn excerpt(line: &[u8]) -> String {
    let text = String::from_utf8_lossy(line);
    let mut out: String = text.chars().take(EXCERPT_LEN).collect();
    if text.chars().count() > EXCERPT_LEN {
        out.push_str("...");
    }
    out
}

// ─── Tests ───────────────────────────────────────────────────────────────────
