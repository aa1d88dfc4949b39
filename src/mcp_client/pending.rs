//! Outstanding-call table for one connection.
//!
//! Callers insert an entry before writing their request; the reader task
//! removes it when the matching response arrives; a timed-out caller removes
//! its own entry. When the transport closes, every remaining entry is failed
//! with `ConnectionLost` and the table refuses new entries.
//!
//! The lock is a `std::sync::Mutex` and is never held across an `.await`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use tokio::sync::oneshot;

use super::codec::Codec;
use super::errors::McpError;

/// Result delivered to a waiting caller.
pub type CallResult = Result<serde_json::Value, McpError>;

/// Collision retries when the id counter has wrapped onto a live id.
const MAX_ID_ATTEMPTS: usize = 16;

/// One in-flight request.
#[derive(Debug)]
pub struct OutstandingCall {
    pub id: u64,
    pub method: String,
    pub created_at: Instant,
    reply: oneshot::Sender<CallResult>,
}

/// A registered call: its id, the encoded line to send, and where the
/// result will arrive.
pub struct Registration {
    pub id: u64,
    pub line: Vec<u8>,
    pub receiver: oneshot::Receiver<CallResult>,
}

#[derive(Debug)]
struct Table {
    open: bool,
    calls: HashMap<u64, OutstandingCall>,
}

/// Shared handle to a connection's outstanding calls.
#[derive(Debug, Clone)]
pub struct PendingCalls {
    server: Arc<str>,
    table: Arc<Mutex<Table>>,
}

impl PendingCalls {
    pub fn new(server: &str) -> Self {
        Self {
            server: Arc::from(server),
            table: Arc::new(Mutex::new(Table {
                open: true,
                calls: HashMap::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Table> {
        // A panic while holding the lock cannot leave the map half-updated,
        // so a poisoned table is still usable.
        self.table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Encode a request and register it under a fresh id.
    ///
    /// Fails with `ConnectionLost` once the table has been closed.
    pub fn register(
        &self,
        codec: &Codec,
        method: &str,
        params: &serde_json::Value,
    ) -> Result<Registration, McpError> {
        for _ in 0..MAX_ID_ATTEMPTS {
            let (id, line) = codec.encode_request(method, params)?;
            let mut table = self.lock();
            if !table.open {
                return Err(McpError::ConnectionLost {
                    server: self.server.to_string(),
                });
            }
            if table.calls.contains_key(&id) {
                tracing::warn!(server = %self.server, id, "correlation id still in flight, skipping");
                continue;
            }
            let (reply, receiver) = oneshot::channel();
            table.calls.insert(
                id,
                OutstandingCall {
                    id,
                    method: method.to_string(),
                    created_at: Instant::now(),
                    reply,
                },
            );
            return Ok(Registration { id, line, receiver });
        }
        Err(McpError::InvalidRequest {
            reason: "no free correlation id".into(),
        })
    }

    /// Deliver a result to the call registered under `id`.
    ///
    /// Returns `false` when no such call is pending (late reply after a
    /// timeout, or an id the server made up).
    pub fn complete(&self, id: u64, result: CallResult) -> bool {
        let Some(call) = self.lock().calls.remove(&id) else {
            return false;
        };
        tracing::debug!(
            server = %self.server,
            id,
            method = %call.method,
            elapsed_ms = call.created_at.elapsed().as_millis() as u64,
            ok = result.is_ok(),
            "call completed"
        );
        // The receiver is gone only if the caller's future was dropped.
        let _ = call.reply.send(result);
        true
    }

    /// Remove a call without delivering anything (timeout or cancellation).
    pub fn remove(&self, id: u64) -> Option<OutstandingCall> {
        self.lock().calls.remove(&id)
    }

    /// Fail every outstanding call with `ConnectionLost` and refuse new ones.
    ///
    /// Returns how many calls were failed.
    pub fn close(&self) -> usize {
        let drained: Vec<OutstandingCall> = {
            let mut table = self.lock();
            table.open = false;
            table.calls.drain().map(|(_, call)| call).collect()
        };
        let count = drained.len();
        for call in drained {
            tracing::debug!(server = %self.server, id = call.id, method = %call.method, "failing call: connection lost");
            let _ = call.reply.send(Err(McpError::ConnectionLost {
                server: self.server.to_string(),
            }));
        }
        count
    }

    pub fn is_open(&self) -> bool {
        self.lock().open
    }

    /// Number of calls currently awaiting a response.
    pub fn len(&self) -> usize {
        self.lock().calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Removes a call from the table when the awaiting future is dropped,
/// whether it completed, timed out, or was cancelled.
pub struct PendingGuard<'a> {
    pending: &'a PendingCalls,
    id: u64,
}

impl<'a> PendingGuard<'a> {
    pub fn new(pending: &'a PendingCalls, id: u64) -> Self {
        Self { pending, id }
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(self.id);
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
