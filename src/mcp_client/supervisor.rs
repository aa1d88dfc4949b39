//! Connection supervisor — one per known server.
//!
//! Owns the server's connection through its whole lifecycle:
//!
//! ```text
//! Idle ──connect()──▶ Connecting ──spawn + handshake ok──▶ Connected
//!                         │                                    │
//!                         └── spawn/handshake fails ──┐        ├── stdout EOF
//!                                                     ▼        ▼
//!                                                  Disconnected ◀── shutdown()
//! ```
//!
//! `Disconnected` is terminal for that connection; `connect()` from there
//! builds a brand-new one. The supervisor never reconnects by itself.
//!
//! Each connection has a single reader task that demultiplexes responses
//! by correlation id, so any number of calls may be outstanding at once and
//! may complete in any order.

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::task::JoinHandle;

use super::codec::{decode_message, Codec, Message};
use super::errors::McpError;
use super::pending::{PendingCalls, PendingGuard};
use super::transport::{format_stderr_suffix, LineReader, LineWriter, ProcessHandle, Transport};
use super::types::{ConnectionState, InitializeResult, ServerDefinition, ServerStatus};

/// MCP protocol revision advertised in the `initialize` handshake.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Timeouts and handshake policy for one supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorSettings {
    /// Default bound for `call()` when the caller gives none.
    pub call_timeout: Duration,
    /// Bound for spawn + `initialize` handshake.
    pub connect_timeout: Duration,
    /// How long a process gets to exit after SIGTERM before it is killed.
    pub shutdown_grace: Duration,
    /// Whether to run the MCP `initialize` handshake after spawning.
    pub handshake: bool,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(5),
            handshake: true,
        }
    }
}

// ─── Connection ──────────────────────────────────────────────────────────────

/// A live binding between a definition and a running process.
struct Connection {
    server: String,
    codec: Codec,
    writer: tokio::sync::Mutex<LineWriter>,
    pending: PendingCalls,
    process: tokio::sync::Mutex<ProcessHandle>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    /// Send a request and wait for its correlated response.
    async fn request(
        &self,
        method: &str,
        params: &serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value, McpError> {
        let registration = self.pending.register(&self.codec, method, params)?;
        let id = registration.id;
        let _guard = PendingGuard::new(&self.pending, id);

        tracing::debug!(server = %self.server, id, method, "sending request");

        // The deadline covers waiting for the writer, the write itself and
        // the reply. A provider that stops reading stdin stalls the write.
        let deadline = tokio::time::Instant::now() + timeout;
        let line = registration.line;
        let written = tokio::time::timeout_at(deadline, async {
            // One full line per lock hold; readers are unaffected.
            self.writer.lock().await.write_line(&line).await
        })
        .await;
        match written {
            Ok(Ok(())) => {}
            Ok(Err(McpError::TransportClosed { server })) => {
                return Err(McpError::ConnectionLost { server });
            }
            Ok(Err(other)) => return Err(other),
            Err(_) => {
                tracing::warn!(server = %self.server, id, method, "request write stalled");
                return Err(self.timed_out(method, timeout));
            }
        }

        let mut receiver = registration.receiver;
        match tokio::time::timeout_at(deadline, &mut receiver).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(McpError::ConnectionLost {
                server: self.server.clone(),
            }),
            Err(_) => {
                if self.pending.remove(id).is_none() {
                    // The reader claimed the entry right at the deadline.
                    if let Ok(result) = receiver.try_recv() {
                        return result;
                    }
                }
                tracing::warn!(
                    server = %self.server,
                    id,
                    method,
                    timeout_ms = timeout.as_millis() as u64,
                    "request timed out"
                );
                Err(self.timed_out(method, timeout))
            }
        }
    }

    fn timed_out(&self, method: &str, timeout: Duration) -> McpError {
        McpError::Timeout {
            server: self.server.clone(),
            method: method.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    /// Close stdin unless a stalled write holds it; that write fails on its
    /// own once the process is gone.
    fn close_writer(&self) {
        if let Ok(mut writer) = self.writer.try_lock() {
            writer.close();
        }
    }

    /// Send a notification (no response expected).
    async fn notify(&self, method: &str, params: Option<serde_json::Value>) -> Result<(), McpError> {
        let line = self.codec.encode_notification(method, params)?;
        self.writer.lock().await.write_line(&line).await
    }

    /// MCP `initialize` request followed by `notifications/initialized`.
    async fn handshake(&self, timeout: Duration) -> Result<(), McpError> {
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
            },
        });
        let result = self.request("initialize", &params, timeout).await?;

        match serde_json::from_value::<InitializeResult>(result) {
            Ok(init) => tracing::info!(
                server = %self.server,
                protocol = ?init.protocol_version,
                server_name = ?init.server_info.as_ref().and_then(|i| i.name.clone()),
                server_version = ?init.server_info.as_ref().and_then(|i| i.version.clone()),
                "server initialized"
            ),
            Err(e) => tracing::debug!(server = %self.server, error = %e, "unrecognized initialize result"),
        }

        self.notify("notifications/initialized", None).await
    }

    async fn stderr_tail(&self) -> String {
        self.process.lock().await.stderr_tail()
    }

    /// Fail outstanding calls, stop the process, close stdin, stop reading.
    async fn close(&self, grace: Duration) -> Result<(), McpError> {
        let failed = self.pending.close();
        if failed > 0 {
            tracing::info!(server = %self.server, failed_calls = failed, "failed outstanding calls on close");
        }
        self.close_writer();
        let terminated = self.process.lock().await.terminate(grace).await;
        self.close_writer();
        // A grandchild may still hold stdout open; stop reading regardless.
        if let Some(task) = lock(&self.reader_task).take() {
            task.abort();
        }
        terminated
    }
}

// ─── Reader ──────────────────────────────────────────────────────────────────

/// Route one decoded line to its waiting caller.
fn dispatch(server: &str, pending: &PendingCalls, line: &[u8]) {
    match decode_message(line) {
        Ok(Message::Response { id, result }) => {
            if !pending.complete(id, Ok(result)) {
                tracing::debug!(server, id, "discarding response with no pending call");
            }
        }
        Ok(Message::Error {
            id: Some(id),
            code,
            message,
            data,
        }) => {
            let err = McpError::Remote { code, message, data };
            if !pending.complete(id, Err(err)) {
                tracing::debug!(server, id, "discarding error response with no pending call");
            }
        }
        Ok(Message::Error { id: None, code, message, .. }) => {
            tracing::warn!(server, code, %message, "server reported an error without an id");
        }
        Ok(Message::Request { id, method, .. }) => {
            tracing::debug!(server, ?id, %method, "ignoring server-initiated message");
        }
        Err(e) => {
            tracing::warn!(server, error = %e, "skipping undecodable line");
        }
    }
}

/// Read until end-of-stream, then fail pending calls and mark the
/// connection lost.
async fn read_loop(
    server: String,
    mut reader: LineReader,
    pending: PendingCalls,
    on_close: CloseHook,
) {
    loop {
        let line = match reader.read_line().await {
            Ok(line) => line,
            // Oversized line, already skipped by the reader.
            Err(McpError::Decode { .. }) => continue,
            Err(_) => break,
        };
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        dispatch(&server, &pending, &line);
    }

    let failed = pending.close();
    tracing::info!(server = %server, failed_calls = failed, "server output closed");
    on_close.run().await;
}

/// What the reader does once the stream ends: move its own connection (and
/// only its own, identified by generation) to `Disconnected` and reap the
/// process.
struct CloseHook {
    shared: Weak<Mutex<Shared>>,
    generation: u64,
    grace: Duration,
}

impl CloseHook {
    async fn run(self) {
        // The supervisor is gone; dropping it already killed the process.
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let connection = {
            let mut shared = lock(&shared);
            if shared.generation == self.generation
                && matches!(
                    shared.state,
                    ConnectionState::Connecting | ConnectionState::Connected
                )
            {
                shared.state = ConnectionState::Disconnected;
                shared.last_error = Some("transport closed: server process exited".into());
                shared.connected_at = None;
                shared.connection.take()
            } else {
                None
            }
        };

        if let Some(connection) = connection {
            tracing::warn!(server = %connection.server, "connection lost");
            connection.close_writer();
            if let Err(e) = connection.process.lock().await.terminate(self.grace).await {
                tracing::warn!(server = %connection.server, error = %e, "failed to reap server process");
            }
            connection.close_writer();
        }
    }
}

// ─── Supervisor ──────────────────────────────────────────────────────────────

/// Outcome of storing a freshly spawned connection.
enum Attach {
    Attached,
    /// A newer connect or a shutdown happened meanwhile.
    Superseded,
    /// The process already exited and the reader closed the attempt.
    Exited,
}

/// Mutable state shared between the supervisor and its reader task.
struct Shared {
    state: ConnectionState,
    connection: Option<Arc<Connection>>,
    last_error: Option<String>,
    connected_at: Option<DateTime<Utc>>,
    /// Incremented on every connect attempt so a stale reader cannot touch a
    /// newer connection.
    generation: u64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Supervises the connection to one server.
pub struct Supervisor {
    definition: Arc<ServerDefinition>,
    settings: SupervisorSettings,
    shared: Arc<Mutex<Shared>>,
}

impl Supervisor {
    /// Create an `Idle` supervisor. Nothing is spawned until `connect()`.
    pub fn new(definition: Arc<ServerDefinition>, settings: SupervisorSettings) -> Self {
        Self {
            definition,
            settings,
            shared: Arc::new(Mutex::new(Shared {
                state: ConnectionState::Idle,
                connection: None,
                last_error: None,
                connected_at: None,
                generation: 0,
            })),
        }
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn definition(&self) -> &ServerDefinition {
        &self.definition
    }

    pub fn settings(&self) -> SupervisorSettings {
        self.settings
    }

    pub fn state(&self) -> ConnectionState {
        lock(&self.shared).state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Error that caused the last transition to `Disconnected`, if any.
    pub fn last_error(&self) -> Option<String> {
        lock(&self.shared).last_error.clone()
    }

    /// Number of calls currently awaiting a response.
    pub fn pending_calls(&self) -> usize {
        lock(&self.shared)
            .connection
            .as_ref()
            .map_or(0, |c| c.pending.len())
    }

    pub fn status(&self) -> ServerStatus {
        let shared = lock(&self.shared);
        ServerStatus {
            name: self.definition.name.clone(),
            state: shared.state,
            pending_calls: shared.connection.as_ref().map_or(0, |c| c.pending.len()),
            last_error: shared.last_error.clone(),
            connected_at: shared.connected_at,
        }
    }

    /// Spawn the server and, if enabled, run the `initialize` handshake.
    ///
    /// A no-op while `Connecting` or `Connected`. From `Idle` or
    /// `Disconnected` a fresh connection is built. Failures leave the
    /// supervisor `Disconnected` with the error recorded; nothing is retried.
    pub async fn connect(&self) -> Result<(), McpError> {
        let name = self.definition.name.clone();

        let generation = {
            let mut shared = lock(&self.shared);
            if matches!(
                shared.state,
                ConnectionState::Connecting | ConnectionState::Connected
            ) {
                tracing::debug!(server = %name, state = %shared.state, "connect ignored");
                return Ok(());
            }
            shared.state = ConnectionState::Connecting;
            shared.last_error = None;
            shared.generation += 1;
            shared.generation
        };

        tracing::info!(server = %name, generation, "connecting to MCP server");

        let transport = match Transport::spawn(&self.definition) {
            Ok(transport) => transport,
            Err(e) => {
                tracing::error!(server = %name, error = %e, "spawn failed");
                self.record_failure(generation, &e);
                return Err(e);
            }
        };

        let connection = self.start_connection(transport, generation);

        let attached = {
            let mut shared = lock(&self.shared);
            if shared.generation != generation {
                Attach::Superseded
            } else if shared.state != ConnectionState::Connecting {
                Attach::Exited
            } else {
                shared.connection = Some(Arc::clone(&connection));
                Attach::Attached
            }
        };
        match attached {
            Attach::Attached => {}
            Attach::Superseded => {
                let _ = connection.close(self.settings.shutdown_grace).await;
                return Err(McpError::ConnectionLost { server: name });
            }
            Attach::Exited => {
                // The reader saw end-of-stream before the connection was stored.
                let stderr = connection.stderr_tail().await;
                let _ = connection.close(self.settings.shutdown_grace).await;
                let err = McpError::InitFailed {
                    server: name.clone(),
                    reason: format!("server exited during startup{}", format_stderr_suffix(&stderr)),
                };
                self.record_failure(generation, &err);
                return Err(err);
            }
        }

        if self.settings.handshake {
            let timeout = self.settings.connect_timeout;
            let outcome = match tokio::time::timeout(timeout, connection.handshake(timeout)).await {
                Ok(result) => result,
                Err(_) => Err(McpError::Timeout {
                    server: name.clone(),
                    method: "initialize".into(),
                    timeout_ms: timeout.as_millis() as u64,
                }),
            };
            if let Err(e) = outcome {
                let stderr = connection.stderr_tail().await;
                let err = McpError::InitFailed {
                    server: name.clone(),
                    reason: format!("{e}{}", format_stderr_suffix(&stderr)),
                };
                tracing::error!(server = %name, error = %err, "handshake failed");
                self.record_failure(generation, &err);
                if let Err(close_err) = connection.close(self.settings.shutdown_grace).await {
                    tracing::warn!(server = %name, error = %close_err, "cleanup after failed handshake");
                }
                return Err(err);
            }
        }

        let mut shared = lock(&self.shared);
        if shared.generation != generation || shared.state != ConnectionState::Connecting {
            // Shut down or lost while the handshake was in flight.
            return Err(McpError::ConnectionLost { server: name });
        }
        shared.state = ConnectionState::Connected;
        shared.connected_at = Some(Utc::now());
        tracing::info!(server = %name, "connected");
        Ok(())
    }

    fn start_connection(&self, transport: Transport, generation: u64) -> Arc<Connection> {
        let name = self.definition.name.clone();
        let (writer, reader, process) = transport.into_parts();
        let pending = PendingCalls::new(&name);

        let connection = Arc::new(Connection {
            server: name.clone(),
            codec: Codec::new(),
            writer: tokio::sync::Mutex::new(writer),
            pending: pending.clone(),
            process: tokio::sync::Mutex::new(process),
            reader_task: Mutex::new(None),
        });

        let hook = CloseHook {
            shared: Arc::downgrade(&self.shared),
            generation,
            grace: self.settings.shutdown_grace,
        };
        let task = tokio::spawn(read_loop(name, reader, pending, hook));
        *lock(&connection.reader_task) = Some(task);
        connection
    }

    fn record_failure(&self, generation: u64, err: &McpError) {
        let mut shared = lock(&self.shared);
        if shared.generation != generation {
            return;
        }
        shared.last_error = Some(err.to_string());
        if shared.state == ConnectionState::Connecting {
            shared.state = ConnectionState::Disconnected;
            shared.connection = None;
            shared.connected_at = None;
        }
    }

    /// Call `method` and wait for its result.
    ///
    /// Fails immediately with `NotConnected` unless `Connected`. `timeout`
    /// defaults to the supervisor's call timeout. The request is not
    /// cancelled remotely on timeout; a late reply is discarded.
    pub async fn call(
        &self,
        method: &str,
        params: serde_json::Value,
        timeout: Option<Duration>,
    ) -> Result<serde_json::Value, McpError> {
        if method.trim().is_empty() {
            return Err(McpError::InvalidRequest {
                reason: "method name must not be empty".into(),
            });
        }

        let connection = {
            let shared = lock(&self.shared);
            match (&shared.state, &shared.connection) {
                (ConnectionState::Connected, Some(connection)) => Arc::clone(connection),
                _ => {
                    return Err(McpError::NotConnected {
                        server: self.definition.name.clone(),
                    })
                }
            }
        };

        connection
            .request(method, &params, timeout.unwrap_or(self.settings.call_timeout))
            .await
    }

    /// Stop the server. Best effort: the supervisor always ends up
    /// `Disconnected`; a returned error only reports that the process could
    /// not be killed cleanly.
    pub async fn shutdown(&self) -> Result<(), McpError> {
        let connection = {
            let mut shared = lock(&self.shared);
            match shared.state {
                ConnectionState::Idle | ConnectionState::Disconnected => return Ok(()),
                ConnectionState::Connecting | ConnectionState::Connected => {}
            }
            shared.state = ConnectionState::Disconnected;
            shared.connected_at = None;
            shared.connection.take()
        };

        tracing::info!(server = %self.definition.name, "shutting down");
        match connection {
            Some(connection) => connection.close(self.settings.shutdown_grace).await,
            None => Ok(()),
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
