//! Line-framed stdio transport over an MCP server child process.
//!
//! Handles low-level communication with one server process:
//! - Writing one encoded message per line to stdin
//! - Reading one line at a time from stdout (EOF means the process is gone)
//! - Draining stderr into the log, keeping a short tail for diagnostics
//! - Terminating the process: close stdin, SIGTERM, grace period, SIGKILL

use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};

use super::errors::McpError;
use super::types::ServerDefinition;

/// Number of stderr lines retained for error context.
const STDERR_TAIL_LINES: usize = 20;

/// Maximum characters of stderr attached to an error message.
const STDERR_TAIL_CHARS: usize = 2000;

/// Longest stdout line accepted, terminator included. Longer lines are
/// dropped up to the next newline.
pub const MAX_LINE_BYTES: usize = 16 * 1024 * 1024;

// ─── Transport ───────────────────────────────────────────────────────────────

/// A spawned server process with its stdio pipes.
///
/// Use [`Transport::into_parts`] to hand the write side, the read side and
/// the process handle to different owners.
pub struct Transport {
    writer: LineWriter,
    reader: LineReader,
    process: ProcessHandle,
}

impl Transport {
    /// Spawn the server described by `definition`.
    ///
    /// The command and arguments are passed as a discrete list (no shell).
    /// The environment overlay is applied on top of the inherited
    /// environment. Must be called from within a Tokio runtime.
    pub fn spawn(definition: &ServerDefinition) -> Result<Self, McpError> {
        let name = definition.name.as_str();

        let mut cmd = Command::new(&definition.command);
        cmd.args(&definition.args);
        for (key, value) in &definition.env {
            cmd.env(key, value);
        }
        if let Some(dir) = &definition.cwd {
            cmd.current_dir(dir);
        }

        // Windows: prevent console window from appearing for child processes
        #[cfg(target_os = "windows")]
        {
            const CREATE_NO_WINDOW: u32 = 0x08000000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| McpError::Spawn {
            server: name.to_string(),
            reason: format!("{}: {e}", definition.command),
        })?;

        let stdin = child.stdin.take().ok_or_else(|| McpError::Spawn {
            server: name.to_string(),
            reason: "failed to capture stdin".into(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| McpError::Spawn {
            server: name.to_string(),
            reason: "failed to capture stdout".into(),
        })?;
        let stderr_tail = StderrTail::default();
        if let Some(stderr) = child.stderr.take() {
            drain_stderr(name.to_string(), stderr, stderr_tail.clone());
        }

        tracing::info!(
            server = name,
            pid = ?child.id(),
            command = %definition.display_command(),
            env_keys = ?definition.env.keys().collect::<Vec<_>>(),
            "spawned MCP server process"
        );

        Ok(Self {
            writer: LineWriter {
                server: name.to_string(),
                stdin: Some(stdin),
                torn: false,
            },
            reader: LineReader {
                server: name.to_string(),
                inner: BufReader::new(stdout),
                buf: Vec::new(),
                max_line: MAX_LINE_BYTES,
            },
            process: ProcessHandle {
                server: name.to_string(),
                child,
                stderr_tail,
            },
        })
    }

    /// OS process id, while the process has not been reaped.
    pub fn pid(&self) -> Option<u32> {
        self.process.pid()
    }

    /// Write one message line. See [`LineWriter::write_line`].
    pub async fn write_line(&mut self, bytes: &[u8]) -> Result<(), McpError> {
        self.writer.write_line(bytes).await
    }

    /// Read one message line. See [`LineReader::read_line`].
    pub async fn read_line(&mut self) -> Result<Vec<u8>, McpError> {
        self.reader.read_line().await
    }

    /// Close stdin and stop the process. See [`ProcessHandle::terminate`].
    pub async fn terminate(&mut self, grace: Duration) -> Result<(), McpError> {
        self.writer.close();
        self.process.terminate(grace).await
    }

    /// Split into independently owned write side, read side and process.
    pub fn into_parts(self) -> (LineWriter, LineReader, ProcessHandle) {
        (self.writer, self.reader, self.process)
    }
}

// ─── Write Side ──────────────────────────────────────────────────────────────

/// Write half: the child's stdin.
pub struct LineWriter {
    server: String,
    stdin: Option<ChildStdin>,
    /// Set while a frame is being written. Still set on entry means the
    /// previous write was cancelled mid-frame.
    torn: bool,
}

impl LineWriter {
    /// Write `bytes` followed by a newline, then flush.
    ///
    /// Fails with `TransportClosed` once stdin is closed or the process has
    /// gone away; after the first failure the writer stays closed.
    ///
    /// Cancelling the returned future part way through leaves a partial
    /// frame on the pipe. The next call then closes stdin instead of
    /// appending to it.
    pub async fn write_line(&mut self, bytes: &[u8]) -> Result<(), McpError> {
        if bytes.contains(&b'\n') {
            return Err(McpError::Encode {
                reason: "message contains an embedded newline".into(),
            });
        }

        if self.torn && self.stdin.is_some() {
            tracing::warn!(server = %self.server, "previous write was interrupted, closing stdin");
            self.stdin = None;
        }

        let stdin = self.stdin.as_mut().ok_or_else(|| McpError::TransportClosed {
            server: self.server.clone(),
        })?;

        let mut frame = Vec::with_capacity(bytes.len() + 1);
        frame.extend_from_slice(bytes);
        frame.push(b'\n');

        self.torn = true;
        let written = match stdin.write_all(&frame).await {
            Ok(()) => stdin.flush().await,
            Err(e) => Err(e),
        };
        self.torn = false;
        if let Err(e) = written {
            tracing::debug!(server = %self.server, error = %e, "stdin write failed");
            self.stdin = None;
            return Err(McpError::TransportClosed {
                server: self.server.clone(),
            });
        }
        Ok(())
    }

    /// Close stdin (the provider sees EOF). Idempotent.
    pub fn close(&mut self) {
        self.stdin = None;
    }

    pub fn is_closed(&self) -> bool {
        self.stdin.is_none()
    }
}

// ─── Read Side ───────────────────────────────────────────────────────────────

/// Read half: the child's stdout.
pub struct LineReader {
    server: String,
    inner: BufReader<ChildStdout>,
    buf: Vec<u8>,
    max_line: usize,
}

impl LineReader {
    /// Read the next line, without its `\n` / `\r\n` terminator.
    ///
    /// End-of-stream (process exited or closed stdout) and read errors both
    /// surface as `TransportClosed`. A line longer than [`MAX_LINE_BYTES`]
    /// is discarded through its newline and reported as `Decode`; the next
    /// call starts on the following line.
    pub async fn read_line(&mut self) -> Result<Vec<u8>, McpError> {
        self.buf.clear();
        let mut oversized = 0usize;

        loop {
            let available = match self.inner.fill_buf().await {
                Ok(available) => available,
                Err(e) => {
                    tracing::debug!(server = %self.server, error = %e, "stdout read failed");
                    return Err(McpError::TransportClosed {
                        server: self.server.clone(),
                    });
                }
            };
            if available.is_empty() {
                if self.buf.is_empty() && oversized == 0 {
                    return Err(McpError::TransportClosed {
                        server: self.server.clone(),
                    });
                }
                break;
            }

            let (used, done) = match available.iter().position(|b| *b == b'\n') {
                Some(i) => (i + 1, true),
                None => (available.len(), false),
            };
            if oversized > 0 {
                oversized += used;
            } else if self.buf.len() + used > self.max_line {
                oversized = self.buf.len() + used;
                self.buf.clear();
            } else {
                self.buf.extend_from_slice(&available[..used]);
            }
            self.inner.consume(used);
            if done {
                break;
            }
        }

        if oversized > 0 {
            tracing::warn!(server = %self.server, bytes = oversized, limit = self.max_line, "dropped oversized line");
            return Err(McpError::Decode {
                reason: format!("line of {oversized} bytes exceeds the {} byte limit", self.max_line),
            });
        }

        if self.buf.last() == Some(&b'\n') {
            self.buf.pop();
        }
        if self.buf.last() == Some(&b'\r') {
            self.buf.pop();
        }
        Ok(std::mem::take(&mut self.buf))
    }
}

// ─── Process ─────────────────────────────────────────────────────────────────

/// Owns the child process. Dropping it kills the process (`kill_on_drop`).
pub struct ProcessHandle {
    server: String,
    child: Child,
    stderr_tail: StderrTail,
}

impl ProcessHandle {
    /// OS process id, while the process has not been reaped.
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Last lines the process wrote to stderr, joined and truncated.
    pub fn stderr_tail(&self) -> String {
        self.stderr_tail.snapshot()
    }

    /// Stop the process and reap it.
    ///
    /// Sends SIGTERM (unix), waits up to `grace`, then force-kills. When this
    /// returns `Ok` the process no longer exists. Calling it again is a no-op.
    pub async fn terminate(&mut self, grace: Duration) -> Result<(), McpError> {
        if let Ok(Some(status)) = self.child.try_wait() {
            tracing::debug!(server = %self.server, %status, "process already exited");
            return Ok(());
        }

        let pid = self.child.id();
        send_graceful_stop(&mut self.child, pid);

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!(server = %self.server, ?pid, %status, "server process exited");
                return Ok(());
            }
            Ok(Err(e)) => {
                tracing::warn!(server = %self.server, error = %e, "error waiting for server process");
            }
            Err(_) => {
                tracing::warn!(
                    server = %self.server,
                    ?pid,
                    grace_ms = grace.as_millis() as u64,
                    "server did not exit within grace period, killing"
                );
            }
        }

        self.child.kill().await.map_err(|e| McpError::Terminate {
            server: self.server.clone(),
            reason: format!("force kill failed: {e}"),
        })?;
        tracing::info!(server = %self.server, ?pid, "server process killed");
        Ok(())
    }
}

#[cfg(unix)]
fn send_graceful_stop(_child: &mut Child, pid: Option<u32>) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(raw) = pid.and_then(|p| i32::try_from(p).ok()) else {
        return;
    };
    if let Err(e) = kill(Pid::from_raw(raw), Signal::SIGTERM) {
        tracing::debug!(pid = raw, error = %e, "SIGTERM failed");
    }
}

#[cfg(not(unix))]
fn send_graceful_stop(child: &mut Child, _pid: Option<u32>) {
    // No graceful signal on this platform; closing stdin is the only hint.
    let _ = child.start_kill();
}

// ─── Stderr ──────────────────────────────────────────────────────────────────

/// Bounded ring of the most recent stderr lines.
#[derive(Clone, Default)]
struct StderrTail {
    lines: Arc<Mutex<VecDeque<String>>>,
}

impl StderrTail {
    fn push(&self, line: String) {
        if let Ok(mut lines) = self.lines.lock() {
            if lines.len() == STDERR_TAIL_LINES {
                lines.pop_front();
            }
            lines.push_back(line);
        }
    }

    fn snapshot(&self) -> String {
        let Ok(lines) = self.lines.lock() else {
            return String::new();
        };
        let mut joined = lines.iter().cloned().collect::<Vec<_>>().join("\n");
        if joined.len() > STDERR_TAIL_CHARS {
            let mut cut = STDERR_TAIL_CHARS;
            while !joined.is_char_boundary(cut) {
                cut -= 1;
            }
            joined.truncate(cut);
            joined.push_str("...(truncated)");
        }
        joined
    }
}

/// Forward stderr lines to the log so the pipe never fills up.
fn drain_stderr(server: String, stderr: ChildStderr, tail: StderrTail) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let trimmed = line.trim_end();
                    if !trimmed.is_empty() {
                        tracing::debug!(server = %server, "stderr: {trimmed}");
                        tail.push(trimmed.to_string());
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(server = %server, error = %e, "stderr read failed");
                    break;
                }
            }
        }
    });
}

/// Format a stderr suffix for error messages (empty string if no stderr).
pub fn format_stderr_suffix(stderr: &str) -> String {
    if stderr.is_empty() {
        String::new()
    } else {
        format!(" | stderr: {}", stderr.trim())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(name: &str, script: &str) -> ServerDefinition {
        ServerDefinition::new(name, "sh", &["-c", script])
    }

    fn process_exists(pid: u32) -> bool {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;
        kill(Pid::from_raw(pid as i32), None).is_ok()
    }

    #[tokio::test]
    async fn test_spawn_missing_executable_fails() {
        let def = ServerDefinition::new("ghost", "/nonexistent/mcp-server-binary", &[]);
        match Transport::spawn(&def) {
            Err(McpError::Spawn { server, .. }) => assert_eq!(server, "ghost"),
            Err(other) => panic!("expected Spawn error, got {other:?}"),
            Ok(_) => panic!("expected Spawn error"),
        }
    }

    #[tokio::test]
    async fn test_write_then_read_line_round_trip() {
        let mut transport = Transport::spawn(&ServerDefinition::new("cat", "cat", &[])).unwrap();
        transport.write_line(br#"{"hello":"world"}"#).await.unwrap();
        let line = transport.read_line().await.unwrap();
        assert_eq!(line, br#"{"hello":"world"}"#.to_vec());
        transport.terminate(Duration::from_secs(2)).await.unwrap();
    }

    #[tokio::test]
    async fn test_read_line_strips_crlf() {
        let mut transport = Transport::spawn(&sh("crlf", "printf 'abc\\r\\n'")).unwrap();
        assert_eq!(transport.read_line().await.unwrap(), b"abc".to_vec());
    }

    #[tokio::test]
    async fn test_read_after_exit_is_transport_closed() {
        let mut transport = Transport::spawn(&ServerDefinition::new("true", "true", &[])).unwrap();
        assert!(matches!(
            transport.read_line().await,
            Err(McpError::TransportClosed { .. })
        ));
    }

    #[tokio::test]
    async fn test_write_after_terminate_is_transport_closed() {
        let mut transport = Transport::spawn(&ServerDefinition::new("cat", "cat", &[])).unwrap();
        transport.terminate(Duration::from_secs(2)).await.unwrap();
        assert!(matches!(
            transport.write_line(b"{}").await,
            Err(McpError::TransportClosed { .. })
        ));
    }

    #[tokio::test]
    async fn test_embedded_newline_is_rejected() {
        let mut transport = Transport::spawn(&ServerDefinition::new("cat", "cat", &[])).unwrap();
        assert!(matches!(
            transport.write_line(b"{}\n{}").await,
            Err(McpError::Encode { .. })
        ));
        transport.terminate(Duration::from_secs(2)).await.unwrap();
    }

    #[tokio::test]
    async fn test_env_overlay_reaches_child() {
        let mut def = sh("env", "echo \"$MCP_HUB_TEST_VALUE\"");
        def.env
            .insert("MCP_HUB_TEST_VALUE".into(), "overlay-value".into());
        let mut transport = Transport::spawn(&def).unwrap();
        assert_eq!(transport.read_line().await.unwrap(), b"overlay-value".to_vec());
    }

    #[tokio::test]
    async fn test_terminate_force_kills_process_ignoring_sigterm() {
        let def = sh("stubborn", "trap '' TERM; echo ready; exec sleep 30");
        let mut transport = Transport::spawn(&def).unwrap();
        // Wait until the trap is installed before signalling.
        assert_eq!(transport.read_line().await.unwrap(), b"ready".to_vec());
        let pid = transport.pid().unwrap();
        assert!(process_exists(pid));

        let started = std::time::Instant::now();
        transport
            .terminate(Duration::from_millis(300))
            .await
            .unwrap();

        assert!(started.elapsed() >= Duration::from_millis(300));
        assert!(!process_exists(pid));
        assert!(transport.pid().is_none());
    }

    #[tokio::test]
    async fn test_terminate_graceful_exit_is_fast() {
        let mut transport = Transport::spawn(&ServerDefinition::new("sleep", "sleep", &["30"])).unwrap();
        let pid = transport.pid().unwrap();
        let started = std::time::Instant::now();
        transport.terminate(Duration::from_secs(5)).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!process_exists(pid));
    }

    #[tokio::test]
    async fn test_oversized_line_is_dropped_and_reading_resumes() {
        let script = "printf 'short\\n'; printf '%0200d\\n' 0; printf 'after\\n'";
        let mut transport = Transport::spawn(&sh("long", script)).unwrap();
        transport.reader.max_line = 64;

        assert_eq!(transport.read_line().await.unwrap(), b"short".to_vec());
        match transport.read_line().await {
            Err(McpError::Decode { reason }) => assert!(reason.contains("201 bytes")),
            other => panic!("expected Decode, got {other:?}"),
        }
        assert_eq!(transport.read_line().await.unwrap(), b"after".to_vec());
        assert!(matches!(
            transport.read_line().await,
            Err(McpError::TransportClosed { .. })
        ));
    }

    #[tokio::test]
    async fn test_cancelled_write_closes_stdin_on_next_write() {
        // Never reads stdin, so a large frame fills the pipe and blocks.
        let mut transport = Transport::spawn(&sh("deaf", "exec sleep 30")).unwrap();
        let big = vec![b'x'; 1024 * 1024];

        let stalled =
            tokio::time::timeout(Duration::from_millis(200), transport.write_line(&big)).await;
        assert!(stalled.is_err());

        assert!(matches!(
            transport.write_line(b"{}").await,
            Err(McpError::TransportClosed { .. })
        ));
        assert!(transport.writer.is_closed());
        transport.terminate(Duration::from_secs(2)).await.unwrap();
    }

    #[tokio::test]
    async fn test_terminate_is_idempotent() {
        let mut transport = Transport::spawn(&ServerDefinition::new("cat", "cat", &[])).unwrap();
        transport.terminate(Duration::from_secs(1)).await.unwrap();
        transport.terminate(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_stderr_tail_is_captured() {
        let transport = Transport::spawn(&sh("noisy", "echo boom >&2; sleep 5")).unwrap();
        let (_writer, _reader, mut process) = transport.into_parts();

        let mut tail = String::new();
        for _ in 0..50 {
            tail = process.stderr_tail();
            if !tail.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(tail, "boom");
        assert_eq!(format_stderr_suffix(&tail), " | stderr: boom");
        process.terminate(Duration::from_secs(1)).await.unwrap();
    }
}
