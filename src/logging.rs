//! Tracing subscriber setup.
//!
//! Logs go to stderr by default; stdout stays free for command output. With
//! a log directory configured they go to `mcp-hub.log` in that directory,
//! which is rotated on every start.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing_subscriber::fmt;
use tracing_subscriber::EnvFilter;

/// File name of the active log inside the log directory.
pub const LOG_FILE_NAME: &str = "mcp-hub.log";

/// Number of rotated log files kept next to the active one.
const KEEP_ROTATED: u32 = 3;

/// Filter used when `RUST_LOG` is unset or invalid.
pub const DEFAULT_FILTER: &str = "mcp_hub=info,warn";

/// Output format for log lines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Install the global tracing subscriber.
///
/// Without `log_dir`, lines go to stderr. With it, the previous runs' logs
/// move back one generation (`mcp-hub.log.1` is the most recent, at most
/// three are kept) and this run writes a fresh `mcp-hub.log`, synced after
/// every line.
///
/// Returns the active log file path, if any. Installing a second subscriber
/// is a no-op.
pub fn init_tracing(log_dir: Option<&Path>, format: LogFormat) -> std::io::Result<Option<PathBuf>> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let Some(dir) = log_dir else {
        let builder = fmt::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(true);
        let installed = match format {
            LogFormat::Text => builder.try_init(),
            LogFormat::Json => builder.json().try_init(),
        };
        if installed.is_err() {
            tracing::debug!("tracing subscriber already installed");
        }
        return Ok(None);
    };

    std::fs::create_dir_all(dir)?;
    let log_path = dir.join(LOG_FILE_NAME);
    // No subscriber yet; report once one is installed.
    let rotation = rotate_logs(&log_path, KEEP_ROTATED);

    let writer = SyncedLogFile::open(&log_path)?;
    let builder = fmt::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true);
    let installed = match format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    if installed.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }

    if let Err(e) = rotation {
        tracing::warn!(log_file = %log_path.display(), error = %e, "log rotation incomplete");
    }
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        log_file = %log_path.display(),
        pid = std::process::id(),
        "mcp-hub starting"
    );
    Ok(Some(log_path))
}

// ─── Rotation ────────────────────────────────────────────────────────────────

/// Path of an older generation of `active`: `mcp-hub.log` → `mcp-hub.log.2`.
pub fn generation_path(active: &Path, generation: u32) -> PathBuf {
    let mut name = active.as_os_str().to_owned();
    name.push(format!(".{generation}"));
    PathBuf::from(name)
}

/// Age every log by one generation and free up `active`.
///
/// Generation `keep` is deleted; with `keep == 0` the active log is simply
/// removed. Gaps in the chain are fine. The first error other than a
/// missing file is returned after every step has been attempted.
pub fn rotate_logs(active: &Path, keep: u32) -> std::io::Result<()> {
    if keep == 0 {
        return ignore_missing(std::fs::remove_file(active));
    }

    let mut outcome = ignore_missing(std::fs::remove_file(generation_path(active, keep)));
    for generation in (1..keep).rev() {
        let moved = std::fs::rename(
            generation_path(active, generation),
            generation_path(active, generation + 1),
        );
        outcome = outcome.and(ignore_missing(moved));
    }
    let moved = std::fs::rename(active, generation_path(active, 1));
    outcome.and(ignore_missing(moved))
}

fn ignore_missing(result: std::io::Result<()>) -> std::io::Result<()> {
    match result {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

// ─── Writer ──────────────────────────────────────────────────────────────────

/// Shared handle to the active log file. Every write is flushed before the
/// next line is formatted, so a crash loses at most the line in progress.
#[derive(Clone)]
struct SyncedLogFile {
    file: Arc<Mutex<File>>,
}

impl SyncedLogFile {
    fn open(path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Arc::new(Mutex::new(file)),
        })
    }

    fn file(&self) -> MutexGuard<'_, File> {
        // A panic mid-write leaves the file usable.
        self.file.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Write for SyncedLogFile {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut file = self.file();
        let written = file.write(buf)?;
        file.flush()?;
        Ok(written)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.file().flush()
    }
}

impl<'a> fmt::MakeWriter<'a> for SyncedLogFile {
    type Writer = SyncedLogFile;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
