//! Batch lifecycle operations across supervisors.
//!
//! Connecting and shutting down run concurrently over every supervisor;
//! one slow or failing server never holds up the others, and failures are
//! collected rather than propagated.

use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;

use super::errors::McpError;
use super::supervisor::Supervisor;

/// Connect every supervisor concurrently.
///
/// Each `connect()` carries its own connect timeout. Returns the servers
/// that failed, with their errors, in input order.
pub async fn connect_all(supervisors: &[Arc<Supervisor>]) -> Vec<(String, McpError)> {
    let started = Instant::now();
    let results = join_all(supervisors.iter().map(|sup| async move {
        let result = sup.connect().await;
        (sup.name().to_string(), result)
    }))
    .await;

    let failures: Vec<(String, McpError)> = results
        .into_iter()
        .filter_map(|(name, result)| result.err().map(|e| (name, e)))
        .collect();

    for (name, e) in &failures {
        tracing::warn!(server = %name, error = %e, "server failed to connect");
    }
    tracing::info!(
        attempted = supervisors.len(),
        connected = supervisors.len() - failures.len(),
        failed = failures.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "connect pass complete"
    );
    failures
}

/// Shut every supervisor down concurrently. Best effort: every supervisor
/// ends up `Disconnected`; errors are returned, never raised.
pub async fn shutdown_all(supervisors: &[Arc<Supervisor>]) -> Vec<(String, McpError)> {
    let results = join_all(supervisors.iter().map(|sup| async move {
        (sup.name().to_string(), sup.shutdown().await)
    }))
    .await;

    let errors: Vec<(String, McpError)> = results
        .into_iter()
        .filter_map(|(name, result)| result.err().map(|e| (name, e)))
        .collect();

    for (name, e) in &errors {
        tracing::error!(server = %name, error = %e, "error during shutdown");
    }
    tracing::info!(
        servers = supervisors.len(),
        errors = errors.len(),
        "all servers shut down"
    );
    errors
}

// ─── Tests ───────────────────────────────────────────────────────────────────
