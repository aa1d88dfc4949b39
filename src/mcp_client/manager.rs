//! MCP Manager — high-level interface for tool discovery and execution.
//!
//! Discovers servers, owns one supervisor per server, and routes
//! `list_tools` / `call_tool` to the right connection. All operations take
//! `&self`, so a single manager can be shared (`Arc`) across tasks and
//! serve concurrent calls.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use futures::future::join_all;
use serde_json::json;

use crate::config::ManagerConfig;
use crate::credentials::{CredentialStore, EnvCredentialStore};

use super::discovery::{self, PathProbe, PrerequisiteProbe};
use super::errors::McpError;
use super::extensions::ExtensionCatalog;
use super::lifecycle;
use super::registry::ServerRegistry;
use super::supervisor::Supervisor;
use super::types::{ConnectionState, ServerStatus, ToolDescriptor, ToolsListResult};

// ─── InitReport ──────────────────────────────────────────────────────────────

/// Outcome of [`McpManager::initialize_all`].
#[derive(Debug)]
pub struct InitReport {
    /// Servers found by discovery (enabled or not).
    pub discovered: usize,
    /// Servers that reached `Connected`, in name order.
    pub connected: Vec<String>,
    /// Servers that failed to connect, with the reason.
    pub failed: Vec<(String, McpError)>,
    /// Number of extension descriptors loaded.
    pub extensions: usize,
}

impl InitReport {
    pub fn all_connected(&self) -> bool {
        self.failed.is_empty()
    }
}

// ─── McpManager ──────────────────────────────────────────────────────────────

/// Owns the server registry and every supervisor.
pub struct McpManager {
    config: ManagerConfig,
    probe: Arc<dyn PrerequisiteProbe>,
    credentials: Arc<dyn CredentialStore>,
    registry: RwLock<ServerRegistry>,
    supervisors: RwLock<BTreeMap<String, Arc<Supervisor>>>,
    extensions: RwLock<ExtensionCatalog>,
    /// Last connect failure per server, cleared on success.
    failures: RwLock<BTreeMap<String, String>>,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl McpManager {
    /// Create a manager that probes `PATH` and reads credentials from the
    /// environment. Nothing is discovered or spawned yet.
    pub fn new(config: ManagerConfig) -> Self {
        Self {
            config,
            probe: Arc::new(PathProbe),
            credentials: Arc::new(EnvCredentialStore::new()),
            registry: RwLock::new(ServerRegistry::new()),
            supervisors: RwLock::new(BTreeMap::new()),
            extensions: RwLock::new(ExtensionCatalog::default()),
            failures: RwLock::new(BTreeMap::new()),
        }
    }

    /// Replace the prerequisite probe used by discovery.
    pub fn with_probe(mut self, probe: Arc<dyn PrerequisiteProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Replace the credential store used by discovery.
    pub fn with_credentials(mut self, credentials: Arc<dyn CredentialStore>) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    // ─── Discovery & Lifecycle ───────────────────────────────────────────

    /// Run discovery and refresh the registry.
    ///
    /// Definitions of servers that are currently connected (or connecting)
    /// are kept as they are; everything else is replaced. Returns the
    /// number of registered servers.
    pub async fn discover(&self) -> usize {
        let definitions =
            discovery::discover(Arc::clone(&self.probe), &self.config, self.credentials.as_ref())
                .await;

        let mut fresh = ServerRegistry::from_definitions(definitions);

        write(&self.supervisors).retain(|name, sup| {
            let live = matches!(
                sup.state(),
                ConnectionState::Connected | ConnectionState::Connecting
            );
            if live {
                tracing::debug!(server = %name, "keeping live definition across rediscovery");
                fresh.insert(sup.definition().clone());
            }
            live
        });

        let count = fresh.len();
        *write(&self.registry) = fresh;
        count
    }

    /// Discover, connect every enabled server concurrently, and load the
    /// extension catalog.
    ///
    /// Never fails: servers that cannot connect are listed in the report and
    /// in [`failures`](Self::failures), and the rest keep working.
    pub async fn initialize_all(&self) -> InitReport {
        let started = Instant::now();
        tracing::info!("initializing MCP servers");

        let discovered = self.discover().await;

        let to_connect: Vec<Arc<Supervisor>> = {
            let registry = read(&self.registry);
            let names: Vec<String> = registry.enabled().map(|d| d.name.clone()).collect();
            drop(registry);
            names
                .iter()
                .filter_map(|name| self.supervisor_or_create(name))
                .collect()
        };

        let failed = lifecycle::connect_all(&to_connect).await;

        {
            let mut failures = write(&self.failures);
            for sup in &to_connect {
                failures.remove(sup.name());
            }
            for (name, e) in &failed {
                failures.insert(name.clone(), e.to_string());
            }
        }

        let catalog = ExtensionCatalog::builtin();
        let extensions = catalog.len();
        *write(&self.extensions) = catalog;
        tracing::info!(count = extensions, "extensions loaded");

        let connected = self.connected_servers();
        tracing::info!(
            discovered,
            connected = connected.len(),
            failed = failed.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "MCP system initialized"
        );

        InitReport {
            discovered,
            connected,
            failed,
            extensions,
        }
    }

    /// Connect one registered server. A no-op if it is already connected.
    pub async fn connect(&self, name: &str) -> Result<(), McpError> {
        let sup = self
            .supervisor_or_create(name)
            .ok_or_else(|| McpError::UnknownServer {
                name: name.to_string(),
            })?;
        self.track(name, sup.connect().await)
    }

    /// Tear down the server's current connection (if any) and build a new
    /// one. The only way a lost connection comes back.
    pub async fn reconnect(&self, name: &str) -> Result<(), McpError> {
        let sup = self
            .supervisor_or_create(name)
            .ok_or_else(|| McpError::UnknownServer {
                name: name.to_string(),
            })?;

        tracing::info!(server = %name, state = %sup.state(), "reconnecting");
        if let Err(e) = sup.shutdown().await {
            tracing::warn!(server = %name, error = %e, "error closing previous connection");
        }
        self.track(name, sup.connect().await)
    }

    /// Stop every server concurrently. Best effort; errors are returned,
    /// never raised.
    pub async fn shutdown_all(&self) -> Vec<(String, McpError)> {
        let supervisors: Vec<Arc<Supervisor>> = read(&self.supervisors).values().cloned().collect();
        tracing::info!(servers = supervisors.len(), "shutting down MCP servers");
        lifecycle::shutdown_all(&supervisors).await
    }

    // ─── Tools ───────────────────────────────────────────────────────────

    /// Tools currently offered by `server`.
    ///
    /// Empty when the server is unknown or not connected. Always a live
    /// `tools/list` query; nothing is cached.
    pub async fn list_tools(&self, server: &str) -> Result<Vec<ToolDescriptor>, McpError> {
        let Some(sup) = self.supervisor(server) else {
            tracing::debug!(server, "list_tools on unknown or never-connected server");
            return Ok(Vec::new());
        };
        if !sup.is_connected() {
            tracing::debug!(server, state = %sup.state(), "list_tools on disconnected server");
            return Ok(Vec::new());
        }

        let result = sup.call("tools/list", json!({}), None).await?;
        let listed: ToolsListResult = serde_json::from_value(result).map_err(|e| McpError::Decode {
            reason: format!("invalid tools/list result from '{server}': {e}"),
        })?;
        tracing::debug!(server, count = listed.tools.len(), "listed tools");
        Ok(listed.tools)
    }

    /// Tools across every connected server, queried concurrently.
    ///
    /// A server that fails to answer is logged and left out.
    pub async fn list_all_tools(&self) -> Vec<(String, ToolDescriptor)> {
        let servers = self.connected_servers();
        let results = join_all(servers.iter().map(|name| async move {
            (name.clone(), self.list_tools(name).await)
        }))
        .await;

        let mut all = Vec::new();
        for (server, result) in results {
            match result {
                Ok(tools) => all.extend(tools.into_iter().map(|tool| (server.clone(), tool))),
                Err(e) => tracing::warn!(server = %server, error = %e, "failed to list tools"),
            }
        }
        all
    }

    /// Invoke `tool` on `server` with the default call timeout.
    pub async fn call_tool(
        &self,
        server: &str,
        tool: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, McpError> {
        self.call_tool_with_timeout(server, tool, arguments, None).await
    }

    /// Invoke `tool` on `server`.
    ///
    /// Fails fast with `UnknownServer` for names that were never registered
    /// (no process is spawned) and with `NotConnected` for registered
    /// servers without a live connection.
    pub async fn call_tool_with_timeout(
        &self,
        server: &str,
        tool: &str,
        arguments: serde_json::Value,
        timeout: Option<Duration>,
    ) -> Result<serde_json::Value, McpError> {
        if tool.trim().is_empty() {
            return Err(McpError::InvalidRequest {
                reason: "tool name must not be empty".into(),
            });
        }
        if !read(&self.registry).contains(server) {
            return Err(McpError::UnknownServer {
                name: server.to_string(),
            });
        }
        let sup = self.supervisor(server).ok_or_else(|| McpError::NotConnected {
            server: server.to_string(),
        })?;

        let started = Instant::now();
        let params = json!({
            "name": tool,
            "arguments": arguments,
        });
        let result = sup.call("tools/call", params, timeout).await;

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(_) => tracing::info!(server, tool, elapsed_ms, "tool call succeeded"),
            Err(e) => tracing::warn!(server, tool, elapsed_ms, error = %e, "tool call failed"),
        }
        result
    }

    // ─── Introspection ───────────────────────────────────────────────────

    /// Snapshot of every registered server, in name order.
    pub fn status(&self) -> Vec<ServerStatus> {
        let registry = read(&self.registry);
        let supervisors = read(&self.supervisors);
        registry
            .names()
            .into_iter()
            .map(|name| match supervisors.get(name) {
                Some(sup) => sup.status(),
                None => ServerStatus {
                    name: name.to_string(),
                    state: ConnectionState::Idle,
                    pending_calls: 0,
                    last_error: None,
                    connected_at: None,
                },
            })
            .collect()
    }

    /// Copy of the current registry.
    pub fn registry(&self) -> ServerRegistry {
        read(&self.registry).clone()
    }

    /// Copy of the loaded extension catalog (empty before `initialize_all`).
    pub fn extensions(&self) -> ExtensionCatalog {
        read(&self.extensions).clone()
    }

    /// Names of servers currently `Connected`, in name order.
    pub fn connected_servers(&self) -> Vec<String> {
        read(&self.supervisors)
            .iter()
            .filter(|(_, sup)| sup.is_connected())
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Last connect failure per server that has not since connected.
    pub fn failures(&self) -> Vec<(String, String)> {
        read(&self.failures)
            .iter()
            .map(|(name, reason)| (name.clone(), reason.clone()))
            .collect()
    }

    // ─── Internals ───────────────────────────────────────────────────────

    fn supervisor(&self, name: &str) -> Option<Arc<Supervisor>> {
        read(&self.supervisors).get(name).cloned()
    }

    /// The server's supervisor, created `Idle` on first use. `None` when the
    /// name is not registered.
    fn supervisor_or_create(&self, name: &str) -> Option<Arc<Supervisor>> {
        if let Some(sup) = self.supervisor(name) {
            return Some(sup);
        }
        let definition = read(&self.registry).get_shared(name)?;
        let mut supervisors = write(&self.supervisors);
        let sup = supervisors.entry(name.to_string()).or_insert_with(|| {
            Arc::new(Supervisor::new(definition, self.config.supervisor_settings()))
        });
        Some(Arc::clone(sup))
    }

    fn track(&self, name: &str, result: Result<(), McpError>) -> Result<(), McpError> {
        let mut failures = write(&self.failures);
        match &result {
            Ok(()) => {
                failures.remove(name);
            }
            Err(e) => {
                failures.insert(name.to_string(), e.to_string());
            }
        }
        result
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
