//! Manager configuration loading and validation.
//!
//! Reads `config.yaml` and resolves environment variables. Every field has a
//! default, so a missing default config file is not an error.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::mcp_client::errors::McpError;
use crate::mcp_client::supervisor::SupervisorSettings;
use crate::mcp_client::types::ServerConfig;

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV_VAR: &str = "MCP_HUB_CONFIG";

// ─── Public Types ────────────────────────────────────────────────────────────

/// Top-level manager configuration (mirrors `config.yaml`).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ManagerConfig {
    /// Default bound for a single tool call.
    pub call_timeout_ms: u64,
    /// Bound for spawn plus `initialize` handshake.
    pub connect_timeout_ms: u64,
    /// Time a server gets to exit after SIGTERM before it is killed.
    pub shutdown_grace_ms: u64,
    /// Run the MCP `initialize` handshake after spawning.
    pub handshake: bool,
    /// Root directory handed to the filesystem server.
    pub filesystem_root: String,
    /// Catalog or configured servers to keep out of the registry's enabled set.
    pub disabled_servers: Vec<String>,
    /// Additional servers, or full replacements for catalog entries.
    pub servers: BTreeMap<String, ServerConfig>,
    /// When set, logs go to `<log_dir>/mcp-hub.log` instead of stderr.
    pub log_dir: Option<PathBuf>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: 30_000,
            connect_timeout_ms: 30_000,
            shutdown_grace_ms: 5_000,
            handshake: true,
            filesystem_root: "/tmp".to_string(),
            disabled_servers: Vec::new(),
            servers: BTreeMap::new(),
            log_dir: None,
        }
    }
}

impl ManagerConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Per-supervisor settings derived from this config.
    pub fn supervisor_settings(&self) -> SupervisorSettings {
        SupervisorSettings {
            call_timeout: self.call_timeout(),
            connect_timeout: self.connect_timeout(),
            shutdown_grace: self.shutdown_grace(),
            handshake: self.handshake,
        }
    }

    pub fn is_disabled(&self, name: &str) -> bool {
        self.disabled_servers.iter().any(|d| d == name)
    }

    /// Reject values that would make every call or connect fail instantly.
    pub fn validate(&self) -> Result<(), McpError> {
        for (field, value) in [
            ("call_timeout_ms", self.call_timeout_ms),
            ("connect_timeout_ms", self.connect_timeout_ms),
        ] {
            if value == 0 {
                return Err(McpError::Config {
                    reason: format!("{field} must be greater than zero"),
                });
            }
        }
        if let Some((name, _)) = self
            .servers
            .iter()
            .find(|(_, server)| server.command.trim().is_empty())
        {
            return Err(McpError::Config {
                reason: format!("server '{name}' has an empty command"),
            });
        }
        Ok(())
    }

    /// Load configuration using the standard lookup order.
    ///
    /// An explicit path (argument or `MCP_HUB_CONFIG`) must exist and parse.
    /// The per-user default file is optional.
    pub fn load(explicit: Option<&Path>) -> Result<Self, McpError> {
        match find_config_path(explicit) {
            ConfigLocation::Explicit(path) => load_config(&path),
            ConfigLocation::Default(path) if path.exists() => load_config(&path),
            ConfigLocation::Default(path) => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                Ok(Self::default())
            }
            ConfigLocation::None => Ok(Self::default()),
        }
    }
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Where the config file is expected to be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigLocation {
    /// Named by the caller or by `MCP_HUB_CONFIG`; must be readable.
    Explicit(PathBuf),
    /// Per-user default location; may be absent.
    Default(PathBuf),
    /// No config directory on this platform.
    None,
}

/// Resolve the config path: explicit argument, then `MCP_HUB_CONFIG`, then
/// `<config_dir>/mcp-hub/config.yaml`.
pub fn find_config_path(explicit: Option<&Path>) -> ConfigLocation {
    if let Some(path) = explicit {
        return ConfigLocation::Explicit(path.to_path_buf());
    }

    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        if !path.is_empty() {
            return ConfigLocation::Explicit(PathBuf::from(expand_tilde(&path)));
        }
    }

    match dirs::config_dir() {
        Some(dir) => ConfigLocation::Default(dir.join("mcp-hub").join("config.yaml")),
        None => ConfigLocation::None,
    }
}

/// Load and parse a configuration file.
///
/// Performs environment-variable interpolation on `${VAR_NAME}` and
/// `${VAR_NAME:-default}` before parsing.
pub fn load_config(path: &Path) -> Result<ManagerConfig, McpError> {
    let raw = std::fs::read_to_string(path).map_err(|e| McpError::Config {
        reason: format!("failed to read {}: {e}", path.display()),
    })?;

    let config = parse_config(&raw).map_err(|e| match e {
        McpError::Config { reason } => McpError::Config {
            reason: format!("{}: {reason}", path.display()),
        },
        other => other,
    })?;

    tracing::info!(
        path = %path.display(),
        servers = config.servers.len(),
        disabled = config.disabled_servers.len(),
        "loaded config"
    );
    Ok(config)
}

/// Parse configuration text (after interpolation) and validate it.
pub fn parse_config(raw: &str) -> Result<ManagerConfig, McpError> {
    let interpolated = interpolate_env_vars(raw);

    // An empty file means "all defaults".
    if interpolated.trim().is_empty() {
        return Ok(ManagerConfig::default());
    }

    let mut config: ManagerConfig =
        serde_yaml::from_str(&interpolated).map_err(|e| McpError::Config {
            reason: format!("failed to parse config: {e}"),
        })?;

    config.filesystem_root = expand_tilde(&config.filesystem_root);
    config.log_dir = config
        .log_dir
        .map(|dir| PathBuf::from(expand_tilde(&dir.to_string_lossy())));

    config.validate()?;
    Ok(config)
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_expr.push(c);
            }
            result.push_str(&resolve_var_expr(&var_expr));
        } else {
            result.push(ch);
        }
    }

    result
}

/// Resolve a variable expression like `VAR` or `VAR:-default`.
fn resolve_var_expr(expr: &str) -> String {
    if let Some((name, default)) = expr.split_once(":-") {
        match std::env::var(name) {
            Ok(value) if !value.is_empty() => value,
            _ => expand_tilde(default),
        }
    } else {
        std::env::var(expr).unwrap_or_default()
    }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────
