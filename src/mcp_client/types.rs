//! Shared types for the MCP connection manager.
//!
//! JSON-RPC 2.0 envelopes, server launch recipes, and MCP protocol payloads.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// JSON-RPC protocol version carried by every envelope.
pub const JSONRPC_VERSION: &str = "2.0";

// ─── JSON-RPC 2.0 ───────────────────────────────────────────────────────────

/// Outgoing JSON-RPC 2.0 request. Borrows its payload; it only lives long
/// enough to be serialized.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest<'a> {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: &'a str,
    pub params: &'a serde_json::Value,
}

impl<'a> JsonRpcRequest<'a> {
    /// Create a new JSON-RPC request.
    pub fn new(id: u64, method: &'a str, params: &'a serde_json::Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            method,
            params,
        }
    }
}

/// Outgoing JSON-RPC 2.0 notification (no id, no response expected).
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcNotification {
    /// Create a new JSON-RPC notification.
    pub fn new(method: &str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.to_string(),
            params,
        }
    }
}

/// Any incoming JSON-RPC envelope, before it is classified.
///
/// `result` distinguishes an explicit `null` from an absent field.
#[derive(Debug, Clone, Deserialize)]
pub struct RawEnvelope {
    pub jsonrpc: String,
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub params: Option<serde_json::Value>,
    #[serde(default, deserialize_with = "deserialize_present")]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

fn deserialize_present<'de, D>(deserializer: D) -> Result<Option<serde_json::Value>, D::Error>
where
    D: Deserializer<'de>,
{
    serde_json::Value::deserialize(deserializer).map(Some)
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

// ─── Server Definitions ──────────────────────────────────────────────────────

/// Credential a server needs injected into its environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialRequirement {
    /// Service key looked up in the credential store (e.g. "github").
    pub service: String,
    /// Environment variable the provider reads the secret from.
    pub env_var: String,
}

impl CredentialRequirement {
    pub fn new(service: &str, env_var: &str) -> Self {
        Self {
            service: service.to_string(),
            env_var: env_var.to_string(),
        }
    }
}

/// Launch recipe as written in the config file (`servers:` section).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServerConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub credential: Option<CredentialRequirement>,
}

fn default_enabled() -> bool {
    true
}

/// Identity and launch recipe of one tool provider.
///
/// Built during discovery and never mutated afterwards; the registry only
/// hands out shared references.
#[derive(Clone, PartialEq, Eq)]
pub struct ServerDefinition {
    /// Unique key (e.g. "filesystem").
    pub name: String,
    /// Executable, resolved through `PATH` when not absolute.
    pub command: String,
    /// Discrete argument list, never joined into a shell string.
    pub args: Vec<String>,
    /// Overlay on top of the inherited environment.
    pub env: BTreeMap<String, String>,
    pub cwd: Option<PathBuf>,
    pub enabled: bool,
    pub credential: Option<CredentialRequirement>,
}

impl ServerDefinition {
    /// Build a definition with an empty environment overlay.
    pub fn new(name: &str, command: &str, args: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            command: command.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            env: BTreeMap::new(),
            cwd: None,
            enabled: true,
            credential: None,
        }
    }

    /// Build a definition from a config-file entry.
    pub fn from_config(name: &str, config: ServerConfig) -> Self {
        Self {
            name: name.to_string(),
            command: config.command,
            args: config.args,
            env: config.env,
            cwd: config.cwd,
            enabled: config.enabled,
            credential: config.credential,
        }
    }

    /// The command line as a single display string (for logs only).
    pub fn display_command(&self) -> String {
        if self.args.is_empty() {
            self.command.clone()
        } else {
            format!("{} {}", self.command, self.args.join(" "))
        }
    }
}

// Env values may hold secrets, so only the keys are printed.
impl fmt::Debug for ServerDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerDefinition")
            .field("name", &self.name)
            .field("command", &self.command)
            .field("args", &self.args)
            .field("env_keys", &self.env.keys().collect::<Vec<_>>())
            .field("cwd", &self.cwd)
            .field("enabled", &self.enabled)
            .field("credential", &self.credential)
            .finish()
    }
}

// ─── MCP Protocol Types ──────────────────────────────────────────────────────

/// A tool exposed by a live server, as returned by `tools/list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, rename = "inputSchema", alias = "input_schema")]
    pub input_schema: serde_json::Value,
}

/// `tools/list` result payload.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ToolsListResult {
    #[serde(default)]
    pub tools: Vec<ToolDescriptor>,
}

/// MCP initialize response payload.
#[derive(Debug, Clone, Deserialize)]
pub struct InitializeResult {
    #[serde(default, alias = "protocolVersion")]
    pub protocol_version: Option<String>,
    #[serde(default, alias = "serverInfo")]
    pub server_info: Option<ServerInfo>,
}

/// Server info returned in the initialize response.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerInfo {
    pub name: Option<String>,
    pub version: Option<String>,
}

// ─── Connection State ────────────────────────────────────────────────────────

/// Lifecycle state of a server's connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Defined, never connected.
    Idle,
    /// Process spawn and handshake in progress.
    Connecting,
    /// Ready to accept calls.
    Connected,
    /// Shut down or lost; a new `connect()` builds a fresh connection.
    Disconnected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
        };
        f.write_str(s)
    }
}

/// Point-in-time view of one supervised server.
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    pub name: String,
    pub state: ConnectionState,
    pub pending_calls: usize,
    pub last_error: Option<String>,
    pub connected_at: Option<DateTime<Utc>>,
}

// ─── Standard MCP Error Codes ────────────────────────────────────────────────

/// Well-known JSON-RPC error codes.
pub mod error_codes {
    /// Invalid JSON was received.
    pub const PARSE_ERROR: i64 = -32700;
    /// The JSON sent is not a valid Request object.
    pub const INVALID_REQUEST: i64 = -32600;
    /// The method does not exist or is not available.
    pub const METHOD_NOT_FOUND: i64 = -32601;
    /// Invalid method parameters.
    pub const INVALID_PARAMS: i64 = -32602;
    /// Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i64 = -32603;
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_always_carries_params() {
        let params = serde_json::json!({});
        let req = JsonRpcRequest::new(7, "tools/list", &params);
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"jsonrpc\":\"2.0\""));
        assert!(json.contains("\"id\":7"));
        assert!(json.contains("\"params\":{}"));
    }

    #[test]
    fn test_notification_omits_id_and_empty_params() {
        let note = JsonRpcNotification::new("notifications/initialized", None);
        let json = serde_json::to_string(&note).unwrap();
        assert!(!json.contains("\"id\""));
        assert!(!json.contains("params"));
    }

    #[test]
    fn test_envelope_distinguishes_null_result_from_absent() {
        let with_null: RawEnvelope =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":1,"result":null}"#).unwrap();
        assert_eq!(with_null.result, Some(serde_json::Value::Null));

        let absent: RawEnvelope =
            serde_json::from_str(r#"{"jsonrpc":"2.0","method":"ping"}"#).unwrap();
        assert!(absent.result.is_none());
        assert!(absent.id.is_none());
    }

    #[test]
    fn test_tool_descriptor_accepts_camel_case_schema() {
        let json = r#"{"name":"read_file","inputSchema":{"type":"object"}}"#;
        let tool: ToolDescriptor = serde_json::from_str(json).unwrap();
        assert_eq!(tool.name, "read_file");
        assert_eq!(tool.description, "");
        assert_eq!(tool.input_schema["type"], "object");
    }

    #[test]
    fn test_server_config_defaults_enabled() {
        let yaml = "command: node\nargs: [server.js]\n";
        let cfg: ServerConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(cfg.enabled);
        assert!(cfg.env.is_empty());
        let def = ServerDefinition::from_config("local", cfg);
        assert_eq!(def.display_command(), "node server.js");
    }

    #[test]
    fn test_debug_hides_env_values() {
        let mut def = ServerDefinition::new("github", "npx", &["-y", "server-github"]);
        def.env
            .insert("GITHUB_PERSONAL_ACCESS_TOKEN".into(), "ghp_secret".into());
        let printed = format!("{def:?}");
        assert!(printed.contains("GITHUB_PERSONAL_ACCESS_TOKEN"));
        assert!(!printed.contains("ghp_secret"));
    }

    #[test]
    fn test_connection_state_display() {
        assert_eq!(ConnectionState::Connected.to_string(), "connected");
        assert_eq!(
            serde_json::to_string(&ConnectionState::Disconnected).unwrap(),
            "\"disconnected\""
        );
    }
}
