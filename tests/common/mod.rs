//! Helpers shared by the process-backed integration tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use mcp_hub::config::ManagerConfig;
use mcp_hub::credentials::MemoryCredentialStore;
use mcp_hub::mcp_client::types::ServerConfig;
use mcp_hub::mcp_client::{
    ConnectionState, McpManager, PrerequisiteProbe, ServerDefinition, Supervisor,
    SupervisorSettings,
};

/// Path of the reference server built alongside the tests.
pub const ECHO_SERVER: &str = env!("CARGO_BIN_EXE_mcp-echo-server");

pub fn echo_definition(name: &str, args: &[&str]) -> ServerDefinition {
    ServerDefinition::new(name, ECHO_SERVER, args)
}

pub fn settings() -> SupervisorSettings {
    SupervisorSettings {
        call_timeout: Duration::from_secs(5),
        connect_timeout: Duration::from_secs(10),
        shutdown_grace: Duration::from_secs(2),
        handshake: true,
    }
}

pub fn echo_supervisor(args: &[&str]) -> Arc<Supervisor> {
    Arc::new(Supervisor::new(Arc::new(echo_definition("echo", args)), settings()))
}

/// Accepts only the listed commands, so catalog `npx` entries never appear.
pub struct OnlyProbe(HashSet<String>);

impl OnlyProbe {
    pub fn new(commands: &[&str]) -> Arc<Self> {
        Arc::new(Self(commands.iter().map(|c| c.to_string()).collect()))
    }
}

impl PrerequisiteProbe for OnlyProbe {
    fn is_available(&self, command: &str) -> bool {
        self.0.contains(command)
    }
}

pub fn server_config(command: &str, args: &[&str]) -> ServerConfig {
    ServerConfig {
        command: command.to_string(),
        args: args.iter().map(|a| a.to_string()).collect(),
        env: BTreeMap::new(),
        cwd: None,
        enabled: true,
        credential: None,
    }
}

/// Config with a single `echo` server and short timeouts.
pub fn echo_config() -> ManagerConfig {
    let mut config = ManagerConfig {
        call_timeout_ms: 5_000,
        connect_timeout_ms: 10_000,
        shutdown_grace_ms: 2_000,
        ..ManagerConfig::default()
    };
    config
        .servers
        .insert("echo".into(), server_config(ECHO_SERVER, &[]));
    config
}

pub fn manager(config: ManagerConfig, commands: &[&str]) -> McpManager {
    McpManager::new(config)
        .with_probe(OnlyProbe::new(commands))
        .with_credentials(Arc::new(MemoryCredentialStore::new()))
}

/// Poll until the supervisor reaches `state` or a few seconds pass.
pub async fn wait_for_state(sup: &Supervisor, state: ConnectionState) -> bool {
    for _ in 0..200 {
        if sup.state() == state {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    false
}

/// Poll until `count` calls are outstanding.
pub async fn wait_for_pending(sup: &Supervisor, count: usize) -> bool {
    for _ in 0..200 {
        if sup.pending_calls() == count {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
