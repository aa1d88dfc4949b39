//! MCP server discovery — build the set of launchable server definitions.
//!
//! Starts from a fixed catalog of well-known `@modelcontextprotocol` servers,
//! applies config overrides and additions, injects credentials, and keeps
//! only the entries whose command can actually be found. Discovery only
//! reads; nothing is spawned here.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::config::ManagerConfig;
use crate::credentials::CredentialStore;

use super::types::{CredentialRequirement, ServerConfig, ServerDefinition};

// ─── Prerequisite Probe ──────────────────────────────────────────────────────

/// Decides whether a server's command can be launched on this machine.
pub trait PrerequisiteProbe: Send + Sync {
    fn is_available(&self, command: &str) -> bool;
}

/// Resolves the command through `PATH` (or checks it directly when it is a
/// path).
#[derive(Debug, Clone, Copy, Default)]
pub struct PathProbe;

impl PrerequisiteProbe for PathProbe {
    fn is_available(&self, command: &str) -> bool {
        match which::which(command) {
            Ok(path) => {
                tracing::debug!(command, path = %path.display(), "prerequisite found");
                true
            }
            Err(e) => {
                tracing::debug!(command, error = %e, "prerequisite not found");
                false
            }
        }
    }
}

// ─── Platform Helpers ────────────────────────────────────────────────────────

/// Platform-correct npx command.
///
/// Windows requires `npx.cmd` because `npx` is a batch script;
/// `Command::new("npx")` fails without the extension on Windows.
pub fn default_npx_command() -> &'static str {
    if cfg!(target_os = "windows") {
        "npx.cmd"
    } else {
        "npx"
    }
}

// ─── Catalog ─────────────────────────────────────────────────────────────────

/// Catalog entry: server name and the credential it needs, if any.
const CATALOG: &[(&str, Option<(&str, &str)>)] = &[
    ("filesystem", None),
    ("github", Some(("github", "GITHUB_PERSONAL_ACCESS_TOKEN"))),
    ("postgres", Some(("postgres", "POSTGRES_URL"))),
    ("slack", Some(("slack", "SLACK_BOT_TOKEN"))),
    ("puppeteer", None),
    ("brave-search", Some(("brave-search", "BRAVE_API_KEY"))),
];

/// The well-known servers, launched through `npx -y`.
///
/// The filesystem server gets `filesystem_root` as its last argument.
pub fn catalog(filesystem_root: &str) -> BTreeMap<String, ServerConfig> {
    CATALOG
        .iter()
        .map(|(name, credential)| {
            let mut args = vec!["-y".to_string(), format!("@modelcontextprotocol/server-{name}")];
            if *name == "filesystem" {
                args.push(filesystem_root.to_string());
            }
            let config = ServerConfig {
                command: default_npx_command().to_string(),
                args,
                env: BTreeMap::new(),
                cwd: None,
                enabled: true,
                credential: credential.map(|(service, var)| CredentialRequirement::new(service, var)),
            };
            (name.to_string(), config)
        })
        .collect()
}

// ─── Merge ──────────────────────────────────────────────────────────────────

/// Merge catalog entries with configured servers.
///
/// Override entries **fully replace** catalog entries for the same name.
/// Override-only servers are added as-is.
pub fn merge_configs(
    mut discovered: BTreeMap<String, ServerConfig>,
    overrides: BTreeMap<String, ServerConfig>,
) -> BTreeMap<String, ServerConfig> {
    for (name, override_config) in overrides {
        discovered.insert(name, override_config);
    }
    discovered
}

/// Place the stored secret into the env overlay, unless the overlay
/// already sets that variable explicitly.
fn inject_credential(definition: &mut ServerDefinition, store: &dyn CredentialStore) {
    let Some(requirement) = definition.credential.clone() else {
        return;
    };
    if definition.env.contains_key(&requirement.env_var) {
        return;
    }
    match store.get(&requirement.service) {
        Some(secret) => {
            tracing::debug!(
                server = %definition.name,
                service = %requirement.service,
                env_var = %requirement.env_var,
                "injected credential"
            );
            definition.env.insert(requirement.env_var, secret);
        }
        None => {
            tracing::info!(
                server = %definition.name,
                service = %requirement.service,
                env_var = %requirement.env_var,
                "no credential stored, server may fail to start"
            );
        }
    }
}

// ─── Discovery ──────────────────────────────────────────────────────────────

/// Build the definitions of every server that can be launched here.
///
/// Each distinct command is probed once, concurrently, on the blocking
/// pool. Entries whose command is missing are left out. Entries named in
/// `disabled_servers` are kept but marked disabled.
pub async fn discover(
    probe: Arc<dyn PrerequisiteProbe>,
    config: &ManagerConfig,
    credentials: &dyn CredentialStore,
) -> Vec<ServerDefinition> {
    let merged = merge_configs(catalog(&config.filesystem_root), config.servers.clone());

    let mut commands: Vec<String> = merged.values().map(|c| c.command.clone()).collect();
    commands.sort();
    commands.dedup();

    let availability = probe_commands(probe, commands).await;

    let mut definitions = Vec::with_capacity(merged.len());
    for (name, server_config) in merged {
        if !availability.get(&server_config.command).copied().unwrap_or(false) {
            tracing::info!(
                server = %name,
                command = %server_config.command,
                "skipping server, command not available"
            );
            continue;
        }

        let mut definition = ServerDefinition::from_config(&name, server_config);
        if config.is_disabled(&name) {
            definition.enabled = false;
        }
        inject_credential(&mut definition, credentials);

        tracing::debug!(
            server = %definition.name,
            command = %definition.display_command(),
            enabled = definition.enabled,
            "discovered MCP server"
        );
        definitions.push(definition);
    }

    tracing::info!(count = definitions.len(), "server discovery complete");
    definitions
}

async fn probe_commands(
    probe: Arc<dyn PrerequisiteProbe>,
    commands: Vec<String>,
) -> HashMap<String, bool> {
    let checks = commands.into_iter().map(|command| {
        let probe = Arc::clone(&probe);
        async move {
            let lookup = command.clone();
            let found = tokio::task::spawn_blocking(move || probe.is_available(&lookup))
                .await
                .unwrap_or_else(|e| {
                    tracing::warn!(command = %command, error = %e, "prerequisite probe panicked");
                    false
                });
            (command, found)
        }
    });
    futures::future::join_all(checks).await.into_iter().collect()
}

// ─── Tests ──────────────────────────────────────────────────────────────────
