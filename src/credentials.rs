//! Credential collaborator — where server secrets come from.
//!
//! Discovery asks the store for each catalog entry's service key and
//! injects whatever it finds into that server's environment overlay. The
//! store is never asked to prompt; a missing secret is simply absent.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard};

/// Prefix for secrets read from the process environment.
pub const ENV_SECRET_PREFIX: &str = "MCP_HUB_SECRET_";

/// Source of per-service secrets.
pub trait CredentialStore: Send + Sync {
    /// The secret for `service`, or `None` when none is stored.
    fn get(&self, service: &str) -> Option<String>;

    /// Store `secret` for `service`, replacing any previous value.
    fn set(&self, service: &str, secret: &str);
}

fn lock(map: &Mutex<HashMap<String, String>>) -> MutexGuard<'_, HashMap<String, String>> {
    map.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ─── In-Memory ───────────────────────────────────────────────────────────────

/// Process-local store; nothing is persisted.
#[derive(Default)]
pub struct MemoryCredentialStore {
    secrets: Mutex<HashMap<String, String>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store pre-filled with `(service, secret)` pairs.
    pub fn with_secrets<I, K, V>(secrets: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let store = Self::new();
        {
            let mut map = lock(&store.secrets);
            for (service, secret) in secrets {
                map.insert(service.into(), secret.into());
            }
        }
        store
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn get(&self, service: &str) -> Option<String> {
        lock(&self.secrets).get(service).cloned()
    }

    fn set(&self, service: &str, secret: &str) {
        lock(&self.secrets).insert(service.to_string(), secret.to_string());
    }
}

// Values are secrets; only the service keys are printed.
impl fmt::Debug for MemoryCredentialStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secrets = lock(&self.secrets);
        let mut services: Vec<&String> = secrets.keys().collect();
        services.sort();
        f.debug_struct("MemoryCredentialStore")
            .field("services", &services)
            .finish()
    }
}

// ─── Environment ─────────────────────────────────────────────────────────────

/// Reads `MCP_HUB_SECRET_<SERVICE>` from the environment.
///
/// The service key is upper-cased and `-` becomes `_`, so `brave-search`
/// is read from `MCP_HUB_SECRET_BRAVE_SEARCH`. `set` writes to a
/// process-local overlay that takes precedence over the environment; the
/// environment itself is never modified.
pub struct EnvCredentialStore {
    prefix: String,
    overlay: Mutex<HashMap<String, String>>,
}

impl Default for EnvCredentialStore {
    fn default() -> Self {
        Self::with_prefix(ENV_SECRET_PREFIX)
    }
}

impl EnvCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_prefix(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            overlay: Mutex::new(HashMap::new()),
        }
    }

    /// Environment variable consulted for `service`.
    pub fn variable_for(&self, service: &str) -> String {
        let suffix: String = service
            .chars()
            .map(|c| match c {
                '-' | '.' | ' ' => '_',
                other => other.to_ascii_uppercase(),
            })
            .collect();
        format!("{}{suffix}", self.prefix)
    }
}

impl CredentialStore for EnvCredentialStore {
    fn get(&self, service: &str) -> Option<String> {
        if let Some(secret) = lock(&self.overlay).get(service) {
            return Some(secret.clone());
        }
        std::env::var(self.variable_for(service))
            .ok()
            .filter(|value| !value.is_empty())
    }

    fn set(&self, service: &str, secret: &str) {
        lock(&self.overlay).insert(service.to_string(), secret.to_string());
    }
}

impl fmt::Debug for EnvCredentialStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnvCredentialStore")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store_get_set() {
        let store = MemoryCredentialStore::new();
        assert!(store.get("github").is_none());
        store.set("github", "ghp_first");
        store.set("github", "ghp_second");
        assert_eq!(store.get("github").as_deref(), Some("ghp_second"));
    }

    #[test]
    fn test_memory_store_debug_hides_values() {
        let store = MemoryCredentialStore::with_secrets([("slack", "xoxb-secret")]);
        let printed = format!("{store:?}");
        assert!(printed.contains("slack"));
        assert!(!printed.contains("xoxb-secret"));
    }

    #[test]
    fn test_env_variable_naming() {
        let store = EnvCredentialStore::new();
        assert_eq!(store.variable_for("github"), "MCP_HUB_SECRET_GITHUB");
        assert_eq!(store.variable_for("brave-search"), "MCP_HUB_SECRET_BRAVE_SEARCH");
    }

    #[test]
    fn test_env_store_reads_environment() {
        let store = EnvCredentialStore::with_prefix("MCP_HUB_TEST_CRED_READ_");
        std::env::set_var("MCP_HUB_TEST_CRED_READ_GITHUB", "from-env");
        assert_eq!(store.get("github").as_deref(), Some("from-env"));
        assert!(store.get("slack").is_none());
    }

    #[test]
    fn test_env_store_ignores_empty_values() {
        let store = EnvCredentialStore::with_prefix("MCP_HUB_TEST_CRED_EMPTY_");
        std::env::set_var("MCP_HUB_TEST_CRED_EMPTY_SLACK", "");
        assert!(store.get("slack").is_none());
    }

    #[test]
    fn test_env_store_overlay_wins() {
        let store = EnvCredentialStore::with_prefix("MCP_HUB_TEST_CRED_OVERLAY_");
        std::env::set_var("MCP_HUB_TEST_CRED_OVERLAY_POSTGRES", "postgres://env");
        store.set("postgres", "postgres://overlay");
        assert_eq!(store.get("postgres").as_deref(), Some("postgres://overlay"));
        // The environment itself is untouched.
        assert_eq!(
            std::env::var("MCP_HUB_TEST_CRED_OVERLAY_POSTGRES").unwrap(),
            "postgres://env"
        );
    }
}
