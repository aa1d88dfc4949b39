//! Server registry — the catalog of known tool-provider definitions.
//!
//! Provides:
//! - Lookup of a server definition by name
//! - Iteration over enabled definitions in name order
//! - "Did you mean" suggestions for mistyped server names

use std::collections::BTreeMap;
use std::sync::Arc;

use super::types::ServerDefinition;

// ─── ServerRegistry ──────────────────────────────────────────────────────────

/// Known servers, keyed by unique name.
///
/// Definitions are shared (`Arc`) with the supervisors built from them and
/// are never mutated in place; re-registering a name replaces the entry.
#[derive(Debug, Clone, Default)]
pub struct ServerRegistry {
    servers: BTreeMap<String, Arc<ServerDefinition>>,
}

impl ServerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from discovered definitions. Later duplicates win.
    pub fn from_definitions(definitions: impl IntoIterator<Item = ServerDefinition>) -> Self {
        let mut registry = Self::new();
        for definition in definitions {
            registry.insert(definition);
        }
        registry
    }

    /// Add or replace a definition. Returns the previous one, if any.
    pub fn insert(&mut self, definition: ServerDefinition) -> Option<Arc<ServerDefinition>> {
        self.servers
            .insert(definition.name.clone(), Arc::new(definition))
    }

    pub fn remove(&mut self, name: &str) -> Option<Arc<ServerDefinition>> {
        self.servers.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&ServerDefinition> {
        self.servers.get(name).map(Arc::as_ref)
    }

    /// Shared handle to a definition, for handing to a supervisor.
    pub fn get_shared(&self, name: &str) -> Option<Arc<ServerDefinition>> {
        self.servers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.servers.contains_key(name)
    }

    /// All registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        self.servers.keys().map(String::as_str).collect()
    }

    /// Definitions whose `enabled` flag is set, in name order.
    pub fn enabled(&self) -> impl Iterator<Item = &Arc<ServerDefinition>> {
        self.servers.values().filter(|def| def.enabled)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<ServerDefinition>> {
        self.servers.values()
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    /// Up to `max_results` registered names close to `name`, best first.
    pub fn find_similar(&self, name: &str, max_results: usize) -> Vec<String> {
        let mut scored: Vec<(&String, f64)> = self
            .servers
            .keys()
            .map(|known| (known, similarity(name, known)))
            .filter(|(_, score)| *score > 0.4)
            .collect();

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(max_results);
        scored.into_iter().map(|(name, _)| name.clone()).collect()
    }
}

// ─── Edit Distance ──────────────────────────────────────────────────────────

/// Levenshtein distance over bytes.
fn levenshtein(a: &str, b: &str) -> usize {
    let a = a.as_bytes();
    let b = b.as_bytes();

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0usize; b.len() + 1];

    for i in 1..=a.len() {
        curr[0] = i;
        for j in 1..=b.len() {
            let cost = usize::from(a[i - 1] != b[j - 1]);
            curr[j] = (prev[j] + 1).min(curr[j - 1] + 1).min(prev[j - 1] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b.len()]
}

/// 1.0 for identical strings, 0.0 for nothing in common.
fn similarity(a: &str, b: &str) -> f64 {
    let max_len = a.len().max(b.len());
    if max_len == 0 {
        return 1.0;
    }
    1.0 - (levenshtein(a, b) as f64 / max_len as f64)
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ServerRegistry {
        let mut disabled = ServerDefinition::new("puppeteer", "npx", &["-y"]);
        disabled.enabled = false;
        ServerRegistry::from_definitions(vec![
            ServerDefinition::new("github", "npx", &["-y"]),
            ServerDefinition::new("filesystem", "npx", &["-y"]),
            disabled,
        ])
    }

    #[test]
    fn test_lookup_by_name() {
        let registry = sample();
        assert_eq!(registry.len(), 3);
        assert_eq!(registry.get("github").unwrap().command, "npx");
        assert!(registry.get("nonexistent").is_none());
        assert!(!registry.contains("nonexistent"));
    }

    #[test]
    fn test_names_are_sorted() {
        assert_eq!(sample().names(), vec!["filesystem", "github", "puppeteer"]);
    }

    #[test]
    fn test_enabled_skips_disabled_entries() {
        let registry = sample();
        let enabled: Vec<&str> = registry.enabled().map(|d| d.name.as_str()).collect();
        assert_eq!(enabled, vec!["filesystem", "github"]);
    }

    #[test]
    fn test_insert_replaces_existing_entry() {
        let mut registry = sample();
        let previous = registry.insert(ServerDefinition::new("github", "node", &["gh.js"]));
        assert_eq!(previous.unwrap().command, "npx");
        assert_eq!(registry.get("github").unwrap().command, "node");
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn test_empty_registry() {
        let registry = ServerRegistry::new();
        assert!(registry.is_empty());
        assert!(registry.names().is_empty());
        assert_eq!(registry.enabled().count(), 0);
    }

    #[test]
    fn test_find_similar_suggests_close_names() {
        let registry = sample();
        assert_eq!(registry.find_similar("githbu", 3), vec!["github"]);
        assert_eq!(registry.find_similar("filesytem", 1), vec!["filesystem"]);
        assert!(registry.find_similar("zzzz", 3).is_empty());
    }

    #[test]
    fn test_levenshtein_basics() {
        assert_eq!(levenshtein("", ""), 0);
        assert_eq!(levenshtein("abc", "abc"), 0);
        assert_eq!(levenshtein("kitten", "sitting"), 3);
        assert_eq!(levenshtein("", "abc"), 3);
    }
}
