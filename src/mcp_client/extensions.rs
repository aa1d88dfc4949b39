//! Locally declared capabilities advertised alongside MCP servers.
//!
//! These are not backed by a process; they describe what the host itself
//! can do so callers can build one capability list. The catalog is built
//! once during initialization and is read-only afterwards.

use serde::Serialize;

/// Retrieval mode for search grounding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RetrievalMode {
    /// Retrieve only when the model's confidence falls below the threshold.
    ModeDynamic,
    /// Never retrieve.
    ModeUnspecified,
}

/// One locally declared capability.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExtensionDescriptor {
    CodeExecution {
        languages: Vec<String>,
        enabled: bool,
    },
    SearchRetrieval {
        mode: RetrievalMode,
        dynamic_threshold: f64,
        enabled: bool,
    },
    FunctionCalling {
        functions: Vec<String>,
        enabled: bool,
    },
}

impl ExtensionDescriptor {
    /// Stable key used in listings.
    pub fn key(&self) -> &'static str {
        match self {
            Self::CodeExecution { .. } => "code_execution",
            Self::SearchRetrieval { .. } => "search_retrieval",
            Self::FunctionCalling { .. } => "function_calling",
        }
    }

    pub fn is_enabled(&self) -> bool {
        match self {
            Self::CodeExecution { enabled, .. }
            | Self::SearchRetrieval { enabled, .. }
            | Self::FunctionCalling { enabled, .. } => *enabled,
        }
    }
}

/// Immutable set of extension descriptors.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ExtensionCatalog {
    extensions: Vec<ExtensionDescriptor>,
}

impl ExtensionCatalog {
    /// The built-in capabilities every host declares.
    pub fn builtin() -> Self {
        Self {
            extensions: vec![
                ExtensionDescriptor::CodeExecution {
                    languages: ["python", "javascript", "bash", "powershell"]
                        .into_iter()
                        .map(String::from)
                        .collect(),
                    enabled: true,
                },
                ExtensionDescriptor::SearchRetrieval {
                    mode: RetrievalMode::ModeDynamic,
                    dynamic_threshold: 0.7,
                    enabled: true,
                },
                ExtensionDescriptor::FunctionCalling {
                    functions: Vec::new(),
                    enabled: true,
                },
            ],
        }
    }

    pub fn get(&self, key: &str) -> Option<&ExtensionDescriptor> {
        self.extensions.iter().find(|ext| ext.key() == key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ExtensionDescriptor> {
        self.extensions.iter()
    }

    pub fn enabled(&self) -> impl Iterator<Item = &ExtensionDescriptor> {
        self.extensions.iter().filter(|ext| ext.is_enabled())
    }

    pub fn len(&self) -> usize {
        self.extensions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.extensions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_catalog_has_three_kinds() {
        let catalog = ExtensionCatalog::builtin();
        assert_eq!(catalog.len(), 3);
        assert_eq!(catalog.enabled().count(), 3);
        assert!(catalog.get("code_execution").is_some());
        assert!(catalog.get("search_retrieval").is_some());
        assert!(catalog.get("function_calling").is_some());
        assert!(catalog.get("image_generation").is_none());
    }

    #[test]
    fn test_code_execution_languages() {
        let catalog = ExtensionCatalog::builtin();
        match catalog.get("code_execution") {
            Some(ExtensionDescriptor::CodeExecution { languages, .. }) => {
                assert_eq!(languages, &["python", "javascript", "bash", "powershell"]);
            }
            other => panic!("unexpected descriptor: {other:?}"),
        }
    }

    #[test]
    fn test_serializes_tagged_by_kind() {
        let catalog = ExtensionCatalog::builtin();
        let json = serde_json::to_value(&catalog).unwrap();
        assert_eq!(json[1]["kind"], "search_retrieval");
        assert_eq!(json[1]["mode"], "MODE_DYNAMIC");
        assert_eq!(json[1]["dynamic_threshold"], 0.7);
        assert_eq!(json[2]["functions"], serde_json::json!([]));
    }
}
