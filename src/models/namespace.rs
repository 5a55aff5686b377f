//! Session-scoped namespace prefix registry.

use std::collections::HashMap;

/// Maps namespace prefixes to URIs for one session.
///
/// Seeded with the built-in prefixes; additional prefixes are registered
/// by the application or loaded in bulk from the transport.
#[derive(Debug, Clone)]
pub struct NamespaceRegistry {
    prefixes: HashMap<String, String>,
}

impl Default for NamespaceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl NamespaceRegistry {
    pub fn new() -> Self {
        let mut prefixes = HashMap::new();
        prefixes.insert("jcr".to_string(), "http://www.jcp.org/jcr/1.0".to_string());
        prefixes.insert("nt".to_string(), "http://www.jcp.org/jcr/nt/1.0".to_string());
        prefixes.insert("mix".to_string(), "http://www.jcp.org/jcr/mix/1.0".to_string());
        prefixes.insert("xml".to_string(), "http://www.w3.org/XML/1998/namespace".to_string());
        prefixes.insert(String::new(), String::new());
        Self { prefixes }
    }

    /// Register (or remap) a prefix.
    pub fn register(&mut self, prefix: impl Into<String>, uri: impl Into<String>) {
        self.prefixes.insert(prefix.into(), uri.into());
    }

    /// Replace the registry contents with the transport's namespace map,
    /// keeping the built-in prefixes.
    pub fn load(&mut self, namespaces: HashMap<String, String>) {
        for (prefix, uri) in namespaces {
            self.prefixes.insert(prefix, uri);
        }
    }

    pub fn is_registered(&self, prefix: &str) -> bool {
        self.prefixes.contains_key(prefix)
    }

    pub fn uri(&self, prefix: &str) -> Option<&str> {
        self.prefixes.get(prefix).map(String::as_str)
    }
}
