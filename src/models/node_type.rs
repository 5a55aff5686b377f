//! Declarative node-type definitions.
//!
//! Node types drive validation and autocreation: each type declares which
//! children and properties a node must or may carry, and which of them are
//! materialised automatically. Definitions are registered
//! programmatically; parsing a textual notation into definitions is the
//! job of an external tool.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::item::PropertyType;
use crate::models::node::Node;

/// Declared child-node slot on a node type.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChildNodeDefinition {
    /// Child name
    pub name: String,

    /// Primary types an occupant must satisfy; the first entry doubles as
    /// the autocreation default when no explicit default is declared
    #[serde(default)]
    pub required_primary_types: Vec<String>,

    /// Explicit default primary type for autocreation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_primary_type: Option<String>,

    /// The child must exist once the node is processed
    #[serde(default)]
    pub mandatory: bool,

    /// The child is materialised automatically when absent
    #[serde(default)]
    pub auto_created: bool,
}

impl ChildNodeDefinition {
    /// The primary type an autocreated occupant gets.
    pub fn effective_primary_type(&self) -> Option<&str> {
        self.default_primary_type
            .as_deref()
            .or_else(|| self.required_primary_types.first().map(String::as_str))
    }
}

/// Declared property slot on a node type.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertyDefinition {
    /// Property name
    pub name: String,

    /// Declared type tag
    #[serde(rename = "type")]
    pub property_type: PropertyType,

    /// Whether the property holds an ordered value list
    #[serde(default)]
    pub multi_valued: bool,

    /// The property must exist once the node is processed
    #[serde(default)]
    pub mandatory: bool,

    /// The property is materialised automatically when absent
    #[serde(default)]
    pub auto_created: bool,

    /// Declared default value(s) used by autocreation
    #[serde(default)]
    pub default_values: Vec<Value>,
}

/// A named node type: supertypes plus declared children and properties.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeTypeDefinition {
    pub name: String,

    #[serde(default)]
    pub supertypes: Vec<String>,

    #[serde(default)]
    pub mixin: bool,

    #[serde(default)]
    pub child_definitions: Vec<ChildNodeDefinition>,

    #[serde(default)]
    pub property_definitions: Vec<PropertyDefinition>,
}

impl NodeTypeDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            supertypes: Vec::new(),
            mixin: false,
            child_definitions: Vec::new(),
            property_definitions: Vec::new(),
        }
    }

    pub fn mixin(mut self) -> Self {
        self.mixin = true;
        self
    }

    pub fn with_supertype(mut self, name: impl Into<String>) -> Self {
        self.supertypes.push(name.into());
        self
    }

    pub fn with_child(mut self, child: ChildNodeDefinition) -> Self {
        self.child_definitions.push(child);
        self
    }

    pub fn with_property(mut self, property: PropertyDefinition) -> Self {
        self.property_definitions.push(property);
        self
    }
}

/// Registry of node types known to a session.
///
/// Seeded with the built-in core types so that autocreation works out of
/// the box; further types are registered by the application.
#[derive(Debug, Clone)]
pub struct NodeTypeRegistry {
    types: HashMap<String, NodeTypeDefinition>,
}

impl Default for NodeTypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeTypeRegistry {
    pub fn new() -> Self {
        let mut registry = Self {
            types: HashMap::new(),
        };
        for def in builtin_types() {
            registry.register(def);
        }
        registry
    }

    /// Register (or replace) a type definition.
    pub fn register(&mut self, definition: NodeTypeDefinition) {
        self.types.insert(definition.name.clone(), definition);
    }

    pub fn get(&self, name: &str) -> Option<&NodeTypeDefinition> {
        self.types.get(name)
    }

    /// All declared types of a node: primary first, then mixins, then
    /// each type's supertypes transitively. Unknown names are skipped;
    /// duplicates are reported once.
    pub fn declared_types_for(&self, node: &Node) -> Vec<&NodeTypeDefinition> {
        let mut queue: Vec<&str> = Vec::with_capacity(1 + node.mixin_types.len());
        queue.push(node.primary_type.as_str());
        queue.extend(node.mixin_types.iter().map(String::as_str));

        let mut seen: Vec<&str> = Vec::new();
        let mut result = Vec::new();
        let mut i = 0;
        while i < queue.len() {
            let name = queue[i];
            i += 1;
            if seen.contains(&name) {
                continue;
            }
            seen.push(name);
            if let Some(def) = self.types.get(name) {
                result.push(def);
                queue.extend(def.supertypes.iter().map(String::as_str));
            }
        }
        result
    }
}

fn builtin_types() -> Vec<NodeTypeDefinition> {
    vec![
        NodeTypeDefinition::new("nt:base").with_property(PropertyDefinition {
            name: "jcr:primaryType".to_string(),
            property_type: PropertyType::Name,
            multi_valued: false,
            mandatory: false,
            auto_created: false,
            default_values: Vec::new(),
        }),
        NodeTypeDefinition::new("nt:unstructured").with_supertype("nt:base"),
        NodeTypeDefinition::new("nt:folder").with_supertype("nt:base"),
        NodeTypeDefinition::new("mix:referenceable")
            .mixin()
            .with_property(PropertyDefinition {
                name: "jcr:uuid".to_string(),
                property_type: PropertyType::String,
                multi_valued: false,
                mandatory: true,
                auto_created: true,
                default_values: Vec::new(),
            }),
        NodeTypeDefinition::new("mix:created")
            .mixin()
            .with_property(PropertyDefinition {
                name: "jcr:created".to_string(),
                property_type: PropertyType::Date,
                multi_valued: false,
                mandatory: true,
                auto_created: true,
                default_values: Vec::new(),
            })
            .with_property(PropertyDefinition {
                name: "jcr:createdBy".to_string(),
                property_type: PropertyType::String,
                multi_valued: false,
                mandatory: true,
                auto_created: true,
                default_values: Vec::new(),
            }),
        NodeTypeDefinition::new("mix:lastModified")
            .mixin()
            .with_property(PropertyDefinition {
                name: "jcr:lastModified".to_string(),
                property_type: PropertyType::Date,
                multi_valued: false,
                mandatory: false,
                auto_created: true,
                default_values: Vec::new(),
            })
            .with_property(PropertyDefinition {
                name: "jcr:lastModifiedBy".to_string(),
                property_type: PropertyType::String,
                multi_valued: false,
                mandatory: false,
                auto_created: true,
                default_values: Vec::new(),
            }),
        NodeTypeDefinition::new("mix:etag")
            .mixin()
            .with_property(PropertyDefinition {
                name: "jcr:etag".to_string(),
                property_type: PropertyType::String,
                multi_valued: false,
                mandatory: false,
                auto_created: true,
                default_values: Vec::new(),
            }),
    ]
}
