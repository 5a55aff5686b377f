//! Node-type driven validation and autocreation.
//!
//! Before a staged node reaches the backend, the processor walks its
//! declared types (primary first, then mixins, then each type's
//! supertypes transitively), materialises autocreated children and
//! properties, and validates property values against their declared type
//! syntax. Autocreated children are staged like user adds: the processor
//! returns their add operations and the caller appends them to the log,
//! which may in turn schedule those children for processing.

use std::sync::OnceLock;

use chrono::{SecondsFormat, Utc};
use regex::Regex;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::models::{
    path, NamespaceRegistry, Node, NodeHandle, NodeTypeRegistry, Operation, PropertyType,
};
use crate::session::cache::NodeArena;
use crate::session::error::{SessionError, SessionResult};

/// RFC 3986 URI pattern: scheme, optional userinfo, host or bracketed
/// IPv6, optional port, optional path/query.
const URI_PATTERN: &str = r"(?i)^([a-z][a-z0-9*\-.]*)://((?:(?:[\w.\-+!$&'()*+,;=]|%[0-9a-f]{2})+:)*(?:[\w.\-+%!$&'()*+,;=]|%[0-9a-f]{2})+@)?((?:[a-z0-9\-.]|%[0-9a-f]{2})+|(?:\[(?:[0-9a-f]{0,4}:)*[0-9a-f]{0,4}\]))(:[0-9]+)?((?:[/?](?:[\w#!:.?+=&@!$'~*,;/()\[\]\-]|%[0-9a-f]{2})*)?)$";

fn uri_regex() -> &'static Regex {
    static URI_REGEX: OnceLock<Regex> = OnceLock::new();
    URI_REGEX.get_or_init(|| Regex::new(URI_PATTERN).expect("uri pattern compiles"))
}

/// Permitted XML 1.0 characters: U+0009, U+000A, U+000D, U+0020–U+D7FF,
/// U+E000–U+FFFD, U+10000–U+10FFFF.
fn is_valid_xml_text(text: &str) -> bool {
    text.chars().all(|c| {
        matches!(c,
            '\u{0009}' | '\u{000A}' | '\u{000D}'
            | '\u{0020}'..='\u{D7FF}'
            | '\u{E000}'..='\u{FFFD}'
            | '\u{10000}'..='\u{10FFFF}')
    })
}

/// Validates staged nodes and materialises autocreated items.
#[derive(Debug, Clone)]
pub struct NodeProcessor {
    user_id: String,
    auto_last_modified: bool,
}

impl NodeProcessor {
    pub fn new(user_id: impl Into<String>, auto_last_modified: bool) -> Self {
        Self {
            user_id: user_id.into(),
            auto_last_modified,
        }
    }

    /// Process one staged node.
    ///
    /// Returns the add operations of the children it materialised; the
    /// caller appends them to the operation log and caches the new nodes.
    ///
    /// # Errors
    ///
    /// - `ConstraintViolation` when a mandatory, non-autocreated child or
    ///   property is absent, or an autocreated property has no usable
    ///   default value
    /// - `ValueFormat` when a property value does not match its declared
    ///   type's syntax
    /// - `Namespace` when a NAME value carries an unregistered prefix
    pub fn process(
        &self,
        handle: NodeHandle,
        arena: &mut NodeArena,
        types: &NodeTypeRegistry,
        namespaces: &NamespaceRegistry,
    ) -> SessionResult<Vec<Operation>> {
        let (node_path, declared) = {
            let node = arena
                .get(handle)
                .ok_or_else(|| SessionError::invalid_state("node no longer exists"))?;
            let declared: Vec<_> = types
                .declared_types_for(node)
                .into_iter()
                .cloned()
                .collect();
            (node.path.clone(), declared)
        };

        let mut new_operations = Vec::new();

        for definition in &declared {
            for child_def in &definition.child_definitions {
                let exists = arena
                    .get(handle)
                    .map(|n| n.has_child(&child_def.name))
                    .unwrap_or(false);
                if exists {
                    continue;
                }
                if child_def.auto_created {
                    let primary_type = child_def.effective_primary_type().ok_or_else(|| {
                        SessionError::constraint(format!(
                            "autocreated child {} of {} declares no primary type",
                            child_def.name, node_path
                        ))
                    })?;
                    let child_path = path::join(&node_path, &child_def.name);
                    let child = Node::new_staged(&child_path, primary_type);
                    let child_handle = arena.allocate(child);
                    if let Some(parent) = arena.get_mut(handle) {
                        parent.add_child_name(&child_def.name);
                    }
                    tracing::debug!(path = %child_path, "autocreated child node");
                    new_operations.push(Operation::AddNode {
                        path: child_path,
                        node: child_handle,
                    });
                } else if child_def.mandatory {
                    return Err(SessionError::constraint(format!(
                        "mandatory child {} missing on {}",
                        child_def.name, node_path
                    )));
                }
            }

            for prop_def in &definition.property_definitions {
                let node = arena
                    .get_mut(handle)
                    .ok_or_else(|| SessionError::invalid_state("node no longer exists"))?;
                match node.property(&prop_def.name) {
                    None => {
                        if prop_def.auto_created {
                            let values = self.autocreated_values(&prop_def.name, prop_def)?;
                            node.set_property(
                                &prop_def.name,
                                prop_def.property_type,
                                values,
                                prop_def.multi_valued,
                            );
                            if prop_def.name == "jcr:uuid" {
                                let id = node
                                    .property("jcr:uuid")
                                    .and_then(|p| p.value())
                                    .and_then(Value::as_str)
                                    .map(str::to_string);
                                node.identifier = id;
                            }
                        } else if prop_def.mandatory {
                            return Err(SessionError::constraint(format!(
                                "mandatory property {} missing on {}",
                                prop_def.name, node_path
                            )));
                        }
                    }
                    Some(existing) => {
                        // Refresh the last-modified pair on untouched
                        // autocreated properties when enabled.
                        if prop_def.auto_created
                            && existing.is_clean()
                            && self.auto_last_modified
                            && (prop_def.name == "jcr:lastModified"
                                || prop_def.name == "jcr:lastModifiedBy")
                        {
                            let values = self.autocreated_values(&prop_def.name, prop_def)?;
                            node.set_property(
                                &prop_def.name,
                                prop_def.property_type,
                                values,
                                prop_def.multi_valued,
                            );
                        }
                    }
                }
            }
        }

        self.validate_property_values(handle, arena, namespaces)?;
        Ok(new_operations)
    }

    /// Values for an autocreated property: well-known names first, the
    /// declaration's defaults otherwise.
    fn autocreated_values(
        &self,
        name: &str,
        definition: &crate::models::PropertyDefinition,
    ) -> SessionResult<Vec<Value>> {
        let value = match name {
            "jcr:uuid" => json!(Uuid::new_v4().to_string()),
            "jcr:createdBy" | "jcr:lastModifiedBy" => json!(self.user_id),
            "jcr:created" | "jcr:lastModified" => {
                json!(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true))
            }
            "jcr:etag" => json!(""),
            _ => {
                if definition.default_values.is_empty() {
                    return Err(SessionError::constraint(format!(
                        "autocreated property {} declares no default value",
                        name
                    )));
                }
                return Ok(definition.default_values.clone());
            }
        };
        Ok(vec![value])
    }

    /// Validate every property value against its declared type syntax.
    fn validate_property_values(
        &self,
        handle: NodeHandle,
        arena: &NodeArena,
        namespaces: &NamespaceRegistry,
    ) -> SessionResult<()> {
        let node = arena
            .get(handle)
            .ok_or_else(|| SessionError::invalid_state("node no longer exists"))?;
        for property in node.properties.values() {
            for value in &property.values {
                match property.property_type {
                    PropertyType::Name => validate_name_value(&property.name, value, namespaces)?,
                    PropertyType::Path => validate_path_value(&property.name, value)?,
                    PropertyType::Uri => validate_uri_value(&property.name, value)?,
                    PropertyType::String | PropertyType::Decimal => {
                        if let Some(text) = value.as_str() {
                            if !is_valid_xml_text(text) {
                                return Err(SessionError::value_format(format!(
                                    "property {} contains characters not permitted in XML",
                                    property.name
                                )));
                            }
                        }
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }
}

fn validate_name_value(
    property: &str,
    value: &Value,
    namespaces: &NamespaceRegistry,
) -> SessionResult<()> {
    let text = value.as_str().ok_or_else(|| {
        SessionError::value_format(format!("NAME property {} is not a string", property))
    })?;
    path::validate_name(text)
        .map_err(|e| SessionError::value_format(format!("NAME property {}: {}", property, e)))?;
    if let Some(prefix) = path::name_prefix(text) {
        if !namespaces.is_registered(prefix) {
            return Err(SessionError::Namespace(prefix.to_string()));
        }
    }
    Ok(())
}

fn validate_path_value(property: &str, value: &Value) -> SessionResult<()> {
    let text = value.as_str().ok_or_else(|| {
        SessionError::value_format(format!("PATH property {} is not a string", property))
    })?;
    let parsed = if text.starts_with('/') {
        path::normalize(text)
    } else {
        path::resolve(path::ROOT, text)
    };
    parsed.map_err(|e| {
        SessionError::value_format(format!("PATH property {}: {}", property, e))
    })?;
    Ok(())
}

fn validate_uri_value(property: &str, value: &Value) -> SessionResult<()> {
    let text = value.as_str().ok_or_else(|| {
        SessionError::value_format(format!("URI property {} is not a string", property))
    })?;
    if !uri_regex().is_match(text) {
        return Err(SessionError::value_format(format!(
            "URI property {} does not match RFC 3986: {}",
            property, text
        )));
    }
    Ok(())
}
