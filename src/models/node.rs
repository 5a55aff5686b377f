//! The cached node: a named vertex of the content tree.
//!
//! A `Node` owns its properties and the ordered list of its child names.
//! Parent/child linkage is by path only; the session cache resolves a
//! parent by looking up `path::parent_path(node.path)`, so nodes never
//! hold owning back-pointers.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::models::item::{ItemState, Property, PropertyType};
use crate::models::path;

/// Reserved payload key carrying the backend's child-count hint.
pub const NODE_ITERATOR_SIZE: &str = "::NodeIteratorSize";

const PRIMARY_TYPE: &str = "jcr:primaryType";
const MIXIN_TYPES: &str = "jcr:mixinTypes";
const UUID_PROPERTY: &str = "jcr:uuid";

/// Errors raised while ingesting a backend payload.
#[derive(Error, Debug)]
pub enum PayloadError {
    #[error("Payload for {path} is not a keyed record")]
    NotARecord { path: String },

    #[error("Payload for {path} has malformed entry {key}: {reason}")]
    MalformedEntry {
        path: String,
        key: String,
        reason: String,
    },
}

/// Copyable key of a node slot in the session arena.
///
/// Handles are allocated once per in-memory node and never reused within
/// a session, so they stay valid across moves and renames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeHandle(pub(crate) u64);

/// A child entry discovered while parsing a payload.
///
/// `payload` is `Some` when the backend inlined the child's full data
/// (prefetch); `None` when only the name (or an identifier stub) was sent.
#[derive(Debug, Clone)]
pub struct ChildEntry {
    pub name: String,
    pub payload: Option<Value>,
}

/// A named vertex in the repository tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    /// Absolute path; rewritten in place when the node is moved
    pub path: String,

    /// Stable identifier; set once, present iff the node is referenceable
    /// or has been assigned one
    pub identifier: Option<String>,

    /// Primary type name
    pub primary_type: String,

    /// Ordered mixin type names
    pub mixin_types: Vec<String>,

    /// Same-name-sibling index; always recorded as 1
    pub index: u32,

    /// Ordered child names
    pub child_names: Vec<String>,

    /// Properties by name
    pub properties: BTreeMap<String, Property>,

    /// Removed properties retained until the removal is saved, so a
    /// refresh can restore them
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub deleted_properties: HashMap<String, Property>,

    /// Child order observed at load time; non-null iff the node has been
    /// reordered since, cleared when the reorder is saved
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_child_order: Option<Vec<String>>,

    /// Lifecycle state
    pub state: ItemState,

    /// State snapshot taken at `begin_transaction`
    #[serde(skip)]
    saved_state: Option<ItemState>,
}

impl Node {
    /// Create a node staged for addition in this session.
    pub fn new_staged(path: impl Into<String>, primary_type: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            identifier: None,
            primary_type: primary_type.into(),
            mixin_types: Vec::new(),
            index: 1,
            child_names: Vec::new(),
            properties: BTreeMap::new(),
            deleted_properties: HashMap::new(),
            original_child_order: None,
            state: ItemState::New,
            saved_state: None,
        }
    }

    /// Parse a backend payload into a clean node plus its child entries.
    ///
    /// Keys beginning with `:` carry type metadata for the same-named
    /// plain property; `::NodeIteratorSize` is a reserved hint and is
    /// ignored. Object-valued entries denote child nodes; a child whose
    /// record holds more than one field, or a single field that is not
    /// just the identifier, counts as fully inlined data. Metadata keys
    /// without a plain counterpart describe binary properties, whose
    /// value is the size (or size list) only.
    pub fn from_payload(path: &str, payload: &Value) -> Result<(Self, Vec<ChildEntry>), PayloadError> {
        let record = payload.as_object().ok_or_else(|| PayloadError::NotARecord {
            path: path.to_string(),
        })?;

        let mut node = Self {
            path: path.to_string(),
            identifier: None,
            primary_type: "nt:unstructured".to_string(),
            mixin_types: Vec::new(),
            index: 1,
            child_names: Vec::new(),
            properties: BTreeMap::new(),
            deleted_properties: HashMap::new(),
            original_child_order: None,
            state: ItemState::Clean,
            saved_state: None,
        };
        let mut children = Vec::new();
        let mut metadata: HashMap<&str, &Value> = HashMap::new();

        for (key, value) in record {
            if key == NODE_ITERATOR_SIZE {
                continue;
            }
            if let Some(meta_name) = key.strip_prefix(':') {
                metadata.insert(meta_name, value);
                continue;
            }
            if let Some(child) = value.as_object() {
                let full_data = child.len() > 1
                    || child.keys().next().map(String::as_str) != Some(UUID_PROPERTY);
                node.child_names.push(key.clone());
                children.push(ChildEntry {
                    name: key.clone(),
                    payload: full_data.then(|| value.clone()),
                });
                continue;
            }
            match key.as_str() {
                PRIMARY_TYPE => {
                    node.primary_type = value
                        .as_str()
                        .ok_or_else(|| PayloadError::MalformedEntry {
                            path: path.to_string(),
                            key: key.clone(),
                            reason: "primary type is not a string".to_string(),
                        })?
                        .to_string();
                }
                MIXIN_TYPES => {
                    let list = value.as_array().ok_or_else(|| PayloadError::MalformedEntry {
                        path: path.to_string(),
                        key: key.clone(),
                        reason: "mixin list is not an array".to_string(),
                    })?;
                    node.mixin_types = list
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect();
                }
                _ => {
                    if key == UUID_PROPERTY {
                        node.identifier = value.as_str().map(str::to_string);
                    }
                    let declared = metadata
                        .get(key.as_str())
                        .and_then(|m| m.as_str())
                        .and_then(PropertyType::from_metadata);
                    node.insert_loaded_property(key, value, declared);
                }
            }
        }

        // Late metadata: a `:name` entry may precede or follow its plain
        // counterpart in the record, so reconcile after the full pass.
        for (meta_name, meta_value) in metadata {
            if let Some(prop) = node.properties.get_mut(meta_name) {
                if let Some(declared) = meta_value.as_str().and_then(PropertyType::from_metadata) {
                    prop.property_type = declared;
                }
                continue;
            }
            if node.child_names.iter().any(|c| c == meta_name) {
                continue;
            }
            // Metadata with no plain counterpart: a binary property whose
            // payload is the value size or size list.
            let (values, multi) = match meta_value {
                Value::Array(sizes) => (sizes.clone(), true),
                other => (vec![other.clone()], false),
            };
            let mut prop = if multi {
                Property::new_multi(meta_name, PropertyType::Binary, values)
            } else {
                Property::new(meta_name, PropertyType::Binary, values[0].clone())
            };
            prop.confirm_saved();
            node.properties.insert(meta_name.to_string(), prop);
        }

        Ok((node, children))
    }

    fn insert_loaded_property(&mut self, name: &str, value: &Value, declared: Option<PropertyType>) {
        let mut prop = match value {
            Value::Array(items) => {
                let property_type = declared
                    .or_else(|| items.first().map(PropertyType::infer))
                    .unwrap_or(PropertyType::String);
                Property::new_multi(name, property_type, items.clone())
            }
            single => {
                let property_type = declared.unwrap_or_else(|| PropertyType::infer(single));
                Property::new(name, property_type, single.clone())
            }
        };
        prop.confirm_saved();
        self.properties.insert(name.to_string(), prop);
    }

    /// The node's name among its siblings.
    pub fn name(&self) -> &str {
        path::node_name(&self.path)
    }

    pub fn is_deleted(&self) -> bool {
        self.state == ItemState::Deleted
    }

    /// Mark the node as carrying local changes to flush.
    ///
    /// New nodes stay new (the pending add already covers them); deleted
    /// nodes are never revived here.
    pub fn mark_modified(&mut self) {
        match self.state {
            ItemState::New | ItemState::Deleted => {}
            _ => self.state = ItemState::Modified,
        }
    }

    /// Mark the node's path as rewritten by a pending move. A modified
    /// node keeps its modified state so its properties still flush.
    pub fn mark_moved(&mut self) {
        if matches!(self.state, ItemState::Clean | ItemState::Dirty) {
            self.state = ItemState::Moved;
        }
    }

    pub fn mark_deleted(&mut self) {
        self.state = ItemState::Deleted;
    }

    pub fn mark_dirty(&mut self) {
        if self.state == ItemState::Clean {
            self.state = ItemState::Dirty;
        }
    }

    /// Return the node to the clean state after a successful save.
    pub fn confirm_saved(&mut self) {
        self.state = ItemState::Clean;
        self.deleted_properties.clear();
        self.original_child_order = None;
        for prop in self.properties.values_mut() {
            prop.confirm_saved();
        }
    }

    /// Overwrite this node's data with a freshly parsed backend payload,
    /// keeping the path it is cached under.
    pub fn refresh_from(&mut self, parsed: Node) {
        self.identifier = parsed.identifier;
        self.primary_type = parsed.primary_type;
        self.mixin_types = parsed.mixin_types;
        self.child_names = parsed.child_names;
        self.properties = parsed.properties;
        self.deleted_properties.clear();
        self.original_child_order = None;
        self.state = ItemState::Clean;
    }

    //
    // PROPERTY MANAGEMENT
    //

    pub fn property(&self, name: &str) -> Option<&Property> {
        self.properties.get(name)
    }

    /// Set or update a property, marking node and property accordingly.
    pub fn set_property(
        &mut self,
        name: &str,
        property_type: PropertyType,
        values: Vec<Value>,
        multi_valued: bool,
    ) {
        match self.properties.get_mut(name) {
            Some(existing) => {
                existing.property_type = property_type;
                existing.set_values(values, multi_valued);
            }
            None => {
                let prop = if multi_valued {
                    Property::new_multi(name, property_type, values)
                } else {
                    Property::new(name, property_type, values.into_iter().next().unwrap_or(Value::Null))
                };
                self.properties.insert(name.to_string(), prop);
            }
        }
        self.mark_modified();
    }

    /// Remove a property, retaining the prior object for refresh.
    ///
    /// Returns the removed property, or `None` if it did not exist.
    pub fn remove_property(&mut self, name: &str) -> Option<Property> {
        let removed = self.properties.remove(name)?;
        if !removed.is_new() {
            self.deleted_properties
                .insert(name.to_string(), removed.clone());
        }
        Some(removed)
    }

    /// Reinstate a property removed earlier in this session.
    pub fn restore_property(&mut self, mut property: Property) {
        self.deleted_properties.remove(&property.name);
        property.confirm_saved();
        self.properties.insert(property.name.clone(), property);
    }

    //
    // CHILD MANAGEMENT
    //

    pub fn has_child(&self, name: &str) -> bool {
        self.child_names.iter().any(|c| c == name)
    }

    /// Record a new child name at the end of the child list.
    pub fn add_child_name(&mut self, name: &str) {
        if !self.has_child(name) {
            self.child_names.push(name.to_string());
        }
    }

    /// Drop a child name from the child list.
    pub fn remove_child_name(&mut self, name: &str) {
        self.child_names.retain(|c| c != name);
    }

    /// Move child `src` before `before` (or to the end when `None`),
    /// snapshotting the current order on the first reorder.
    ///
    /// The caller has already validated that `src` (and `before`, when
    /// given) are present.
    pub fn order_child_before(&mut self, src: &str, before: Option<&str>) {
        if self.original_child_order.is_none() {
            self.original_child_order = Some(self.child_names.clone());
        }
        self.child_names.retain(|c| c != src);
        match before.and_then(|b| self.child_names.iter().position(|c| c == b)) {
            Some(pos) => self.child_names.insert(pos, src.to_string()),
            None => self.child_names.push(src.to_string()),
        }
    }

    /// Compute the reorder steps that transform `original_child_order`
    /// into the current child list.
    ///
    /// Each step is `(name, anchor)`: move `name` before `anchor`, or to
    /// the end when the anchor is `None`. Applying the steps in sequence
    /// to the snapshot yields the current order.
    pub fn reorder_steps(&self) -> Vec<(String, Option<String>)> {
        let Some(original) = &self.original_child_order else {
            return Vec::new();
        };
        let mut working = original.clone();
        let mut steps = Vec::new();
        for (i, name) in self.child_names.iter().enumerate() {
            if working.get(i) == Some(name) {
                continue;
            }
            if let Some(pos) = working.iter().position(|c| c == name) {
                working.remove(pos);
            }
            let anchor = working.get(i).cloned();
            let at = i.min(working.len());
            working.insert(at, name.clone());
            steps.push((name.clone(), anchor));
        }
        steps
    }

    //
    // TRANSACTION NOTIFICATION
    //

    /// Snapshot lifecycle states at transaction begin.
    pub fn begin_transaction(&mut self) {
        self.saved_state = Some(self.state);
        for prop in self.properties.values_mut() {
            prop.begin_transaction();
        }
    }

    /// Drop the snapshots after a successful commit.
    pub fn commit_transaction(&mut self) {
        self.saved_state = None;
        for prop in self.properties.values_mut() {
            prop.commit_transaction();
        }
    }

    /// Restore the states recorded at transaction begin.
    pub fn rollback_transaction(&mut self) {
        if let Some(saved) = self.saved_state.take() {
            self.state = saved;
        }
        for prop in self.properties.values_mut() {
            prop.rollback_transaction();
        }
    }
}
