//! Node arena and the dual identity index.
//!
//! Nodes are owned by a [`NodeArena`] and addressed by [`NodeHandle`];
//! the [`ItemCache`] maps paths to handles (partitioned by item class, so
//! the same path can hold both a regular node and a version node) and
//! identifiers to paths. The cache maintains the invariant that every
//! identifier binding targets a path present in the path map.

use std::collections::HashMap;

use crate::models::{Node, NodeHandle};
use crate::session::error::{SessionError, SessionResult};

/// Partition tag of a cached item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ItemClass {
    /// Workspace content
    Regular,
    /// Version storage mirror
    Version,
}

/// Single-owner store of all in-memory nodes of a session.
///
/// Handles are never reused within a session, so a handle stays valid
/// (or dangles detectably) across moves and deletions.
#[derive(Debug, Default)]
pub struct NodeArena {
    nodes: HashMap<NodeHandle, Node>,
    next: u64,
}

impl NodeArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of a node, returning its handle.
    pub fn allocate(&mut self, node: Node) -> NodeHandle {
        let handle = NodeHandle(self.next);
        self.next += 1;
        self.nodes.insert(handle, node);
        handle
    }

    pub fn get(&self, handle: NodeHandle) -> Option<&Node> {
        self.nodes.get(&handle)
    }

    pub fn get_mut(&mut self, handle: NodeHandle) -> Option<&mut Node> {
        self.nodes.get_mut(&handle)
    }

    pub fn remove(&mut self, handle: NodeHandle) -> Option<Node> {
        self.nodes.remove(&handle)
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeHandle, &Node)> {
        self.nodes.iter().map(|(h, n)| (*h, n))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (NodeHandle, &mut Node)> {
        self.nodes.iter_mut().map(|(h, n)| (*h, n))
    }

    /// Drop every node the predicate rejects.
    pub fn retain(&mut self, mut keep: impl FnMut(&Node) -> bool) {
        self.nodes.retain(|_, node| keep(node));
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
    }
}

/// Dual identity index: `(class, path) → handle` and `identifier → path`.
#[derive(Debug, Default)]
pub struct ItemCache {
    regular: HashMap<String, NodeHandle>,
    version: HashMap<String, NodeHandle>,
    by_identifier: HashMap<String, String>,
}

impl ItemCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn partition(&self, class: ItemClass) -> &HashMap<String, NodeHandle> {
        match class {
            ItemClass::Regular => &self.regular,
            ItemClass::Version => &self.version,
        }
    }

    fn partition_mut(&mut self, class: ItemClass) -> &mut HashMap<String, NodeHandle> {
        match class {
            ItemClass::Regular => &mut self.regular,
            ItemClass::Version => &mut self.version,
        }
    }

    /// Cache a node under a path, binding its identifier when present.
    ///
    /// Rebinding an identifier to a new path (a move) is legal; first-time
    /// binding goes through [`ItemCache::register_identifier`] semantics
    /// when the caller needs the duplicate check.
    pub fn put(
        &mut self,
        class: ItemClass,
        path: impl Into<String>,
        handle: NodeHandle,
        identifier: Option<&str>,
    ) {
        let path = path.into();
        if let Some(id) = identifier {
            self.by_identifier.insert(id.to_string(), path.clone());
        }
        self.partition_mut(class).insert(path, handle);
    }

    /// Drop a path from the cache, purging its identifier binding.
    pub fn remove(&mut self, class: ItemClass, path: &str, identifier: Option<&str>) {
        self.partition_mut(class).remove(path);
        if let Some(id) = identifier {
            if self.by_identifier.get(id).map(String::as_str) == Some(path) {
                self.by_identifier.remove(id);
            }
        }
    }

    /// Bind an identifier for the first time.
    pub fn register_identifier(
        &mut self,
        identifier: &str,
        path: impl Into<String>,
    ) -> SessionResult<()> {
        let path = path.into();
        match self.by_identifier.get(identifier) {
            Some(existing) if existing != &path => Err(SessionError::DuplicateIdentifier(
                format!("{} already bound to {}", identifier, existing),
            )),
            _ => {
                self.by_identifier.insert(identifier.to_string(), path);
                Ok(())
            }
        }
    }

    pub fn get(&self, class: ItemClass, path: &str) -> Option<NodeHandle> {
        self.partition(class).get(path).copied()
    }

    pub fn path_for_identifier(&self, identifier: &str) -> Option<&str> {
        self.by_identifier.get(identifier).map(String::as_str)
    }

    /// Cached paths strictly below `base` in one partition.
    pub fn descendants_of(&self, class: ItemClass, base: &str) -> Vec<String> {
        use crate::models::path;
        self.partition(class)
            .keys()
            .filter(|p| path::is_strict_ancestor(base, p))
            .cloned()
            .collect()
    }

    /// Cached paths equal to or strictly below `base` in one partition.
    pub fn subtree_of(&self, class: ItemClass, base: &str) -> Vec<String> {
        use crate::models::path;
        self.partition(class)
            .keys()
            .filter(|p| path::is_self_or_descendant(base, p))
            .cloned()
            .collect()
    }

    /// All `(path, handle)` entries of one partition.
    pub fn entries(&self, class: ItemClass) -> Vec<(String, NodeHandle)> {
        self.partition(class)
            .iter()
            .map(|(p, h)| (p.clone(), *h))
            .collect()
    }

    pub fn identifier_count(&self) -> usize {
        self.by_identifier.len()
    }

    pub fn clear_identifiers(&mut self) {
        self.by_identifier.clear();
    }

    /// Rebuild the identifier map from the surviving cached nodes.
    pub fn reindex_identifiers(&mut self, arena: &NodeArena) {
        self.by_identifier.clear();
        for partition in [&self.regular, &self.version] {
            for (path, handle) in partition {
                if let Some(id) = arena.get(*handle).and_then(|n| n.identifier.clone()) {
                    self.by_identifier.insert(id, path.clone());
                }
            }
        }
    }

    pub fn clear(&mut self) {
        self.regular.clear();
        self.version.clear();
        self.by_identifier.clear();
    }
}
