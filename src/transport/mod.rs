//! Backend transport abstraction.
//!
//! All backend I/O goes through the [`Transport`] trait. The base trait
//! covers reading and namespace discovery, which every driver must
//! support. Writing, transactions, versioning and server-side type
//! filtering are optional capabilities: a driver advertises them by
//! returning itself from the corresponding probe method, and the session
//! raises `UnsupportedOperation` on the public calls a missing capability
//! would back.
//!
//! # Payload shape
//!
//! A node payload is a keyed JSON record. Keys beginning with `:` carry
//! type metadata for the same-named plain property (for binary
//! properties the metadata is the value size or size list and no plain
//! key exists); `::NodeIteratorSize` is a reserved hint and is ignored.
//! Object-valued entries denote child nodes, inlined in full when the
//! backend chose to prefetch them.
//!
//! # Errors
//!
//! All methods return `anyhow::Result`. A driver signals a domain
//! condition (item missing, access denied, …) by returning a
//! [`SessionError`](crate::session::SessionError) inside the error; the
//! session surfaces those unchanged and wraps anything else as a
//! repository fault.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;

use crate::models::Node;

/// One move job inside a `move_nodes` batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathMove {
    pub src_path: String,
    pub dst_path: String,
}

/// One step of a child-reorder diff: move `name` before `before`, or to
/// the end of the child list when `before` is `None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildReorder {
    pub name: String,
    pub before: Option<String>,
}

/// Read access to the backend. Required of every driver.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Fetch the payload of the node at an absolute backend path.
    async fn get_node(&self, path: &str) -> anyhow::Result<Value>;

    /// Fetch several nodes at once; paths the backend does not know are
    /// simply absent from the result.
    async fn get_nodes(&self, paths: Vec<String>) -> anyhow::Result<HashMap<String, Value>>;

    /// Resolve an identifier to `(path, payload)`.
    async fn get_node_by_identifier(&self, identifier: &str) -> anyhow::Result<(String, Value)>;

    /// Resolve several identifiers at once.
    async fn get_nodes_by_identifier(
        &self,
        identifiers: Vec<String>,
    ) -> anyhow::Result<HashMap<String, (String, Value)>>;

    /// Stream the bytes of a binary property.
    async fn get_binary_stream(&self, path: &str) -> anyhow::Result<Vec<u8>>;

    /// Paths of REFERENCE properties pointing at the node, optionally
    /// restricted to a property name.
    async fn get_references(
        &self,
        path: &str,
        name: Option<&str>,
    ) -> anyhow::Result<Vec<String>>;

    /// Paths of WEAKREFERENCE properties pointing at the node.
    async fn get_weak_references(
        &self,
        path: &str,
        name: Option<&str>,
    ) -> anyhow::Result<Vec<String>>;

    /// The backend's namespace prefix map.
    async fn get_namespaces(&self) -> anyhow::Result<HashMap<String, String>>;

    //
    // CAPABILITY PROBES
    //

    fn writing(&self) -> Option<&dyn WritingTransport> {
        None
    }

    fn transactions(&self) -> Option<&dyn TransactionTransport> {
        None
    }

    fn versioning(&self) -> Option<&dyn VersioningTransport> {
        None
    }

    fn type_filtering(&self) -> Option<&dyn TypeFilterTransport> {
        None
    }
}

/// Write access: staged batches, immediate writes and the save bracket.
#[async_trait]
pub trait WritingTransport: Send + Sync {
    /// Reject names the backend cannot store.
    async fn assert_valid_name(&self, name: &str) -> anyhow::Result<()>;

    /// Persist a batch of added nodes; each node carries its own path.
    async fn store_nodes(&self, nodes: Vec<Node>) -> anyhow::Result<()>;

    /// Execute a batch of moves.
    async fn move_nodes(&self, moves: Vec<PathMove>) -> anyhow::Result<()>;

    /// Delete a batch of nodes; the backend removes each subtree.
    async fn delete_nodes(&self, paths: Vec<String>) -> anyhow::Result<()>;

    /// Delete a batch of properties, addressed by property path.
    async fn delete_properties(&self, paths: Vec<String>) -> anyhow::Result<()>;

    /// Persist the property state of a modified node.
    async fn update_properties(&self, node: &Node) -> anyhow::Result<()>;

    /// Apply a child-reorder diff to the node at `path`.
    async fn reorder_children(
        &self,
        path: &str,
        reorders: Vec<ChildReorder>,
    ) -> anyhow::Result<()>;

    /// Copy a subtree, optionally from another workspace.
    async fn copy_node(
        &self,
        src_path: &str,
        dst_path: &str,
        src_workspace: Option<&str>,
    ) -> anyhow::Result<()>;

    /// Clone a subtree from another workspace.
    async fn clone_from(
        &self,
        src_workspace: &str,
        src_path: &str,
        dst_path: &str,
        remove_existing: bool,
    ) -> anyhow::Result<()>;

    /// Move a node right away, outside the save cycle.
    async fn move_node_immediately(&self, src_path: &str, dst_path: &str) -> anyhow::Result<()>;

    /// Delete a node right away, outside the save cycle.
    async fn delete_node_immediately(&self, path: &str) -> anyhow::Result<()>;

    /// Delete a property right away, outside the save cycle.
    async fn delete_property_immediately(&self, path: &str) -> anyhow::Result<()>;

    /// Open the save bracket.
    async fn prepare_save(&self) -> anyhow::Result<()>;

    /// Close the save bracket after all batches succeeded.
    async fn finish_save(&self) -> anyhow::Result<()>;

    /// Abandon the save bracket after a failure.
    async fn rollback_save(&self) -> anyhow::Result<()>;
}

/// Backend transactions spanning several saves.
#[async_trait]
pub trait TransactionTransport: Send + Sync {
    async fn begin_transaction(&self) -> anyhow::Result<()>;

    async fn commit_transaction(&self) -> anyhow::Result<()>;

    async fn rollback_transaction(&self) -> anyhow::Result<()>;
}

/// Version store access.
#[async_trait]
pub trait VersioningTransport: Send + Sync {
    /// Create a version of the node at `path`; returns the version path.
    async fn checkin(&self, path: &str) -> anyhow::Result<String>;

    /// Make the node at `path` writable again.
    async fn checkout(&self, path: &str) -> anyhow::Result<()>;

    /// Remove a version from its history.
    async fn remove_version(&self, version_path: &str) -> anyhow::Result<()>;
}

/// Server-side node-type filtering for bulk reads.
#[async_trait]
pub trait TypeFilterTransport: Send + Sync {
    /// Like `get_nodes`, but the backend drops nodes matching none of
    /// the given type names (primary or mixin, supertypes included).
    async fn get_nodes_filtered(
        &self,
        paths: Vec<String>,
        type_filter: Vec<String>,
    ) -> anyhow::Result<HashMap<String, Value>>;
}
