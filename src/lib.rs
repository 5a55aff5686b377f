//! Canopy client session layer
//!
//! This crate implements the client-side unit-of-work for a hierarchical
//! content repository: an in-memory cache of nodes and properties, a
//! staged operation log, and a `save`/`refresh` cycle that flushes or
//! undoes pending mutations against a pluggable backend transport.
//!
//! # Architecture
//!
//! - **Universal Node**: a single [`models::Node`] struct represents every
//!   vertex of the content tree; entity data lives in typed
//!   [`models::Property`] values backed by `serde_json`.
//! - **Transport abstraction**: all backend I/O goes through the async
//!   [`transport::Transport`] trait; write, transaction, versioning and
//!   type-filter support are optional capabilities probed at runtime.
//! - **Session isolation**: one [`session::SessionObjectManager`] per
//!   session, exclusively owned by one logical thread; reads observe all
//!   pending writes of the same session, never those of other sessions.
//!
//! # Modules
//!
//! - [`models`] - data structures (Node, Property, Operation, node types)
//! - [`transport`] - backend abstraction and capability traits
//! - [`session`] - the object manager, cache, operation log and processor

pub mod models;
pub mod session;
pub mod transport;

// Re-exports
pub use models::{
    ChildNodeDefinition, ItemState, NamespaceRegistry, Node, NodeTypeDefinition, NodeTypeRegistry,
    Operation, OperationKind, PendingOperation, Property, PropertyDefinition, PropertyType,
};
pub use session::{
    ItemClass, NodeHandle, SessionConfig, SessionError, SessionObjectManager, SessionResult,
};
pub use transport::{
    ChildReorder, PathMove, Transport, TransactionTransport, TypeFilterTransport,
    VersioningTransport, WritingTransport,
};
