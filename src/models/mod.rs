//! Data structures shared across the session layer.

pub mod item;
pub mod namespace;
pub mod node;
pub mod node_type;
pub mod operation;
pub mod path;

pub use item::{ItemState, Property, PropertyType};
pub use namespace::NamespaceRegistry;
pub use node::{ChildEntry, Node, NodeHandle, PayloadError};
pub use node_type::{
    ChildNodeDefinition, NodeTypeDefinition, NodeTypeRegistry, PropertyDefinition,
};
pub use operation::{Operation, OperationKind, PendingOperation};
pub use path::PathError;
