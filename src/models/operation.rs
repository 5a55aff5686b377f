//! Pending mutation records.
//!
//! Every session-local write is journalled as one immutable `Operation`.
//! After append nothing in the record changes except the `skip` flag,
//! which withdraws the operation from the save without disturbing the
//! positions of later entries.

use serde::{Deserialize, Serialize};

use crate::models::item::Property;
use crate::models::node::NodeHandle;

/// Discriminator used to batch like operations with like at save time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OperationKind {
    AddNode,
    MoveNode,
    RemoveNode,
    RemoveProperty,
}

/// One pending mutation.
///
/// Paths are recorded as they were at append time; the save resolves an
/// added node's current path through its handle, never by rewriting the
/// record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum Operation {
    AddNode {
        path: String,
        node: NodeHandle,
    },
    MoveNode {
        src_path: String,
        dst_path: String,
    },
    RemoveNode {
        path: String,
        node: NodeHandle,
    },
    RemoveProperty {
        path: String,
        property: Property,
    },
}

impl Operation {
    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::AddNode { .. } => OperationKind::AddNode,
            Operation::MoveNode { .. } => OperationKind::MoveNode,
            Operation::RemoveNode { .. } => OperationKind::RemoveNode,
            Operation::RemoveProperty { .. } => OperationKind::RemoveProperty,
        }
    }
}

/// Log entry: an operation plus its withdrawal flag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingOperation {
    #[serde(flatten)]
    pub op: Operation,
    pub skip: bool,
}

impl PendingOperation {
    pub fn new(op: Operation) -> Self {
        Self { op, skip: false }
    }
}
