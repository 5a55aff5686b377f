//! Ordered log of pending mutations and the path rewriter.
//!
//! The log is append-only: after append only the `skip` flag of an entry
//! ever changes. Reads rewrite the requested path backwards through the
//! log (newest to oldest) to find the backend path that existed before
//! any pending moves and adds; saves drain the log forwards, batching
//! consecutive operations of the same kind.

use std::collections::HashMap;

use crate::models::path;
use crate::models::{NodeHandle, Operation, OperationKind, PendingOperation};
use crate::session::error::{SessionError, SessionResult};

/// Outcome of rewriting a wanted path through the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchPath {
    /// Consult the backend at this path.
    Backend(String),
    /// A pending add satisfies the path; the backend must not be
    /// consulted.
    Local,
}

/// Append-only operation log with per-kind side indexes.
#[derive(Debug, Default)]
pub struct OperationLog {
    ops: Vec<PendingOperation>,
    /// Pending adds by the node's current path
    adds_by_path: HashMap<String, usize>,
    /// Pending removes by path
    removes_by_path: HashMap<String, usize>,
    /// Pending moves, keyed by the original source path across chained
    /// moves so a refresh restores the original location
    moves_by_src: HashMap<String, String>,
}

impl OperationLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an operation and update the side indexes.
    pub fn append(&mut self, op: Operation) {
        let index = self.ops.len();
        match &op {
            Operation::AddNode { path, .. } => {
                self.adds_by_path.insert(path.clone(), index);
            }
            Operation::RemoveNode { path, .. } => {
                self.removes_by_path.insert(path.clone(), index);
            }
            Operation::MoveNode { src_path, dst_path } => {
                // Chained move: rekey to the earliest source.
                let original = self
                    .moves_by_src
                    .iter()
                    .find(|(_, dst)| *dst == src_path)
                    .map(|(src, _)| src.clone());
                match original {
                    Some(src) => {
                        self.moves_by_src.insert(src, dst_path.clone());
                    }
                    None => {
                        self.moves_by_src
                            .insert(src_path.clone(), dst_path.clone());
                    }
                }
            }
            Operation::RemoveProperty { .. } => {}
        }
        self.ops.push(PendingOperation::new(op));
    }

    /// True iff a non-skipped add is pending at `path`.
    pub fn has_pending_add(&self, path: &str) -> bool {
        self.adds_by_path.contains_key(path)
    }

    /// Withdraw the pending add at `path` (the node never reached the
    /// backend, so the save must not mention it). Returns the staged
    /// node's handle when an add was withdrawn.
    pub fn skip_add(&mut self, path: &str) -> Option<NodeHandle> {
        let index = self.adds_by_path.remove(path)?;
        let entry = &mut self.ops[index];
        entry.skip = true;
        match &entry.op {
            Operation::AddNode { node, .. } => Some(*node),
            _ => None,
        }
    }

    /// Rekey the pending-add index entries at or below `src` after a
    /// move; the staged nodes themselves carry their rewritten paths.
    pub fn rewrite_add_paths(&mut self, src: &str, dst: &str) {
        let affected: Vec<String> = self
            .adds_by_path
            .keys()
            .filter(|p| path::is_self_or_descendant(src, p))
            .cloned()
            .collect();
        for old in affected {
            if let Some(index) = self.adds_by_path.remove(&old) {
                let renamed = path::reparent(&old, src, dst);
                self.adds_by_path.insert(renamed, index);
            }
        }
    }

    /// Rewrite a session-visible path into the backend path to fetch.
    ///
    /// The log is traversed from newest to oldest:
    ///
    /// - a move whose source covers the wanted path fails (the subtree
    ///   was moved away in this session); a move whose destination covers
    ///   it is undone by substituting the destination prefix with the
    ///   source, and traversal continues;
    /// - a remove covering the wanted path fails (deleted in this
    ///   session);
    /// - an add at exactly the wanted path short-circuits: the node is
    ///   local and the backend must not be consulted.
    pub fn fetch_path(&self, wanted: &str) -> SessionResult<FetchPath> {
        let mut current = wanted.to_string();
        for entry in self.ops.iter().rev() {
            if entry.skip {
                continue;
            }
            match &entry.op {
                Operation::MoveNode { src_path, dst_path } => {
                    if path::is_self_or_descendant(src_path, &current) {
                        return Err(SessionError::moved_in_session(wanted));
                    }
                    if path::is_self_or_descendant(dst_path, &current) {
                        current = path::reparent(&current, dst_path, src_path);
                    }
                }
                Operation::RemoveNode { path: removed, .. }
                | Operation::RemoveProperty { path: removed, .. } => {
                    if path::is_self_or_descendant(removed, &current) {
                        return Err(SessionError::deleted_in_session(wanted));
                    }
                }
                Operation::AddNode { path: added, .. } => {
                    if added == &current {
                        return Ok(FetchPath::Local);
                    }
                }
            }
        }
        Ok(FetchPath::Backend(current))
    }

    /// Group the non-skipped operations into kind-contiguous batches,
    /// preserving log order: a kind boundary closes the current batch,
    /// and no reordering across kinds ever happens.
    pub fn grouped(&self) -> Vec<(OperationKind, Vec<&Operation>)> {
        let mut batches: Vec<(OperationKind, Vec<&Operation>)> = Vec::new();
        for entry in &self.ops {
            if entry.skip {
                continue;
            }
            let kind = entry.op.kind();
            match batches.last_mut() {
                Some((last_kind, ops)) if *last_kind == kind => ops.push(&entry.op),
                _ => batches.push((kind, vec![&entry.op])),
            }
        }
        batches
    }

    pub fn ops(&self) -> &[PendingOperation] {
        &self.ops
    }

    pub fn op_at(&self, index: usize) -> Option<&PendingOperation> {
        self.ops.get(index)
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Number of non-skipped pending adds.
    pub fn pending_add_count(&self) -> usize {
        self.adds_by_path.len()
    }

    pub fn pending_remove_count(&self) -> usize {
        self.removes_by_path.len()
    }

    pub fn pending_move_count(&self) -> usize {
        self.moves_by_src.len()
    }

    /// The destination an original source path currently maps to.
    pub fn move_destination(&self, original_src: &str) -> Option<&str> {
        self.moves_by_src.get(original_src).map(String::as_str)
    }

    /// Drain the log and all side indexes, returning the entries for a
    /// reverse walk.
    pub fn take_ops(&mut self) -> Vec<PendingOperation> {
        self.adds_by_path.clear();
        self.removes_by_path.clear();
        self.moves_by_src.clear();
        std::mem::take(&mut self.ops)
    }

    /// Reset the log and all side indexes.
    pub fn clear(&mut self) {
        self.ops.clear();
        self.adds_by_path.clear();
        self.removes_by_path.clear();
        self.moves_by_src.clear();
    }
}
