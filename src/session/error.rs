//! Session-layer error types.

use thiserror::Error;

use crate::models::path::PathError;
use crate::models::PayloadError;

/// Convenience alias for session results.
pub type SessionResult<T> = Result<T, SessionError>;

/// Errors raised by session operations.
///
/// Transport drivers participate by returning a `SessionError` inside
/// their `anyhow::Error`; [`SessionError::from_transport`] surfaces those
/// unchanged and wraps anything foreign as a repository fault.
#[derive(Error, Debug)]
pub enum SessionError {
    /// Path has no backing item after rewrite; also raised on reads of
    /// moved-away or deleted paths
    #[error("Item not found: {0}")]
    ItemNotFound(String),

    /// Attempted to add an item where one already exists, pending or
    /// persisted
    #[error("Item already exists: {0}")]
    ItemExists(String),

    /// Node-type rules rejected a value or a mandatory item is missing
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    /// Property value did not match its declared type's syntax
    #[error("Invalid value format: {0}")]
    ValueFormat(String),

    /// Used a prefix not registered for this session
    #[error("Unknown namespace prefix: {0}")]
    Namespace(String),

    /// The transport lacks the required capability
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// Relative path, deleted property, or parent missing at mutation time
    #[error("Path not found: {0}")]
    PathNotFound(String),

    /// The transport reported an authorisation failure
    #[error("Access denied: {0}")]
    AccessDenied(String),

    /// Catch-all for transport faults, wrapping the underlying cause
    #[error("Repository failure: {0}")]
    Repository(anyhow::Error),

    /// Operation attempted on a deleted item
    #[error("Invalid item state: {0}")]
    InvalidItemState(String),

    /// A transactional commit failed and was rolled back
    #[error("Transaction rolled back: {0}")]
    Rollback(String),

    /// An identifier was bound twice
    #[error("Duplicate identifier: {0}")]
    DuplicateIdentifier(String),
}

impl SessionError {
    /// Create an item-not-found error.
    pub fn item_not_found(path: impl Into<String>) -> Self {
        Self::ItemNotFound(path.into())
    }

    /// Item-not-found for a path whose subtree was moved away by a
    /// pending operation.
    pub fn moved_in_session(path: impl Into<String>) -> Self {
        Self::ItemNotFound(format!("{} (moved in the current session)", path.into()))
    }

    /// Item-not-found for a path deleted by a pending operation.
    pub fn deleted_in_session(path: impl Into<String>) -> Self {
        Self::ItemNotFound(format!("{} (deleted in the current session)", path.into()))
    }

    /// Create an item-exists error.
    pub fn item_exists(path: impl Into<String>) -> Self {
        Self::ItemExists(path.into())
    }

    /// Create a constraint-violation error.
    pub fn constraint(msg: impl Into<String>) -> Self {
        Self::ConstraintViolation(msg.into())
    }

    /// Create a value-format error.
    pub fn value_format(msg: impl Into<String>) -> Self {
        Self::ValueFormat(msg.into())
    }

    /// Create an unsupported-operation error.
    pub fn unsupported(capability: impl Into<String>) -> Self {
        Self::UnsupportedOperation(capability.into())
    }

    /// Create a path-not-found error.
    pub fn path_not_found(path: impl Into<String>) -> Self {
        Self::PathNotFound(path.into())
    }

    /// Create an invalid-item-state error.
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidItemState(msg.into())
    }

    /// Surface a transport error: a `SessionError` travelling inside the
    /// `anyhow::Error` comes back unchanged, anything else is wrapped as
    /// a repository fault.
    pub fn from_transport(err: anyhow::Error) -> Self {
        match err.downcast::<SessionError>() {
            Ok(session_error) => session_error,
            Err(foreign) => Self::Repository(foreign),
        }
    }

    /// True for the error kinds that mean "this path has nothing behind
    /// it", which bulk reads and reference resolution drop silently.
    pub fn is_missing_item(&self) -> bool {
        matches!(self, Self::ItemNotFound(_) | Self::PathNotFound(_))
    }
}

impl From<PathError> for SessionError {
    fn from(err: PathError) -> Self {
        Self::PathNotFound(err.to_string())
    }
}

impl From<PayloadError> for SessionError {
    fn from(err: PayloadError) -> Self {
        Self::Repository(err.into())
    }
}
