//! The session object manager and its parts.
//!
//! - [`cache`] - node arena and the dual identity index
//! - [`op_log`] - ordered operation log and path rewriting
//! - [`processor`] - node-type validation and autocreation
//! - [`object_manager`] - the session façade tying everything together

pub mod cache;
pub mod error;
pub mod object_manager;
pub mod op_log;
pub mod processor;

pub use crate::models::NodeHandle;
pub use cache::{ItemCache, ItemClass, NodeArena};
pub use error::{SessionError, SessionResult};
pub use object_manager::{SessionConfig, SessionObjectManager};
pub use op_log::{FetchPath, OperationLog};
pub use processor::NodeProcessor;
