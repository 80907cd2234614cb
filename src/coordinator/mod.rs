//! Abstract cluster coordinator: registration nodes, cookies, sessions.
//!
//! The wire protocol is out of scope; the bookie only needs a small node
//! store with ephemeral ownership and session-expiry notifications.

pub mod memory;

pub use memory::MemoryCoordinator;

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    Expired,
}

pub type SessionListener = Box<dyn Fn(SessionEvent) + Send + Sync>;

/// Coordinator operations used by the bookie.
///
/// Paths are slash-separated, rooted at the cluster namespace. Ephemeral
/// nodes vanish when the creating session expires.
pub trait Coordinator: Send + Sync {
    fn read_node(&self, path: &str) -> Result<Option<Vec<u8>>, CoordinatorError>;

    /// Creates a persistent node; fails with `NodeExists` when present.
    fn create_persistent(&self, path: &str, data: &[u8]) -> Result<(), CoordinatorError>;

    /// Creates or replaces a persistent node.
    fn set_node(&self, path: &str, data: &[u8]) -> Result<(), CoordinatorError>;

    /// Creates an ephemeral node bound to the current session.
    fn create_ephemeral(&self, path: &str) -> Result<(), CoordinatorError>;

    /// Deletes a node; fails with `NoNode` when absent.
    fn delete_node(&self, path: &str) -> Result<(), CoordinatorError>;

    fn exists(&self, path: &str) -> Result<bool, CoordinatorError>;

    /// True when the node is an ephemeral owned by the current session.
    fn owns_ephemeral(&self, path: &str) -> Result<bool, CoordinatorError>;

    /// Blocks until the node is removed; returns false on timeout.
    fn await_removal(&self, path: &str, timeout: Duration) -> Result<bool, CoordinatorError>;

    fn subscribe_session(&self, listener: SessionListener);
}

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("node {path} not found")]
    NoNode { path: String },
    #[error("node {path} already exists")]
    NodeExists { path: String },
    #[error("coordinator session expired")]
    SessionExpired,
    #[error("coordinator unavailable: {reason}")]
    Unavailable { reason: String },
}
