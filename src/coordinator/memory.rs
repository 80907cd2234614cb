use super::{Coordinator, CoordinatorError, SessionEvent, SessionListener};
use log::info;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Clone)]
struct NodeRecord {
    data: Vec<u8>,
    ephemeral_session: Option<u64>,
}

/// In-process coordinator used by tests and single-process deployments.
///
/// `expire_session` simulates a coordinator session loss: every ephemeral
/// node of the old session disappears and session listeners fire.
pub struct MemoryCoordinator {
    nodes: Mutex<HashMap<String, NodeRecord>>,
    removals: Condvar,
    session: AtomicU64,
    unavailable: AtomicBool,
    listeners: Mutex<Vec<SessionListener>>,
}

impl Default for MemoryCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCoordinator {
    pub fn new() -> Self {
        Self {
            nodes: Mutex::new(HashMap::new()),
            removals: Condvar::new(),
            session: AtomicU64::new(1),
            unavailable: AtomicBool::new(false),
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Makes every subsequent operation fail until re-enabled.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Expires the current session: drops its ephemerals, starts a new
    /// session, and notifies listeners.
    pub fn expire_session(&self) {
        let old_session = self.session.fetch_add(1, Ordering::SeqCst);
        {
            let mut nodes = self.nodes.lock();
            nodes.retain(|_, record| record.ephemeral_session != Some(old_session));
            self.removals.notify_all();
        }
        info!("event=coordinator_session_expired session={old_session}");
        for listener in self.listeners.lock().iter() {
            listener(SessionEvent::Expired);
        }
    }

    pub fn session_id(&self) -> u64 {
        self.session.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> Result<(), CoordinatorError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CoordinatorError::Unavailable {
                reason: "injected outage".to_string(),
            });
        }
        Ok(())
    }
}

impl Coordinator for MemoryCoordinator {
    fn read_node(&self, path: &str) -> Result<Option<Vec<u8>>, CoordinatorError> {
        self.check_available()?;
        Ok(self.nodes.lock().get(path).map(|record| record.data.clone()))
    }

    fn create_persistent(&self, path: &str, data: &[u8]) -> Result<(), CoordinatorError> {
        self.check_available()?;
        let mut nodes = self.nodes.lock();
        if nodes.contains_key(path) {
            return Err(CoordinatorError::NodeExists {
                path: path.to_string(),
            });
        }
        nodes.insert(
            path.to_string(),
            NodeRecord {
                data: data.to_vec(),
                ephemeral_session: None,
            },
        );
        Ok(())
    }

    fn set_node(&self, path: &str, data: &[u8]) -> Result<(), CoordinatorError> {
        self.check_available()?;
        self.nodes.lock().insert(
            path.to_string(),
            NodeRecord {
                data: data.to_vec(),
                ephemeral_session: None,
            },
        );
        Ok(())
    }

    fn create_ephemeral(&self, path: &str) -> Result<(), CoordinatorError> {
        self.check_available()?;
        let session = self.session.load(Ordering::SeqCst);
        let mut nodes = self.nodes.lock();
        if nodes.contains_key(path) {
            return Err(CoordinatorError::NodeExists {
                path: path.to_string(),
            });
        }
        nodes.insert(
            path.to_string(),
            NodeRecord {
                data: Vec::new(),
                ephemeral_session: Some(session),
            },
        );
        Ok(())
    }

    fn delete_node(&self, path: &str) -> Result<(), CoordinatorError> {
        self.check_available()?;
        let mut nodes = self.nodes.lock();
        if nodes.remove(path).is_none() {
            return Err(CoordinatorError::NoNode {
                path: path.to_string(),
            });
        }
        self.removals.notify_all();
        Ok(())
    }

    fn exists(&self, path: &str) -> Result<bool, CoordinatorError> {
        self.check_available()?;
        Ok(self.nodes.lock().contains_key(path))
    }

    fn owns_ephemeral(&self, path: &str) -> Result<bool, CoordinatorError> {
        self.check_available()?;
        let session = self.session.load(Ordering::SeqCst);
        Ok(self
            .nodes
            .lock()
            .get(path)
            .is_some_and(|record| record.ephemeral_session == Some(session)))
    }

    fn await_removal(&self, path: &str, timeout: Duration) -> Result<bool, CoordinatorError> {
        self.check_available()?;
        let mut nodes = self.nodes.lock();
        let deadline = std::time::Instant::now() + timeout;
        while nodes.contains_key(path) {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() {
                return Ok(false);
            }
            if self.removals.wait_for(&mut nodes, remaining).timed_out() {
                return Ok(!nodes.contains_key(path));
            }
        }
        Ok(true)
    }

    fn subscribe_session(&self, listener: SessionListener) {
        self.listeners.lock().push(listener);
    }
}
