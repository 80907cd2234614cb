use super::descriptor::LedgerDescriptor;
use super::storage::LedgerStorage;
use crate::error::BookieError;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Thread-safe cache of ledger descriptors, keyed by ledger id.
///
/// The first `get_handle` for a ledger fixes its master key; every later
/// open must present the same bytes.
pub struct HandleCache {
    storage: Arc<dyn LedgerStorage>,
    handles: Mutex<HashMap<u64, Arc<LedgerDescriptor>>>,
    read_only_handles: Mutex<HashMap<u64, Arc<LedgerDescriptor>>>,
}

impl HandleCache {
    pub fn new(storage: Arc<dyn LedgerStorage>) -> Self {
        Self {
            storage,
            handles: Mutex::new(HashMap::new()),
            read_only_handles: Mutex::new(HashMap::new()),
        }
    }

    pub fn get_handle(
        &self,
        ledger_id: u64,
        master_key: &[u8],
    ) -> Result<Arc<LedgerDescriptor>, BookieError> {
        let mut handles = self.handles.lock();
        if let Some(handle) = handles.get(&ledger_id) {
            handle.check_access(master_key)?;
            return Ok(Arc::clone(handle));
        }
        // seed the backend so read_master_key works during replay
        self.storage.set_master_key(ledger_id, master_key)?;
        let handle = Arc::new(LedgerDescriptor::new(
            master_key.to_vec(),
            ledger_id,
            Arc::clone(&self.storage),
        ));
        handles.insert(ledger_id, Arc::clone(&handle));
        Ok(handle)
    }

    /// Unauthenticated handle for read paths; refuses writes.
    pub fn get_read_only_handle(
        &self,
        ledger_id: u64,
    ) -> Result<Arc<LedgerDescriptor>, BookieError> {
        let mut handles = self.read_only_handles.lock();
        if let Some(handle) = handles.get(&ledger_id) {
            return Ok(Arc::clone(handle));
        }
        // fails with NoLedger for ledgers this bookie has never seen
        self.storage.read_master_key(ledger_id)?;
        let handle = Arc::new(LedgerDescriptor::new_read_only(
            ledger_id,
            Arc::clone(&self.storage),
        ));
        handles.insert(ledger_id, Arc::clone(&handle));
        Ok(handle)
    }
}
