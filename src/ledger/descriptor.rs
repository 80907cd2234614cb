use super::storage::{LacWaiter, LedgerStorage};
use crate::error::BookieError;
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;

/// In-memory authenticated handle to one ledger.
///
/// The handle cache exclusively owns descriptors; write paths run under
/// [`LedgerDescriptor::lock_write`] so the fenced check and the storage add
/// are atomic with respect to fencing.
pub struct LedgerDescriptor {
    ledger_id: u64,
    master_key: Vec<u8>,
    read_only: bool,
    write_lock: Mutex<()>,
    storage: Arc<dyn LedgerStorage>,
}

impl std::fmt::Debug for LedgerDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerDescriptor")
            .field("ledger_id", &self.ledger_id)
            .field("read_only", &self.read_only)
            .finish_non_exhaustive()
    }
}

impl LedgerDescriptor {
    pub(crate) fn new(
        master_key: Vec<u8>,
        ledger_id: u64,
        storage: Arc<dyn LedgerStorage>,
    ) -> Self {
        Self {
            ledger_id,
            master_key,
            read_only: false,
            write_lock: Mutex::new(()),
            storage,
        }
    }

    pub(crate) fn new_read_only(ledger_id: u64, storage: Arc<dyn LedgerStorage>) -> Self {
        Self {
            ledger_id,
            master_key: Vec::new(),
            read_only: true,
            write_lock: Mutex::new(()),
            storage,
        }
    }

    pub fn ledger_id(&self) -> u64 {
        self.ledger_id
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Byte-exact master key comparison; read-only handles never pass.
    pub fn check_access(&self, master_key: &[u8]) -> Result<(), BookieError> {
        if self.read_only || self.master_key != master_key {
            return Err(BookieError::UnauthorizedAccess {
                ledger_id: self.ledger_id,
            });
        }
        Ok(())
    }

    /// Serializes write paths for this ledger.
    pub fn lock_write(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock()
    }

    pub fn set_fenced(&self) -> Result<bool, BookieError> {
        if self.read_only {
            return Err(BookieError::UnauthorizedAccess {
                ledger_id: self.ledger_id,
            });
        }
        self.storage.set_fenced(self.ledger_id)
    }

    pub fn is_fenced(&self) -> Result<bool, BookieError> {
        self.storage.is_fenced(self.ledger_id)
    }

    /// Stores the entry, whose prefix must carry this descriptor's ledger id.
    pub fn add_entry(&self, entry: &[u8]) -> Result<u64, BookieError> {
        if self.read_only {
            return Err(BookieError::UnauthorizedAccess {
                ledger_id: self.ledger_id,
            });
        }
        if entry.len() >= 8 {
            let mut prefix = [0u8; 8];
            prefix.copy_from_slice(&entry[..8]);
            let ledger_id = u64::from_be_bytes(prefix);
            if ledger_id != self.ledger_id {
                return Err(BookieError::DiskError {
                    reason: format!(
                        "entry for ledger {ledger_id} was sent to {}",
                        self.ledger_id
                    ),
                });
            }
        }
        self.storage.add_entry(entry)
    }

    pub fn read_entry(&self, entry_id: u64) -> Result<Vec<u8>, BookieError> {
        self.storage.get_entry(self.ledger_id, entry_id)
    }

    pub fn last_add_confirmed(&self) -> Result<i64, BookieError> {
        self.storage.last_add_confirmed(self.ledger_id)
    }

    pub fn wait_for_lac_update(&self, previous_lac: i64) -> Result<LacWaiter, BookieError> {
        self.storage.wait_for_lac_update(self.ledger_id, previous_lac)
    }
}
