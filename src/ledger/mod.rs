//! Ledger state on one bookie: storage backend, descriptors, handle cache.

pub mod descriptor;
pub mod handles;
pub mod storage;

pub use descriptor::LedgerDescriptor;
pub use handles::HandleCache;
pub use storage::{FileLedgerStorage, LacWaiter, LedgerStorage};
