use std::io;
use thiserror::Error;

/// Process exit codes reported by [`crate::bookie::Bookie::shutdown`].
///
/// The code is latched on the first failing shutdown request and returned by
/// every later call.
pub mod exit_code {
    pub const OK: i32 = 0;
    pub const BOOKIE_EXCEPTION: i32 = 3;
    pub const REG_FAIL: i32 = 4;
}

/// Crate-level failure taxonomy.
///
/// Per-request failures (`UnauthorizedAccess`, `LedgerFenced`, `NoLedger`,
/// `NoEntry`, `ReservedEntryId`) are returned to the caller without any mode
/// change. `NoWritableLedgerDir` on a write converts the bookie to read-only.
/// `JournalIo` and `DiskError` are fatal.
#[derive(Debug, Error)]
pub enum BookieError {
    #[error("master key mismatch for ledger {ledger_id}")]
    UnauthorizedAccess { ledger_id: u64 },
    #[error("ledger {ledger_id} is fenced")]
    LedgerFenced { ledger_id: u64 },
    #[error("ledger {ledger_id} not found")]
    NoLedger { ledger_id: u64 },
    #[error("entry {entry_id} not found in ledger {ledger_id}")]
    NoEntry { ledger_id: u64, entry_id: u64 },
    #[error("invalid cookie: {reason}")]
    InvalidCookie { reason: String },
    #[error("no writable ledger directory")]
    NoWritableLedgerDir,
    #[error("disk error: {reason}")]
    DiskError { reason: String },
    #[error("journal I/O failure: {0}")]
    JournalIo(#[source] io::Error),
    #[error("coordinator failure: {0}")]
    Coordinator(#[from] crate::coordinator::CoordinatorError),
    #[error("interrupted: {reason}")]
    Interrupted { reason: String },
    #[error("entry id {entry_id:#x} for ledger {ledger_id} is reserved for meta records")]
    ReservedEntryId { ledger_id: u64, entry_id: u64 },
}

impl BookieError {
    /// Stable wire code for each failure kind.
    pub fn code(&self) -> i32 {
        match self {
            BookieError::UnauthorizedAccess { .. } => -102,
            BookieError::LedgerFenced { .. } => -101,
            BookieError::NoLedger { .. } => -103,
            BookieError::NoEntry { .. } => -104,
            BookieError::InvalidCookie { .. } => -105,
            BookieError::NoWritableLedgerDir => -106,
            BookieError::DiskError { .. } => -107,
            BookieError::JournalIo(_) => -108,
            BookieError::Coordinator(_) => -109,
            BookieError::Interrupted { .. } => -110,
            BookieError::ReservedEntryId { .. } => -111,
        }
    }

    /// True for failures that must never change bookie mode or availability.
    pub fn is_request_scoped(&self) -> bool {
        matches!(
            self,
            BookieError::UnauthorizedAccess { .. }
                | BookieError::LedgerFenced { .. }
                | BookieError::NoLedger { .. }
                | BookieError::NoEntry { .. }
                | BookieError::ReservedEntryId { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable_and_distinct() {
        let errors = [
            BookieError::UnauthorizedAccess { ledger_id: 1 },
            BookieError::LedgerFenced { ledger_id: 1 },
            BookieError::NoLedger { ledger_id: 1 },
            BookieError::NoEntry {
                ledger_id: 1,
                entry_id: 2,
            },
            BookieError::InvalidCookie {
                reason: "x".into(),
            },
            BookieError::NoWritableLedgerDir,
            BookieError::DiskError {
                reason: "x".into(),
            },
            BookieError::JournalIo(io::Error::other("x")),
            BookieError::Interrupted {
                reason: "x".into(),
            },
            BookieError::ReservedEntryId {
                ledger_id: 1,
                entry_id: 0xFFFF_FFFF_FFFF_F000,
            },
        ];
        let mut codes: Vec<i32> = errors.iter().map(BookieError::code).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn request_scoped_failures_do_not_include_fatal_kinds() {
        assert!(BookieError::LedgerFenced { ledger_id: 9 }.is_request_scoped());
        assert!(!BookieError::NoWritableLedgerDir.is_request_scoped());
        assert!(!BookieError::JournalIo(io::Error::other("fsync")).is_request_scoped());
    }
}
