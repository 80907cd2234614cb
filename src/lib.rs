//! bindery: the storage node ("bookie") of a distributed append-only
//! ledger service. Acknowledged writes are journal-durable, ledgers can be
//! fenced irreversibly, and crash recovery replays the journal from the
//! last persisted log mark.
#![deny(unreachable_pub)]
#![deny(unused_must_use)]

pub mod bookie;
pub mod config;
pub mod cookie;
pub mod coordinator;
pub mod dirs;
pub mod error;
pub mod future;
pub mod journal;
pub mod ledger;
pub mod retry;
pub mod telemetry;

pub use bookie::{
    is_meta_entry_id, Bookie, BookieBuilder, BookieMode, FenceFuture, ModeFlags, StateCommand,
    SyncEngine, SyncTicket, WriteAck, WriteCallback, METAENTRY_ID_FENCE_KEY,
    METAENTRY_ID_LEDGER_KEY,
};
pub use config::{ConfigError, ServerConfig};
pub use cookie::{Cookie, CookieError, LAYOUT_VERSION, VERSION_FILENAME};
pub use coordinator::{Coordinator, CoordinatorError, MemoryCoordinator, SessionEvent};
pub use dirs::{DirsError, DirsListener, DirsManager, DiskProbe, Fs2Probe, CURRENT_DIR};
pub use error::{exit_code, BookieError};
pub use future::SettableFuture;
pub use journal::{
    Journal, JournalConfig, JournalVisitor, LastLogMark, LogMark, LAST_MARK_FILENAME,
};
pub use ledger::{FileLedgerStorage, HandleCache, LacWaiter, LedgerDescriptor, LedgerStorage};
pub use retry::{RetryHandle, RetryPolicy};
pub use telemetry::{MetricsRegistry, MetricsSnapshot, SharedMetricsRegistry};
