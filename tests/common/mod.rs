#![allow(dead_code)]

use bindery::dirs::{DirsError, DiskProbe};
use bindery::{Bookie, BookieBuilder, BookieError, MemoryCoordinator, ServerConfig};
use std::path::Path;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Disk probe returning one settable usage value for every directory.
pub struct TestProbe {
    usage: Mutex<f32>,
}

impl TestProbe {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            usage: Mutex::new(0.10),
        })
    }

    pub fn set(&self, usage: f32) {
        *self.usage.lock().unwrap() = usage;
    }
}

impl DiskProbe for TestProbe {
    fn usage(&self, _dir: &Path) -> Result<f32, DirsError> {
        Ok(*self.usage.lock().unwrap())
    }
}

/// Config tuned for fast tests: tight group commit, fast disk polling,
/// no periodic checkpoint ticker, no journal backups.
pub fn test_config(root: &Path) -> ServerConfig {
    ServerConfig {
        journal_dir: root.join("journal"),
        ledger_dirs: vec![root.join("ledger0")],
        max_group_wait_ms: 1,
        flush_interval_ms: 0,
        disk_check_interval_ms: 25,
        session_timeout_ms: 300,
        reregister_backoff_start_ms: 5,
        reregister_backoff_max_ms: 20,
        reregister_max_attempts: 4,
        max_backup_journals: 0,
        ..ServerConfig::default()
    }
}

pub fn entry_payload(ledger_id: u64, entry_id: u64, body: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(16 + body.len());
    payload.extend_from_slice(&ledger_id.to_be_bytes());
    payload.extend_from_slice(&entry_id.to_be_bytes());
    payload.extend_from_slice(body);
    payload
}

pub fn start_bookie(
    config: ServerConfig,
    coordinator: Arc<MemoryCoordinator>,
    probe: Arc<TestProbe>,
) -> Arc<Bookie> {
    let bookie = BookieBuilder::new(config, coordinator)
        .disk_probe(probe)
        .build()
        .expect("bookie builds");
    bookie.start().expect("bookie starts");
    bookie
}

/// Adds one entry and blocks until its durability ack.
pub fn add_entry_sync(
    bookie: &Bookie,
    ledger_id: u64,
    entry_id: u64,
    body: &[u8],
    master_key: &[u8],
) -> Result<(), BookieError> {
    let (tx, rx) = mpsc::channel();
    bookie.add_entry(
        entry_payload(ledger_id, entry_id, body),
        master_key,
        Box::new(move |ack| {
            let _ = tx.send(ack.result);
        }),
    )?;
    rx.recv_timeout(Duration::from_secs(5)).expect("ack timed out")
}

/// Polls `predicate` until it holds or the timeout elapses.
pub fn wait_until(timeout: Duration, predicate: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    predicate()
}
