mod common;

use bindery::{Bookie, BookieError, Cookie, MemoryCoordinator, VERSION_FILENAME};
use common::{add_entry_sync, start_bookie, test_config, TestProbe};
use std::fs;
use std::sync::Arc;
use tempfile::tempdir;

#[test]
fn fresh_environment_writes_cookies_everywhere() {
    let root = tempdir().unwrap();
    let config = test_config(root.path());
    let coordinator = Arc::new(MemoryCoordinator::new());
    let bookie = start_bookie(config.clone(), coordinator.clone(), TestProbe::new());
    bookie.shutdown();

    assert!(config
        .journal_dir
        .join("current")
        .join(VERSION_FILENAME)
        .exists());
    for dir in &config.ledger_dirs {
        assert!(dir.join("current").join(VERSION_FILENAME).exists());
    }
    assert!(Cookie::read_from_coordinator(coordinator.as_ref(), &config)
        .unwrap()
        .is_some());
}

#[test]
fn second_boot_verifies_cleanly() {
    let root = tempdir().unwrap();
    let coordinator = Arc::new(MemoryCoordinator::new());
    let probe = TestProbe::new();
    let bookie = start_bookie(test_config(root.path()), coordinator.clone(), probe.clone());
    add_entry_sync(&bookie, 1, 0, b"x", b"k").unwrap();
    bookie.shutdown();

    let bookie = start_bookie(test_config(root.path()), coordinator, probe);
    bookie.shutdown();
}

#[test]
fn missing_local_cookie_is_fatal() {
    let root = tempdir().unwrap();
    let config = test_config(root.path());
    let coordinator = Arc::new(MemoryCoordinator::new());
    let bookie = start_bookie(config.clone(), coordinator.clone(), TestProbe::new());
    bookie.shutdown();

    fs::remove_file(config.journal_dir.join("current").join(VERSION_FILENAME)).unwrap();
    let err = Bookie::new(config, coordinator).unwrap_err();
    assert!(matches!(err, BookieError::InvalidCookie { .. }));
}

#[test]
fn cookie_field_divergence_is_fatal() {
    let root = tempdir().unwrap();
    let config = test_config(root.path());
    let coordinator = Arc::new(MemoryCoordinator::new());
    let bookie = start_bookie(config.clone(), coordinator.clone(), TestProbe::new());
    bookie.shutdown();

    // the same machine restarted with a different advertised identity
    let mut changed = config;
    changed.bookie_port = 3999;
    let err = Bookie::new(changed, coordinator).unwrap_err();
    assert!(matches!(err, BookieError::InvalidCookie { .. }));
}

#[test]
fn legacy_layout_residue_is_fatal() {
    let root = tempdir().unwrap();
    let config = test_config(root.path());
    fs::create_dir_all(&config.journal_dir).unwrap();
    fs::write(config.journal_dir.join("0.txn"), b"pre-v3").unwrap();
    let err = Bookie::new(config, Arc::new(MemoryCoordinator::new())).unwrap_err();
    assert!(matches!(err, BookieError::DiskError { .. }));
}
