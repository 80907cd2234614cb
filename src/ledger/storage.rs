use crate::dirs::{DirsError, DirsManager};
use crate::error::BookieError;
use crate::journal::LogMark;
use crc32fast::Hasher;
use log::{info, warn};
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Subdirectory of a ledger dir's `current/` holding ledger files.
const LEDGERS_SUBDIR: &str = "ledgers";
const LEDGER_FILE_SUFFIX: &str = ".ldg";

const TAG_ENTRY: u8 = 0x01;
const TAG_MASTER_KEY: u8 = 0x02;
const TAG_FENCED: u8 = 0x03;

/// Durable per-ledger entry store behind the bookie.
///
/// The journal provides crash durability for unflushed writes; this trait
/// only promises that whatever `flush`/`checkpoint` returned `Ok` for is on
/// disk. `add_entry` of an already-present `(ledger, entry)` is an
/// idempotent overwrite, which journal replay relies on.
pub trait LedgerStorage: Send + Sync {
    fn start(&self);
    fn shutdown(&self);

    /// Seeds the ledger's master key; first write wins, a differing later
    /// key fails with `UnauthorizedAccess`.
    fn set_master_key(&self, ledger_id: u64, key: &[u8]) -> Result<(), BookieError>;
    fn read_master_key(&self, ledger_id: u64) -> Result<Vec<u8>, BookieError>;

    fn set_fenced(&self, ledger_id: u64) -> Result<bool, BookieError>;
    fn is_fenced(&self, ledger_id: u64) -> Result<bool, BookieError>;

    /// Stores an entry; the payload starts with the big-endian
    /// `(ledger_id, entry_id)` prefix. Returns the entry id.
    fn add_entry(&self, entry: &[u8]) -> Result<u64, BookieError>;
    fn get_entry(&self, ledger_id: u64, entry_id: u64) -> Result<Vec<u8>, BookieError>;
    fn last_add_confirmed(&self, ledger_id: u64) -> Result<i64, BookieError>;

    /// One-shot waiter fired (at least once) when the ledger's LAC exceeds
    /// `previous_lac`.
    fn wait_for_lac_update(
        &self,
        ledger_id: u64,
        previous_lac: i64,
    ) -> Result<LacWaiter, BookieError>;

    fn flush(&self) -> Result<(), BookieError>;
    fn checkpoint(&self, mark: LogMark) -> Result<(), BookieError>;
    fn reclaim_disk_space(&self) -> Result<(), BookieError>;
}

/// Waitable LAC-advance notification.
#[derive(Debug, Clone)]
pub struct LacWaiter {
    cell: Arc<LacCell>,
}

#[derive(Debug)]
struct LacCell {
    previous: i64,
    slot: Mutex<Option<i64>>,
    condvar: Condvar,
}

impl LacWaiter {
    /// A waiter that has not fired yet.
    pub fn pending(previous: i64) -> Self {
        Self {
            cell: Arc::new(LacCell {
                previous,
                slot: Mutex::new(None),
                condvar: Condvar::new(),
            }),
        }
    }

    /// A waiter whose threshold was already surpassed.
    pub fn ready(previous: i64, lac: i64) -> Self {
        Self {
            cell: Arc::new(LacCell {
                previous,
                slot: Mutex::new(Some(lac)),
                condvar: Condvar::new(),
            }),
        }
    }

    /// Delivers `lac` and wakes every blocked waiter.
    pub fn fire(&self, lac: i64) {
        let mut slot = self.cell.slot.lock();
        *slot = Some(lac);
        self.cell.condvar.notify_all();
    }

    pub fn previous(&self) -> i64 {
        self.cell.previous
    }

    /// Blocks until fired or `timeout`; returns the observed LAC.
    pub fn wait(&self, timeout: Duration) -> Option<i64> {
        let mut slot = self.cell.slot.lock();
        if slot.is_none() {
            self.cell.condvar.wait_for(&mut slot, timeout);
        }
        *slot
    }

    pub fn try_get(&self) -> Option<i64> {
        *self.cell.slot.lock()
    }
}

#[derive(Debug, Default)]
struct LedgerState {
    master_key: Option<Vec<u8>>,
    fenced: bool,
    lac: i64,
    entries: BTreeMap<u64, Vec<u8>>,
    file: Option<PathBuf>,
    dirty_entries: Vec<u64>,
    key_persisted: bool,
    fenced_persisted: bool,
    waiters: Vec<LacWaiter>,
}

impl LedgerState {
    fn new() -> Self {
        Self {
            lac: -1,
            ..Self::default()
        }
    }
}

/// File-backed [`LedgerStorage`]: full in-memory state plus an append-only
/// CRC-framed file per ledger, fsync'd on flush.
pub struct FileLedgerStorage {
    dirs: Arc<DirsManager>,
    ledgers: Mutex<HashMap<u64, LedgerState>>,
}

impl FileLedgerStorage {
    /// Opens the store, rebuilding in-memory state from every ledger dir.
    pub fn open(dirs: Arc<DirsManager>) -> Result<Self, BookieError> {
        let storage = Self {
            dirs,
            ledgers: Mutex::new(HashMap::new()),
        };
        storage.load_all()?;
        Ok(storage)
    }

    fn load_all(&self) -> Result<(), BookieError> {
        let mut ledgers = self.ledgers.lock();
        for dir in self.dirs.all_dirs() {
            let ledgers_dir = dir.join(LEDGERS_SUBDIR);
            if !ledgers_dir.is_dir() {
                continue;
            }
            let children = fs::read_dir(&ledgers_dir).map_err(|err| disk_error(&ledgers_dir, &err))?;
            for child in children {
                let child = child.map_err(|err| disk_error(&ledgers_dir, &err))?;
                let name = child.file_name();
                let Some(ledger_id) = parse_ledger_file_name(&name.to_string_lossy()) else {
                    continue;
                };
                let state = load_ledger_file(&child.path())
                    .map_err(|err| disk_error(&child.path(), &err))?;
                ledgers.insert(ledger_id, state);
            }
        }
        info!("event=ledger_storage_loaded ledgers={}", ledgers.len());
        Ok(())
    }

    fn assign_file(&self, ledger_id: u64) -> Result<PathBuf, BookieError> {
        let dir = self.dirs.pick_writable_dir().map_err(dirs_error)?;
        Ok(dir
            .join(LEDGERS_SUBDIR)
            .join(format!("{ledger_id}{LEDGER_FILE_SUFFIX}")))
    }

    fn flush_locked(
        &self,
        ledgers: &mut HashMap<u64, LedgerState>,
    ) -> Result<(), BookieError> {
        if !self.dirs.has_writable_dir() {
            return Err(BookieError::NoWritableLedgerDir);
        }
        for (ledger_id, state) in ledgers.iter_mut() {
            let needs_key = !state.key_persisted && state.master_key.is_some();
            let needs_fence = state.fenced && !state.fenced_persisted;
            if state.dirty_entries.is_empty() && !needs_key && !needs_fence {
                continue;
            }
            let path = match &state.file {
                Some(path) => path.clone(),
                None => {
                    let path = self.assign_file(*ledger_id)?;
                    state.file = Some(path.clone());
                    path
                }
            };
            append_ledger_records(&path, state).map_err(|err| disk_error(&path, &err))?;
        }
        Ok(())
    }
}

impl LedgerStorage for FileLedgerStorage {
    fn start(&self) {
        info!(
            "event=ledger_storage_started ledgers={}",
            self.ledgers.lock().len()
        );
    }

    fn shutdown(&self) {
        if let Err(err) = self.flush() {
            warn!("event=ledger_storage_shutdown_flush_failed error={err}");
        }
        info!("event=ledger_storage_shutdown");
    }

    fn set_master_key(&self, ledger_id: u64, key: &[u8]) -> Result<(), BookieError> {
        let mut ledgers = self.ledgers.lock();
        let state = ledgers.entry(ledger_id).or_insert_with(LedgerState::new);
        match &state.master_key {
            None => {
                state.master_key = Some(key.to_vec());
                Ok(())
            }
            Some(existing) if existing == key => Ok(()),
            Some(_) => Err(BookieError::UnauthorizedAccess { ledger_id }),
        }
    }

    fn read_master_key(&self, ledger_id: u64) -> Result<Vec<u8>, BookieError> {
        let ledgers = self.ledgers.lock();
        ledgers
            .get(&ledger_id)
            .and_then(|state| state.master_key.clone())
            .ok_or(BookieError::NoLedger { ledger_id })
    }

    fn set_fenced(&self, ledger_id: u64) -> Result<bool, BookieError> {
        let mut ledgers = self.ledgers.lock();
        let state = ledgers.entry(ledger_id).or_insert_with(LedgerState::new);
        if state.fenced {
            return Ok(false);
        }
        state.fenced = true;
        Ok(true)
    }

    fn is_fenced(&self, ledger_id: u64) -> Result<bool, BookieError> {
        let ledgers = self.ledgers.lock();
        ledgers
            .get(&ledger_id)
            .map(|state| state.fenced)
            .ok_or(BookieError::NoLedger { ledger_id })
    }

    fn add_entry(&self, entry: &[u8]) -> Result<u64, BookieError> {
        let (ledger_id, entry_id) = parse_entry_ids(entry)?;
        // picked outside the table lock; installed only if still unassigned
        let candidate_file = self.assign_file(ledger_id)?;
        let mut ledgers = self.ledgers.lock();
        let state = ledgers.entry(ledger_id).or_insert_with(LedgerState::new);
        if state.file.is_none() {
            state.file = Some(candidate_file);
        }
        state.entries.insert(entry_id, entry.to_vec());
        state.dirty_entries.push(entry_id);
        let lac = entry_id as i64;
        if lac > state.lac {
            state.lac = lac;
            let fired: Vec<LacWaiter> = state
                .waiters
                .iter()
                .filter(|waiter| lac > waiter.previous())
                .cloned()
                .collect();
            state.waiters.retain(|waiter| lac <= waiter.previous());
            for waiter in fired {
                waiter.fire(lac);
            }
        }
        Ok(entry_id)
    }

    fn get_entry(&self, ledger_id: u64, entry_id: u64) -> Result<Vec<u8>, BookieError> {
        let ledgers = self.ledgers.lock();
        let state = ledgers
            .get(&ledger_id)
            .ok_or(BookieError::NoLedger { ledger_id })?;
        state
            .entries
            .get(&entry_id)
            .cloned()
            .ok_or(BookieError::NoEntry {
                ledger_id,
                entry_id,
            })
    }

    fn last_add_confirmed(&self, ledger_id: u64) -> Result<i64, BookieError> {
        let ledgers = self.ledgers.lock();
        ledgers
            .get(&ledger_id)
            .map(|state| state.lac)
            .ok_or(BookieError::NoLedger { ledger_id })
    }

    fn wait_for_lac_update(
        &self,
        ledger_id: u64,
        previous_lac: i64,
    ) -> Result<LacWaiter, BookieError> {
        let mut ledgers = self.ledgers.lock();
        let state = ledgers
            .get_mut(&ledger_id)
            .ok_or(BookieError::NoLedger { ledger_id })?;
        if state.lac > previous_lac {
            return Ok(LacWaiter::ready(previous_lac, state.lac));
        }
        let waiter = LacWaiter::pending(previous_lac);
        state.waiters.push(waiter.clone());
        Ok(waiter)
    }

    fn flush(&self) -> Result<(), BookieError> {
        let mut ledgers = self.ledgers.lock();
        self.flush_locked(&mut ledgers)
    }

    fn checkpoint(&self, _mark: LogMark) -> Result<(), BookieError> {
        // flushing everything is a superset of "flush up to mark"
        self.flush()
    }

    fn reclaim_disk_space(&self) -> Result<(), BookieError> {
        info!("event=reclaim_disk_space noop=true");
        Ok(())
    }
}

fn parse_entry_ids(entry: &[u8]) -> Result<(u64, u64), BookieError> {
    if entry.len() < 16 {
        return Err(BookieError::DiskError {
            reason: "entry shorter than its id prefix".to_string(),
        });
    }
    let mut ledger_id = [0u8; 8];
    let mut entry_id = [0u8; 8];
    ledger_id.copy_from_slice(&entry[..8]);
    entry_id.copy_from_slice(&entry[8..16]);
    Ok((u64::from_be_bytes(ledger_id), u64::from_be_bytes(entry_id)))
}

fn parse_ledger_file_name(name: &str) -> Option<u64> {
    name.strip_suffix(LEDGER_FILE_SUFFIX)?.parse().ok()
}

fn dirs_error(err: DirsError) -> BookieError {
    match err {
        DirsError::NoWritableDir => BookieError::NoWritableLedgerDir,
        other => BookieError::DiskError {
            reason: other.to_string(),
        },
    }
}

fn disk_error(path: &Path, err: &io::Error) -> BookieError {
    BookieError::DiskError {
        reason: format!("{}: {err}", path.display()),
    }
}

fn frame_record(buf: &mut Vec<u8>, tag: u8, body: &[u8]) {
    let mut hasher = Hasher::new();
    hasher.update(&[tag]);
    hasher.update(body);
    buf.extend_from_slice(&(1 + body.len() as u32).to_be_bytes());
    buf.extend_from_slice(&hasher.finalize().to_be_bytes());
    buf.push(tag);
    buf.extend_from_slice(body);
}

fn append_ledger_records(path: &Path, state: &mut LedgerState) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut buf = Vec::new();
    if !state.key_persisted {
        if let Some(key) = &state.master_key {
            frame_record(&mut buf, TAG_MASTER_KEY, key);
        }
    }
    if state.fenced && !state.fenced_persisted {
        frame_record(&mut buf, TAG_FENCED, &[]);
    }
    for entry_id in &state.dirty_entries {
        if let Some(entry) = state.entries.get(entry_id) {
            frame_record(&mut buf, TAG_ENTRY, entry);
        }
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(&buf)?;
    file.sync_data()?;
    state.key_persisted = state.master_key.is_some();
    state.fenced_persisted = state.fenced;
    state.dirty_entries.clear();
    Ok(())
}

fn load_ledger_file(path: &Path) -> io::Result<LedgerState> {
    let mut state = LedgerState::new();
    state.file = Some(path.to_path_buf());
    let mut file = File::open(path)?;
    let mut data = Vec::new();
    file.read_to_end(&mut data)?;
    let mut cursor = 0usize;
    while cursor + 8 <= data.len() {
        let len = u32::from_be_bytes([
            data[cursor],
            data[cursor + 1],
            data[cursor + 2],
            data[cursor + 3],
        ]) as usize;
        let crc = u32::from_be_bytes([
            data[cursor + 4],
            data[cursor + 5],
            data[cursor + 6],
            data[cursor + 7],
        ]);
        let body_start = cursor + 8;
        if len == 0 || body_start + len > data.len() {
            warn!("event=ledger_file_torn_tail path={}", path.display());
            break;
        }
        let body = &data[body_start..body_start + len];
        let mut hasher = Hasher::new();
        hasher.update(body);
        if hasher.finalize() != crc {
            if body_start + len < data.len() {
                // a torn write can only damage the final record
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!(
                        "ledger file {} corrupt at offset {cursor}",
                        path.display()
                    ),
                ));
            }
            warn!(
                "event=ledger_file_crc_mismatch_at_tail path={}",
                path.display()
            );
            break;
        }
        match body[0] {
            TAG_MASTER_KEY => {
                state.master_key = Some(body[1..].to_vec());
                state.key_persisted = true;
            }
            TAG_FENCED => {
                state.fenced = true;
                state.fenced_persisted = true;
            }
            TAG_ENTRY => {
                if let Ok((_, entry_id)) = parse_entry_ids(&body[1..]) {
                    state.lac = state.lac.max(entry_id as i64);
                    state.entries.insert(entry_id, body[1..].to_vec());
                }
            }
            unknown => {
                warn!(
                    "event=ledger_file_unknown_tag path={} tag={unknown}",
                    path.display()
                );
                break;
            }
        }
        cursor = body_start + len;
    }
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dirs::DiskProbe;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::tempdir;

    struct TogglableProbe {
        full: AtomicBool,
    }

    impl DiskProbe for TogglableProbe {
        fn usage(&self, _dir: &Path) -> Result<f32, DirsError> {
            Ok(if self.full.load(Ordering::SeqCst) {
                0.99
            } else {
                0.10
            })
        }
    }

    fn storage_fixture(root: &Path) -> (Arc<DirsManager>, Arc<TogglableProbe>, FileLedgerStorage) {
        let probe = Arc::new(TogglableProbe {
            full: AtomicBool::new(false),
        });
        let dirs = Arc::new(DirsManager::new(
            &[root.join("ledgers")],
            probe.clone(),
            0.90,
            0.95,
            Duration::from_secs(10),
        ));
        dirs.check_structure().unwrap();
        let storage = FileLedgerStorage::open(dirs.clone()).unwrap();
        (dirs, probe, storage)
    }

    fn entry(ledger_id: u64, entry_id: u64, body: &[u8]) -> Vec<u8> {
        let mut payload = Vec::new();
        payload.extend_from_slice(&ledger_id.to_be_bytes());
        payload.extend_from_slice(&entry_id.to_be_bytes());
        payload.extend_from_slice(body);
        payload
    }

    #[test]
    fn entries_survive_flush_and_reload() {
        let root = tempdir().unwrap();
        let (dirs, _probe, storage) = storage_fixture(root.path());
        storage.set_master_key(7, b"key").unwrap();
        storage.add_entry(&entry(7, 0, b"hello")).unwrap();
        storage.add_entry(&entry(7, 1, b"world")).unwrap();
        storage.set_fenced(7).unwrap();
        storage.flush().unwrap();

        let reloaded = FileLedgerStorage::open(dirs).unwrap();
        assert_eq!(reloaded.get_entry(7, 0).unwrap(), entry(7, 0, b"hello"));
        assert_eq!(reloaded.last_add_confirmed(7).unwrap(), 1);
        assert!(reloaded.is_fenced(7).unwrap());
        assert_eq!(reloaded.read_master_key(7).unwrap(), b"key");
    }

    #[test]
    fn corrupt_record_mid_file_fails_reload() {
        let root = tempdir().unwrap();
        let (dirs, _probe, storage) = storage_fixture(root.path());
        storage.set_master_key(6, b"k").unwrap();
        storage.add_entry(&entry(6, 0, b"one")).unwrap();
        storage.add_entry(&entry(6, 1, b"two")).unwrap();
        storage.flush().unwrap();

        // flip a CRC byte of the first record; later records still follow
        let ledger_file = dirs.all_dirs()[0]
            .join(LEDGERS_SUBDIR)
            .join(format!("6{LEDGER_FILE_SUFFIX}"));
        let mut data = std::fs::read(&ledger_file).unwrap();
        data[4] ^= 0xFF;
        std::fs::write(&ledger_file, data).unwrap();

        assert!(matches!(
            FileLedgerStorage::open(dirs),
            Err(BookieError::DiskError { .. })
        ));
    }

    #[test]
    fn corrupt_final_record_is_a_torn_tail() {
        let root = tempdir().unwrap();
        let (dirs, _probe, storage) = storage_fixture(root.path());
        storage.set_master_key(8, b"k").unwrap();
        storage.add_entry(&entry(8, 0, b"keep")).unwrap();
        storage.flush().unwrap();
        storage.add_entry(&entry(8, 1, b"torn")).unwrap();
        storage.flush().unwrap();

        // damage only the last record's CRC
        let ledger_file = dirs.all_dirs()[0]
            .join(LEDGERS_SUBDIR)
            .join(format!("8{LEDGER_FILE_SUFFIX}"));
        let mut data = std::fs::read(&ledger_file).unwrap();
        let last_body_len = 16 + b"torn".len() + 1;
        let last_crc = data.len() - last_body_len - 4;
        data[last_crc] ^= 0xFF;
        std::fs::write(&ledger_file, data).unwrap();

        let reloaded = FileLedgerStorage::open(dirs).unwrap();
        assert_eq!(reloaded.get_entry(8, 0).unwrap(), entry(8, 0, b"keep"));
        assert!(matches!(
            reloaded.get_entry(8, 1),
            Err(BookieError::NoEntry { .. })
        ));
    }

    #[test]
    fn unflushed_entries_do_not_survive_reload() {
        let root = tempdir().unwrap();
        let (dirs, _probe, storage) = storage_fixture(root.path());
        storage.set_master_key(3, b"k").unwrap();
        storage.add_entry(&entry(3, 0, b"volatile")).unwrap();
        drop(storage);
        let reloaded = FileLedgerStorage::open(dirs).unwrap();
        assert!(matches!(
            reloaded.get_entry(3, 0),
            Err(BookieError::NoLedger { .. })
        ));
    }

    #[test]
    fn add_entry_is_idempotent_per_entry_id() {
        let root = tempdir().unwrap();
        let (_dirs, _probe, storage) = storage_fixture(root.path());
        storage.set_master_key(5, b"k").unwrap();
        storage.add_entry(&entry(5, 4, b"same")).unwrap();
        storage.add_entry(&entry(5, 4, b"same")).unwrap();
        assert_eq!(storage.last_add_confirmed(5).unwrap(), 4);
        assert_eq!(storage.get_entry(5, 4).unwrap(), entry(5, 4, b"same"));
    }

    #[test]
    fn master_key_first_write_wins() {
        let root = tempdir().unwrap();
        let (_dirs, _probe, storage) = storage_fixture(root.path());
        storage.set_master_key(9, b"first").unwrap();
        storage.set_master_key(9, b"first").unwrap();
        assert!(matches!(
            storage.set_master_key(9, b"second"),
            Err(BookieError::UnauthorizedAccess { .. })
        ));
    }

    #[test]
    fn lac_waiter_fires_on_advance() {
        let root = tempdir().unwrap();
        let (_dirs, _probe, storage) = storage_fixture(root.path());
        storage.set_master_key(2, b"k").unwrap();
        storage.add_entry(&entry(2, 0, b"a")).unwrap();
        let waiter = storage.wait_for_lac_update(2, 0).unwrap();
        assert!(waiter.try_get().is_none());
        storage.add_entry(&entry(2, 1, b"b")).unwrap();
        assert_eq!(waiter.wait(Duration::from_secs(1)), Some(1));
        // already-surpassed LAC fires immediately
        let ready = storage.wait_for_lac_update(2, 0).unwrap();
        assert_eq!(ready.try_get(), Some(1));
    }

    #[test]
    fn writes_fail_without_writable_dirs() {
        let root = tempdir().unwrap();
        let (dirs, probe, storage) = storage_fixture(root.path());
        probe.full.store(true, Ordering::SeqCst);
        let _ = dirs.check_all_dirs();
        assert!(matches!(
            storage.add_entry(&entry(1, 0, b"x")),
            Err(BookieError::NoWritableLedgerDir)
        ));
        assert!(matches!(
            storage.flush(),
            Err(BookieError::NoWritableLedgerDir)
        ));
    }
}
