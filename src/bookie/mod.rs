//! The bookie: one storage node of the append-only ledger service.
//!
//! Owns the journal, the ledger storage backend, the handle cache, the sync
//! engine and the mode state machine, and wires their lifecycles together.

pub mod state;
pub mod sync;

pub use state::{BookieMode, ModeFlags, StateCommand};
pub use sync::{SyncEngine, SyncTicket};

use crate::config::ServerConfig;
use crate::cookie::{self, CookieError};
use crate::coordinator::{Coordinator, SessionEvent};
use crate::dirs::{DirsError, DirsListener, DirsManager, DiskProbe, Fs2Probe};
use crate::error::{exit_code, BookieError};
use crate::future::SettableFuture;
use crate::journal::{Journal, JournalConfig, JournalVisitor, VERSION_V3, VERSION_V4};
use crate::ledger::{FileLedgerStorage, HandleCache, LacWaiter, LedgerStorage};
use crate::telemetry::{SharedMetricsRegistry, STATUS_UNREGISTERED};
use log::{error, info, warn};
use parking_lot::Mutex;
use state::{StateDriver, StateService};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Reserved entry id of ledger-key meta records (`-0x1000` as a signed id).
pub const METAENTRY_ID_LEDGER_KEY: u64 = 0xFFFF_FFFF_FFFF_F000;
/// Reserved entry id of fence meta records (`-0x2000` as a signed id).
pub const METAENTRY_ID_FENCE_KEY: u64 = 0xFFFF_FFFF_FFFF_E000;

/// Entry ids at or above the reserved band belong to meta records and are
/// rejected at the client-facing boundary.
pub fn is_meta_entry_id(entry_id: u64) -> bool {
    entry_id >= METAENTRY_ID_FENCE_KEY
}

/// Acknowledgement delivered once an appended entry is durable (or failed).
pub struct WriteAck {
    pub result: Result<(), BookieError>,
    pub ledger_id: u64,
    pub entry_id: u64,
    pub bookie_id: String,
}

pub type WriteCallback = Box<dyn FnOnce(WriteAck) + Send>;

/// Completes with `true` once the fence record is durable.
pub type FenceFuture = SettableFuture<bool>;

/// Builds a [`Bookie`] with injectable collaborators.
pub struct BookieBuilder {
    config: ServerConfig,
    coordinator: Arc<dyn Coordinator>,
    probe: Arc<dyn DiskProbe>,
    metrics: Option<SharedMetricsRegistry>,
}

impl BookieBuilder {
    pub fn new(config: ServerConfig, coordinator: Arc<dyn Coordinator>) -> Self {
        Self {
            config,
            coordinator,
            probe: Arc::new(Fs2Probe),
            metrics: None,
        }
    }

    pub fn disk_probe(mut self, probe: Arc<dyn DiskProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn metrics(mut self, metrics: SharedMetricsRegistry) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn build(self) -> Result<Arc<Bookie>, BookieError> {
        Bookie::assemble(self)
    }
}

impl std::fmt::Debug for Bookie {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bookie").field("bookie_id", &self.bookie_id).finish_non_exhaustive()
    }
}

pub struct Bookie {
    config: Arc<ServerConfig>,
    bookie_id: String,
    coordinator: Arc<dyn Coordinator>,
    metrics: SharedMetricsRegistry,
    journal_dirs: Arc<DirsManager>,
    ledger_dirs: Arc<DirsManager>,
    index_dirs: Option<Arc<DirsManager>>,
    journal: Arc<Journal>,
    storage: Arc<dyn LedgerStorage>,
    handles: HandleCache,
    master_keys: Mutex<HashMap<u64, Vec<u8>>>,
    sync_engine: SyncEngine,
    state: StateService,
    flags: Arc<ModeFlags>,
    shutdown_tx: Sender<i32>,
    shutdown_rx: Mutex<Option<Receiver<i32>>>,
    shutdown_listener: Mutex<Option<JoinHandle<()>>>,
    journal_watcher: Mutex<Option<JoinHandle<()>>>,
    final_exit: Mutex<Option<i32>>,
}

impl Bookie {
    pub fn new(
        config: ServerConfig,
        coordinator: Arc<dyn Coordinator>,
    ) -> Result<Arc<Self>, BookieError> {
        BookieBuilder::new(config, coordinator).build()
    }

    fn assemble(builder: BookieBuilder) -> Result<Arc<Self>, BookieError> {
        let config = Arc::new(builder.config);
        let coordinator = builder.coordinator;
        let probe = builder.probe;
        let metrics = builder
            .metrics
            .unwrap_or_else(|| SharedMetricsRegistry::new("bindery"));
        let bookie_id = config.bookie_id();
        let check_interval = Duration::from_millis(config.disk_check_interval_ms);

        let journal_dirs = Arc::new(DirsManager::new(
            std::slice::from_ref(&config.journal_dir),
            Arc::clone(&probe),
            config.disk_usage_warn_threshold,
            config.disk_usage_threshold,
            check_interval,
        ));
        let ledger_dirs = Arc::new(DirsManager::new(
            &config.ledger_dirs,
            Arc::clone(&probe),
            config.disk_usage_warn_threshold,
            config.disk_usage_threshold,
            check_interval,
        ));
        let index_dirs = if config.index_dirs.is_empty() {
            None
        } else {
            Some(Arc::new(DirsManager::new(
                &config.index_dirs,
                Arc::clone(&probe),
                config.disk_usage_warn_threshold,
                config.disk_usage_threshold,
                check_interval,
            )))
        };

        journal_dirs.check_structure().map_err(dirs_fatal)?;
        ledger_dirs.check_structure().map_err(dirs_fatal)?;
        if let Some(index) = &index_dirs {
            index.check_structure().map_err(dirs_fatal)?;
        }

        let mut cookie_dirs: Vec<PathBuf> = journal_dirs.all_dirs().to_vec();
        cookie_dirs.extend_from_slice(ledger_dirs.all_dirs());
        if let Some(index) = &index_dirs {
            cookie_dirs.extend_from_slice(index.all_dirs());
        }
        cookie::check_environment(&config, coordinator.as_ref(), &cookie_dirs)
            .map_err(cookie_fatal)?;

        let journal = Arc::new(Journal::open(JournalConfig {
            journal_dir: journal_dirs.all_dirs()[0].clone(),
            mark_dirs: ledger_dirs.all_dirs().to_vec(),
            group_commit_bytes: config.group_commit_bytes,
            max_group_wait: Duration::from_millis(config.max_group_wait_ms),
            queue_len: config.journal_queue_len,
            max_segment_bytes: config.max_segment_bytes,
            max_backup_journals: config.max_backup_journals,
        })?);

        let storage: Arc<dyn LedgerStorage> =
            Arc::new(FileLedgerStorage::open(Arc::clone(&ledger_dirs))?);
        let handles = HandleCache::new(Arc::clone(&storage));

        // full disks at startup: ask storage to reclaim, then re-check
        if let Err(err) = check_capacity(&ledger_dirs, index_dirs.as_deref()) {
            info!("event=dirs_full_at_startup error={err} action=reclaim");
            storage.reclaim_disk_space()?;
            check_capacity(&ledger_dirs, index_dirs.as_deref())?;
        }

        let (shutdown_tx, shutdown_rx) = channel();
        let flags = Arc::new(ModeFlags::default());
        let state = StateService::start(StateDriver {
            config: Arc::clone(&config),
            coordinator: Arc::clone(&coordinator),
            flags: Arc::clone(&flags),
            metrics: metrics.clone(),
            shutdown_tx: shutdown_tx.clone(),
            stop_retries: Arc::new(AtomicBool::new(false)),
        });

        let readonly_hook = state.sender();
        let sync_engine = SyncEngine::new(
            Arc::clone(&journal),
            Arc::clone(&storage),
            Box::new(move || {
                let _ = readonly_hook.send(StateCommand::TransitionReadOnly);
            }),
        );

        Ok(Arc::new(Self {
            config,
            bookie_id,
            coordinator,
            metrics,
            journal_dirs,
            ledger_dirs,
            index_dirs,
            journal,
            storage,
            handles,
            master_keys: Mutex::new(HashMap::new()),
            sync_engine,
            state,
            flags,
            shutdown_tx,
            shutdown_rx: Mutex::new(Some(shutdown_rx)),
            shutdown_listener: Mutex::new(None),
            journal_watcher: Mutex::new(None),
            final_exit: Mutex::new(None),
        }))
    }

    /// Brings the bookie online: replay, full flush, registration.
    pub fn start(self: &Arc<Self>) -> Result<(), BookieError> {
        info!(
            "event=bookie_starting id={} journal_dir={}",
            self.bookie_id,
            self.config.journal_dir.display()
        );
        self.spawn_shutdown_listener();

        self.journal_dirs.start();
        self.ledger_dirs.start();
        if let Some(index) = &self.index_dirs {
            index.start();
        }

        // checkpoints may complete during replay, shrinking the work a
        // crash before the post-replay flush would leave behind
        self.sync_engine
            .start(Duration::from_millis(self.config.flush_interval_ms));

        let replay_started = Instant::now();
        if let Err(err) = self.read_journal() {
            error!("event=journal_replay_failed error={err}");
            self.shutdown_with_code(exit_code::BOOKIE_EXCEPTION);
            return Err(err);
        }
        info!(
            "event=journal_replay_finished elapsed_ms={}",
            replay_started.elapsed().as_millis()
        );

        if !self.sync_engine.flush().wait() {
            error!("event=startup_flush_failed");
            self.shutdown_with_code(exit_code::BOOKIE_EXCEPTION);
            return Err(BookieError::DiskError {
                reason: "full flush after journal replay failed".to_string(),
            });
        }

        self.journal.start();
        self.spawn_journal_watcher();

        let listener: Arc<dyn DirsListener> = Arc::new(BookieDirsListener {
            state: self.state.sender(),
            shutdown_tx: self.shutdown_tx.clone(),
        });
        self.ledger_dirs.add_listener(Arc::clone(&listener));
        if let Some(index) = &self.index_dirs {
            index.add_listener(Arc::clone(&listener));
        }

        self.storage.start();
        self.flags.set_running(true);

        let session_state = self.state.sender();
        let session_flags = Arc::clone(&self.flags);
        self.coordinator.subscribe_session(Box::new(move |event| {
            if event == SessionEvent::Expired
                && session_flags.is_running()
                && !session_flags.is_shutting_down()
            {
                let _ = session_state.send(StateCommand::Reregister);
            }
        }));

        if let Err(err) = self.state.driver().register_current_mode() {
            error!("event=initial_registration_failed error={err}");
            self.shutdown_with_code(exit_code::REG_FAIL);
            return Err(err);
        }
        info!("event=bookie_started id={}", self.bookie_id);
        Ok(())
    }

    fn spawn_shutdown_listener(self: &Arc<Self>) {
        let Some(receiver) = self.shutdown_rx.lock().take() else {
            return;
        };
        let weak = Arc::downgrade(self);
        let listener = thread::spawn(move || {
            while let Ok(code) = receiver.recv() {
                match weak.upgrade() {
                    Some(bookie) => {
                        bookie.shutdown_with_code(code);
                    }
                    None => return,
                }
            }
        });
        *self.shutdown_listener.lock() = Some(listener);
    }

    fn spawn_journal_watcher(self: &Arc<Self>) {
        let Some(writer) = self.journal.take_writer_handle() else {
            return;
        };
        let weak = Arc::downgrade(self);
        let watcher = thread::spawn(move || {
            if writer.join().is_err() {
                error!("event=journal_writer_panicked");
            }
            if let Some(bookie) = weak.upgrade() {
                if !bookie.flags.is_shutting_down() {
                    error!("event=journal_writer_exited_unexpectedly action=shutdown");
                    let _ = bookie.shutdown_tx.send(exit_code::BOOKIE_EXCEPTION);
                }
            }
        });
        *self.journal_watcher.lock() = Some(watcher);
    }

    /// Replays every journal record after the persisted log mark.
    fn read_journal(&self) -> Result<(), BookieError> {
        struct ReplayVisitor<'a> {
            bookie: &'a Bookie,
        }

        impl JournalVisitor for ReplayVisitor<'_> {
            fn process(
                &mut self,
                journal_version: u32,
                _offset: u64,
                record: &[u8],
            ) -> Result<(), BookieError> {
                let (ledger_id, entry_id) = parse_entry_prefix(record)?;
                if entry_id == METAENTRY_ID_LEDGER_KEY {
                    if journal_version < VERSION_V3 {
                        return Err(replay_format_error(
                            "ledger-key meta record",
                            journal_version,
                        ));
                    }
                    let key = parse_ledger_key_record(record)?;
                    self.bookie.master_keys.lock().insert(ledger_id, key);
                } else if entry_id == METAENTRY_ID_FENCE_KEY {
                    if journal_version < VERSION_V4 {
                        return Err(replay_format_error("fence meta record", journal_version));
                    }
                    match self.bookie.master_key_for(ledger_id) {
                        Ok(key) => {
                            let handle = self.bookie.handles.get_handle(ledger_id, &key)?;
                            handle.set_fenced()?;
                        }
                        Err(BookieError::NoLedger { .. }) => {
                            info!("event=replay_skipped_deleted_ledger ledger={ledger_id}");
                        }
                        Err(err) => return Err(err),
                    }
                } else if is_meta_entry_id(entry_id) {
                    return Err(BookieError::JournalIo(std::io::Error::other(format!(
                        "unknown meta record id {entry_id:#x} for ledger {ledger_id}"
                    ))));
                } else {
                    match self.bookie.master_key_for(ledger_id) {
                        Ok(key) => {
                            let handle = self.bookie.handles.get_handle(ledger_id, &key)?;
                            handle.add_entry(record)?;
                        }
                        Err(BookieError::NoLedger { .. }) => {
                            info!("event=replay_skipped_deleted_ledger ledger={ledger_id}");
                        }
                        Err(err) => return Err(err),
                    }
                }
                Ok(())
            }
        }

        let mut visitor = ReplayVisitor { bookie: self };
        self.journal.replay(&mut visitor)
    }

    /// Master key from the replay cache, falling back to ledger storage.
    fn master_key_for(&self, ledger_id: u64) -> Result<Vec<u8>, BookieError> {
        if let Some(key) = self.master_keys.lock().get(&ledger_id) {
            return Ok(key.clone());
        }
        self.storage.read_master_key(ledger_id)
    }

    /// Opens the handle and, for a ledger this bookie has never journaled a
    /// key for, appends exactly one ledger-key meta record.
    fn get_ledger_for_entry(
        &self,
        ledger_id: u64,
        master_key: &[u8],
    ) -> Result<Arc<crate::ledger::LedgerDescriptor>, BookieError> {
        let handle = self.handles.get_handle(ledger_id, master_key)?;
        let inserted = {
            let mut keys = self.master_keys.lock();
            if keys.contains_key(&ledger_id) {
                false
            } else {
                keys.insert(ledger_id, master_key.to_vec());
                true
            }
        };
        if inserted {
            let mut record = Vec::with_capacity(20 + master_key.len());
            record.extend_from_slice(&ledger_id.to_be_bytes());
            record.extend_from_slice(&METAENTRY_ID_LEDGER_KEY.to_be_bytes());
            record.extend_from_slice(&(master_key.len() as u32).to_be_bytes());
            record.extend_from_slice(master_key);
            self.journal.append(
                record,
                Box::new(move |result, ledger_id, _| {
                    if let Err(err) = result {
                        warn!("event=ledger_key_record_failed ledger={ledger_id} error={err}");
                    }
                }),
            )?;
        }
        Ok(handle)
    }

    /// Adds an entry; the ack fires from the journal fsync.
    pub fn add_entry(
        &self,
        entry: Vec<u8>,
        master_key: &[u8],
        cb: WriteCallback,
    ) -> Result<(), BookieError> {
        let started = Instant::now();
        let result = self.add_entry_internal(entry, master_key, cb, false);
        self.record_op("bookie.add_entry", started, &result);
        result
    }

    /// The only write allowed on a fenced ledger; used by ledger recovery.
    pub fn recovery_add_entry(
        &self,
        entry: Vec<u8>,
        master_key: &[u8],
        cb: WriteCallback,
    ) -> Result<(), BookieError> {
        let started = Instant::now();
        let result = self.add_entry_internal(entry, master_key, cb, true);
        self.record_op("bookie.recovery_add_entry", started, &result);
        result
    }

    fn add_entry_internal(
        &self,
        entry: Vec<u8>,
        master_key: &[u8],
        cb: WriteCallback,
        recovery: bool,
    ) -> Result<(), BookieError> {
        let (ledger_id, entry_id) = parse_entry_prefix(&entry)?;
        if is_meta_entry_id(entry_id) {
            return Err(BookieError::ReservedEntryId {
                ledger_id,
                entry_id,
            });
        }
        if self.flags.is_read_only() {
            return Err(BookieError::NoWritableLedgerDir);
        }
        let result = (|| {
            let handle = self.get_ledger_for_entry(ledger_id, master_key)?;
            let guard = handle.lock_write();
            if !recovery && handle.is_fenced()? {
                return Err(BookieError::LedgerFenced { ledger_id });
            }
            handle.add_entry(&entry)?;
            let bookie_id = self.bookie_id.clone();
            self.journal.append(
                entry,
                Box::new(move |result, ledger_id, entry_id| {
                    cb(WriteAck {
                        result,
                        ledger_id,
                        entry_id,
                        bookie_id,
                    })
                }),
            )?;
            drop(guard);
            Ok(())
        })();
        if matches!(result, Err(BookieError::NoWritableLedgerDir)) {
            self.state.submit(StateCommand::TransitionReadOnly);
        }
        result
    }

    /// Irreversibly fences the ledger; the future completes when the fence
    /// record is durable. Fencing an already-fenced ledger is an immediate
    /// `true` and writes nothing.
    pub fn fence_ledger(
        &self,
        ledger_id: u64,
        master_key: &[u8],
    ) -> Result<FenceFuture, BookieError> {
        let started = Instant::now();
        let result = (|| {
            let handle = self.handles.get_handle(ledger_id, master_key)?;
            let changed = {
                let _guard = handle.lock_write();
                handle.set_fenced()?
            };
            if !changed {
                return Ok(FenceFuture::ready(true));
            }
            let mut record = Vec::with_capacity(16);
            record.extend_from_slice(&ledger_id.to_be_bytes());
            record.extend_from_slice(&METAENTRY_ID_FENCE_KEY.to_be_bytes());
            let future = FenceFuture::new();
            let setter = future.clone();
            self.journal.append(
                record,
                Box::new(move |result, _, _| setter.set(result.is_ok())),
            )?;
            Ok(future)
        })();
        self.record_op("bookie.fence", started, &result);
        result
    }

    pub fn read_entry(&self, ledger_id: u64, entry_id: u64) -> Result<Vec<u8>, BookieError> {
        let started = Instant::now();
        let result = self
            .handles
            .get_read_only_handle(ledger_id)
            .and_then(|handle| handle.read_entry(entry_id));
        self.record_op("bookie.read_entry", started, &result);
        result
    }

    pub fn read_last_add_confirmed(&self, ledger_id: u64) -> Result<i64, BookieError> {
        let started = Instant::now();
        let result = self
            .handles
            .get_read_only_handle(ledger_id)
            .and_then(|handle| handle.last_add_confirmed());
        self.record_op("bookie.read_lac", started, &result);
        result
    }

    /// Fired at least once when the ledger's LAC exceeds `previous_lac`.
    pub fn wait_for_lac_update(
        &self,
        ledger_id: u64,
        previous_lac: i64,
    ) -> Result<LacWaiter, BookieError> {
        let handle = self.handles.get_read_only_handle(ledger_id)?;
        handle.wait_for_lac_update(previous_lac)
    }

    fn record_op<T>(&self, name: &str, started: Instant, result: &Result<T, BookieError>) {
        let elapsed_us = started.elapsed().as_micros() as u64;
        match result {
            Ok(_) => self.metrics.inc_counter(name, 1),
            Err(_) => self
                .metrics
                .inc_counter(&format!("{name}_failed"), 1),
        }
        self.metrics.observe(&format!("{name}_us"), elapsed_us);
    }

    pub fn is_running(&self) -> bool {
        self.flags.is_running()
    }

    pub fn is_read_only(&self) -> bool {
        self.flags.is_read_only()
    }

    pub fn mode(&self) -> BookieMode {
        self.flags.mode()
    }

    pub fn metrics(&self) -> &SharedMetricsRegistry {
        &self.metrics
    }

    pub fn sync_engine(&self) -> &SyncEngine {
        &self.sync_engine
    }

    pub fn journal(&self) -> &Arc<Journal> {
        &self.journal
    }

    pub fn storage(&self) -> &Arc<dyn LedgerStorage> {
        &self.storage
    }

    /// Graceful shutdown; returns the first recorded exit code.
    pub fn shutdown(&self) -> i32 {
        self.shutdown_with_code(exit_code::OK)
    }

    fn shutdown_with_code(&self, code: i32) -> i32 {
        let mut final_exit = self.final_exit.lock();
        if let Some(existing) = *final_exit {
            return existing;
        }
        info!("event=bookie_shutdown_begin code={code}");
        self.flags.set_shutting_down();

        self.sync_engine.shutdown();

        self.journal_dirs.shutdown();
        self.ledger_dirs.shutdown();
        if let Some(index) = &self.index_dirs {
            index.shutdown();
        }

        self.journal.shutdown();
        if let Some(watcher) = self.journal_watcher.lock().take() {
            if watcher.join().is_err() {
                error!("event=journal_watcher_panicked");
            }
        }

        self.storage.shutdown();

        for path in [self.writable_reg_path(), self.readonly_reg_path()] {
            let _ = self.coordinator.delete_node(&path);
        }

        self.state.shutdown();
        self.flags.set_running(false);
        self.metrics
            .set_gauge("bookie.server_status", STATUS_UNREGISTERED);

        *final_exit = Some(code);
        info!("event=bookie_shutdown_complete code={code}");
        code
    }

    fn writable_reg_path(&self) -> String {
        format!("{}/{}", self.config.available_path(), self.bookie_id)
    }

    fn readonly_reg_path(&self) -> String {
        format!("{}/{}", self.config.readonly_path(), self.bookie_id)
    }

    /// Clears journal, ledger and index directories for a fresh install.
    ///
    /// Refuses non-empty directories unless `force` is set. Returns whether
    /// formatting ran.
    pub fn format(config: &ServerConfig, force: bool) -> Result<bool, BookieError> {
        let mut dirs: Vec<&PathBuf> = vec![&config.journal_dir];
        dirs.extend(config.ledger_dirs.iter());
        dirs.extend(config.index_dirs.iter());
        if !force {
            for dir in &dirs {
                if dir.is_dir() {
                    let occupied = dir
                        .read_dir()
                        .map_err(|err| format_error(dir, &err))?
                        .next()
                        .is_some();
                    if occupied {
                        error!("event=format_aborted dir={} occupied=true", dir.display());
                        return Ok(false);
                    }
                }
            }
        }
        for dir in dirs {
            clean_dir(dir)?;
        }
        info!("event=format_complete");
        Ok(true)
    }
}

struct BookieDirsListener {
    state: Sender<StateCommand>,
    shutdown_tx: Sender<i32>,
}

impl DirsListener for BookieDirsListener {
    fn disk_failed(&self, dir: &Path) {
        error!("event=disk_failed dir={} action=shutdown", dir.display());
        let _ = self.shutdown_tx.send(exit_code::BOOKIE_EXCEPTION);
    }

    fn all_disks_full(&self) {
        let _ = self.state.send(StateCommand::TransitionReadOnly);
    }

    fn disk_writable(&self, _dir: &Path) {
        let _ = self.state.send(StateCommand::TransitionWritable);
    }

    fn disk_just_writable(&self, _dir: &Path) {
        let _ = self.state.send(StateCommand::TransitionWritable);
    }

    fn fatal_error(&self) {
        error!("event=dirs_fatal_error action=shutdown");
        let _ = self.shutdown_tx.send(exit_code::BOOKIE_EXCEPTION);
    }
}

fn parse_entry_prefix(entry: &[u8]) -> Result<(u64, u64), BookieError> {
    if entry.len() < 16 {
        return Err(BookieError::JournalIo(std::io::Error::other(
            "entry shorter than its id prefix",
        )));
    }
    let mut ledger_id = [0u8; 8];
    let mut entry_id = [0u8; 8];
    ledger_id.copy_from_slice(&entry[..8]);
    entry_id.copy_from_slice(&entry[8..16]);
    Ok((u64::from_be_bytes(ledger_id), u64::from_be_bytes(entry_id)))
}

/// `ledgerId(8) | meta id(8) | keyLen(4) | key[keyLen]`
fn parse_ledger_key_record(record: &[u8]) -> Result<Vec<u8>, BookieError> {
    if record.len() < 20 {
        return Err(BookieError::JournalIo(std::io::Error::other(
            "truncated ledger-key meta record",
        )));
    }
    let mut len = [0u8; 4];
    len.copy_from_slice(&record[16..20]);
    let len = u32::from_be_bytes(len) as usize;
    if record.len() < 20 + len {
        return Err(BookieError::JournalIo(std::io::Error::other(
            "ledger-key meta record shorter than its declared key",
        )));
    }
    Ok(record[20..20 + len].to_vec())
}

fn replay_format_error(what: &str, version: u32) -> BookieError {
    BookieError::JournalIo(std::io::Error::other(format!(
        "journal contains a {what} but layout version {version} is too old to hold it"
    )))
}

fn dirs_fatal(err: DirsError) -> BookieError {
    match err {
        DirsError::NoWritableDir => BookieError::NoWritableLedgerDir,
        other => BookieError::DiskError {
            reason: other.to_string(),
        },
    }
}

fn cookie_fatal(err: CookieError) -> BookieError {
    match err {
        CookieError::Coordinator(inner) => BookieError::Coordinator(inner),
        other => BookieError::InvalidCookie {
            reason: other.to_string(),
        },
    }
}

fn check_capacity(
    ledger_dirs: &DirsManager,
    index_dirs: Option<&DirsManager>,
) -> Result<(), BookieError> {
    ledger_dirs.check_all_dirs().map_err(dirs_fatal)?;
    if let Some(index) = index_dirs {
        index.check_all_dirs().map_err(dirs_fatal)?;
    }
    Ok(())
}

fn format_error(dir: &Path, err: &std::io::Error) -> BookieError {
    BookieError::DiskError {
        reason: format!("{}: {err}", dir.display()),
    }
}

fn clean_dir(dir: &Path) -> Result<(), BookieError> {
    if dir.is_dir() {
        for child in dir.read_dir().map_err(|err| format_error(dir, &err))? {
            let child = child.map_err(|err| format_error(dir, &err))?;
            let path = child.path();
            let removed = if path.is_dir() {
                std::fs::remove_dir_all(&path)
            } else {
                std::fs::remove_file(&path)
            };
            removed.map_err(|err| format_error(&path, &err))?;
        }
    } else {
        std::fs::create_dir_all(dir).map_err(|err| format_error(dir, &err))?;
    }
    Ok(())
}
