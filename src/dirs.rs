use log::{error, info, warn};
use parking_lot::{Condvar, Mutex};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;

/// Data lives under `<dir>/current/`; the parent holds only the layout.
pub const CURRENT_DIR: &str = "current";

/// Legacy file suffixes adjacent to `current/` mean a pre-v3 layout.
const LEGACY_SUFFIXES: [&str; 3] = [".txn", ".idx", ".log"];

pub fn current_directory(dir: &Path) -> PathBuf {
    dir.join(CURRENT_DIR)
}

/// Ensures `current_dir` exists, failing on pre-v3 residue next to it.
pub fn check_directory_structure(current_dir: &Path) -> Result<(), DirsError> {
    if current_dir.exists() {
        return Ok(());
    }
    if let Some(parent) = current_dir.parent() {
        if parent.exists() {
            let legacy_version = parent.join(crate::cookie::VERSION_FILENAME);
            let mut legacy = legacy_version.exists();
            if !legacy {
                let io_err = |source| DirsError::Io {
                    path: parent.to_path_buf(),
                    source,
                };
                for child in parent.read_dir().map_err(io_err)? {
                    let name = child.map_err(io_err)?.file_name();
                    let name = name.to_string_lossy();
                    if LEGACY_SUFFIXES.iter().any(|suffix| name.ends_with(suffix)) {
                        legacy = true;
                        break;
                    }
                }
            }
            if legacy {
                error!(
                    "event=legacy_layout_detected dir={} needs_upgrade=true",
                    parent.display()
                );
                return Err(DirsError::LegacyLayout {
                    dir: parent.to_path_buf(),
                });
            }
        }
    }
    std::fs::create_dir_all(current_dir).map_err(|source| DirsError::Io {
        path: current_dir.to_path_buf(),
        source,
    })
}

/// Fraction of the filesystem already used, `0.0..=1.0`.
pub trait DiskProbe: Send + Sync {
    fn usage(&self, dir: &Path) -> Result<f32, DirsError>;
}

/// Default probe backed by the filesystem's free/total counters.
#[derive(Debug, Default)]
pub struct Fs2Probe;

impl DiskProbe for Fs2Probe {
    fn usage(&self, dir: &Path) -> Result<f32, DirsError> {
        let available = fs2::available_space(dir).map_err(|source| DirsError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let total = fs2::total_space(dir).map_err(|source| DirsError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        if total == 0 {
            return Err(DirsError::Probe {
                path: dir.to_path_buf(),
                reason: "zero-sized filesystem".to_string(),
            });
        }
        Ok(1.0 - available as f32 / total as f32)
    }
}

/// Disk state events emitted by the monitor thread.
pub trait DirsListener: Send + Sync {
    fn disk_failed(&self, _dir: &Path) {}
    fn all_disks_full(&self) {}
    fn disk_writable(&self, _dir: &Path) {}
    fn disk_just_writable(&self, _dir: &Path) {}
    fn fatal_error(&self) {}
}

#[derive(Debug, Default)]
struct DirsState {
    writable: Vec<PathBuf>,
    filled: Vec<PathBuf>,
}

/// Tracks one area's directories (journal, ledger or index), their free
/// space, and which of them may currently accept writes.
pub struct DirsManager {
    dirs: Vec<PathBuf>,
    state: Mutex<DirsState>,
    listeners: Mutex<Vec<Arc<dyn DirsListener>>>,
    probe: Arc<dyn DiskProbe>,
    warn_threshold: f32,
    full_threshold: f32,
    check_interval: Duration,
    next_pick: AtomicUsize,
    stop: Arc<(Mutex<bool>, Condvar)>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl DirsManager {
    /// `dirs` are the configured parents; data goes to their `current/`.
    pub fn new(
        dirs: &[PathBuf],
        probe: Arc<dyn DiskProbe>,
        warn_threshold: f32,
        full_threshold: f32,
        check_interval: Duration,
    ) -> Self {
        let current_dirs: Vec<PathBuf> = dirs.iter().map(|dir| current_directory(dir)).collect();
        Self {
            state: Mutex::new(DirsState {
                writable: current_dirs.clone(),
                filled: Vec::new(),
            }),
            dirs: current_dirs,
            listeners: Mutex::new(Vec::new()),
            probe,
            warn_threshold,
            full_threshold,
            check_interval,
            next_pick: AtomicUsize::new(0),
            stop: Arc::new((Mutex::new(false), Condvar::new())),
            monitor: Mutex::new(None),
        }
    }

    /// The managed `current/` directories.
    pub fn all_dirs(&self) -> &[PathBuf] {
        &self.dirs
    }

    /// Creates the `current/` layout for every directory.
    pub fn check_structure(&self) -> Result<(), DirsError> {
        for dir in &self.dirs {
            check_directory_structure(dir)?;
        }
        Ok(())
    }

    pub fn add_listener(&self, listener: Arc<dyn DirsListener>) {
        self.listeners.lock().push(listener);
    }

    /// Round-robin pick among writable directories.
    pub fn pick_writable_dir(&self) -> Result<PathBuf, DirsError> {
        let state = self.state.lock();
        if state.writable.is_empty() {
            return Err(DirsError::NoWritableDir);
        }
        let idx = self.next_pick.fetch_add(1, Ordering::Relaxed) % state.writable.len();
        Ok(state.writable[idx].clone())
    }

    pub fn has_writable_dir(&self) -> bool {
        !self.state.lock().writable.is_empty()
    }

    /// Probes every directory once, updating the writable set.
    ///
    /// Errors with `NoWritableDir` when every directory is beyond the full
    /// threshold, and with the probe failure when a disk cannot be checked.
    pub fn check_all_dirs(&self) -> Result<(), DirsError> {
        let mut writable = Vec::new();
        let mut filled = Vec::new();
        for dir in &self.dirs {
            let usage = self.probe.usage(dir)?;
            if usage > self.full_threshold {
                warn!(
                    "event=disk_full dir={} usage={:.3} threshold={:.3}",
                    dir.display(),
                    usage,
                    self.full_threshold
                );
                filled.push(dir.clone());
            } else {
                writable.push(dir.clone());
            }
        }
        let all_full = writable.is_empty();
        *self.state.lock() = DirsState { writable, filled };
        if all_full {
            return Err(DirsError::NoWritableDir);
        }
        Ok(())
    }

    /// Starts the background monitor emitting listener events.
    pub fn start(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        let handle = thread::spawn(move || manager.monitor_loop());
        *self.monitor.lock() = Some(handle);
    }

    pub fn shutdown(&self) {
        {
            let (lock, condvar) = &*self.stop;
            *lock.lock() = true;
            condvar.notify_all();
        }
        if let Some(handle) = self.monitor.lock().take() {
            if handle.join().is_err() {
                error!("event=dirs_monitor_panicked");
            }
        }
    }

    fn monitor_loop(&self) {
        let mut was_all_full = false;
        loop {
            {
                let (lock, condvar) = &*self.stop;
                let mut stopped = lock.lock();
                if *stopped {
                    return;
                }
                condvar.wait_for(&mut stopped, self.check_interval);
                if *stopped {
                    return;
                }
            }
            was_all_full = self.run_checks(was_all_full);
        }
    }

    fn run_checks(&self, was_all_full: bool) -> bool {
        let listeners: Vec<Arc<dyn DirsListener>> = self.listeners.lock().clone();
        for dir in &self.dirs {
            match self.probe.usage(dir) {
                Err(err) => {
                    error!("event=disk_check_failed dir={} error={}", dir.display(), err);
                    self.mark_filled(dir);
                    for listener in &listeners {
                        listener.disk_failed(dir);
                    }
                }
                Ok(usage) if usage > self.full_threshold => {
                    if self.mark_filled(dir) {
                        warn!(
                            "event=disk_transitioned_full dir={} usage={:.3}",
                            dir.display(),
                            usage
                        );
                    }
                }
                Ok(usage) => {
                    if self.mark_writable(dir) {
                        info!(
                            "event=disk_transitioned_writable dir={} usage={:.3}",
                            dir.display(),
                            usage
                        );
                        if usage < self.warn_threshold {
                            for listener in &listeners {
                                listener.disk_writable(dir);
                            }
                        } else {
                            for listener in &listeners {
                                listener.disk_just_writable(dir);
                            }
                        }
                    }
                }
            }
        }
        let all_full = !self.has_writable_dir();
        if all_full && !was_all_full {
            warn!("event=all_disks_full dirs={}", self.dirs.len());
            for listener in &listeners {
                listener.all_disks_full();
            }
        }
        all_full
    }

    /// Returns true when the directory transitioned out of the writable set.
    fn mark_filled(&self, dir: &Path) -> bool {
        let mut state = self.state.lock();
        if let Some(pos) = state.writable.iter().position(|d| d == dir) {
            let dir = state.writable.remove(pos);
            state.filled.push(dir);
            true
        } else {
            false
        }
    }

    fn mark_writable(&self, dir: &Path) -> bool {
        let mut state = self.state.lock();
        if let Some(pos) = state.filled.iter().position(|d| d == dir) {
            let dir = state.filled.remove(pos);
            state.writable.push(dir);
            true
        } else {
            false
        }
    }

    /// Immediate re-check, for tests and startup probing.
    pub fn poll_once(&self) {
        self.run_checks(false);
    }
}

#[derive(Debug, Error)]
pub enum DirsError {
    #[error("no writable directory")]
    NoWritableDir,
    #[error("directory layout version is less than 3, upgrade needed: {dir}")]
    LegacyLayout { dir: PathBuf },
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("disk probe failed at {path}: {reason}")]
    Probe { path: PathBuf, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;
    use std::collections::HashMap;
    use std::fs;
    use tempfile::tempdir;

    struct FixedProbe {
        usages: PlMutex<HashMap<PathBuf, f32>>,
    }

    impl FixedProbe {
        fn new() -> Self {
            Self {
                usages: PlMutex::new(HashMap::new()),
            }
        }

        fn set(&self, dir: &Path, usage: f32) {
            self.usages.lock().insert(dir.to_path_buf(), usage);
        }
    }

    impl DiskProbe for FixedProbe {
        fn usage(&self, dir: &Path) -> Result<f32, DirsError> {
            Ok(*self.usages.lock().get(dir).unwrap_or(&0.1))
        }
    }

    #[test]
    fn structure_check_creates_current_dir() {
        let dir = tempdir().unwrap();
        let current = current_directory(&dir.path().join("ledgers"));
        check_directory_structure(&current).unwrap();
        assert!(current.is_dir());
    }

    #[test]
    fn legacy_residue_fails_structure_check() {
        let dir = tempdir().unwrap();
        let parent = dir.path().join("ledgers");
        fs::create_dir_all(&parent).unwrap();
        fs::write(parent.join("0.txn"), b"old").unwrap();
        let err = check_directory_structure(&current_directory(&parent)).unwrap_err();
        assert!(matches!(err, DirsError::LegacyLayout { .. }));
    }

    #[test]
    fn pre_v3_version_file_fails_structure_check() {
        let dir = tempdir().unwrap();
        let parent = dir.path().join("ledgers");
        fs::create_dir_all(&parent).unwrap();
        fs::write(parent.join(crate::cookie::VERSION_FILENAME), b"1").unwrap();
        let err = check_directory_structure(&current_directory(&parent)).unwrap_err();
        assert!(matches!(err, DirsError::LegacyLayout { .. }));
    }

    #[test]
    fn check_all_dirs_reports_no_writable_when_everything_full() {
        let dir = tempdir().unwrap();
        let parents = vec![dir.path().join("a"), dir.path().join("b")];
        let probe = Arc::new(FixedProbe::new());
        let manager = DirsManager::new(
            &parents,
            probe.clone(),
            0.90,
            0.95,
            Duration::from_secs(10),
        );
        manager.check_structure().unwrap();
        for current in manager.all_dirs() {
            probe.set(current, 0.99);
        }
        assert!(matches!(
            manager.check_all_dirs(),
            Err(DirsError::NoWritableDir)
        ));
        assert!(!manager.has_writable_dir());
    }

    struct RecordingListener {
        events: PlMutex<Vec<String>>,
    }

    impl DirsListener for RecordingListener {
        fn all_disks_full(&self) {
            self.events.lock().push("all_full".to_string());
        }
        fn disk_writable(&self, _dir: &Path) {
            self.events.lock().push("writable".to_string());
        }
        fn disk_just_writable(&self, _dir: &Path) {
            self.events.lock().push("just_writable".to_string());
        }
    }

    #[test]
    fn monitor_transitions_emit_events() {
        let dir = tempdir().unwrap();
        let parents = vec![dir.path().join("a")];
        let probe = Arc::new(FixedProbe::new());
        let manager = DirsManager::new(
            &parents,
            probe.clone(),
            0.90,
            0.95,
            Duration::from_secs(10),
        );
        manager.check_structure().unwrap();
        let listener = Arc::new(RecordingListener {
            events: PlMutex::new(Vec::new()),
        });
        manager.add_listener(listener.clone());
        let current = manager.all_dirs()[0].clone();

        probe.set(&current, 0.99);
        manager.poll_once();
        assert_eq!(listener.events.lock().as_slice(), ["all_full"]);

        // recovers into the warn band first
        probe.set(&current, 0.92);
        manager.poll_once();
        assert_eq!(
            listener.events.lock().as_slice(),
            ["all_full", "just_writable"]
        );

        probe.set(&current, 0.99);
        manager.poll_once();
        probe.set(&current, 0.10);
        manager.poll_once();
        assert_eq!(
            listener.events.lock().as_slice(),
            ["all_full", "just_writable", "all_full", "writable"]
        );
    }
}
