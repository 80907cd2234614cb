use log::{info, warn};
use parking_lot::Mutex;
use std::fmt;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

/// File holding the persisted mark inside each ledger directory.
pub const LAST_MARK_FILENAME: &str = "lastMark";

/// A position in the journal stream: everything at or before it has been
/// flushed to ledger storage once the mark is persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct LogMark {
    pub journal_id: u64,
    pub offset: u64,
}

impl LogMark {
    pub fn new(journal_id: u64, offset: u64) -> Self {
        Self { journal_id, offset }
    }
}

impl fmt::Display for LogMark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.journal_id, self.offset)
    }
}

fn read_mark_file(dir: &Path) -> Option<LogMark> {
    let path = dir.join(LAST_MARK_FILENAME);
    let mut file = File::open(path).ok()?;
    let mut buf = [0u8; 16];
    file.read_exact(&mut buf).ok()?;
    let journal_id = u64::from_be_bytes(buf[..8].try_into().ok()?);
    let offset = u64::from_be_bytes(buf[8..].try_into().ok()?);
    Some(LogMark::new(journal_id, offset))
}

fn write_mark_file(dir: &Path, mark: LogMark) -> io::Result<()> {
    let tmp = dir.join(format!(".{LAST_MARK_FILENAME}.tmp"));
    let path = dir.join(LAST_MARK_FILENAME);
    {
        let mut file = File::create(&tmp)?;
        file.write_all(&mark.journal_id.to_be_bytes())?;
        file.write_all(&mark.offset.to_be_bytes())?;
        file.sync_all()?;
    }
    fs::rename(&tmp, &path)?;
    File::open(dir)?.sync_all()
}

/// The journal's durable replay cursor.
///
/// `cur` tracks the tail the writer has fsync'd; `persisted` is the mark on
/// disk. Persisting never regresses and only happens after dependent ledger
/// state is itself durable.
#[derive(Debug)]
pub struct LastLogMark {
    cur: Mutex<LogMark>,
    persisted: Mutex<LogMark>,
    mark_dirs: Vec<PathBuf>,
}

impl LastLogMark {
    /// Loads the largest valid mark found across `mark_dirs`.
    pub fn load(mark_dirs: Vec<PathBuf>) -> Self {
        let loaded = mark_dirs
            .iter()
            .filter_map(|dir| read_mark_file(dir))
            .max()
            .unwrap_or_default();
        info!(
            "event=log_mark_loaded mark={} dirs={}",
            loaded,
            mark_dirs.len()
        );
        Self {
            cur: Mutex::new(loaded),
            persisted: Mutex::new(loaded),
            mark_dirs,
        }
    }

    pub fn cur(&self) -> LogMark {
        *self.cur.lock()
    }

    pub fn persisted(&self) -> LogMark {
        *self.persisted.lock()
    }

    /// Advances the in-memory tail; never moves backwards.
    pub fn advance_cur(&self, mark: LogMark) {
        let mut cur = self.cur.lock();
        if mark > *cur {
            *cur = mark;
        }
    }

    /// Persists `mark` to every mark directory.
    ///
    /// A candidate at or below the persisted mark is a no-op, which keeps
    /// the on-disk mark monotone under concurrent checkpoints.
    pub fn persist(&self, mark: LogMark) -> io::Result<LogMark> {
        let mut persisted = self.persisted.lock();
        if mark <= *persisted {
            return Ok(*persisted);
        }
        for dir in &self.mark_dirs {
            if let Err(err) = write_mark_file(dir, mark) {
                warn!(
                    "event=log_mark_write_failed dir={} error={}",
                    dir.display(),
                    err
                );
                return Err(err);
            }
        }
        *persisted = mark;
        Ok(mark)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn marks_order_by_journal_then_offset() {
        assert!(LogMark::new(2, 0) > LogMark::new(1, 999));
        assert!(LogMark::new(2, 10) > LogMark::new(2, 9));
    }

    #[test]
    fn persist_roundtrips_across_load() {
        let dir = tempdir().unwrap();
        let dirs = vec![dir.path().to_path_buf()];
        let mark = LastLogMark::load(dirs.clone());
        mark.persist(LogMark::new(3, 4096)).unwrap();
        let reloaded = LastLogMark::load(dirs);
        assert_eq!(reloaded.persisted(), LogMark::new(3, 4096));
        assert_eq!(reloaded.cur(), LogMark::new(3, 4096));
    }

    #[test]
    fn persist_never_regresses() {
        let dir = tempdir().unwrap();
        let dirs = vec![dir.path().to_path_buf()];
        let mark = LastLogMark::load(dirs.clone());
        mark.persist(LogMark::new(5, 100)).unwrap();
        let effective = mark.persist(LogMark::new(4, 900)).unwrap();
        assert_eq!(effective, LogMark::new(5, 100));
        assert_eq!(
            LastLogMark::load(dirs).persisted(),
            LogMark::new(5, 100)
        );
    }

    #[test]
    fn load_takes_maximum_across_dirs() {
        let root = tempdir().unwrap();
        let a = root.path().join("a");
        let b = root.path().join("b");
        std::fs::create_dir_all(&a).unwrap();
        std::fs::create_dir_all(&b).unwrap();
        write_mark_file(&a, LogMark::new(1, 50)).unwrap();
        write_mark_file(&b, LogMark::new(2, 10)).unwrap();
        let mark = LastLogMark::load(vec![a, b]);
        assert_eq!(mark.persisted(), LogMark::new(2, 10));
    }
}
