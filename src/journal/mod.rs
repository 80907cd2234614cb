//! Write-ahead journal: group-committed durability for opaque records.
//!
//! A dedicated writer thread owns the segment files and the fsync; callers
//! enqueue records and receive their completion only after the bytes are on
//! disk. The persisted log mark (see [`mark`]) bounds crash-recovery replay.

pub mod mark;
pub mod segment;

pub use mark::{LastLogMark, LogMark, LAST_MARK_FILENAME};
pub use segment::{CURRENT_VERSION, VERSION_V3, VERSION_V4};

use crate::error::BookieError;
use log::{error, info, warn};
use parking_lot::Mutex;
use segment::{frame_record, list_segments, SegmentError, SegmentScanner, SegmentWriter};
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Fires exactly once per appended record, after its bytes are fsync'd (or
/// the write failed), with the record's `(ledger_id, entry_id)`.
pub type JournalCompletion = Box<dyn FnOnce(Result<(), BookieError>, u64, u64) + Send>;

/// Receives replayed records strictly after the persisted log mark.
pub trait JournalVisitor {
    fn process(
        &mut self,
        journal_version: u32,
        offset: u64,
        record: &[u8],
    ) -> Result<(), BookieError>;
}

#[derive(Debug, Clone)]
pub struct JournalConfig {
    /// `current/` directory holding the segment files.
    pub journal_dir: PathBuf,
    /// Directories receiving the persisted `lastMark` file.
    pub mark_dirs: Vec<PathBuf>,
    pub group_commit_bytes: usize,
    pub max_group_wait: Duration,
    pub queue_len: usize,
    pub max_segment_bytes: u64,
    pub max_backup_journals: usize,
}

struct PendingRecord {
    payload: Vec<u8>,
    ledger_id: u64,
    entry_id: u64,
    completion: JournalCompletion,
}

enum QueueItem {
    Record(PendingRecord),
    Shutdown,
}

/// The journal instance owned by the bookie.
pub struct Journal {
    config: Arc<JournalConfig>,
    last_mark: Arc<LastLogMark>,
    sender: SyncSender<QueueItem>,
    receiver: Mutex<Option<Receiver<QueueItem>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    next_segment_id: u64,
    running: AtomicBool,
}

impl Journal {
    pub fn open(config: JournalConfig) -> Result<Self, BookieError> {
        fs::create_dir_all(&config.journal_dir).map_err(BookieError::JournalIo)?;
        let next_segment_id = list_segments(&config.journal_dir)
            .map_err(BookieError::JournalIo)?
            .last()
            .map(|(id, _)| id + 1)
            .unwrap_or(1);
        let last_mark = Arc::new(LastLogMark::load(config.mark_dirs.clone()));
        let (sender, receiver) = sync_channel(config.queue_len);
        Ok(Self {
            config: Arc::new(config),
            last_mark,
            sender,
            receiver: Mutex::new(Some(receiver)),
            writer: Mutex::new(None),
            next_segment_id,
            running: AtomicBool::new(true),
        })
    }

    /// Starts the writer thread. Replay must happen before this.
    pub fn start(&self) {
        let Some(receiver) = self.receiver.lock().take() else {
            return;
        };
        let mut writer = Writer {
            config: Arc::clone(&self.config),
            last_mark: Arc::clone(&self.last_mark),
            next_segment_id: self.next_segment_id,
            segment: None,
        };
        let handle = thread::spawn(move || writer.run(receiver));
        *self.writer.lock() = Some(handle);
    }

    /// Schedules `payload` for group commit.
    ///
    /// Blocks when the journal queue is at its bound. The first sixteen
    /// bytes of the payload must carry the big-endian ledger and entry ids.
    pub fn append(&self, payload: Vec<u8>, completion: JournalCompletion) -> Result<(), BookieError> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(BookieError::JournalIo(io::Error::other(
                "journal is shut down",
            )));
        }
        let (ledger_id, entry_id) = parse_record_ids(&payload)?;
        self.sender
            .send(QueueItem::Record(PendingRecord {
                payload,
                ledger_id,
                entry_id,
                completion,
            }))
            .map_err(|_| BookieError::JournalIo(io::Error::other("journal writer is gone")))
    }

    /// Feeds every record after the persisted mark to `visitor`, in order.
    ///
    /// Also advances the in-memory tail mark past everything scanned, so the
    /// post-replay flush covers replayed records.
    pub fn replay(&self, visitor: &mut dyn JournalVisitor) -> Result<(), BookieError> {
        let mark = self.last_mark.persisted();
        let segments =
            list_segments(&self.config.journal_dir).map_err(BookieError::JournalIo)?;
        let mut replayed = 0u64;
        for (id, path) in segments {
            if id < mark.journal_id {
                continue;
            }
            let mut scanner = SegmentScanner::open(id, &path).map_err(segment_error)?;
            while let Some((offset, record)) = scanner.next_record().map_err(segment_error)? {
                if id == mark.journal_id && offset < mark.offset {
                    continue;
                }
                visitor.process(scanner.version(), offset, &record)?;
                replayed += 1;
            }
            self.last_mark.advance_cur(LogMark::new(id, scanner.offset()));
        }
        info!("event=journal_replay_done records={replayed} from_mark={mark}");
        Ok(())
    }

    /// Current journal tail, usable as a checkpoint candidate.
    pub fn request_checkpoint(&self) -> LogMark {
        self.last_mark.cur()
    }

    pub fn persisted_mark(&self) -> LogMark {
        self.last_mark.persisted()
    }

    /// Persists `mark` after the caller has fsync'd all dependent ledger
    /// state, then garbage-collects journal segments behind it.
    pub fn complete_checkpoint(&self, mark: LogMark) -> Result<(), BookieError> {
        let effective = self.last_mark.persist(mark).map_err(BookieError::JournalIo)?;
        self.gc_old_segments(effective);
        Ok(())
    }

    fn gc_old_segments(&self, persisted: LogMark) {
        let segments = match list_segments(&self.config.journal_dir) {
            Ok(segments) => segments,
            Err(err) => {
                warn!("event=journal_gc_scan_failed error={err}");
                return;
            }
        };
        let old: Vec<_> = segments
            .into_iter()
            .filter(|(id, _)| *id < persisted.journal_id)
            .collect();
        if old.len() <= self.config.max_backup_journals {
            return;
        }
        let delete_count = old.len() - self.config.max_backup_journals;
        for (id, path) in old.into_iter().take(delete_count) {
            match fs::remove_file(&path) {
                Ok(()) => info!("event=journal_segment_deleted id={id:x}"),
                Err(err) => warn!("event=journal_segment_delete_failed id={id:x} error={err}"),
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Drains queued records, then stops and joins the writer.
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        // FIFO order: every record enqueued before the sentinel flushes first
        let _ = self.sender.send(QueueItem::Shutdown);
        if let Some(handle) = self.writer.lock().take() {
            if handle.join().is_err() {
                error!("event=journal_writer_panicked");
            }
        }
        info!("event=journal_shutdown_complete");
    }

    /// Handle on which the bookie watches for abnormal writer exit.
    pub fn take_writer_handle(&self) -> Option<JoinHandle<()>> {
        self.writer.lock().take()
    }
}

fn parse_record_ids(payload: &[u8]) -> Result<(u64, u64), BookieError> {
    if payload.len() < 16 {
        return Err(BookieError::JournalIo(io::Error::other(
            "journal record shorter than its id prefix",
        )));
    }
    let mut ledger_id = [0u8; 8];
    let mut entry_id = [0u8; 8];
    ledger_id.copy_from_slice(&payload[..8]);
    entry_id.copy_from_slice(&payload[8..16]);
    Ok((u64::from_be_bytes(ledger_id), u64::from_be_bytes(entry_id)))
}

fn segment_error(err: SegmentError) -> BookieError {
    BookieError::JournalIo(io::Error::other(err))
}

struct Writer {
    config: Arc<JournalConfig>,
    last_mark: Arc<LastLogMark>,
    next_segment_id: u64,
    segment: Option<SegmentWriter>,
}

impl Writer {
    fn run(&mut self, receiver: Receiver<QueueItem>) {
        loop {
            let first = match receiver.recv() {
                Ok(item) => item,
                Err(_) => return,
            };
            let mut batch = Vec::new();
            let mut stop = false;
            match first {
                QueueItem::Record(record) => batch.push(record),
                QueueItem::Shutdown => return,
            }
            let deadline = Instant::now() + self.config.max_group_wait;
            let mut batch_bytes = framed_len(&batch[0]);
            while batch_bytes < self.config.group_commit_bytes {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break;
                }
                match receiver.recv_timeout(remaining) {
                    Ok(QueueItem::Record(record)) => {
                        batch_bytes += framed_len(&record);
                        batch.push(record);
                    }
                    Ok(QueueItem::Shutdown) => {
                        stop = true;
                        break;
                    }
                    Err(RecvTimeoutError::Timeout) => break,
                    Err(RecvTimeoutError::Disconnected) => {
                        stop = true;
                        break;
                    }
                }
            }
            if self.flush_batch(batch).is_err() {
                // fatal journal failure; the bookie's watcher reacts to the
                // writer exiting while not shutting down
                return;
            }
            if stop {
                return;
            }
        }
    }

    fn flush_batch(&mut self, batch: Vec<PendingRecord>) -> Result<(), ()> {
        if batch.is_empty() {
            return Ok(());
        }
        match self.write_and_sync(&batch) {
            Ok(end_mark) => {
                self.last_mark.advance_cur(end_mark);
                for record in batch {
                    (record.completion)(Ok(()), record.ledger_id, record.entry_id);
                }
                Ok(())
            }
            Err(err) => {
                error!("event=journal_flush_failed error={err}");
                for record in batch {
                    let failure = BookieError::JournalIo(io::Error::new(
                        err.kind(),
                        err.to_string(),
                    ));
                    (record.completion)(Err(failure), record.ledger_id, record.entry_id);
                }
                Err(())
            }
        }
    }

    fn write_and_sync(&mut self, batch: &[PendingRecord]) -> io::Result<LogMark> {
        let segment = match self.segment.as_mut() {
            Some(segment) if segment.offset() < self.config.max_segment_bytes => segment,
            _ => {
                let id = self.next_segment_id;
                self.next_segment_id += 1;
                let segment = SegmentWriter::create(&self.config.journal_dir, id)?;
                info!("event=journal_segment_rolled id={id:x}");
                self.segment.insert(segment)
            }
        };
        let mut buf = Vec::new();
        for record in batch {
            frame_record(&mut buf, &record.payload).map_err(io::Error::other)?;
        }
        segment.write_chunk(&buf)?;
        segment.sync()?;
        Ok(LogMark::new(segment.id(), segment.offset()))
    }
}

fn framed_len(record: &PendingRecord) -> usize {
    record.payload.len() + 8
}
