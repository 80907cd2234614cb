use crate::error::BookieError;
use crate::future::SettableFuture;
use crate::journal::{Journal, LogMark};
use crate::ledger::LedgerStorage;
use log::{error, info, warn};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Completes with `true` when the sync request flushed and, where it had a
/// mark to persist, the mark was rolled.
pub type SyncTicket = SettableFuture<bool>;

#[derive(Debug, Clone, Copy)]
enum SyncKind {
    /// Flush storage, then persist this mark.
    Checkpoint(LogMark),
    /// Flush everything; the mark was captured when the request was made.
    Flush(LogMark),
}

struct SyncRequest {
    kind: SyncKind,
    ticket: SyncTicket,
}

enum SyncItem {
    Request(SyncRequest),
    Shutdown,
}

struct SyncShared {
    journal: Arc<Journal>,
    storage: Arc<dyn LedgerStorage>,
    /// Hook into the mode state machine; called on `NoWritableLedgerDir`
    /// and on mark-persistence failure.
    transition_to_read_only: Box<dyn Fn() + Send + Sync>,
    flushing: AtomicBool,
    suspended: Mutex<bool>,
    suspend_cv: Condvar,
    ticker_stop: Mutex<bool>,
    ticker_cv: Condvar,
}

/// The checkpoint engine: a single consumer draining sync requests.
///
/// A persisted log mark always lags the storage flush that covers it; a
/// failed flush therefore never rolls the mark, and replay after a crash
/// remains sufficient to restore every acknowledged entry.
pub struct SyncEngine {
    shared: Arc<SyncShared>,
    sender: Sender<SyncItem>,
    receiver: Mutex<Option<Receiver<SyncItem>>>,
    consumer: Mutex<Option<JoinHandle<()>>>,
    ticker: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl SyncEngine {
    pub fn new(
        journal: Arc<Journal>,
        storage: Arc<dyn LedgerStorage>,
        transition_to_read_only: Box<dyn Fn() + Send + Sync>,
    ) -> Self {
        let (sender, receiver) = channel();
        Self {
            shared: Arc::new(SyncShared {
                journal,
                storage,
                transition_to_read_only,
                flushing: AtomicBool::new(false),
                suspended: Mutex::new(false),
                suspend_cv: Condvar::new(),
                ticker_stop: Mutex::new(false),
                ticker_cv: Condvar::new(),
            }),
            sender,
            receiver: Mutex::new(Some(receiver)),
            consumer: Mutex::new(None),
            ticker: Mutex::new(None),
            stopped: AtomicBool::new(false),
        }
    }

    /// Starts the consumer, and a periodic checkpoint ticker when
    /// `flush_interval` is non-zero.
    pub fn start(&self, flush_interval: Duration) {
        let Some(receiver) = self.receiver.lock().take() else {
            return;
        };
        let shared = Arc::clone(&self.shared);
        let consumer = thread::spawn(move || consume_loop(shared, receiver));
        *self.consumer.lock() = Some(consumer);

        if !flush_interval.is_zero() {
            let shared = Arc::clone(&self.shared);
            let sender = self.sender.clone();
            let ticker = thread::spawn(move || ticker_loop(shared, sender, flush_interval));
            *self.ticker.lock() = Some(ticker);
        }
    }

    fn submit(&self, kind: SyncKind) -> SyncTicket {
        let ticket = SyncTicket::new();
        let request = SyncRequest {
            kind,
            ticket: ticket.clone(),
        };
        if self.sender.send(SyncItem::Request(request)).is_err() {
            warn!("event=sync_engine_stopped request_dropped=true");
            ticket.set(false);
        }
        ticket
    }

    /// Flush ledger storage up to `mark`, then persist it.
    pub fn checkpoint(&self, mark: LogMark) -> SyncTicket {
        self.submit(SyncKind::Checkpoint(mark))
    }

    /// Full flush of everything currently in storage.
    pub fn flush(&self) -> SyncTicket {
        let mark = self.shared.journal.request_checkpoint();
        info!("event=sync_flush_requested mark={mark}");
        self.submit(SyncKind::Flush(mark))
    }

    /// Parks the consumer before its next request. Testing hook.
    pub fn suspend(&self) {
        *self.shared.suspended.lock() = true;
    }

    pub fn resume(&self) {
        let mut suspended = self.shared.suspended.lock();
        *suspended = false;
        self.shared.suspend_cv.notify_all();
    }

    /// True while a request is being processed.
    pub fn is_flushing(&self) -> bool {
        self.shared.flushing.load(Ordering::SeqCst)
    }

    /// Deterministic drain: one final full flush is enqueued and processed
    /// before the stop sentinel, then the consumer is joined.
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("event=sync_engine_shutdown_begin");
        {
            let mut stop = self.shared.ticker_stop.lock();
            *stop = true;
            self.shared.ticker_cv.notify_all();
        }
        if let Some(ticker) = self.ticker.lock().take() {
            if ticker.join().is_err() {
                error!("event=sync_ticker_panicked");
            }
        }
        let final_flush = self.flush();
        let _ = self.sender.send(SyncItem::Shutdown);
        // a suspended consumer would never drain; wake it
        self.resume();
        if let Some(consumer) = self.consumer.lock().take() {
            if consumer.join().is_err() {
                error!("event=sync_consumer_panicked");
            }
        }
        if final_flush.peek() != Some(true) {
            warn!("event=sync_final_flush_incomplete");
        }
        info!("event=sync_engine_shutdown_complete");
    }
}

fn consume_loop(shared: Arc<SyncShared>, receiver: Receiver<SyncItem>) {
    while let Ok(item) = receiver.recv() {
        match item {
            SyncItem::Shutdown => return,
            SyncItem::Request(request) => {
                {
                    let mut suspended = shared.suspended.lock();
                    while *suspended {
                        shared.suspend_cv.wait(&mut suspended);
                    }
                }
                shared.flushing.store(true, Ordering::SeqCst);
                let ok = process(&shared, request.kind);
                request.ticket.set(ok);
                shared.flushing.store(false, Ordering::SeqCst);
            }
        }
    }
}

fn process(shared: &SyncShared, kind: SyncKind) -> bool {
    let (flush_result, mark) = match kind {
        SyncKind::Checkpoint(mark) => (shared.storage.checkpoint(mark), mark),
        SyncKind::Flush(mark) => (shared.storage.flush(), mark),
    };
    match flush_result {
        Ok(()) => {}
        Err(BookieError::NoWritableLedgerDir) => {
            error!("event=sync_flush_no_writable_dir mark={mark}");
            (shared.transition_to_read_only)();
            return false;
        }
        Err(err) => {
            // mark must not roll, or unflushed entries would be lost on
            // journal garbage collection
            error!("event=sync_flush_failed mark={mark} error={err}");
            return false;
        }
    }
    match shared.journal.complete_checkpoint(mark) {
        Ok(()) => true,
        Err(err) => {
            error!("event=log_mark_roll_failed mark={mark} error={err}");
            (shared.transition_to_read_only)();
            false
        }
    }
}

fn ticker_loop(shared: Arc<SyncShared>, sender: Sender<SyncItem>, interval: Duration) {
    loop {
        {
            let mut stop = shared.ticker_stop.lock();
            if *stop {
                return;
            }
            shared.ticker_cv.wait_for(&mut stop, interval);
            if *stop {
                return;
            }
        }
        let mark = shared.journal.request_checkpoint();
        let request = SyncRequest {
            kind: SyncKind::Checkpoint(mark),
            ticket: SyncTicket::new(),
        };
        if sender.send(SyncItem::Request(request)).is_err() {
            return;
        }
    }
}
