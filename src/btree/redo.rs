//! # Redo Log
//!
//! Operation logging in front of the page write-back. Each mutation
//! appends one framed record to the stream store before its dirty pages
//! can reach disk; a successful sync truncates the log because everything
//! it described is then durable in the data file.
//!
//! ## Record Payloads
//!
//! ```text
//! PUT      0x0A | key | value
//! REMOVE   0x0B | key
//! ```
//!
//! Other leading bytes are reserved; recovery skips records it does not
//! understand.
//!
//! ## Writer Thread
//!
//! With the dedicated writer enabled, submissions enqueue the prepared
//! record into a bounded channel (capacity 1) and a single consumer
//! drains it in order, which keeps redo ordering while decoupling
//! mutation latency from the log file. A blocked `send` is the
//! commit-before-return handshake when the queue is full.
//!
//! Shutdown is two-phase: the stop flag is raised and the sender dropped;
//! the worker wakes from its one-second poll, drains any residual queued
//! records, forces the log, and exits before `join` returns.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use eyre::Result;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::storage::{StreamStore, SyncCallback};

pub(crate) struct RedoLog {
    store: Arc<Mutex<StreamStore>>,
    use_thread: bool,
    worker: Option<RedoWorker>,
}

struct RedoWorker {
    tx: SyncSender<Vec<u8>>,
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl RedoLog {
    /// The stream is configured the way the tree wants its log: drained
    /// to the file on every write, fsynced only on explicit sync.
    pub fn new<P: AsRef<Path>>(path: P, buffer_size: usize) -> RedoLog {
        let mut store = StreamStore::new(path, buffer_size);
        store.set_flush_on_write(true);
        store.set_sync_on_flush(false);
        RedoLog {
            store: Arc::new(Mutex::new(store)),
            use_thread: false,
            worker: None,
        }
    }

    pub fn set_use_thread(&mut self, use_thread: bool) {
        if self.use_thread && !use_thread {
            self.stop_worker();
        }
        self.use_thread = use_thread;
    }

    pub fn set_callback(&mut self, callback: Option<SyncCallback>) {
        self.store.lock().set_callback(callback);
    }

    pub fn open(&mut self) -> Result<()> {
        self.store.lock().open()
    }

    pub fn is_open(&self) -> bool {
        self.store.lock().is_open()
    }

    pub fn close(&mut self) -> Result<()> {
        self.stop_worker();
        self.store.lock().close()
    }

    pub fn delete(&mut self) -> Result<()> {
        self.stop_worker();
        self.store.lock().delete()
    }

    pub fn size(&self) -> u64 {
        self.store.lock().size()
    }

    /// Truncate the log. Any queued-but-unwritten records are drained to
    /// the file first (by stopping the worker) so nothing survives the
    /// truncation point out of order.
    pub fn truncate(&mut self) -> Result<()> {
        self.stop_worker();
        self.store.lock().clear()
    }

    pub fn read(&mut self, offset: u64, buf: &mut Vec<u8>) -> Result<Option<u64>> {
        self.store.lock().read(offset, buf)
    }

    pub fn sync(&mut self) -> Result<()> {
        self.store.lock().sync()
    }

    /// Append one prepared record, through the writer thread when active.
    pub fn submit(&mut self, record: Vec<u8>) -> Result<()> {
        if self.use_thread {
            self.spawn_worker();
            let worker = self.worker.as_ref().unwrap();
            worker
                .tx
                .send(record)
                .map_err(|_| eyre::eyre!("redo writer thread is gone"))?;
            return Ok(());
        }
        self.store.lock().write(&record)?;
        Ok(())
    }

    fn spawn_worker(&mut self) {
        if self.worker.is_some() {
            return;
        }
        let (tx, rx) = sync_channel::<Vec<u8>>(1);
        let stop = Arc::new(AtomicBool::new(false));
        let store = Arc::clone(&self.store);
        let stop_flag = Arc::clone(&stop);
        let handle = std::thread::spawn(move || {
            loop {
                if stop_flag.load(Ordering::Acquire) {
                    break;
                }
                match rx.recv_timeout(Duration::from_secs(1)) {
                    Ok(record) => {
                        if let Err(e) = store.lock().write(&record) {
                            warn!(error = %e, "redo writer failed to append record");
                        }
                    }
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            // Drain whatever is still queued, then make it durable.
            while let Ok(record) = rx.try_recv() {
                if let Err(e) = store.lock().write(&record) {
                    warn!(error = %e, "redo writer failed to drain record");
                }
            }
            if let Err(e) = store.lock().sync() {
                warn!(error = %e, "redo writer failed final sync");
            }
        });
        debug!("redo writer thread started");
        self.worker = Some(RedoWorker { tx, stop, handle });
    }

    fn stop_worker(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.stop.store(true, Ordering::Release);
            drop(worker.tx);
            if worker.handle.join().is_err() {
                warn!("redo writer thread panicked during shutdown");
            }
            debug!("redo writer thread stopped");
        }
    }
}

impl Drop for RedoLog {
    fn drop(&mut self) {
        self.stop_worker();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(op: u8, body: &[u8]) -> Vec<u8> {
        let mut rec = vec![op];
        rec.extend_from_slice(body);
        rec
    }

    #[test]
    fn synchronous_submit_appends_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut redo = RedoLog::new(dir.path().join("t.redo"), 1024);
        redo.open().unwrap();

        redo.submit(record(0x0A, &[1, 2, 3])).unwrap();
        redo.submit(record(0x0B, &[4])).unwrap();
        redo.sync().unwrap();

        let mut buf = Vec::new();
        let next = redo.read(0, &mut buf).unwrap().unwrap();
        assert_eq!(buf, vec![0x0A, 1, 2, 3]);
        redo.read(next, &mut buf).unwrap().unwrap();
        assert_eq!(buf, vec![0x0B, 4]);
    }

    #[test]
    fn threaded_submit_lands_after_stop() {
        let dir = tempfile::tempdir().unwrap();
        let mut redo = RedoLog::new(dir.path().join("t.redo"), 1024);
        redo.open().unwrap();
        redo.set_use_thread(true);

        for i in 0..10u8 {
            redo.submit(record(0x0A, &[i])).unwrap();
        }
        // Truncate's drain barrier doubles as the flush point.
        redo.set_use_thread(false);

        let mut buf = Vec::new();
        let mut offset = 0;
        let mut seen = Vec::new();
        while let Some(next) = redo.read(offset, &mut buf).unwrap() {
            seen.push(buf[1]);
            offset = next;
        }
        assert_eq!(seen, (0..10).collect::<Vec<u8>>());
    }

    #[test]
    fn truncate_resets_the_stream() {
        let dir = tempfile::tempdir().unwrap();
        let mut redo = RedoLog::new(dir.path().join("t.redo"), 1024);
        redo.open().unwrap();
        redo.submit(record(0x0A, &[9])).unwrap();
        assert!(redo.size() > 0);

        redo.truncate().unwrap();
        assert_eq!(redo.size(), 0);
    }
}
