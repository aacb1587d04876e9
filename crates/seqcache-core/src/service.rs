//! Background service worker.
//!
//! Replication commit is latency-critical; reporting the last applied
//! seqno to the group and discarding released writesets both happen off
//! the hot path, on a single long-lived worker thread per cache. Commands
//! arrive over a channel; the worker drains everything available before
//! acting, so bursts of `report_last_applied` coalesce into one call with
//! the monotonic maximum.
//!
//! Errors from the cache are logged and swallowed — the worker must not
//! die while replication is live. A failed last-applied report stays
//! pending and is retried when the next command wakes the worker.

use std::sync::mpsc::{channel, Receiver, Sender, TryRecvError};
use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::Cache;
use crate::header::Seqno;

/// Group-communication side of the worker: reports the last applied
/// seqno to the rest of the cluster.
pub trait LastAppliedSink: Send + Sync {
    /// Reports `seqno` as applied. An `Err` is logged and the report is
    /// retried on the next worker wakeup.
    ///
    /// # Errors
    ///
    /// Implementation-defined; treated as transient.
    fn set_last_applied(&self, seqno: Seqno) -> Result<(), String>;
}

enum Command {
    ReportLastApplied(Seqno),
    ReleaseSeqno {
        seqno: Seqno,
        reset: bool,
    },
    Flush {
        uuid: Uuid,
        reply: Sender<()>,
    },
    Reset,
    Exit,
}

/// Handle to the per-cache service worker thread.
pub struct ServiceWorker {
    tx: Sender<Command>,
    thread: Option<JoinHandle<()>>,
}

impl ServiceWorker {
    /// Spawns the worker for `cache`, reporting through `sink`.
    #[must_use]
    pub fn spawn(cache: Arc<Cache>, sink: Arc<dyn LastAppliedSink>) -> ServiceWorker {
        let (tx, rx) = channel();
        let thread = std::thread::Builder::new()
            .name("seqcache-service".into())
            .spawn(move || Worker::new(cache, sink, rx).run())
            .expect("spawning the service worker thread");
        ServiceWorker {
            tx,
            thread: Some(thread),
        }
    }

    /// Schedules a last-applied report. Reports coalesce: only the
    /// monotonic maximum reaches the sink.
    pub fn report_last_applied(&self, seqno: Seqno) {
        let _ = self.tx.send(Command::ReportLastApplied(seqno));
    }

    /// Schedules `seqno_release(seqno)` on the cache. With `reset`, the
    /// worker forgets the release water mark afterwards.
    pub fn release_seqno(&self, seqno: Seqno, reset: bool) {
        let _ = self.tx.send(Command::ReleaseSeqno { seqno, reset });
    }

    /// Drains every action scheduled before this call, then updates the
    /// last-applied group identity. Blocks until the drain completes.
    pub fn flush(&self, uuid: Uuid) {
        let (reply_tx, reply_rx) = channel();
        if self
            .tx
            .send(Command::Flush {
                uuid,
                reply: reply_tx,
            })
            .is_ok()
        {
            // A dropped reply means the worker already terminated.
            let _ = reply_rx.recv();
        }
    }

    /// Drops all pending actions and the last-applied state.
    pub fn reset(&self) {
        let _ = self.tx.send(Command::Reset);
    }

    /// Stops the worker and joins the thread. Idempotent.
    pub fn shutdown(&mut self) {
        let _ = self.tx.send(Command::Exit);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for ServiceWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Worker-side state.
struct Worker {
    cache: Arc<Cache>,
    sink: Arc<dyn LastAppliedSink>,
    rx: Receiver<Command>,
    /// Highest seqno reported applied (or pending report).
    last_applied: Seqno,
    /// Group identity of the last flush.
    last_applied_uuid: Uuid,
    /// Whether `last_applied` still has to reach the sink.
    report_pending: bool,
    /// Highest release water mark not yet applied.
    release: Option<(Seqno, bool)>,
}

impl Worker {
    fn new(cache: Arc<Cache>, sink: Arc<dyn LastAppliedSink>, rx: Receiver<Command>) -> Worker {
        Worker {
            cache,
            sink,
            rx,
            last_applied: 0,
            last_applied_uuid: Uuid::nil(),
            report_pending: false,
            release: None,
        }
    }

    fn run(mut self) {
        debug!("service worker started");
        loop {
            // Block for the first command, then drain whatever else has
            // queued up so repeated reports collapse into one.
            let Ok(first) = self.rx.recv() else {
                break; // all senders gone
            };
            let mut flushes = Vec::new();
            let mut exit = self.absorb(first, &mut flushes);
            loop {
                match self.rx.try_recv() {
                    Ok(cmd) => exit |= self.absorb(cmd, &mut flushes),
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        exit = true;
                        break;
                    }
                }
            }

            if !exit {
                self.apply();
            }
            if !flushes.is_empty() {
                info!("service worker queue flushed");
                for reply in flushes {
                    let _ = reply.send(());
                }
            }
            if exit {
                break;
            }
        }
        debug!("service worker terminated");
    }

    /// Folds one command into the pending state. Returns true for `Exit`.
    fn absorb(&mut self, cmd: Command, flushes: &mut Vec<Sender<()>>) -> bool {
        match cmd {
            Command::ReportLastApplied(seqno) => {
                if self.last_applied < seqno {
                    self.last_applied = seqno;
                    self.report_pending = true;
                }
            }
            Command::ReleaseSeqno { seqno, reset } => {
                if self.release.map_or(true, |(cur, _)| cur < seqno) {
                    self.release = Some((seqno, reset));
                }
            }
            Command::Flush { uuid, reply } => {
                self.last_applied_uuid = uuid;
                flushes.push(reply);
            }
            Command::Reset => {
                self.last_applied = 0;
                self.last_applied_uuid = Uuid::nil();
                self.report_pending = false;
                self.release = None;
            }
            Command::Exit => return true,
        }
        false
    }

    /// Applies the coalesced pending actions.
    fn apply(&mut self) {
        if self.report_pending {
            match self.sink.set_last_applied(self.last_applied) {
                Ok(()) => {
                    debug!(seqno = self.last_applied, "reported last applied");
                    self.report_pending = false;
                }
                Err(e) => {
                    // Keep the report pending; the next command retries.
                    warn!(
                        seqno = self.last_applied,
                        "failed to report last applied: {e}"
                    );
                }
            }
        }

        if let Some((seqno, reset)) = self.release.take() {
            self.cache.seqno_release(seqno);
            if !reset {
                // Keep the water mark so stale release requests are
                // ignored.
                self.release = Some((seqno, false));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicI64, Ordering};
    use tempfile::TempDir;

    struct RecordingSink {
        reported: Mutex<Vec<Seqno>>,
        fail_below: AtomicI64,
    }

    impl RecordingSink {
        fn new() -> Arc<RecordingSink> {
            Arc::new(RecordingSink {
                reported: Mutex::new(Vec::new()),
                fail_below: AtomicI64::new(0),
            })
        }
    }

    impl LastAppliedSink for RecordingSink {
        fn set_last_applied(&self, seqno: Seqno) -> Result<(), String> {
            if seqno < self.fail_below.load(Ordering::Relaxed) {
                return Err("transient group error".into());
            }
            self.reported.lock().push(seqno);
            Ok(())
        }
    }

    fn open_cache(dir: &TempDir) -> Arc<Cache> {
        let config = CacheConfig::new(dir.path().join("cache.rb"), 8192);
        Cache::open(&config, Uuid::new_v4(), None).unwrap()
    }

    #[test]
    fn test_reports_coalesce_to_max() {
        let dir = TempDir::new().unwrap();
        let cache = open_cache(&dir);
        let sink = RecordingSink::new();
        let worker = ServiceWorker::spawn(cache, Arc::clone(&sink) as _);

        for s in 1..=20 {
            worker.report_last_applied(s);
        }
        worker.flush(Uuid::nil());

        let reported = sink.reported.lock();
        // At least the final maximum arrived, and nothing out of order.
        assert_eq!(*reported.last().unwrap(), 20);
        assert!(reported.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_release_applies_to_cache() {
        let dir = TempDir::new().unwrap();
        let cache = open_cache(&dir);
        let sink = RecordingSink::new();

        let mut ptrs = Vec::new();
        for s in 1..=4 {
            let p = cache.malloc(64).unwrap();
            // SAFETY: fresh allocation, ordered then released once.
            unsafe {
                cache.assign_seqno(p, s).unwrap();
                cache.free(p);
            }
            ptrs.push(p);
        }

        let worker = ServiceWorker::spawn(Arc::clone(&cache), sink as _);
        worker.release_seqno(3, false);
        worker.flush(Uuid::nil());

        assert_eq!(cache.seqno_range(), Some((4, 4)));
    }

    #[test]
    fn test_flush_waits_for_prior_actions() {
        let dir = TempDir::new().unwrap();
        let cache = open_cache(&dir);
        let sink = RecordingSink::new();
        let worker = ServiceWorker::spawn(cache, Arc::clone(&sink) as _);

        worker.report_last_applied(7);
        worker.flush(Uuid::new_v4());
        // The report scheduled before the flush has been applied.
        assert_eq!(*sink.reported.lock(), vec![7]);
    }

    #[test]
    fn test_failed_report_retries_on_next_tick() {
        let dir = TempDir::new().unwrap();
        let cache = open_cache(&dir);
        let sink = RecordingSink::new();
        sink.fail_below.store(100, Ordering::Relaxed);
        let worker = ServiceWorker::spawn(cache, Arc::clone(&sink) as _);

        worker.report_last_applied(5);
        worker.flush(Uuid::nil());
        assert!(sink.reported.lock().is_empty());

        // The sink recovers; the pending report goes out with the next
        // wakeup even though the new seqno is lower.
        sink.fail_below.store(0, Ordering::Relaxed);
        worker.report_last_applied(2);
        worker.flush(Uuid::nil());
        assert_eq!(*sink.reported.lock(), vec![5]);
    }

    #[test]
    fn test_reset_drops_pending() {
        let dir = TempDir::new().unwrap();
        let cache = open_cache(&dir);
        let sink = RecordingSink::new();
        sink.fail_below.store(100, Ordering::Relaxed);
        let worker = ServiceWorker::spawn(cache, Arc::clone(&sink) as _);

        worker.report_last_applied(5);
        worker.flush(Uuid::nil());
        sink.fail_below.store(0, Ordering::Relaxed);

        worker.reset();
        worker.flush(Uuid::nil());
        // The failed report was dropped by the reset, not retried.
        assert!(sink.reported.lock().is_empty());
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let cache = open_cache(&dir);
        let mut worker = ServiceWorker::spawn(cache, RecordingSink::new() as _);
        worker.shutdown();
        worker.shutdown();
        // Commands after shutdown are dropped silently.
        worker.report_last_applied(1);
    }
}
