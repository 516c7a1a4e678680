//! Turns file-change notifications into a serialized stream of read passes.
//!
//! Any number of threads may report changes; exactly one worker, driven by
//! [`Coordinator::run`], opens files and reads them. Paths waiting for a pass
//! are kept in a set, so a burst of notifications for one file collapses into
//! a single pass.

use std::collections::HashSet;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Local;
use tokio::sync::Notify;
use tracing::{debug, error, info, trace, warn};

use crate::error::Result;
use crate::reader::{LineSink, TailSession};
use crate::status::StatusLedger;

/// Pause after a pass runs out of data.
pub const DEFAULT_IDLE_PAUSE: Duration = Duration::from_secs(1);

/// Why an idle worker was woken.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WakeReason {
    Created,
    Modified,
    Stopped,
}

/// Counters accumulated over the coordinator's lifetime.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Stats {
    /// Times the idle worker was woken, spurious wakeups included.
    pub wakeups: u64,
    /// Read passes started.
    pub processed_files: u64,
    /// Created, modified and deleted notifications received.
    pub notifications: u64,
}

#[derive(Default)]
struct Counters {
    wakeups: AtomicU64,
    processed_files: AtomicU64,
    notifications: AtomicU64,
}

struct Pending {
    paths: HashSet<PathBuf>,
    /// Set while the worker waits for a wakeup. Guarded together with
    /// `paths`, so a producer can never miss an idle worker.
    idle: bool,
    reason: Option<WakeReason>,
}

struct Shared {
    pending: Mutex<Pending>,
    wakeup: Notify,
    running: Arc<AtomicBool>,
    ledger: Arc<StatusLedger>,
    idle_pause: Duration,
    counters: Counters,
}

/// Handle to the pending-work queue and its single consumer.
///
/// Cloning is cheap; every clone refers to the same queue.
#[derive(Clone)]
pub struct Coordinator {
    shared: Arc<Shared>,
}

impl fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coordinator")
            .field("pending", &self.pending_count())
            .field("running", &self.is_running())
            .field("stats", &self.stats())
            .finish()
    }
}

impl Coordinator {
    /// Creates a coordinator resuming files from `ledger`. After a pass runs
    /// out of data the worker sleeps for `idle_pause` before recording it.
    pub fn new(ledger: Arc<StatusLedger>, idle_pause: Duration) -> Self {
        Coordinator {
            shared: Arc::new(Shared {
                pending: Mutex::new(Pending {
                    paths: HashSet::new(),
                    idle: false,
                    reason: None,
                }),
                wakeup: Notify::new(),
                running: Arc::new(AtomicBool::new(true)),
                ledger,
                idle_pause,
                counters: Counters::default(),
            }),
        }
    }

    pub fn ledger(&self) -> &Arc<StatusLedger> {
        &self.shared.ledger
    }

    /// Queues `path`, which just appeared.
    pub fn notify_created(&self, path: impl Into<PathBuf>) {
        self.enqueue(path.into(), WakeReason::Created);
    }

    /// Queues `path`, which just changed.
    pub fn notify_modified(&self, path: impl Into<PathBuf>) {
        self.enqueue(path.into(), WakeReason::Modified);
    }

    /// Forgets the recorded progress for `path`.
    ///
    /// A pass already queued for it stays queued and will find nothing to open.
    pub fn notify_deleted(&self, path: &Path) {
        self.shared
            .counters
            .notifications
            .fetch_add(1, Ordering::Relaxed);
        debug!(path = %path.display(), "File deleted");
        self.shared.ledger.remove(path);
    }

    /// Number of distinct paths waiting for a pass.
    pub fn pending_count(&self) -> usize {
        self.lock_pending().paths.len()
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Asks the worker to exit once its current pass, if any, is over.
    pub fn stop(&self) {
        info!("Stopping read worker");
        self.shared.running.store(false, Ordering::Release);
        self.lock_pending().reason = Some(WakeReason::Stopped);
        self.shared.wakeup.notify_one();
    }

    pub fn stats(&self) -> Stats {
        let counters = &self.shared.counters;
        Stats {
            wakeups: counters.wakeups.load(Ordering::Relaxed),
            processed_files: counters.processed_files.load(Ordering::Relaxed),
            notifications: counters.notifications.load(Ordering::Relaxed),
        }
    }

    /// Runs the worker until [`stop`](Coordinator::stop) is called, emitting
    /// every line read into `sink`.
    ///
    /// Per-file failures are logged and never end the loop, including a panic
    /// in `sink` or while decoding. An error is only returned if the blocking
    /// read task could not be joined.
    pub async fn run(&self, sink: impl LineSink + 'static) -> Result<()> {
        let mut session = TailSession::new(sink, self.shared.running.clone());
        info!("Starting to read files");

        while self.is_running() {
            match self.next_path() {
                Some(path) => session = self.process(session, path).await?,
                None => self.wait_for_work().await,
            }
        }

        info!("Read worker stopped");
        Ok(())
    }

    fn enqueue(&self, path: PathBuf, reason: WakeReason) {
        self.shared
            .counters
            .notifications
            .fetch_add(1, Ordering::Relaxed);

        let mut pending = self.lock_pending();
        if !pending.paths.insert(path.clone()) {
            trace!(path = %path.display(), "Already pending");
        }

        if pending.idle {
            pending.idle = false;
            pending.reason = Some(reason);
            drop(pending);
            trace!(path = %path.display(), ?reason, "Waking read worker");
            self.shared.wakeup.notify_one();
        }
    }

    /// Removes an arbitrary pending path.
    fn next_path(&self) -> Option<PathBuf> {
        let mut pending = self.lock_pending();
        let path = pending.paths.iter().next().cloned()?;
        pending.paths.remove(&path);
        Some(path)
    }

    async fn wait_for_work(&self) {
        {
            let mut pending = self.lock_pending();
            if !pending.paths.is_empty() || !self.is_running() {
                return;
            }
            pending.idle = true;
        }

        trace!("No more files, waiting");
        self.shared.wakeup.notified().await;

        let reason = {
            let mut pending = self.lock_pending();
            pending.idle = false;
            pending.reason.take()
        };
        self.shared.counters.wakeups.fetch_add(1, Ordering::Relaxed);
        match reason {
            Some(reason) => trace!(?reason, "Woken up"),
            None => trace!("Spurious wakeup"),
        }
    }

    async fn process(&self, mut session: TailSession, path: PathBuf) -> Result<TailSession> {
        let shared = &self.shared;
        shared
            .counters
            .processed_files
            .fetch_add(1, Ordering::Relaxed);

        let start = Local::now().naive_local();
        let offset = shared.ledger.last_offset(&path);
        debug!(path = %path.display(), offset, "Begin to process file");

        let (session, path, result) = tokio::task::spawn_blocking(move || {
            let result = panic::catch_unwind(AssertUnwindSafe(|| session.read_pass(&path, offset)));
            (session, path, result)
        })
        .await?;

        let outcome = match result {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                warn!(path = %path.display(), error = %e, "Failed to open file");
                return Ok(session);
            }
            Err(_) => {
                error!(path = %path.display(), "Read pass panicked, progress not recorded");
                return Ok(session);
            }
        };
        debug!(
            path = %path.display(),
            offset = outcome.offset,
            emitted = outcome.emitted,
            end = ?outcome.end,
            "Finished processing file"
        );

        if outcome.reached_end() {
            tokio::time::sleep(shared.idle_pause).await;
        }

        let end = Local::now().naive_local();
        if let Err(e) = shared
            .ledger
            .record_completion(&path, start, end, outcome.offset)
        {
            error!(path = %path.display(), error = %e, "Failed to record progress");
        }

        Ok(session)
    }

    fn lock_pending(&self) -> MutexGuard<'_, Pending> {
        self.shared
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::channel;
    use std::io::Write;
    use tempfile::{tempdir, TempDir};
    use tokio::time::{sleep, timeout};

    const PAUSE: Duration = Duration::from_millis(10);
    const WAIT: Duration = Duration::from_secs(5);

    fn coordinator(dir: &TempDir) -> Coordinator {
        let ledger = StatusLedger::open(dir.path().join("status")).unwrap();
        Coordinator::new(Arc::new(ledger), PAUSE)
    }

    async fn wait_for_offset(coordinator: &Coordinator, path: &Path, offset: u64) {
        timeout(WAIT, async {
            while coordinator.ledger().last_offset(path) != offset {
                sleep(PAUSE).await;
            }
        })
        .await
        .unwrap();
    }

    #[test]
    fn test_enqueue_is_idempotent() {
        let dir = tempdir().unwrap();
        let coordinator = coordinator(&dir);

        coordinator.notify_created("/logs/a.log");
        coordinator.notify_modified("/logs/a.log");
        assert_eq!(coordinator.pending_count(), 1);

        coordinator.notify_modified("/logs/b.log");
        assert_eq!(coordinator.pending_count(), 2);
        assert_eq!(coordinator.stats().notifications, 3);

        let first = coordinator.next_path().unwrap();
        let second = coordinator.next_path().unwrap();
        assert_ne!(first, second);
        assert_eq!(coordinator.next_path(), None);
    }

    #[test]
    fn test_delete_forgets_record_but_keeps_pending() {
        let dir = tempdir().unwrap();
        let coordinator = coordinator(&dir);
        let path = Path::new("/logs/a.log");
        let now = Local::now().naive_local();
        coordinator
            .ledger()
            .record_completion(path, now, now, 12)
            .unwrap();

        coordinator.notify_modified(path);
        coordinator.notify_deleted(path);

        assert_eq!(coordinator.ledger().last_offset(path), 0);
        assert_eq!(coordinator.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_run_reads_and_records() {
        let dir = tempdir().unwrap();
        let coordinator = coordinator(&dir);
        let path = dir.path().join("a.log");
        std::fs::write(&path, b"x\ny\nz\n").unwrap();

        let (tx, mut lines) = channel();
        let worker = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.run(tx).await }
        });

        coordinator.notify_created(&path);
        for expected in ["x", "y", "z"] {
            let line = timeout(WAIT, lines.next_line()).await.unwrap().unwrap();
            assert_eq!(line.source(), path.as_path());
            assert_eq!(line.line(), expected);
        }
        wait_for_offset(&coordinator, &path, 6).await;

        coordinator.stop();
        timeout(WAIT, worker).await.unwrap().unwrap().unwrap();
        assert_eq!(coordinator.stats().processed_files, 1);
    }

    #[tokio::test]
    async fn test_idle_worker_wakes_on_change() {
        let dir = tempdir().unwrap();
        let coordinator = coordinator(&dir);
        let path = dir.path().join("later.log");
        std::fs::write(&path, b"").unwrap();

        let (tx, mut lines) = channel();
        let worker = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.run(tx).await }
        });
        sleep(Duration::from_millis(50)).await;

        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"hello\n").unwrap();
        coordinator.notify_modified(&path);

        let line = timeout(WAIT, lines.next_line()).await.unwrap().unwrap();
        assert_eq!(line.line(), "hello");
        wait_for_offset(&coordinator, &path, 6).await;
        assert!(coordinator.stats().wakeups >= 1);

        coordinator.stop();
        timeout(WAIT, worker).await.unwrap().unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_stop_wakes_idle_worker() {
        let dir = tempdir().unwrap();
        let coordinator = coordinator(&dir);

        let worker = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.run(|_: &Path, _: &[u8]| {}).await }
        });
        sleep(Duration::from_millis(50)).await;

        coordinator.stop();
        timeout(WAIT, worker).await.unwrap().unwrap().unwrap();
        assert!(!coordinator.is_running());
    }

    #[tokio::test]
    async fn test_panicking_sink_keeps_worker_alive() {
        let dir = tempdir().unwrap();
        let coordinator = coordinator(&dir);
        let bad = dir.path().join("bad.log");
        let good = dir.path().join("good.log");
        std::fs::write(&bad, b"boom\n").unwrap();
        std::fs::write(&good, b"fine\n").unwrap();

        let (mut tx, mut lines) = channel();
        let sink = move |source: &Path, line: &[u8]| {
            if source.ends_with("bad.log") {
                panic!("sink rejected line");
            }
            tx.emit(source, line);
        };
        let worker = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.run(sink).await }
        });

        coordinator.notify_created(&bad);
        timeout(WAIT, async {
            while coordinator.stats().processed_files < 1 || coordinator.pending_count() > 0 {
                sleep(PAUSE).await;
            }
        })
        .await
        .unwrap();
        coordinator.notify_created(&good);

        let line = timeout(WAIT, lines.next_line()).await.unwrap().unwrap();
        assert_eq!(line.source(), good.as_path());
        assert_eq!(line.line(), "fine");
        wait_for_offset(&coordinator, &good, 5).await;
        assert!(!coordinator.ledger().contains(&bad));

        coordinator.stop();
        timeout(WAIT, worker).await.unwrap().unwrap().unwrap();
        assert_eq!(coordinator.stats().processed_files, 2);
    }

    #[tokio::test]
    async fn test_resume_and_skip_missing() {
        let dir = tempdir().unwrap();
        let coordinator = coordinator(&dir);
        let path = dir.path().join("resume.log");
        let missing = dir.path().join("missing.log");
        std::fs::write(&path, b"x\ny\n").unwrap();
        let now = Local::now().naive_local();
        coordinator
            .ledger()
            .record_completion(&path, now, now, 2)
            .unwrap();

        coordinator.notify_created(&missing);
        coordinator.notify_created(&path);

        let (tx, mut lines) = channel();
        let worker = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.run(tx).await }
        });

        let line = timeout(WAIT, lines.next_line()).await.unwrap().unwrap();
        assert_eq!(line.bytes(), b"y\n");
        wait_for_offset(&coordinator, &path, 4).await;
        timeout(WAIT, async {
            while coordinator.pending_count() > 0 {
                sleep(PAUSE).await;
            }
        })
        .await
        .unwrap();

        coordinator.stop();
        timeout(WAIT, worker).await.unwrap().unwrap().unwrap();
        assert!(!coordinator.ledger().contains(&missing));
    }
}
