//! Wires the ledger, the coordinator and the directory watcher together.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{error, info};

use crate::config::Config;
use crate::coordinator::Coordinator;
use crate::error::Result;
use crate::events::DirWatcher;
use crate::reader::LineSink;
use crate::status::StatusLedger;

/// A complete tailing agent for the directories named by a [`Config`].
#[derive(Debug)]
pub struct Tailer {
    coordinator: Coordinator,
    watcher: DirWatcher,
}

impl Tailer {
    /// Loads the ledger and starts watching the configured directories.
    ///
    /// A corrupt ledger, an invalid pattern or a directory that cannot be
    /// watched is reported here, before anything is read. Changes are
    /// buffered from this point on and handled once [`run`](Tailer::run)
    /// starts.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let ledger = StatusLedger::open(&config.status_file)?.with_compact_every(config.compact_every);
        let coordinator = Coordinator::new(Arc::new(ledger), config.idle_pause);

        let mut watcher = DirWatcher::new(&config, coordinator.clone())?;
        watcher.watch_dirs()?;

        Ok(Tailer {
            coordinator,
            watcher,
        })
    }

    /// Returns a handle that can report changes or stop the worker.
    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    /// Returns the shared offset ledger.
    pub fn ledger(&self) -> Arc<StatusLedger> {
        self.coordinator.ledger().clone()
    }

    /// Returns the watched directories.
    pub fn watched_directories(&self) -> Vec<PathBuf> {
        self.watcher.watched_directories().to_vec()
    }

    /// Reads until `shutdown` resolves, emitting every line into `sink`.
    ///
    /// Existing files are queued first and resume from their recorded
    /// offsets. On shutdown the pass in flight is allowed to finish and the
    /// ledger is compacted and closed; failing to do so is returned as an
    /// error.
    pub async fn run<S, F>(self, sink: S, shutdown: F) -> Result<()>
    where
        S: LineSink + 'static,
        F: Future<Output = ()>,
    {
        let Tailer {
            coordinator,
            watcher,
        } = self;

        let seeded = watcher.seed()?;
        info!(files = seeded, "Queued existing files");
        let events = tokio::spawn(watcher.run());

        let worker = coordinator.run(sink);
        tokio::pin!(worker);
        tokio::pin!(shutdown);

        let finished = tokio::select! {
            result = &mut worker => Some(result),
            () = &mut shutdown => None,
        };
        let result = match finished {
            Some(result) => result,
            None => {
                coordinator.stop();
                worker.await
            }
        };

        events.abort();
        if let Err(e) = &result {
            error!(error = %e, "Read worker failed");
        }

        coordinator.ledger().close()?;
        let stats = coordinator.stats();
        info!(
            wakeups = stats.wakeups,
            processed_files = stats.processed_files,
            notifications = stats.notifications,
            "Shut down"
        );

        result
    }
}
