//! Settings for a [`Tailer`](crate::Tailer).

use std::path::PathBuf;
use std::time::Duration;

use crate::coordinator::DEFAULT_IDLE_PAUSE;
use crate::error::Result;
use crate::status::DEFAULT_COMPACT_EVERY;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Config {
    /// Durable ledger of per-file offsets.
    pub status_file: PathBuf,
    /// Glob selecting the directories to watch. Every match must be a
    /// directory.
    pub dir_pattern: String,
    /// Glob matched against file names inside the watched directories.
    pub file_pattern: String,
    /// How long the worker waits after a pass runs out of data.
    pub idle_pause: Duration,
    /// Completed passes between two ledger compactions.
    pub compact_every: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            status_file: PathBuf::from("linetrack.status"),
            dir_pattern: ".".to_string(),
            file_pattern: "*".to_string(),
            idle_pause: DEFAULT_IDLE_PAUSE,
            compact_every: DEFAULT_COMPACT_EVERY,
        }
    }
}

impl Config {
    /// Watches the directories matching `dir_pattern`, everything else default.
    pub fn new(dir_pattern: impl Into<String>) -> Self {
        Config {
            dir_pattern: dir_pattern.into(),
            ..Config::default()
        }
    }

    pub fn with_status_file(mut self, status_file: impl Into<PathBuf>) -> Self {
        self.status_file = status_file.into();
        self
    }

    pub fn with_file_pattern(mut self, file_pattern: impl Into<String>) -> Self {
        self.file_pattern = file_pattern.into();
        self
    }

    pub fn with_idle_pause(mut self, idle_pause: Duration) -> Self {
        self.idle_pause = idle_pause;
        self
    }

    pub fn with_compact_every(mut self, compact_every: usize) -> Self {
        self.compact_every = compact_every;
        self
    }

    /// Checks that both patterns are valid globs.
    pub fn validate(&self) -> Result<()> {
        glob::Pattern::new(&self.dir_pattern)?;
        self.file_matcher()?;
        Ok(())
    }

    pub(crate) fn file_matcher(&self) -> Result<glob::Pattern> {
        Ok(glob::Pattern::new(&self.file_pattern)?)
    }
}
