//! Everything related to watching directories for file creations,
//! modifications and deletions.

use std::fmt::{self, Debug, Formatter};
use std::io;
use std::path::{Path, PathBuf};

use notify::event::{CreateKind, ModifyKind};
use notify::{EventKind, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::config::Config;
use crate::coordinator::Coordinator;
use crate::error::{Error, Result};

/// Watches a set of directories and reports matching files to a
/// [`Coordinator`].
///
/// Internally, `DirWatcher` contains a [`notify::Watcher`] whose callback only
/// forwards raw events into a channel; translating them happens in
/// [`run`](DirWatcher::run), which also extends the watch to directories
/// created later on.
pub struct DirWatcher {
    inner: notify::RecommendedWatcher,
    events: mpsc::UnboundedReceiver<notify::Result<notify::Event>>,
    coordinator: Coordinator,
    dir_pattern: String,
    file_pattern: glob::Pattern,
    /// Events on the ledger itself are never forwarded.
    status_file: PathBuf,
    watched_directories: Vec<PathBuf>,
}

impl Debug for DirWatcher {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirWatcher")
            .field("dir_pattern", &self.dir_pattern)
            .field("file_pattern", &self.file_pattern.as_str())
            .field("status_file", &self.status_file)
            .field("watched_directories", &self.watched_directories)
            .finish()
    }
}

impl DirWatcher {
    pub fn new(config: &Config, coordinator: Coordinator) -> Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let inner = notify::recommended_watcher(move |res| {
            // The receiver only goes away together with the watcher.
            let _ = tx.send(res);
        })?;

        Ok(DirWatcher {
            inner,
            events: rx,
            coordinator,
            dir_pattern: config.dir_pattern.clone(),
            file_pattern: config.file_matcher()?,
            status_file: absolutify(&config.status_file)?,
            watched_directories: Vec::new(),
        })
    }

    /// Returns the directories currently watched.
    pub fn watched_directories(&self) -> &[PathBuf] {
        &self.watched_directories
    }

    /// Expands the directory pattern and starts watching every match.
    ///
    /// Fails if a match is not a directory or cannot be watched.
    pub fn watch_dirs(&mut self) -> Result<&[PathBuf]> {
        let mut dirs = Vec::new();
        for entry in glob::glob(&self.dir_pattern)? {
            let dir = entry.map_err(|e| Error::Io(e.into_error()))?;
            if !dir.is_dir() {
                return Err(Error::NotADirectory(dir));
            }
            dirs.push(dir.canonicalize()?);
        }

        for dir in dirs {
            self.add_directory(dir)?;
        }
        info!(dirs = ?self.watched_directories, "Watching");

        Ok(&self.watched_directories)
    }

    /// Queues every existing matching file in the watched directories, so
    /// files are picked up again from their recorded offsets.
    ///
    /// Returns the number of files queued.
    pub fn seed(&self) -> Result<usize> {
        let mut seeded = 0;
        for dir in &self.watched_directories {
            let mut files = Vec::new();
            for entry in std::fs::read_dir(dir)? {
                let entry = entry?;
                let path = entry.path();
                if entry.file_type()?.is_file() && path != self.status_file && self.matches(&path) {
                    files.push(path);
                }
            }
            files.sort();
            debug!(dir = %dir.display(), files = ?files, "Existing files");

            seeded += files.len();
            for file in files {
                self.coordinator.notify_created(file);
            }
        }

        Ok(seeded)
    }

    /// Forwards filesystem events until the watcher shuts down.
    pub async fn run(mut self) {
        while let Some(res) = self.events.recv().await {
            match res {
                Ok(event) => self.handle_event(event),
                Err(e) => warn!(error = %e, "Watch error"),
            }
        }
    }

    fn add_directory(&mut self, dir: PathBuf) -> Result<()> {
        if self.watched_directories.contains(&dir) {
            return Ok(());
        }

        self.inner.watch(&dir, RecursiveMode::NonRecursive)?;
        self.watched_directories.push(dir);

        Ok(())
    }

    fn matches(&self, path: &Path) -> bool {
        path.file_name()
            .and_then(|name| name.to_str())
            .map_or(false, |name| self.file_pattern.matches(name))
    }

    fn handle_event(&mut self, event: notify::Event) {
        for path in &event.paths {
            if path == &self.status_file {
                continue;
            }

            match event.kind {
                EventKind::Create(CreateKind::Folder) => self.on_new_directory(path),
                EventKind::Create(_) if path.is_dir() => self.on_new_directory(path),
                EventKind::Create(_) => {
                    if self.matches(path) {
                        self.coordinator.notify_created(path);
                    } else {
                        trace!(path = %path.display(), "Created file does not match the file pattern");
                    }
                }
                EventKind::Modify(ModifyKind::Data(_)) | EventKind::Modify(ModifyKind::Any) => {
                    if self.matches(path) {
                        self.coordinator.notify_modified(path);
                    }
                }
                EventKind::Remove(_) => self.coordinator.notify_deleted(path),
                _ => trace!(path = %path.display(), kind = ?event.kind, "Ignoring event"),
            }
        }
    }

    fn on_new_directory(&mut self, path: &Path) {
        match self.add_directory(path.to_path_buf()) {
            Ok(()) => info!(dir = %path.display(), "Watching new directory"),
            Err(e) => warn!(dir = %path.display(), error = %e, "Failed to watch new directory"),
        }
    }
}

/// Makes `path` absolute by canonicalizing its parent, which must exist.
fn absolutify(path: &Path) -> io::Result<PathBuf> {
    let parent = match path.parent() {
        Some(parent) if parent != Path::new("") => parent.to_path_buf(),
        _ => std::env::current_dir()?,
    };
    let file_name = path
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "Filename not found in path"))?;

    let parent = parent.canonicalize().unwrap_or(parent);
    Ok(parent.join(file_name))
}
