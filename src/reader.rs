//! Everything related to reading lines from one file during a single pass.

use std::borrow::Cow;
use std::fs::File;
use std::io::{Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task;

use futures_util::stream::Stream as FuturesStream;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::decode::{Format, LineDecoder, Record};
use crate::error::Result;

/// Receives every complete line discovered by a read pass.
///
/// Lines arrive in file order for a given pass, newline included. Formatting,
/// batching and delivery are the sink's business.
pub trait LineSink: Send {
    fn emit(&mut self, source: &Path, line: &[u8]);
}

impl<F> LineSink for F
where
    F: FnMut(&Path, &[u8]) + Send,
{
    fn emit(&mut self, source: &Path, line: &[u8]) {
        self(source, line)
    }
}

/// A single line captured for a given source path.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Line {
    /// The path from where the line was read.
    source: PathBuf,
    /// The raw line, trailing newline included.
    bytes: Vec<u8>,
}

impl Line {
    /// Returns a reference to the file from where the line was read.
    pub fn source(&self) -> &Path {
        self.source.as_path()
    }

    /// Returns the raw bytes of the line, trailing newline included.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Returns the line as text without its trailing line terminator.
    pub fn line(&self) -> Cow<'_, str> {
        let trimmed = self.bytes.strip_suffix(b"\n").unwrap_or(&self.bytes[..]);
        let trimmed = trimmed.strip_suffix(b"\r").unwrap_or(trimmed);
        String::from_utf8_lossy(trimmed)
    }

    /// Returns the internal components that make up a `Line`.
    pub fn into_inner(self) -> (PathBuf, Vec<u8>) {
        let Line { source, bytes } = self;

        (source, bytes)
    }
}

/// Creates a [`LineSink`] that forwards every line to a [`Lines`] stream.
pub fn channel() -> (LineSender, Lines) {
    let (tx, rx) = mpsc::unbounded_channel();
    (LineSender { tx }, Lines { rx })
}

/// Sending half of [`channel`].
#[derive(Clone, Debug)]
pub struct LineSender {
    tx: mpsc::UnboundedSender<Line>,
}

impl LineSink for LineSender {
    fn emit(&mut self, source: &Path, line: &[u8]) {
        // Nobody listening any more; the pass still completes so offsets
        // keep being recorded.
        let _ = self.tx.send(Line {
            source: source.to_path_buf(),
            bytes: line.to_vec(),
        });
    }
}

/// Receiving half of [`channel`], polled as a stream of [`Line`]s.
#[derive(Debug)]
pub struct Lines {
    rx: mpsc::UnboundedReceiver<Line>,
}

impl Lines {
    /// Waits for the next line. Returns `None` once every sender is gone.
    pub async fn next_line(&mut self) -> Option<Line> {
        self.rx.recv().await
    }
}

impl FuturesStream for Lines {
    type Item = Line;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
    ) -> task::Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// How a read pass came to an end.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PassEnd {
    /// Every byte available was consumed as complete lines.
    Drained,
    /// The stream ended inside a line; the fragment was left for later.
    PartialLine,
    /// The running flag was cleared mid-pass.
    Stopped,
    /// A read error cut the pass short.
    Failed,
}

/// What one read pass achieved.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PassOutcome {
    /// Offset just past the last complete line.
    pub offset: u64,
    /// Number of lines handed to the sink.
    pub emitted: usize,
    pub end: PassEnd,
}

impl PassOutcome {
    /// Whether the pass ran out of data, in which case the caller should give
    /// the writer a moment before doing anything else.
    pub fn reached_end(&self) -> bool {
        matches!(self.end, PassEnd::Drained | PassEnd::PartialLine)
    }
}

/// Reads one file at a time, handing complete lines to its sink.
///
/// A session is owned by a single worker and is reused for every pass; the
/// file itself is only held open for the duration of
/// [`read_pass`](TailSession::read_pass).
pub struct TailSession {
    sink: Box<dyn LineSink>,
    running: Arc<AtomicBool>,
    plain: LineDecoder,
    gzip: LineDecoder,
}

impl TailSession {
    /// Creates a session emitting into `sink`. Passes stop early once
    /// `running` is cleared.
    pub fn new(sink: impl LineSink + 'static, running: Arc<AtomicBool>) -> Self {
        TailSession {
            sink: Box::new(sink),
            running,
            plain: LineDecoder::new(Format::Plain),
            gzip: LineDecoder::new(Format::Gzip),
        }
    }

    /// Reads every complete line currently available in `path` starting at
    /// byte `start`.
    ///
    /// Returns an error only if the file could not be opened or positioned;
    /// read errors after that end the pass with [`PassEnd::Failed`] and keep
    /// the progress made so far.
    pub fn read_pass(&mut self, path: &Path, start: u64) -> Result<PassOutcome> {
        let mut file = File::open(path)?;
        if start > 0 {
            file.seek(SeekFrom::Start(start))?;
        }

        let decoder = match Format::for_path(path) {
            Format::Plain => &mut self.plain,
            Format::Gzip => &mut self.gzip,
        };
        decoder.load(file);
        trace!(path = %path.display(), format = ?decoder.format(), start, "Loaded file");

        let mut outcome = PassOutcome {
            offset: start,
            emitted: 0,
            end: PassEnd::Stopped,
        };

        while self.running.load(Ordering::Acquire) {
            let len = match decoder.read_record() {
                Ok(Record::Complete(line)) => {
                    self.sink.emit(path, line);
                    line.len()
                }
                Ok(Record::Partial(len)) => {
                    debug!(path = %path.display(), len, "Holding back partial line");
                    outcome.end = PassEnd::PartialLine;
                    break;
                }
                Ok(Record::End) => {
                    outcome.end = PassEnd::Drained;
                    break;
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Read failed");
                    outcome.end = PassEnd::Failed;
                    break;
                }
            };

            outcome.emitted += 1;
            match decoder.offset_after(outcome.offset, len) {
                Ok(offset) => outcome.offset = offset,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to locate read position");
                    outcome.end = PassEnd::Failed;
                    break;
                }
            }
        }

        decoder.release();
        Ok(outcome)
    }
}
