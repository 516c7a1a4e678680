//! Edge-triggered tailing of (namely log) files, with a durable ledger of how
//! far each file has been read.
//!
//! Filesystem notifications queue files for reading; a single worker drains
//! whatever complete lines each queued file currently holds, hands them to a
//! [`LineSink`], and records the new offset in a [`StatusLedger`]. A restart
//! resumes every file from its recorded offset. Files ending in `.gz` are
//! decompressed on the fly.
//!
//! ## Example
//!
//! ```no_run
//! use linetrack::{Config, Tailer};
//!
//! #[tokio::main]
//! async fn main() -> linetrack::Result<()> {
//!     let config = Config::new("/var/log/app*")
//!         .with_file_pattern("*.log")
//!         .with_status_file("/var/lib/linetrack/status");
//!
//!     let (sink, mut lines) = linetrack::channel();
//!     tokio::spawn(async move {
//!         while let Some(line) = lines.next_line().await {
//!             println!("source: {}, line: {}", line.source().display(), line.line());
//!         }
//!     });
//!
//!     let tailer = Tailer::new(config)?;
//!     tailer
//!         .run(sink, async {
//!             let _ = tokio::signal::ctrl_c().await;
//!         })
//!         .await
//! }
//! ```
//!
//! ## Caveats
//!
//! Offsets recorded for gzip files are positions in the *compressed* file,
//! taken from the file handle after the last complete line was decoded.
//! Resuming seeks the compressed stream there rather than into the
//! decompressed text, so a gzip file that keeps growing cannot be resumed
//! mid-stream. Plain files resume at the exact byte after the last complete
//! line.
//!
//! The ledger stores paths as tab-separated text. A path that is not UTF-8 or
//! contains a tab or line break is still tracked while running, but its
//! offset is not persisted and it is read from the start after a restart.
//!
//! A file is only read when a notification says it changed. Lines appended
//! without a notification wait until the next one arrives.

mod config;
mod coordinator;
mod decode;
mod error;
mod events;
mod reader;
mod status;
mod tailer;

pub use config::Config;
pub use coordinator::{Coordinator, Stats, WakeReason, DEFAULT_IDLE_PAUSE};
pub use decode::Format;
pub use error::{Error, Result};
pub use events::DirWatcher;
pub use reader::{channel, Line, LineSender, LineSink, Lines, PassEnd, PassOutcome, TailSession};
pub use status::{ProcessingRecord, StatusLedger, DEFAULT_COMPACT_EVERY};
pub use tailer::Tailer;

#[cfg(doctest)]
doc_comment::doctest!("../README.md");
