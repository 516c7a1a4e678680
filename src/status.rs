//! The durable record of how far each file has been read.
//!
//! The ledger is a text file with one tab-separated record per line:
//!
//! ```text
//! 2015/08/28-20:42:12.1231	2015/08/28-20:43:23.3123	/home/s/data/log/xxx.log	100
//! ```
//!
//! Fields are the start and end of the pass that produced the record, the
//! absolute path of the file, and the byte offset reached. Records are
//! appended as passes complete and the whole file is periodically rewritten
//! from memory ("compaction"), sorted by path. When replayed top to bottom
//! the last record for a path wins.

use std::collections::HashMap;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::NaiveDateTime;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Number of completed passes between two compactions.
pub const DEFAULT_COMPACT_EVERY: usize = 10_000;

/// Seconds part of a written timestamp; four fractional digits follow.
const WRITE_FORMAT: &str = "%Y/%m/%d-%H:%M:%S";
const PARSE_FORMAT: &str = "%Y/%m/%d-%H:%M:%S%.f";

/// Progress of the most recent pass over one file.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProcessingRecord {
    pub path: PathBuf,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    /// Byte offset just past the last complete line read.
    pub offset: u64,
}

impl ProcessingRecord {
    fn parse(line: &str) -> Result<Self> {
        let mut fields = line.splitn(4, '\t');
        let (start, end, path, offset) =
            match (fields.next(), fields.next(), fields.next(), fields.next()) {
                (Some(start), Some(end), Some(path), Some(offset)) => (start, end, path, offset),
                _ => return Err(Error::ledger(line, "expected 4 tab-separated fields")),
            };

        let start = NaiveDateTime::parse_from_str(start, PARSE_FORMAT)
            .map_err(|e| Error::ledger(line, format!("bad start time: {}", e)))?;
        let end = NaiveDateTime::parse_from_str(end, PARSE_FORMAT)
            .map_err(|e| Error::ledger(line, format!("bad end time: {}", e)))?;
        if path.is_empty() {
            return Err(Error::ledger(line, "path empty"));
        }
        let offset = offset
            .trim()
            .parse::<u64>()
            .map_err(|e| Error::ledger(line, format!("bad offset: {}", e)))?;

        Ok(ProcessingRecord {
            path: PathBuf::from(path),
            start,
            end,
            offset,
        })
    }
}

impl fmt::Display for ProcessingRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_time(f, &self.start)?;
        f.write_str("\t")?;
        write_time(f, &self.end)?;
        writeln!(f, "\t{}\t{}", self.path.display(), self.offset)
    }
}

fn write_time(f: &mut fmt::Formatter<'_>, time: &NaiveDateTime) -> fmt::Result {
    // Leap seconds report up to 1_999_999_999 nanoseconds.
    let ten_thousandths = (time.and_utc().timestamp_subsec_nanos() / 100_000).min(9_999);
    write!(f, "{}.{:04}", time.format(WRITE_FORMAT), ten_thousandths)
}

/// Whether `path` survives being written as a ledger field and read back.
fn is_storable(path: &Path) -> bool {
    path.to_str()
        .map_or(false, |p| !p.contains(|c| matches!(c, '\t' | '\n' | '\r')))
}

struct Journal {
    /// `None` once the ledger has been closed.
    file: Option<File>,
    /// Completions recorded since the last compaction.
    completions: usize,
}

/// In-memory map of [`ProcessingRecord`]s mirrored to an append-only file.
///
/// The map and the file handle are guarded separately; the journal lock is
/// always taken before the records lock, never the other way round.
pub struct StatusLedger {
    path: PathBuf,
    records: Mutex<HashMap<PathBuf, ProcessingRecord>>,
    journal: Mutex<Journal>,
    compact_every: usize,
}

impl fmt::Debug for StatusLedger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatusLedger")
            .field("path", &self.path)
            .field("records", &self.lock_records().len())
            .field("compact_every", &self.compact_every)
            .finish()
    }
}

impl StatusLedger {
    /// Opens the ledger at `path`, replaying it if it exists and creating an
    /// empty one otherwise.
    ///
    /// Any malformed line aborts the load. An unterminated last line is left
    /// over from an interrupted append; it is cut off so later appends start
    /// on a fresh line.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)?;

        let Replayed { records, valid_len, torn } = replay(&file)?;
        if torn {
            file.set_len(valid_len)?;
            file.sync_all()?;
        }
        info!(path = %path.display(), records = records.len(), "Loaded status ledger");

        Ok(StatusLedger {
            path,
            records: Mutex::new(records),
            journal: Mutex::new(Journal {
                file: Some(file),
                completions: 0,
            }),
            compact_every: DEFAULT_COMPACT_EVERY,
        })
    }

    /// Sets how many completions trigger a compaction.
    pub fn with_compact_every(mut self, compact_every: usize) -> Self {
        self.compact_every = compact_every.max(1);
        self
    }

    /// Returns the path of the durable file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the recorded offset for `file`, or 0 if it was never read.
    pub fn last_offset(&self, file: &Path) -> u64 {
        self.lock_records().get(file).map_or(0, |r| r.offset)
    }

    /// Whether `file` has a record.
    pub fn contains(&self, file: &Path) -> bool {
        self.lock_records().contains_key(file)
    }

    /// Returns every record, sorted by path.
    pub fn records(&self) -> Vec<ProcessingRecord> {
        sorted(&self.lock_records())
    }

    /// Records the outcome of a finished pass over `file`.
    ///
    /// The in-memory record is always updated. The durable append is skipped
    /// if the previous record for `file` ended within the same second. A
    /// failed append leaves the durable copy stale until the next compaction.
    ///
    /// Paths that are not UTF-8 or contain a tab or line break cannot be
    /// stored in the ledger file; they are only tracked in memory.
    pub fn record_completion(
        &self,
        file: &Path,
        start: NaiveDateTime,
        end: NaiveDateTime,
        offset: u64,
    ) -> Result<()> {
        let mut journal = self.lock_journal();

        let record = ProcessingRecord {
            path: file.to_path_buf(),
            start,
            end,
            offset,
        };
        let previous = self.lock_records().insert(file.to_path_buf(), record.clone());

        let coalesced = previous.map_or(false, |p| {
            p.end.and_utc().timestamp() == record.end.and_utc().timestamp()
        });
        let appended = if !is_storable(file) {
            warn!(path = %file.display(), offset, "Path cannot be stored in the status ledger");
            Ok(())
        } else if coalesced {
            debug!(path = %file.display(), offset, "Coalesced status record");
            Ok(())
        } else {
            append(&mut journal, &record)
        };

        journal.completions += 1;
        if journal.completions >= self.compact_every {
            journal.completions = 0;
            self.compact_locked(&mut journal)?;
        }

        appended
    }

    /// Forgets `file`. Its durable line lingers until the next compaction.
    pub fn remove(&self, file: &Path) {
        if self.lock_records().remove(file).is_some() {
            debug!(path = %file.display(), "Removed status record");
        }
    }

    /// Rewrites the durable file from memory, sorted by path.
    ///
    /// Not transactional: a crash between the truncate and the final sync
    /// can lose records.
    pub fn compact(&self) -> Result<()> {
        let mut journal = self.lock_journal();
        self.compact_locked(&mut journal)
    }

    /// Compacts one last time and releases the file.
    pub fn close(&self) -> Result<()> {
        let mut journal = self.lock_journal();
        self.compact_locked(&mut journal)?;
        journal.file = None;
        info!(path = %self.path.display(), "Closed status ledger");
        Ok(())
    }

    fn compact_locked(&self, journal: &mut Journal) -> Result<()> {
        let file = journal.file.as_mut().ok_or_else(closed)?;

        let records = sorted(&self.lock_records());
        let mut contents = String::new();
        for record in records.iter().filter(|r| is_storable(&r.path)) {
            contents.push_str(&record.to_string());
        }

        file.set_len(0)?;
        file.write_all(contents.as_bytes())?;
        file.sync_all()?;

        info!(path = %self.path.display(), records = records.len(), "Compacted status ledger");
        Ok(())
    }

    fn lock_records(&self) -> MutexGuard<'_, HashMap<PathBuf, ProcessingRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_journal(&self) -> MutexGuard<'_, Journal> {
        self.journal.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn append(journal: &mut Journal, record: &ProcessingRecord) -> Result<()> {
    let file = journal.file.as_mut().ok_or_else(closed)?;
    file.write_all(record.to_string().as_bytes())?;
    file.sync_data()?;
    Ok(())
}

fn closed() -> Error {
    Error::Io(std::io::Error::new(
        std::io::ErrorKind::Other,
        "status ledger is closed",
    ))
}

fn sorted(records: &HashMap<PathBuf, ProcessingRecord>) -> Vec<ProcessingRecord> {
    let mut records = records.values().cloned().collect::<Vec<_>>();
    records.sort_by(|a, b| a.path.as_os_str().cmp(b.path.as_os_str()));
    records
}

struct Replayed {
    records: HashMap<PathBuf, ProcessingRecord>,
    /// Length of the prefix made of complete lines.
    valid_len: u64,
    torn: bool,
}

fn replay(file: &File) -> Result<Replayed> {
    let mut records = HashMap::new();
    let mut reader = BufReader::new(file);
    let mut buf = Vec::new();
    let mut valid_len = 0;
    let mut torn = false;

    loop {
        buf.clear();
        let read = reader.read_until(b'\n', &mut buf)?;
        if read == 0 {
            break;
        }

        if !buf.ends_with(b"\n") {
            // Torn append from a crash.
            warn!(line = %String::from_utf8_lossy(&buf), "Discarding unterminated status line");
            torn = true;
            break;
        }
        valid_len += read as u64;

        let line = String::from_utf8(std::mem::take(&mut buf))
            .map_err(|e| Error::ledger(String::from_utf8_lossy(e.as_bytes()), "not UTF-8"))?;
        let line = line.trim_end_matches('\n');
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.trim().is_empty() {
            continue;
        }

        let record = ProcessingRecord::parse(line)?;
        records.insert(record.path.clone(), record);
    }

    Ok(Replayed {
        records,
        valid_len,
        torn,
    })
}
