//! Line-reader strategies: turn an open file into newline-delimited records.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Seek};
use std::path::Path;

use flate2::read::GzDecoder;

const NEWLINE: u8 = b'\n';

/// On-disk encoding of a tailed file, chosen purely from its extension.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Format {
    Plain,
    Gzip,
}

impl Format {
    /// `.gz` files are decompressed, everything else is read as-is.
    pub fn for_path(path: impl AsRef<Path>) -> Self {
        match path.as_ref().extension() {
            Some(ext) if ext == "gz" => Format::Gzip,
            _ => Format::Plain,
        }
    }
}

enum Source {
    Plain(BufReader<File>),
    Gzip(BufReader<GzDecoder<File>>),
}

/// Result of reading up to the next newline.
#[derive(Debug, Eq, PartialEq)]
pub(crate) enum Record<'a> {
    /// A full line, newline included.
    Complete(&'a [u8]),
    /// End of stream was hit after this many bytes without a newline.
    Partial(usize),
    /// End of stream with nothing buffered.
    End,
}

/// A reusable decoder for one [`Format`].
///
/// The decoder outlives individual passes: each pass attaches a freshly
/// opened file with [`load`](LineDecoder::load) and detaches it with
/// [`release`](LineDecoder::release), while the line buffer is kept.
pub(crate) struct LineDecoder {
    format: Format,
    source: Option<Source>,
    buf: Vec<u8>,
}

impl LineDecoder {
    pub fn new(format: Format) -> Self {
        LineDecoder {
            format,
            source: None,
            buf: Vec::new(),
        }
    }

    pub fn format(&self) -> Format {
        self.format
    }

    /// Attaches `file`, which must already be positioned at the resume offset.
    ///
    /// flate2 has no in-place reset for gzip readers, so the gzip decoder is
    /// rebuilt here; the header is parsed lazily on the first read.
    pub fn load(&mut self, file: File) {
        self.buf.clear();
        self.source = Some(match self.format {
            Format::Plain => Source::Plain(BufReader::new(file)),
            Format::Gzip => Source::Gzip(BufReader::new(GzDecoder::new(file))),
        });
    }

    /// Drops the attached file handle, keeping the buffer allocation.
    pub fn release(&mut self) {
        self.source = None;
        self.buf.clear();
    }

    pub fn read_record(&mut self) -> io::Result<Record<'_>> {
        self.buf.clear();
        let read = match self.source.as_mut() {
            Some(Source::Plain(reader)) => reader.read_until(NEWLINE, &mut self.buf)?,
            Some(Source::Gzip(reader)) => reader.read_until(NEWLINE, &mut self.buf)?,
            None => return Ok(Record::End),
        };

        Ok(match self.buf.last() {
            None => Record::End,
            Some(&NEWLINE) => Record::Complete(&self.buf),
            Some(_) => Record::Partial(read),
        })
    }

    /// Offset to report once a complete record of `len` bytes was read,
    /// given the offset reported after the previous record.
    ///
    /// Plain files advance exactly by the record length. Gzip files report the
    /// compressed file handle's cursor, which runs ahead of the record by
    /// whatever the decoder has buffered. Resuming a gzip file therefore seeks
    /// in the compressed stream, not the decompressed one.
    pub fn offset_after(&self, previous: u64, len: usize) -> io::Result<u64> {
        match self.source.as_ref() {
            Some(Source::Gzip(reader)) => {
                let mut file: &File = reader.get_ref().get_ref();
                file.stream_position()
            }
            _ => Ok(previous + len as u64),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn test_format_for_path() {
        assert_eq!(Format::for_path("/var/log/app.log"), Format::Plain);
        assert_eq!(Format::for_path("/var/log/app.log.gz"), Format::Gzip);
        assert_eq!(Format::for_path("/var/log/app.gz.log"), Format::Plain);
        assert_eq!(Format::for_path("/var/log/noext"), Format::Plain);
        assert_eq!(Format::for_path("/var/log/APP.GZ"), Format::Plain);
    }

    #[test]
    fn test_plain_records() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.log");
        std::fs::write(&path, b"one\ntwo\nthr").unwrap();

        let mut decoder = LineDecoder::new(Format::Plain);
        decoder.load(File::open(&path).unwrap());

        assert_eq!(decoder.read_record().unwrap(), Record::Complete(b"one\n"));
        assert_eq!(decoder.offset_after(0, 4).unwrap(), 4);
        assert_eq!(decoder.read_record().unwrap(), Record::Complete(b"two\n"));
        assert_eq!(decoder.read_record().unwrap(), Record::Partial(3));
        assert_eq!(decoder.read_record().unwrap(), Record::End);

        decoder.release();
        assert_eq!(decoder.read_record().unwrap(), Record::End);
    }

    #[test]
    fn test_gzip_records() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.log.gz");
        let mut encoder = GzEncoder::new(File::create(&path).unwrap(), Compression::default());
        encoder.write_all(b"alpha\nbeta\n").unwrap();
        encoder.finish().unwrap();

        let mut decoder = LineDecoder::new(Format::for_path(&path));
        decoder.load(File::open(&path).unwrap());

        assert_eq!(decoder.read_record().unwrap(), Record::Complete(b"alpha\n"));
        let compressed_len = std::fs::metadata(&path).unwrap().len();
        let offset = decoder.offset_after(0, 6).unwrap();
        assert!(offset > 0 && offset <= compressed_len);
        assert_eq!(decoder.read_record().unwrap(), Record::Complete(b"beta\n"));
        assert_eq!(decoder.read_record().unwrap(), Record::End);
    }
}
