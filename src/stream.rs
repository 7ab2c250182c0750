//! Line-oriented streaming I/O
//!
//! Inputs are read as raw bytes one line at a time and only decoded by whoever consumes
//! the line, so an undecodable line becomes a [`RecordError::Decode`] for that line instead
//! of an I/O failure for the whole file.
//!
//! Outputs go through [`StagedFile`]: bytes land in a hidden temp file next to the target and
//! are renamed into place by [`StagedFile::commit`]. A job that fails or is killed before
//! committing leaves nothing that looks like a finished output.

use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use crate::error::{IoContext, ReconError, RecordError, Result};

/// One input line with its terminator (`\n` or `\r\n`) removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line {
    /// 1-based position in its source stream.
    pub number: u64,
    pub bytes: Vec<u8>,
}

impl Line {
    pub fn new(number: u64, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            number,
            bytes: bytes.into(),
        }
    }

    /// Borrow the line as UTF-8.
    pub fn text(&self) -> std::result::Result<&str, RecordError> {
        std::str::from_utf8(&self.bytes).map_err(|e| RecordError::Decode {
            valid_up_to: e.valid_up_to(),
        })
    }
}

/// Streaming line reader over any `BufRead`.
pub struct LineReader<R> {
    inner: R,
    number: u64,
}

impl LineReader<BufReader<File>> {
    pub fn open(path: &Path, capacity: usize) -> Result<Self> {
        let file = File::open(path).at("open", path)?;
        Ok(Self::new(BufReader::with_capacity(capacity, file)))
    }
}

impl<R: BufRead> LineReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner, number: 0 }
    }

    pub fn next_line(&mut self) -> io::Result<Option<Line>> {
        let mut bytes = Vec::new();
        if self.inner.read_until(b'\n', &mut bytes)? == 0 {
            return Ok(None);
        }
        if bytes.last() == Some(&b'\n') {
            bytes.pop();
            if bytes.last() == Some(&b'\r') {
                bytes.pop();
            }
        }
        self.number += 1;
        Ok(Some(Line {
            number: self.number,
            bytes,
        }))
    }
}

impl<R: BufRead> Iterator for LineReader<R> {
    type Item = io::Result<Line>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_line().transpose()
    }
}

/// Newline-terminated record writer.
pub struct LineSink<W: Write> {
    out: W,
    lines: u64,
}

impl<W: Write> LineSink<W> {
    pub fn new(out: W) -> Self {
        Self { out, lines: 0 }
    }

    pub fn write_line(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.write_parts(&[bytes])
    }

    /// Write `fields` joined by ':'.
    pub fn write_fields(&mut self, fields: &[&str]) -> io::Result<()> {
        for (i, field) in fields.iter().enumerate() {
            if i > 0 {
                self.out.write_all(b":")?;
            }
            self.out.write_all(field.as_bytes())?;
        }
        self.out.write_all(b"\n")?;
        self.lines += 1;
        Ok(())
    }

    fn write_parts(&mut self, parts: &[&[u8]]) -> io::Result<()> {
        for part in parts {
            self.out.write_all(part)?;
        }
        self.out.write_all(b"\n")?;
        self.lines += 1;
        Ok(())
    }

    pub fn lines(&self) -> u64 {
        self.lines
    }

    pub fn get_ref(&self) -> &W {
        &self.out
    }

    /// Flush and hand back the underlying writer.
    pub fn into_inner(mut self) -> io::Result<W> {
        self.out.flush()?;
        Ok(self.out)
    }
}

/// Destination for lines that could not be used.
///
/// Each entry is `<origin>:<line>\t<reason>\t<raw bytes>`; the raw bytes come last and are
/// written untouched, so undecodable input survives intact.
pub struct ErrorSink<W: Write> {
    sink: LineSink<W>,
    path: PathBuf,
    decode_errors: u64,
}

impl<W: Write> ErrorSink<W> {
    pub fn new(out: W) -> Self {
        Self {
            sink: LineSink::new(out),
            path: PathBuf::from("<errors>"),
            decode_errors: 0,
        }
    }

    /// Name the destination, for error messages.
    pub fn with_path(mut self, path: &Path) -> Self {
        self.path = path.to_path_buf();
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn divert(&mut self, origin: &str, line: &Line, reason: &RecordError) -> io::Result<()> {
        tracing::trace!(origin, line = line.number, %reason, "diverted");
        if reason.is_decode() {
            self.decode_errors += 1;
        }
        let header = format!("{}:{}\t{}\t", origin, line.number, reason);
        self.sink.write_parts(&[header.as_bytes(), &line.bytes])
    }

    pub fn diverted(&self) -> u64 {
        self.sink.lines()
    }

    pub fn decode_errors(&self) -> u64 {
        self.decode_errors
    }

    pub fn into_inner(self) -> io::Result<W> {
        self.sink.into_inner()
    }
}

/// Output file written under a temporary name and renamed into place on commit.
///
/// Dropping a `StagedFile` without committing deletes the temp file.
pub struct StagedFile {
    target: PathBuf,
    writer: BufWriter<NamedTempFile>,
}

impl StagedFile {
    pub fn create(target: &Path, capacity: usize) -> Result<Self> {
        let temp = tempfile::Builder::new()
            .prefix(".kvrecon-")
            .suffix(".partial")
            .tempfile_in(parent_dir(target))
            .at("stage", target)?;
        Ok(Self {
            target: target.to_path_buf(),
            writer: BufWriter::with_capacity(capacity, temp),
        })
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    pub fn commit(self) -> Result<()> {
        commit_all(vec![self])
    }

    fn flush_to_temp(self) -> Result<(PathBuf, NamedTempFile)> {
        let StagedFile { target, writer } = self;
        let temp = writer
            .into_inner()
            .map_err(|e| e.into_error())
            .at("flush", &target)?;
        Ok((target, temp))
    }
}

/// Commit a job's outputs as a group.
///
/// Every file is flushed before any is renamed. If a rename fails, targets already renamed by
/// this call are removed and the remaining temp files are discarded.
pub fn commit_all(files: Vec<StagedFile>) -> Result<()> {
    let flushed = files
        .into_iter()
        .map(StagedFile::flush_to_temp)
        .collect::<Result<Vec<_>>>()?;

    let mut committed: Vec<PathBuf> = Vec::with_capacity(flushed.len());
    for (target, temp) in flushed {
        if let Err(err) = temp.persist(&target) {
            for path in &committed {
                if let Err(e) = fs::remove_file(path) {
                    tracing::warn!(path = %path.display(), error = %e, "failed to roll back");
                }
            }
            return Err(ReconError::io("commit", target, err.error));
        }
        tracing::debug!(path = %target.display(), "committed");
        committed.push(target);
    }
    Ok(())
}

impl Write for StagedFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.writer.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

/// Directory a path lives in, `.` for bare file names.
pub fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}
