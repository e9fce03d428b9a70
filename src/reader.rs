//! The reader: locates the right physical segment for a committed position,
//! delivers lines in order across rotations, and reports lag.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use tracing::{debug, warn};

use crate::cursor::{Cursor, FileCursor, LockMode};
use crate::error::{Error, Result};
use crate::position::{self, Position};
use crate::segment;

/// Where a reader starts when the cursor holds no usable record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Start {
    /// Beginning of the active file.
    #[default]
    Begin,
    /// The last line boundary of the active file; only lines appended after
    /// opening are delivered.
    End,
    /// Beginning of the oldest rotated segment.
    First,
}

impl FromStr for Start {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "begin" => Ok(Start::Begin),
            "end" => Ok(Start::End),
            "first" => Ok(Start::First),
            other => Err(Error::Config(format!("unknown start mode {other:?}"))),
        }
    }
}

/// Whether the reader follows appends made after it was opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum End {
    /// Stop at the size the active file had when the reader was opened.
    #[default]
    Fixed,
    /// Keep delivering whatever the writer appends.
    Future,
}

impl FromStr for End {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "fixed" => Ok(End::Fixed),
            "future" => Ok(End::Future),
            other => Err(Error::Config(format!("unknown end mode {other:?}"))),
        }
    }
}

/// A caller-owned transform applied to each delivered line. Errors are
/// propagated to the caller of [`Reader::read`] verbatim.
pub type Filter =
    Box<dyn FnMut(String) -> std::result::Result<String, Box<dyn std::error::Error + Send + Sync>>>;

// The non-seekable variant is a boxed stream rather than `io::Stdin`
// directly so the carry and resume logic can be driven by in-memory
// streams in tests; production code only ever hands it standard input.
enum Source {
    File(BufReader<File>),
    Stream(BufReader<Box<dyn Read>>),
}

/// Configuration for a [`Reader`], collected before any file is touched.
///
/// Invalid combinations are rejected by [`open`](ReaderBuilder::open) with
/// [`Error::Config`] before the reader exists; there is no half-open state.
pub struct ReaderBuilder {
    log: Option<PathBuf>,
    position_file: Option<PathBuf>,
    cursor: Option<Cursor>,
    start: Start,
    end: End,
    lock: LockMode,
    check_inode: bool,
    check_lastline: bool,
    check_log: bool,
    autofix_cursor: bool,
    rollback_period: u64,
    filter: Option<Filter>,
}

impl ReaderBuilder {
    fn with_log(log: Option<PathBuf>) -> Self {
        ReaderBuilder {
            log,
            position_file: None,
            cursor: None,
            start: Start::default(),
            end: End::default(),
            lock: LockMode::default(),
            check_inode: false,
            check_lastline: true,
            check_log: false,
            autofix_cursor: false,
            rollback_period: 0,
            filter: None,
        }
    }

    /// Build a reader for whatever log the position file at `path` tracks.
    /// The file must exist; the log path is adopted from its newest record.
    pub fn from_position_file(path: impl AsRef<Path>) -> Self {
        let mut builder = Self::with_log(None);
        builder.position_file = Some(path.as_ref().to_path_buf());
        builder
    }

    /// Build a reader for whatever log the cursor's newest record tracks.
    pub fn from_cursor(cursor: Cursor) -> Self {
        let mut builder = Self::with_log(None);
        builder.cursor = Some(cursor);
        builder
    }

    /// Persist positions in the file at `path`. `"-"` discards them (null
    /// cursor). Mutually exclusive with [`cursor`](Self::cursor).
    pub fn position_file(mut self, path: impl AsRef<Path>) -> Self {
        self.position_file = Some(path.as_ref().to_path_buf());
        self
    }

    /// Use a prebuilt cursor instead of a position file.
    pub fn cursor(mut self, cursor: Cursor) -> Self {
        self.cursor = Some(cursor);
        self
    }

    /// Initial placement when the cursor holds no record. Default: `Begin`.
    pub fn start(mut self, start: Start) -> Self {
        self.start = start;
        self
    }

    /// Whether to follow appends past open-time EOF. Default: `Fixed`.
    pub fn end(mut self, end: End) -> Self {
        self.end = end;
        self
    }

    /// Cursor-file locking. Default: `None`.
    pub fn lock(mut self, lock: LockMode) -> Self {
        self.lock = lock;
        self
    }

    /// Include the segment inode in the position identity. Default: off,
    /// since inodes lie after rsync or a container migration.
    pub fn check_inode(mut self, on: bool) -> Self {
        self.check_inode = on;
        self
    }

    /// Include the trailing bytes of the last consumed line in the position
    /// identity. Default: on. At least one identity check must stay enabled.
    pub fn check_lastline(mut self, on: bool) -> Self {
        self.check_lastline = on;
        self
    }

    /// Refuse to resume when the cursor tracks a different log path than the
    /// one supplied. Default: off.
    pub fn check_log(mut self, on: bool) -> Self {
        self.check_log = on;
        self
    }

    /// When the committed position cannot be matched to any segment (or the
    /// cursor file is empty or malformed), discard the cursor and start
    /// fresh instead of failing. Default: off.
    pub fn autofix_cursor(mut self, on: bool) -> Self {
        self.autofix_cursor = on;
        self
    }

    /// Retain older committed positions for `seconds`, enabling
    /// [`Reader::rollback`]. 0 keeps only the newest. Default: 0.
    pub fn rollback_period(mut self, seconds: u64) -> Self {
        self.rollback_period = seconds;
        self
    }

    /// Transform applied to each line before it is returned.
    pub fn filter<F>(mut self, filter: F) -> Self
    where
        F: FnMut(String) -> std::result::Result<String, Box<dyn std::error::Error + Send + Sync>>
            + 'static,
    {
        self.filter = Some(Box::new(filter));
        self
    }

    /// Validate the configuration, open the cursor, and position the reader.
    pub fn open(self) -> Result<Reader> {
        if !self.check_inode && !self.check_lastline {
            return Err(Error::Config(
                "at least one of inode and last-line checking must be enabled".into(),
            ));
        }

        let cursor = match (self.position_file, self.cursor) {
            (Some(_), Some(_)) => {
                return Err(Error::Config(
                    "both a position file and a cursor were supplied".into(),
                ))
            }
            (None, None) => {
                return Err(Error::Config(
                    "either a position file or a cursor is required".into(),
                ))
            }
            (None, Some(cursor)) => cursor,
            (Some(path), None) => {
                if path == Path::new("-") {
                    if self.log.is_none() {
                        return Err(Error::Config(
                            "a discarded position file requires a log path".into(),
                        ));
                    }
                    Cursor::Null
                } else {
                    if self.log.is_none() && !path.exists() {
                        return Err(Error::Config(format!(
                            "position file {} does not exist and no log path was supplied",
                            path.display()
                        )));
                    }
                    Cursor::File(FileCursor::open(path, self.rollback_period, self.lock)?)
                }
            }
        };

        let stored = match cursor.read() {
            Ok(stored) => stored,
            Err(e)
                if self.autofix_cursor
                    && matches!(e, Error::CursorMissing(_) | Error::CursorCorrupt { .. }) =>
            {
                warn!(error = %e, "discarding unusable cursor");
                cursor.clean()?;
                None
            }
            Err(e) => return Err(e),
        };

        let log_path = match (self.log, stored.as_ref()) {
            (Some(log), Some(record)) => {
                if self.check_log && record.log_path != log {
                    return Err(Error::LogfileMismatch {
                        stored: record.log_path.clone(),
                        supplied: log,
                    });
                }
                log
            }
            (Some(log), None) => log,
            (None, Some(record)) => record.log_path.clone(),
            (None, None) => {
                return Err(Error::Config(
                    "no log path was supplied and the cursor holds none".into(),
                ))
            }
        };

        let stdin = log_path == Path::new("-");
        let last_segment_index = if stdin {
            0
        } else {
            segment::last_segment_index(&log_path)?
        };
        let eof_limit = if self.end == End::Fixed && !stdin {
            Some(segment::size_of(&log_path)?)
        } else {
            None
        };

        let mut reader = Reader {
            log_path,
            stdin,
            cursor,
            start: self.start,
            end: self.end,
            check_inode: self.check_inode,
            check_lastline: self.check_lastline,
            autofix_cursor: self.autofix_cursor,
            filter: self.filter,
            segment_index: 0,
            last_segment_index,
            source: None,
            offset: 0,
            inode: None,
            last_line: None,
            eof_limit,
            carry: Vec::new(),
        };

        match stored {
            Some(record) if record.offset.is_some() => match reader.recover(&record) {
                Ok(()) => {}
                Err(Error::PositionLost(_)) if reader.autofix_cursor => {
                    warn!(
                        log = %reader.log_path.display(),
                        "committed position is unrecoverable, restarting fresh"
                    );
                    reader.cursor.clean()?;
                    reader.start_fresh()?;
                }
                Err(e) => return Err(e),
            },
            _ => reader.start_fresh()?,
        }

        Ok(reader)
    }
}

/// Sequential line reader over a logical log, resumable across rotations.
///
/// A reader owns its cursor and one open handle into the segment it is
/// currently positioned in. `read` delivers complete lines in physical
/// order, oldest segment first; `commit` makes the current position durable;
/// a later reader built on the same cursor resumes exactly there, even after
/// the file has been renamed away by a rotation.
pub struct Reader {
    log_path: PathBuf,
    stdin: bool,
    cursor: Cursor,
    start: Start,
    end: End,
    check_inode: bool,
    check_lastline: bool,
    autofix_cursor: bool,
    filter: Option<Filter>,
    segment_index: usize,
    last_segment_index: usize,
    source: Option<Source>,
    offset: u64,
    inode: Option<u64>,
    last_line: Option<Vec<u8>>,
    eof_limit: Option<u64>,
    carry: Vec<u8>,
}

impl std::fmt::Debug for Reader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reader")
            .field("log_path", &self.log_path)
            .field("stdin", &self.stdin)
            .field("offset", &self.offset)
            .field("inode", &self.inode)
            .finish_non_exhaustive()
    }
}

impl Reader {
    /// Start configuring a reader for the log at `path` (`"-"` for standard
    /// input).
    pub fn builder(path: impl AsRef<Path>) -> ReaderBuilder {
        ReaderBuilder::with_log(Some(path.as_ref().to_path_buf()))
    }

    /// The next complete line, terminator included, or `None` when nothing
    /// more is available right now.
    ///
    /// Bytes that are not valid UTF-8 are replaced lossily in the returned
    /// `String`; position identity always operates on the raw bytes.
    pub fn read(&mut self) -> Result<Option<String>> {
        loop {
            if self.source.is_none() {
                return Ok(None);
            }
            if let Some(limit) = self.eof_limit {
                if self.segment_index == 0 && self.offset >= limit {
                    return Ok(None);
                }
            }

            let mut buf = std::mem::take(&mut self.carry);
            match self.source.as_mut() {
                Some(Source::File(reader)) => reader.read_until(b'\n', &mut buf)?,
                Some(Source::Stream(reader)) => reader.read_until(b'\n', &mut buf)?,
                None => 0,
            };

            if buf.is_empty() {
                if self.segment_index > 0 {
                    self.walk_newer()?;
                    continue;
                }
                return Ok(None);
            }

            if !buf.ends_with(b"\n") && self.partial_is_trailing()? {
                // The writer has not finished this line yet; un-read it.
                match self.source.as_mut() {
                    Some(Source::File(reader)) => {
                        reader.seek(SeekFrom::Start(self.offset))?;
                    }
                    _ => self.carry = buf,
                }
                return Ok(None);
            }

            // A partial line inside a rotated segment is a complete record:
            // frozen segments do not grow.
            self.offset += buf.len() as u64;
            let line = String::from_utf8_lossy(&buf).into_owned();
            self.last_line = Some(buf);

            return match self.filter.as_mut() {
                Some(filter) => filter(line).map(Some).map_err(Error::Filter),
                None => Ok(Some(line)),
            };
        }
    }

    /// Snapshot the current position. Committing the result later resumes
    /// the next read exactly here.
    pub fn position(&self) -> Result<Position> {
        let offset = if self.source.is_some() {
            Some(self.offset)
        } else {
            None
        };
        let inode = if self.check_inode { self.inode } else { None };
        let last_line = if self.check_lastline && offset.is_some() {
            Some(match self.last_line.as_deref() {
                Some(line) => position::signature(line),
                None => self.tail_before(self.segment_index, self.offset)?,
            })
        } else {
            None
        };

        Ok(Position {
            offset,
            inode,
            last_line,
            log_path: self.log_path.clone(),
            commit_time: None,
        })
    }

    /// Commit the current position to the cursor.
    pub fn commit(&self) -> Result<()> {
        let position = self.position()?;
        self.commit_position(&position)
    }

    /// Commit a previously snapshotted position. A record without an offset
    /// is a no-op.
    pub fn commit_position(&self, position: &Position) -> Result<()> {
        if position.offset.is_none() {
            return Ok(());
        }
        self.cursor.commit(position)
    }

    /// Step back to the previous committed position, if the cursor retains
    /// one, and re-position the reader there. Returns whether it did.
    pub fn rollback(&mut self) -> Result<bool> {
        if self.stdin {
            return Err(Error::Config("cannot roll back standard input".into()));
        }
        if !self.cursor.rollback()? {
            return Ok(false);
        }
        match self.cursor.read()? {
            Some(record) => {
                self.recover(&record)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Bytes between the current position and the end of the newest data:
    /// the unread remainder of the current segment plus every newer segment.
    pub fn lag(&self) -> Result<u64> {
        if self.stdin || self.source.is_none() {
            return Err(Error::LagUnavailable);
        }
        let mut total = 0u64;
        for index in 0..=self.segment_index {
            total += segment::size_of(&segment::segment_path(&self.log_path, index))?;
        }
        Ok(total.saturating_sub(self.offset))
    }

    /// Index of the segment currently being read; 0 is the active file.
    pub fn log_number(&self) -> usize {
        self.segment_index
    }

    /// Physical path of the segment currently being read.
    pub fn log_name(&self) -> PathBuf {
        segment::segment_path(&self.log_path, self.segment_index)
    }

    /// The logical log path this reader follows.
    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    // Match a committed record against the current on-disk state, walking
    // candidates from the active file toward the oldest segment. Each
    // candidate must be large enough to contain the offset and must pass
    // whichever identity checks are enabled and recorded.
    fn recover(&mut self, record: &Position) -> Result<()> {
        if self.stdin {
            return self.recover_stdin(record);
        }

        let target = record.offset.unwrap_or(0);
        for index in 0..=self.last_segment_index {
            let path = segment::segment_path(&self.log_path, index);
            let mut file = match File::open(&path) {
                Ok(f) => f,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(Error::UnreadableLog { path, source: e }),
            };
            let size = file.metadata()?.len();
            if size < target {
                debug!(segment = index, size, target, "candidate too small");
                continue;
            }
            if size == 0 && index == 0 && self.end == End::Fixed {
                continue;
            }
            file.seek(SeekFrom::Start(target))?;

            let inode = segment::inode_of(&file)?;
            if self.check_inode {
                if let Some(want) = record.inode {
                    if inode != want {
                        debug!(segment = index, inode, want, "candidate inode mismatch");
                        continue;
                    }
                }
            }
            if self.check_lastline {
                if let Some(want) = record.last_line.as_deref() {
                    let tail = self.tail_before(index, target)?;
                    if !tail.ends_with(want) {
                        debug!(segment = index, "candidate last-line mismatch");
                        continue;
                    }
                }
            }

            debug!(segment = index, offset = target, "resuming from committed position");
            self.segment_index = index;
            self.offset = target;
            self.inode = Some(inode);
            self.source = Some(Source::File(BufReader::new(file)));
            self.last_line = record.last_line.clone();

            // A rotated segment consumed to its end yields nothing; move
            // toward the active file until there are unread bytes.
            while self.segment_index > 0 {
                let size = segment::size_of(&self.log_name())?;
                if self.offset < size {
                    break;
                }
                self.walk_newer()?;
                if self.source.is_none() {
                    break;
                }
            }
            return Ok(());
        }

        warn!(
            log = %self.log_path.display(),
            offset = target,
            "no segment matches the committed position"
        );
        Err(Error::PositionLost(self.log_path.clone()))
    }

    // Standard input cannot seek, so resuming means consuming the committed
    // number of bytes from the stream. The last-line signature is still
    // verified against the tail of what was consumed.
    fn recover_stdin(&mut self, record: &Position) -> Result<()> {
        self.recover_stream(record, Box::new(io::stdin()))
    }

    fn recover_stream(&mut self, record: &Position, stream: Box<dyn Read>) -> Result<()> {
        let target = record.offset.unwrap_or(0);
        let mut reader = BufReader::new(stream);
        let mut tail: Vec<u8> = Vec::new();
        let mut chunk = [0u8; 8192];
        let mut remaining = target;

        while remaining > 0 {
            let want = remaining.min(chunk.len() as u64) as usize;
            let n = reader.read(&mut chunk[..want])?;
            if n == 0 {
                warn!("standard input ended before the committed offset");
                return Err(Error::PositionLost(self.log_path.clone()));
            }
            tail.extend_from_slice(&chunk[..n]);
            if tail.len() > position::SIGNATURE_MAX + 1 {
                let cut = tail.len() - (position::SIGNATURE_MAX + 1);
                tail.drain(..cut);
            }
            remaining -= n as u64;
        }

        if self.check_lastline {
            if let Some(want) = record.last_line.as_deref() {
                if !position::signature(&tail).ends_with(want) {
                    return Err(Error::PositionLost(self.log_path.clone()));
                }
            }
        }

        self.source = Some(Source::Stream(reader));
        self.segment_index = 0;
        self.offset = target;
        self.last_line = Some(tail);
        Ok(())
    }

    // Initial placement when there is no committed position to resume.
    fn start_fresh(&mut self) -> Result<()> {
        if self.stdin {
            self.source = Some(Source::Stream(BufReader::new(Box::new(io::stdin()))));
            self.segment_index = 0;
            self.offset = 0;
            return Ok(());
        }

        match self.start {
            Start::Begin => {
                self.open_segment(0, 0)?;
            }
            Start::End => {
                let path = self.log_path.clone();
                match File::open(&path) {
                    Ok(mut file) => {
                        let boundary = segment::last_line_boundary(&mut file)?;
                        file.seek(SeekFrom::Start(boundary))?;
                        self.inode = Some(segment::inode_of(&file)?);
                        self.source = Some(Source::File(BufReader::new(file)));
                        self.segment_index = 0;
                        self.offset = boundary;
                    }
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(Error::UnreadableLog { path, source: e }),
                }
            }
            Start::First => {
                let mut index = self.last_segment_index;
                loop {
                    self.segment_index = index;
                    if self.open_segment(index, 0)? || index == 0 {
                        break;
                    }
                    index -= 1;
                }
            }
        }
        Ok(())
    }

    // Open segment `index` at `offset`. False when the file does not exist.
    fn open_segment(&mut self, index: usize, offset: u64) -> Result<bool> {
        let path = segment::segment_path(&self.log_path, index);
        let mut file = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(Error::UnreadableLog { path, source: e }),
        };
        if offset > 0 {
            file.seek(SeekFrom::Start(offset))?;
        }
        self.inode = Some(segment::inode_of(&file)?);
        self.source = Some(Source::File(BufReader::new(file)));
        self.segment_index = index;
        self.offset = offset;
        Ok(true)
    }

    // Move to the adjacent newer segment, skipping over holes left by
    // deleted segments. The identity of the newly opened file is taken on
    // faith; a rotation racing between the EOF and this open can slip a
    // different file under the same name.
    fn walk_newer(&mut self) -> Result<()> {
        while self.segment_index > 0 {
            let next = self.segment_index - 1;
            self.segment_index = next;
            if self.open_segment(next, 0)? {
                debug!(segment = next, "walked to newer segment");
                return Ok(());
            }
        }
        self.source = None;
        self.inode = None;
        self.offset = 0;
        Ok(())
    }

    // Is a trailing partial line really trailing? Only when the current
    // segment is the newest one holding data: the active file, or a rotated
    // segment whose newer neighbour is still empty.
    fn partial_is_trailing(&self) -> Result<bool> {
        if self.segment_index == 0 {
            return Ok(true);
        }
        let newer = segment::segment_path(&self.log_path, self.segment_index - 1);
        Ok(segment::size_of(&newer)? == 0)
    }

    // The last-line signature for a position at `offset` of segment `index`
    // when no line has been consumed yet: the bytes ending at the offset,
    // or, at offset 0, the tail of the next-older segment.
    fn tail_before(&self, index: usize, offset: u64) -> Result<Vec<u8>> {
        if self.stdin {
            return Ok(Vec::new());
        }
        let raw = if offset > 0 {
            segment::read_tail(
                &segment::segment_path(&self.log_path, index),
                offset,
                position::SIGNATURE_MAX + 1,
            )?
        } else {
            let older = index + 1;
            if older > self.last_segment_index {
                Vec::new()
            } else {
                let path = segment::segment_path(&self.log_path, older);
                let size = segment::size_of(&path)?;
                segment::read_tail(&path, size, position::SIGNATURE_MAX + 1)?
            }
        };
        Ok(position::signature(&raw))
    }
}
