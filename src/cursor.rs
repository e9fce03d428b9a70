//! Durable storage for committed positions.
//!
//! A cursor holds a short history of [`Position`] records, newest first, in a
//! plain text file. Commits go through a temp file and an atomic rename, so
//! a crash leaves either the old or the new content on disk, never a
//! truncated mix. With a rollback window configured, a bounded number of
//! older records is retained so a consumer can step back to an earlier
//! checkpoint after discovering it processed bad data.
//!
//! The file format is line-oriented `key: value` blocks separated by `###`:
//!
//! ```text
//! logfile: /var/log/app.log
//! position: 1284
//! inode: 917412
//! lastline: POST /api/v1/orders 201
//! committime: 1722470400
//! ###
//! logfile: /var/log/app.log
//! position: 512
//! ...
//! ```
//!
//! `inode`, `lastline` and `committime` are optional. A single-record file
//! without any `###` separator is the older format and still parses.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use fs2::FileExt;
use tracing::debug;

use crate::error::{Error, Result};
use crate::position::Position;

/// How the cursor file is protected against concurrent readers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockMode {
    /// No locking; the caller guarantees exclusivity.
    #[default]
    None,
    /// Wait for the lock.
    Blocking,
    /// Fail with [`Error::LockBusy`] if the lock is held.
    Nonblocking,
}

impl FromStr for LockMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(LockMode::None),
            "blocking" => Ok(LockMode::Blocking),
            "nonblocking" => Ok(LockMode::Nonblocking),
            other => Err(Error::Config(format!("unknown lock mode {other:?}"))),
        }
    }
}

/// Where committed positions go.
///
/// The set is closed: positions are either persisted to a file or thrown
/// away. [`Cursor::Null`] is for callers that want reader semantics without
/// persistence: every operation succeeds and nothing is remembered.
pub enum Cursor {
    File(FileCursor),
    Null,
}

impl Cursor {
    /// Newest persisted position, or `None` when nothing was ever committed.
    pub fn read(&self) -> Result<Option<Position>> {
        match self {
            Cursor::File(c) => c.read(),
            Cursor::Null => Ok(None),
        }
    }

    /// Persist `position` as the newest record.
    pub fn commit(&self, position: &Position) -> Result<()> {
        match self {
            Cursor::File(c) => c.commit(position),
            Cursor::Null => Ok(()),
        }
    }

    /// Discard the newest record. Returns `true` iff a strictly older record
    /// remained and is now the newest.
    pub fn rollback(&self) -> Result<bool> {
        match self {
            Cursor::File(c) => c.rollback(),
            Cursor::Null => Ok(false),
        }
    }

    /// Remove all persisted state.
    pub fn clean(&self) -> Result<()> {
        match self {
            Cursor::File(c) => c.clean(),
            Cursor::Null => Ok(()),
        }
    }
}

/// A cursor backed by a position file.
///
/// Opening with a lock mode other than [`LockMode::None`] takes an exclusive
/// advisory lock on a `.lock` sibling of the position file; the lock is held
/// until the cursor is dropped. The lock file itself is never removed.
pub struct FileCursor {
    path: PathBuf,
    rollback_period: u64,
    _lock: Option<File>,
}

impl FileCursor {
    /// Open a cursor at `path`, acquiring the configured lock.
    ///
    /// `rollback_period` is the retention window in seconds for older
    /// records; 0 keeps only the newest.
    pub fn open(path: impl AsRef<Path>, rollback_period: u64, lock: LockMode) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let lock_file = if lock == LockMode::None {
            None
        } else {
            let lock_path = crate::segment::append_suffix(&path, ".lock");
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&lock_path)?;
            if lock == LockMode::Blocking {
                file.lock_exclusive()?;
            } else {
                file.try_lock_exclusive().map_err(|e| {
                    if e.kind() == io::ErrorKind::WouldBlock {
                        Error::LockBusy(lock_path.clone())
                    } else {
                        Error::Io(e)
                    }
                })?;
            }
            debug!(lock = %lock_path.display(), "acquired cursor lock");
            Some(file)
        };

        Ok(FileCursor {
            path,
            rollback_period,
            _lock: lock_file,
        })
    }

    /// Path of the position file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Newest persisted position. `Ok(None)` when the position file does not
    /// exist; an existing but empty file is [`Error::CursorMissing`].
    pub fn read(&self) -> Result<Option<Position>> {
        let bytes = match fs::read(&self.path) {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut records = parse_records(&self.path, &bytes)?;
        if records.is_empty() {
            return Err(Error::CursorMissing(self.path.clone()));
        }
        Ok(Some(records.remove(0)))
    }

    /// Persist `position` as the newest record, applying the rollback
    /// retention window to whatever was there before.
    pub fn commit(&self, position: &Position) -> Result<()> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        self.commit_at(position, now)
    }

    // Split out so the window arithmetic is testable with fixed clocks.
    pub(crate) fn commit_at(&self, position: &Position, now: u64) -> Result<()> {
        if position.offset.is_none() {
            return Ok(());
        }

        if self.rollback_period == 0 {
            let mut record = position.clone();
            record.commit_time = None;
            return self.write_records(&[record]);
        }

        let mut record = position.clone();
        record.commit_time = Some(now);

        let existing = self.existing_records()?;
        let age = |r: &Position| now.saturating_sub(r.commit_time.unwrap_or(0));

        // Retain at most one record younger than the window and at most one
        // older, so successive rollbacks expose progressively older
        // checkpoints without the file growing unboundedly.
        let mut records = vec![record];
        match existing.as_slice() {
            [] => {}
            [r0, ..] if age(r0) > self.rollback_period => {
                records.push(r0.clone());
            }
            [r0] => {
                records.push(r0.clone());
            }
            [r0, r1, rest @ ..] => {
                if age(r1) <= self.rollback_period {
                    // The newest retained record is still young; the one it
                    // replaces would add nothing to the window.
                    records.push(r1.clone());
                    records.extend(rest.iter().cloned());
                } else {
                    records.push(r0.clone());
                    records.push(r1.clone());
                }
            }
        }
        self.write_records(&records)
    }

    /// Drop the newest record. Returns `true` iff an older record remained.
    pub fn rollback(&self) -> Result<bool> {
        let mut records = self.existing_records()?;
        if records.len() < 2 {
            return Ok(false);
        }
        let dropped = records.remove(0);
        self.write_records(&records)?;
        debug!(
            cursor = %self.path.display(),
            dropped = ?dropped.offset,
            restored = ?records[0].offset,
            "rolled back to an older committed position"
        );
        Ok(true)
    }

    /// Remove the position file (and a stale temp file, if a crash left
    /// one). Idempotent.
    pub fn clean(&self) -> Result<()> {
        for path in [
            self.path.clone(),
            crate::segment::append_suffix(&self.path, ".tmp"),
        ] {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    // All persisted records, oldest last. A missing or empty file reads as
    // no records; a malformed one is an error, never silently clobbered.
    fn existing_records(&self) -> Result<Vec<Position>> {
        let bytes = match fs::read(&self.path) {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        parse_records(&self.path, &bytes)
    }

    fn write_records(&self, records: &[Position]) -> Result<()> {
        let bytes = serialize_records(records);
        let tmp = crate::segment::append_suffix(&self.path, ".tmp");

        let mut file = File::create(&tmp)?;
        file.write_all(&bytes)?;
        file.sync_data()?;
        file.set_permissions(fs::Permissions::from_mode(0o644))?;
        drop(file);

        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

fn corrupt(path: &Path, reason: impl Into<String>) -> Error {
    Error::CursorCorrupt {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}

#[derive(Default)]
struct RecordFields {
    logfile: Option<PathBuf>,
    position: Option<u64>,
    inode: Option<u64>,
    lastline: Option<Vec<u8>>,
    committime: Option<u64>,
    any: bool,
}

impl RecordFields {
    fn finish(self, path: &Path) -> Result<Position> {
        let offset = self
            .position
            .ok_or_else(|| corrupt(path, "record without position"))?;
        let log_path = self
            .logfile
            .ok_or_else(|| corrupt(path, "record without logfile"))?;
        Ok(Position {
            offset: Some(offset),
            inode: self.inode,
            last_line: self.lastline,
            log_path,
            commit_time: self.committime,
        })
    }
}

// Text fields take exactly one space after the colon; the rest of the line
// is the value, raw bytes included.
fn text_value<'a>(path: &Path, key: &str, rest: &'a [u8]) -> Result<&'a [u8]> {
    match rest.first() {
        Some(b' ') => Ok(&rest[1..]),
        _ => Err(corrupt(path, format!("missing value for {key}"))),
    }
}

// Integer fields tolerate zero or more spaces after the colon.
fn int_value(path: &Path, key: &str, rest: &[u8]) -> Result<u64> {
    let trimmed: &[u8] = {
        let mut r = rest;
        while let Some(b' ') = r.first() {
            r = &r[1..];
        }
        r
    };
    if trimmed.is_empty() || !trimmed.iter().all(|b| b.is_ascii_digit()) {
        return Err(corrupt(path, format!("bad integer for {key}")));
    }
    std::str::from_utf8(trimmed)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| corrupt(path, format!("bad integer for {key}")))
}

fn parse_records(path: &Path, bytes: &[u8]) -> Result<Vec<Position>> {
    let mut records = Vec::new();
    let mut fields = RecordFields::default();

    for line in bytes.split(|&b| b == b'\n') {
        if line.is_empty() {
            continue;
        }
        if line == b"###" {
            if fields.any {
                records.push(std::mem::take(&mut fields).finish(path)?);
            }
            continue;
        }

        let colon = line
            .iter()
            .position(|&b| b == b':')
            .ok_or_else(|| corrupt(path, "line without a field name"))?;
        let (key, rest) = (&line[..colon], &line[colon + 1..]);

        fields.any = true;
        match key {
            b"logfile" => {
                if fields.logfile.is_some() {
                    return Err(corrupt(path, "duplicate logfile"));
                }
                let value = text_value(path, "logfile", rest)?;
                fields.logfile = Some(std::ffi::OsString::from_vec(value.to_vec()).into());
            }
            b"position" => {
                if fields.position.is_some() {
                    return Err(corrupt(path, "duplicate position"));
                }
                fields.position = Some(int_value(path, "position", rest)?);
            }
            b"inode" => {
                if fields.inode.is_some() {
                    return Err(corrupt(path, "duplicate inode"));
                }
                fields.inode = Some(int_value(path, "inode", rest)?);
            }
            b"lastline" => {
                if fields.lastline.is_some() {
                    return Err(corrupt(path, "duplicate lastline"));
                }
                fields.lastline = Some(text_value(path, "lastline", rest)?.to_vec());
            }
            b"committime" => {
                if fields.committime.is_some() {
                    return Err(corrupt(path, "duplicate committime"));
                }
                fields.committime = Some(int_value(path, "committime", rest)?);
            }
            other => {
                return Err(corrupt(
                    path,
                    format!("unknown field {:?}", String::from_utf8_lossy(other)),
                ));
            }
        }
    }

    if fields.any {
        records.push(fields.finish(path)?);
    }
    Ok(records)
}

fn serialize_records(records: &[Position]) -> Vec<u8> {
    let mut out = Vec::new();
    for (i, record) in records.iter().enumerate() {
        if i > 0 {
            out.extend_from_slice(b"###\n");
        }
        out.extend_from_slice(b"logfile: ");
        out.extend_from_slice(record.log_path.as_os_str().as_bytes());
        out.push(b'\n');
        out.extend_from_slice(format!("position: {}\n", record.offset.unwrap_or(0)).as_bytes());
        if let Some(inode) = record.inode {
            out.extend_from_slice(format!("inode: {inode}\n").as_bytes());
        }
        if let Some(last_line) = &record.last_line {
            out.extend_from_slice(b"lastline: ");
            out.extend_from_slice(last_line);
            out.push(b'\n');
        }
        if let Some(commit_time) = record.commit_time {
            out.extend_from_slice(format!("committime: {commit_time}\n").as_bytes());
        }
    }
    out
}
