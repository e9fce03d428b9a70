use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong while opening a reader, following a log, or
/// persisting a cursor.
///
/// Construction-time problems (`Config`, `LogfileMismatch`, `LockBusy`) are
/// fatal: the reader is never handed out in a half-configured state. Cursor
/// problems (`CursorMissing`, `CursorCorrupt`, `PositionLost`) are fatal too
/// unless the reader was opened with `autofix_cursor`, which cleans the
/// cursor and restarts fresh instead.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid or contradictory construction parameters.
    #[error("invalid reader configuration: {0}")]
    Config(String),

    /// The cursor file exists but holds no records.
    #[error("cursor file {0} is empty")]
    CursorMissing(PathBuf),

    /// The cursor file could not be parsed.
    #[error("cursor file {path} is malformed: {reason}")]
    CursorCorrupt { path: PathBuf, reason: String },

    /// The cursor tracks a different logical log than the one supplied.
    #[error("cursor tracks {stored} but the reader was opened for {supplied}")]
    LogfileMismatch { stored: PathBuf, supplied: PathBuf },

    /// A log segment exists on disk but cannot be opened.
    #[error("log segment {path} exists but cannot be opened")]
    UnreadableLog {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// No current segment matches the committed position.
    #[error("no segment of {0} matches the committed position")]
    PositionLost(PathBuf),

    /// A nonblocking lock attempt found the lock already held.
    #[error("cursor lock {0} is held by another process")]
    LockBusy(PathBuf),

    /// `lag()` was called without an open segment (or on standard input,
    /// whose total size is unknowable).
    #[error("lag is unavailable without an open segment")]
    LagUnavailable,

    #[error(transparent)]
    Io(#[from] io::Error),

    /// The caller's line filter returned an error; it is carried verbatim.
    #[error("line filter failed")]
    Filter(#[source] Box<dyn std::error::Error + Send + Sync>),
}
