use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Longest last-line signature a position record carries. Longer lines are
/// truncated on the left, keeping the trailing bytes.
pub(crate) const SIGNATURE_MAX: usize = 255;

/// A committed (or committable) place in a logical log.
///
/// A position identifies where the *next* read begins: a byte offset into one
/// physical segment, plus enough identity to find that segment again after
/// the log has been rotated: the segment's inode and/or the trailing bytes
/// of the line ending at the offset. Positions are plain values; readers
/// produce them, cursors persist them.
///
/// `log_path` is always the logical base path (`access.log`), never a
/// rotated variant (`access.log.1`), even when the position itself lies
/// inside an older segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    /// Byte offset of the next read. `None` when snapshotted from a reader
    /// that has no open segment; committing such a record is a no-op.
    pub offset: Option<u64>,

    /// Inode of the segment the offset points into. Present iff inode
    /// checking was enabled when the record was produced.
    pub inode: Option<u64>,

    /// Up to 255 trailing bytes of the most recently consumed line, with the
    /// terminator stripped. Present iff last-line checking was enabled.
    pub last_line: Option<Vec<u8>>,

    /// The logical log path, without numeric suffix.
    pub log_path: PathBuf,

    /// Wall-clock seconds since epoch at commit time. Set by the file
    /// cursor iff rollback retention is active.
    pub commit_time: Option<u64>,
}

/// Reduce raw line bytes to the signature stored in a position record:
/// strip one trailing newline, keep the last [`SIGNATURE_MAX`] bytes.
pub(crate) fn signature(line: &[u8]) -> Vec<u8> {
    let stripped = match line.last() {
        Some(b'\n') => &line[..line.len() - 1],
        _ => line,
    };
    let keep = stripped.len().min(SIGNATURE_MAX);
    stripped[stripped.len() - keep..].to_vec()
}
