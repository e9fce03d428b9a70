//! Physical layout of a rotated logical log.
//!
//! The logical log `access.log` is the ordered file sequence `access.log`,
//! `access.log.1`, `access.log.2` and so on: index 0 is the active file,
//! larger indexes are older. Rotation tools that compress old segments produce
//! names like `access.log.2.gz`; those suffixes are not purely decimal and
//! are never enumerated here, so compressed segments are invisible to the
//! reader rather than misread.

use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

/// Append a literal suffix to a path, `access.log` + `.1` → `access.log.1`.
pub(crate) fn append_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut os: OsString = path.as_os_str().to_owned();
    os.push(suffix);
    os.into()
}

/// Physical path of segment `index`: the base path itself for index 0,
/// `base.N` otherwise.
pub(crate) fn segment_path(base: &Path, index: usize) -> PathBuf {
    if index == 0 {
        base.to_path_buf()
    } else {
        append_suffix(base, &format!(".{index}"))
    }
}

/// Largest `k` such that `base.k` exists, 0 when no rotated segment does.
///
/// The containing directory is scanned rather than probing `base.1`,
/// `base.2`, … upward, so a gap left by a deleted segment does not hide the
/// older ones behind it.
pub(crate) fn last_segment_index(base: &Path) -> io::Result<usize> {
    let dir = match base.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let name = match base.file_name() {
        Some(n) => n.to_string_lossy().into_owned(),
        None => return Ok(0),
    };
    let prefix = format!("{name}.");

    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };

    let mut last = 0;
    for entry in entries {
        let entry = entry?;
        let file_name = entry.file_name();
        let file_name = file_name.to_string_lossy();
        let Some(suffix) = file_name.strip_prefix(&prefix) else {
            continue;
        };
        if suffix.is_empty() || !suffix.bytes().all(|b| b.is_ascii_digit()) {
            continue;
        }
        if let Ok(index) = suffix.parse::<usize>() {
            last = last.max(index);
        }
    }
    Ok(last)
}

/// Size of the file at `path`, 0 when it does not exist.
pub(crate) fn size_of(path: &Path) -> io::Result<u64> {
    match fs::metadata(path) {
        Ok(meta) => Ok(meta.len()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e),
    }
}

pub(crate) fn inode_of(file: &File) -> io::Result<u64> {
    Ok(file.metadata()?.ino())
}

/// Read up to `limit` bytes ending at byte `end` of `path`. A missing file
/// reads as empty.
pub(crate) fn read_tail(path: &Path, end: u64, limit: usize) -> io::Result<Vec<u8>> {
    let mut file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let start = end.saturating_sub(limit as u64);
    let len = (end - start) as usize;
    file.seek(SeekFrom::Start(start))?;
    let mut buf = vec![0u8; len];
    file.read_exact(&mut buf)?;
    Ok(buf)
}

/// Offset of the byte immediately after the last `\n` in `file`, 0 when the
/// file contains none. Scans backward from EOF in chunks.
pub(crate) fn last_line_boundary(file: &mut File) -> io::Result<u64> {
    let len = file.seek(SeekFrom::End(0))?;
    let mut buf = [0u8; 8192];
    let mut end = len;

    while end > 0 {
        let start = end.saturating_sub(buf.len() as u64);
        let n = (end - start) as usize;
        file.seek(SeekFrom::Start(start))?;
        file.read_exact(&mut buf[..n])?;
        if let Some(pos) = buf[..n].iter().rposition(|&b| b == b'\n') {
            return Ok(start + pos as u64 + 1);
        }
        end = start;
    }
    Ok(0)
}
