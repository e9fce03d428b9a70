use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use tailtrack::{End, Reader, ReaderBuilder};

pub fn write_file(path: &Path, content: &[u8]) {
    fs::write(path, content).unwrap();
}

pub fn append_file(path: &Path, content: &[u8]) {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .unwrap();
    file.write_all(content).unwrap();
}

/// Shift every segment one step older (log.2 to log.3, log.1 to log.2,
/// log to log.1) and create a fresh empty active file, the way logrotate
/// does it.
pub fn rotate(log: &Path) {
    let mut index = 1;
    while suffixed(log, index).exists() {
        index += 1;
    }
    while index > 1 {
        fs::rename(suffixed(log, index - 1), suffixed(log, index)).unwrap();
        index -= 1;
    }
    if log.exists() {
        fs::rename(log, suffixed(log, 1)).unwrap();
    }
    fs::write(log, b"").unwrap();
}

pub fn suffixed(log: &Path, index: usize) -> PathBuf {
    let mut name = log.as_os_str().to_owned();
    name.push(format!(".{index}"));
    name.into()
}

/// A builder with the defaults most tests want: last-line identity and
/// following future appends.
pub fn builder(log: &Path, pos: &Path) -> ReaderBuilder {
    Reader::builder(log).position_file(pos).end(End::Future)
}

/// Drain the reader until it reports no more lines.
pub fn read_all(reader: &mut Reader) -> Vec<String> {
    let mut lines = Vec::new();
    while let Some(line) = reader.read().unwrap() {
        lines.push(line);
    }
    lines
}
