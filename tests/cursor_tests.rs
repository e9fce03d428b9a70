mod common;

use common::{builder, write_file};
use std::fs;
use std::path::PathBuf;
use tailtrack::{Cursor, Error, FileCursor, LockMode, Position, Reader};
use tempfile::tempdir;

fn record(log: &str, offset: u64) -> Position {
    Position {
        offset: Some(offset),
        inode: Some(917),
        last_line: Some(b"tail bytes".to_vec()),
        log_path: PathBuf::from(log),
        commit_time: None,
    }
}

#[test]
fn test_commit_writes_the_expected_format() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("app.pos");
    let cursor = FileCursor::open(&path, 0, LockMode::None).unwrap();

    cursor.commit(&record("/var/log/app.log", 1284)).unwrap();

    let content = fs::read_to_string(&path).unwrap();
    assert_eq!(
        content,
        "logfile: /var/log/app.log\nposition: 1284\ninode: 917\nlastline: tail bytes\n"
    );
}

#[test]
fn test_read_round_trips_a_commit() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("app.pos");
    let cursor = FileCursor::open(&path, 0, LockMode::None).unwrap();

    let committed = record("/var/log/app.log", 42);
    cursor.commit(&committed).unwrap();

    let read_back = cursor.read().unwrap().unwrap();
    assert_eq!(read_back, committed);
}

#[test]
fn test_idempotent_commit_without_rollback() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("app.pos");
    let cursor = FileCursor::open(&path, 0, LockMode::None).unwrap();

    cursor.commit(&record("/var/log/app.log", 42)).unwrap();
    let first = fs::read(&path).unwrap();
    cursor.commit(&record("/var/log/app.log", 42)).unwrap();
    let second = fs::read(&path).unwrap();

    assert_eq!(first, second);
}

#[test]
fn test_single_record_file_without_separator_parses() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("app.pos");
    write_file(
        &path,
        b"logfile: /var/log/app.log\nposition: 100\nlastline: the line\n",
    );

    let cursor = FileCursor::open(&path, 0, LockMode::None).unwrap();
    let read_back = cursor.read().unwrap().unwrap();
    assert_eq!(read_back.offset, Some(100));
    assert_eq!(read_back.inode, None);
    assert_eq!(read_back.last_line.as_deref(), Some(b"the line".as_slice()));
    assert_eq!(read_back.log_path, PathBuf::from("/var/log/app.log"));
}

#[test]
fn test_integer_fields_tolerate_no_space() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("app.pos");
    write_file(&path, b"logfile: /l\nposition:7\ninode:  33\n");

    let cursor = FileCursor::open(&path, 0, LockMode::None).unwrap();
    let read_back = cursor.read().unwrap().unwrap();
    assert_eq!(read_back.offset, Some(7));
    assert_eq!(read_back.inode, Some(33));
}

#[test]
fn test_empty_cursor_file_is_missing() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("app.pos");
    write_file(&path, b"");

    let cursor = FileCursor::open(&path, 0, LockMode::None).unwrap();
    assert!(matches!(cursor.read(), Err(Error::CursorMissing(_))));
}

#[test]
fn test_absent_cursor_file_reads_none() {
    let dir = tempdir().unwrap();
    let cursor = FileCursor::open(dir.path().join("app.pos"), 0, LockMode::None).unwrap();
    assert!(cursor.read().unwrap().is_none());
}

#[test]
fn test_record_without_position_is_corrupt() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("app.pos");
    write_file(&path, b"logfile: /var/log/app.log\nlastline: x\n");

    let cursor = FileCursor::open(&path, 0, LockMode::None).unwrap();
    assert!(matches!(cursor.read(), Err(Error::CursorCorrupt { .. })));
}

#[test]
fn test_duplicate_field_is_corrupt() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("app.pos");
    write_file(&path, b"logfile: /l\nposition: 1\nposition: 2\n");

    let cursor = FileCursor::open(&path, 0, LockMode::None).unwrap();
    assert!(matches!(cursor.read(), Err(Error::CursorCorrupt { .. })));
}

#[test]
fn test_unknown_field_is_corrupt() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("app.pos");
    write_file(&path, b"logfile: /l\nposition: 1\nchecksum: abc\n");

    let cursor = FileCursor::open(&path, 0, LockMode::None).unwrap();
    assert!(matches!(cursor.read(), Err(Error::CursorCorrupt { .. })));
}

#[test]
fn test_garbage_integer_is_corrupt() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("app.pos");
    write_file(&path, b"logfile: /l\nposition: -12\n");

    let cursor = FileCursor::open(&path, 0, LockMode::None).unwrap();
    assert!(matches!(cursor.read(), Err(Error::CursorCorrupt { .. })));
}

#[test]
fn test_clean_removes_the_position_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("app.pos");
    let cursor = FileCursor::open(&path, 0, LockMode::None).unwrap();

    cursor.commit(&record("/l", 5)).unwrap();
    assert!(path.exists());
    cursor.clean().unwrap();
    assert!(!path.exists());
    // Idempotent.
    cursor.clean().unwrap();
}

#[test]
fn test_multi_record_file_round_trips() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("app.pos");
    let original = b"logfile: /l\nposition: 90\ncommittime: 99\n###\nlogfile: /l\nposition: 80\ncommittime: 98\n".to_vec();
    write_file(&path, &original);

    // Reading back the newest record and re-running a rollback-window
    // commit must not mangle what it keeps.
    let cursor = FileCursor::open(&path, 1_000_000, LockMode::None).unwrap();
    let newest = cursor.read().unwrap().unwrap();
    assert_eq!(newest.offset, Some(90));
    assert_eq!(newest.commit_time, Some(99));

    assert!(cursor.rollback().unwrap());
    let content = fs::read(&path).unwrap();
    assert_eq!(content, b"logfile: /l\nposition: 80\ncommittime: 98\n");
}

#[test]
fn test_cursor_mismatch_detected_when_check_log_on() {
    let dir = tempdir().unwrap();
    let log_a = dir.path().join("a.log");
    let log_b = dir.path().join("b.log");
    let pos = dir.path().join("app.pos");
    write_file(&log_a, b"a\n");
    write_file(&log_b, b"b\n");

    {
        let mut reader = builder(&log_a, &pos).open().unwrap();
        reader.read().unwrap();
        reader.commit().unwrap();
    }

    let err = builder(&log_b, &pos).check_log(true).open().unwrap_err();
    assert!(matches!(err, Error::LogfileMismatch { .. }));

    // Without the check the supplied path wins; the stored identity then
    // simply fails to match b.log and the position is reported lost rather
    // than silently misapplied.
    let err = builder(&log_b, &pos).open().unwrap_err();
    assert!(matches!(err, Error::PositionLost(_)));
}

#[test]
fn test_reader_adopts_log_path_from_cursor() {
    let dir = tempdir().unwrap();
    let log = dir.path().join("app.log");
    let pos = dir.path().join("app.pos");
    write_file(&log, b"a\nb\n");

    {
        let mut reader = builder(&log, &pos).open().unwrap();
        assert_eq!(reader.read().unwrap().as_deref(), Some("a\n"));
        reader.commit().unwrap();
    }

    let mut reader = tailtrack::ReaderBuilder::from_position_file(&pos)
        .end(tailtrack::End::Future)
        .open()
        .unwrap();
    assert_eq!(reader.log_path(), log);
    assert_eq!(reader.read().unwrap().as_deref(), Some("b\n"));
}

#[test]
fn test_explicit_cursor_object() {
    let dir = tempdir().unwrap();
    let log = dir.path().join("app.log");
    let pos = dir.path().join("app.pos");
    write_file(&log, b"a\nb\n");

    {
        let cursor = Cursor::File(FileCursor::open(&pos, 0, LockMode::None).unwrap());
        let mut reader = Reader::builder(&log)
            .cursor(cursor)
            .end(tailtrack::End::Future)
            .open()
            .unwrap();
        assert_eq!(reader.read().unwrap().as_deref(), Some("a\n"));
        reader.commit().unwrap();
    }

    let cursor = Cursor::File(FileCursor::open(&pos, 0, LockMode::None).unwrap());
    let mut reader = Reader::builder(&log)
        .cursor(cursor)
        .end(tailtrack::End::Future)
        .open()
        .unwrap();
    assert_eq!(reader.read().unwrap().as_deref(), Some("b\n"));
}
