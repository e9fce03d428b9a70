mod common;

use common::{builder, write_file};
use tailtrack::{Error, FileCursor, LockMode};
use tempfile::tempdir;

#[test]
fn test_nonblocking_lock_reports_busy() {
    let dir = tempdir().unwrap();
    let pos = dir.path().join("app.pos");

    let _held = FileCursor::open(&pos, 0, LockMode::Nonblocking).unwrap();
    let result = FileCursor::open(&pos, 0, LockMode::Nonblocking);
    assert!(matches!(result, Err(Error::LockBusy(_))));
}

#[test]
fn test_lock_released_on_drop() {
    let dir = tempdir().unwrap();
    let pos = dir.path().join("app.pos");

    {
        let _held = FileCursor::open(&pos, 0, LockMode::Nonblocking).unwrap();
    }
    // The previous holder is gone; the lock is free again.
    let _reacquired = FileCursor::open(&pos, 0, LockMode::Nonblocking).unwrap();
}

#[test]
fn test_lock_mode_none_allows_concurrent_cursors() {
    let dir = tempdir().unwrap();
    let pos = dir.path().join("app.pos");

    let _first = FileCursor::open(&pos, 0, LockMode::None).unwrap();
    let _second = FileCursor::open(&pos, 0, LockMode::None).unwrap();
}

#[test]
fn test_reader_holds_the_cursor_lock_for_its_lifetime() {
    let dir = tempdir().unwrap();
    let log = dir.path().join("app.log");
    let pos = dir.path().join("app.pos");
    write_file(&log, b"a\n");

    let reader = builder(&log, &pos)
        .lock(LockMode::Nonblocking)
        .open()
        .unwrap();

    let contender = builder(&log, &pos).lock(LockMode::Nonblocking).open();
    assert!(matches!(contender, Err(Error::LockBusy(_))));

    drop(reader);
    let _now_free = builder(&log, &pos)
        .lock(LockMode::Nonblocking)
        .open()
        .unwrap();
}

#[test]
fn test_lock_file_sits_next_to_the_position_file() {
    let dir = tempdir().unwrap();
    let pos = dir.path().join("app.pos");

    let _cursor = FileCursor::open(&pos, 0, LockMode::Blocking).unwrap();
    assert!(dir.path().join("app.pos.lock").exists());
}
