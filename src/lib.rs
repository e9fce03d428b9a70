//! Resumable, rotation-aware reading of newline-delimited log files.
//!
//! A [`Reader`] follows a logical log (`app.log`, `app.log.1`, `app.log.2`,
//! …) line by line, commits its progress to a durable [`Cursor`], and on
//! restart resumes from the committed [`Position`] even after the file has
//! been rotated out from under it, without skipping records and without
//! re-delivering committed ones.

mod cursor;
mod error;
mod position;
mod reader;
mod segment;

pub use cursor::{Cursor, FileCursor, LockMode};
pub use error::{Error, Result};
pub use position::Position;
pub use reader::{End, Filter, Reader, ReaderBuilder, Start};
