use std::path::PathBuf;
use thiserror::Error;

use crate::lockable::LockOp;

/// Structured error kinds. I/O failures are reported as plain `eyre`
/// errors wrapped with the container's file name; these variants cover the
/// cases a caller may want to match on: misuse of the locking API and
/// on-disk format violations.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("{}: double {op:?} lock", .path.display())]
    DoubleLock { path: PathBuf, op: LockOp },
    #[error("{}: up/downgrading lock not permitted", .path.display())]
    LockTransition { path: PathBuf },
    #[error("{}: operation requires holding a {needed} lock", .path.display())]
    LockRequired { path: PathBuf, needed: &'static str },
    #[error("{} does not appear to be a {kind} file", .path.display())]
    BadMagic { path: PathBuf, kind: &'static str },
    #[error("{}: length {len} is not a multiple of record width {width}", .path.display())]
    BadLength { path: PathBuf, len: u64, width: usize },
    #[error("{}: chunk size {chunk} is not a multiple of record width {width}", .path.display())]
    BadChunkSize { path: PathBuf, chunk: usize, width: usize },
    #[error("{}: tried to read past end of list, position {pos}/{len}", .path.display())]
    OutOfRange { path: PathBuf, pos: u64, len: u64 },
}
