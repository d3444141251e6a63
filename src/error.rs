use std::io;

use thiserror::Error;

/// Errors surfaced by constant-database readers and builders.
///
/// Key absence is not an error: lookups report it through `Option` and empty
/// iterators.
#[derive(Debug, Error)]
pub enum Error {
    /// Underlying read, write, seek, sync or rename failure.
    ///
    /// Truncated descriptor reads surface here with
    /// [`std::io::ErrorKind::UnexpectedEof`] and short writes with
    /// [`std::io::ErrorKind::WriteZero`].
    #[error("i/o failure: {0}")]
    Io(#[from] io::Error),

    /// The file contradicts the constant-database format: a header entry or
    /// record reference points outside the file, or offset arithmetic leaves
    /// the 32-bit space. Reported on the first offending read.
    #[error("malformed database: {0}")]
    Malformed(&'static str),

    /// The database would exceed the 2^32 - 1 byte limit imposed by its
    /// 32-bit on-disk offsets.
    #[error("database exceeds the 32-bit size limit")]
    Overflow,
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;
