//! Immutable, on-disk constant databases with constant-time lookups.
//!
//! A constant database maps arbitrary byte-string keys to byte-string values,
//! allows multiple values per key, and is written once, then read many times.
//! [`ConstDbBuilder`] streams records to a temporary file and publishes the
//! finished database with an atomic rename; [`ConstDb`] resolves keys through
//! a fixed index of 256 open-addressed hash tables with a handful of
//! positional reads per lookup, and iterates records in insertion order.
//! Files are memory-mapped by default and fall back to descriptor reads
//! through the [`ConstDbSource`] trait.
//!
//! ```
//! use constdb::{ConstDb, ConstDbBuilder};
//!
//! # fn main() -> constdb::Result<()> {
//! let dir = tempfile::tempdir()?;
//! let path = dir.path().join("fruits.cdb");
//!
//! let mut builder = ConstDbBuilder::create(&path)?;
//! builder.insert(b"apple", b"red")?;
//! builder.insert(b"banana", b"yellow")?;
//! builder.finish()?;
//!
//! let mut db = ConstDb::open(&path)?;
//! assert_eq!(db.fetch(b"banana")?, Some(b"yellow".to_vec()));
//! assert!(!db.exists(b"cherry")?);
//! # Ok(())
//! # }
//! ```

mod error;
pub use error::{Error, Result};

mod hash;
pub use hash::hash;

mod format;
pub use format::{ConstDbInfo, HEADER_SIZE, TABLE_COUNT};

mod source;
pub use source::ConstDbSource;

mod reader;
pub use reader::{ConstDb, ConstDbIter, ConstDbValues};

mod builder;
pub use builder::{BuildOptions, ConstDbBuilder};
