use std::fs::File;

use memmap2::Mmap;

use crate::{Error, Result};

/// Trait abstracting positional read access to database files.
///
/// Implementations forward the requested range to `f` as a borrowed slice, so
/// memory-mapped sources serve reads without copying. A range that cannot be
/// satisfied in full is an error, never a partial read.
pub trait ConstDbSource {
    /// Reads `length` bytes starting at `offset` and forwards them to `f`.
    fn read_exact_at<F, R>(&self, offset: u64, length: u64, f: F) -> Result<R>
    where
        F: FnOnce(&[u8]) -> Result<R>;

    /// Total size of the underlying file in bytes.
    fn size(&self) -> Result<u64>;
}

impl ConstDbSource for Mmap {
    fn read_exact_at<F, R>(&self, offset: u64, length: u64, f: F) -> Result<R>
    where
        F: FnOnce(&[u8]) -> Result<R>,
    {
        let end = offset
            .checked_add(length)
            .ok_or(Error::Malformed("read range overflows the offset space"))?;
        if end > self.len() as u64 {
            return Err(Error::Malformed("read range outside the mapped file"));
        }
        f(&self[offset as usize..end as usize])
    }

    fn size(&self) -> Result<u64> {
        Ok(self.len() as u64)
    }
}

impl ConstDbSource for File {
    fn read_exact_at<F, R>(&self, offset: u64, length: u64, f: F) -> Result<R>
    where
        F: FnOnce(&[u8]) -> Result<R>,
    {
        let mut buffer = vec![0u8; length as usize];
        read_at(self, &mut buffer, offset)?;
        f(&buffer)
    }

    fn size(&self) -> Result<u64> {
        Ok(self.metadata()?.len())
    }
}

#[cfg(unix)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
    std::os::unix::fs::FileExt::read_exact_at(file, buf, offset)
}

#[cfg(windows)]
fn read_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> std::io::Result<()> {
    use std::io::{Error, ErrorKind};
    use std::os::windows::fs::FileExt;

    while !buf.is_empty() {
        match file.seek_read(buf, offset) {
            Ok(0) => {
                return Err(Error::new(
                    ErrorKind::UnexpectedEof,
                    "failed to fill whole buffer",
                ));
            }
            Ok(n) => {
                let rest = buf;
                buf = &mut rest[n..];
                offset += n as u64;
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
