//! Positional reads.

use std::fmt::Debug;
use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::sync::Arc;

use bytes::Bytes;

/// A storage backend supporting positional reads.
///
/// Implementations are called from dispatcher worker threads, so a read
/// must be safe to issue concurrently from several threads.
pub trait ReadAt: Debug + Send + Sync {
    /// Read exactly `len` bytes starting at `offset`.
    fn read_byte_range(&self, offset: u64, len: u64) -> io::Result<Bytes>;

    /// Total length of the backing object.
    fn size(&self) -> io::Result<u64>;
}

impl ReadAt for Bytes {
    fn read_byte_range(&self, offset: u64, len: u64) -> io::Result<Bytes> {
        let end = offset
            .checked_add(len)
            .filter(|&end| end <= self.len() as u64)
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("read [{offset}, {}) past {} bytes", offset + len, self.len()),
                )
            })?;
        Ok(self.slice(offset as usize..end as usize))
    }

    fn size(&self) -> io::Result<u64> {
        Ok(self.len() as u64)
    }
}

impl ReadAt for File {
    fn read_byte_range(&self, offset: u64, len: u64) -> io::Result<Bytes> {
        let mut buf = vec![0u8; len as usize];
        self.read_exact_at(&mut buf, offset)?;
        Ok(buf.into())
    }

    fn size(&self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }
}

impl<R: ReadAt + ?Sized> ReadAt for Arc<R> {
    fn read_byte_range(&self, offset: u64, len: u64) -> io::Result<Bytes> {
        (**self).read_byte_range(offset, len)
    }

    fn size(&self) -> io::Result<u64> {
        (**self).size()
    }
}
