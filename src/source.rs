//! Random-access byte sources an archive is read from.
//!
//! A [`ByteSource`] is whatever holds the archive's raw bytes:
//! a local file, a buffer, or something slower on the other end of an IPC
//! or network hop. It only needs to read forward, skip, and seek,
//! including back to offset 0 whenever the archive has to be replayed.

use std::fs::File;
use std::io::{self, prelude::*, SeekFrom};
use std::path::Path;

use log::*;

/// A seekable source of archive bytes.
///
/// Failures are reported as `Err`, distinct from `Ok(0)`
/// (which means the end of the source was reached).
pub trait ByteSource {
    /// Reads up to `buf.len()` bytes at the current offset.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Advances the offset by up to `count` bytes,
    /// returning how far it actually moved.
    fn skip(&mut self, count: u64) -> io::Result<u64>;

    /// Moves to the given position, returning the new offset.
    fn seek(&mut self, position: SeekFrom) -> io::Result<u64>;

    /// Releases the source. Calling it again does nothing.
    fn close(&mut self) -> io::Result<()>;

    /// The offset the next read starts at.
    fn offset(&self) -> u64;
}

impl<S: ByteSource + ?Sized> ByteSource for &mut S {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read(buf)
    }

    fn skip(&mut self, count: u64) -> io::Result<u64> {
        (**self).skip(count)
    }

    fn seek(&mut self, position: SeekFrom) -> io::Result<u64> {
        (**self).seek(position)
    }

    fn close(&mut self) -> io::Result<()> {
        (**self).close()
    }

    fn offset(&self) -> u64 {
        (**self).offset()
    }
}

impl<S: ByteSource + ?Sized> ByteSource for Box<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read(buf)
    }

    fn skip(&mut self, count: u64) -> io::Result<u64> {
        (**self).skip(count)
    }

    fn seek(&mut self, position: SeekFrom) -> io::Result<u64> {
        (**self).seek(position)
    }

    fn close(&mut self) -> io::Result<()> {
        (**self).close()
    }

    fn offset(&self) -> u64 {
        (**self).offset()
    }
}

/// A [`ByteSource`] over anything `Read + Seek`.
///
/// Closing drops the inner reader; any use afterwards fails.
pub struct ReaderSource<R> {
    inner: Option<R>,
    offset: u64,
    len: u64,
}

/// A [`ByteSource`] reading from a local file.
pub type FileSource = ReaderSource<File>;

/// A [`ByteSource`] reading from memory.
pub type MemorySource<T> = ReaderSource<io::Cursor<T>>;

impl<R: Read + Seek> ReaderSource<R> {
    pub fn new(mut inner: R) -> io::Result<Self> {
        let len = inner.seek(SeekFrom::End(0))?;
        inner.seek(SeekFrom::Start(0))?;
        Ok(Self {
            inner: Some(inner),
            offset: 0,
            len,
        })
    }

    /// Total length of the source in bytes
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_none()
    }

    fn inner(&mut self) -> io::Result<&mut R> {
        self.inner
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "Source was already closed"))
    }
}

impl FileSource {
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref();
        debug!("Opening {}", path.display());
        Self::new(File::open(path)?)
    }
}

impl<T: AsRef<[u8]>> MemorySource<T> {
    pub fn from_bytes(bytes: T) -> Self {
        let len = bytes.as_ref().len() as u64;
        Self {
            inner: Some(io::Cursor::new(bytes)),
            offset: 0,
            len,
        }
    }
}

impl<R: Read + Seek> ByteSource for ReaderSource<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let inner = self.inner()?;
        let count = loop {
            match inner.read(buf) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                other => break other?,
            }
        };
        self.offset += count as u64;
        Ok(count)
    }

    fn skip(&mut self, count: u64) -> io::Result<u64> {
        let count = count.min(self.len.saturating_sub(self.offset));
        let target = self.offset + count;
        self.inner()?.seek(SeekFrom::Start(target))?;
        self.offset = target;
        Ok(count)
    }

    fn seek(&mut self, position: SeekFrom) -> io::Result<u64> {
        let new_offset = self.inner()?.seek(position)?;
        self.offset = new_offset;
        Ok(new_offset)
    }

    fn close(&mut self) -> io::Result<()> {
        if self.inner.take().is_some() {
            trace!("Closed source after {} of {} bytes", self.offset, self.len);
        }
        Ok(())
    }

    fn offset(&self) -> u64 {
        self.offset
    }
}
