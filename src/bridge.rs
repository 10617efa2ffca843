//! The pull interface a codec reads archive bytes through,
//! and the bridge that serves it from a [`ByteSource`] and a [`HeaderCache`].
//!
//! [`ByteSource`]: ../source/trait.ByteSource.html
//! [`HeaderCache`]: ../cache/trait.HeaderCache.html

use std::io::{self, SeekFrom};

use log::*;

use crate::cache::HeaderCache;
use crate::result::*;
use crate::source::ByteSource;

/// What a sequential codec pulls its input from.
///
/// Errors from these calls are fatal to the codec;
/// they already describe what went wrong, so the codec passes them up as-is.
pub trait PullSource {
    /// Returns the next chunk of archive bytes.
    /// An empty chunk means the end of the archive.
    /// The chunk is valid until the next call.
    fn pull_read(&mut self) -> ArchiveResult<&[u8]>;

    /// Skips up to `count` bytes, returning how many were skipped.
    /// A short (or zero) count isn't an error:
    /// the caller falls back to reading and discarding.
    fn pull_skip(&mut self, count: u64) -> u64;

    /// Moves to the given position, returning the new offset.
    fn pull_seek(&mut self, position: SeekFrom) -> ArchiveResult<u64>;

    /// Closes the underlying source.
    fn pull_close(&mut self) -> ArchiveResult<()>;
}

/// Serves a codec's pulls from a [`ByteSource`],
/// caching what it reads while the codec parses headers.
pub struct StreamBridge<S, C> {
    source: S,
    cache: C,
    /// Set while the codec reads headers; only those reads are cached.
    header_phase: bool,
    /// How much the next read should ask the source for
    chunk_hint: usize,
    buffer: Vec<u8>,
}

impl<S: ByteSource, C: HeaderCache> StreamBridge<S, C> {
    pub fn new(source: S, cache: C, chunk_hint: usize) -> Self {
        Self {
            source,
            cache,
            header_phase: false,
            chunk_hint,
            buffer: Vec::new(),
        }
    }

    /// Marks the following pulls as header reads (or not).
    pub fn set_header_phase(&mut self, header_phase: bool) {
        self.header_phase = header_phase;
    }

    pub fn is_header_phase(&self) -> bool {
        self.header_phase
    }

    /// Sets how many bytes the next read asks the source for.
    pub fn set_chunk_hint(&mut self, chunk_hint: usize) {
        self.chunk_hint = chunk_hint.max(1);
    }

    pub fn chunk_hint(&self) -> usize {
        self.chunk_hint
    }

    /// Moves the source back to the start of the archive.
    pub fn rewind(&mut self) -> ArchiveResult<()> {
        self.source
            .seek(SeekFrom::Start(0))
            .map_err(|e| ArchiveError::source_io("rewinding", e))?;
        Ok(())
    }

    /// Closes the source, unless it already was.
    pub fn close_source(&mut self) -> ArchiveResult<()> {
        self.source
            .close()
            .map_err(|e| ArchiveError::source_io("closing", e))
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn cache(&self) -> &C {
        &self.cache
    }
}

impl<S: ByteSource, C: HeaderCache> PullSource for StreamBridge<S, C> {
    fn pull_read(&mut self) -> ArchiveResult<&[u8]> {
        let offset = self.source.offset();

        if self.header_phase {
            if let Some(cached) = self.cache.lookup(offset).filter(|c| !c.is_empty()) {
                self.buffer.clear();
                self.buffer.extend_from_slice(cached);
                // Keep the source in step with what we hand back.
                let wanted = self.buffer.len() as u64;
                let skipped = self
                    .source
                    .skip(wanted)
                    .map_err(|e| ArchiveError::source_io("skipping over cached headers", e))?;
                if skipped != wanted {
                    return Err(ArchiveError::source_io(
                        "skipping over cached headers",
                        io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            format!("skipped {skipped} of {wanted} bytes at offset {offset}"),
                        ),
                    ));
                }
                trace!("{wanted} header bytes at {offset} served from cache");
                return Ok(self.buffer.as_slice());
            }
        }

        self.buffer.resize(self.chunk_hint, 0);
        let count = self
            .source
            .read(&mut self.buffer)
            .map_err(|e| ArchiveError::source_io("reading", e))?;
        self.buffer.truncate(count);
        trace!("Read {count} bytes at {offset}");

        if self.header_phase && count > 0 {
            self.cache.store(offset, &self.buffer);
        }
        Ok(self.buffer.as_slice())
    }

    fn pull_skip(&mut self, count: u64) -> u64 {
        match self.source.skip(count) {
            Ok(skipped) => skipped,
            Err(e) => {
                warn!("Couldn't skip {count} bytes, falling back to reads: {e}");
                0
            }
        }
    }

    fn pull_seek(&mut self, position: SeekFrom) -> ArchiveResult<u64> {
        self.source
            .seek(position)
            .map_err(|e| ArchiveError::source_io("seeking", e))
    }

    fn pull_close(&mut self) -> ArchiveResult<()> {
        self.close_source()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cache::{MemoryHeaderCache, NoHeaderCache};
    use crate::source::MemorySource;

    fn bytes() -> Vec<u8> {
        (0..64u8).collect()
    }

    #[test]
    fn reads_use_the_hint() {
        let mut bridge = StreamBridge::new(MemorySource::from_bytes(bytes()), NoHeaderCache, 10);
        assert_eq!(bridge.chunk_hint(), 10);
        assert_eq!(bridge.pull_read().unwrap(), &bytes()[..10]);
        bridge.set_chunk_hint(0);
        assert_eq!(bridge.chunk_hint(), 1);
        bridge.set_chunk_hint(50);
        assert_eq!(bridge.pull_read().unwrap(), &bytes()[10..60]);
        assert_eq!(bridge.pull_read().unwrap(), &bytes()[60..]);
        assert!(bridge.pull_read().unwrap().is_empty());
    }

    #[test]
    fn header_reads_are_cached_and_replayed() {
        let mut cache = MemoryHeaderCache::new();
        {
            let mut bridge =
                StreamBridge::new(MemorySource::from_bytes(bytes()), &mut cache, 16);
            assert!(!bridge.is_header_phase());
            bridge.set_header_phase(true);
            assert!(bridge.is_header_phase());
            assert_eq!(bridge.pull_read().unwrap(), &bytes()[..16]);
            // Data reads aren't cached.
            bridge.set_header_phase(false);
            assert_eq!(bridge.pull_read().unwrap(), &bytes()[16..32]);
            assert_eq!(bridge.cache().lookup(0), Some(&bytes()[..16]));
            assert!(bridge.cache().lookup(16).is_none());
        }
        assert_eq!(cache.len(), 1);

        // A fresh source with different contents proves the chunk came from the cache.
        let mut bridge =
            StreamBridge::new(MemorySource::from_bytes(vec![0xff; 64]), &mut cache, 4);
        bridge.set_header_phase(true);
        assert_eq!(bridge.pull_read().unwrap(), &bytes()[..16]);
        assert_eq!(bridge.source().offset(), 16);
        assert_eq!(bridge.pull_read().unwrap(), &[0xff; 4]);
    }

    #[test]
    fn cached_chunk_past_the_end_is_fatal() {
        let mut cache = MemoryHeaderCache::new();
        cache.store(0, &[1; 32]);
        let mut bridge = StreamBridge::new(MemorySource::from_bytes(vec![0; 8]), cache, 4);
        bridge.set_header_phase(true);
        match bridge.pull_read() {
            Err(ArchiveError::SourceIo { operation, .. }) => {
                assert_eq!(operation, "skipping over cached headers")
            }
            other => panic!("Expected a source error, got {:?}", other),
        }
    }

    #[test]
    fn seek_and_close() {
        let mut bridge = StreamBridge::new(MemorySource::from_bytes(bytes()), NoHeaderCache, 8);
        assert_eq!(bridge.pull_seek(SeekFrom::End(-4)).unwrap(), 60);
        assert_eq!(bridge.pull_skip(100), 4);
        bridge.rewind().unwrap();
        assert_eq!(bridge.source().offset(), 0);

        bridge.pull_close().unwrap();
        bridge.close_source().unwrap();
        assert!(matches!(
            bridge.pull_seek(SeekFrom::Start(0)),
            Err(ArchiveError::SourceIo { .. })
        ));
        assert!(matches!(
            bridge.pull_read(),
            Err(ArchiveError::SourceIo { .. })
        ));
        // Failed skips report zero rather than erroring.
        assert_eq!(bridge.pull_skip(3), 0);
    }
}
