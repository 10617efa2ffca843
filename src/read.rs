//! Random-access reads over a forward-only codec.
//!
//! To start reading an archive, create a [`RandomAccessArchive`] from a
//! [`ByteSource`] and a [`HeaderCache`], then `init()` it.
//! Entries are visited in archive order with `list_next_entry()`,
//! and the current entry can be read at any offset with `read_at()`.
//!
//! The codec underneath can only move forward, so:
//!
//! - A read ahead of where the codec is decodes (and throws away)
//!   everything in between.
//!
//! - A read behind it starts over: the codec is recreated, the source is
//!   rewound, and entries are listed again until the current one turns up.
//!   Header reads go through the cache, so this is cheap for slow sources
//!   as long as the cache holds onto them.
//!
//! Decoded bytes sit in a fixed-size window until they're handed out,
//! so memory use doesn't depend on how much a caller asks for.
//!
//! [`RandomAccessArchive`]: struct.RandomAccessArchive.html
//! [`ByteSource`]: ../source/trait.ByteSource.html
//! [`HeaderCache`]: ../cache/trait.HeaderCache.html

use std::ops::Range;

use log::*;

use crate::arch::min_len;
use crate::bridge::StreamBridge;
use crate::cache::HeaderCache;
use crate::codec::*;
use crate::config::Tuning;
use crate::result::*;
use crate::source::ByteSource;

/// Decoded bytes that haven't been handed to the caller yet.
///
/// The live bytes are `buffer[start..start + len]`.
struct Window {
    buffer: Box<[u8]>,
    start: usize,
    len: usize,
}

impl Window {
    fn new(capacity: usize) -> Self {
        Self {
            buffer: vec![0; capacity].into_boxed_slice(),
            start: 0,
            len: 0,
        }
    }

    fn capacity(&self) -> usize {
        self.buffer.len()
    }

    fn len(&self) -> usize {
        self.len
    }

    fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn clear(&mut self) {
        self.start = 0;
        self.len = 0;
    }

    /// Hands out the first `count` live bytes, returning where they are.
    fn take(&mut self, count: usize) -> Range<usize> {
        assert!(count <= self.len);
        let taken = self.start..self.start + count;
        self.start += count;
        self.len -= count;
        taken
    }

    /// Clears the window and returns all of it to be filled.
    fn refill(&mut self) -> &mut [u8] {
        self.clear();
        &mut self.buffer
    }

    fn set_filled(&mut self, len: usize) {
        assert!(len <= self.capacity());
        self.start = 0;
        self.len = len;
    }
}

/// Counters describing how reads were served.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReadStats {
    /// How many times the codec was recreated to read backwards
    pub reinitializations: u64,
    /// Decoded bytes thrown away while fast-forwarding
    pub discarded_bytes: u64,
    /// Reads served straight from the window
    pub window_hits: u64,
}

/// Random access into the entries of a ZIP or RAR archive,
/// built over a codec that only reads forward.
///
/// One instance serves one session over one archive.
/// Any failure (other than misuse, which panics) leaves the instance
/// unusable; drop it and make another, perhaps reusing the header cache.
pub struct RandomAccessArchive<S, C, F = StreamingCodecFactory>
where
    S: ByteSource,
    C: HeaderCache,
    F: CodecFactory,
{
    bridge: StreamBridge<S, C>,
    factory: F,
    codec: Option<F::Codec>,
    tuning: Tuning,
    current: Option<Entry>,
    /// How far into the current entry the codec has decoded.
    /// The window holds the bytes just before this.
    forward_offset: u64,
    /// Length of the last `read_at()`, used to guess the next one.
    last_requested_length: u64,
    window: Window,
    /// The first failure's message, once there's been one.
    poisoned: Option<String>,
    stats: ReadStats,
}

impl<S: ByteSource, C: HeaderCache> RandomAccessArchive<S, C> {
    /// Reads the archive with the built-in [`StreamingCodec`].
    ///
    /// [`StreamingCodec`]: ../codec/struct.StreamingCodec.html
    pub fn new(source: S, cache: C) -> Self {
        Self::with_codec(source, cache, StreamingCodec::create as StreamingCodecFactory)
    }
}

impl<S, C, F> RandomAccessArchive<S, C, F>
where
    S: ByteSource,
    C: HeaderCache,
    F: CodecFactory,
{
    /// Reads the archive with codecs made by `factory`.
    pub fn with_codec(source: S, cache: C, factory: F) -> Self {
        let tuning = Tuning::default();
        Self {
            bridge: StreamBridge::new(source, cache, tuning.header_chunk_size),
            factory,
            codec: None,
            tuning,
            current: None,
            forward_offset: 0,
            last_requested_length: 0,
            window: Window::new(tuning.decompress_buffer_size),
            poisoned: None,
            stats: ReadStats::default(),
        }
    }

    /// Replaces the default chunk sizes. Call before `init()`.
    pub fn with_tuning(mut self, tuning: Tuning) -> ArchiveResult<Self> {
        tuning.validate()?;
        self.bridge.set_chunk_hint(tuning.header_chunk_size);
        self.window = Window::new(tuning.decompress_buffer_size);
        self.tuning = tuning;
        Ok(self)
    }

    /// Creates the codec and opens the archive.
    pub fn init(&mut self) -> ArchiveResult<()> {
        self.check_poisoned()?;
        if self.codec.is_some() {
            warn!("Archive was already initialized");
            return Ok(());
        }
        let result = self.open_codec();
        self.record(result)
    }

    fn open_codec(&mut self) -> ArchiveResult<()> {
        let mut codec = self
            .factory
            .create()
            .map_err(|e| ArchiveError::init("create codec", e))?;
        codec
            .support_format(Format::Zip)
            .map_err(|e| ArchiveError::init("register ZIP support", e))?;
        codec
            .support_format(Format::Rar)
            .map_err(|e| ArchiveError::init("register RAR support", e))?;

        self.bridge.set_header_phase(true);
        self.bridge.set_chunk_hint(self.tuning.header_chunk_size);
        codec
            .open(&mut self.bridge)
            .map_err(|e| ArchiveError::init("open archive", e))?;
        self.codec = Some(codec);
        Ok(())
    }

    /// Moves to the next entry in the archive,
    /// returning `None` once there are no more.
    pub fn list_next_entry(&mut self) -> ArchiveResult<Option<Entry>> {
        self.check_poisoned()?;
        if self.codec.is_none() {
            return Err(ArchiveError::NotOpen);
        }
        let result = self.advance();
        self.record(result)
    }

    fn advance(&mut self) -> ArchiveResult<Option<Entry>> {
        let codec = self.codec.as_mut().ok_or(ArchiveError::NotOpen)?;

        self.bridge.set_header_phase(true);
        self.bridge.set_chunk_hint(self.tuning.header_chunk_size);
        self.forward_offset = 0;
        self.window.clear();
        self.current = None;

        self.current = codec
            .next_entry(&mut self.bridge)
            .map_err(|e| ArchiveError::codec("read the next entry header", e))?;
        match &self.current {
            Some(entry) => debug!("Now at {} ({} bytes)", entry.path, entry.size),
            None => debug!("End of archive"),
        }
        Ok(self.current.clone())
    }

    /// Reads up to `length` bytes of the current entry, starting at `offset`.
    ///
    /// Returns an empty slice at or past the end of the entry.
    /// The slice is valid until the next call.
    ///
    /// # Panics
    ///
    /// If `length` is zero or there's no current entry.
    pub fn read_at(&mut self, offset: u64, length: u64) -> ArchiveResult<&[u8]> {
        self.check_poisoned()?;
        assert!(length > 0, "read_at() needs a positive length");
        let size = match &self.current {
            Some(entry) => entry.size,
            None => panic!("read_at() called without a current entry"),
        };
        if offset >= size {
            return Ok(&[]);
        }
        self.last_requested_length = length;

        let window_start = self.forward_offset - self.window.len() as u64;
        if offset >= window_start && offset < self.forward_offset {
            // Drop what the caller skipped over.
            self.window.take((offset - window_start) as usize);
            self.stats.window_hits += 1;
            trace!("Serving {offset} from the window");
        } else {
            let result = self.decompress(offset, length);
            self.record(result)?;
        }

        let count = min_len(length, self.window.len());
        let taken = self.window.take(count);
        Ok(&self.window.buffer[taken])
    }

    /// Refills the window from where the last read left off,
    /// if it's been drained.
    ///
    /// Call between reads to overlap decoding with whatever the caller does
    /// with the last bytes. Failures aren't returned here;
    /// the next `read_at()` reports them.
    pub fn maybe_decompress_ahead(&mut self) {
        if self.poisoned.is_some()
            || self.codec.is_none()
            || !self.window.is_empty()
            || self.last_requested_length == 0
        {
            return;
        }
        match &self.current {
            Some(entry) if self.forward_offset < entry.size => {}
            _ => return,
        }
        let result = self.decompress(self.forward_offset, self.last_requested_length);
        if let Err(e) = result {
            self.poison(&e);
        }
    }

    /// Decodes the bytes at `offset` into the window.
    fn decompress(&mut self, offset: u64, length: u64) -> ArchiveResult<()> {
        // Data is never cached; only headers are.
        self.bridge.set_header_phase(false);

        let window_start = self.forward_offset - self.window.len() as u64;
        if offset < window_start {
            self.replay()?;
        }
        self.window.clear();
        self.skip_to(offset)?;
        self.fill_window(length)
    }

    /// Starts the archive over and lists entries until the current one turns up.
    ///
    /// Entries are matched by path; if the archive holds the same path twice,
    /// this finds the first.
    fn replay(&mut self) -> ArchiveResult<()> {
        let target = match &self.current {
            Some(entry) => entry.path.clone(),
            None => return Err(ArchiveError::NotOpen),
        };
        info!(
            "Rereading the archive to go back to offset {} of {}",
            self.forward_offset, target
        );

        if let Some(mut codec) = self.codec.take() {
            codec
                .release()
                .map_err(|e| ArchiveError::codec("release the codec", e))?;
        }
        self.bridge.rewind()?;
        self.stats.reinitializations += 1;
        self.open_codec()?;

        loop {
            match self.advance()? {
                Some(entry) if entry.path == target => break,
                Some(entry) => trace!("Passing {} on the way to {}", entry.path, target),
                None => {
                    return Err(ArchiveError::Consistency(format!(
                        "{target} was gone when rereading the archive"
                    )))
                }
            }
        }
        self.bridge.set_header_phase(false);
        Ok(())
    }

    /// Decodes and discards everything up to `offset`.
    fn skip_to(&mut self, offset: u64) -> ArchiveResult<()> {
        if offset <= self.forward_offset {
            return Ok(());
        }
        let codec = self.codec.as_mut().ok_or(ArchiveError::NotOpen)?;
        trace!("Skipping from {} to {}", self.forward_offset, offset);

        let mut scratch = vec![0; min_len(offset - self.forward_offset, self.tuning.dummy_buffer_size)];
        while self.forward_offset < offset {
            let gap = offset - self.forward_offset;
            self.bridge.set_chunk_hint(self.tuning.data_chunk_size(gap));
            let wanted = min_len(gap, scratch.len());
            let count = codec
                .read_data(&mut self.bridge, &mut scratch[..wanted])
                .map_err(|e| ArchiveError::codec("read entry data", e))?;
            if count == 0 {
                let path = self.current.as_ref().map(|e| e.path.as_str()).unwrap_or("");
                return Err(ArchiveError::Consistency(format!(
                    "{} ended at {} while skipping to {}",
                    path, self.forward_offset, offset
                )));
            }
            self.forward_offset += count as u64;
            self.stats.discarded_bytes += count as u64;
        }
        Ok(())
    }

    /// Decodes up to `length` bytes (or as many as the window holds).
    fn fill_window(&mut self, length: u64) -> ArchiveResult<()> {
        let codec = self.codec.as_mut().ok_or(ArchiveError::NotOpen)?;
        let wanted = min_len(length, self.window.capacity());
        self.bridge
            .set_chunk_hint(self.tuning.data_chunk_size(wanted as u64));

        let buffer = self.window.refill();
        let mut filled = 0;
        while filled < wanted {
            let count = codec
                .read_data(&mut self.bridge, &mut buffer[filled..wanted])
                .map_err(|e| ArchiveError::codec("read entry data", e))?;
            if count == 0 {
                break;
            }
            filled += count;
        }
        self.window.set_filled(filled);
        self.forward_offset += filled as u64;
        Ok(())
    }

    /// Closes the codec, then the source.
    ///
    /// The source is closed even if closing the codec fails;
    /// the first failure is returned. Calling this again does nothing.
    pub fn cleanup(&mut self) -> ArchiveResult<()> {
        let mut first_error = None;
        if let Some(mut codec) = self.codec.take() {
            if let Err(e) = codec.close(&mut self.bridge) {
                warn!("Couldn't close the codec: {e}");
                first_error = Some(e);
            }
        }
        if let Err(e) = self.bridge.close_source() {
            warn!("Couldn't close the source: {e}");
            if first_error.is_none() {
                first_error = Some(e);
            }
        }

        self.current = None;
        self.window.clear();
        self.forward_offset = 0;
        self.last_requested_length = 0;
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// The entry `read_at()` reads from
    pub fn current_entry(&self) -> Option<&Entry> {
        self.current.as_ref()
    }

    pub fn stats(&self) -> ReadStats {
        self.stats
    }

    pub fn tuning(&self) -> &Tuning {
        &self.tuning
    }

    /// The message of the failure that made this instance unusable
    pub fn last_error(&self) -> Option<&str> {
        self.poisoned.as_deref()
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.is_some()
    }

    pub fn source(&self) -> &S {
        self.bridge.source()
    }

    fn check_poisoned(&self) -> ArchiveResult<()> {
        match &self.poisoned {
            Some(message) => Err(ArchiveError::Poisoned(message.clone())),
            None => Ok(()),
        }
    }

    fn poison(&mut self, error: &ArchiveError) {
        let message = error.to_string();
        error!("{message}");
        if self.poisoned.is_none() {
            self.poisoned = Some(message);
        }
    }

    fn record<T>(&mut self, result: ArchiveResult<T>) -> ArchiveResult<T> {
        if let Err(e) = &result {
            self.poison(e);
        }
        result
    }
}

impl<S, C, F> Drop for RandomAccessArchive<S, C, F>
where
    S: ByteSource,
    C: HeaderCache,
    F: CodecFactory,
{
    fn drop(&mut self) {
        if let Err(e) = self.cleanup() {
            warn!("Cleanup failed while dropping the archive: {e}");
        }
    }
}
