//! Caching of header bytes
//!
//! Archive metadata is read in small chunks, and every reinitialization
//! walks the headers again from the start of the archive.
//! When the byte source is slow, remembering those chunks by offset
//! saves a round trip each.
//! Entry data is never cached; only the bytes read while parsing headers are.

use std::collections::HashMap;

use log::*;

/// Remembers chunks of the archive by the offset they were read from.
///
/// Implementations may forget (or never keep) anything they like;
/// a miss only costs another read from the byte source.
pub trait HeaderCache {
    /// Returns the chunk previously stored at `offset`, if any.
    fn lookup(&self, offset: u64) -> Option<&[u8]>;

    /// Offers the chunk read at `offset`.
    fn store(&mut self, offset: u64, bytes: &[u8]);
}

impl<C: HeaderCache + ?Sized> HeaderCache for &mut C {
    fn lookup(&self, offset: u64) -> Option<&[u8]> {
        (**self).lookup(offset)
    }

    fn store(&mut self, offset: u64, bytes: &[u8]) {
        (**self).store(offset, bytes)
    }
}

impl<C: HeaderCache + ?Sized> HeaderCache for Box<C> {
    fn lookup(&self, offset: u64) -> Option<&[u8]> {
        (**self).lookup(offset)
    }

    fn store(&mut self, offset: u64, bytes: &[u8]) {
        (**self).store(offset, bytes)
    }
}

/// A cache that never remembers anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHeaderCache;

impl HeaderCache for NoHeaderCache {
    fn lookup(&self, _offset: u64) -> Option<&[u8]> {
        None
    }

    fn store(&mut self, _offset: u64, _bytes: &[u8]) {}
}

/// Keeps header chunks in memory up to a byte budget.
///
/// Once the budget is spent, new chunks are dropped on the floor;
/// nothing already cached is evicted.
#[derive(Debug)]
pub struct MemoryHeaderCache {
    chunks: HashMap<u64, Vec<u8>>,
    bytes: usize,
    budget: usize,
}

/// Default budget for a [`MemoryHeaderCache`]
pub const DEFAULT_HEADER_CACHE_BUDGET: usize = 16 * 1024 * 1024;

impl Default for MemoryHeaderCache {
    fn default() -> Self {
        Self::with_budget(DEFAULT_HEADER_CACHE_BUDGET)
    }
}

impl MemoryHeaderCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_budget(budget: usize) -> Self {
        Self {
            chunks: HashMap::new(),
            bytes: 0,
            budget,
        }
    }

    /// Number of cached chunks
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Total size of the cached chunks
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
        self.bytes = 0;
    }
}

impl HeaderCache for MemoryHeaderCache {
    fn lookup(&self, offset: u64) -> Option<&[u8]> {
        self.chunks.get(&offset).map(Vec::as_slice)
    }

    fn store(&mut self, offset: u64, bytes: &[u8]) {
        if bytes.is_empty() || self.chunks.contains_key(&offset) {
            return;
        }
        if self.bytes + bytes.len() > self.budget {
            trace!(
                "Header cache full ({} bytes), not caching {} bytes at {}",
                self.bytes,
                bytes.len(),
                offset
            );
            return;
        }
        self.bytes += bytes.len();
        self.chunks.insert(offset, bytes.to_vec());
    }
}
