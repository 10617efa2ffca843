//! Buffering between a codec and its [`PullSource`]
//!
//! [`PullSource`]: ../../bridge/trait.PullSource.html

use log::*;

use crate::arch::min_len;
use crate::bridge::PullSource;
use crate::result::*;

/// Bytes pulled from the source but not yet parsed or decoded.
#[derive(Debug, Default)]
pub struct InputBuffer {
    data: Vec<u8>,
    /// Start of the unconsumed bytes in `data`
    pos: usize,
    /// Archive offset of `data[pos]`
    offset: u64,
}

impl InputBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops everything buffered, e.g., after the source was seeked to `offset`.
    pub fn reset(&mut self, offset: u64) {
        self.data.clear();
        self.pos = 0;
        self.offset = offset;
    }

    /// Archive offset of the next unconsumed byte
    pub fn position(&self) -> u64 {
        self.offset
    }

    pub fn available(&self) -> &[u8] {
        &self.data[self.pos..]
    }

    pub fn consume(&mut self, count: usize) {
        assert!(count <= self.data.len() - self.pos);
        self.pos += count;
        self.offset += count as u64;
    }

    /// Pulls another chunk, returning its size (0 at the end of the archive).
    pub fn fill(&mut self, src: &mut dyn PullSource) -> ArchiveResult<usize> {
        if self.pos > 0 {
            self.data.drain(..self.pos);
            self.pos = 0;
        }
        let chunk = src.pull_read()?;
        self.data.extend_from_slice(chunk);
        Ok(chunk.len())
    }

    /// Pulls until at least `count` bytes are available.
    /// Returns false if the archive ends first.
    pub fn ensure(&mut self, src: &mut dyn PullSource, count: usize) -> ArchiveResult<bool> {
        while self.available().len() < count {
            if self.fill(src)? == 0 {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Like `ensure()`, but running out is an error.
    pub fn require(
        &mut self,
        src: &mut dyn PullSource,
        count: usize,
        what: &'static str,
    ) -> ArchiveResult<&[u8]> {
        if !self.ensure(src, count)? {
            return Err(ArchiveError::invalid(format!(
                "Archive ended in the middle of {what}"
            )));
        }
        Ok(&self.available()[..count])
    }

    /// Skips `count` bytes, preferring the source's skip over reading.
    pub fn skip(&mut self, src: &mut dyn PullSource, count: u64) -> ArchiveResult<()> {
        let buffered = min_len(count, self.available().len());
        self.consume(buffered);
        let mut left = count - buffered as u64;
        if left == 0 {
            return Ok(());
        }

        // Nothing's buffered at this point, so we can move the source directly.
        self.data.clear();
        self.pos = 0;
        let skipped = src.pull_skip(left).min(left);
        self.offset += skipped;
        left -= skipped;
        if left > 0 {
            debug!("Source skipped short, reading through {left} bytes");
        }

        while left > 0 {
            if self.fill(src)? == 0 {
                return Err(ArchiveError::invalid("Archive ended in the middle of a skip"));
            }
            let step = min_len(left, self.available().len());
            self.consume(step);
            left -= step as u64;
        }
        Ok(())
    }
}
