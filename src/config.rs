//! Chunk sizes that trade read amplification against per-call overhead.
//!
//! The exact values are tuning, not correctness:
//! everything that consults them goes through one [`Tuning`]
//! fixed for the lifetime of a [`RandomAccessArchive`].
//!
//! [`RandomAccessArchive`]: ../read/struct.RandomAccessArchive.html

use crate::result::*;

/// How much the byte source is asked for while reading headers.
/// Headers are small, and the source may be slow, so keep this modest.
pub const HEADER_CHUNK_SIZE: usize = 16 * 1024;

/// The smallest request made to the byte source while reading entry data.
pub const MINIMUM_DATA_CHUNK_SIZE: usize = 32 * 1024;

/// The largest request made to the byte source while reading entry data.
pub const MAXIMUM_DATA_CHUNK_SIZE: usize = 512 * 1024;

/// Size of the scratch buffer decoded bytes are thrown into
/// while fast-forwarding to a requested offset.
pub const DUMMY_BUFFER_SIZE: usize = 512 * 1024;

/// Capacity of the decompression window.
/// Bounds memory use no matter how much a single read asks for.
pub const DECOMPRESS_BUFFER_SIZE: usize = 512 * 1024;

/// The set of chunk sizes one archive instance works with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tuning {
    pub header_chunk_size: usize,
    pub minimum_data_chunk_size: usize,
    pub maximum_data_chunk_size: usize,
    pub dummy_buffer_size: usize,
    pub decompress_buffer_size: usize,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            header_chunk_size: HEADER_CHUNK_SIZE,
            minimum_data_chunk_size: MINIMUM_DATA_CHUNK_SIZE,
            maximum_data_chunk_size: MAXIMUM_DATA_CHUNK_SIZE,
            dummy_buffer_size: DUMMY_BUFFER_SIZE,
            decompress_buffer_size: DECOMPRESS_BUFFER_SIZE,
        }
    }
}

impl Tuning {
    pub fn header_chunk_size(self, size: usize) -> Self {
        Self {
            header_chunk_size: size,
            ..self
        }
    }

    pub fn data_chunk_sizes(self, minimum: usize, maximum: usize) -> Self {
        Self {
            minimum_data_chunk_size: minimum,
            maximum_data_chunk_size: maximum,
            ..self
        }
    }

    pub fn dummy_buffer_size(self, size: usize) -> Self {
        Self {
            dummy_buffer_size: size,
            ..self
        }
    }

    pub fn decompress_buffer_size(self, size: usize) -> Self {
        Self {
            decompress_buffer_size: size,
            ..self
        }
    }

    /// Checks that every size is usable.
    pub fn validate(&self) -> ArchiveResult<()> {
        let sizes = [
            ("header chunk size", self.header_chunk_size),
            ("minimum data chunk size", self.minimum_data_chunk_size),
            ("maximum data chunk size", self.maximum_data_chunk_size),
            ("dummy buffer size", self.dummy_buffer_size),
            ("decompress buffer size", self.decompress_buffer_size),
        ];
        if let Some((name, _)) = sizes.iter().find(|(_, size)| *size == 0) {
            return Err(ArchiveError::InvalidTuning(format!("{name} can't be zero")));
        }
        if self.minimum_data_chunk_size > self.maximum_data_chunk_size {
            return Err(ArchiveError::InvalidTuning(format!(
                "minimum data chunk size ({}) exceeds the maximum ({})",
                self.minimum_data_chunk_size, self.maximum_data_chunk_size
            )));
        }
        Ok(())
    }

    /// How much to ask the byte source for when `wanted` decoded bytes are needed:
    /// `wanted`, clamped to the data chunk bounds.
    pub fn data_chunk_size(&self, wanted: u64) -> usize {
        let wanted = usize::try_from(wanted).unwrap_or(usize::MAX);
        wanted.clamp(self.minimum_data_chunk_size, self.maximum_data_chunk_size)
    }
}
