//! Helper module to verify a CRC32 checksum of decoded entry data
//!
//! Follows the approach of zip-rs's `Crc32Reader`:
//! <https://github.com/mvdnes/zip-rs/commit/b3c836d9c32efa120cdd5366280f940d3c3b985c>
//! but is fed decoded chunks instead of wrapping a reader.

use crc32fast::Hasher;

use crate::result::*;

/// Running checksum of an entry's decoded bytes.
pub struct Crc32Check {
    hasher: Hasher,
    provided_checksum: u32,
}

impl Crc32Check {
    pub fn new(provided_checksum: u32) -> Crc32Check {
        Crc32Check {
            hasher: Hasher::new(),
            provided_checksum,
        }
    }

    pub fn update(&mut self, decoded: &[u8]) {
        self.hasher.update(decoded);
    }

    /// Replaces the expected checksum,
    /// for formats that only store it after the data.
    pub fn set_provided_checksum(&mut self, provided_checksum: u32) {
        self.provided_checksum = provided_checksum;
    }

    /// Returns true if the checksum so far matches the one provided
    fn check_matches(&self) -> bool {
        self.provided_checksum == self.hasher.clone().finalize()
    }

    /// Called once all of `name`'s bytes have been decoded.
    pub fn verify(&self, name: &str) -> ArchiveResult<()> {
        if cfg!(feature = "check-crc") && !self.check_matches() {
            return Err(ArchiveError::InvalidArchive(
                format!("Invalid checksum for {name}").into(),
            ));
        }
        Ok(())
    }
}
