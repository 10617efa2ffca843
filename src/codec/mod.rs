//! Sequential archive codecs
//!
//! A codec walks an archive strictly front to back:
//! it yields each entry's metadata, then (on request) that entry's decoded bytes.
//! It can't go backwards within an entry, nor jump to an arbitrary entry.
//! [`RandomAccessArchive`] builds random access on top of that.
//!
//! Codecs never own their input. Every call is handed the [`PullSource`]
//! to read from, so the caller can adjust how that source behaves
//! (header caching, chunk sizes) between calls.
//!
//! [`RandomAccessArchive`]: ../read/struct.RandomAccessArchive.html
//! [`PullSource`]: ../bridge/trait.PullSource.html

use std::fmt;

use camino::Utf8PathBuf;
use chrono::{NaiveDate, NaiveDateTime};
use log::*;
use memchr::memmem;

use crate::bridge::PullSource;
use crate::result::*;

mod input;
mod rar;
mod zip;

use input::InputBuffer;

/// Mask of the file type bits in a Unix mode
pub const S_IFMT: u32 = 0o170000;
/// Directory file type
pub const S_IFDIR: u32 = 0o040000;
/// Regular file type
pub const S_IFREG: u32 = 0o100000;
/// Symbolic link file type
pub const S_IFLNK: u32 = 0o120000;

/// Metadata of a file or directory in the archive, in archive order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// The path of the entry as stored in the archive
    pub path: Utf8PathBuf,

    /// Uncompressed size of the entry in bytes
    pub size: u64,

    /// Unix mode, including the file type bits
    pub mode: u32,

    /// When the entry was last modified (archive formats store local time)
    pub last_modified: NaiveDateTime,
}

impl Entry {
    /// Returns true if the entry's file type is a directory
    pub fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }

    /// Returns true if the entry's file type is a regular file
    pub fn is_file(&self) -> bool {
        self.mode & S_IFMT == S_IFREG
    }

    /// Permission bits of the entry
    pub fn permissions(&self) -> u32 {
        self.mode & 0o7777
    }
}

/// Default mode for an entry whose archive didn't record one
pub(crate) fn default_mode(is_dir: bool) -> u32 {
    if is_dir {
        S_IFDIR | 0o755
    } else {
        S_IFREG | 0o644
    }
}

/// Converts an MS-DOS timestamp, as used by both ZIP and RAR.
///
/// Invalid dates (like the all-zero timestamp some archivers write)
/// map to the DOS epoch.
pub(crate) fn parse_msdos(time: u16, date: u16) -> NaiveDateTime {
    let seconds = (0b0000_0000_0001_1111 & time) as u32 * 2; // MSDOS uses 2-second precision
    let minutes = (0b0000_0111_1110_0000 & time) as u32 >> 5;
    let hours = (0b1111_1000_0000_0000 & time) as u32 >> 11;

    let days = (0b0000_0000_0001_1111 & date) as u32;
    let months = (0b0000_0001_1110_0000 & date) as u32 >> 5;
    // MSDOS uses years since 1980; Always interpreted as a positive value
    let years = ((0b1111_1110_0000_0000 & date) >> 9) as i32 + 1980;

    NaiveDate::from_ymd_opt(years, months, days)
        .and_then(|d| d.and_hms_opt(hours, minutes, seconds))
        .unwrap_or_else(dos_epoch)
}

fn dos_epoch() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(1980, 1, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .unwrap_or_default()
}

/// Container formats a codec can be asked to support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    Zip,
    Rar,
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Format::Zip => f.write_str("ZIP"),
            Format::Rar => f.write_str("RAR"),
        }
    }
}

/// A forward-only archive decoder.
pub trait SequentialCodec {
    /// Enables reading the given format. Must be called before `open()`.
    fn support_format(&mut self, format: Format) -> ArchiveResult<()>;

    /// Reads whatever leading metadata the archive has.
    /// `src` is positioned at the start of the archive.
    fn open(&mut self, src: &mut dyn PullSource) -> ArchiveResult<()>;

    /// Moves to the next entry, skipping any unread data of the current one.
    /// Returns `None` at the end of the archive.
    fn next_entry(&mut self, src: &mut dyn PullSource) -> ArchiveResult<Option<Entry>>;

    /// Decodes the current entry's next bytes into `buf`,
    /// returning how many were written. Zero means the entry is done.
    fn read_data(&mut self, src: &mut dyn PullSource, buf: &mut [u8]) -> ArchiveResult<usize>;

    /// Drops all decoding state. The codec can't be used afterwards,
    /// but the source is left alone so it can be reused.
    fn release(&mut self) -> ArchiveResult<()> {
        Ok(())
    }

    /// Releases the codec, then closes the source.
    fn close(&mut self, src: &mut dyn PullSource) -> ArchiveResult<()> {
        self.release()?;
        src.pull_close()
    }
}

impl<K: SequentialCodec + ?Sized> SequentialCodec for Box<K> {
    fn support_format(&mut self, format: Format) -> ArchiveResult<()> {
        (**self).support_format(format)
    }

    fn open(&mut self, src: &mut dyn PullSource) -> ArchiveResult<()> {
        (**self).open(src)
    }

    fn next_entry(&mut self, src: &mut dyn PullSource) -> ArchiveResult<Option<Entry>> {
        (**self).next_entry(src)
    }

    fn read_data(&mut self, src: &mut dyn PullSource, buf: &mut [u8]) -> ArchiveResult<usize> {
        (**self).read_data(src, buf)
    }

    fn release(&mut self) -> ArchiveResult<()> {
        (**self).release()
    }

    fn close(&mut self, src: &mut dyn PullSource) -> ArchiveResult<()> {
        (**self).close(src)
    }
}

/// Makes fresh codecs, once per open and once per rewind.
pub trait CodecFactory {
    type Codec: SequentialCodec;

    fn create(&mut self) -> ArchiveResult<Self::Codec>;
}

impl<K, F> CodecFactory for F
where
    K: SequentialCodec,
    F: FnMut() -> ArchiveResult<K>,
{
    type Codec = K;

    fn create(&mut self) -> ArchiveResult<K> {
        self()
    }
}

/// The factory `RandomAccessArchive::new()` uses
pub type StreamingCodecFactory = fn() -> ArchiveResult<StreamingCodec>;

/// RAR 1.5 - 4.x marker block
const RAR_MAGIC: &[u8] = b"Rar!\x1a\x07\x00";
/// RAR 5 signature
const RAR5_MAGIC: &[u8] = b"Rar!\x1a\x07\x01\x00";

enum State {
    New,
    Zip(zip::ZipReader),
    Rar(rar::RarReader),
    Released,
}

/// The built-in codec: ZIP (stored and deflated entries)
/// and RAR 1.5 - 4.x (stored entries).
///
/// The format is sniffed from the first bytes of the archive.
pub struct StreamingCodec {
    formats: Vec<Format>,
    input: InputBuffer,
    state: State,
}

impl Default for StreamingCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamingCodec {
    pub fn new() -> Self {
        Self {
            formats: Vec::new(),
            input: InputBuffer::new(),
            state: State::New,
        }
    }

    /// Matches `StreamingCodecFactory`.
    pub fn create() -> ArchiveResult<Self> {
        Ok(Self::new())
    }

    /// The format of the opened archive
    pub fn format(&self) -> Option<Format> {
        match self.state {
            State::Zip(_) => Some(Format::Zip),
            State::Rar(_) => Some(Format::Rar),
            State::New | State::Released => None,
        }
    }

    /// Works out what we're looking at from its first bytes.
    ///
    /// Returns the format and, for RAR, where its marker block starts
    /// (self-extracting archives have an executable up front).
    fn sniff(&self, head: &[u8]) -> ArchiveResult<(Format, u64)> {
        if head.starts_with(RAR5_MAGIC) {
            return Err(ArchiveError::UnsupportedArchive(String::from(
                "RAR 5 archives aren't supported",
            )));
        }
        if head.starts_with(RAR_MAGIC) {
            return Ok((Format::Rar, 0));
        }
        if head.starts_with(b"PK") {
            return Ok((Format::Zip, 0));
        }
        if self.formats.contains(&Format::Rar) {
            if let Some(posit) = memmem::find(head, RAR_MAGIC) {
                debug!("RAR marker found after {posit} bytes of prefix");
                return Ok((Format::Rar, posit as u64));
            }
        }
        // ZIP archives can be prepended with anything;
        // the central directory at the back tells us where they start.
        Ok((Format::Zip, 0))
    }
}

impl SequentialCodec for StreamingCodec {
    fn support_format(&mut self, format: Format) -> ArchiveResult<()> {
        if !matches!(self.state, State::New) {
            return Err(ArchiveError::UnsupportedArchive(format!(
                "Can't add {format} support to an opened codec"
            )));
        }
        if !self.formats.contains(&format) {
            self.formats.push(format);
        }
        Ok(())
    }

    fn open(&mut self, src: &mut dyn PullSource) -> ArchiveResult<()> {
        if !matches!(self.state, State::New) {
            return Err(ArchiveError::UnsupportedArchive(String::from(
                "Codec was already opened",
            )));
        }
        if self.formats.is_empty() {
            return Err(ArchiveError::UnsupportedArchive(String::from(
                "No archive formats enabled",
            )));
        }

        self.input.reset(0);
        self.input.ensure(src, RAR5_MAGIC.len())?;
        let (format, start) = self.sniff(self.input.available())?;
        if !self.formats.contains(&format) {
            return Err(ArchiveError::UnsupportedArchive(format!(
                "{format} archives aren't enabled"
            )));
        }
        debug!("Opening {format} archive");

        self.state = match format {
            Format::Zip => State::Zip(zip::ZipReader::open(&mut self.input, src)?),
            Format::Rar => State::Rar(rar::RarReader::open(&mut self.input, src, start)?),
        };
        Ok(())
    }

    fn next_entry(&mut self, src: &mut dyn PullSource) -> ArchiveResult<Option<Entry>> {
        match &mut self.state {
            State::Zip(reader) => reader.next_entry(&mut self.input, src),
            State::Rar(reader) => reader.next_entry(&mut self.input, src),
            State::New | State::Released => Err(ArchiveError::NotOpen),
        }
    }

    fn read_data(&mut self, src: &mut dyn PullSource, buf: &mut [u8]) -> ArchiveResult<usize> {
        match &mut self.state {
            State::Zip(reader) => reader.read_data(&mut self.input, src, buf),
            State::Rar(reader) => reader.read_data(&mut self.input, src, buf),
            State::New | State::Released => Err(ArchiveError::NotOpen),
        }
    }

    fn release(&mut self) -> ArchiveResult<()> {
        self.state = State::Released;
        self.input.reset(0);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::bridge::StreamBridge;
    use crate::cache::NoHeaderCache;
    use crate::source::MemorySource;

    #[test]
    fn msdos_timestamps() {
        // 2021-06-15 12:30:10
        let time = (12 << 11) | (30 << 5) | 5;
        let date = ((2021 - 1980) << 9) | (6 << 5) | 15;
        let parsed = parse_msdos(time, date);
        assert_eq!(parsed.to_string(), "2021-06-15 12:30:10");

        assert_eq!(parse_msdos(0, 0).to_string(), "1980-01-01 00:00:00");
    }

    #[test]
    fn modes() {
        let mut entry = Entry {
            path: Utf8PathBuf::from("a/"),
            size: 0,
            mode: default_mode(true),
            last_modified: dos_epoch(),
        };
        assert!(entry.is_dir());
        assert!(!entry.is_file());
        assert_eq!(entry.permissions(), 0o755);

        entry.mode = S_IFLNK | 0o777;
        assert!(!entry.is_dir());
        assert!(!entry.is_file());
    }

    #[test]
    fn sniffing() {
        let mut codec = StreamingCodec::new();
        codec.support_format(Format::Zip).unwrap();
        codec.support_format(Format::Rar).unwrap();

        assert_eq!(codec.sniff(b"PK\x03\x04").unwrap(), (Format::Zip, 0));
        assert_eq!(codec.sniff(b"Rar!\x1a\x07\x00\xcf").unwrap(), (Format::Rar, 0));
        assert_eq!(
            codec.sniff(b"MZ\x90\x00stubRar!\x1a\x07\x00").unwrap(),
            (Format::Rar, 8)
        );
        assert_eq!(codec.sniff(b"MZ\x90\x00").unwrap(), (Format::Zip, 0));
        assert!(matches!(
            codec.sniff(b"Rar!\x1a\x07\x01\x00"),
            Err(ArchiveError::UnsupportedArchive(_))
        ));
    }

    #[test]
    fn format_follows_the_archive() {
        let mut empty_zip = b"PK\x05\x06".to_vec();
        empty_zip.extend_from_slice(&[0; 18]);
        let mut bridge = StreamBridge::new(MemorySource::from_bytes(empty_zip), NoHeaderCache, 64);

        let mut codec = StreamingCodec::new();
        assert_eq!(codec.format(), None);
        codec.support_format(Format::Zip).unwrap();
        codec.open(&mut bridge).unwrap();
        assert_eq!(codec.format(), Some(Format::Zip));
        assert!(codec.next_entry(&mut bridge).unwrap().is_none());

        codec.release().unwrap();
        assert_eq!(codec.format(), None);
        assert!(matches!(
            codec.next_entry(&mut bridge),
            Err(ArchiveError::NotOpen)
        ));
    }

    #[test]
    fn unregistered_formats_are_refused() {
        let mut rar = b"Rar!\x1a\x07\x00".to_vec();
        rar.extend_from_slice(&[0; 16]);
        let mut bridge = StreamBridge::new(MemorySource::from_bytes(rar), NoHeaderCache, 64);

        let mut codec = StreamingCodec::new();
        codec.support_format(Format::Zip).unwrap();
        match codec.open(&mut bridge) {
            Err(ArchiveError::UnsupportedArchive(message)) => assert!(message.contains("RAR")),
            other => panic!("Expected an unsupported archive, got {:?}", other.err()),
        }
        assert_eq!(codec.format(), None);
    }
}
