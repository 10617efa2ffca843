//! Code specific to the ZIP file format specification.
//!
//! Entries are walked through their local file headers, front to back,
//! so they can be decoded as a stream.
//! The central directory at the back is read first (when the source can seek there)
//! since it's the only reliable record of sizes for entries written
//! with trailing data descriptors, and of Unix modes.
//!
//! Most comments quote the ZIP spec, [`APPNOTE.TXT`].
//!
//! [`APPNOTE.TXT`]: https://pkware.cachefly.net/webdocs/APPNOTE/APPNOTE-6.3.6.TXT

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::convert::TryInto;
use std::io::SeekFrom;

use camino::Utf8PathBuf;
use codepage_437::*;
use flate2::{Decompress, FlushDecompress, Status};
use log::*;
use memchr::memmem;

use super::input::InputBuffer;
use super::{default_mode, parse_msdos, Entry, S_IFMT};
use crate::arch::{min_len, usize};
use crate::bridge::PullSource;
use crate::crc::Crc32Check;
use crate::result::*;

// Magic numbers denoting various sections of a ZIP archive

/// End of central directory magic number
const EOCDR_MAGIC: [u8; 4] = [b'P', b'K', 5, 6];
/// Zip64 end of central directory magic number
const ZIP64_EOCDR_MAGIC: [u8; 4] = [b'P', b'K', 6, 6];
/// Zip64 end of central directory locator magic number
const ZIP64_EOCDR_LOCATOR_MAGIC: [u8; 4] = [b'P', b'K', 6, 7];
/// Central directory magic number
const CENTRAL_DIRECTORY_MAGIC: [u8; 4] = [b'P', b'K', 1, 2];
/// Local file header magic number
const LOCAL_FILE_HEADER_MAGIC: [u8; 4] = [b'P', b'K', 3, 4];
/// Data descriptor magic number (optional, but nearly universal)
const DATA_DESCRIPTOR_MAGIC: [u8; 4] = [b'P', b'K', 7, 8];
/// Written in front of single-segment archives that were once meant to be split
const SPANNING_MARKER: [u8; 4] = [b'P', b'K', b'0', b'0'];

const EOCDR_SIZE: usize = 22;
const LOCAL_FILE_HEADER_SIZE: usize = 30;
const CENTRAL_DIRECTORY_ENTRY_SIZE: usize = 46;
/// How much of an archive comment we expect before searching further back
const SHORT_COMMENT: usize = 1024;

/// The compression method used to store a file
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum CompressionMethod {
    /// The file is uncompressed
    None,
    /// The file is [DEFLATE](https://en.wikipedia.org/wiki/DEFLATE)d.
    /// This is the most common format used by ZIP archives.
    Deflate,
    /// The file is compressed with a yet-unsupported format.
    /// (The u16 indicates the internal format code.)
    Unsupported(u16),
}

impl CompressionMethod {
    fn from_u16(u: u16) -> Self {
        match u {
            0 => CompressionMethod::None,
            8 => CompressionMethod::Deflate,
            v => CompressionMethod::Unsupported(v),
        }
    }
}

/// The OS a file in the archive was compressed with.
/// Used to decode additional metadata like permissions
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum System {
    Dos,
    Unix,
    Unknown,
}

impl System {
    fn from_source_version(source_version: u16) -> Self {
        // 4.4.2.1 The upper byte indicates the compatibility of the file
        // attribute information.  If the external file attributes
        // are compatible with MS-DOS and can be read by PKZIP for
        // DOS version 2.04g then this value will be zero.  If these
        // attributes are not compatible, then this value will
        // identify the host system on which the attributes are
        // compatible.
        //
        // 4.4.2.2 The current mappings are:
        //
        //  0 - MS-DOS and OS/2 (FAT / VFAT / FAT32 file systems)
        //  3 - UNIX                     10 - Windows NTFS
        //  19 - OS X (Darwin)            (and others we don't care about)
        match source_version >> 8 {
            0 | 10 | 14 => System::Dos,
            3 | 19 => System::Unix,
            _ => System::Unknown,
        }
    }
}

// Straight from the Rust docs:

/// Reads a little-endian u64 from the front of the provided slice, shrinking it.
fn read_u64(input: &mut &[u8]) -> u64 {
    let (int_bytes, rest) = input.split_at(std::mem::size_of::<u64>());
    *input = rest;
    u64::from_le_bytes(int_bytes.try_into().expect("less than eight bytes for u64"))
}

/// Reads a little-endian u32 from the front of the provided slice, shrinking it.
fn read_u32(input: &mut &[u8]) -> u32 {
    let (int_bytes, rest) = input.split_at(std::mem::size_of::<u32>());
    *input = rest;
    u32::from_le_bytes(int_bytes.try_into().expect("less than four bytes for u32"))
}

/// Reads a little-endian u16 from the front of the provided slice, shrinking it.
fn read_u16(input: &mut &[u8]) -> u16 {
    let (int_bytes, rest) = input.split_at(std::mem::size_of::<u16>());
    *input = rest;
    u16::from_le_bytes(int_bytes.try_into().expect("less than two bytes for u16"))
}

/// Data from the End of central directory record
///
/// Found at the back of the ZIP archive and provides offsets for finding
/// its central directory, along with lots of stuff that stopped being relevant
/// when we stopped breaking ZIP archives onto multiple floppies.
#[derive(Debug)]
struct EndOfCentralDirectory {
    disk_number: u16,
    disk_with_central_directory: u16,
    entries_on_this_disk: u16,
    entries: u16,
    central_directory_size: u32,
    central_directory_offset: u32,
}

impl EndOfCentralDirectory {
    fn parse(mut eocdr: &[u8]) -> ArchiveResult<Self> {
        // 4.3.16  End of central directory record:
        //
        // end of central dir signature    4 bytes  (0x06054b50)
        // number of this disk             2 bytes
        // number of the disk with the
        // start of the central directory  2 bytes
        // total number of entries in
        // the central dir on this disk    2 bytes
        // total number of entries in
        // the central dir                 2 bytes
        // size of the central directory   4 bytes
        // offset of start of central
        // directory with respect to
        // the starting disk number        4 bytes
        // zipfile comment length          2 bytes
        //
        // (We don't care about the comment that follows.)
        if eocdr.len() < EOCDR_SIZE {
            return Err(ArchiveError::invalid(
                "Truncated End Of Central Directory Record",
            ));
        }
        // Assert the magic instead of checking for it
        // because the search should have found it.
        assert_eq!(eocdr[..4], EOCDR_MAGIC);
        eocdr = &eocdr[4..];
        let disk_number = read_u16(&mut eocdr);
        let disk_with_central_directory = read_u16(&mut eocdr);
        let entries_on_this_disk = read_u16(&mut eocdr);
        let entries = read_u16(&mut eocdr);
        let central_directory_size = read_u32(&mut eocdr);
        let central_directory_offset = read_u32(&mut eocdr);

        Ok(Self {
            disk_number,
            disk_with_central_directory,
            entries_on_this_disk,
            entries,
            central_directory_size,
            central_directory_offset,
        })
    }
}

/// Searches backward through the tail of the archive to find the
/// End of central directory record.
///
/// It should be right at the end of the file,
/// but its variable size means we can't jump to a known offset.
fn find_eocdr(tail: &[u8]) -> Option<usize> {
    memmem::rfind(tail, &EOCDR_MAGIC)
}

/// Data from the Zip64 end of central directory locator
///
/// This should immediately precede the End of central directory record
/// on Zip64 files and tell us where to find the Zip64 end of central directory record.
#[derive(Debug)]
struct Zip64EndOfCentralDirectoryLocator {
    disk_with_central_directory: u32,
    zip64_eocdr_offset: u64,
    disks: u32,
}

impl Zip64EndOfCentralDirectoryLocator {
    fn parse(mut locator: &[u8]) -> Option<Self> {
        // 4.3.15 Zip64 end of central directory locator
        //
        // zip64 end of central dir locator
        // signature                       4 bytes  (0x07064b50)
        // number of the disk with the
        // start of the zip64 end of
        // central directory               4 bytes
        // relative offset of the zip64
        // end of central directory record 8 bytes
        // total number of disks           4 bytes
        if locator.len() < Self::size_in_file() || locator[..4] != ZIP64_EOCDR_LOCATOR_MAGIC {
            return None;
        }
        locator = &locator[4..];
        let disk_with_central_directory = read_u32(&mut locator);
        let zip64_eocdr_offset = read_u64(&mut locator);
        let disks = read_u32(&mut locator);

        Some(Self {
            disk_with_central_directory,
            zip64_eocdr_offset,
            disks,
        })
    }

    fn size_in_file() -> usize {
        20
    }
}

/// Data from the Zip64 end of central directory record
#[derive(Debug)]
struct Zip64EndOfCentralDirectory {
    disk_number: u32,
    disk_with_central_directory: u32,
    entries_on_this_disk: u64,
    entries: u64,
    central_directory_size: u64,
    central_directory_offset: u64,
}

impl Zip64EndOfCentralDirectory {
    fn parse(mut eocdr: &[u8]) -> ArchiveResult<Self> {
        // 4.3.14  Zip64 end of central directory record
        //
        // zip64 end of central dir
        // signature                       4 bytes  (0x06064b50)
        // size of zip64 end of central
        // directory record                8 bytes
        // version made by                 2 bytes
        // version needed to extract       2 bytes
        // number of this disk             4 bytes
        // number of the disk with the
        // start of the central directory  4 bytes
        // total number of entries in the
        // central directory on this disk  8 bytes
        // total number of entries in the
        // central directory               8 bytes
        // size of the central directory   8 bytes
        // offset of start of central
        // directory with respect to
        // the starting disk number        8 bytes
        // zip64 extensible data sector    (variable size)
        if eocdr.len() < Self::fixed_size_in_file() {
            return Err(ArchiveError::invalid(
                "Truncated Zip64 End Of Central Directory Record",
            ));
        }
        // Assert the magic instead of checking for it
        // because the search should have found it.
        assert_eq!(eocdr[..4], ZIP64_EOCDR_MAGIC);
        eocdr = &eocdr[4..];
        let eocdr_size = read_u64(&mut eocdr);
        let _source_version = read_u16(&mut eocdr);
        let _minimum_extract_version = read_u16(&mut eocdr);
        let disk_number = read_u32(&mut eocdr);
        let disk_with_central_directory = read_u32(&mut eocdr);
        let entries_on_this_disk = read_u64(&mut eocdr);
        let entries = read_u64(&mut eocdr);
        let central_directory_size = read_u64(&mut eocdr);
        let central_directory_offset = read_u64(&mut eocdr);

        // 4.3.14.1 The value stored into the "size of zip64 end of central
        // directory record" SHOULD be the size of the remaining
        // record and SHOULD NOT include the leading 12 bytes.
        //
        // Size = SizeOfFixedFields + SizeOfVariableData - 12.
        let eocdr_size = usize(eocdr_size)?
            .checked_add(12)
            .filter(|size| *size >= Self::fixed_size_in_file())
            .ok_or(ArchiveError::invalid(
                "Invalid extensible data length in Zip64 End Of Central Directory Record",
            ))?;
        // We should be left with just the extensible data:
        let extensible_data_length = eocdr_size - Self::fixed_size_in_file();
        if eocdr.len() != extensible_data_length {
            return Err(ArchiveError::invalid(
                "Invalid extensible data length in Zip64 End Of Central Directory Record",
            ));
        }

        Ok(Self {
            disk_number,
            disk_with_central_directory,
            entries_on_this_disk,
            entries,
            central_directory_size,
            central_directory_offset,
        })
    }

    fn fixed_size_in_file() -> usize {
        56
    }
}

/// Finds the Zip64 end of central directory record in the given slice.
///
/// The slice should start at the Zip64 EOCDR's nominal location,
/// but we might have to do some searching since ZIP archives can have
/// arbitrary junk up front.
fn find_zip64_eocdr(space: &[u8]) -> ArchiveResult<usize> {
    memmem::find(space, &ZIP64_EOCDR_MAGIC).ok_or(ArchiveError::invalid(
        "Couldn't find zip64 End Of Central Directory Record",
    ))
}

/// Data from a central directory entry
///
/// Each of these records contians information about a file or folder
/// stored in the ZIP archive.
#[derive(Debug)]
struct CentralDirectoryEntry<'a> {
    source_version: u16,
    flags: u16,
    compression_method: u16,
    crc32: u32,
    compressed_size: u32,
    uncompressed_size: u32,
    disk_number: u16,
    external_file_attributes: u32,
    header_offset: u32,
    path: &'a [u8],
    extra_field: &'a [u8],
}

impl<'a> CentralDirectoryEntry<'a> {
    fn parse_and_consume(entry: &mut &'a [u8]) -> ArchiveResult<Self> {
        // 4.3.12  Central directory structure:
        //
        //   central file header signature   4 bytes  (0x02014b50)
        //   version made by                 2 bytes
        //   version needed to extract       2 bytes
        //   general purpose bit flag        2 bytes
        //   compression method              2 bytes
        //   last mod file time              2 bytes
        //   last mod file date              2 bytes
        //   crc-32                          4 bytes
        //   compressed size                 4 bytes
        //   uncompressed size               4 bytes
        //   file name length                2 bytes
        //   extra field length              2 bytes
        //   file comment length             2 bytes
        //   disk number start               2 bytes
        //   internal file attributes        2 bytes
        //   external file attributes        4 bytes
        //   relative offset of local header 4 bytes
        //
        //   file name (variable size)
        //   extra field (variable size)
        //   file comment (variable size)
        if entry.len() < CENTRAL_DIRECTORY_ENTRY_SIZE {
            return Err(ArchiveError::invalid("Truncated central directory"));
        }
        if entry[..4] != CENTRAL_DIRECTORY_MAGIC {
            return Err(ArchiveError::invalid("Invalid central directory entry"));
        }
        *entry = &entry[4..];
        let source_version = read_u16(entry);
        let _minimum_extract_version = read_u16(entry);
        let flags = read_u16(entry);
        let compression_method = read_u16(entry);
        let _last_modified_time = read_u16(entry);
        let _last_modified_date = read_u16(entry);
        let crc32 = read_u32(entry);
        let compressed_size = read_u32(entry);
        let uncompressed_size = read_u32(entry);
        let path_length = read_u16(entry) as usize;
        let extra_field_length = read_u16(entry) as usize;
        let file_comment_length = read_u16(entry) as usize;
        let disk_number = read_u16(entry);
        let _internal_file_attributes = read_u16(entry);
        let external_file_attributes = read_u32(entry);
        let header_offset = read_u32(entry);
        if entry.len() < path_length + extra_field_length + file_comment_length {
            return Err(ArchiveError::invalid("Truncated central directory"));
        }
        let (path, remaining) = entry.split_at(path_length);
        let (extra_field, remaining) = remaining.split_at(extra_field_length);
        let (_file_comment, remaining) = remaining.split_at(file_comment_length);
        *entry = remaining;

        Ok(Self {
            source_version,
            flags,
            compression_method,
            crc32,
            compressed_size,
            uncompressed_size,
            disk_number,
            external_file_attributes,
            header_offset,
            path,
            extra_field,
        })
    }
}

/// Data from a local file header
///
/// Each files' actual contents is preceded by this header.
/// These headers allow for "streaming" decompression without
/// the use of the central directory, which is exactly what we're doing.
#[derive(Debug)]
struct LocalFileHeader<'a> {
    flags: u16,
    compression_method: u16,
    last_modified_time: u16,
    last_modified_date: u16,
    crc32: u32,
    compressed_size: u32,
    uncompressed_size: u32,
    path: &'a [u8],
    extra_field: &'a [u8],
}

impl<'a> LocalFileHeader<'a> {
    /// Lengths of the variable fields, given the fixed-size part of the header
    fn variable_length(fixed: &[u8]) -> usize {
        let mut lengths = &fixed[26..LOCAL_FILE_HEADER_SIZE];
        read_u16(&mut lengths) as usize + read_u16(&mut lengths) as usize
    }

    fn parse(mut header: &'a [u8]) -> Self {
        // 4.3.7  Local file header:
        //
        // local file header signature     4 bytes  (0x04034b50)
        // version needed to extract       2 bytes
        // general purpose bit flag        2 bytes
        // compression method              2 bytes
        // last mod file time              2 bytes
        // last mod file date              2 bytes
        // crc-32                          4 bytes
        // compressed size                 4 bytes
        // uncompressed size               4 bytes
        // file name length                2 bytes
        // extra field length              2 bytes
        //
        // file name (variable size)
        // extra field (variable size)
        assert_eq!(header[..4], LOCAL_FILE_HEADER_MAGIC);
        header = &header[4..];
        let _minimum_extract_version = read_u16(&mut header);
        let flags = read_u16(&mut header);
        let compression_method = read_u16(&mut header);
        let last_modified_time = read_u16(&mut header);
        let last_modified_date = read_u16(&mut header);
        let crc32 = read_u32(&mut header);
        let compressed_size = read_u32(&mut header);
        let uncompressed_size = read_u32(&mut header);
        let path_length = read_u16(&mut header) as usize;
        let extra_field_length = read_u16(&mut header) as usize;
        let (path, remaining) = header.split_at(path_length);
        let extra_field = &remaining[..extra_field_length];

        Self {
            flags,
            compression_method,
            last_modified_time,
            last_modified_date,
            crc32,
            compressed_size,
            uncompressed_size,
            path,
            extra_field,
        }
    }
}

/// Extracts the "is this text UTF-8?" bit from the 16-bit flags field.
///
/// If false, text is assumped to be CP437.
fn is_utf8(flags: u16) -> bool {
    // Bit 11: Language encoding flag (EFS).  If this bit is set,
    //         the filename and comment fields for this file
    //         MUST be encoded using UTF-8. (see APPENDIX D)
    flags & (1 << 11) != 0
}

/// Extracts the "is this file encrypted?" bit from the 16-bit flags field.
fn is_encrypted(flags: u16) -> bool {
    // Bit 0: If set, indicates that the file is encrypted
    flags & 1 != 0
}

/// Extracts the "sizes come after the data" bit from the 16-bit flags field.
fn has_data_descriptor(flags: u16) -> bool {
    // Bit 3: If this bit is set, the fields crc-32, compressed
    //        size and uncompressed size are set to zero in the
    //        local header.  The correct values are put in the
    //        data descriptor immediately following the compressed
    //        data.
    flags & (1 << 3) != 0
}

fn decode_path(raw: &[u8], flags: u16) -> ArchiveResult<Utf8PathBuf> {
    let path: Cow<str> = if is_utf8(flags) {
        Cow::Borrowed(std::str::from_utf8(raw)?)
    } else {
        Cow::borrow_from_cp437(raw, &CP437_CONTROL)
    };
    Ok(Utf8PathBuf::from(path.into_owned()))
}

/// Sizes that may be overridden by a Zip64 extra field
struct Sizes {
    size: u64,
    compressed_size: u64,
    header_offset: u64,
}

/// Parses the "extra fields" found in central directory entries
/// and local file headers.
///
/// Currently we just look for Zip64 info (64-bit values for files > 2^32 in size),
/// returning whether any was found.
fn parse_extra_field(sizes: &mut Sizes, mut extra_field: &[u8], local: bool) -> ArchiveResult<bool> {
    // 4.5.1 In order to allow different programs and different types
    // of information to be stored in the 'extra' field in .ZIP
    // files, the following structure MUST be used for all
    // programs storing data in this field:
    //
    //     header1+data1 + header2+data2 . . .
    //
    // Each header MUST consist of:
    //
    //     Header ID - 2 bytes
    //     Data Size - 2 bytes
    let mut zip64 = false;
    while extra_field.len() >= 4 {
        let kind = read_u16(&mut extra_field);
        let field_len = read_u16(&mut extra_field) as usize;
        if field_len > extra_field.len() {
            return Err(ArchiveError::invalid("Extra field runs past its header"));
        }
        let (mut field, rest) = extra_field.split_at(field_len);
        extra_field = rest;

        // Zip64 extended information extra field
        if kind != 0x0001 {
            continue;
        }
        zip64 = true;
        if local && field.len() >= 16 {
            // 4.5.3 This entry in the Local header MUST
            // include BOTH original and compressed file size fields.
            sizes.size = read_u64(&mut field);
            sizes.compressed_size = read_u64(&mut field);
            continue;
        }
        if sizes.size == u32::MAX as u64 && field.len() >= 8 {
            sizes.size = read_u64(&mut field);
        }
        if sizes.compressed_size == u32::MAX as u64 && field.len() >= 8 {
            sizes.compressed_size = read_u64(&mut field);
        }
        if sizes.header_offset == u32::MAX as u64 && field.len() >= 8 {
            sizes.header_offset = read_u64(&mut field);
        }
    }
    Ok(zip64)
}

/// What the central directory says about an entry
#[derive(Debug)]
struct CentralRecord {
    compression_method: u16,
    crc32: u32,
    size: u64,
    compressed_size: u64,
    /// Unix mode, if the file was archived in a Unix OS.
    unix_mode: Option<u32>,
    /// The DOS directory attribute
    dos_directory: bool,
}

impl CentralRecord {
    /// Returns the record and the (nominal) offset of its local header.
    fn from_cde(cde: &CentralDirectoryEntry) -> ArchiveResult<(u64, Self)> {
        if cde.disk_number != 0 {
            return Err(ArchiveError::UnsupportedArchive(format!(
                "No support for multi-disk archives: file {} claims to be on disk {}",
                decode_path(cde.path, cde.flags)?,
                cde.disk_number,
            )));
        }

        let mut sizes = Sizes {
            size: cde.uncompressed_size as u64,
            compressed_size: cde.compressed_size as u64,
            header_offset: cde.header_offset as u64,
        };
        parse_extra_field(&mut sizes, cde.extra_field, false)?;

        let system = System::from_source_version(cde.source_version);
        let unix_mode = match system {
            System::Unix => Some(cde.external_file_attributes >> 16).filter(|m| m & S_IFMT != 0),
            System::Dos | System::Unknown => None,
        };
        let dos_directory = system == System::Dos && cde.external_file_attributes & 0x10 != 0;

        Ok((
            sizes.header_offset,
            Self {
                compression_method: cde.compression_method,
                crc32: cde.crc32,
                size: sizes.size,
                compressed_size: sizes.compressed_size,
                unix_mode,
                dos_directory,
            },
        ))
    }
}

/// Seeks to `start` and reads `len` bytes.
fn read_range(
    input: &mut InputBuffer,
    src: &mut dyn PullSource,
    start: u64,
    len: u64,
    what: &'static str,
) -> ArchiveResult<Vec<u8>> {
    src.pull_seek(SeekFrom::Start(start))?;
    input.reset(start);
    let len = usize(len)?;
    let bytes = input.require(src, len, what)?.to_vec();
    input.consume(len);
    Ok(bytes)
}

/// The central directory, keyed by the actual offset of each local header,
/// along with where the archive starts.
type Directory = (BTreeMap<u64, CentralRecord>, u64);

/// Reads the central directory from the back of the archive.
///
/// Returns `None` if there's no End of central directory record to be found.
fn load_central_directory(
    input: &mut InputBuffer,
    src: &mut dyn PullSource,
) -> ArchiveResult<Option<Directory>> {
    let len = src.pull_seek(SeekFrom::End(0))?;
    if len < EOCDR_SIZE as u64 {
        return Ok(None);
    }

    // The record is followed by a comment of up to 64K,
    // and (for Zip64) preceded by the locator.
    // Most comments are short (or missing), so look near the end first.
    let max_tail = (EOCDR_SIZE
        + u16::MAX as usize
        + Zip64EndOfCentralDirectoryLocator::size_in_file()) as u64;
    let short_tail = (EOCDR_SIZE + SHORT_COMMENT + Zip64EndOfCentralDirectoryLocator::size_in_file())
        as u64;

    let mut tail_len = len.min(short_tail);
    let (tail_start, tail, eocdr_posit) = loop {
        let tail_start = len - tail_len;
        let tail = read_range(input, src, tail_start, tail_len, "the archive trailer")?;
        if let Some(posit) = find_eocdr(&tail) {
            break (tail_start, tail, posit);
        }
        if tail_len == len.min(max_tail) {
            return Ok(None);
        }
        tail_len = len.min(max_tail);
    };
    let eocdr = EndOfCentralDirectory::parse(&tail[eocdr_posit..])?;
    trace!("{:?}", eocdr);

    if eocdr.disk_number != eocdr.disk_with_central_directory {
        return Err(ArchiveError::UnsupportedArchive(format!(
            "No support for multi-disk archives: disk ({}) != disk with central directory ({})",
            eocdr.disk_number, eocdr.disk_with_central_directory
        )));
    }
    if eocdr.entries != eocdr.entries_on_this_disk {
        return Err(ArchiveError::UnsupportedArchive(format!(
            "No support for multi-disk archives: entries ({}) != entries this disk ({})",
            eocdr.entries, eocdr.entries_on_this_disk
        )));
    }

    let eocdr_offset = tail_start + eocdr_posit as u64;
    let locator = eocdr_posit
        .checked_sub(Zip64EndOfCentralDirectoryLocator::size_in_file())
        .and_then(|posit| Zip64EndOfCentralDirectoryLocator::parse(&tail[posit..]));

    // Zip files can be prepended by arbitrary junk,
    // so all the given positions might be off.
    // Calculate the offset.
    let archive_offset;
    let nominal_central_directory_offset;
    let central_directory_size;
    let entry_count;

    if let Some(locator) = locator {
        trace!("{:?}", locator);

        if eocdr.disk_number as u32 != locator.disk_with_central_directory {
            return Err(ArchiveError::UnsupportedArchive(format!(
                "No support for multi-disk archives: disk ({}) != disk with zip64 central directory ({})",
                eocdr.disk_number, locator.disk_with_central_directory
            )));
        }
        if locator.disks != 1 {
            return Err(ArchiveError::UnsupportedArchive(format!(
                "No support for multi-disk archives: Zip64 EOCDR locator reports {} disks",
                locator.disks
            )));
        }

        // Search for the zip64 EOCDR, from its nominal starting position
        // to the end of where it could be.
        let search_start = locator.zip64_eocdr_offset;
        let search_end = eocdr_offset - Zip64EndOfCentralDirectoryLocator::size_in_file() as u64;
        if search_start > search_end {
            return Err(ArchiveError::invalid(
                "Invalid Zip64 End Of Central Directory Record offset",
            ));
        }
        let search_space = read_range(
            input,
            src,
            search_start,
            search_end - search_start,
            "the Zip64 End Of Central Directory Record",
        )?;

        let zip64_eocdr_posit = find_zip64_eocdr(&search_space)?;
        // Since we're searching starting at the provided offset,
        // the returned position is the archive offset.
        archive_offset = zip64_eocdr_posit as u64;
        let zip64_eocdr = Zip64EndOfCentralDirectory::parse(&search_space[zip64_eocdr_posit..])?;
        trace!("{:?}", zip64_eocdr);

        if zip64_eocdr.disk_number != zip64_eocdr.disk_with_central_directory
            || zip64_eocdr.entries != zip64_eocdr.entries_on_this_disk
        {
            return Err(ArchiveError::UnsupportedArchive(String::from(
                "No support for multi-disk archives",
            )));
        }

        nominal_central_directory_offset = zip64_eocdr.central_directory_offset;
        central_directory_size = zip64_eocdr.central_directory_size;
        entry_count = zip64_eocdr.entries;
    } else {
        // The offset is the actual position versus the stored one.
        let actual_cdr_posit = eocdr_offset.checked_sub(eocdr.central_directory_size as u64);
        let nominal_offset = eocdr.central_directory_offset as u64;
        archive_offset = actual_cdr_posit
            .and_then(|off| off.checked_sub(nominal_offset))
            .ok_or(ArchiveError::invalid(
                "Invalid central directory size or offset",
            ))?;
        nominal_central_directory_offset = nominal_offset;
        central_directory_size = eocdr.central_directory_size as u64;
        entry_count = eocdr.entries as u64;
    }

    trace!(
        "{} entries at nominal offset {} (archive starts at {})",
        entry_count,
        nominal_central_directory_offset,
        archive_offset
    );

    let central_directory_offset = archive_offset
        .checked_add(nominal_central_directory_offset)
        .ok_or(ArchiveError::invalid("Central directory offset overflows"))?;
    let central_directory = read_range(
        input,
        src,
        central_directory_offset,
        central_directory_size,
        "the central directory",
    )?;
    let mut remaining = central_directory.as_slice();

    let mut directory = BTreeMap::new();
    for _ in 0..entry_count {
        let cde = CentralDirectoryEntry::parse_and_consume(&mut remaining)?;
        trace!("{:?}", cde);
        let (header_offset, record) = CentralRecord::from_cde(&cde)?;
        let header_offset = archive_offset
            .checked_add(header_offset)
            .ok_or(ArchiveError::invalid("Local file header offset overflows"))?;
        directory.insert(header_offset, record);
    }

    Ok(Some((directory, archive_offset)))
}

/// How an entry's data is decoded
enum Decoder {
    Stored,
    Deflate(Box<Decompress>),
    Unsupported(u16),
}

/// Decoding state of the current entry
struct EntryData {
    name: String,
    decoder: Decoder,
    encrypted: bool,
    /// Compressed bytes left to consume, when known
    compressed_left: Option<u64>,
    has_data_descriptor: bool,
    zip64: bool,
    crc: Crc32Check,
    finished: bool,
}

impl EntryData {
    fn truncated(&self) -> ArchiveError {
        ArchiveError::invalid(format!("Archive ended in the middle of {}", self.name))
    }
}

/// Walks a ZIP archive's local file headers.
pub struct ZipReader {
    directory: BTreeMap<u64, CentralRecord>,
    current: Option<EntryData>,
    /// Set once we hit the central directory (or the end of the archive).
    done: bool,
}

impl ZipReader {
    /// Reads the central directory, if there is one,
    /// then positions the source at the first local header.
    pub fn open(input: &mut InputBuffer, src: &mut dyn PullSource) -> ArchiveResult<Self> {
        let starts_with_header = input.available().starts_with(b"PK");

        let (directory, start) = match load_central_directory(input, src)? {
            Some(directory) => directory,
            None if starts_with_header => {
                debug!("No central directory; relying on local headers");
                (BTreeMap::new(), 0)
            }
            None => {
                return Err(ArchiveError::invalid(
                    "Couldn't find End Of Central Directory Record",
                ))
            }
        };
        debug!("{} entries in the central directory", directory.len());

        src.pull_seek(SeekFrom::Start(start))?;
        input.reset(start);

        Ok(Self {
            directory,
            current: None,
            done: false,
        })
    }

    pub fn next_entry(
        &mut self,
        input: &mut InputBuffer,
        src: &mut dyn PullSource,
    ) -> ArchiveResult<Option<Entry>> {
        if let Some(mut current) = self.current.take() {
            skip_entry_data(&mut current, input, src)?;
        }
        if self.done {
            return Ok(None);
        }

        loop {
            if !input.ensure(src, 4)? {
                self.done = true;
                return Ok(None);
            }
            let signature = &input.available()[..4];
            if signature == SPANNING_MARKER {
                input.consume(4);
                continue;
            }
            if signature == LOCAL_FILE_HEADER_MAGIC {
                break;
            }
            if signature == CENTRAL_DIRECTORY_MAGIC
                || signature == EOCDR_MAGIC
                || signature == ZIP64_EOCDR_MAGIC
            {
                self.done = true;
                return Ok(None);
            }
            return Err(ArchiveError::invalid(format!(
                "Couldn't find a local file header at offset {}",
                input.position()
            )));
        }

        let header_offset = input.position();
        let fixed = input.require(src, LOCAL_FILE_HEADER_SIZE, "a local file header")?;
        let header_len = LOCAL_FILE_HEADER_SIZE + LocalFileHeader::variable_length(fixed);
        let header = input
            .require(src, header_len, "a local file header")?
            .to_vec();
        input.consume(header_len);

        let local = LocalFileHeader::parse(&header);
        trace!("{:?}", local);
        let (entry, data) = self.entry_from_local(&local, header_offset)?;
        debug!("{:?}", entry);
        self.current = Some(data);
        Ok(Some(entry))
    }

    fn entry_from_local(
        &self,
        local: &LocalFileHeader,
        header_offset: u64,
    ) -> ArchiveResult<(Entry, EntryData)> {
        let path = decode_path(local.path, local.flags)?;
        let record = self.directory.get(&header_offset);

        let mut sizes = Sizes {
            size: local.uncompressed_size as u64,
            compressed_size: local.compressed_size as u64,
            header_offset,
        };
        let zip64 = parse_extra_field(&mut sizes, local.extra_field, true)?;
        let has_data_descriptor = has_data_descriptor(local.flags);
        let mut crc32 = local.crc32;
        let mut sizes_known = !has_data_descriptor;

        if let Some(record) = record {
            if has_data_descriptor {
                sizes.size = record.size;
                sizes.compressed_size = record.compressed_size;
                crc32 = record.crc32;
                sizes_known = true;
            } else if cfg!(feature = "check-local-metadata")
                && (record.size != sizes.size
                    || record.compressed_size != sizes.compressed_size
                    || record.crc32 != crc32
                    || record.compression_method != local.compression_method)
            {
                return Err(ArchiveError::invalid(
                    "Central directory entry doesn't match local file header",
                ));
            }
        }

        let is_dir = path.as_str().ends_with('/') || record.map_or(false, |r| r.dos_directory);
        let mode = record
            .and_then(|r| r.unix_mode)
            .unwrap_or_else(|| default_mode(is_dir));

        let size = if sizes_known {
            sizes.size
        } else {
            warn!("{path} has no recorded size until it's decoded; reporting 0");
            0
        };

        let decoder = match CompressionMethod::from_u16(local.compression_method) {
            CompressionMethod::None => Decoder::Stored,
            CompressionMethod::Deflate => Decoder::Deflate(Box::new(Decompress::new(false))),
            CompressionMethod::Unsupported(method) => Decoder::Unsupported(method),
        };

        let data = EntryData {
            name: path.to_string(),
            decoder,
            encrypted: is_encrypted(local.flags),
            compressed_left: if sizes_known {
                Some(sizes.compressed_size)
            } else {
                None
            },
            has_data_descriptor,
            zip64,
            crc: Crc32Check::new(crc32),
            finished: false,
        };
        let entry = Entry {
            path,
            size,
            mode,
            last_modified: parse_msdos(local.last_modified_time, local.last_modified_date),
        };
        Ok((entry, data))
    }

    pub fn read_data(
        &mut self,
        input: &mut InputBuffer,
        src: &mut dyn PullSource,
        buf: &mut [u8],
    ) -> ArchiveResult<usize> {
        match self.current.as_mut() {
            Some(entry) => read_entry(entry, input, src, buf),
            None => Err(ArchiveError::invalid("No entry to read data from")),
        }
    }
}

/// Decodes the entry's next bytes, finishing it up when they run out.
fn read_entry(
    entry: &mut EntryData,
    input: &mut InputBuffer,
    src: &mut dyn PullSource,
    buf: &mut [u8],
) -> ArchiveResult<usize> {
    if entry.finished || buf.is_empty() {
        return Ok(0);
    }
    if entry.encrypted {
        return Err(ArchiveError::UnsupportedArchive(format!(
            "Can't read encrypted file {}",
            entry.name
        )));
    }

    let (produced, ended) = match entry.decoder {
        Decoder::Stored => read_stored(entry, input, src, buf)?,
        Decoder::Deflate(_) => read_deflated(entry, input, src, buf)?,
        Decoder::Unsupported(method) => {
            return Err(ArchiveError::UnsupportedArchive(format!(
                "Compression method {} of {} isn't supported",
                method, entry.name
            )))
        }
    };
    entry.crc.update(&buf[..produced]);
    if ended {
        finish_entry(entry, input, src)?;
    }
    Ok(produced)
}

fn read_stored(
    entry: &mut EntryData,
    input: &mut InputBuffer,
    src: &mut dyn PullSource,
    buf: &mut [u8],
) -> ArchiveResult<(usize, bool)> {
    let left = match entry.compressed_left {
        Some(left) => left,
        None => {
            return Err(ArchiveError::UnsupportedArchive(format!(
                "Stored file {} has no recorded size",
                entry.name
            )))
        }
    };
    if left == 0 {
        return Ok((0, true));
    }
    if input.available().is_empty() && input.fill(src)? == 0 {
        return Err(entry.truncated());
    }

    let count = min_len(left, buf.len().min(input.available().len()));
    buf[..count].copy_from_slice(&input.available()[..count]);
    input.consume(count);
    let left = left - count as u64;
    entry.compressed_left = Some(left);
    Ok((count, left == 0))
}

fn read_deflated(
    entry: &mut EntryData,
    input: &mut InputBuffer,
    src: &mut dyn PullSource,
    buf: &mut [u8],
) -> ArchiveResult<(usize, bool)> {
    let inflater = match &mut entry.decoder {
        Decoder::Deflate(inflater) => inflater,
        _ => unreachable!("read_deflated() on an entry that isn't deflated"),
    };

    loop {
        if input.available().is_empty()
            && entry.compressed_left != Some(0)
            && input.fill(src)? == 0
        {
            return Err(ArchiveError::invalid(format!(
                "Archive ended in the middle of {}",
                entry.name
            )));
        }

        let available = input.available();
        let feed = match entry.compressed_left {
            Some(left) => &available[..min_len(left, available.len())],
            None => available,
        };

        let before_in = inflater.total_in();
        let before_out = inflater.total_out();
        let status = inflater
            .decompress(feed, buf, FlushDecompress::None)
            .map_err(|e| ArchiveError::invalid(format!("Couldn't inflate {}: {}", entry.name, e)))?;
        let consumed = (inflater.total_in() - before_in) as usize;
        let produced = (inflater.total_out() - before_out) as usize;

        input.consume(consumed);
        if let Some(left) = entry.compressed_left.as_mut() {
            *left -= consumed as u64;
        }

        match status {
            Status::StreamEnd => return Ok((produced, true)),
            Status::Ok | Status::BufError => {
                if produced > 0 {
                    return Ok((produced, false));
                }
                if consumed == 0 {
                    // Everything buffered was a partial block; get more.
                    if entry.compressed_left == Some(0) || input.fill(src)? == 0 {
                        return Err(ArchiveError::invalid(format!(
                            "Compressed data of {} ended early",
                            entry.name
                        )));
                    }
                }
            }
        }
    }
}

/// Consumes whatever follows the entry's data and checks what we decoded.
fn finish_entry(
    entry: &mut EntryData,
    input: &mut InputBuffer,
    src: &mut dyn PullSource,
) -> ArchiveResult<()> {
    entry.finished = true;
    if let Some(left) = entry.compressed_left.filter(|left| *left > 0) {
        input.skip(src, left)?;
        entry.compressed_left = Some(0);
    }
    if entry.has_data_descriptor {
        let crc32 = read_data_descriptor(input, src, entry.zip64)?;
        entry.crc.set_provided_checksum(crc32);
    }
    entry.crc.verify(&entry.name)
}

/// Skips the rest of an entry nobody asked to read.
fn skip_entry_data(
    entry: &mut EntryData,
    input: &mut InputBuffer,
    src: &mut dyn PullSource,
) -> ArchiveResult<()> {
    if entry.finished {
        return Ok(());
    }
    match entry.compressed_left {
        Some(left) => {
            entry.finished = true;
            input.skip(src, left)?;
            entry.compressed_left = Some(0);
            if entry.has_data_descriptor {
                read_data_descriptor(input, src, entry.zip64)?;
            }
            Ok(())
        }
        None => {
            // Without a size, the only way past the data is through it.
            let mut scratch = vec![0; 32 * 1024];
            while read_entry(entry, input, src, &mut scratch)? > 0 {}
            Ok(())
        }
    }
}

/// Reads a data descriptor, returning its CRC.
fn read_data_descriptor(
    input: &mut InputBuffer,
    src: &mut dyn PullSource,
    zip64: bool,
) -> ArchiveResult<u32> {
    // 4.3.9  Data descriptor:
    //
    //     crc-32                          4 bytes
    //     compressed size                 4 bytes
    //     uncompressed size               4 bytes
    //
    // 4.3.9.3 Although not originally assigned a signature, the value
    // 0x08074b50 has commonly been adopted as a signature value
    // for the data descriptor record.
    //
    // 4.3.9.1 [...] For ZIP64(tm) format archives, the compressed
    // and uncompressed sizes are 8 bytes each.
    if input.require(src, 4, "a data descriptor")? == DATA_DESCRIPTOR_MAGIC {
        input.consume(4);
    }
    let len = if zip64 { 4 + 16 } else { 4 + 8 };
    let mut descriptor = input.require(src, len, "a data descriptor")?;
    let crc32 = read_u32(&mut descriptor);
    input.consume(len);
    Ok(crc32)
}
