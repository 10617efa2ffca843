//! Code specific to the RAR (1.5 - 4.x) archive format.
//!
//! A RAR archive is a marker block followed by a run of blocks,
//! each starting with the same 7-byte header:
//!
//! ```text
//! HEAD_CRC   2 bytes  Low 16 bits of the CRC-32 of the rest of the header
//! HEAD_TYPE  1 byte
//! HEAD_FLAGS 2 bytes
//! HEAD_SIZE  2 bytes  Including these 7 bytes
//! ADD_SIZE   4 bytes  Only if HEAD_FLAGS & 0x8000; size of data after the header
//! ```
//!
//! Only stored entries can be read; everything else is listed
//! and refused when its data is requested.

use std::borrow::Cow;
use std::convert::TryInto;

use camino::Utf8PathBuf;
use codepage_437::*;
use log::*;

use super::input::InputBuffer;
use super::{default_mode, parse_msdos, Entry, S_IFMT};
use crate::arch::min_len;
use crate::bridge::PullSource;
use crate::crc::Crc32Check;
use crate::result::*;

const MARKER_SIZE: u64 = 7;
const BLOCK_HEADER_SIZE: usize = 7;
const FILE_HEADER_SIZE: usize = 32;

const MAIN_HEADER: u8 = 0x73;
const FILE_HEADER: u8 = 0x74;
const END_OF_ARCHIVE: u8 = 0x7b;

/// Block headers (other than the marker) are encrypted.
const MAIN_ENCRYPTED_HEADERS: u16 = 0x0080;

const LONG_BLOCK: u16 = 0x8000;

const FILE_CONTINUED_FROM_PREVIOUS: u16 = 0x0001;
const FILE_CONTINUED_IN_NEXT: u16 = 0x0002;
const FILE_ENCRYPTED: u16 = 0x0004;
const FILE_DICTIONARY_MASK: u16 = 0x00e0;
/// All dictionary bits set marks a directory.
const FILE_DIRECTORY: u16 = 0x00e0;
const FILE_LARGE: u16 = 0x0100;
const FILE_UNICODE_NAME: u16 = 0x0200;

const METHOD_STORE: u8 = 0x30;

const HOST_UNIX: u8 = 3;
const DOS_DIRECTORY_ATTRIBUTE: u32 = 0x10;

fn read_u32(input: &mut &[u8]) -> u32 {
    let (int_bytes, rest) = input.split_at(std::mem::size_of::<u32>());
    *input = rest;
    u32::from_le_bytes(int_bytes.try_into().expect("less than four bytes for u32"))
}

fn read_u16(input: &mut &[u8]) -> u16 {
    let (int_bytes, rest) = input.split_at(std::mem::size_of::<u16>());
    *input = rest;
    u16::from_le_bytes(int_bytes.try_into().expect("less than two bytes for u16"))
}

fn read_u8(input: &mut &[u8]) -> u8 {
    let (byte, rest) = input.split_at(1);
    *input = rest;
    byte[0]
}

/// The part of the header every block shares
#[derive(Debug)]
struct BlockHeader {
    crc: u16,
    kind: u8,
    flags: u16,
    size: u16,
}

impl BlockHeader {
    fn parse(mut header: &[u8]) -> ArchiveResult<Self> {
        let crc = read_u16(&mut header);
        let kind = read_u8(&mut header);
        let flags = read_u16(&mut header);
        let size = read_u16(&mut header);
        if (size as usize) < BLOCK_HEADER_SIZE {
            return Err(ArchiveError::invalid(format!(
                "RAR block header claims to be {size} bytes"
            )));
        }
        Ok(Self {
            crc,
            kind,
            flags,
            size,
        })
    }

    /// Checks the header CRC, given the whole header.
    fn verify(&self, header: &[u8]) -> ArchiveResult<()> {
        let actual = crc32fast::hash(&header[2..]) & 0xffff;
        if actual as u16 != self.crc {
            return Err(ArchiveError::invalid(format!(
                "Bad RAR header checksum (block type 0x{:02x})",
                self.kind
            )));
        }
        Ok(())
    }
}

/// A file header (block type 0x74)
#[derive(Debug)]
struct FileHeader<'a> {
    flags: u16,
    packed_size: u64,
    unpacked_size: u64,
    host_os: u8,
    crc32: u32,
    modified: u32,
    method: u8,
    attributes: u32,
    name: &'a [u8],
}

impl<'a> FileHeader<'a> {
    fn parse(flags: u16, header: &'a [u8]) -> ArchiveResult<Self> {
        // PACK_SIZE  4 bytes
        // UNP_SIZE   4 bytes
        // HOST_OS    1 byte
        // FILE_CRC   4 bytes
        // FTIME      4 bytes  MS-DOS date and time
        // UNP_VER    1 byte
        // METHOD     1 byte
        // NAME_SIZE  2 bytes
        // ATTR       4 bytes
        // HIGH_PACK_SIZE 4 bytes  Only if flags & 0x100
        // HIGH_UNP_SIZE  4 bytes  Only if flags & 0x100
        // FILE_NAME  NAME_SIZE bytes
        // (salt and extended times follow; we don't need them)
        if header.len() < FILE_HEADER_SIZE {
            return Err(ArchiveError::invalid("Truncated RAR file header"));
        }
        let mut fields = &header[BLOCK_HEADER_SIZE..];
        let low_packed_size = read_u32(&mut fields);
        let low_unpacked_size = read_u32(&mut fields);
        let host_os = read_u8(&mut fields);
        let crc32 = read_u32(&mut fields);
        let modified = read_u32(&mut fields);
        let _unpack_version = read_u8(&mut fields);
        let method = read_u8(&mut fields);
        let name_size = read_u16(&mut fields) as usize;
        let attributes = read_u32(&mut fields);

        let (high_packed_size, high_unpacked_size) = if flags & FILE_LARGE != 0 {
            if fields.len() < 8 {
                return Err(ArchiveError::invalid("Truncated RAR file header"));
            }
            (read_u32(&mut fields), read_u32(&mut fields))
        } else {
            (0, 0)
        };
        if fields.len() < name_size {
            return Err(ArchiveError::invalid("RAR file name runs past its header"));
        }

        Ok(Self {
            flags,
            packed_size: (high_packed_size as u64) << 32 | low_packed_size as u64,
            unpacked_size: (high_unpacked_size as u64) << 32 | low_unpacked_size as u64,
            host_os,
            crc32,
            modified,
            method,
            attributes,
            name: &fields[..name_size],
        })
    }

    fn path(&self) -> ArchiveResult<Utf8PathBuf> {
        let name = if self.flags & FILE_UNICODE_NAME != 0 {
            match self.name.iter().position(|b| *b == 0) {
                // Without the NUL, the name is plain UTF-8.
                None => std::str::from_utf8(self.name)?.to_owned(),
                Some(nul) => decode_unicode_name(&self.name[..nul], &self.name[nul + 1..])
                    .ok_or_else(|| ArchiveError::invalid("Invalid RAR Unicode file name"))?,
            }
        } else {
            Cow::borrow_from_cp437(self.name, &CP437_CONTROL).into_owned()
        };
        Ok(Utf8PathBuf::from(name.replace('\\', "/")))
    }

    fn is_dir(&self) -> bool {
        self.flags & FILE_DICTIONARY_MASK == FILE_DIRECTORY
            || (self.host_os != HOST_UNIX && self.attributes & DOS_DIRECTORY_ATTRIBUTE != 0)
    }

    fn mode(&self) -> u32 {
        if self.host_os == HOST_UNIX && self.attributes & S_IFMT != 0 {
            self.attributes
        } else {
            default_mode(self.is_dir())
        }
    }
}

/// Decodes RAR's compressed UTF-16 names.
///
/// `ascii` is the plain name before the NUL, which some opcodes copy from.
/// Returns `None` if the encoding runs off either end.
fn decode_unicode_name(ascii: &[u8], encoded: &[u8]) -> Option<String> {
    let mut out: Vec<u16> = Vec::with_capacity(ascii.len());
    let mut bytes = encoded.iter().copied();
    let high = bytes.next()? as u16;
    let mut flags = 0u8;
    let mut flag_bits = 0;

    while let Some(first) = bytes.next() {
        if flag_bits == 0 {
            flags = first;
            flag_bits = 8;
            continue;
        }
        flag_bits -= 2;
        match (flags >> flag_bits) & 3 {
            0 => out.push(first as u16),
            1 => out.push(first as u16 | high << 8),
            2 => out.push(first as u16 | (bytes.next()? as u16) << 8),
            _ => {
                let run = first;
                if run & 0x80 != 0 {
                    let correction = bytes.next()?;
                    for _ in 0..(run & 0x7f) + 2 {
                        let c = ascii.get(out.len())?.wrapping_add(correction);
                        out.push(c as u16 | high << 8);
                    }
                } else {
                    for _ in 0..run + 2 {
                        out.push(*ascii.get(out.len())? as u16);
                    }
                }
            }
        }
    }
    Some(String::from_utf16_lossy(&out))
}

/// Decoding state of the current entry
struct EntryData {
    name: String,
    /// Why the data can't be read, if it can't
    unreadable: Option<String>,
    packed_left: u64,
    crc: Crc32Check,
    finished: bool,
}

/// Walks the blocks of a RAR archive.
pub struct RarReader {
    current: Option<EntryData>,
    done: bool,
}

impl RarReader {
    /// Reads past the marker block and the main archive header.
    /// `marker_offset` is where the marker starts (after any SFX stub).
    pub fn open(
        input: &mut InputBuffer,
        src: &mut dyn PullSource,
        marker_offset: u64,
    ) -> ArchiveResult<Self> {
        input.skip(src, marker_offset + MARKER_SIZE)?;

        let (block, header) = read_block_header(input, src)?;
        if block.kind != MAIN_HEADER {
            return Err(ArchiveError::invalid(format!(
                "Expected the RAR main header, found block type 0x{:02x}",
                block.kind
            )));
        }
        block.verify(&header)?;
        trace!("{:?}", block);
        if block.flags & MAIN_ENCRYPTED_HEADERS != 0 {
            return Err(ArchiveError::UnsupportedArchive(String::from(
                "RAR archives with encrypted headers aren't supported",
            )));
        }
        skip_block_data(&block, &header, input, src)?;

        Ok(Self {
            current: None,
            done: false,
        })
    }

    pub fn next_entry(
        &mut self,
        input: &mut InputBuffer,
        src: &mut dyn PullSource,
    ) -> ArchiveResult<Option<Entry>> {
        if let Some(current) = self.current.take() {
            if !current.finished {
                input.skip(src, current.packed_left)?;
            }
        }

        while !self.done {
            if !input.ensure(src, BLOCK_HEADER_SIZE)? {
                // Plenty of archivers don't bother with an end block.
                self.done = true;
                break;
            }
            let (block, header) = read_block_header(input, src)?;
            trace!("{:?}", block);
            match block.kind {
                FILE_HEADER => {
                    block.verify(&header)?;
                    let (entry, data) = entry_from_header(block.flags, &header)?;
                    debug!("{:?}", entry);
                    self.current = Some(data);
                    return Ok(Some(entry));
                }
                END_OF_ARCHIVE => self.done = true,
                _ => skip_block_data(&block, &header, input, src)?,
            }
        }
        Ok(None)
    }

    pub fn read_data(
        &mut self,
        input: &mut InputBuffer,
        src: &mut dyn PullSource,
        buf: &mut [u8],
    ) -> ArchiveResult<usize> {
        let entry = match self.current.as_mut() {
            Some(entry) => entry,
            None => return Err(ArchiveError::invalid("No entry to read data from")),
        };
        if entry.finished || buf.is_empty() {
            return Ok(0);
        }
        if let Some(reason) = &entry.unreadable {
            return Err(ArchiveError::UnsupportedArchive(reason.clone()));
        }

        if entry.packed_left > 0 {
            if input.available().is_empty() && input.fill(src)? == 0 {
                return Err(ArchiveError::invalid(format!(
                    "Archive ended in the middle of {}",
                    entry.name
                )));
            }
            let count = min_len(entry.packed_left, buf.len().min(input.available().len()));
            buf[..count].copy_from_slice(&input.available()[..count]);
            input.consume(count);
            entry.packed_left -= count as u64;
            entry.crc.update(&buf[..count]);
            if entry.packed_left > 0 {
                return Ok(count);
            }
            entry.finished = true;
            entry.crc.verify(&entry.name)?;
            return Ok(count);
        }

        entry.finished = true;
        entry.crc.verify(&entry.name)?;
        Ok(0)
    }
}

/// Reads a block's full header, consuming it.
fn read_block_header(
    input: &mut InputBuffer,
    src: &mut dyn PullSource,
) -> ArchiveResult<(BlockHeader, Vec<u8>)> {
    let block = BlockHeader::parse(input.require(src, BLOCK_HEADER_SIZE, "a RAR block header")?)?;
    let size = block.size as usize;
    let header = input.require(src, size, "a RAR block header")?.to_vec();
    input.consume(size);
    Ok((block, header))
}

/// Skips whatever data follows a block we don't care about.
fn skip_block_data(
    block: &BlockHeader,
    mut header: &[u8],
    input: &mut InputBuffer,
    src: &mut dyn PullSource,
) -> ArchiveResult<()> {
    if block.flags & LONG_BLOCK == 0 {
        return Ok(());
    }
    if header.len() < BLOCK_HEADER_SIZE + 4 {
        return Err(ArchiveError::invalid("Truncated RAR block header"));
    }
    header = &header[BLOCK_HEADER_SIZE..];
    let data_size = read_u32(&mut header) as u64;
    trace!("Skipping {} bytes of block type 0x{:02x}", data_size, block.kind);
    input.skip(src, data_size)
}

fn entry_from_header(flags: u16, header: &[u8]) -> ArchiveResult<(Entry, EntryData)> {
    let file = FileHeader::parse(flags, header)?;
    trace!("{:?}", file);
    let path = file.path()?;

    let unreadable = if flags & (FILE_CONTINUED_FROM_PREVIOUS | FILE_CONTINUED_IN_NEXT) != 0 {
        Some(format!("{path} spans multiple volumes"))
    } else if flags & FILE_ENCRYPTED != 0 {
        Some(format!("Can't read encrypted file {path}"))
    } else if file.method != METHOD_STORE && !file.is_dir() {
        Some(format!(
            "RAR compression method 0x{:02x} of {path} isn't supported",
            file.method
        ))
    } else {
        None
    };

    let size = if file.is_dir() { 0 } else { file.unpacked_size };
    let entry = Entry {
        path,
        size,
        mode: file.mode(),
        last_modified: parse_msdos(file.modified as u16, (file.modified >> 16) as u16),
    };
    let data = EntryData {
        name: entry.path.to_string(),
        unreadable,
        packed_left: file.packed_size,
        crc: Crc32Check::new(file.crc32),
        finished: false,
    };
    Ok((entry, data))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn unicode_names() {
        // High byte 0x04 (Cyrillic), then one flag byte:
        // 01 (low byte + high), 00 (plain byte), 11 (copy a run from the ASCII name)
        let ascii = b"?.txt";
        let encoded = [0x04, 0b01_00_11_00, 0x10, b'.', 0x01, b'?'];
        // The run copies 3 bytes starting where the output is (index 2: "txt"),
        // and the trailing 00 opcode adds one more plain byte.
        assert_eq!(
            decode_unicode_name(ascii, &encoded).unwrap(),
            "\u{0410}.txt?"
        );

        // Running past the ASCII name is an error, not a panic.
        assert!(decode_unicode_name(b"", &[0, 0b11_00_00_00, 0x05]).is_none());
    }

    #[test]
    fn header_checksums() {
        let mut header = vec![0, 0, MAIN_HEADER, 0, 0, 13, 0, 0, 0, 0, 0, 0, 0];
        let crc = (crc32fast::hash(&header[2..]) & 0xffff) as u16;
        header[..2].copy_from_slice(&crc.to_le_bytes());

        let block = BlockHeader::parse(&header).unwrap();
        assert_eq!(block.size, 13);
        block.verify(&header).unwrap();

        header[3] = 1;
        assert!(block.verify(&header).is_err());
        assert!(BlockHeader::parse(&[0, 0, 0x74, 0, 0, 3, 0]).is_err());
    }
}
