//! Archive builders and source wrappers shared by the integration tests

#![allow(dead_code)]

use std::io::{self, prelude::*, SeekFrom};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use flate2::write::DeflateEncoder;
use flate2::Compression;

use raz::source::ByteSource;

/// 2021-06-15 12:30:10 as an MS-DOS time and date
pub const DOS_TIME: u16 = (12 << 11) | (30 << 5) | 5;
pub const DOS_DATE: u16 = ((2021 - 1980) << 9) | (6 << 5) | 15;
pub const TIMESTAMP: &str = "2021-06-15 12:30:10";

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Somewhat compressible text that doesn't repeat in short order
pub fn sample_text(len: usize, seed: u32) -> Vec<u8> {
    const WORDS: &[&str] = &[
        "archive", "byte", "central", "deflate", "entry", "forward", "header", "inflate",
        "local", "offset", "replay", "seek", "skip", "stream", "window", "zip",
    ];
    let mut state = seed.wrapping_mul(2_654_435_761).wrapping_add(1);
    let mut text = Vec::with_capacity(len + 16);
    while text.len() < len {
        state = state.wrapping_mul(1_103_515_245).wrapping_add(12345);
        text.extend_from_slice(WORDS[(state >> 16) as usize % WORDS.len()].as_bytes());
        text.push(if state % 7 == 0 { b'\n' } else { b' ' });
    }
    text.truncate(len);
    text
}

fn put16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

struct ZipFile {
    name: String,
    data: Vec<u8>,
    deflate: bool,
    unix_mode: Option<u32>,
    data_descriptor: bool,
    encrypted: bool,
}

/// Writes ZIP archives the way common archivers do.
#[derive(Default)]
pub struct ZipBuilder {
    prefix: Vec<u8>,
    files: Vec<ZipFile>,
    skip_central_directory: bool,
}

impl ZipBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Puts arbitrary bytes in front, like a self-extractor stub.
    pub fn prefix(mut self, bytes: &[u8]) -> Self {
        self.prefix = bytes.to_vec();
        self
    }

    pub fn stored(mut self, name: &str, data: &[u8]) -> Self {
        self.files.push(ZipFile {
            name: name.to_owned(),
            data: data.to_vec(),
            deflate: false,
            unix_mode: None,
            data_descriptor: false,
            encrypted: false,
        });
        self
    }

    pub fn deflated(mut self, name: &str, data: &[u8]) -> Self {
        self = self.stored(name, data);
        self.last().deflate = true;
        self
    }

    pub fn directory(self, name: &str) -> Self {
        assert!(name.ends_with('/'));
        self.stored(name, b"").unix_mode(0o040755)
    }

    /// Records a Unix mode for the last file.
    pub fn unix_mode(mut self, mode: u32) -> Self {
        self.last().unix_mode = Some(mode);
        self
    }

    /// Moves the last file's sizes and CRC after its data.
    pub fn data_descriptor(mut self) -> Self {
        self.last().data_descriptor = true;
        self
    }

    /// Flags the last file as encrypted (without actually encrypting it).
    pub fn encrypted(mut self) -> Self {
        self.last().encrypted = true;
        self
    }

    pub fn without_central_directory(mut self) -> Self {
        self.skip_central_directory = true;
        self
    }

    fn last(&mut self) -> &mut ZipFile {
        self.files.last_mut().expect("no files yet")
    }

    pub fn build(&self) -> Vec<u8> {
        let mut out = self.prefix.clone();
        let mut central = Vec::new();

        for file in &self.files {
            // Offsets are from the start of the archive proper.
            let offset = (out.len() - self.prefix.len()) as u32;
            let crc = crc32fast::hash(&file.data);
            let compressed = if file.deflate {
                let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
                encoder.write_all(&file.data).unwrap();
                encoder.finish().unwrap()
            } else {
                file.data.clone()
            };
            let method: u16 = if file.deflate { 8 } else { 0 };
            let mut flags: u16 = 1 << 11;
            if file.data_descriptor {
                flags |= 1 << 3;
            }
            if file.encrypted {
                flags |= 1;
            }

            out.extend_from_slice(b"PK\x03\x04");
            put16(&mut out, 20);
            put16(&mut out, flags);
            put16(&mut out, method);
            put16(&mut out, DOS_TIME);
            put16(&mut out, DOS_DATE);
            if file.data_descriptor {
                put32(&mut out, 0);
                put32(&mut out, 0);
                put32(&mut out, 0);
            } else {
                put32(&mut out, crc);
                put32(&mut out, compressed.len() as u32);
                put32(&mut out, file.data.len() as u32);
            }
            put16(&mut out, file.name.len() as u16);
            put16(&mut out, 0);
            out.extend_from_slice(file.name.as_bytes());
            out.extend_from_slice(&compressed);
            if file.data_descriptor {
                out.extend_from_slice(b"PK\x07\x08");
                put32(&mut out, crc);
                put32(&mut out, compressed.len() as u32);
                put32(&mut out, file.data.len() as u32);
            }

            let (made_by, external) = match file.unix_mode {
                Some(mode) => ((3 << 8) | 20, mode << 16),
                None if file.name.ends_with('/') => (20, 0x10),
                None => (20, 0),
            };
            central.extend_from_slice(b"PK\x01\x02");
            put16(&mut central, made_by);
            put16(&mut central, 20);
            put16(&mut central, flags);
            put16(&mut central, method);
            put16(&mut central, DOS_TIME);
            put16(&mut central, DOS_DATE);
            put32(&mut central, crc);
            put32(&mut central, compressed.len() as u32);
            put32(&mut central, file.data.len() as u32);
            put16(&mut central, file.name.len() as u16);
            put16(&mut central, 0); // extra
            put16(&mut central, 0); // comment
            put16(&mut central, 0); // disk
            put16(&mut central, 0); // internal attributes
            put32(&mut central, external);
            put32(&mut central, offset);
            central.extend_from_slice(file.name.as_bytes());
        }

        if self.skip_central_directory {
            return out;
        }

        let central_offset = (out.len() - self.prefix.len()) as u32;
        out.extend_from_slice(&central);
        out.extend_from_slice(b"PK\x05\x06");
        put16(&mut out, 0);
        put16(&mut out, 0);
        put16(&mut out, self.files.len() as u16);
        put16(&mut out, self.files.len() as u16);
        put32(&mut out, central.len() as u32);
        put32(&mut out, central_offset);
        put16(&mut out, 0);
        out
    }
}

enum RarBlock {
    File { name: String, data: Vec<u8>, directory: bool },
    Service(Vec<u8>),
}

/// Writes RAR 4 archives with stored files.
#[derive(Default)]
pub struct RarBuilder {
    prefix: Vec<u8>,
    blocks: Vec<RarBlock>,
}

impl RarBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn prefix(mut self, bytes: &[u8]) -> Self {
        self.prefix = bytes.to_vec();
        self
    }

    pub fn stored(mut self, name: &str, data: &[u8]) -> Self {
        self.blocks.push(RarBlock::File {
            name: name.to_owned(),
            data: data.to_vec(),
            directory: false,
        });
        self
    }

    /// Adds a directory, named RAR-style (no trailing separator).
    pub fn directory(mut self, name: &str) -> Self {
        self.blocks.push(RarBlock::File {
            name: name.to_owned(),
            data: Vec::new(),
            directory: true,
        });
        self
    }

    /// Adds a block readers should skip over, data and all.
    pub fn service_block(mut self, data: &[u8]) -> Self {
        self.blocks.push(RarBlock::Service(data.to_vec()));
        self
    }

    fn block(out: &mut Vec<u8>, kind: u8, flags: u16, body: &[u8]) {
        let mut header = vec![0, 0, kind];
        put16(&mut header, flags);
        put16(&mut header, (7 + body.len()) as u16);
        header.extend_from_slice(body);
        let crc = (crc32fast::hash(&header[2..]) & 0xffff) as u16;
        header[..2].copy_from_slice(&crc.to_le_bytes());
        out.extend_from_slice(&header);
    }

    pub fn build(&self) -> Vec<u8> {
        let mut out = self.prefix.clone();
        out.extend_from_slice(b"Rar!\x1a\x07\x00");
        Self::block(&mut out, 0x73, 0, &[0; 6]);

        for block in &self.blocks {
            match block {
                RarBlock::File {
                    name,
                    data,
                    directory,
                } => {
                    let mode: u32 = if *directory { 0o040755 } else { 0o100644 };
                    let mut body = Vec::new();
                    put32(&mut body, data.len() as u32);
                    put32(&mut body, data.len() as u32);
                    body.push(3); // Unix
                    put32(&mut body, crc32fast::hash(data));
                    put32(&mut body, (DOS_DATE as u32) << 16 | DOS_TIME as u32);
                    body.push(29);
                    body.push(0x30); // stored
                    put16(&mut body, name.len() as u16);
                    put32(&mut body, mode);
                    body.extend_from_slice(name.as_bytes());
                    let flags = if *directory { 0x8000 | 0x00e0 } else { 0x8000 };
                    Self::block(&mut out, 0x74, flags, &body);
                    out.extend_from_slice(data);
                }
                RarBlock::Service(data) => {
                    let mut body = Vec::new();
                    put32(&mut body, data.len() as u32);
                    body.extend_from_slice(b"CMT");
                    Self::block(&mut out, 0x7a, 0x8000, &body);
                    out.extend_from_slice(data);
                }
            }
        }
        Self::block(&mut out, 0x7b, 0x4000, &[]);
        out
    }
}

/// Counts what gets asked of the source it wraps.
pub struct CountingSource<S> {
    inner: S,
    pub reads: u64,
    pub bytes_read: u64,
}

impl<S> CountingSource<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            reads: 0,
            bytes_read: 0,
        }
    }
}

impl<S: ByteSource> ByteSource for CountingSource<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let count = self.inner.read(buf)?;
        self.reads += 1;
        self.bytes_read += count as u64;
        Ok(count)
    }

    fn skip(&mut self, count: u64) -> io::Result<u64> {
        self.inner.skip(count)
    }

    fn seek(&mut self, position: SeekFrom) -> io::Result<u64> {
        self.inner.seek(position)
    }

    fn close(&mut self) -> io::Result<()> {
        self.inner.close()
    }

    fn offset(&self) -> u64 {
        self.inner.offset()
    }
}

/// Fails every read and close once its switch is flipped,
/// like a network source that lost its connection.
pub struct FlakySource<S> {
    inner: S,
    broken: Arc<AtomicBool>,
}

impl<S> FlakySource<S> {
    pub fn new(inner: S) -> (Self, Arc<AtomicBool>) {
        let broken = Arc::new(AtomicBool::new(false));
        (
            Self {
                inner,
                broken: broken.clone(),
            },
            broken,
        )
    }

    fn check(&self) -> io::Result<()> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "connection reset",
            ));
        }
        Ok(())
    }
}

impl<S: ByteSource> ByteSource for FlakySource<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.check()?;
        self.inner.read(buf)
    }

    fn skip(&mut self, count: u64) -> io::Result<u64> {
        self.inner.skip(count)
    }

    fn seek(&mut self, position: SeekFrom) -> io::Result<u64> {
        self.inner.seek(position)
    }

    fn close(&mut self) -> io::Result<()> {
        self.inner.close()?;
        self.check()
    }

    fn offset(&self) -> u64 {
        self.inner.offset()
    }
}

/// Refuses every skip, like a pipe, so readers have to read through.
pub struct NoSkipSource<S> {
    inner: S,
    pub refused: u64,
}

impl<S> NoSkipSource<S> {
    pub fn new(inner: S) -> Self {
        Self { inner, refused: 0 }
    }
}

impl<S: ByteSource> ByteSource for NoSkipSource<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }

    fn skip(&mut self, _count: u64) -> io::Result<u64> {
        self.refused += 1;
        Err(io::Error::new(io::ErrorKind::Unsupported, "can't skip"))
    }

    fn seek(&mut self, position: SeekFrom) -> io::Result<u64> {
        self.inner.seek(position)
    }

    fn close(&mut self) -> io::Result<()> {
        self.inner.close()
    }

    fn offset(&self) -> u64 {
        self.inner.offset()
    }
}
