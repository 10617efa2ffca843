//! raz reads files inside ZIP and RAR archives at arbitrary offsets,
//! even though the decoder underneath only ever moves forward:
//!
//! ```no_run
//! # use raz::*;
//! let source = FileSource::open("foo.zip")?;
//! let mut archive = RandomAccessArchive::new(source, MemoryHeaderCache::new());
//! archive.init()?;
//!
//! while let Some(entry) = archive.list_next_entry()? {
//!     if entry.path != "some/specific/file" {
//!         continue;
//!     }
//!     // Reads can land anywhere in the entry.
//!     let tail = archive.read_at(entry.size.saturating_sub(16), 16)?.to_vec();
//!     // Going backwards rereads the archive up to this entry, then decodes forward.
//!     let head = archive.read_at(0, 16)?;
//!     println!("{:?} ... {:?}", head, tail);
//!     break;
//! }
//! archive.cleanup()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! Compressed archive formats are made to be read front to back.
//! A deflated file has no index: to get at its millionth byte,
//! you decode the 999,999 before it. And if the archive lives somewhere slow
//! (across IPC, on the far end of a network), going back for something
//! means asking for it all over again.
//!
//! So raz doesn't try to seek within entries. It drives a forward-only
//! [`SequentialCodec`] through a [`StreamBridge`] that pulls from any
//! [`ByteSource`], and lets reads:
//!
//! - land in a bounded window of already-decoded bytes (say, after
//!   [`maybe_decompress_ahead()`] guessed the next read),
//!
//! - skip ahead by decoding and discarding,
//!
//! - or go backwards by starting the archive over.
//!   Header bytes are remembered in a [`HeaderCache`] along the way,
//!   so listing back up to an entry needn't hit the source again.
//!
//! Each [`RandomAccessArchive`] is one session, used from one thread at a time.
//! Sessions are independent, so run as many side by side as you like.
//! Any failure poisons the session; make a new one to carry on.
//!
//! [`SequentialCodec`]: codec/trait.SequentialCodec.html
//! [`StreamBridge`]: bridge/struct.StreamBridge.html
//! [`ByteSource`]: source/trait.ByteSource.html
//! [`HeaderCache`]: cache/trait.HeaderCache.html
//! [`RandomAccessArchive`]: read/struct.RandomAccessArchive.html
//! [`maybe_decompress_ahead()`]: read/struct.RandomAccessArchive.html#method.maybe_decompress_ahead

pub mod bridge;
pub mod cache;
pub mod codec;
pub mod config;
pub mod read;
pub mod result;
pub mod source;

pub use cache::{HeaderCache, MemoryHeaderCache, NoHeaderCache};
pub use codec::{Entry, Format, SequentialCodec, StreamingCodec};
pub use config::Tuning;
pub use read::{RandomAccessArchive, ReadStats};
pub use result::{ArchiveError, ArchiveResult};
pub use source::{ByteSource, FileSource, MemorySource, ReaderSource};

mod arch;
mod crc;
