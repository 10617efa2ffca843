//! Error types and the related `Result<T>`

use std::borrow::Cow;
use std::io;

use thiserror::Error;

pub type ArchiveResult<T> = Result<T, ArchiveError>;

#[derive(Debug, Error)]
pub enum ArchiveError {
    /// Creating the codec, registering a format, or opening the archive failed.
    #[error("Couldn't {step}: {cause}")]
    Initialization {
        step: &'static str,
        cause: Box<ArchiveError>,
    },

    /// The codec failed while moving to the next entry or decoding one.
    #[error("Couldn't {operation}: {cause}")]
    Codec {
        operation: &'static str,
        cause: Box<ArchiveError>,
    },

    /// The byte source failed while reading, skipping, seeking or closing.
    #[error("Volume reader error while {operation}: {error}")]
    SourceIo {
        operation: &'static str,
        error: io::Error,
    },

    /// The archive contained invalid data per its format.
    #[error("Invalid archive: {0}")]
    InvalidArchive(Cow<'static, str>),

    /// Decoding a UTF-8 name failed
    #[error("Invalid UTF-8")]
    Encoding(#[from] std::str::Utf8Error),

    /// The archive uses an unsupported feature
    #[error("Unsupported archive: {0}")]
    UnsupportedArchive(String),

    /// The archive stopped matching what we read from it earlier
    /// (an entry vanished on replay, or an entry ended early).
    #[error("Inconsistent archive: {0}")]
    Consistency(String),

    /// The codec was used before `init()` succeeded (or after cleanup).
    #[error("Archive isn't open")]
    NotOpen,

    /// An earlier failure left this instance unusable.
    /// It must be discarded and recreated.
    #[error("Archive unusable after an earlier failure: {0}")]
    Poisoned(String),

    /// A `Tuning` with unusable sizes was provided.
    #[error("Invalid tuning: {0}")]
    InvalidTuning(String),

    /// A 64-bit size didn't fit in a usize, probably on a 32-bit system.
    #[error("Archive too large for address space")]
    InsufficientAddressSpace,
}

impl ArchiveError {
    pub(crate) fn init(step: &'static str, cause: ArchiveError) -> Self {
        ArchiveError::Initialization {
            step,
            cause: Box::new(cause),
        }
    }

    /// Says what the codec was doing when it failed.
    /// Source failures already say so and are left alone.
    pub(crate) fn codec(operation: &'static str, cause: ArchiveError) -> Self {
        match cause {
            ArchiveError::SourceIo { .. } => cause,
            cause => ArchiveError::Codec {
                operation,
                cause: Box::new(cause),
            },
        }
    }

    pub(crate) fn source_io(operation: &'static str, error: io::Error) -> Self {
        ArchiveError::SourceIo { operation, error }
    }

    pub(crate) fn invalid<M: Into<Cow<'static, str>>>(message: M) -> Self {
        ArchiveError::InvalidArchive(message.into())
    }
}
