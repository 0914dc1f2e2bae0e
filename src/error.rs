// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::coding::{DecodeError, EncodeError};

/// Represents errors that can occur while using a `BTreeDB` or a packed
/// asset archive.
#[derive(Debug)]
pub enum Error {
    /// I/O error
    Io(std::io::Error),

    /// Serialization failed
    Encode(EncodeError),

    /// Deserialization failed
    Decode(DecodeError),

    /// On-disk data did not match the format this crate understands
    /// (bad magic bytes, out-of-range block kind, truncated record, ...).
    Format {
        /// What was being parsed when the mismatch was found
        context: &'static str,
    },

    /// A caller-supplied argument was out of range for the database or
    /// archive it was passed to (key too long, block index out of bounds,
    /// compression level unsupported, ...).
    InvalidArgument {
        /// Human-readable description of the violated constraint
        message: String,
    },

    /// The free block list or root pointers are exhausted or inconsistent;
    /// the database cannot safely continue without intervention.
    Exhausted,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BlockVaultError: {self:?}")
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Encode(e) => Some(e),
            Self::Decode(e) => Some(e),
            Self::Format { .. } | Self::InvalidArgument { .. } | Self::Exhausted => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<EncodeError> for Error {
    fn from(value: EncodeError) -> Self {
        Self::Encode(value)
    }
}

impl From<DecodeError> for Error {
    fn from(value: DecodeError) -> Self {
        Self::Decode(value)
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;
