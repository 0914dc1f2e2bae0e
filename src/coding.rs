// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use std::io::{Read, Write};

/// Error during serialization
#[derive(Debug)]
pub enum EncodeError {
    /// I/O error
    Io(std::io::Error),

    /// A compression level outside the codec's supported range was given
    InvalidCompressionLevel(i32),
}

impl std::fmt::Display for EncodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "EncodeError(io): {e}"),
            Self::InvalidCompressionLevel(level) => {
                write!(f, "EncodeError(invalid compression level {level})")
            }
        }
    }
}

impl From<std::io::Error> for EncodeError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl std::error::Error for EncodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::InvalidCompressionLevel(_) => None,
        }
    }
}

/// Error during deserialization
#[derive(Debug)]
pub enum DecodeError {
    /// I/O error
    Io(std::io::Error),

    /// An enum tag byte did not correspond to any known variant.
    ///
    /// Carries the name of the enum being decoded and the offending byte.
    InvalidTag((&'static str, u8)),

    /// Magic bytes at the start of a record did not match what was expected.
    InvalidMagic(&'static str),

    /// A VLQ-encoded integer ran past the maximum permitted byte length
    /// without terminating.
    InvalidVlq,

    /// A length-prefixed field claimed a size that could not possibly fit
    /// in the remaining input.
    InvalidLength(&'static str),
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "DecodeError(io): {e}"),
            Self::InvalidTag((name, tag)) => write!(f, "DecodeError: invalid tag {tag} for {name}"),
            Self::InvalidMagic(name) => write!(f, "DecodeError: invalid magic bytes for {name}"),
            Self::InvalidVlq => write!(f, "DecodeError: malformed VLQ integer"),
            Self::InvalidLength(what) => write!(f, "DecodeError: invalid length for {what}"),
        }
    }
}

impl From<std::io::Error> for DecodeError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl std::error::Error for DecodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

/// Trait to serialize stuff
pub trait Encode {
    /// Serializes into writer.
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError>;

    /// Serializes into vector.
    fn encode_into_vec(&self) -> Vec<u8> {
        let mut v = vec![];
        self.encode_into(&mut v).expect("cannot fail writing to a Vec");
        v
    }
}

/// Trait to deserialize stuff
pub trait Decode {
    /// Deserializes from reader.
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError>
    where
        Self: Sized;
}
