// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Bulk payload compression.
//!
//! The block-file backend itself never compresses block contents — the
//! on-disk block layout is byte-exact and has no room for a compression
//! tag. This module exists for callers that want to compress a bulk
//! payload (e.g. an asset blob) before handing it to a device, independent
//! of the B+ tree or archive formats.
//!
//! Uses `zstd`'s long-distance-matching mode with an explicit window log,
//! rather than the `lz4_flex` dependency carried elsewhere in this crate's
//! lineage, because nothing in the LZ4 family exposes a configurable
//! window log. See `DESIGN.md` for the reasoning.

use crate::coding::{Decode, DecodeError, Encode, EncodeError};
use std::io::{Read, Write};

/// Window log used when compressing (`ZSTD_c_windowLog`).
const COMPRESS_WINDOW_LOG: i32 = 24;

/// Window log advertised to the decompressor
/// (`ZSTD_c_enableLongDistanceMatching`'s paired window log, always
/// allowed to be one notch larger than what was used to compress so that
/// payloads produced by a future, slightly larger window remain
/// decodable).
const DECOMPRESS_WINDOW_LOG_MAX: i32 = 25;

/// Compression algorithm tag, stored alongside a compressed payload.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CompressionType {
    /// No compression.
    None,

    /// Zstandard with long-distance matching enabled.
    Zstd,
}

impl Encode for CompressionType {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        let tag: u8 = match self {
            Self::None => 0,
            Self::Zstd => 1,
        };
        writer.write_all(&[tag])?;
        Ok(())
    }
}

impl Decode for CompressionType {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let mut tag = [0u8; 1];
        reader.read_exact(&mut tag)?;
        match tag[0] {
            0 => Ok(Self::None),
            1 => Ok(Self::Zstd),
            tag => Err(DecodeError::InvalidTag(("CompressionType", tag))),
        }
    }
}

impl std::fmt::Display for CompressionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "no compression"),
            Self::Zstd => write!(f, "zstd (window log {COMPRESS_WINDOW_LOG})"),
        }
    }
}

/// Compresses `data` using `compression`.
pub fn compress(data: &[u8], compression: CompressionType) -> crate::Result<Vec<u8>> {
    match compression {
        CompressionType::None => Ok(data.to_vec()),
        CompressionType::Zstd => {
            let mut encoder = zstd::Encoder::new(Vec::new(), 0)
                .map_err(std::io::Error::from)?;
            encoder
                .long_distance_matching(true)
                .map_err(std::io::Error::from)?;
            encoder
                .window_log(COMPRESS_WINDOW_LOG as u32)
                .map_err(std::io::Error::from)?;
            encoder.write_all(data)?;
            Ok(encoder.finish()?)
        }
    }
}

/// Decompresses `data`, which must have been produced by [`compress`] with
/// the same [`CompressionType`].
pub fn decompress(data: &[u8], compression: CompressionType) -> crate::Result<Vec<u8>> {
    match compression {
        CompressionType::None => Ok(data.to_vec()),
        CompressionType::Zstd => {
            let mut decoder = zstd::Decoder::new(data).map_err(std::io::Error::from)?;
            decoder
                .window_log_max(DECOMPRESS_WINDOW_LOG_MAX as u32)
                .map_err(std::io::Error::from)?;
            let mut out = Vec::new();
            decoder.read_to_end(&mut out)?;
            Ok(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn compression_type_tag_round_trip() {
        for ty in [CompressionType::None, CompressionType::Zstd] {
            let bytes = ty.encode_into_vec();
            let mut cursor = &bytes[..];
            assert_eq!(CompressionType::decode_from(&mut cursor).unwrap(), ty);
        }
    }

    #[test]
    fn invalid_tag_is_rejected() {
        let bytes = [0xffu8];
        let mut cursor = &bytes[..];
        assert!(matches!(
            CompressionType::decode_from(&mut cursor),
            Err(DecodeError::InvalidTag(("CompressionType", 0xff)))
        ));
    }

    #[test]
    fn zstd_round_trips_a_repetitive_payload() {
        let payload = b"the quick brown fox jumps over the lazy dog ".repeat(200);
        let compressed = compress(&payload, CompressionType::Zstd).unwrap();
        assert!(compressed.len() < payload.len());
        let decompressed = decompress(&compressed, CompressionType::Zstd).unwrap();
        assert_eq!(decompressed, payload);
    }

    #[test]
    fn none_is_a_pass_through() {
        let payload = b"raw bytes".to_vec();
        let compressed = compress(&payload, CompressionType::None).unwrap();
        assert_eq!(compressed, payload);
        assert_eq!(decompress(&compressed, CompressionType::None).unwrap(), payload);
    }
}
