// src/compression/mod.rs
//! Decompression of repository index files.
//!
//! Yum and Debian repositories serve their metadata compressed (gzip or xz,
//! with zstd appearing in newer Debian archives). The scrapers download those
//! indexes as opaque buffers and hand them here; the format is detected from
//! magic bytes rather than the file extension, because `by-hash` paths carry
//! no extension at all.

use std::io::{self, Read};
use thiserror::Error;

/// Decompression errors
#[derive(Error, Debug)]
pub enum CompressionError {
    #[error("failed to create {format} decoder: {source}")]
    DecoderCreation {
        format: &'static str,
        source: io::Error,
    },

    #[error("failed to decompress {format} data: {source}")]
    Decompression {
        format: &'static str,
        source: io::Error,
    },
}

/// Compression formats found in repository metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionFormat {
    /// No compression (raw data)
    None,
    /// Gzip compression (.gz)
    Gzip,
    /// XZ/LZMA compression (.xz)
    Xz,
    /// Zstandard compression (.zst)
    Zstd,
}

impl CompressionFormat {
    /// Detect compression format from magic bytes.
    ///
    /// Magic bytes:
    /// - Gzip: `1f 8b 08` (the third byte is the deflate method, which is
    ///   the only method in use)
    /// - XZ: `fd 37 7a 58 5a 00`
    /// - Zstd: `28 b5 2f fd`
    pub fn from_magic_bytes(data: &[u8]) -> Self {
        if data.len() >= 3 && data[0] == 0x1f && data[1] == 0x8b && data[2] == 0x08 {
            Self::Gzip
        } else if data.len() >= 6
            && data[0] == 0xfd
            && data[1] == 0x37
            && data[2] == 0x7a
            && data[3] == 0x58
            && data[4] == 0x5a
            && data[5] == 0x00
        {
            Self::Xz
        } else if data.len() >= 4
            && data[0] == 0x28
            && data[1] == 0xb5
            && data[2] == 0x2f
            && data[3] == 0xfd
        {
            Self::Zstd
        } else {
            Self::None
        }
    }

    /// Human-readable name for this format
    pub fn name(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Gzip => "gzip",
            Self::Xz => "xz",
            Self::Zstd => "zstd",
        }
    }
}

impl std::fmt::Display for CompressionFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Create a decompressing reader for the given format.
///
/// For `CompressionFormat::None`, returns the reader unchanged.
pub fn create_decoder<'a, R: Read + 'a>(
    reader: R,
    format: CompressionFormat,
) -> Result<Box<dyn Read + 'a>, CompressionError> {
    match format {
        CompressionFormat::None => Ok(Box::new(reader)),
        CompressionFormat::Gzip => Ok(Box::new(flate2::read::GzDecoder::new(reader))),
        CompressionFormat::Xz => Ok(Box::new(xz2::read::XzDecoder::new(reader))),
        CompressionFormat::Zstd => {
            let decoder =
                zstd::Decoder::new(reader).map_err(|e| CompressionError::DecoderCreation {
                    format: "zstd",
                    source: e,
                })?;
            Ok(Box::new(decoder))
        }
    }
}

/// Decompress a byte slice using the specified format
pub fn decompress(data: &[u8], format: CompressionFormat) -> Result<Vec<u8>, CompressionError> {
    let mut decoder = create_decoder(data, format)?;
    let mut output = Vec::new();
    decoder
        .read_to_end(&mut output)
        .map_err(|e| CompressionError::Decompression {
            format: format.name(),
            source: e,
        })?;
    Ok(output)
}

/// Decompress a downloaded index, detecting the format from magic bytes.
///
/// Data that matches no known magic is returned unchanged, so this can be
/// applied unconditionally to buffers that may or may not be compressed.
pub fn decompress_auto(data: &[u8]) -> Result<Vec<u8>, CompressionError> {
    let format = CompressionFormat::from_magic_bytes(data);
    decompress(data, format)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Minimal gzip of "hello"
    const GZIP_HELLO: &[u8] = &[
        0x1f, 0x8b, 0x08, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x03, 0xcb, 0x48, 0xcd, 0xc9, 0xc9,
        0x07, 0x00, 0x86, 0xa6, 0x10, 0x36, 0x05, 0x00, 0x00, 0x00,
    ];

    #[test]
    fn test_format_from_magic_bytes() {
        assert_eq!(
            CompressionFormat::from_magic_bytes(&[0x1f, 0x8b, 0x08, 0x00]),
            CompressionFormat::Gzip
        );
        assert_eq!(
            CompressionFormat::from_magic_bytes(&[0xfd, 0x37, 0x7a, 0x58, 0x5a, 0x00]),
            CompressionFormat::Xz
        );
        assert_eq!(
            CompressionFormat::from_magic_bytes(&[0x28, 0xb5, 0x2f, 0xfd]),
            CompressionFormat::Zstd
        );
        assert_eq!(
            CompressionFormat::from_magic_bytes(&[0x00, 0x00, 0x00, 0x00]),
            CompressionFormat::None
        );
        // too short for any magic
        assert_eq!(
            CompressionFormat::from_magic_bytes(&[0x1f]),
            CompressionFormat::None
        );
        // gzip magic with an unexpected method byte is not treated as gzip
        assert_eq!(
            CompressionFormat::from_magic_bytes(&[0x1f, 0x8b, 0x00]),
            CompressionFormat::None
        );
    }

    #[test]
    fn test_decompress_gzip() {
        let result = decompress(GZIP_HELLO, CompressionFormat::Gzip).unwrap();
        assert_eq!(result, b"hello");
    }

    #[test]
    fn test_decompress_auto_detects_gzip() {
        let result = decompress_auto(GZIP_HELLO).unwrap();
        assert_eq!(result, b"hello");
    }

    #[test]
    fn test_decompress_auto_passes_plain_data_through() {
        let data = b"Package: xz-utils\n";
        let result = decompress_auto(data).unwrap();
        assert_eq!(result, data);
    }
}
