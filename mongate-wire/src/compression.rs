//! Compressors usable inside an OP_COMPRESSED envelope.
//!
//! The compressor is chosen by the client per message; a reply to a
//! compressed request is compressed with the same compressor id.

use crate::error::WireError;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{Read, Write};
use std::str::FromStr;

/// Default zstd level used for replies.
const ZSTD_LEVEL: i32 = 6;

/// Compressor ids as assigned by the wire protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compressor {
    Noop,
    Snappy,
    Zlib,
    Zstd,
}

impl Compressor {
    pub const ALL: [Compressor; 4] = [
        Compressor::Noop,
        Compressor::Snappy,
        Compressor::Zlib,
        Compressor::Zstd,
    ];

    /// Returns the one-byte compressor id.
    pub fn id(&self) -> u8 {
        match self {
            Compressor::Noop => 0,
            Compressor::Snappy => 1,
            Compressor::Zlib => 2,
            Compressor::Zstd => 3,
        }
    }

    pub fn from_id(id: u8) -> Result<Self, WireError> {
        match id {
            0 => Ok(Compressor::Noop),
            1 => Ok(Compressor::Snappy),
            2 => Ok(Compressor::Zlib),
            3 => Ok(Compressor::Zstd),
            other => Err(WireError::UnknownCompressor(other)),
        }
    }

    /// Returns the name used in handshake negotiation.
    pub fn name(&self) -> &'static str {
        match self {
            Compressor::Noop => "noop",
            Compressor::Snappy => "snappy",
            Compressor::Zlib => "zlib",
            Compressor::Zstd => "zstd",
        }
    }

    pub fn compress(&self, data: &[u8]) -> Result<Vec<u8>, WireError> {
        match self {
            Compressor::Noop => Ok(data.to_vec()),
            Compressor::Snappy => snap::raw::Encoder::new()
                .compress_vec(data)
                .map_err(|e| self.error(e)),
            Compressor::Zlib => {
                let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
                encoder.write_all(data).map_err(|e| self.error(e))?;
                encoder.finish().map_err(|e| self.error(e))
            }
            Compressor::Zstd => zstd::bulk::compress(data, ZSTD_LEVEL).map_err(|e| self.error(e)),
        }
    }

    /// Decompresses `data`, which must expand to exactly `uncompressed_size` bytes.
    pub fn decompress(&self, data: &[u8], uncompressed_size: i32) -> Result<Vec<u8>, WireError> {
        if uncompressed_size < 0 || uncompressed_size as usize > crate::MAX_MESSAGE_SIZE {
            return Err(WireError::InvalidMessageLength(uncompressed_size));
        }
        let expected = uncompressed_size as usize;

        let out = match self {
            Compressor::Noop => data.to_vec(),
            Compressor::Snappy => {
                // The preamble sizes the output buffer; check it before allocating.
                let claimed = snap::raw::decompress_len(data).map_err(|e| self.error(e))?;
                if claimed != expected {
                    return Err(WireError::UncompressedSizeMismatch {
                        declared: uncompressed_size,
                        actual: claimed,
                    });
                }
                snap::raw::Decoder::new()
                    .decompress_vec(data)
                    .map_err(|e| self.error(e))?
            }
            Compressor::Zlib => {
                let mut out = Vec::with_capacity(expected);
                // Read one byte past the declared size so oversized payloads are caught.
                ZlibDecoder::new(data)
                    .take(expected as u64 + 1)
                    .read_to_end(&mut out)
                    .map_err(|e| self.error(e))?;
                out
            }
            Compressor::Zstd => zstd::bulk::decompress(data, expected).map_err(|e| self.error(e))?,
        };

        if out.len() != expected {
            return Err(WireError::UncompressedSizeMismatch {
                declared: uncompressed_size,
                actual: out.len(),
            });
        }
        Ok(out)
    }

    fn error(&self, e: impl fmt::Display) -> WireError {
        WireError::Compression {
            compressor: self.name(),
            message: e.to_string(),
        }
    }
}

impl fmt::Display for Compressor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Compressor {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "noop" => Ok(Compressor::Noop),
            "snappy" => Ok(Compressor::Snappy),
            "zlib" => Ok(Compressor::Zlib),
            "zstd" => Ok(Compressor::Zstd),
            other => Err(WireError::UnknownCompressorName(other.to_string())),
        }
    }
}
