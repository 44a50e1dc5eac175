//! Payload compression for DATA objects.
//!
//! # Identity rules
//! A DATA object's compression is declared by bits in its object-header
//! `flags` byte; the file header must carry the matching incompatible flag.
//! At most one compression bit may be set on an object.
//!
//! # Framing
//! journald does not use the stock framing of every library:
//!   - XZ:   a complete `.xz` stream.
//!   - LZ4:  8-byte little-endian uncompressed size, then one raw LZ4 block.
//!   - ZSTD: one zstd frame.
//!
//! Compressed payloads are never modified in place; the seal covers the
//! compressed bytes, not the decoded text.

use std::io::{self, Cursor, Read, Write};

use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

use crate::header::{
    INCOMPATIBLE_COMPRESSED_LZ4, INCOMPATIBLE_COMPRESSED_XZ, INCOMPATIBLE_COMPRESSED_ZSTD,
};

pub const OBJECT_COMPRESSED_XZ:   u8 = 1 << 0;
pub const OBJECT_COMPRESSED_LZ4:  u8 = 1 << 1;
pub const OBJECT_COMPRESSED_ZSTD: u8 = 1 << 2;

const OBJECT_COMPRESSION_MASK: u8 =
    OBJECT_COMPRESSED_XZ | OBJECT_COMPRESSED_LZ4 | OBJECT_COMPRESSED_ZSTD;

/// Upper bound for a decoded payload; journald's own default field limit.
pub const MAX_DECOMPRESSED: usize = 64 * 1024 * 1024;

// ── Compression enum ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Xz,
    Lz4,
    Zstd,
}

impl Compression {
    /// Decode the compression declared by an object's flags byte.
    pub fn from_object_flags(flags: u8) -> Result<Self, CodecError> {
        match flags & OBJECT_COMPRESSION_MASK {
            0                      => Ok(Compression::None),
            OBJECT_COMPRESSED_XZ   => Ok(Compression::Xz),
            OBJECT_COMPRESSED_LZ4  => Ok(Compression::Lz4),
            OBJECT_COMPRESSED_ZSTD => Ok(Compression::Zstd),
            other                  => Err(CodecError::AmbiguousFlags(other)),
        }
    }

    /// Object-header flag bit for this compression.
    pub fn object_flag(self) -> u8 {
        match self {
            Compression::None => 0,
            Compression::Xz   => OBJECT_COMPRESSED_XZ,
            Compression::Lz4  => OBJECT_COMPRESSED_LZ4,
            Compression::Zstd => OBJECT_COMPRESSED_ZSTD,
        }
    }

    /// File-header incompatible flag a file must carry to contain this.
    pub fn incompatible_flag(self) -> u32 {
        match self {
            Compression::None => 0,
            Compression::Xz   => INCOMPATIBLE_COMPRESSED_XZ,
            Compression::Lz4  => INCOMPATIBLE_COMPRESSED_LZ4,
            Compression::Zstd => INCOMPATIBLE_COMPRESSED_ZSTD,
        }
    }

    /// Human-readable name (diagnostics and CLI).
    pub fn name(self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Xz   => "xz",
            Compression::Lz4  => "lz4",
            Compression::Zstd => "zstd",
        }
    }

    /// Parse from a CLI string.
    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "none" => Some(Compression::None),
            "xz"   => Some(Compression::Xz),
            "lz4"  => Some(Compression::Lz4),
            "zstd" => Some(Compression::Zstd),
            _      => None,
        }
    }

    pub fn compress(self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        match self {
            Compression::None => Ok(data.to_vec()),
            Compression::Xz => {
                let mut out = Vec::new();
                lzma_rs::xz_compress(&mut Cursor::new(data), &mut out)
                    .map_err(|e| CodecError::Compression(e.to_string()))?;
                Ok(out)
            }
            Compression::Lz4 => {
                let mut out = vec![0u8; 8];
                LittleEndian::write_u64(&mut out, data.len() as u64);
                out.extend(lz4_flex::block::compress(data));
                Ok(out)
            }
            Compression::Zstd => {
                zstd::encode_all(data, 3).map_err(|e| CodecError::Compression(e.to_string()))
            }
        }
    }

    pub fn decompress(self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        self.decompress_bounded(data, MAX_DECOMPRESSED)
    }

    /// Decode a payload of at most `limit` bytes, failing with `TooLarge`
    /// once the output would pass it.
    pub fn decompress_bounded(self, data: &[u8], limit: usize) -> Result<Vec<u8>, CodecError> {
        let too_large = CodecError::TooLarge { limit: limit as u64 };
        match self {
            Compression::None => {
                if data.len() > limit {
                    return Err(too_large);
                }
                Ok(data.to_vec())
            }
            Compression::Xz => {
                if xz_declared_size(data).map_or(false, |size| size > limit as u64) {
                    return Err(too_large);
                }
                let mut sink = BoundedSink::new(limit);
                match lzma_rs::xz_decompress(&mut Cursor::new(data), &mut sink) {
                    Ok(()) => Ok(sink.out),
                    Err(_) if sink.overflowed => Err(too_large),
                    Err(e) => Err(CodecError::Decompression(e.to_string())),
                }
            }
            Compression::Lz4 => {
                if data.len() < 8 {
                    return Err(CodecError::Decompression("lz4 payload too short".into()));
                }
                let size = LittleEndian::read_u64(&data[..8]);
                if size > limit as u64 {
                    return Err(too_large);
                }
                lz4_flex::block::decompress(&data[8..], size as usize)
                    .map_err(|e| CodecError::Decompression(e.to_string()))
            }
            Compression::Zstd => {
                let decoder = zstd::stream::read::Decoder::new(data)
                    .map_err(|e| CodecError::Decompression(e.to_string()))?;
                let mut out = Vec::new();
                decoder
                    .take(limit as u64 + 1)
                    .read_to_end(&mut out)
                    .map_err(|e| CodecError::Decompression(e.to_string()))?;
                if out.len() > limit {
                    return Err(too_large);
                }
                Ok(out)
            }
        }
    }
}

/// Sum of the uncompressed sizes an xz stream records in its index, read
/// from the stream footer without decoding any block.  `None` when the
/// footer or index does not parse; the decoder then reports the damage.
fn xz_declared_size(data: &[u8]) -> Option<u64> {
    if data.len() < 24 || &data[data.len() - 2..] != b"YZ" {
        return None;
    }
    let footer = &data[data.len() - 12..];
    let backward = (LittleEndian::read_u32(&footer[4..8]) as usize + 1) * 4;
    let start = data.len().checked_sub(12 + backward)?;
    let index = &data[start..data.len() - 12];
    if index[0] != 0 {
        return None;
    }
    let mut pos = 1;
    let records = read_xz_varint(index, &mut pos)?;
    let mut total = 0u64;
    for _ in 0..records {
        read_xz_varint(index, &mut pos)?;
        total = total.saturating_add(read_xz_varint(index, &mut pos)?);
    }
    Some(total)
}

fn read_xz_varint(buf: &[u8], pos: &mut usize) -> Option<u64> {
    let mut value = 0u64;
    for i in 0..9 {
        let byte = *buf.get(*pos)?;
        *pos += 1;
        value |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Some(value);
        }
    }
    None
}

/// Output buffer that refuses to grow past `limit` bytes.
struct BoundedSink {
    out:        Vec<u8>,
    limit:      usize,
    overflowed: bool,
}

impl BoundedSink {
    fn new(limit: usize) -> Self {
        Self { out: Vec::new(), limit, overflowed: false }
    }
}

impl Write for BoundedSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.out.len().saturating_add(buf.len()) > self.limit {
            self.overflowed = true;
            return Err(io::Error::new(io::ErrorKind::Other, "decompressed payload exceeds the limit"));
        }
        self.out.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

// ── Error type ───────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Compression error: {0}")]
    Compression(String),
    #[error("Decompression error: {0}")]
    Decompression(String),
    #[error("Object flags {0:#04x} declare more than one compression")]
    AmbiguousFlags(u8),
    #[error("Decompressed payload exceeds {limit} bytes")]
    TooLarge { limit: u64 },
}
