//! Chunk compression codecs for the Windows Imaging (WIM) archive format.
//!
//! WIM resources are stored as sequences of independently addressable chunks,
//! each compressed with one of three Microsoft formats: XPRESS, LZX, or LZMS.
//! This crate implements all three compressors and decompressors over
//! caller-owned byte slices. It performs no file I/O; the resource layer in
//! the `wimarc` crate drives it.
//!
//! All three formats read their compressed input as 16-bit little-endian
//! coding units with bits ordered high to low, and all three share one
//! canonical-Huffman decode-table builder. LZMS additionally interleaves a
//! range-coded bitstream (read forwards) with the Huffman bitstream (read
//! backwards from the end of the chunk).
//!
//! Chunks are compressed independently, except that an LZMS compressor or
//! decompressor created for a solid resource carries its match window across
//! chunks: the `buf`/`start` calling convention below lets matches reference
//! bytes produced by earlier chunks of the same resource.

#![forbid(unsafe_code)]
#![forbid(unused_must_use)]
#![warn(missing_docs)]

mod bits;
mod huffman;
mod lzms;
mod lzx;
mod matchfind;
mod xpress;

pub use huffman::{lens_to_codewords, make_decode_table, CodeBuilder};

/// Uncompressed chunk size used by classic (non-solid) WIM resources.
pub const WIM_CHUNK_SIZE: u32 = 32768;

/// Largest uncompressed chunk size accepted by any codec in this crate.
pub const MAX_CHUNK_SIZE: u32 = 1 << 20;

/// Identifies one of the WIM compression formats.
///
/// The discriminants are the stable on-disk codes used by the solid-resource
/// header.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash)]
#[repr(u32)]
pub enum CompressionType {
    /// No compression; chunks are stored raw.
    None = 0,
    /// LZ77 + canonical Huffman with a 512-symbol combined alphabet.
    Xpress = 1,
    /// LZ77 + canonical Huffman with pretree-coded code lengths and an LRU
    /// offset queue.
    Lzx = 2,
    /// Range coding + adaptive Huffman; supports shared-dictionary (solid)
    /// operation.
    Lzms = 3,
}

impl CompressionType {
    /// Returns the on-disk code for this compression type.
    pub fn to_code(self) -> u32 {
        self as u32
    }

    /// Parses an on-disk compression-type code.
    pub fn try_from_code(code: u32) -> Result<Self, CodecError> {
        match code {
            0 => Ok(Self::None),
            1 => Ok(Self::Xpress),
            2 => Ok(Self::Lzx),
            3 => Ok(Self::Lzms),
            _ => Err(CodecError::UnsupportedType(code)),
        }
    }

    /// Whether `chunk_size` is valid for this compression type.
    ///
    /// Chunk sizes must be powers of two. Each format constrains the range:
    /// XPRESS 2^12..=2^16, LZX 2^15..=2^21 (capped at [`MAX_CHUNK_SIZE`]
    /// here), LZMS 2^15..=2^20.
    pub fn is_valid_chunk_size(self, chunk_size: u32) -> bool {
        if !chunk_size.is_power_of_two() {
            return false;
        }
        let order = chunk_size.trailing_zeros();
        match self {
            Self::None => true,
            Self::Xpress => (12..=16).contains(&order),
            Self::Lzx => (15..=20).contains(&order),
            Self::Lzms => (15..=20).contains(&order),
        }
    }
}

impl std::fmt::Display for CompressionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::None => "none",
            Self::Xpress => "XPRESS",
            Self::Lzx => "LZX",
            Self::Lzms => "LZMS",
        })
    }
}

/// Errors reported by the codec layer.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum CodecError {
    /// The compression-type code is not one this crate implements.
    UnsupportedType(u32),
    /// The chunk size is out of range or not a power of two for the format.
    InvalidChunkSize(u32),
    /// The compressed bitstream is malformed.
    Corrupt,
}

impl std::error::Error for CodecError {}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnsupportedType(code) => {
                write!(f, "unsupported compression type code {code}")
            }
            Self::InvalidChunkSize(size) => {
                write!(f, "invalid chunk size {size} for this compression format")
            }
            Self::Corrupt => f.write_str("compressed data is invalid"),
        }
    }
}

enum CompressorInner {
    Xpress(xpress::XpressCompressor),
    Lzx(lzx::LzxCompressor),
    Lzms(lzms::LzmsCompressor),
}

/// A reusable chunk compressor for one compression format.
///
/// One instance owns all scratch allocations for its format and is reused
/// across chunks. Instances are `Send` but not `Sync`; the parallel chunk
/// pipeline gives each worker thread its own compressor.
pub struct Compressor {
    ty: CompressionType,
    max_chunk_size: u32,
    inner: CompressorInner,
}

impl Compressor {
    /// Creates a compressor for chunks of at most `max_chunk_size` bytes.
    pub fn new(ty: CompressionType, max_chunk_size: u32) -> Result<Self, CodecError> {
        if !ty.is_valid_chunk_size(max_chunk_size) {
            return Err(CodecError::InvalidChunkSize(max_chunk_size));
        }
        let inner = match ty {
            CompressionType::None => return Err(CodecError::UnsupportedType(0)),
            CompressionType::Xpress => {
                CompressorInner::Xpress(xpress::XpressCompressor::new(max_chunk_size))
            }
            CompressionType::Lzx => CompressorInner::Lzx(lzx::LzxCompressor::new(max_chunk_size)),
            CompressionType::Lzms => {
                CompressorInner::Lzms(lzms::LzmsCompressor::new(max_chunk_size))
            }
        };
        Ok(Self {
            ty,
            max_chunk_size,
            inner,
        })
    }

    /// The compression format this compressor implements.
    pub fn compression_type(&self) -> CompressionType {
        self.ty
    }

    /// The maximum uncompressed chunk size this compressor accepts.
    pub fn max_chunk_size(&self) -> u32 {
        self.max_chunk_size
    }

    /// Compresses the chunk `buf[start..]`, treating `buf[..start]` as
    /// dictionary context (prior chunks of the same solid resource; empty for
    /// non-solid chunks).
    ///
    /// Returns the number of bytes written into `out`, or `None` when the
    /// chunk does not compress to fewer bytes than its uncompressed size —
    /// the caller then stores the chunk raw. `out` must be at least as large
    /// as the chunk.
    pub fn compress(&mut self, buf: &[u8], start: usize, out: &mut [u8]) -> Option<usize> {
        let chunk_len = buf.len() - start;
        assert!(chunk_len <= self.max_chunk_size as usize);
        assert!(out.len() >= chunk_len);
        if chunk_len == 0 {
            return None;
        }
        match &mut self.inner {
            CompressorInner::Xpress(c) => c.compress(&buf[start..], out),
            CompressorInner::Lzx(c) => c.compress(&buf[start..], out),
            CompressorInner::Lzms(c) => c.compress(buf, start, out),
        }
    }
}

enum DecompressorInner {
    Xpress(xpress::XpressDecompressor),
    Lzx(lzx::LzxDecompressor),
    Lzms(Box<lzms::LzmsDecompressor>),
}

/// A reusable chunk decompressor for one compression format.
pub struct Decompressor {
    ty: CompressionType,
    max_chunk_size: u32,
    inner: DecompressorInner,
}

impl Decompressor {
    /// Creates a decompressor for chunks of at most `max_chunk_size` bytes.
    pub fn new(ty: CompressionType, max_chunk_size: u32) -> Result<Self, CodecError> {
        if !ty.is_valid_chunk_size(max_chunk_size) {
            return Err(CodecError::InvalidChunkSize(max_chunk_size));
        }
        let inner = match ty {
            CompressionType::None => return Err(CodecError::UnsupportedType(0)),
            CompressionType::Xpress => {
                DecompressorInner::Xpress(xpress::XpressDecompressor::new())
            }
            CompressionType::Lzx => {
                DecompressorInner::Lzx(lzx::LzxDecompressor::new(max_chunk_size))
            }
            CompressionType::Lzms => {
                DecompressorInner::Lzms(Box::new(lzms::LzmsDecompressor::new()))
            }
        };
        Ok(Self {
            ty,
            max_chunk_size,
            inner,
        })
    }

    /// The compression format this decompressor implements.
    pub fn compression_type(&self) -> CompressionType {
        self.ty
    }

    /// Decompresses `cdata` into `buf[start..]`, treating `buf[..start]` as
    /// dictionary context (prior chunks of the same solid resource; `start`
    /// is 0 for non-solid chunks). The chunk's uncompressed size is
    /// `buf.len() - start` and must be known by the caller.
    pub fn decompress(
        &mut self,
        cdata: &[u8],
        buf: &mut [u8],
        start: usize,
    ) -> Result<(), CodecError> {
        let chunk_len = buf.len() - start;
        assert!(chunk_len <= self.max_chunk_size as usize);
        if chunk_len == 0 {
            return Ok(());
        }
        if cdata.is_empty() || cdata.len() > chunk_len {
            return Err(CodecError::Corrupt);
        }
        match &mut self.inner {
            DecompressorInner::Xpress(d) => d.decompress(cdata, &mut buf[start..]),
            DecompressorInner::Lzx(d) => d.decompress(cdata, &mut buf[start..]),
            DecompressorInner::Lzms(d) => d.decompress(cdata, buf, start),
        }
    }
}

#[cfg(test)]
mod tests;
