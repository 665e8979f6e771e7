//! Reading resources: possibly-compressed byte ranges holding blob data.
//!
//! A non-solid resource holds exactly one blob, stored raw or as
//! independently compressed chunks behind a chunk offset table. A solid
//! resource holds many blobs back to back in one uncompressed stream whose
//! chunks share dictionary state; its own 16-byte header overrides the
//! archive's compression parameters. Pipable resources prefix the blob with
//! a [`crate::header::PipableBlobHeaderDisk`] and each compressed chunk
//! with its 4-byte stored size, and put the chunk table after the chunks.
//!
//! Reads are lazy and partial: only the chunks that bracket the requested
//! byte range are fetched and decompressed. A small per-archive LRU keeps
//! recently decompressed chunks so sequential reads stay O(1) amortized.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, OnceLock};

use sync_file::{RandomAccessFile, ReadAt};
use tracing::trace;
use zerocopy::FromBytes;

use crate::error::{Result, WimError};
use crate::header::{ResourceFlags, ResourceHeader, SolidHeaderDisk};
use crate::sha1::Sha1Hash;
use wimcodec::{CompressionType, Decompressor};

/// Size of the pipable per-blob header.
pub(crate) const PWM_BLOB_HEADER_SIZE: u64 = 44;
/// Size of the pipable per-chunk size prefix.
pub(crate) const PWM_CHUNK_HEADER_SIZE: u64 = 4;
/// Size of the solid resource header.
pub(crate) const SOLID_HEADER_SIZE: u64 = 16;

/// Decompressed-chunk LRU depth per archive.
const CHUNK_CACHE_ENTRIES: usize = 8;

/// Compression parameters of a solid resource, read from its own header.
#[derive(Copy, Clone, Debug)]
pub(crate) struct SolidInfo {
    pub res_usize: u64,
    pub chunk_size: u32,
    pub ctype: CompressionType,
}

/// A contiguous byte range in some WIM file that blob descriptors point
/// into. Shared by every blob stored in the range.
pub(crate) struct ResourceDescriptor {
    pub file: Arc<RandomAccessFile>,
    pub reshdr: ResourceHeader,
    /// The containing archive's compression format (non-solid resources).
    pub ctype: CompressionType,
    /// The containing archive's chunk size (non-solid resources).
    pub chunk_size: u32,
    pub pipable: bool,
    solid: OnceLock<SolidInfo>,
    /// Hashes of the blobs stored in this resource; the raw-copy path uses
    /// this to decide how much of a solid resource is still referenced.
    pub blobs: Mutex<Vec<Sha1Hash>>,
}

impl ResourceDescriptor {
    pub fn new(
        file: Arc<RandomAccessFile>,
        reshdr: ResourceHeader,
        ctype: CompressionType,
        chunk_size: u32,
        pipable: bool,
    ) -> Self {
        Self {
            file,
            reshdr,
            ctype,
            chunk_size,
            pipable,
            solid: OnceLock::new(),
            blobs: Mutex::new(Vec::new()),
        }
    }

    pub fn is_compressed(&self) -> bool {
        self.reshdr.flags.contains(ResourceFlags::COMPRESSED)
    }

    pub fn is_solid(&self) -> bool {
        self.reshdr.flags.contains(ResourceFlags::SOLID)
    }

    /// Uncompressed size of the resource's stream.
    pub fn uncompressed_size(&self) -> Result<u64> {
        if self.is_solid() {
            Ok(self.solid_info()?.res_usize)
        } else {
            Ok(self.reshdr.uncompressed_size)
        }
    }

    /// Reads (once) and returns the solid resource header.
    pub fn solid_info(&self) -> Result<SolidInfo> {
        if let Some(info) = self.solid.get() {
            return Ok(*info);
        }
        let mut bytes = [0u8; SOLID_HEADER_SIZE as usize];
        self.read_exact(&mut bytes, self.reshdr.offset_in_wim)?;
        let disk = SolidHeaderDisk::ref_from_bytes(&bytes)
            .map_err(|_| WimError::UnexpectedEof)?;
        let ctype = CompressionType::try_from_code(disk.compression_format.get())?;
        let chunk_size = disk.chunk_size.get();
        if ctype != CompressionType::None && !ctype.is_valid_chunk_size(chunk_size) {
            return Err(WimError::InvalidChunkSize(chunk_size));
        }
        let info = SolidInfo {
            res_usize: disk.res_usize.get(),
            chunk_size,
            ctype,
        };
        Ok(*self.solid.get_or_init(|| info))
    }

    fn read_exact(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        self.file
            .read_exact_at(buf, offset)
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::UnexpectedEof => WimError::UnexpectedEof,
                _ => e.into(),
            })
    }

    /// Registers a blob as stored in this resource.
    pub fn register_blob(&self, hash: Sha1Hash) {
        self.blobs.lock().expect("resource blob list poisoned").push(hash);
    }

    /// The (chunk size, compression type) that actually apply to this
    /// resource's chunks.
    fn chunk_params(&self) -> Result<(u32, CompressionType)> {
        if self.is_solid() {
            let info = self.solid_info()?;
            Ok((info.chunk_size, info.ctype))
        } else {
            Ok((self.chunk_size, self.ctype))
        }
    }

    /// File offset where chunk data (or raw data) begins.
    fn data_start(&self) -> Result<u64> {
        let base = self.reshdr.offset_in_wim;
        if self.is_solid() {
            let info = self.solid_info()?;
            let num_chunks = chunk_count(info.res_usize, info.chunk_size);
            let entry_size = chunk_entry_size(info.res_usize);
            Ok(base + SOLID_HEADER_SIZE + num_chunks * entry_size)
        } else if !self.is_compressed() {
            Ok(base + if self.pipable { PWM_BLOB_HEADER_SIZE } else { 0 })
        } else if self.pipable {
            Ok(base + PWM_BLOB_HEADER_SIZE)
        } else {
            let usize_ = self.reshdr.uncompressed_size;
            let num_entries = chunk_count(usize_, self.chunk_size).saturating_sub(1);
            Ok(base + num_entries * chunk_entry_size(usize_))
        }
    }

    /// Reads one chunk-offset-table entry.
    fn table_entry(&self, index: u64) -> Result<u64> {
        let (table_off, entry_size) = if self.is_solid() {
            (self.reshdr.offset_in_wim + SOLID_HEADER_SIZE, chunk_entry_size(self.solid_info()?.res_usize))
        } else if self.pipable {
            // Table is written after the chunks.
            let usize_ = self.reshdr.uncompressed_size;
            let num_entries = chunk_count(usize_, self.chunk_size).saturating_sub(1);
            let entry_size = chunk_entry_size(usize_);
            (self.reshdr.end() - num_entries * entry_size, entry_size)
        } else {
            (self.reshdr.offset_in_wim, chunk_entry_size(self.reshdr.uncompressed_size))
        };
        let mut bytes = [0u8; 8];
        self.read_exact(&mut bytes[..entry_size as usize], table_off + index * entry_size)?;
        if entry_size == 4 {
            Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as u64)
        } else {
            Ok(u64::from_le_bytes(bytes))
        }
    }

    /// Offset of chunk `index`'s stored bytes relative to the chunk-data
    /// area. For non-solid resources entry *i* of the table locates chunk
    /// *i + 1*; chunk 0 starts at 0. Solid tables carry one entry per
    /// chunk.
    fn chunk_data_offset(&self, index: u64) -> Result<u64> {
        if self.is_solid() {
            self.table_entry(index)
        } else if index == 0 {
            Ok(0)
        } else {
            self.table_entry(index - 1)
        }
    }

    /// Total size of the chunk-data area.
    fn chunk_data_len(&self) -> Result<u64> {
        let usize_ = self.uncompressed_size()?;
        let (chunk_size, _) = self.chunk_params()?;
        let num_chunks = chunk_count(usize_, chunk_size);
        let entry_size = chunk_entry_size(if self.is_solid() {
            usize_
        } else {
            self.reshdr.uncompressed_size
        });
        let overhead = if self.is_solid() {
            SOLID_HEADER_SIZE + num_chunks * entry_size
        } else if self.pipable {
            PWM_BLOB_HEADER_SIZE + num_chunks.saturating_sub(1) * entry_size
        } else {
            num_chunks.saturating_sub(1) * entry_size
        };
        self.reshdr
            .size_in_wim
            .checked_sub(overhead)
            .ok_or(WimError::UnexpectedEof)
    }

    /// Locates chunk `index`: file offset of its stored bytes, the stored
    /// size, and the uncompressed length.
    fn locate_chunk(&self, index: u64) -> Result<(u64, u64, usize)> {
        let usize_ = self.uncompressed_size()?;
        let (chunk_size, _) = self.chunk_params()?;
        let num_chunks = chunk_count(usize_, chunk_size);
        debug_assert!(index < num_chunks);

        let uncompressed_len = if index == num_chunks - 1 {
            (usize_ - index * chunk_size as u64) as usize
        } else {
            chunk_size as usize
        };

        let start = self.chunk_data_offset(index)?;
        let end = if index == num_chunks - 1 {
            self.chunk_data_len()?
        } else {
            self.chunk_data_offset(index + 1)?
        };
        let mut file_off = self.data_start()? + start;
        let mut stored = end.checked_sub(start).ok_or(WimError::DecompressionError)?;

        if self.pipable && !self.is_solid() {
            // Skip the per-chunk stored-size prefix.
            file_off += PWM_CHUNK_HEADER_SIZE;
            stored = stored
                .checked_sub(PWM_CHUNK_HEADER_SIZE)
                .ok_or(WimError::DecompressionError)?;
        }
        if stored > uncompressed_len as u64 {
            return Err(WimError::DecompressionError);
        }
        Ok((file_off, stored, uncompressed_len))
    }
}

/// Number of chunks a stream of `usize_` bytes occupies.
pub(crate) fn chunk_count(usize_: u64, chunk_size: u32) -> u64 {
    usize_.div_ceil(chunk_size as u64)
}

/// Chunk-table entry width: 4 bytes while the uncompressed size fits in 32
/// bits (inclusive boundary), 8 bytes above.
pub(crate) fn chunk_entry_size(usize_: u64) -> u64 {
    if usize_ <= u32::MAX as u64 + 1 {
        4
    } else {
        8
    }
}

type CacheKey = (usize, u64);

struct SolidCache {
    key: CacheKey,
    /// Decoded prefix of the solid stream.
    buf: Vec<u8>,
    decompressor: Decompressor,
}

/// Per-archive cache of decompressed chunks.
pub(crate) struct ChunkCache {
    chunks: VecDeque<((CacheKey, u64), Arc<Vec<u8>>)>,
    solid: Option<SolidCache>,
    decompressor: Option<(CompressionType, u32, Decompressor)>,
}

impl ChunkCache {
    pub fn new() -> Self {
        Self {
            chunks: VecDeque::new(),
            solid: None,
            decompressor: None,
        }
    }

    fn key_of(res: &ResourceDescriptor) -> CacheKey {
        (Arc::as_ptr(&res.file) as usize, res.reshdr.offset_in_wim)
    }

    fn decompressor_for(
        &mut self,
        ctype: CompressionType,
        chunk_size: u32,
    ) -> Result<&mut Decompressor> {
        match &self.decompressor {
            Some((t, c, _)) if *t == ctype && *c == chunk_size => {}
            _ => {
                self.decompressor = Some((ctype, chunk_size, Decompressor::new(ctype, chunk_size)?));
            }
        }
        Ok(&mut self.decompressor.as_mut().expect("just initialized").2)
    }

    /// Fetches one decompressed non-solid chunk through the LRU.
    fn chunk(&mut self, res: &ResourceDescriptor, index: u64) -> Result<Arc<Vec<u8>>> {
        let key = (Self::key_of(res), index);
        if let Some(pos) = self.chunks.iter().position(|(k, _)| *k == key) {
            let entry = self.chunks.remove(pos).expect("position just found");
            self.chunks.push_front(entry.clone());
            return Ok(entry.1);
        }

        let (file_off, stored, uncompressed_len) = res.locate_chunk(index)?;
        let mut data = vec![0u8; uncompressed_len];
        if stored == uncompressed_len as u64 {
            // Stored raw: the chunk did not compress smaller.
            res.read_exact(&mut data, file_off)?;
        } else {
            let mut cdata = vec![0u8; stored as usize];
            res.read_exact(&mut cdata, file_off)?;
            let (chunk_size, ctype) = res.chunk_params()?;
            if ctype == CompressionType::None {
                return Err(WimError::DecompressionError);
            }
            let d = self.decompressor_for(ctype, chunk_size)?;
            d.decompress(&cdata, &mut data, 0)
                .map_err(|_| WimError::DecompressionError)?;
        }

        let data = Arc::new(data);
        self.chunks.push_front((key, Arc::clone(&data)));
        while self.chunks.len() > CHUNK_CACHE_ENTRIES {
            self.chunks.pop_back();
        }
        Ok(data)
    }

    /// Ensures at least `needed` bytes of the solid stream are decoded,
    /// extending the cached prefix chunk by chunk.
    fn solid_prefix(&mut self, res: &ResourceDescriptor, needed: u64) -> Result<&[u8]> {
        let key = Self::key_of(res);
        let info = res.solid_info()?;

        let valid = matches!(&self.solid, Some(s) if s.key == key);
        if !valid {
            if info.ctype == CompressionType::None {
                return Err(WimError::DecompressionError);
            }
            self.solid = Some(SolidCache {
                key,
                buf: Vec::new(),
                decompressor: Decompressor::new(info.ctype, info.chunk_size)?,
            });
        }
        let solid = self.solid.as_mut().expect("just ensured");

        while (solid.buf.len() as u64) < needed.min(info.res_usize) {
            let index = solid.buf.len() as u64 / info.chunk_size as u64;
            let (file_off, stored, uncompressed_len) = res.locate_chunk(index)?;
            trace!(index, stored, uncompressed_len, "decoding solid chunk");

            let start = solid.buf.len();
            solid.buf.resize(start + uncompressed_len, 0);
            if stored == uncompressed_len as u64 {
                res.read_exact(&mut solid.buf[start..], file_off)?;
            } else {
                let mut cdata = vec![0u8; stored as usize];
                res.read_exact(&mut cdata, file_off)?;
                solid
                    .decompressor
                    .decompress(&cdata, &mut solid.buf, start)
                    .map_err(|_| WimError::DecompressionError)?;
            }
        }
        Ok(&solid.buf)
    }
}

/// Reads `size` bytes at `offset` within a resource's uncompressed stream.
pub(crate) fn read_partial(
    res: &ResourceDescriptor,
    cache: &Mutex<ChunkCache>,
    offset: u64,
    size: u64,
) -> Result<Vec<u8>> {
    let res_usize = res.uncompressed_size()?;
    if offset.checked_add(size).map_or(true, |end| end > res_usize) {
        return Err(WimError::UnexpectedEof);
    }
    if size == 0 {
        return Ok(Vec::new());
    }

    if !res.is_compressed() && !res.is_solid() {
        let mut out = vec![0u8; size as usize];
        res.read_exact(&mut out, res.data_start()? + offset)?;
        return Ok(out);
    }

    let mut cache = cache.lock().expect("chunk cache poisoned");

    if res.is_solid() {
        let prefix = cache.solid_prefix(res, offset + size)?;
        return Ok(prefix[offset as usize..(offset + size) as usize].to_vec());
    }

    let (chunk_size, _) = res.chunk_params()?;
    let chunk_size = chunk_size as u64;
    let first_chunk = offset / chunk_size;
    let last_chunk = (offset + size - 1) / chunk_size;

    let mut out = Vec::with_capacity(size as usize);
    for index in first_chunk..=last_chunk {
        let data = cache.chunk(res, index)?;
        let chunk_start = index * chunk_size;
        let take_from = offset.max(chunk_start) - chunk_start;
        let take_to = (offset + size).min(chunk_start + data.len() as u64) - chunk_start;
        out.extend_from_slice(&data[take_from as usize..take_to as usize]);
    }
    Ok(out)
}

/// Reads a blob's bytes from its location.
pub(crate) fn read_blob_location(
    location: &crate::blob::BlobLocation,
    size: u64,
    cache: &Mutex<ChunkCache>,
    offset: u64,
    len: u64,
) -> Result<Vec<u8>> {
    if offset.checked_add(len).map_or(true, |end| end > size) {
        return Err(WimError::UnexpectedEof);
    }
    match location {
        crate::blob::BlobLocation::Buffered(bytes) => {
            Ok(bytes[offset as usize..(offset + len) as usize].to_vec())
        }
        crate::blob::BlobLocation::InWim { res, offset_in_res } => {
            read_partial(res, cache, offset_in_res + offset, len)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_entry_width_boundary() {
        assert_eq!(chunk_entry_size(1), 4);
        assert_eq!(chunk_entry_size(u32::MAX as u64), 4);
        // The boundary is inclusive of 2^32 itself.
        assert_eq!(chunk_entry_size(1 << 32), 4);
        assert_eq!(chunk_entry_size((1 << 32) + 1), 8);
    }

    #[test]
    fn chunk_counts() {
        assert_eq!(chunk_count(1, 32768), 1);
        assert_eq!(chunk_count(32768, 32768), 1);
        assert_eq!(chunk_count(32769, 32768), 2);
        assert_eq!(chunk_count(0, 32768), 0);
    }
}
