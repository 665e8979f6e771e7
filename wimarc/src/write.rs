//! Writing whole WIM files.
//!
//! The writer produces a complete archive in one forward pass (plus one
//! seek-back per compressed resource to fill in its chunk offset table, and
//! a final seek to rewrite the header):
//!
//! 1. header placeholder with `WRITE_IN_PROGRESS` set,
//! 2. (pipable only) an early XML copy for stream consumers,
//! 3. one metadata resource per image,
//! 4. file-data resources — raw-copied when the source bytes are already
//!    in the target format, otherwise re-chunked through the parallel
//!    compressor, packed into solid resources in solid mode,
//! 5. the blob table, the XML data, and (optionally) the integrity table,
//! 6. the finished header, written last so a crash at any earlier point
//!    leaves no valid-looking file.

use std::collections::{HashMap, HashSet};
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;

use sync_file::RandomAccessFile;
use tracing::{debug, info_span, trace};
use zerocopy::IntoBytes;

use crate::blob::{BlobDescriptor, BlobLocation, StreamRef};
use crate::error::{Result, WimError};
use crate::header::{
    BlobTableEntry, HeaderFlags, PipableBlobHeaderDisk, ResourceFlags, ResourceHeader,
    SolidHeaderDisk, PWM_BLOB_MAGIC, SOLID_RESOURCE_MAGIC, WIM_VERSION_SOLID,
};
use crate::integrity::IntegrityTable;
use crate::metadata::ImageMetadata;
use crate::parallel::ChunkPipeline;
use crate::progress::{check, NoProgress, ProgressEvent, ProgressSink};
use crate::resource::{
    chunk_count, chunk_entry_size, read_blob_location, ResourceDescriptor, SOLID_HEADER_SIZE,
};
use crate::sha1::{sha1_buffer, Sha1Hash, ZERO_HASH};
use crate::{CompressionType, Wim, WriteFlags};

/// Uncompressed chunk size of newly written solid resources.
pub(crate) const SOLID_CHUNK_SIZE: u32 = 1 << 16;
/// Target uncompressed size cap of one solid resource.
pub(crate) const SOLID_RESOURCE_CAP: u64 = 64 << 20;
/// Referenced fraction (numerator/denominator) above which a solid
/// resource is raw-copied instead of being unpacked.
const SOLID_REUSE_NUM: u64 = 2;
const SOLID_REUSE_DEN: u64 = 3;

/// Describes one part of a split set being written; `None` writes a
/// standalone archive.
pub(crate) struct PartSpec {
    pub part_number: u16,
    pub total_parts: u16,
    /// Whether image metadata goes into this part (part 1 only).
    pub include_images: bool,
    /// Restrict file-data blobs to this set.
    pub blobs: Option<HashSet<Sha1Hash>>,
}

/// Everything the writer accumulated for the final header.
struct Emitted {
    table_entries: Vec<BlobTableEntry>,
    boot_metadata_reshdr: ResourceHeader,
}

impl Wim {
    /// Writes the archive (all images, all referenced blobs) to `path`,
    /// then reopens this [`Wim`] from the result.
    pub fn write(&mut self, path: impl AsRef<Path>, flags: WriteFlags, num_threads: usize) -> Result<()> {
        self.write_with_progress(path, flags, num_threads, &mut NoProgress)
    }

    /// [`Wim::write`] with progress reporting and cancellation.
    pub fn write_with_progress(
        &mut self,
        path: impl AsRef<Path>,
        flags: WriteFlags,
        num_threads: usize,
        progress: &mut dyn ProgressSink,
    ) -> Result<()> {
        let path = path.as_ref();
        if self.hdr.total_parts != 1 {
            return Err(WimError::SplitUnsupported);
        }
        if self.path.as_deref() == Some(path) {
            // Truncating the file we are still reading blobs from would
            // destroy them; updating in place is overwrite's job.
            return Err(WimError::Io {
                path: Some(path.to_owned()),
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "cannot write over the archive's own file; use overwrite",
                ),
            });
        }
        self.blob_table.resolve_all_unhashed();

        let result = self.write_archive_to_path(path, flags, num_threads, None, progress);
        if result.is_err() {
            // Never leave a half-written file that could be mistaken for a
            // valid archive.
            let _ = std::fs::remove_file(path);
            return result;
        }

        *self = Wim::open(path, crate::OpenFlags::empty())?;
        Ok(())
    }

    /// Writes one complete archive file. The caller has already resolved
    /// unhashed blobs. Does not modify `self`.
    pub(crate) fn write_archive_to_path(
        &self,
        path: &Path,
        flags: WriteFlags,
        num_threads: usize,
        part: Option<PartSpec>,
        progress: &mut dyn ProgressSink,
    ) -> Result<()> {
        let _span = info_span!("write_archive", path = %path.display()).entered();
        let mut out = std::fs::File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|source| WimError::Io {
                path: Some(path.to_owned()),
                source,
            })?;

        let pipable = resolve_pipable(self.hdr.pipable, flags);
        let solid = flags.contains(WriteFlags::SOLID);
        let part_number = part.as_ref().map_or(1, |p| p.part_number);
        let total_parts = part.as_ref().map_or(1, |p| p.total_parts);
        let include_images = part.as_ref().is_none_or(|p| p.include_images);

        // Header placeholder. The real header replaces it after everything
        // else is durable.
        let mut hdr = self.hdr.clone();
        hdr.pipable = pipable;
        hdr.part_number = part_number;
        hdr.total_parts = total_parts;
        if total_parts != 1 {
            hdr.flags |= HeaderFlags::SPANNED;
            if !include_images {
                hdr.flags |= HeaderFlags::RESOURCE_ONLY;
            }
        }
        if !flags.contains(WriteFlags::RETAIN_GUID) && part.is_none() {
            hdr.guid = *uuid::Uuid::new_v4().as_bytes();
        }
        if solid {
            hdr.wim_version = WIM_VERSION_SOLID;
        }
        hdr.flags |= HeaderFlags::WRITE_IN_PROGRESS;
        out.write_all(hdr.to_disk().as_bytes())?;

        let mut writer = ResourceWriter {
            out: &mut out,
            ctype: self.ctype,
            chunk_size: self.hdr.chunk_size,
            pipable,
        };

        // Pipable consumers need the image list before the data arrives.
        if pipable {
            let xml_bytes = self.xml.serialize(self.xml.total_bytes);
            writer.write_buffer(&xml_bytes, ResourceFlags::empty(), false, ZERO_HASH)?;
        }

        let mut emitted = Emitted {
            table_entries: Vec::new(),
            boot_metadata_reshdr: ResourceHeader::default(),
        };

        if include_images {
            self.write_metadata_resources(&mut writer, &mut emitted, progress)?;
        }

        self.write_data_blobs(
            &mut writer,
            &mut emitted,
            part.as_ref().and_then(|p| p.blobs.as_ref()),
            part_number,
            solid,
            flags,
            num_threads,
            progress,
        )?;

        // Blob table, then XML, then the optional integrity table.
        let table_bytes = serialize_blob_table(&emitted.table_entries);
        let blob_table_reshdr =
            writer.write_buffer(&table_bytes, ResourceFlags::empty(), false, ZERO_HASH)?;

        let total_bytes = writer.out.stream_position()?;
        let xml_bytes = self.xml.serialize(total_bytes);
        let xml_reshdr =
            writer.write_buffer(&xml_bytes, ResourceFlags::empty(), false, ZERO_HASH)?;

        let write_integrity = flags.contains(WriteFlags::CHECK_INTEGRITY)
            && !flags.contains(WriteFlags::NO_CHECK_INTEGRITY);
        let integrity_reshdr = if write_integrity {
            writer.out.flush()?;
            let raf = Arc::new(RandomAccessFile::from(writer.out.try_clone()?));
            let table =
                IntegrityTable::build(&raf, blob_table_reshdr.end(), None, progress)?;
            writer.write_buffer(&table.serialize(), ResourceFlags::empty(), false, ZERO_HASH)?
        } else {
            ResourceHeader::default()
        };

        // Commit: the finished header goes in last.
        hdr.flags -= HeaderFlags::WRITE_IN_PROGRESS;
        hdr.image_count = if include_images { self.image_count() } else { 0 };
        hdr.boot_index = if include_images { self.hdr.boot_index } else { 0 };
        hdr.blob_table_reshdr = blob_table_reshdr;
        hdr.xml_data_reshdr = xml_reshdr;
        hdr.boot_metadata_reshdr = emitted.boot_metadata_reshdr;
        hdr.integrity_table_reshdr = integrity_reshdr;

        if pipable {
            // Stream consumers that cannot seek back read this copy.
            out.seek(SeekFrom::End(0))?;
            out.write_all(hdr.to_disk().as_bytes())?;
        }
        out.flush()?;
        out.seek(SeekFrom::Start(0))?;
        out.write_all(hdr.to_disk().as_bytes())?;

        if flags.contains(WriteFlags::FSYNC) {
            out.sync_all()?;
        }
        debug!(
            blobs = emitted.table_entries.len(),
            images = hdr.image_count,
            "archive written"
        );
        Ok(())
    }

    /// Serializes and writes one metadata resource per image, in image
    /// order.
    fn write_metadata_resources(
        &self,
        writer: &mut ResourceWriter<'_>,
        emitted: &mut Emitted,
        progress: &mut dyn ProgressSink,
    ) -> Result<()> {
        let total_images = self.image_count();
        for (i, image) in self.images.iter().enumerate() {
            let bytes = match (&image.metadata, image.metadata_hash) {
                (Some(metadata), _) => {
                    let table = &self.blob_table;
                    metadata.serialize(&|sref: &StreamRef| {
                        table.resolve(sref).unwrap_or(ZERO_HASH)
                    })
                }
                (None, Some(hash)) => self.read_blob(&hash)?,
                (None, None) => ImageMetadata::new_empty().serialize(&|_| ZERO_HASH),
            };
            let hash = sha1_buffer(&bytes);
            let reshdr = writer.write_buffer(
                &bytes,
                ResourceFlags::METADATA,
                self.ctype != CompressionType::None,
                hash,
            )?;
            if self.hdr.boot_index == i as u32 + 1 {
                emitted.boot_metadata_reshdr = reshdr;
            }
            emitted.table_entries.push(BlobTableEntry {
                reshdr,
                part_number: 1,
                refcount: 1,
                hash,
            });
            check(progress.progress(ProgressEvent::WriteMetadata {
                completed_images: i as u32 + 1,
                total_images,
            }))?;
        }
        Ok(())
    }

    /// Writes every selected file-data blob, choosing per resource between
    /// a raw byte copy and recompression.
    #[allow(clippy::too_many_arguments)]
    fn write_data_blobs(
        &self,
        writer: &mut ResourceWriter<'_>,
        emitted: &mut Emitted,
        subset: Option<&HashSet<Sha1Hash>>,
        part_number: u16,
        solid: bool,
        flags: WriteFlags,
        num_threads: usize,
        progress: &mut dyn ProgressSink,
    ) -> Result<()> {
        let metadata_hashes: HashSet<Sha1Hash> =
            self.images.iter().filter_map(|i| i.metadata_hash).collect();

        let mut blobs: Vec<&BlobDescriptor> = self
            .blob_table
            .iter()
            .filter(|d| d.refcount > 0)
            .filter(|d| !metadata_hashes.contains(&d.hash))
            .filter(|d| subset.is_none_or(|s| s.contains(&d.hash)))
            .collect();

        // Raw-copyable solid resources are detected as whole groups before
        // the per-blob pass.
        let recompress = flags.contains(WriteFlags::RECOMPRESS);
        let mut solid_copied: HashSet<Sha1Hash> = HashSet::new();
        if !recompress && !writer.pipable && subset.is_none() {
            let groups = group_solid_blobs(&blobs);
            for (res, group) in groups {
                if solid_raw_copy_worthwhile(&res, &group)? {
                    raw_copy_solid_resource(writer, emitted, &res, &group, part_number)?;
                    for d in &group {
                        solid_copied.insert(d.hash);
                    }
                }
            }
            blobs.retain(|d| !solid_copied.contains(&d.hash));
        }

        // Read-locality order by default; name order helps the solid
        // compressor put similar files next to each other.
        if solid {
            blobs.sort_by(|a, b| {
                a.sort_hint
                    .cmp(&b.sort_hint)
                    .then_with(|| a.hash.cmp(&b.hash))
            });
        } else {
            blobs.sort_by_key(|d| (blob_source_offset(d), d.hash));
        }

        let total_bytes: u64 = blobs.iter().map(|d| d.size).sum();
        let total_blobs = blobs.len() as u64;
        let mut completed_bytes = 0u64;
        let mut completed_blobs = 0u64;
        let mut report = |completed_bytes: u64, completed_blobs: u64| {
            check(
                (*progress).progress(ProgressEvent::WriteStreams {
                    completed_bytes,
                    total_bytes,
                    completed_blobs,
                    total_blobs,
                }),
            )
        };
        report(0, 0)?;

        if solid {
            // Pack sorted blobs into solid resources up to the size cap;
            // each group becomes one shared-dictionary stream. Blobs being
            // unpacked from an existing solid resource are packed only with
            // blobs from that same origin, never merged across origins.
            fn origin_of(d: &BlobDescriptor) -> usize {
                match &d.location {
                    BlobLocation::InWim { res, .. } if res.is_solid() => {
                        Arc::as_ptr(res) as usize
                    }
                    _ => 0,
                }
            }
            let mut ordered = blobs;
            ordered.sort_by(|a, b| {
                origin_of(a)
                    .cmp(&origin_of(b))
                    .then_with(|| a.sort_hint.cmp(&b.sort_hint))
                    .then_with(|| a.hash.cmp(&b.hash))
            });

            let mut group: Vec<&BlobDescriptor> = Vec::new();
            let mut group_size = 0u64;
            let mut group_origin = 0usize;
            for desc in ordered {
                let origin = origin_of(desc);
                let must_close = !group.is_empty()
                    && (group_size + desc.size > SOLID_RESOURCE_CAP || origin != group_origin);
                if must_close {
                    self.write_solid_group(writer, emitted, &group, part_number)?;
                    completed_bytes += group_size;
                    completed_blobs += group.len() as u64;
                    report(completed_bytes, completed_blobs)?;
                    group.clear();
                    group_size = 0;
                }
                group_origin = origin;
                group.push(desc);
                group_size += desc.size;
            }
            if !group.is_empty() {
                self.write_solid_group(writer, emitted, &group, part_number)?;
                completed_bytes += group_size;
                completed_blobs += group.len() as u64;
                report(completed_bytes, completed_blobs)?;
            }
            return Ok(());
        }

        let mut pipeline = ChunkPipeline::new(
            writer.ctype,
            if writer.ctype == CompressionType::None {
                crate::header::WIM_CHUNK_SIZE
            } else {
                writer.chunk_size
            },
            num_threads,
            total_bytes,
        )?;

        for desc in blobs {
            let reshdr = if !recompress && self.can_raw_copy(desc, writer) {
                raw_copy_resource(writer, desc)?
            } else {
                self.write_blob_resource(writer, desc, &mut pipeline)?
            };
            emitted.table_entries.push(BlobTableEntry {
                reshdr,
                part_number,
                refcount: desc.refcount,
                hash: desc.hash,
            });
            completed_bytes += desc.size;
            completed_blobs += 1;
            report(completed_bytes, completed_blobs)?;
        }
        Ok(())
    }

    /// A non-solid blob may be byte-copied when its stored form already
    /// matches the output's compression format, chunk size, and layout.
    fn can_raw_copy(&self, desc: &BlobDescriptor, writer: &ResourceWriter<'_>) -> bool {
        match &desc.location {
            BlobLocation::Buffered(_) => false,
            BlobLocation::InWim { res, .. } => {
                !res.is_solid()
                    && res.pipable == writer.pipable
                    && (!res.is_compressed()
                        || (res.ctype == writer.ctype && res.chunk_size == writer.chunk_size))
            }
        }
    }

    /// Writes one non-solid resource holding `desc`'s bytes, streaming the
    /// source through the chunk pipeline.
    fn write_blob_resource(
        &self,
        writer: &mut ResourceWriter<'_>,
        desc: &BlobDescriptor,
        pipeline: &mut ChunkPipeline,
    ) -> Result<ResourceHeader> {
        let _span = trace_span_for_blob(desc);
        writer.write_stream(
            desc.size,
            ResourceFlags::empty(),
            desc.hash,
            pipeline,
            &mut |offset, len| {
                read_blob_location(&desc.location, desc.size, &self.chunk_cache, offset, len)
            },
        )
    }

    /// Concatenates a group of blobs into one solid resource. LZMS chunks
    /// share the dictionary across chunk boundaries, so many small blobs
    /// compress as one stream.
    fn write_solid_group(
        &self,
        writer: &mut ResourceWriter<'_>,
        emitted: &mut Emitted,
        group: &[&BlobDescriptor],
        part_number: u16,
    ) -> Result<()> {
        let res_usize: u64 = group.iter().map(|d| d.size).sum();
        debug!(blobs = group.len(), res_usize, "writing solid resource");

        // The whole group is held uncompressed so later chunks can match
        // against every earlier byte; the group cap bounds this buffer.
        let mut stream = Vec::with_capacity(res_usize as usize);
        let mut blob_offsets = Vec::with_capacity(group.len());
        for desc in group {
            blob_offsets.push(stream.len() as u64);
            let bytes =
                read_blob_location(&desc.location, desc.size, &self.chunk_cache, 0, desc.size)?;
            stream.extend_from_slice(&bytes);
        }

        let chunk_size = SOLID_CHUNK_SIZE;
        let mut compressor = wimcodec::Compressor::new(CompressionType::Lzms, chunk_size)?;
        let num_chunks = chunk_count(res_usize, chunk_size);
        let mut chunks: Vec<Vec<u8>> = Vec::with_capacity(num_chunks as usize);
        let mut start = 0usize;
        while start < stream.len() {
            let end = (start + chunk_size as usize).min(stream.len());
            let mut out = vec![0u8; end - start];
            match compressor.compress(&stream[..end], start, &mut out) {
                Some(n) => {
                    out.truncate(n);
                    chunks.push(out);
                }
                None => chunks.push(stream[start..end].to_vec()),
            }
            start = end;
        }

        // Solid layout: 16-byte header, then one absolute offset per
        // chunk, then the chunk data.
        let entry_size = chunk_entry_size(res_usize);
        let offset_in_wim = writer.out.stream_position()?;
        let solid_hdr = SolidHeaderDisk {
            res_usize: res_usize.into(),
            chunk_size: chunk_size.into(),
            compression_format: CompressionType::Lzms.to_code().into(),
        };
        writer.out.write_all(solid_hdr.as_bytes())?;

        let mut running = 0u64;
        for chunk in &chunks {
            if entry_size == 4 {
                writer.out.write_all(&(running as u32).to_le_bytes())?;
            } else {
                writer.out.write_all(&running.to_le_bytes())?;
            }
            running += chunk.len() as u64;
        }
        for chunk in &chunks {
            writer.out.write_all(chunk)?;
        }

        let size_in_wim =
            SOLID_HEADER_SIZE + num_chunks * entry_size + running;
        let marker_reshdr = ResourceHeader {
            size_in_wim,
            offset_in_wim,
            uncompressed_size: SOLID_RESOURCE_MAGIC,
            flags: ResourceFlags::SOLID | ResourceFlags::COMPRESSED,
        };
        emitted.table_entries.push(BlobTableEntry {
            reshdr: marker_reshdr,
            part_number,
            refcount: 1,
            hash: ZERO_HASH,
        });
        for (desc, &offset) in group.iter().zip(&blob_offsets) {
            emitted.table_entries.push(BlobTableEntry {
                reshdr: ResourceHeader {
                    size_in_wim: 0,
                    offset_in_wim: offset,
                    uncompressed_size: desc.size,
                    flags: ResourceFlags::SOLID,
                },
                part_number,
                refcount: desc.refcount,
                hash: desc.hash,
            });
        }
        Ok(())
    }
}

fn trace_span_for_blob(desc: &BlobDescriptor) -> tracing::span::EnteredSpan {
    tracing::trace_span!("write_blob", size = desc.size).entered()
}

pub(crate) fn resolve_pipable(current: bool, flags: WriteFlags) -> bool {
    if flags.contains(WriteFlags::PIPABLE) {
        true
    } else if flags.contains(WriteFlags::NOT_PIPABLE) {
        false
    } else {
        current
    }
}

/// The source-file offset of a blob, used for read-locality ordering.
fn blob_source_offset(desc: &BlobDescriptor) -> u64 {
    match &desc.location {
        BlobLocation::Buffered(_) => u64::MAX,
        BlobLocation::InWim { res, offset_in_res } => {
            res.reshdr.offset_in_wim + offset_in_res
        }
    }
}

/// Groups blobs living in solid resources by their containing resource.
fn group_solid_blobs<'a>(
    blobs: &[&'a BlobDescriptor],
) -> Vec<(Arc<ResourceDescriptor>, Vec<&'a BlobDescriptor>)> {
    let mut groups: HashMap<usize, (Arc<ResourceDescriptor>, Vec<&'a BlobDescriptor>)> =
        HashMap::new();
    for desc in blobs {
        if let BlobLocation::InWim { res, .. } = &desc.location {
            if res.is_solid() {
                groups
                    .entry(Arc::as_ptr(res) as usize)
                    .or_insert_with(|| (Arc::clone(res), Vec::new()))
                    .1
                    .push(desc);
            }
        }
    }
    groups.into_values().collect()
}

/// A solid resource is copied wholesale only while more than 2/3 of its
/// uncompressed bytes are still referenced; below that, repacking wins.
fn solid_raw_copy_worthwhile(
    res: &ResourceDescriptor,
    group: &[&BlobDescriptor],
) -> Result<bool> {
    let referenced: u64 = group.iter().map(|d| d.size).sum();
    let total = res.uncompressed_size()?;
    Ok(total > 0 && referenced * SOLID_REUSE_DEN > total * SOLID_REUSE_NUM)
}

/// Byte-copies a whole solid resource and re-emits its table entries.
fn raw_copy_solid_resource(
    writer: &mut ResourceWriter<'_>,
    emitted: &mut Emitted,
    res: &Arc<ResourceDescriptor>,
    group: &[&BlobDescriptor],
    part_number: u16,
) -> Result<()> {
    let new_offset = copy_file_range_to(writer, &res.file, res.reshdr)?;
    let marker_reshdr = ResourceHeader {
        offset_in_wim: new_offset,
        uncompressed_size: SOLID_RESOURCE_MAGIC,
        ..res.reshdr
    };
    emitted.table_entries.push(BlobTableEntry {
        reshdr: marker_reshdr,
        part_number,
        refcount: 1,
        hash: ZERO_HASH,
    });
    for desc in group {
        let BlobLocation::InWim { offset_in_res, .. } = &desc.location else {
            continue;
        };
        emitted.table_entries.push(BlobTableEntry {
            reshdr: ResourceHeader {
                size_in_wim: 0,
                offset_in_wim: *offset_in_res,
                uncompressed_size: desc.size,
                flags: ResourceFlags::SOLID,
            },
            part_number,
            refcount: desc.refcount,
            hash: desc.hash,
        });
    }
    debug!(blobs = group.len(), "raw-copied solid resource");
    Ok(())
}

/// Byte-copies a non-solid blob's resource.
fn raw_copy_resource(
    writer: &mut ResourceWriter<'_>,
    desc: &BlobDescriptor,
) -> Result<ResourceHeader> {
    let BlobLocation::InWim { res, .. } = &desc.location else {
        return Err(WimError::ResourceNotFound);
    };
    let new_offset = copy_file_range_to(writer, &res.file, res.reshdr)?;
    Ok(ResourceHeader {
        offset_in_wim: new_offset,
        ..res.reshdr
    })
}

/// Copies `reshdr`'s byte range from `src` to the writer's position;
/// returns the new offset.
fn copy_file_range_to(
    writer: &mut ResourceWriter<'_>,
    src: &RandomAccessFile,
    reshdr: ResourceHeader,
) -> Result<u64> {
    use sync_file::ReadAt;
    let new_offset = writer.out.stream_position()?;
    let mut buf = vec![0u8; 1 << 20];
    let mut copied = 0u64;
    while copied < reshdr.size_in_wim {
        let n = (reshdr.size_in_wim - copied).min(buf.len() as u64) as usize;
        src.read_exact_at(&mut buf[..n], reshdr.offset_in_wim + copied)
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::UnexpectedEof => WimError::UnexpectedEof,
                _ => WimError::from(e),
            })?;
        writer.out.write_all(&buf[..n])?;
        copied += n as u64;
    }
    Ok(new_offset)
}

/// Serializes blob-table entries to the table resource's content.
pub(crate) fn serialize_blob_table(entries: &[BlobTableEntry]) -> Vec<u8> {
    let mut out = Vec::with_capacity(entries.len() * crate::header::BLOB_TABLE_ENTRY_SIZE);
    for entry in entries {
        out.extend_from_slice(entry.to_disk().as_bytes());
    }
    out
}

/// Low-level resource emission over a seekable output file.
pub(crate) struct ResourceWriter<'a> {
    pub out: &'a mut std::fs::File,
    pub ctype: CompressionType,
    pub chunk_size: u32,
    pub pipable: bool,
}

impl ResourceWriter<'_> {
    /// Writes an in-memory payload as one non-solid resource, compressed
    /// chunk-wise when `try_compress` and the format allows.
    pub fn write_buffer(
        &mut self,
        data: &[u8],
        flags: ResourceFlags,
        try_compress: bool,
        hash: Sha1Hash,
    ) -> Result<ResourceHeader> {
        let mut pipeline = ChunkPipeline::new(
            if try_compress { self.ctype } else { CompressionType::None },
            if self.ctype == CompressionType::None {
                crate::header::WIM_CHUNK_SIZE
            } else {
                self.chunk_size
            },
            1,
            0,
        )?;
        self.write_stream(data.len() as u64, flags, hash, &mut pipeline, &mut |off,
                                                                               len| {
            Ok(data[off as usize..(off + len) as usize].to_vec())
        })
    }

    /// Writes one non-solid resource of `size` bytes supplied by `read`
    /// (which returns the uncompressed bytes of any requested range).
    ///
    /// Chunks flow through `pipeline`; whenever a chunk fails to get
    /// smaller it is stored raw, which the reader detects from the stored
    /// size alone. If the resource as a whole fails to shrink it is
    /// rewritten uncompressed in place.
    pub fn write_stream(
        &mut self,
        size: u64,
        flags: ResourceFlags,
        hash: Sha1Hash,
        pipeline: &mut ChunkPipeline,
        read: &mut dyn FnMut(u64, u64) -> Result<Vec<u8>>,
    ) -> Result<ResourceHeader> {
        let offset_in_wim = self.out.stream_position()?;
        let compressing = pipeline.compression_type() != CompressionType::None && size > 0;
        let chunk_size = pipeline.chunk_size() as u64;

        if self.pipable {
            let pwm = PipableBlobHeaderDisk {
                magic: PWM_BLOB_MAGIC.into(),
                uncompressed_size: size.into(),
                hash,
                flags: (flags.bits() as u32).into(),
                reserved: 0u32.into(),
            };
            self.out.write_all(pwm.as_bytes())?;
        }

        if !compressing {
            return self.write_stream_raw(offset_in_wim, size, flags, read);
        }

        let num_chunks = chunk_count(size, chunk_size as u32);
        let entry_size = chunk_entry_size(size);
        let num_entries = num_chunks - 1;

        // Classic layout reserves the chunk table up front and patches it
        // once the chunk sizes are known; the pipable layout streams the
        // chunks first and appends the table.
        let table_pos = self.out.stream_position()?;
        if !self.pipable {
            self.out
                .seek(SeekFrom::Current((num_entries * entry_size) as i64))?;
        }

        let mut entries: Vec<u64> = Vec::with_capacity(num_entries as usize);
        let mut relative = 0u64;
        let mut submitted = 0u64;
        let mut chunk_index = 0u64;
        let pipable = self.pipable;

        let mut drain =
            |writer: &mut std::fs::File,
             pipeline: &mut ChunkPipeline,
             relative: &mut u64,
             entries: &mut Vec<u64>,
             chunk_index: &mut u64|
             -> Result<()> {
                let Some(result) = pipeline.get_compression_result() else {
                    return Ok(());
                };
                // A chunk that failed to shrink is stored raw; the reader
                // detects that from the stored size alone.
                let bytes = match &result.compressed {
                    Some(c) => &c[..],
                    None => &result.data[..],
                };
                if *chunk_index > 0 {
                    entries.push(*relative);
                }
                if pipable {
                    writer.write_all(&(bytes.len() as u32).to_le_bytes())?;
                    *relative += crate::resource::PWM_CHUNK_HEADER_SIZE;
                }
                writer.write_all(bytes)?;
                *relative += bytes.len() as u64;
                *chunk_index += 1;
                let data = result.data;
                pipeline.recycle_buffer(data);
                Ok(())
            };

        while submitted < size {
            while pipeline.outstanding() as usize >= pipeline.capacity() {
                drain(self.out, pipeline, &mut relative, &mut entries, &mut chunk_index)?;
            }
            let n = (size - submitted).min(chunk_size);
            let mut buf = pipeline.get_chunk_buffer();
            buf.clear();
            buf.extend_from_slice(&read(submitted, n)?);
            pipeline.signal_chunk_filled(buf, n as usize);
            submitted += n;
        }
        while pipeline.outstanding() > 0 {
            drain(self.out, pipeline, &mut relative, &mut entries, &mut chunk_index)?;
        }
        if chunk_index != num_chunks {
            return Err(WimError::Io {
                path: None,
                source: std::io::Error::other("a chunk compression worker failed"),
            });
        }

        let data_end = self.out.stream_position()?;

        // The chunk table.
        if self.pipable {
            write_entries(self.out, &entries, entry_size)?;
        } else {
            self.out.seek(SeekFrom::Start(table_pos))?;
            write_entries(self.out, &entries, entry_size)?;
            self.out.seek(SeekFrom::Start(data_end))?;
        }

        let size_in_wim = self.out.stream_position()? - offset_in_wim;
        if !self.pipable && size_in_wim >= size {
            // No overall gain: rewrite the resource uncompressed.
            trace!(size, size_in_wim, "compression not worthwhile, storing raw");
            self.out.seek(SeekFrom::Start(offset_in_wim))?;
            let reshdr = self.write_stream_raw(offset_in_wim, size, flags, read)?;
            let end = self.out.stream_position()?;
            self.out.set_len(end)?;
            return Ok(reshdr);
        }

        Ok(ResourceHeader {
            size_in_wim,
            offset_in_wim,
            uncompressed_size: size,
            flags: flags | ResourceFlags::COMPRESSED,
        })
    }

    fn write_stream_raw(
        &mut self,
        offset_in_wim: u64,
        size: u64,
        flags: ResourceFlags,
        read: &mut dyn FnMut(u64, u64) -> Result<Vec<u8>>,
    ) -> Result<ResourceHeader> {
        let mut written = 0u64;
        while written < size {
            let n = (size - written).min(1 << 20);
            let bytes = read(written, n)?;
            self.out.write_all(&bytes)?;
            written += n;
        }
        let end = self.out.stream_position()?;
        Ok(ResourceHeader {
            size_in_wim: end - offset_in_wim,
            offset_in_wim,
            uncompressed_size: size,
            flags,
        })
    }
}

fn write_entries(out: &mut std::fs::File, entries: &[u64], entry_size: u64) -> Result<()> {
    for &e in entries {
        if entry_size == 4 {
            out.write_all(&(e as u32).to_le_bytes())?;
        } else {
            out.write_all(&e.to_le_bytes())?;
        }
    }
    Ok(())
}
