//! Updating an archive in place: append, rebuild, or compact.
//!
//! The append strategy writes new data after the old XML/integrity region,
//! then new copies of the blob table, XML, and integrity table, and commits
//! by rewriting the header last. A crash at any earlier point leaves the
//! old header in place — pointing at the old, untouched tables — so the
//! file on disk is always a valid archive. Appending requires that no live
//! resource sits past the chosen append point; when that check fails (or a
//! rebuild was requested, or images were deleted without soft delete), the
//! archive is rewritten to a sibling temporary file and renamed over.
//!
//! The compact strategy (explicit opt-in) reuses byte ranges in place and
//! truncates; it reclaims space without a full copy but has **no** crash
//! safety.

use std::collections::{HashMap, HashSet};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Arc;

use sync_file::{RandomAccessFile, ReadAt};
use tracing::{debug, info_span, warn};
use zerocopy::IntoBytes;

use crate::blob::BlobLocation;
use crate::error::{Result, WimError};
use crate::header::{
    BlobTableEntry, HeaderFlags, ResourceFlags, ResourceHeader, WimHeader, HEADER_SIZE,
    SOLID_RESOURCE_MAGIC,
};
use crate::integrity::IntegrityTable;
use crate::lock::WimLock;
use crate::parallel::ChunkPipeline;
use crate::progress::{check, NoProgress, ProgressEvent, ProgressSink};
use crate::resource::{read_blob_location, ResourceDescriptor};
use crate::sha1::{sha1_buffer, Sha1Hash, ZERO_HASH};
use crate::write::{resolve_pipable, serialize_blob_table, ResourceWriter};
use crate::{CompressionType, OpenFlags, Wim, WriteFlags};

impl Wim {
    /// Commits staged changes back to the archive's own file.
    pub fn overwrite(&mut self, flags: WriteFlags, num_threads: usize) -> Result<()> {
        self.overwrite_with_progress(flags, num_threads, &mut NoProgress)
    }

    /// [`Wim::overwrite`] with progress reporting and cancellation.
    pub fn overwrite_with_progress(
        &mut self,
        flags: WriteFlags,
        num_threads: usize,
        progress: &mut dyn ProgressSink,
    ) -> Result<()> {
        let path = self.backing_path()?;
        let _span = info_span!("Wim::overwrite", path = %path.display()).entered();

        if self.hdr.flags.contains(HeaderFlags::READONLY)
            && !flags.contains(WriteFlags::IGNORE_READONLY_FLAG)
        {
            return Err(WimError::WimIsReadonly);
        }
        if self.hdr.total_parts != 1 {
            return Err(WimError::SplitUnsupported);
        }
        self.blob_table.resolve_all_unhashed();

        if flags.contains(WriteFlags::UNSAFE_COMPACT) {
            return self.overwrite_compact(&path, flags, progress);
        }

        let must_rebuild = flags.contains(WriteFlags::REBUILD)
            || (self.any_images_deleted && !flags.contains(WriteFlags::SOFT_DELETE))
            || resolve_pipable(self.hdr.pipable, flags) != self.hdr.pipable
            || flags.contains(WriteFlags::SOLID)
            || flags.contains(WriteFlags::RECOMPRESS);

        if !must_rebuild {
            match self.overwrite_append(&path, flags, num_threads, progress) {
                Err(WimError::ResourceOrder) => {
                    warn!("resources out of order for append; rebuilding instead");
                }
                other => return other,
            }
        }
        self.overwrite_rebuild(&path, flags, num_threads, progress)
    }

    fn backing_path(&self) -> Result<PathBuf> {
        self.path.clone().ok_or_else(|| WimError::Io {
            path: None,
            source: std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "the archive is not backed by a file",
            ),
        })
    }

    /// Append-in-place. New data goes after the old integrity table (or
    /// XML data, if none); the header is rewritten only once everything
    /// else is on disk.
    fn overwrite_append(
        &mut self,
        path: &std::path::Path,
        flags: WriteFlags,
        num_threads: usize,
        progress: &mut dyn ProgressSink,
    ) -> Result<()> {
        let append_at = self
            .hdr
            .integrity_table_reshdr
            .end()
            .max(self.hdr.xml_data_reshdr.end())
            .max(self.hdr.blob_table_reshdr.end())
            .max(HEADER_SIZE as u64);

        // Every live resource must end at or before the append point.
        for desc in self.blob_table.iter() {
            if let BlobLocation::InWim { res, .. } = &desc.location {
                if self.owns_resource(res) && res.reshdr.end() > append_at {
                    return Err(WimError::ResourceOrder);
                }
            }
        }

        let _lock = WimLock::acquire(path)?;
        let mut out = std::fs::File::options()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|source| WimError::Io {
                path: Some(path.to_owned()),
                source,
            })?;

        // Remember the pre-overwrite state for rollback.
        let original_len = self.file_size;
        let mut original_header = [0u8; HEADER_SIZE];
        out.read_exact(&mut original_header)?;

        // Mark the write in progress *before* any appended byte, and make
        // sure the mark cannot be reordered past the data writes.
        let mut in_progress_hdr = self.hdr.clone();
        in_progress_hdr.flags |= HeaderFlags::WRITE_IN_PROGRESS;
        out.seek(SeekFrom::Start(0))?;
        out.write_all(in_progress_hdr.to_disk().as_bytes())?;
        out.sync_data()?;

        out.seek(SeekFrom::Start(append_at))?;
        let result =
            self.append_contents(&mut out, flags, num_threads, progress);

        match result {
            Ok(final_hdr) => {
                out.flush()?;
                out.sync_data()?;
                out.seek(SeekFrom::Start(0))?;
                out.write_all(final_hdr.to_disk().as_bytes())?;
                if flags.contains(WriteFlags::FSYNC) {
                    out.sync_all()?;
                }
                drop(out);
                *self = Wim::open(path, OpenFlags::empty())?;
                Ok(())
            }
            Err(e) => {
                // Roll back: restore the original length and header so the
                // file is byte-identical to the pre-overwrite archive.
                let _ = out.set_len(original_len);
                let _ = out
                    .seek(SeekFrom::Start(0))
                    .and_then(|_| out.write_all(&original_header));
                let _ = out.sync_data();
                Err(e)
            }
        }
    }

    /// Writes the appended portion: new blobs, new metadata, then fresh
    /// copies of the blob table, XML, and integrity table. Returns the
    /// header to commit.
    fn append_contents(
        &self,
        out: &mut std::fs::File,
        flags: WriteFlags,
        num_threads: usize,
        progress: &mut dyn ProgressSink,
    ) -> Result<WimHeader> {
        let mut writer = ResourceWriter {
            out,
            ctype: self.ctype,
            chunk_size: self.hdr.chunk_size,
            pipable: self.hdr.pipable,
        };

        let metadata_hashes: HashSet<Sha1Hash> =
            self.images.iter().filter_map(|i| i.metadata_hash).collect();

        let mut table_entries: Vec<BlobTableEntry> = Vec::new();
        let mut boot_metadata_reshdr = ResourceHeader::default();

        // Metadata resources: keep unmodified images' existing resources,
        // serialize the rest.
        for (i, image) in self.images.iter().enumerate() {
            let index = i as u32 + 1;
            let reshdr;
            let hash;
            let keep = !image.modified && image.metadata_hash.is_some();
            if keep {
                let existing_hash = image.metadata_hash.expect("checked above");
                let desc = self
                    .blob_table
                    .lookup(&existing_hash)
                    .ok_or(WimError::ResourceNotFound)?;
                let BlobLocation::InWim { res, .. } = &desc.location else {
                    return Err(WimError::ResourceNotFound);
                };
                reshdr = res.reshdr;
                hash = existing_hash;
            } else {
                let metadata = image
                    .metadata
                    .as_ref()
                    .ok_or(WimError::InvalidImage(index))?;
                let table = &self.blob_table;
                let bytes = metadata
                    .serialize(&|sref| table.resolve(sref).unwrap_or(ZERO_HASH));
                hash = sha1_buffer(&bytes);
                reshdr = writer.write_buffer(
                    &bytes,
                    ResourceFlags::METADATA,
                    self.ctype != CompressionType::None,
                    hash,
                )?;
            }
            if self.hdr.boot_index == index {
                boot_metadata_reshdr = reshdr;
            }
            table_entries.push(BlobTableEntry {
                reshdr,
                part_number: 1,
                refcount: 1,
                hash,
            });
            check(progress.progress(ProgressEvent::WriteMetadata {
                completed_images: index,
                total_images: self.image_count(),
            }))?;
        }

        // New blobs are the ones whose bytes are not already in this file.
        let new_blobs: Vec<Sha1Hash> = self
            .blob_table
            .iter()
            .filter(|d| d.refcount > 0)
            .filter(|d| !metadata_hashes.contains(&d.hash))
            .filter(|d| !self.blob_in_this_file(d.hash))
            .map(|d| d.hash)
            .collect();
        let total_bytes: u64 = new_blobs
            .iter()
            .filter_map(|h| self.blob_table.lookup(h))
            .map(|d| d.size)
            .sum();
        debug!(new_blobs = new_blobs.len(), total_bytes, "appending blobs");

        let mut pipeline = ChunkPipeline::new(
            self.ctype,
            if self.ctype == CompressionType::None {
                crate::header::WIM_CHUNK_SIZE
            } else {
                self.hdr.chunk_size
            },
            num_threads,
            total_bytes,
        )?;

        let mut completed_bytes = 0u64;
        for (i, hash) in new_blobs.iter().enumerate() {
            let desc = self
                .blob_table
                .lookup(hash)
                .ok_or(WimError::ResourceNotFound)?;
            let reshdr = writer.write_stream(
                desc.size,
                ResourceFlags::empty(),
                desc.hash,
                &mut pipeline,
                &mut |offset, len| {
                    read_blob_location(&desc.location, desc.size, &self.chunk_cache, offset, len)
                },
            )?;
            table_entries.push(BlobTableEntry {
                reshdr,
                part_number: 1,
                refcount: desc.refcount,
                hash: desc.hash,
            });
            completed_bytes += desc.size;
            check(progress.progress(ProgressEvent::WriteStreams {
                completed_bytes,
                total_bytes,
                completed_blobs: i as u64 + 1,
                total_blobs: new_blobs.len() as u64,
            }))?;
        }

        // Existing blobs keep their resources; re-emit their entries with
        // current reference counts.
        table_entries.extend(self.entries_for_existing_blobs(&metadata_hashes));

        let table_bytes = serialize_blob_table(&table_entries);
        let blob_table_reshdr =
            writer.write_buffer(&table_bytes, ResourceFlags::empty(), false, ZERO_HASH)?;

        let total = writer.out.stream_position()?;
        let xml_bytes = self.xml.serialize(total);
        let xml_reshdr =
            writer.write_buffer(&xml_bytes, ResourceFlags::empty(), false, ZERO_HASH)?;

        let keep_integrity = (self.integrity.is_some()
            || flags.contains(WriteFlags::CHECK_INTEGRITY))
            && !flags.contains(WriteFlags::NO_CHECK_INTEGRITY);
        let integrity_reshdr = if keep_integrity {
            writer.out.flush()?;
            let raf = Arc::new(RandomAccessFile::from(writer.out.try_clone()?));
            // Chunks covering the untouched prefix are reused from the old
            // table; only appended chunks are hashed.
            let table = IntegrityTable::build(
                &raf,
                blob_table_reshdr.end(),
                self.integrity.as_ref(),
                progress,
            )?;
            writer.write_buffer(&table.serialize(), ResourceFlags::empty(), false, ZERO_HASH)?
        } else {
            ResourceHeader::default()
        };

        let mut hdr = self.hdr.clone();
        hdr.flags -= HeaderFlags::WRITE_IN_PROGRESS;
        hdr.image_count = self.image_count();
        hdr.blob_table_reshdr = blob_table_reshdr;
        hdr.xml_data_reshdr = xml_reshdr;
        hdr.boot_metadata_reshdr = boot_metadata_reshdr;
        hdr.integrity_table_reshdr = integrity_reshdr;
        Ok(hdr)
    }

    /// Blob-table entries for blobs that stay where they are, solid
    /// markers included.
    fn entries_for_existing_blobs(
        &self,
        metadata_hashes: &HashSet<Sha1Hash>,
    ) -> Vec<BlobTableEntry> {
        let mut entries = Vec::new();
        let mut solid_groups: HashMap<usize, (Arc<ResourceDescriptor>, Vec<&crate::blob::BlobDescriptor>)> =
            HashMap::new();

        for desc in self.blob_table.iter() {
            if desc.refcount == 0
                || metadata_hashes.contains(&desc.hash)
                || !self.blob_in_this_file(desc.hash)
            {
                continue;
            }
            let BlobLocation::InWim { res, offset_in_res } = &desc.location else {
                continue;
            };
            if res.is_solid() {
                solid_groups
                    .entry(Arc::as_ptr(res) as usize)
                    .or_insert_with(|| (Arc::clone(res), Vec::new()))
                    .1
                    .push(desc);
            } else {
                let _ = offset_in_res;
                entries.push(BlobTableEntry {
                    reshdr: res.reshdr,
                    part_number: desc.part_number,
                    refcount: desc.refcount,
                    hash: desc.hash,
                });
            }
        }

        for (res, group) in solid_groups.into_values() {
            entries.push(BlobTableEntry {
                reshdr: ResourceHeader {
                    uncompressed_size: SOLID_RESOURCE_MAGIC,
                    ..res.reshdr
                },
                part_number: 1,
                refcount: 1,
                hash: ZERO_HASH,
            });
            for desc in group {
                let BlobLocation::InWim { offset_in_res, .. } = &desc.location else {
                    continue;
                };
                entries.push(BlobTableEntry {
                    reshdr: ResourceHeader {
                        size_in_wim: 0,
                        offset_in_wim: *offset_in_res,
                        uncompressed_size: desc.size,
                        flags: ResourceFlags::SOLID,
                    },
                    part_number: desc.part_number,
                    refcount: desc.refcount,
                    hash: desc.hash,
                });
            }
        }
        entries
    }

    fn owns_resource(&self, res: &Arc<ResourceDescriptor>) -> bool {
        self.file
            .as_ref()
            .is_some_and(|f| Arc::ptr_eq(f, &res.file))
    }

    fn blob_in_this_file(&self, hash: Sha1Hash) -> bool {
        match self.blob_table.lookup(&hash).map(|d| &d.location) {
            Some(BlobLocation::InWim { res, .. }) => self.owns_resource(res),
            _ => false,
        }
    }

    /// Full rewrite to a sibling temporary file, renamed over the original
    /// once durable.
    fn overwrite_rebuild(
        &mut self,
        path: &std::path::Path,
        flags: WriteFlags,
        num_threads: usize,
        progress: &mut dyn ProgressSink,
    ) -> Result<()> {
        let _lock = WimLock::acquire(path)?;
        let tmp_name = format!(
            "{}.tmp-{}",
            path.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "wim".into()),
            uuid::Uuid::new_v4().simple()
        );
        let tmp_path = path.with_file_name(tmp_name);
        debug!(tmp = %tmp_path.display(), "rebuilding via temporary file");

        // The temporary file must be durable before it replaces the
        // original; a crash mid-rename then yields one of the two valid
        // files, never a torn one.
        let result = self.write_archive_to_path(
            &tmp_path,
            flags | WriteFlags::FSYNC | WriteFlags::RETAIN_GUID,
            num_threads,
            None,
            progress,
        );
        if let Err(e) = result {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(e);
        }
        check(progress.progress(ProgressEvent::Rename {
            from: &tmp_path,
            to: path,
        }))
        .inspect_err(|_| {
            let _ = std::fs::remove_file(&tmp_path);
        })?;

        // Release our descriptor on the old file before replacing it.
        self.file = None;
        std::fs::rename(&tmp_path, path).map_err(|source| WimError::Io {
            path: Some(path.to_owned()),
            source,
        })?;
        *self = Wim::open(path, OpenFlags::empty())?;
        Ok(())
    }

    /// In-place compaction: surviving resources slide down over freed
    /// space, then the file is truncated. Destructive on interruption.
    fn overwrite_compact(
        &mut self,
        path: &std::path::Path,
        flags: WriteFlags,
        progress: &mut dyn ProgressSink,
    ) -> Result<()> {
        let _lock = WimLock::acquire(path)?;
        warn!("unsafe compact: interruption will corrupt the archive");

        let mut out = std::fs::File::options()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|source| WimError::Io {
                path: Some(path.to_owned()),
                source,
            })?;

        // Unique live resources, in file order.
        let metadata_hashes: HashSet<Sha1Hash> =
            self.images.iter().filter_map(|i| i.metadata_hash).collect();
        let mut resources: Vec<Arc<ResourceDescriptor>> = Vec::new();
        let mut seen = HashSet::new();
        for desc in self.blob_table.iter() {
            if desc.refcount == 0 && !metadata_hashes.contains(&desc.hash) {
                continue;
            }
            if let BlobLocation::InWim { res, .. } = &desc.location {
                if self.owns_resource(res) && seen.insert(Arc::as_ptr(res) as usize) {
                    resources.push(Arc::clone(res));
                }
            }
        }
        resources.sort_by_key(|r| r.reshdr.offset_in_wim);

        let mut in_progress_hdr = self.hdr.clone();
        in_progress_hdr.flags |= HeaderFlags::WRITE_IN_PROGRESS;
        out.seek(SeekFrom::Start(0))?;
        out.write_all(in_progress_hdr.to_disk().as_bytes())?;

        // Slide resources down. Sorting guarantees the destination never
        // overtakes the source, so a chunked forward copy is safe.
        let mut new_offsets: HashMap<u64, u64> = HashMap::new();
        let mut dest = HEADER_SIZE as u64;
        let mut buf = vec![0u8; 1 << 20];
        for res in &resources {
            let old = res.reshdr.offset_in_wim;
            let new = dest;
            if new > old {
                return Err(WimError::ResourceOrder);
            }
            if new != old {
                let mut copied = 0u64;
                while copied < res.reshdr.size_in_wim {
                    let n = (res.reshdr.size_in_wim - copied).min(buf.len() as u64) as usize;
                    res.file.read_exact_at(&mut buf[..n], old + copied)?;
                    out.seek(SeekFrom::Start(new + copied))?;
                    out.write_all(&buf[..n])?;
                    copied += n as u64;
                }
            }
            new_offsets.insert(old, new);
            dest += res.reshdr.size_in_wim;
        }

        // New table entries with relocated offsets.
        let mut table_entries: Vec<BlobTableEntry> = Vec::new();
        let mut boot_metadata_reshdr = ResourceHeader::default();
        for (i, image) in self.images.iter().enumerate() {
            let hash = image
                .metadata_hash
                .ok_or(WimError::InvalidImage(i as u32 + 1))?;
            let desc = self
                .blob_table
                .lookup(&hash)
                .ok_or(WimError::ResourceNotFound)?;
            let BlobLocation::InWim { res, .. } = &desc.location else {
                return Err(WimError::ResourceNotFound);
            };
            let reshdr = ResourceHeader {
                offset_in_wim: new_offsets[&res.reshdr.offset_in_wim],
                ..res.reshdr
            };
            if self.hdr.boot_index == i as u32 + 1 {
                boot_metadata_reshdr = reshdr;
            }
            table_entries.push(BlobTableEntry {
                reshdr,
                part_number: 1,
                refcount: 1,
                hash,
            });
        }
        for entry in self.entries_for_existing_blobs(&metadata_hashes) {
            let mut entry = entry;
            if !entry.reshdr.flags.contains(ResourceFlags::SOLID)
                || entry.reshdr.uncompressed_size == SOLID_RESOURCE_MAGIC
            {
                entry.reshdr.offset_in_wim = new_offsets[&entry.reshdr.offset_in_wim];
            }
            table_entries.push(entry);
        }

        out.seek(SeekFrom::Start(dest))?;
        let mut writer = ResourceWriter {
            out: &mut out,
            ctype: self.ctype,
            chunk_size: self.hdr.chunk_size,
            pipable: self.hdr.pipable,
        };
        let table_bytes = serialize_blob_table(&table_entries);
        let blob_table_reshdr =
            writer.write_buffer(&table_bytes, ResourceFlags::empty(), false, ZERO_HASH)?;
        let total = writer.out.stream_position()?;
        let xml_bytes = self.xml.serialize(total);
        let xml_reshdr =
            writer.write_buffer(&xml_bytes, ResourceFlags::empty(), false, ZERO_HASH)?;

        let keep_integrity = (self.integrity.is_some()
            || flags.contains(WriteFlags::CHECK_INTEGRITY))
            && !flags.contains(WriteFlags::NO_CHECK_INTEGRITY);
        let integrity_reshdr = if keep_integrity {
            writer.out.flush()?;
            let raf = Arc::new(RandomAccessFile::from(writer.out.try_clone()?));
            let table = IntegrityTable::build(&raf, blob_table_reshdr.end(), None, progress)?;
            writer.write_buffer(&table.serialize(), ResourceFlags::empty(), false, ZERO_HASH)?
        } else {
            ResourceHeader::default()
        };

        let end = out.stream_position()?;
        let mut hdr = self.hdr.clone();
        hdr.flags -= HeaderFlags::WRITE_IN_PROGRESS;
        hdr.image_count = self.image_count();
        hdr.blob_table_reshdr = blob_table_reshdr;
        hdr.xml_data_reshdr = xml_reshdr;
        hdr.boot_metadata_reshdr = boot_metadata_reshdr;
        hdr.integrity_table_reshdr = integrity_reshdr;
        out.flush()?;
        out.seek(SeekFrom::Start(0))?;
        out.write_all(hdr.to_disk().as_bytes())?;
        out.set_len(end)?;
        if flags.contains(WriteFlags::FSYNC) {
            out.sync_all()?;
        }
        drop(out);
        debug!(new_size = end, "compacted archive");

        *self = Wim::open(path, OpenFlags::empty())?;
        Ok(())
    }
}
