//! Reads, modifies, and writes archives in the Windows Imaging (WIM)
//! format.
//!
//! A WIM file contains one or more *images* — named snapshots of a
//! directory tree — whose file contents are stored as content-addressed,
//! deduplicated *blobs*: identical contents across files and images occupy
//! the archive once. Blob data lives in possibly-compressed *resources*
//! (XPRESS, LZX, or LZMS chunks; see the `wimcodec` crate), indexed by a
//! blob table keyed on SHA-1.
//!
//! The [`Wim`] type is the entry point. It is created empty
//! ([`Wim::create_new`]) or by opening a file ([`Wim::open`]); image
//! additions and deletions stage changes in memory, and nothing touches
//! disk until [`Wim::write`] or [`Wim::overwrite`]. A WIM file on disk is
//! always left in a valid state: full writes go to a fresh file, in-place
//! overwrites only append and commit by rewriting the header last, and the
//! rebuild path replaces the file atomically via a rename.
//!
//! Multi-part (split) archives are produced by [`Wim::split`] and
//! recombined with [`join`].
//!
//! A [`Wim`] is not thread-safe; callers own synchronization. The only
//! internal parallelism is the chunk-compression worker pool used during
//! writes.

#![forbid(unsafe_code)]
#![forbid(unused_must_use)]
#![warn(missing_docs)]

mod blob;
pub mod encoding;
mod error;
mod header;
mod integrity;
mod lock;
mod metadata;
mod open;
mod overwrite;
mod parallel;
mod progress;
mod resource;
mod sha1;
mod split;
mod write;
mod xml;

#[cfg(test)]
mod tests;

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use sync_file::RandomAccessFile;
use tracing::debug;

pub use blob::{StreamRef, UnhashedId};
pub use error::{Result, WimError};
pub use header::{
    HeaderFlags, ResourceFlags, ResourceHeader, WimHeader, HEADER_SIZE, PWM_MAGIC, WIM_CHUNK_SIZE,
    WIM_MAGIC, WIM_VERSION_DEFAULT, WIM_VERSION_SOLID,
};
pub use integrity::{IntegrityTable, INTEGRITY_CHUNK_SIZE};
pub use metadata::{
    Dentry, ImageMetadata, Inode, InodeStream, SecurityData, SourceEntry, ATTRIBUTE_DIRECTORY,
    ATTRIBUTE_NORMAL, ATTRIBUTE_REPARSE_POINT,
};
pub use parallel::{ChunkPipeline, ChunkResult};
pub use progress::{NoProgress, ProgressEvent, ProgressSink};
pub use sha1::{sha1_buffer, Sha1Hash, Sha1Stream, ZERO_HASH};
pub use split::join;
pub use wimcodec::CompressionType;
pub use xml::{XmlData, XmlImage};

use blob::BlobTable;
use resource::ChunkCache;

bitflags::bitflags! {
    /// Flags for [`Wim::open`].
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        /// Verify the integrity table, when present, while opening.
        const CHECK_INTEGRITY = 0x0000_0001;
        /// Permit opening one part of a split archive.
        const SPLIT_OK = 0x0000_0002;
        /// Intend to modify the archive; refuses read-only archives.
        const WRITE_ACCESS = 0x0000_0004;
    }
}

bitflags::bitflags! {
    /// Flags for [`Wim::write`] and [`Wim::overwrite`].
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct WriteFlags: u32 {
        /// Write (or update) an integrity table.
        const CHECK_INTEGRITY = 0x0000_0001;
        /// Drop any existing integrity table.
        const NO_CHECK_INTEGRITY = 0x0000_0002;
        /// Produce a pipable archive.
        const PIPABLE = 0x0000_0004;
        /// Produce a classic (non-pipable) archive.
        const NOT_PIPABLE = 0x0000_0008;
        /// Recompress resources even when a byte copy would do.
        const RECOMPRESS = 0x0000_0010;
        /// `fsync` before closing (and before any rename-over).
        const FSYNC = 0x0000_0020;
        /// Force `overwrite` to rebuild the whole file.
        const REBUILD = 0x0000_0040;
        /// Keep unreferenced blobs in the archive (no space reclaim), which
        /// lets `overwrite` append instead of rebuilding after deletions.
        const SOFT_DELETE = 0x0000_0080;
        /// Ignore the archive's read-only header flag.
        const IGNORE_READONLY_FLAG = 0x0000_0100;
        /// Keep the archive's GUID instead of generating a fresh one.
        const RETAIN_GUID = 0x0000_0800;
        /// Pack file data into solid resources.
        const SOLID = 0x0000_1000;
        /// Allow `overwrite` to compact the file in place, reusing byte
        /// ranges. **Not crash-safe**: interrupting it corrupts the file.
        const UNSAFE_COMPACT = 0x0000_4000;
    }
}

/// One image slot: the metadata blob hash (when stored) and the parsed
/// tree (when loaded or newly constructed).
pub(crate) struct ImageEntry {
    /// Hash of the serialized metadata blob, if it exists in the archive.
    pub metadata_hash: Option<Sha1Hash>,
    /// The in-memory tree; `None` until lazily loaded.
    pub metadata: Option<ImageMetadata>,
    /// Whether the tree diverged from the stored blob.
    pub modified: bool,
}

/// An open WIM archive plus staged in-memory changes.
pub struct Wim {
    pub(crate) path: Option<PathBuf>,
    pub(crate) file: Option<Arc<RandomAccessFile>>,
    pub(crate) file_size: u64,
    pub(crate) hdr: WimHeader,
    pub(crate) ctype: CompressionType,
    pub(crate) blob_table: BlobTable,
    pub(crate) images: Vec<ImageEntry>,
    pub(crate) xml: XmlData,
    pub(crate) integrity: Option<IntegrityTable>,
    pub(crate) chunk_cache: Mutex<ChunkCache>,
    /// An image was deleted since open; append-style overwrite would leak
    /// the space, so a rebuild is forced unless soft delete was requested.
    pub(crate) any_images_deleted: bool,
}

impl Wim {
    /// Creates a new, empty, in-memory archive using `ctype` compression.
    pub fn create_new(ctype: CompressionType) -> Result<Self> {
        if ctype != CompressionType::None && !ctype.is_valid_chunk_size(header::WIM_CHUNK_SIZE) {
            return Err(WimError::InvalidCompressionType(ctype.to_code()));
        }
        Ok(Self {
            path: None,
            file: None,
            file_size: 0,
            hdr: WimHeader::new(ctype),
            ctype,
            blob_table: BlobTable::new(),
            images: Vec::new(),
            xml: XmlData::new(),
            integrity: None,
            chunk_cache: Mutex::new(ChunkCache::new()),
            any_images_deleted: false,
        })
    }

    /// The archive's compression format.
    pub fn compression_type(&self) -> CompressionType {
        self.ctype
    }

    /// The archive's chunk size (0 when uncompressed).
    pub fn chunk_size(&self) -> u32 {
        self.hdr.chunk_size
    }

    /// The archive GUID shared by all parts of a split set.
    pub fn guid(&self) -> [u8; 16] {
        self.hdr.guid
    }

    /// Whether the file uses the pipable layout.
    pub fn is_pipable(&self) -> bool {
        self.hdr.pipable
    }

    /// (part number, total parts); (1, 1) for standalone archives.
    pub fn part_info(&self) -> (u16, u16) {
        (self.hdr.part_number, self.hdr.total_parts)
    }

    /// Whether the on-disk header carried the write-in-progress flag,
    /// indicating an interrupted overwrite whose appended data was never
    /// committed.
    pub fn write_in_progress(&self) -> bool {
        self.hdr.flags.contains(HeaderFlags::WRITE_IN_PROGRESS)
    }

    /// Number of images.
    pub fn image_count(&self) -> u32 {
        self.images.len() as u32
    }

    /// The 1-based boot image index, or 0 for none.
    pub fn boot_index(&self) -> u32 {
        self.hdr.boot_index
    }

    /// Sets the boot image (0 clears it).
    pub fn set_boot_index(&mut self, index: u32) -> Result<()> {
        if index > self.image_count() {
            return Err(WimError::InvalidImage(index));
        }
        self.hdr.boot_index = index;
        Ok(())
    }

    /// The name of image `index` (1-based).
    pub fn image_name(&self, index: u32) -> Result<&str> {
        let entry = self
            .xml
            .images
            .get(index.checked_sub(1).ok_or(WimError::InvalidImage(index))? as usize)
            .ok_or(WimError::InvalidImage(index))?;
        Ok(&entry.name)
    }

    /// The description of image `index` (1-based).
    pub fn image_description(&self, index: u32) -> Result<Option<&str>> {
        let entry = self
            .xml
            .images
            .get(index.checked_sub(1).ok_or(WimError::InvalidImage(index))? as usize)
            .ok_or(WimError::InvalidImage(index))?;
        Ok(entry.description.as_deref())
    }

    /// Renames image `index`.
    pub fn set_image_name(&mut self, index: u32, name: &str) -> Result<()> {
        self.validate_image(index)?;
        if !name.is_empty() && self.resolve_image_name(name).is_some() {
            return Err(WimError::ImageNameCollision(name.to_owned()));
        }
        self.xml.images[index as usize - 1].name = name.to_owned();
        self.xml.mark_dirty();
        Ok(())
    }

    /// The 1-based index of the image named `name`, case-insensitively.
    pub fn resolve_image_name(&self, name: &str) -> Option<u32> {
        self.xml
            .images
            .iter()
            .position(|i| i.name.eq_ignore_ascii_case(name))
            .map(|i| i as u32 + 1)
    }

    fn validate_image(&self, index: u32) -> Result<()> {
        if index == 0 || index > self.image_count() {
            return Err(WimError::InvalidImage(index));
        }
        Ok(())
    }

    /// Adds a new image built from scanner entries. Returns its 1-based
    /// index.
    pub fn add_image(
        &mut self,
        name: &str,
        description: Option<&str>,
        entries: &[SourceEntry],
    ) -> Result<u32> {
        if self.hdr.total_parts != 1 {
            return Err(WimError::SplitUnsupported);
        }
        if !name.is_empty() && self.resolve_image_name(name).is_some() {
            return Err(WimError::ImageNameCollision(name.to_owned()));
        }

        let metadata = ImageMetadata::build(entries, &mut self.blob_table)?;
        let total_bytes = metadata.total_stream_bytes(&self.blob_table);
        self.images.push(ImageEntry {
            metadata_hash: None,
            metadata: Some(metadata),
            modified: true,
        });
        self.xml.images.push(XmlImage {
            name: name.to_owned(),
            description: description.map(str::to_owned),
            total_bytes,
        });
        self.xml.mark_dirty();
        self.hdr.image_count = self.image_count();
        debug!(image = self.image_count(), name, "added image");
        Ok(self.image_count())
    }

    /// Deletes image `index` (1-based), dropping the blob references it
    /// held. Blobs whose reference count reaches zero leave the table.
    pub fn delete_image(&mut self, index: u32) -> Result<()> {
        self.validate_image(index)?;

        // The stream references must be enumerated before the image goes
        // away, which requires the tree to be loaded.
        self.load_image_metadata(index)?;
        let slot = index as usize - 1;
        let entry = self.images.remove(slot);
        let metadata = entry.metadata.expect("metadata was just loaded");

        for sref in metadata.all_stream_refs() {
            self.blob_table.release_stream_ref(&sref, 1, false);
        }
        if let Some(hash) = entry.metadata_hash {
            self.blob_table.release_ref(&hash, 1, false);
        }

        self.xml.images.remove(slot);
        self.xml.mark_dirty();
        self.hdr.image_count = self.image_count();
        if self.hdr.boot_index == index {
            self.hdr.boot_index = 0;
        } else if self.hdr.boot_index > index {
            self.hdr.boot_index -= 1;
        }
        self.any_images_deleted = true;
        debug!(image = index, "deleted image");
        Ok(())
    }

    /// Loads (if needed) and returns image `index`'s metadata tree.
    pub fn image_metadata(&mut self, index: u32) -> Result<&ImageMetadata> {
        self.load_image_metadata(index)?;
        Ok(self.images[index as usize - 1]
            .metadata
            .as_ref()
            .expect("metadata was just loaded"))
    }

    pub(crate) fn load_image_metadata(&mut self, index: u32) -> Result<()> {
        self.validate_image(index)?;
        let slot = index as usize - 1;
        if self.images[slot].metadata.is_some() {
            return Ok(());
        }
        let hash = self.images[slot]
            .metadata_hash
            .ok_or(WimError::InvalidImage(index))?;
        let bytes = self.read_blob(&hash)?;
        let metadata = ImageMetadata::parse(&bytes)?;
        self.images[slot].metadata = Some(metadata);
        Ok(())
    }

    /// Whether the blob table contains `hash`.
    pub fn has_blob(&self, hash: &Sha1Hash) -> bool {
        self.blob_table.lookup(hash).is_some()
    }

    /// Number of blobs in the blob table.
    pub fn blob_count(&self) -> usize {
        self.blob_table.len()
    }

    /// All blob hashes currently in the table.
    pub fn blob_hashes(&self) -> Vec<Sha1Hash> {
        self.blob_table.iter().map(|d| d.hash).collect()
    }

    /// The reference count of blob `hash`.
    pub fn blob_refcount(&self, hash: &Sha1Hash) -> Result<u32> {
        Ok(self
            .blob_table
            .lookup(hash)
            .ok_or(WimError::ResourceNotFound)?
            .refcount)
    }

    /// The uncompressed size of blob `hash`.
    pub fn blob_size(&self, hash: &Sha1Hash) -> Result<u64> {
        Ok(self
            .blob_table
            .lookup(hash)
            .ok_or(WimError::ResourceNotFound)?
            .size)
    }

    /// Reads a whole blob and verifies its SHA-1.
    pub fn read_blob(&self, hash: &Sha1Hash) -> Result<Vec<u8>> {
        let desc = self.blob_table.lookup(hash).ok_or(WimError::ResourceNotFound)?;
        let data =
            resource::read_blob_location(&desc.location, desc.size, &self.chunk_cache, 0, desc.size)?;
        if sha1_buffer(&data) != *hash {
            return Err(WimError::InvalidResourceHash);
        }
        Ok(data)
    }

    /// Reads `len` bytes at `offset` within blob `hash`, without hash
    /// verification (partial reads cannot be verified).
    pub fn read_blob_range(&self, hash: &Sha1Hash, offset: u64, len: u64) -> Result<Vec<u8>> {
        let desc = self.blob_table.lookup(hash).ok_or(WimError::ResourceNotFound)?;
        resource::read_blob_location(&desc.location, desc.size, &self.chunk_cache, offset, len)
    }

    /// Reads the contents of the file at `path` inside image `index`.
    pub fn read_file(&mut self, index: u32, path: &str) -> Result<Vec<u8>> {
        let sref = {
            let metadata = self.image_metadata(index)?;
            let dentry = metadata
                .lookup_path(path)
                .ok_or(WimError::ResourceNotFound)?;
            let inode = &metadata.inodes[dentry.inode];
            inode.unnamed_stream().map(|s| s.sref.clone())
        };
        match sref {
            None | Some(StreamRef::Zero) => Ok(Vec::new()),
            Some(StreamRef::Hashed(hash)) => self.read_blob(&hash),
            Some(sref @ StreamRef::Unhashed(_)) => {
                // Still staged; hash it now so the normal path applies.
                self.blob_table.resolve_all_unhashed();
                let hash = self
                    .blob_table
                    .resolve(&sref)
                    .ok_or(WimError::ResourceNotFound)?;
                self.read_blob(&hash)
            }
        }
    }

    /// Copies image `src_index` of `src` into this archive, sharing blob
    /// storage by reference. Returns the new image's 1-based index.
    pub fn export_image(
        &mut self,
        src: &mut Wim,
        src_index: u32,
        name: &str,
        description: Option<&str>,
    ) -> Result<u32> {
        if !name.is_empty() && self.resolve_image_name(name).is_some() {
            return Err(WimError::ImageNameCollision(name.to_owned()));
        }
        src.load_image_metadata(src_index)?;
        src.blob_table.resolve_all_unhashed();
        let metadata = src.images[src_index as usize - 1]
            .metadata
            .clone()
            .expect("metadata was just loaded");

        // Register every referenced blob in our table, pointing at the
        // source archive's resources.
        for sref in metadata.all_stream_refs() {
            let Some(hash) = src.blob_table.resolve(&sref) else {
                return Err(WimError::ResourceNotFound);
            };
            if hash == ZERO_HASH {
                continue;
            }
            if self.blob_table.add_ref(&hash, 1) {
                continue;
            }
            let src_desc = src.blob_table.lookup(&hash).ok_or(WimError::ResourceNotFound)?;
            self.blob_table.insert(blob::BlobDescriptor {
                hash,
                size: src_desc.size,
                refcount: 1,
                location: src_desc.location.clone(),
                part_number: 1,
                sort_hint: src_desc.sort_hint.clone(),
            });
        }

        let total_bytes = metadata.total_stream_bytes(&self.blob_table);
        self.images.push(ImageEntry {
            metadata_hash: None,
            metadata: Some(metadata),
            modified: true,
        });
        self.xml.images.push(XmlImage {
            name: name.to_owned(),
            description: description.map(str::to_owned),
            total_bytes,
        });
        self.xml.mark_dirty();
        self.hdr.image_count = self.image_count();
        Ok(self.image_count())
    }

    /// Releases in-memory state. Dropping the [`Wim`] does the same; this
    /// exists for explicit lifecycle management.
    pub fn free(self) {}
}
