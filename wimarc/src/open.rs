//! Opening existing WIM files.

use std::path::Path;
use std::sync::{Arc, Mutex};

use sync_file::{RandomAccessFile, ReadAt};
use tracing::{debug, info_span, warn};
use zerocopy::FromBytes;

use crate::blob::{BlobDescriptor, BlobLocation, BlobTable};
use crate::error::{Result, WimError};
use crate::header::{
    BlobTableEntryDisk, HeaderFlags, ResourceFlags, WimHeader, BLOB_TABLE_ENTRY_SIZE, HEADER_SIZE,
    SOLID_RESOURCE_MAGIC,
};
use crate::integrity::IntegrityTable;
use crate::progress::{NoProgress, ProgressSink};
use crate::resource::{read_partial, ChunkCache, ResourceDescriptor};
use crate::sha1::Sha1Hash;
use crate::xml::XmlData;
use crate::{ImageEntry, OpenFlags, Wim};

impl Wim {
    /// Opens a WIM file.
    ///
    /// The blob table, image index, and XML data are loaded eagerly;
    /// per-image metadata trees and all blob contents load lazily.
    pub fn open(path: impl AsRef<Path>, flags: OpenFlags) -> Result<Self> {
        Self::open_with_progress(path, flags, &mut NoProgress)
    }

    /// [`Wim::open`] with a progress sink (integrity verification reports
    /// per-chunk progress and may be cancelled).
    pub fn open_with_progress(
        path: impl AsRef<Path>,
        flags: OpenFlags,
        progress: &mut dyn ProgressSink,
    ) -> Result<Self> {
        let path = path.as_ref();
        let _span = info_span!("Wim::open", path = %path.display()).entered();

        let file = std::fs::File::open(path).map_err(|source| WimError::Io {
            path: Some(path.to_owned()),
            source,
        })?;
        let file_size = file
            .metadata()
            .map_err(|source| WimError::Io {
                path: Some(path.to_owned()),
                source,
            })?
            .len();
        let file = Arc::new(RandomAccessFile::from(file));

        let mut header_bytes = [0u8; HEADER_SIZE];
        file.read_exact_at(&mut header_bytes, 0)
            .map_err(|_| WimError::InvalidHeader("file too small for a WIM header".into()))?;
        let hdr = WimHeader::parse(&header_bytes)?;
        let ctype = hdr.compression_type()?;
        debug!(
            ?ctype,
            images = hdr.image_count,
            pipable = hdr.pipable,
            "parsed header"
        );

        if hdr.flags.contains(HeaderFlags::WRITE_IN_PROGRESS) {
            // An interrupted overwrite: the header still describes the old,
            // valid archive; bytes past its tables are garbage.
            warn!("archive has an interrupted write; trailing data is ignored");
        }
        if hdr.total_parts != 1 && !flags.contains(OpenFlags::SPLIT_OK) {
            return Err(WimError::SplitUnsupported);
        }
        if flags.contains(OpenFlags::WRITE_ACCESS)
            && hdr.flags.contains(HeaderFlags::READONLY)
        {
            return Err(WimError::WimIsReadonly);
        }

        // Integrity verification covers header-to-blob-table, so it runs
        // before anything else is believed.
        let integrity = if hdr.integrity_table_reshdr.is_zero() {
            None
        } else {
            let res = ResourceDescriptor::new(
                Arc::clone(&file),
                hdr.integrity_table_reshdr,
                ctype,
                hdr.chunk_size,
                hdr.pipable,
            );
            let cache = Mutex::new(ChunkCache::new());
            let bytes = read_partial(&res, &cache, 0, res.uncompressed_size()?)?;
            Some(IntegrityTable::parse(&bytes)?)
        };
        if flags.contains(OpenFlags::CHECK_INTEGRITY) {
            if let Some(table) = &integrity {
                table.verify(&file, progress)?;
            }
        }

        let mut this = Self {
            path: Some(path.to_owned()),
            file: Some(Arc::clone(&file)),
            file_size,
            ctype,
            blob_table: BlobTable::new(),
            images: Vec::new(),
            xml: XmlData::new(),
            integrity,
            chunk_cache: Mutex::new(ChunkCache::new()),
            any_images_deleted: false,
            hdr,
        };

        let metadata_hashes = this.load_blob_table(&file)?;
        if this.hdr.part_number == 1
            && metadata_hashes.len() != this.hdr.image_count as usize
        {
            return Err(WimError::InvalidMetadata(format!(
                "header says {} images but found {} metadata blobs",
                this.hdr.image_count,
                metadata_hashes.len()
            )));
        }
        this.images = metadata_hashes
            .into_iter()
            .map(|hash| ImageEntry {
                metadata_hash: Some(hash),
                metadata: None,
                modified: false,
            })
            .collect();

        // XML data (opaque UTF-16 bytes to everyone but the image list).
        if !this.hdr.xml_data_reshdr.is_zero() {
            let res = ResourceDescriptor::new(
                Arc::clone(&file),
                this.hdr.xml_data_reshdr,
                ctype,
                this.hdr.chunk_size,
                this.hdr.pipable,
            );
            let bytes = read_partial(&res, &this.chunk_cache, 0, res.uncompressed_size()?)?;
            this.xml = XmlData::parse(&bytes)?;
        }
        if this.hdr.part_number == 1 && this.xml.image_count() != this.images.len() {
            return Err(WimError::InvalidMetadata(format!(
                "XML lists {} images but the archive stores {}",
                this.xml.image_count(),
                this.images.len()
            )));
        }

        Ok(this)
    }

    /// Reads and indexes the blob table. Returns the metadata-blob hashes
    /// in table (= image) order.
    fn load_blob_table(&mut self, file: &Arc<RandomAccessFile>) -> Result<Vec<Sha1Hash>> {
        let reshdr = self.hdr.blob_table_reshdr;
        if reshdr.is_zero() {
            return Ok(Vec::new());
        }
        let res = ResourceDescriptor::new(
            Arc::clone(file),
            reshdr,
            self.ctype,
            self.hdr.chunk_size,
            self.hdr.pipable,
        );
        let bytes = read_partial(&res, &self.chunk_cache, 0, res.uncompressed_size()?)?;
        if bytes.len() % BLOB_TABLE_ENTRY_SIZE != 0 {
            return Err(WimError::InvalidMetadata(
                "blob table size is not a multiple of the entry size".into(),
            ));
        }

        let mut metadata_hashes = Vec::new();
        // Blobs inside a solid resource follow their resource's entry.
        let mut open_solid: Option<Arc<ResourceDescriptor>> = None;

        for raw in bytes.chunks_exact(BLOB_TABLE_ENTRY_SIZE) {
            let disk = BlobTableEntryDisk::ref_from_bytes(raw)
                .map_err(|_| WimError::InvalidMetadata("blob table entry invalid".into()))?;
            let entry = crate::header::BlobTableEntry::from_disk(disk);

            if entry.reshdr.flags.contains(ResourceFlags::SOLID) {
                if entry.reshdr.uncompressed_size == SOLID_RESOURCE_MAGIC {
                    // The marker entry describing a solid resource itself.
                    let mut reshdr = entry.reshdr;
                    reshdr.uncompressed_size = 0;
                    open_solid = Some(Arc::new(ResourceDescriptor::new(
                        Arc::clone(file),
                        reshdr,
                        self.ctype,
                        self.hdr.chunk_size,
                        self.hdr.pipable,
                    )));
                    continue;
                }
                let res = open_solid.as_ref().ok_or_else(|| {
                    WimError::InvalidMetadata(
                        "solid blob entry precedes any solid resource".into(),
                    )
                })?;
                res.register_blob(entry.hash);
                self.blob_table.insert(BlobDescriptor {
                    hash: entry.hash,
                    size: entry.reshdr.uncompressed_size,
                    refcount: entry.refcount,
                    location: BlobLocation::InWim {
                        res: Arc::clone(res),
                        offset_in_res: entry.reshdr.offset_in_wim,
                    },
                    part_number: entry.part_number,
                    sort_hint: None,
                });
                continue;
            }

            let res = Arc::new(ResourceDescriptor::new(
                Arc::clone(file),
                entry.reshdr,
                self.ctype,
                self.hdr.chunk_size,
                self.hdr.pipable,
            ));
            res.register_blob(entry.hash);
            if entry.reshdr.flags.contains(ResourceFlags::METADATA) {
                metadata_hashes.push(entry.hash);
            }
            self.blob_table.insert(BlobDescriptor {
                hash: entry.hash,
                size: entry.reshdr.uncompressed_size,
                refcount: entry.refcount,
                location: BlobLocation::InWim {
                    res,
                    offset_in_res: 0,
                },
                part_number: entry.part_number,
                sort_hint: None,
            });
        }

        debug!(
            blobs = self.blob_table.len(),
            metadata = metadata_hashes.len(),
            "loaded blob table"
        );
        Ok(metadata_hashes)
    }
}
