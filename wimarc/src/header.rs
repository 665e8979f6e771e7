//! On-disk layout of the WIM header, resource headers, and blob-table
//! entries. All fields are little-endian.

use bitflags::bitflags;
use zerocopy::little_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::error::{Result, WimError};
use crate::sha1::Sha1Hash;
use wimcodec::CompressionType;

/// Magic of a classic WIM file: `MSWIM\0\0\0`.
pub const WIM_MAGIC: u64 = u64::from_le_bytes(*b"MSWIM\0\0\0");
/// Magic of a pipable WIM file: `WLPWM\0\0\0`.
pub const PWM_MAGIC: u64 = u64::from_le_bytes(*b"WLPWM\0\0\0");

/// Magic preceding each blob in a pipable WIM.
pub const PWM_BLOB_MAGIC: u64 = 0x3226_064a_cf31_c44d;

/// Header version of classic WIMs.
pub const WIM_VERSION_DEFAULT: u32 = 0x10d00;
/// Header version of WIMs that may contain solid resources.
pub const WIM_VERSION_SOLID: u32 = 0x10e00;

/// Size of the on-disk header.
pub const HEADER_SIZE: usize = 208;
/// Size of an on-disk resource header.
pub const RESHDR_SIZE: usize = 24;
/// Size of an on-disk blob-table entry.
pub const BLOB_TABLE_ENTRY_SIZE: usize = 50;

/// Uncompressed chunk size required of classic compressed resources.
pub const WIM_CHUNK_SIZE: u32 = wimcodec::WIM_CHUNK_SIZE;

/// The `uncompressed_size` sentinel that marks a blob-table entry as
/// describing a solid resource itself rather than a blob inside one.
pub const SOLID_RESOURCE_MAGIC: u64 = 0x1_0000_0000;

bitflags! {
    /// Flags in the WIM header.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct HeaderFlags: u32 {
        /// Reserved.
        const RESERVED = 0x0000_0001;
        /// Resources may be compressed; one of the COMPRESS_* bits selects
        /// the format.
        const COMPRESSION = 0x0000_0002;
        /// The archive is marked read-only.
        const READONLY = 0x0000_0004;
        /// Part of a split (spanned) set.
        const SPANNED = 0x0000_0008;
        /// Contains file resources only (no metadata).
        const RESOURCE_ONLY = 0x0000_0010;
        /// Contains metadata only.
        const METADATA_ONLY = 0x0000_0020;
        /// A write was in progress; the trailing data may be garbage.
        const WRITE_IN_PROGRESS = 0x0000_0040;
        /// Reparse-point fixups were applied at capture time.
        const RP_FIX = 0x0000_0080;
        /// Reserved compression format bit.
        const COMPRESS_RESERVED = 0x0001_0000;
        /// Resources use XPRESS compression.
        const COMPRESS_XPRESS = 0x0002_0000;
        /// Resources use LZX compression.
        const COMPRESS_LZX = 0x0004_0000;
        /// Resources use LZMS compression.
        const COMPRESS_LZMS = 0x0008_0000;
    }
}

bitflags! {
    /// Flags in a resource header.
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
    pub struct ResourceFlags: u8 {
        /// The byte range is free space, not a live resource.
        const FREE = 0x01;
        /// The resource is an image-metadata resource.
        const METADATA = 0x02;
        /// The resource is chunk-compressed.
        const COMPRESSED = 0x04;
        /// The resource continues in another split part.
        const SPANNED = 0x08;
        /// The resource holds (or the entry refers into) a solid resource.
        const SOLID = 0x10;
    }
}

/// An on-disk resource header: a 56-bit stored size packed with 8 flag bits,
/// then the file offset and uncompressed size.
#[allow(missing_docs)]
#[derive(Copy, Clone, IntoBytes, FromBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct ReshdrDisk {
    /// `size_in_wim` in the low 56 bits, flags in the high 8.
    pub size_and_flags: U64,
    /// File offset of the resource.
    pub offset_in_wim: U64,
    /// Size after decompression.
    pub uncompressed_size: U64,
}

static_assertions::const_assert_eq!(std::mem::size_of::<ReshdrDisk>(), RESHDR_SIZE);

/// A resource header in memory.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub struct ResourceHeader {
    /// Byte count the resource occupies in the file (56 bits on disk).
    pub size_in_wim: u64,
    /// File offset of the resource.
    pub offset_in_wim: u64,
    /// Size after decompression.
    pub uncompressed_size: u64,
    /// Resource flags.
    pub flags: ResourceFlags,
}

impl ResourceHeader {
    /// Whether every field is zero (an absent resource).
    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }

    pub(crate) fn to_disk(self) -> ReshdrDisk {
        debug_assert!(self.size_in_wim < 1 << 56);
        ReshdrDisk {
            size_and_flags: U64::new(self.size_in_wim | (self.flags.bits() as u64) << 56),
            offset_in_wim: U64::new(self.offset_in_wim),
            uncompressed_size: U64::new(self.uncompressed_size),
        }
    }

    pub(crate) fn from_disk(disk: &ReshdrDisk) -> Self {
        let size_and_flags = disk.size_and_flags.get();
        Self {
            size_in_wim: size_and_flags & ((1 << 56) - 1),
            offset_in_wim: disk.offset_in_wim.get(),
            uncompressed_size: disk.uncompressed_size.get(),
            flags: ResourceFlags::from_bits_truncate((size_and_flags >> 56) as u8),
        }
    }

    /// End of the resource's byte range in the file.
    pub fn end(&self) -> u64 {
        self.offset_in_wim + self.size_in_wim
    }
}

/// The 208-byte WIM file header.
#[allow(missing_docs)]
#[derive(IntoBytes, FromBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct HeaderDisk {
    pub magic: U64,
    pub header_size: U32,
    pub wim_version: U32,
    pub flags: U32,
    pub chunk_size: U32,
    pub guid: [u8; 16],
    pub part_number: U16,
    pub total_parts: U16,
    pub image_count: U32,
    pub blob_table_reshdr: ReshdrDisk,
    pub xml_data_reshdr: ReshdrDisk,
    pub boot_metadata_reshdr: ReshdrDisk,
    pub boot_index: U32,
    pub integrity_table_reshdr: ReshdrDisk,
    pub unused: [u8; 60],
}

static_assertions::const_assert_eq!(std::mem::size_of::<HeaderDisk>(), HEADER_SIZE);

/// An on-disk blob-table entry.
#[allow(missing_docs)]
#[derive(IntoBytes, FromBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct BlobTableEntryDisk {
    pub reshdr: ReshdrDisk,
    pub part_number: U16,
    pub refcount: U32,
    pub hash: [u8; 20],
}

static_assertions::const_assert_eq!(
    std::mem::size_of::<BlobTableEntryDisk>(),
    BLOB_TABLE_ENTRY_SIZE
);

/// The blob header preceding each blob in a pipable WIM.
#[allow(missing_docs)]
#[derive(IntoBytes, FromBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct PipableBlobHeaderDisk {
    pub magic: U64,
    pub uncompressed_size: U64,
    pub hash: [u8; 20],
    pub flags: U32,
    pub reserved: U32,
}

static_assertions::const_assert_eq!(std::mem::size_of::<PipableBlobHeaderDisk>(), 44);

/// The header preceding a solid resource's chunk offset table.
#[derive(IntoBytes, FromBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct SolidHeaderDisk {
    /// Uncompressed size of the whole solid stream.
    pub res_usize: U64,
    /// Uncompressed chunk size of this resource.
    pub chunk_size: U32,
    /// Compression format code of this resource.
    pub compression_format: U32,
}

static_assertions::const_assert_eq!(std::mem::size_of::<SolidHeaderDisk>(), 16);

/// The WIM header in memory.
#[allow(missing_docs)]
#[derive(Clone, Debug)]
pub struct WimHeader {
    /// True when the file uses the pipable layout (`WLPWM` magic).
    pub pipable: bool,
    pub wim_version: u32,
    pub flags: HeaderFlags,
    pub chunk_size: u32,
    pub guid: [u8; 16],
    pub part_number: u16,
    pub total_parts: u16,
    pub image_count: u32,
    pub blob_table_reshdr: ResourceHeader,
    pub xml_data_reshdr: ResourceHeader,
    pub boot_metadata_reshdr: ResourceHeader,
    pub boot_index: u32,
    pub integrity_table_reshdr: ResourceHeader,
}

impl WimHeader {
    /// A fresh header for a new archive using `ctype` compression.
    pub fn new(ctype: CompressionType) -> Self {
        let mut flags = HeaderFlags::empty();
        let mut wim_version = WIM_VERSION_DEFAULT;
        match ctype {
            CompressionType::None => {}
            CompressionType::Xpress => {
                flags |= HeaderFlags::COMPRESSION | HeaderFlags::COMPRESS_XPRESS;
            }
            CompressionType::Lzx => {
                flags |= HeaderFlags::COMPRESSION | HeaderFlags::COMPRESS_LZX;
            }
            CompressionType::Lzms => {
                flags |= HeaderFlags::COMPRESSION | HeaderFlags::COMPRESS_LZMS;
                wim_version = WIM_VERSION_SOLID;
            }
        }
        Self {
            pipable: false,
            wim_version,
            flags,
            chunk_size: if ctype == CompressionType::None {
                0
            } else {
                WIM_CHUNK_SIZE
            },
            guid: *uuid::Uuid::new_v4().as_bytes(),
            part_number: 1,
            total_parts: 1,
            image_count: 0,
            blob_table_reshdr: ResourceHeader::default(),
            xml_data_reshdr: ResourceHeader::default(),
            boot_metadata_reshdr: ResourceHeader::default(),
            boot_index: 0,
            integrity_table_reshdr: ResourceHeader::default(),
        }
    }

    /// The compression format selected by the header flags.
    pub fn compression_type(&self) -> Result<CompressionType> {
        if !self.flags.contains(HeaderFlags::COMPRESSION) {
            return Ok(CompressionType::None);
        }
        let compress_bits = self.flags
            & (HeaderFlags::COMPRESS_XPRESS
                | HeaderFlags::COMPRESS_LZX
                | HeaderFlags::COMPRESS_LZMS
                | HeaderFlags::COMPRESS_RESERVED);
        if compress_bits == HeaderFlags::COMPRESS_XPRESS {
            Ok(CompressionType::Xpress)
        } else if compress_bits == HeaderFlags::COMPRESS_LZX {
            Ok(CompressionType::Lzx)
        } else if compress_bits == HeaderFlags::COMPRESS_LZMS {
            Ok(CompressionType::Lzms)
        } else {
            Err(WimError::InvalidCompressionType(compress_bits.bits()))
        }
    }

    /// Parses and validates a 208-byte header.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let (disk, _) = HeaderDisk::ref_from_prefix(bytes)
            .map_err(|_| WimError::InvalidHeader("header is truncated".into()))?;

        let pipable = match disk.magic.get() {
            WIM_MAGIC => false,
            PWM_MAGIC => true,
            _ => return Err(WimError::InvalidHeader("bad magic".into())),
        };
        if disk.header_size.get() != HEADER_SIZE as u32 {
            return Err(WimError::InvalidHeader(format!(
                "bad header size {}",
                disk.header_size.get()
            )));
        }
        let wim_version = disk.wim_version.get();
        if wim_version != WIM_VERSION_DEFAULT && wim_version != WIM_VERSION_SOLID {
            return Err(WimError::InvalidHeader(format!(
                "unsupported version 0x{wim_version:x}"
            )));
        }

        let flags = HeaderFlags::from_bits_truncate(disk.flags.get());
        let chunk_size = disk.chunk_size.get();
        if flags.contains(HeaderFlags::COMPRESSION)
            && wim_version == WIM_VERSION_DEFAULT
            && chunk_size != WIM_CHUNK_SIZE
        {
            return Err(WimError::InvalidChunkSize(chunk_size));
        }

        let hdr = Self {
            pipable,
            wim_version,
            flags,
            chunk_size,
            guid: disk.guid,
            part_number: disk.part_number.get(),
            total_parts: disk.total_parts.get(),
            image_count: disk.image_count.get(),
            blob_table_reshdr: ResourceHeader::from_disk(&disk.blob_table_reshdr),
            xml_data_reshdr: ResourceHeader::from_disk(&disk.xml_data_reshdr),
            boot_metadata_reshdr: ResourceHeader::from_disk(&disk.boot_metadata_reshdr),
            boot_index: disk.boot_index.get(),
            integrity_table_reshdr: ResourceHeader::from_disk(&disk.integrity_table_reshdr),
        };
        // The compression flag combination must be coherent.
        hdr.compression_type()?;

        if hdr.part_number == 0 || hdr.part_number > hdr.total_parts {
            return Err(WimError::InvalidHeader(format!(
                "part {}/{} is out of range",
                hdr.part_number, hdr.total_parts
            )));
        }
        if hdr.boot_index > hdr.image_count {
            return Err(WimError::InvalidHeader(format!(
                "boot index {} exceeds image count {}",
                hdr.boot_index, hdr.image_count
            )));
        }
        Ok(hdr)
    }

    /// Serializes to the on-disk form.
    pub fn to_disk(&self) -> HeaderDisk {
        HeaderDisk {
            magic: U64::new(if self.pipable { PWM_MAGIC } else { WIM_MAGIC }),
            header_size: U32::new(HEADER_SIZE as u32),
            wim_version: U32::new(self.wim_version),
            flags: U32::new(self.flags.bits()),
            chunk_size: U32::new(self.chunk_size),
            guid: self.guid,
            part_number: U16::new(self.part_number),
            total_parts: U16::new(self.total_parts),
            image_count: U32::new(self.image_count),
            blob_table_reshdr: self.blob_table_reshdr.to_disk(),
            xml_data_reshdr: self.xml_data_reshdr.to_disk(),
            boot_metadata_reshdr: self.boot_metadata_reshdr.to_disk(),
            boot_index: U32::new(self.boot_index),
            integrity_table_reshdr: self.integrity_table_reshdr.to_disk(),
            unused: [0; 60],
        }
    }
}

/// An in-memory blob-table entry as stored on disk.
#[allow(missing_docs)]
#[derive(Copy, Clone, Debug)]
pub struct BlobTableEntry {
    pub reshdr: ResourceHeader,
    pub part_number: u16,
    pub refcount: u32,
    pub hash: Sha1Hash,
}

impl BlobTableEntry {
    pub(crate) fn to_disk(&self) -> BlobTableEntryDisk {
        BlobTableEntryDisk {
            reshdr: self.reshdr.to_disk(),
            part_number: U16::new(self.part_number),
            refcount: U32::new(self.refcount),
            hash: self.hash,
        }
    }

    pub(crate) fn from_disk(disk: &BlobTableEntryDisk) -> Self {
        Self {
            reshdr: ResourceHeader::from_disk(&disk.reshdr),
            part_number: disk.part_number.get(),
            refcount: disk.refcount.get(),
            hash: disk.hash,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zerocopy::IntoBytes;

    #[test]
    fn reshdr_packs_size_and_flags() {
        let hdr = ResourceHeader {
            size_in_wim: 0x1234_5678_9abc,
            offset_in_wim: 0xdead_beef,
            uncompressed_size: 0x10_0000,
            flags: ResourceFlags::COMPRESSED | ResourceFlags::METADATA,
        };
        let disk = hdr.to_disk();
        assert_eq!(disk.size_and_flags.get() >> 56, 0x06);
        assert_eq!(ResourceHeader::from_disk(&disk), hdr);
    }

    #[test]
    fn header_roundtrips() {
        let mut hdr = WimHeader::new(wimcodec::CompressionType::Xpress);
        hdr.image_count = 3;
        hdr.boot_index = 2;
        hdr.blob_table_reshdr = ResourceHeader {
            size_in_wim: 500,
            offset_in_wim: 4000,
            uncompressed_size: 500,
            flags: ResourceFlags::METADATA,
        };
        let disk = hdr.to_disk();
        let parsed = WimHeader::parse(disk.as_bytes()).unwrap();
        assert!(!parsed.pipable);
        assert_eq!(parsed.flags, hdr.flags);
        assert_eq!(parsed.chunk_size, WIM_CHUNK_SIZE);
        assert_eq!(parsed.image_count, 3);
        assert_eq!(parsed.boot_index, 2);
        assert_eq!(parsed.blob_table_reshdr, hdr.blob_table_reshdr);
        assert_eq!(
            parsed.compression_type().unwrap(),
            wimcodec::CompressionType::Xpress
        );
    }

    #[test]
    fn bad_magic_rejected() {
        let mut bytes = vec![0u8; HEADER_SIZE];
        bytes[..8].copy_from_slice(b"NOTAWIM\0");
        assert!(matches!(
            WimHeader::parse(&bytes),
            Err(WimError::InvalidHeader(_))
        ));
    }

    #[test]
    fn wrong_chunk_size_rejected() {
        let mut hdr = WimHeader::new(wimcodec::CompressionType::Lzx);
        hdr.chunk_size = 4096;
        let disk = hdr.to_disk();
        assert!(matches!(
            WimHeader::parse(disk.as_bytes()),
            Err(WimError::InvalidChunkSize(4096))
        ));
    }
}
