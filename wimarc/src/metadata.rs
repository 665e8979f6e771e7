//! Image metadata: the security-descriptor table and the directory-entry
//! tree, serialized together as one metadata blob per image.
//!
//! On disk the metadata blob is the security data (length-prefixed
//! descriptor table, 8-byte aligned) followed by the root directory entry.
//! Each directory entry is an 8-byte-aligned variable-length record whose
//! `subdir_offset` locates the entry's child list elsewhere in the blob; a
//! child list is a run of entries terminated by an 8-byte zero length.
//! Named-stream records follow their owning entry. Records embed
//! variable-length UTF-16LE names; parsing copies them into owned records
//! rather than aliasing the mapped bytes.
//!
//! Hard links are multiple entries sharing a nonzero hard-link group id;
//! in memory they share one inode in the image's inode arena.

use std::collections::HashMap;

use tracing::trace;
use zerocopy::little_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::blob::{BlobTable, StreamRef};
use crate::encoding::{names_equal, str_to_utf16, utf16_from_le_bytes, utf16_to_le_bytes, utf16_to_string};
use crate::error::{Result, WimError};
use crate::sha1::{Sha1Hash, ZERO_HASH};

/// `FILE_ATTRIBUTE_DIRECTORY`.
pub const ATTRIBUTE_DIRECTORY: u32 = 0x10;
/// `FILE_ATTRIBUTE_NORMAL`.
pub const ATTRIBUTE_NORMAL: u32 = 0x80;
/// `FILE_ATTRIBUTE_REPARSE_POINT`.
pub const ATTRIBUTE_REPARSE_POINT: u32 = 0x400;

/// On-disk security-data header.
#[derive(IntoBytes, FromBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct SecurityHeaderDisk {
    total_length: U32,
    num_entries: U32,
}

/// Fixed-size prefix of an on-disk directory entry.
#[derive(IntoBytes, FromBytes, KnownLayout, Immutable, Unaligned, Clone)]
#[repr(C)]
struct DentryDisk {
    length: U64,
    attributes: U32,
    security_id: U32,
    subdir_offset: U64,
    unused_1: U64,
    unused_2: U64,
    creation_time: U64,
    last_access_time: U64,
    last_write_time: U64,
    default_stream_hash: [u8; 20],
    /// Reparse points: `rp_unknown_1 u32, reparse_tag u32, rp_unknown_2
    /// u16, not_rpfixed u16`. Otherwise: `rp_unknown_1 u32,
    /// hard_link_group_id u64`.
    tagged: [u8; 12],
    num_named_streams: U16,
    short_name_nbytes: U16,
    name_nbytes: U16,
}

const DENTRY_DISK_SIZE: usize = 102;
static_assertions::const_assert_eq!(std::mem::size_of::<DentryDisk>(), DENTRY_DISK_SIZE);

/// Fixed-size prefix of an on-disk named-stream record.
#[derive(IntoBytes, FromBytes, KnownLayout, Immutable, Unaligned, Clone)]
#[repr(C)]
struct StreamEntryDisk {
    length: U64,
    reserved: U64,
    hash: [u8; 20],
    name_nbytes: U16,
}

const STREAM_ENTRY_DISK_SIZE: usize = 38;
static_assertions::const_assert_eq!(std::mem::size_of::<StreamEntryDisk>(), STREAM_ENTRY_DISK_SIZE);

fn align8(n: usize) -> usize {
    (n + 7) & !7
}

fn pad8(buf: &mut Vec<u8>) {
    buf.resize(align8(buf.len()), 0);
}

/// The per-image table of security descriptors.
#[derive(Clone, Debug, Default)]
pub struct SecurityData {
    /// Raw self-relative security descriptors, indexed by security id.
    pub descriptors: Vec<Vec<u8>>,
}

impl SecurityData {
    /// Parses the table; returns it and the 8-aligned byte length consumed.
    fn parse(bytes: &[u8]) -> Result<(Self, usize)> {
        let (hdr, _) = SecurityHeaderDisk::ref_from_prefix(bytes)
            .map_err(|_| WimError::InvalidMetadata("security data truncated".into()))?;
        let total_length = hdr.total_length.get() as usize;
        let num_entries = hdr.num_entries.get() as usize;
        if total_length < 8 || total_length > bytes.len() {
            return Err(WimError::InvalidMetadata(
                "security data length out of range".into(),
            ));
        }

        let sizes_end = 8 + num_entries * 8;
        if sizes_end > total_length {
            return Err(WimError::InvalidMetadata(
                "security descriptor sizes exceed table".into(),
            ));
        }
        let mut descriptors = Vec::with_capacity(num_entries);
        let mut data_off = sizes_end;
        for i in 0..num_entries {
            let size_bytes = &bytes[8 + i * 8..8 + i * 8 + 8];
            let size = u64::from_le_bytes(size_bytes.try_into().expect("8-byte slice")) as usize;
            if data_off + size > total_length {
                return Err(WimError::InvalidMetadata(
                    "security descriptor overruns table".into(),
                ));
            }
            descriptors.push(bytes[data_off..data_off + size].to_vec());
            data_off += size;
        }

        Ok((Self { descriptors }, align8(total_length)))
    }

    fn serialize(&self, buf: &mut Vec<u8>) {
        let total_length =
            8 + self.descriptors.len() * 8 + self.descriptors.iter().map(Vec::len).sum::<usize>();
        let hdr = SecurityHeaderDisk {
            total_length: U32::new(total_length as u32),
            num_entries: U32::new(self.descriptors.len() as u32),
        };
        buf.extend_from_slice(hdr.as_bytes());
        for d in &self.descriptors {
            buf.extend_from_slice(&(d.len() as u64).to_le_bytes());
        }
        for d in &self.descriptors {
            buf.extend_from_slice(d);
        }
        pad8(buf);
    }
}

/// One data stream of an inode. The unnamed (default) stream has an empty
/// name.
#[derive(Clone, Debug)]
pub struct InodeStream {
    /// Stream name in UTF-16 (empty for the default stream).
    pub name: Vec<u16>,
    /// The stream's contents.
    pub sref: StreamRef,
}

/// File state shared by all hard links to one file.
#[allow(missing_docs)]
#[derive(Clone, Debug)]
pub struct Inode {
    pub attributes: u32,
    /// Index into [`SecurityData::descriptors`], or -1 for none.
    pub security_id: i32,
    pub creation_time: u64,
    pub last_access_time: u64,
    pub last_write_time: u64,
    /// Reparse tag, meaningful only with [`ATTRIBUTE_REPARSE_POINT`].
    pub reparse_tag: u32,
    /// Set when reparse-point fixups were *not* applied to this entry.
    pub not_rpfixed: u16,
    /// Nonzero groups hard links; 0 means a singleton file.
    pub hard_link_group_id: u64,
    /// All data streams; at most one with an empty name.
    pub streams: Vec<InodeStream>,
}

impl Default for Inode {
    fn default() -> Self {
        Self {
            attributes: ATTRIBUTE_NORMAL,
            security_id: -1,
            creation_time: 0,
            last_access_time: 0,
            last_write_time: 0,
            reparse_tag: 0,
            not_rpfixed: 0,
            hard_link_group_id: 0,
            streams: Vec::new(),
        }
    }
}

impl Inode {
    /// The default (unnamed) stream, if present.
    pub fn unnamed_stream(&self) -> Option<&InodeStream> {
        self.streams.iter().find(|s| s.name.is_empty())
    }

    fn is_directory(&self) -> bool {
        self.attributes & ATTRIBUTE_DIRECTORY != 0
    }
}

/// A directory entry: a name bound to an inode, plus child entries when the
/// inode is a directory.
#[derive(Clone, Debug)]
pub struct Dentry {
    /// UTF-16 file name (empty only for the root).
    pub name: Vec<u16>,
    /// DOS 8.3 short name, if any.
    pub short_name: Vec<u16>,
    /// Index into the image's inode arena.
    pub inode: usize,
    /// Child entries (directories only).
    pub children: Vec<Dentry>,
}

impl Dentry {
    /// Finds a child by name, case-insensitively.
    pub fn child(&self, name: &[u16]) -> Option<&Dentry> {
        self.children.iter().find(|c| names_equal(&c.name, name))
    }
}

/// One image's in-memory metadata.
#[derive(Clone, Debug)]
pub struct ImageMetadata {
    /// The image's security-descriptor table.
    pub security: SecurityData,
    /// Inode arena; dentries refer into it by index.
    pub inodes: Vec<Inode>,
    /// The root directory entry.
    pub root: Dentry,
}

impl ImageMetadata {
    /// An empty image: a root directory and nothing else.
    pub fn new_empty() -> Self {
        let root_inode = Inode {
            attributes: ATTRIBUTE_DIRECTORY,
            ..Inode::default()
        };
        Self {
            security: SecurityData::default(),
            inodes: vec![root_inode],
            root: Dentry {
                name: Vec::new(),
                short_name: Vec::new(),
                inode: 0,
                children: Vec::new(),
            },
        }
    }

    /// Looks up an entry by `/`-separated image-relative path.
    pub fn lookup_path(&self, path: &str) -> Option<&Dentry> {
        let mut cur = &self.root;
        for component in path.split('/').filter(|c| !c.is_empty()) {
            cur = cur.child(&str_to_utf16(component))?;
        }
        Some(cur)
    }

    /// Visits every entry below the root with its image-relative path.
    pub fn for_each_entry<'a>(&'a self, mut f: impl FnMut(&str, &'a Dentry, &'a Inode)) {
        fn walk<'a>(
            md: &'a ImageMetadata,
            dentry: &'a Dentry,
            path: &mut String,
            f: &mut impl FnMut(&str, &'a Dentry, &'a Inode),
        ) {
            for child in &dentry.children {
                let saved = path.len();
                path.push('/');
                path.push_str(&utf16_to_string(&child.name));
                f(path, child, &md.inodes[child.inode]);
                walk(md, child, path, f);
                path.truncate(saved);
            }
        }
        let mut path = String::new();
        walk(self, &self.root, &mut path, &mut f);
    }

    /// Every stream reference in the image (one per stream per dentry, so
    /// hard links count once per link for refcounting purposes).
    pub(crate) fn all_stream_refs(&self) -> Vec<StreamRef> {
        let mut refs = Vec::new();
        fn walk(md: &ImageMetadata, dentry: &Dentry, refs: &mut Vec<StreamRef>) {
            for s in &md.inodes[dentry.inode].streams {
                refs.push(s.sref.clone());
            }
            for child in &dentry.children {
                walk(md, child, refs);
            }
        }
        walk(self, &self.root, &mut refs);
        refs
    }

    /// Sum of the uncompressed sizes of all referenced streams.
    pub(crate) fn total_stream_bytes(&self, table: &BlobTable) -> u64 {
        self.all_stream_refs()
            .iter()
            .filter_map(|sref| {
                table
                    .resolve(sref)
                    .and_then(|h| table.lookup(&h))
                    .map(|d| d.size)
            })
            .sum()
    }

    // -- parsing ---------------------------------------------------------

    /// Parses a metadata blob.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let (security, root_pos) = SecurityData::parse(bytes)?;

        let mut this = Self {
            security,
            inodes: Vec::new(),
            root: Dentry {
                name: Vec::new(),
                short_name: Vec::new(),
                inode: 0,
                children: Vec::new(),
            },
        };
        let mut hard_links: HashMap<u64, usize> = HashMap::new();

        let (mut root, _) = this.parse_dentry(bytes, root_pos, &mut hard_links)?;
        let root_inode = &this.inodes[root.inode];
        if !root_inode.is_directory() {
            return Err(WimError::InvalidMetadata("root is not a directory".into()));
        }
        let subdir = parse_fixed(bytes, root_pos)?.subdir_offset.get();
        if subdir != 0 {
            root.children = this.parse_child_list(bytes, subdir, &mut hard_links, 1)?;
        }
        this.root = root;
        Ok(this)
    }

    fn parse_child_list(
        &mut self,
        bytes: &[u8],
        offset: u64,
        hard_links: &mut HashMap<u64, usize>,
        depth: u32,
    ) -> Result<Vec<Dentry>> {
        // A self-referential subdir offset would otherwise recurse forever.
        if depth > 255 {
            return Err(WimError::InvalidMetadata("directory tree too deep".into()));
        }
        let mut children = Vec::new();
        let mut pos = align8(offset as usize);
        loop {
            if pos + 8 > bytes.len() {
                return Err(WimError::InvalidMetadata("child list truncated".into()));
            }
            let length =
                u64::from_le_bytes(bytes[pos..pos + 8].try_into().expect("8-byte slice"));
            if length == 0 {
                break;
            }
            let (mut dentry, end) = self.parse_dentry(bytes, pos, hard_links)?;
            let disk = parse_fixed(bytes, pos)?;
            let subdir = disk.subdir_offset.get();
            if self.inodes[dentry.inode].is_directory() && subdir != 0 {
                if subdir as usize <= pos {
                    return Err(WimError::InvalidMetadata(
                        "subdirectory offset does not advance".into(),
                    ));
                }
                dentry.children = self.parse_child_list(bytes, subdir, hard_links, depth + 1)?;
            }
            children.push(dentry);
            pos = end;
        }
        Ok(children)
    }

    /// Parses the dentry record at `pos` plus its named-stream records.
    /// Returns the dentry and the 8-aligned offset just past it.
    fn parse_dentry(
        &mut self,
        bytes: &[u8],
        pos: usize,
        hard_links: &mut HashMap<u64, usize>,
    ) -> Result<(Dentry, usize)> {
        let disk = parse_fixed(bytes, pos)?;
        let length = disk.length.get() as usize;
        if length < DENTRY_DISK_SIZE || pos + length > bytes.len() {
            return Err(WimError::InvalidMetadata("dentry length invalid".into()));
        }

        let name_nbytes = disk.name_nbytes.get() as usize;
        let short_name_nbytes = disk.short_name_nbytes.get() as usize;
        let names_end = DENTRY_DISK_SIZE
            + name_nbytes
            + if name_nbytes > 0 { 2 } else { 0 }
            + short_name_nbytes
            + if short_name_nbytes > 0 { 2 } else { 0 };
        if names_end > length {
            return Err(WimError::InvalidMetadata("dentry names overrun record".into()));
        }
        let name_off = pos + DENTRY_DISK_SIZE;
        let name = utf16_from_le_bytes(&bytes[name_off..name_off + name_nbytes]);
        let short_off = name_off + name_nbytes + if name_nbytes > 0 { 2 } else { 0 };
        let short_name = utf16_from_le_bytes(&bytes[short_off..short_off + short_name_nbytes]);

        let attributes = disk.attributes.get();
        let is_reparse = attributes & ATTRIBUTE_REPARSE_POINT != 0;
        let (reparse_tag, not_rpfixed, hard_link_group_id) = if is_reparse {
            let tag = u32::from_le_bytes(disk.tagged[4..8].try_into().expect("4-byte slice"));
            let not_rpfixed =
                u16::from_le_bytes(disk.tagged[10..12].try_into().expect("2-byte slice"));
            (tag, not_rpfixed, 0)
        } else {
            let id = u64::from_le_bytes(disk.tagged[4..12].try_into().expect("8-byte slice"));
            (0, 0, id)
        };

        // Named-stream records follow the (aligned) dentry record.
        let num_named_streams = disk.num_named_streams.get() as usize;
        let mut stream_pos = align8(pos + length);
        let mut named_streams = Vec::with_capacity(num_named_streams);
        for _ in 0..num_named_streams {
            let (entry, _) = StreamEntryDisk::ref_from_prefix(
                bytes.get(stream_pos..).ok_or_else(err_truncated)?,
            )
            .map_err(|_| err_truncated())?;
            let entry_len = entry.length.get() as usize;
            let sname_nbytes = entry.name_nbytes.get() as usize;
            if entry_len < STREAM_ENTRY_DISK_SIZE + sname_nbytes
                || stream_pos + entry_len > bytes.len()
            {
                return Err(WimError::InvalidMetadata("stream entry invalid".into()));
            }
            let sname_off = stream_pos + STREAM_ENTRY_DISK_SIZE;
            let sname = utf16_from_le_bytes(&bytes[sname_off..sname_off + sname_nbytes]);
            named_streams.push(InodeStream {
                name: sname,
                sref: stream_ref_from_hash(entry.hash),
            });
            stream_pos = align8(stream_pos + entry_len);
        }

        // Hard links: reuse the inode of an earlier entry with the same
        // nonzero group id.
        let inode_index = match hard_link_group_id {
            0 => None,
            id => hard_links.get(&id).copied(),
        };
        let inode_index = match inode_index {
            Some(idx) => {
                trace!(group = hard_link_group_id, "hard link joins existing inode");
                idx
            }
            None => {
                let mut streams = Vec::new();
                let default_ref = stream_ref_from_hash(disk.default_stream_hash);
                if default_ref != StreamRef::Zero {
                    streams.push(InodeStream {
                        name: Vec::new(),
                        sref: default_ref,
                    });
                }
                streams.extend(named_streams);
                let inode = Inode {
                    attributes,
                    security_id: disk.security_id.get() as i32,
                    creation_time: disk.creation_time.get(),
                    last_access_time: disk.last_access_time.get(),
                    last_write_time: disk.last_write_time.get(),
                    reparse_tag,
                    not_rpfixed,
                    hard_link_group_id,
                    streams,
                };
                let idx = self.inodes.len();
                self.inodes.push(inode);
                if hard_link_group_id != 0 {
                    hard_links.insert(hard_link_group_id, idx);
                }
                idx
            }
        };

        Ok((
            Dentry {
                name,
                short_name,
                inode: inode_index,
                children: Vec::new(),
            },
            stream_pos,
        ))
    }

    // -- serialization ---------------------------------------------------

    /// Serializes the image to its metadata-blob form. `resolve` maps each
    /// stream reference to its final hash; unresolved references serialize
    /// as the zero hash.
    pub fn serialize(&self, resolve: &dyn Fn(&StreamRef) -> Sha1Hash) -> Vec<u8> {
        let mut buf = Vec::new();
        self.security.serialize(&mut buf);

        // Root record, then breadth-first child lists. Each directory's
        // subdir_offset is patched once the position of its child list is
        // known.
        let root_pos = self.emit_dentry(&mut buf, &self.root, resolve);
        let mut queue: VecDequeDir<'_> = std::collections::VecDeque::new();
        queue.push_back((&self.root, root_pos));

        while let Some((dir, dentry_pos)) = queue.pop_front() {
            pad8(&mut buf);
            let children_pos = buf.len() as u64;
            buf[dentry_pos + 16..dentry_pos + 24].copy_from_slice(&children_pos.to_le_bytes());
            for child in &dir.children {
                let child_pos = self.emit_dentry(&mut buf, child, resolve);
                if self.inodes[child.inode].is_directory() {
                    queue.push_back((child, child_pos));
                }
            }
            buf.extend_from_slice(&0u64.to_le_bytes());
        }
        buf
    }

    /// Appends one dentry record (plus named streams); returns its offset.
    fn emit_dentry(
        &self,
        buf: &mut Vec<u8>,
        dentry: &Dentry,
        resolve: &dyn Fn(&StreamRef) -> Sha1Hash,
    ) -> usize {
        pad8(buf);
        let pos = buf.len();
        let inode = &self.inodes[dentry.inode];

        let name_nbytes = dentry.name.len() * 2;
        let short_name_nbytes = dentry.short_name.len() * 2;
        let length = DENTRY_DISK_SIZE
            + name_nbytes
            + if name_nbytes > 0 { 2 } else { 0 }
            + short_name_nbytes
            + if short_name_nbytes > 0 { 2 } else { 0 };

        let default_hash = inode
            .unnamed_stream()
            .map(|s| resolve(&s.sref))
            .unwrap_or(ZERO_HASH);

        let mut tagged = [0u8; 12];
        if inode.attributes & ATTRIBUTE_REPARSE_POINT != 0 {
            tagged[4..8].copy_from_slice(&inode.reparse_tag.to_le_bytes());
            tagged[10..12].copy_from_slice(&inode.not_rpfixed.to_le_bytes());
        } else {
            tagged[4..12].copy_from_slice(&inode.hard_link_group_id.to_le_bytes());
        }

        let named: Vec<&InodeStream> =
            inode.streams.iter().filter(|s| !s.name.is_empty()).collect();

        let disk = DentryDisk {
            length: U64::new(length as u64),
            attributes: U32::new(inode.attributes),
            security_id: U32::new(inode.security_id as u32),
            subdir_offset: U64::new(0),
            unused_1: U64::new(0),
            unused_2: U64::new(0),
            creation_time: U64::new(inode.creation_time),
            last_access_time: U64::new(inode.last_access_time),
            last_write_time: U64::new(inode.last_write_time),
            default_stream_hash: default_hash,
            tagged,
            num_named_streams: U16::new(named.len() as u16),
            short_name_nbytes: U16::new(short_name_nbytes as u16),
            name_nbytes: U16::new(name_nbytes as u16),
        };
        buf.extend_from_slice(disk.as_bytes());
        if name_nbytes > 0 {
            buf.extend_from_slice(&utf16_to_le_bytes(&dentry.name));
            buf.extend_from_slice(&[0, 0]);
        }
        if short_name_nbytes > 0 {
            buf.extend_from_slice(&utf16_to_le_bytes(&dentry.short_name));
            buf.extend_from_slice(&[0, 0]);
        }

        for stream in named {
            pad8(buf);
            let sname_nbytes = stream.name.len() * 2;
            let entry = StreamEntryDisk {
                length: U64::new((STREAM_ENTRY_DISK_SIZE + sname_nbytes + 2) as u64),
                reserved: U64::new(0),
                hash: resolve(&stream.sref),
                name_nbytes: U16::new(sname_nbytes as u16),
            };
            buf.extend_from_slice(entry.as_bytes());
            buf.extend_from_slice(&utf16_to_le_bytes(&stream.name));
            buf.extend_from_slice(&[0, 0]);
        }
        pos
    }
}

type VecDequeDir<'a> = std::collections::VecDeque<(&'a Dentry, usize)>;

fn err_truncated() -> WimError {
    WimError::InvalidMetadata("metadata blob truncated".into())
}

fn parse_fixed(bytes: &[u8], pos: usize) -> Result<&DentryDisk> {
    let (disk, _) = DentryDisk::ref_from_prefix(bytes.get(pos..).ok_or_else(err_truncated)?)
        .map_err(|_| err_truncated())?;
    Ok(disk)
}

fn stream_ref_from_hash(hash: Sha1Hash) -> StreamRef {
    if hash == ZERO_HASH {
        StreamRef::Zero
    } else {
        StreamRef::Hashed(hash)
    }
}

// ---------------------------------------------------------------------------
// Image construction from scanner output
// ---------------------------------------------------------------------------

/// One entry produced by an external filesystem scanner.
///
/// Paths are image-relative, `/`-separated. Parent directories are created
/// implicitly. Entries with the same nonzero `hard_link_group` share one
/// inode; the first entry of a group supplies the contents and attributes.
#[derive(Clone, Debug)]
pub struct SourceEntry {
    /// Image-relative path, e.g. `sub/b.txt`.
    pub path: String,
    /// Whether this is a directory.
    pub is_dir: bool,
    /// File contents (ignored for directories).
    pub contents: Vec<u8>,
    /// Named (alternate) data streams.
    pub named_streams: Vec<(String, Vec<u8>)>,
    /// File attribute flags; 0 picks a sensible default.
    pub attributes: u32,
    /// Windows FILETIME timestamps.
    pub creation_time: u64,
    /// See `creation_time`.
    pub last_access_time: u64,
    /// See `creation_time`.
    pub last_write_time: u64,
    /// Hard-link group; 0 means not hard-linked.
    pub hard_link_group: u64,
}

impl SourceEntry {
    /// A regular file with the given contents.
    pub fn file(path: &str, contents: &[u8]) -> Self {
        Self {
            path: path.to_owned(),
            is_dir: false,
            contents: contents.to_vec(),
            named_streams: Vec::new(),
            attributes: 0,
            creation_time: 0,
            last_access_time: 0,
            last_write_time: 0,
            hard_link_group: 0,
        }
    }

    /// A directory.
    pub fn dir(path: &str) -> Self {
        Self {
            is_dir: true,
            ..Self::file(path, &[])
        }
    }

    fn sort_hint(&self) -> Option<(String, String)> {
        let basename = self.path.rsplit('/').next().unwrap_or(&self.path);
        let extension = basename.rsplit_once('.').map(|(_, e)| e).unwrap_or("");
        Some((extension.to_ascii_lowercase(), basename.to_ascii_lowercase()))
    }
}

impl ImageMetadata {
    /// Builds an image tree from scanner entries, staging file contents as
    /// (unhashed) blobs in `table`.
    pub(crate) fn build(entries: &[SourceEntry], table: &mut BlobTable) -> Result<Self> {
        let mut this = Self::new_empty();
        let mut hard_links: HashMap<u64, usize> = HashMap::new();

        for entry in entries {
            let components: Vec<&str> =
                entry.path.split('/').filter(|c| !c.is_empty()).collect();
            let Some((&leaf_name, parents)) = components.split_last() else {
                continue;
            };

            // Walk (and create) the parent chain.
            let mut cur = &mut this.root;
            for &component in parents {
                let name = str_to_utf16(component);
                let idx = match cur.children.iter().position(|c| names_equal(&c.name, &name)) {
                    Some(i) => i,
                    None => {
                        let inode = Inode {
                            attributes: ATTRIBUTE_DIRECTORY,
                            ..Inode::default()
                        };
                        this.inodes.push(inode);
                        cur.children.push(Dentry {
                            name,
                            short_name: Vec::new(),
                            inode: this.inodes.len() - 1,
                            children: Vec::new(),
                        });
                        cur.children.len() - 1
                    }
                };
                cur = &mut cur.children[idx];
            }

            let leaf = str_to_utf16(leaf_name);
            if cur.child(&leaf).is_some() {
                // The scanner listed the same path twice; directories are
                // merged, anything else is a caller error we ignore.
                continue;
            }

            let inode_index = if entry.hard_link_group != 0 {
                if let Some(&idx) = hard_links.get(&entry.hard_link_group) {
                    // Another link to an existing inode; count the extra
                    // references its streams gain.
                    let srefs: Vec<StreamRef> =
                        this.inodes[idx].streams.iter().map(|s| s.sref.clone()).collect();
                    for sref in &srefs {
                        table.add_stream_ref(sref, 1);
                    }
                    idx
                } else {
                    let idx = new_inode(&mut this.inodes, entry, table);
                    hard_links.insert(entry.hard_link_group, idx);
                    idx
                }
            } else {
                new_inode(&mut this.inodes, entry, table)
            };

            cur.children.push(Dentry {
                name: leaf,
                short_name: Vec::new(),
                inode: inode_index,
                children: Vec::new(),
            });
        }
        Ok(this)
    }

}

fn new_inode(inodes: &mut Vec<Inode>, entry: &SourceEntry, table: &mut BlobTable) -> usize {
    let mut streams = Vec::new();
    if !entry.is_dir {
        let sref = table.add_buffered(entry.contents.clone(), entry.sort_hint());
        streams.push(InodeStream {
            name: Vec::new(),
            sref,
        });
        for (name, data) in &entry.named_streams {
            let sref = table.add_buffered(data.clone(), entry.sort_hint());
            streams.push(InodeStream {
                name: str_to_utf16(name),
                sref,
            });
        }
    }
    let attributes = if entry.attributes != 0 {
        entry.attributes
    } else if entry.is_dir {
        ATTRIBUTE_DIRECTORY
    } else {
        ATTRIBUTE_NORMAL
    };
    inodes.push(Inode {
        attributes,
        security_id: -1,
        creation_time: entry.creation_time,
        last_access_time: entry.last_access_time,
        last_write_time: entry.last_write_time,
        reparse_tag: 0,
        not_rpfixed: 0,
        hard_link_group_id: entry.hard_link_group,
        streams,
    });
    inodes.len() - 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sha1::sha1_buffer;

    fn resolve_via(table: &BlobTable) -> impl Fn(&StreamRef) -> Sha1Hash + '_ {
        |sref| table.resolve(sref).unwrap_or(ZERO_HASH)
    }

    #[test]
    fn build_and_serialize_roundtrip() {
        let mut table = BlobTable::new();
        let entries = vec![
            SourceEntry::file("a.txt", b"hello"),
            SourceEntry::dir("sub"),
            SourceEntry::file("sub/b.txt", b"world!"),
        ];
        let md = ImageMetadata::build(&entries, &mut table).unwrap();
        table.resolve_all_unhashed();

        let bytes = md.serialize(&resolve_via(&table));
        let parsed = ImageMetadata::parse(&bytes).unwrap();

        let a = parsed.lookup_path("a.txt").expect("a.txt exists");
        let a_inode = &parsed.inodes[a.inode];
        assert_eq!(
            a_inode.unnamed_stream().unwrap().sref,
            StreamRef::Hashed(sha1_buffer(b"hello"))
        );

        let b = parsed.lookup_path("sub/b.txt").expect("sub/b.txt exists");
        assert_eq!(
            parsed.inodes[b.inode].unnamed_stream().unwrap().sref,
            StreamRef::Hashed(sha1_buffer(b"world!"))
        );
        assert!(parsed.lookup_path("sub/missing.txt").is_none());
        // Case-insensitive lookup, NTFS-style.
        assert!(parsed.lookup_path("SUB/B.TXT").is_some());
    }

    #[test]
    fn intermediate_dirs_created() {
        let mut table = BlobTable::new();
        let entries = vec![SourceEntry::file("x/y/z.bin", b"zz")];
        let md = ImageMetadata::build(&entries, &mut table).unwrap();
        assert!(md.lookup_path("x/y").is_some());
        assert!(md.lookup_path("x/y/z.bin").is_some());
        let x = md.lookup_path("x").unwrap();
        assert!(md.inodes[x.inode].is_directory());
    }

    #[test]
    fn hard_links_share_inode() {
        let mut table = BlobTable::new();
        let mut e1 = SourceEntry::file("one", b"shared contents");
        e1.hard_link_group = 42;
        let mut e2 = SourceEntry::file("two", b"");
        e2.hard_link_group = 42;
        let md = ImageMetadata::build(&[e1, e2], &mut table).unwrap();
        table.resolve_all_unhashed();

        let one = md.lookup_path("one").unwrap();
        let two = md.lookup_path("two").unwrap();
        assert_eq!(one.inode, two.inode);

        // Two links -> refcount 2 on the shared blob.
        let hash = sha1_buffer(b"shared contents");
        assert_eq!(table.lookup(&hash).unwrap().refcount, 2);

        // Shared identity survives serialization.
        let bytes = md.serialize(&resolve_via(&table));
        let parsed = ImageMetadata::parse(&bytes).unwrap();
        let one = parsed.lookup_path("one").unwrap();
        let two = parsed.lookup_path("two").unwrap();
        assert_eq!(one.inode, two.inode);
    }

    #[test]
    fn named_streams_roundtrip() {
        let mut table = BlobTable::new();
        let mut entry = SourceEntry::file("data.bin", b"main stream");
        entry
            .named_streams
            .push(("Zone.Identifier".into(), b"[ZoneTransfer]".to_vec()));
        let md = ImageMetadata::build(&[entry], &mut table).unwrap();
        table.resolve_all_unhashed();

        let bytes = md.serialize(&resolve_via(&table));
        let parsed = ImageMetadata::parse(&bytes).unwrap();
        let d = parsed.lookup_path("data.bin").unwrap();
        let inode = &parsed.inodes[d.inode];
        assert_eq!(inode.streams.len(), 2);
        let named = inode
            .streams
            .iter()
            .find(|s| !s.name.is_empty())
            .expect("named stream survives");
        assert_eq!(utf16_to_string(&named.name), "Zone.Identifier");
        assert_eq!(
            named.sref,
            StreamRef::Hashed(sha1_buffer(b"[ZoneTransfer]"))
        );
    }

    #[test]
    fn security_data_roundtrip() {
        let mut md = ImageMetadata::new_empty();
        md.security.descriptors.push(vec![1, 2, 3, 4, 5]);
        md.security.descriptors.push(vec![9; 40]);
        let bytes = md.serialize(&|_| ZERO_HASH);
        let parsed = ImageMetadata::parse(&bytes).unwrap();
        assert_eq!(parsed.security.descriptors.len(), 2);
        assert_eq!(parsed.security.descriptors[0], vec![1, 2, 3, 4, 5]);
        assert_eq!(parsed.security.descriptors[1], vec![9; 40]);
    }

    #[test]
    fn empty_image_serializes() {
        let md = ImageMetadata::new_empty();
        let bytes = md.serialize(&|_| ZERO_HASH);
        let parsed = ImageMetadata::parse(&bytes).unwrap();
        assert!(parsed.root.children.is_empty());
    }
}
