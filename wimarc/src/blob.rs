//! The content-addressed blob store.
//!
//! Every distinct byte string (file contents, named streams, serialized
//! image metadata) is a *blob*, keyed by its SHA-1 and stored once no
//! matter how many streams reference it. Blobs staged during image
//! construction may be *unhashed*: their digest is computed only when a
//! potential duplicate appears (another blob of the same size) or when the
//! blob is about to be written.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::trace;

use crate::resource::ResourceDescriptor;
use crate::sha1::{sha1_buffer, Sha1Hash};

/// Identifies a staged blob whose hash has not been computed yet.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct UnhashedId(u64);

/// A reference from a stream to its contents.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamRef {
    /// The empty stream; serialized as the all-zero hash.
    Zero,
    /// A blob identified by hash.
    Hashed(Sha1Hash),
    /// A staged blob not yet hashed.
    Unhashed(UnhashedId),
}

/// Where a blob's bytes live.
#[derive(Clone)]
pub(crate) enum BlobLocation {
    /// Staged in memory.
    Buffered(Arc<Vec<u8>>),
    /// Stored in a WIM resource (of this archive or another open one).
    InWim {
        res: Arc<ResourceDescriptor>,
        /// Offset of the blob within the resource's uncompressed stream;
        /// nonzero only for solid resources.
        offset_in_res: u64,
    },
}

/// A blob known by hash.
pub(crate) struct BlobDescriptor {
    pub hash: Sha1Hash,
    /// Uncompressed size.
    pub size: u64,
    /// References from all image trees, plus one per metadata blob.
    pub refcount: u32,
    pub location: BlobLocation,
    /// Split part the blob lives in; 1 for standalone archives.
    pub part_number: u16,
    /// (extension, basename) of a file referencing this blob, used to
    /// order blobs for solid compression.
    pub sort_hint: Option<(String, String)>,
}

struct UnhashedBlob {
    bytes: Arc<Vec<u8>>,
    refcount: u32,
    sort_hint: Option<(String, String)>,
}

/// The blob table: primary index by hash, secondary index by size for
/// unhashed blobs.
#[derive(Default)]
pub(crate) struct BlobTable {
    by_hash: HashMap<Sha1Hash, BlobDescriptor>,
    unhashed: HashMap<UnhashedId, UnhashedBlob>,
    unhashed_by_size: HashMap<u64, Vec<UnhashedId>>,
    /// Sizes that exist among hashed blobs. Never pruned; a stale entry
    /// only causes an early hash, not an error.
    hashed_sizes: HashSet<u64>,
    /// Hash each resolved unhashed id ended up with.
    resolved: HashMap<UnhashedId, Sha1Hash>,
    next_unhashed_id: u64,
}

impl BlobTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.by_hash.len()
    }

    pub fn lookup(&self, hash: &Sha1Hash) -> Option<&BlobDescriptor> {
        self.by_hash.get(hash)
    }

    pub fn lookup_mut(&mut self, hash: &Sha1Hash) -> Option<&mut BlobDescriptor> {
        self.by_hash.get_mut(hash)
    }

    pub fn iter(&self) -> impl Iterator<Item = &BlobDescriptor> {
        self.by_hash.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut BlobDescriptor> {
        self.by_hash.values_mut()
    }

    /// Inserts a hashed blob, or merges reference counts when the hash is
    /// already present.
    pub fn insert(&mut self, desc: BlobDescriptor) {
        self.hashed_sizes.insert(desc.size);
        match self.by_hash.entry(desc.hash) {
            std::collections::hash_map::Entry::Occupied(mut e) => {
                let existing = e.get_mut();
                existing.refcount += desc.refcount;
                if existing.sort_hint.is_none() {
                    existing.sort_hint = desc.sort_hint;
                }
            }
            std::collections::hash_map::Entry::Vacant(e) => {
                e.insert(desc);
            }
        }
    }

    /// Adds `n` references to a hashed blob.
    pub fn add_ref(&mut self, hash: &Sha1Hash, n: u32) -> bool {
        match self.by_hash.get_mut(hash) {
            Some(desc) => {
                desc.refcount += n;
                true
            }
            None => false,
        }
    }

    /// Drops `n` references; the blob is removed once its count reaches
    /// zero, unless `keep_zero_refs` (soft delete) is set.
    pub fn release_ref(&mut self, hash: &Sha1Hash, n: u32, keep_zero_refs: bool) {
        if let Some(desc) = self.by_hash.get_mut(hash) {
            desc.refcount = desc.refcount.saturating_sub(n);
            if desc.refcount == 0 && !keep_zero_refs {
                trace!(hash = ?&hash[..4], "dropping unreferenced blob");
                self.by_hash.remove(hash);
            }
        }
    }

    /// Stages one reference to in-memory contents, deduplicating against
    /// existing blobs.
    ///
    /// The blob stays unhashed while its size is unique; a size collision
    /// (with either a hashed blob or another unhashed one) forces hashing,
    /// which merges true duplicates.
    pub fn add_buffered(
        &mut self,
        bytes: Vec<u8>,
        sort_hint: Option<(String, String)>,
    ) -> StreamRef {
        if bytes.is_empty() {
            return StreamRef::Zero;
        }
        let size = bytes.len() as u64;
        let size_collides = self.hashed_sizes.contains(&size)
            || self
                .unhashed_by_size
                .get(&size)
                .is_some_and(|v| !v.is_empty());

        if !size_collides {
            let id = UnhashedId(self.next_unhashed_id);
            self.next_unhashed_id += 1;
            self.unhashed.insert(
                id,
                UnhashedBlob {
                    bytes: Arc::new(bytes),
                    refcount: 1,
                    sort_hint,
                },
            );
            self.unhashed_by_size.entry(size).or_default().push(id);
            return StreamRef::Unhashed(id);
        }

        // Hash any unhashed blobs of the same size first so duplicates
        // merge rather than racing each other.
        if let Some(ids) = self.unhashed_by_size.remove(&size) {
            for id in ids {
                self.resolve_unhashed(id);
            }
        }

        let hash = sha1_buffer(&bytes);
        self.insert(BlobDescriptor {
            hash,
            size,
            refcount: 1,
            location: BlobLocation::Buffered(Arc::new(bytes)),
            part_number: 1,
            sort_hint,
        });
        StreamRef::Hashed(hash)
    }

    /// Adds a reference through a [`StreamRef`] of either kind.
    pub fn add_stream_ref(&mut self, sref: &StreamRef, n: u32) {
        match sref {
            StreamRef::Zero => {}
            StreamRef::Hashed(hash) => {
                self.add_ref(hash, n);
            }
            StreamRef::Unhashed(id) => {
                if let Some(u) = self.unhashed.get_mut(id) {
                    u.refcount += n;
                } else if let Some(hash) = self.resolved.get(id).copied() {
                    self.add_ref(&hash, n);
                }
            }
        }
    }

    /// Drops a reference through a [`StreamRef`] of either kind.
    pub fn release_stream_ref(&mut self, sref: &StreamRef, n: u32, keep_zero_refs: bool) {
        match sref {
            StreamRef::Zero => {}
            StreamRef::Hashed(hash) => self.release_ref(hash, n, keep_zero_refs),
            StreamRef::Unhashed(id) => {
                let remove = if let Some(u) = self.unhashed.get_mut(id) {
                    u.refcount = u.refcount.saturating_sub(n);
                    u.refcount == 0
                } else {
                    if let Some(hash) = self.resolved.get(id).copied() {
                        self.release_ref(&hash, n, keep_zero_refs);
                    }
                    false
                };
                if remove {
                    let u = self.unhashed.remove(id);
                    if let Some(u) = u {
                        let size = u.bytes.len() as u64;
                        if let Some(v) = self.unhashed_by_size.get_mut(&size) {
                            v.retain(|x| x != id);
                        }
                    }
                }
            }
        }
    }

    fn resolve_unhashed(&mut self, id: UnhashedId) {
        let Some(u) = self.unhashed.remove(&id) else {
            return;
        };
        let hash = sha1_buffer(&u.bytes);
        trace!(hash = ?&hash[..4], size = u.bytes.len(), "hashed staged blob");
        self.insert(BlobDescriptor {
            hash,
            size: u.bytes.len() as u64,
            refcount: u.refcount,
            location: BlobLocation::Buffered(u.bytes),
            part_number: 1,
            sort_hint: u.sort_hint,
        });
        self.resolved.insert(id, hash);
    }

    /// Hashes every remaining unhashed blob; afterwards every
    /// [`StreamRef`] resolves to a hash.
    pub fn resolve_all_unhashed(&mut self) {
        let ids: Vec<UnhashedId> = self.unhashed.keys().copied().collect();
        for id in ids {
            self.resolve_unhashed(id);
        }
        self.unhashed_by_size.clear();
    }

    /// The hash a [`StreamRef`] resolves to, if known.
    pub fn resolve(&self, sref: &StreamRef) -> Option<Sha1Hash> {
        match sref {
            StreamRef::Zero => Some(crate::sha1::ZERO_HASH),
            StreamRef::Hashed(hash) => Some(*hash),
            StreamRef::Unhashed(id) => self.resolved.get(id).copied(),
        }
    }

    /// Total references held by all blobs (consistency checking).
    pub fn total_refcount(&self) -> u64 {
        self.by_hash.values().map(|d| d.refcount as u64).sum::<u64>()
            + self.unhashed.values().map(|u| u.refcount as u64).sum::<u64>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_size_stays_unhashed() {
        let mut table = BlobTable::new();
        let r = table.add_buffered(b"hello".to_vec(), None);
        assert!(matches!(r, StreamRef::Unhashed(_)));
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn size_collision_forces_hash_and_merges_duplicates() {
        let mut table = BlobTable::new();
        let a = table.add_buffered(b"same".to_vec(), None);
        let b = table.add_buffered(b"same".to_vec(), None);
        assert!(matches!(a, StreamRef::Unhashed(_)));
        let StreamRef::Hashed(hash) = b else {
            panic!("second insert must be hashed");
        };
        // The first blob was resolved to the same hash; counts merged.
        assert_eq!(table.len(), 1);
        assert_eq!(table.lookup(&hash).unwrap().refcount, 2);
        assert_eq!(table.resolve(&a), Some(hash));
    }

    #[test]
    fn same_size_different_contents_do_not_merge() {
        let mut table = BlobTable::new();
        table.add_buffered(b"aaaa".to_vec(), None);
        table.add_buffered(b"bbbb".to_vec(), None);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn release_drops_at_zero() {
        let mut table = BlobTable::new();
        let hash = sha1_buffer(b"x");
        table.insert(BlobDescriptor {
            hash,
            size: 1,
            refcount: 2,
            location: BlobLocation::Buffered(Arc::new(b"x".to_vec())),
            part_number: 1,
            sort_hint: None,
        });
        table.release_ref(&hash, 1, false);
        assert!(table.lookup(&hash).is_some());
        table.release_ref(&hash, 1, false);
        assert!(table.lookup(&hash).is_none());
    }

    #[test]
    fn soft_delete_keeps_zero_ref_blobs() {
        let mut table = BlobTable::new();
        let hash = sha1_buffer(b"y");
        table.insert(BlobDescriptor {
            hash,
            size: 1,
            refcount: 1,
            location: BlobLocation::Buffered(Arc::new(b"y".to_vec())),
            part_number: 1,
            sort_hint: None,
        });
        table.release_ref(&hash, 1, true);
        assert_eq!(table.lookup(&hash).unwrap().refcount, 0);
    }

    #[test]
    fn resolve_all_handles_everything() {
        let mut table = BlobTable::new();
        let r1 = table.add_buffered(b"abc".to_vec(), None);
        let r2 = table.add_buffered(b"defg".to_vec(), None);
        table.resolve_all_unhashed();
        assert!(table.resolve(&r1).is_some());
        assert!(table.resolve(&r2).is_some());
        assert_eq!(table.len(), 2);
    }
}
