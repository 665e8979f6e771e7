//! Splitting an archive into parts and joining parts back together.
//!
//! Every part of a split set is itself a standalone WIM file carrying the
//! shared GUID and the `SPANNED` header flag; part 1 additionally holds all
//! image metadata. Blobs are never split across parts, so a blob larger
//! than the target part size makes its part exceed the target.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use tracing::{debug, info_span};

use crate::error::{Result, WimError};
use crate::progress::{check, NoProgress, ProgressEvent, ProgressSink};
use crate::sha1::Sha1Hash;
use crate::write::PartSpec;
use crate::{ImageEntry, OpenFlags, Wim, WriteFlags};

impl Wim {
    /// Splits the archive into parts of roughly `part_size` bytes.
    ///
    /// `first_part` names part 1; subsequent parts get a part number
    /// inserted before the extension (`base2.swm`, `base3.swm`, ...).
    /// Returns the part paths.
    pub fn split(
        &mut self,
        first_part: impl AsRef<Path>,
        part_size: u64,
    ) -> Result<Vec<PathBuf>> {
        self.split_with_progress(first_part, part_size, WriteFlags::empty(), &mut NoProgress)
    }

    /// [`Wim::split`] with write flags and progress reporting.
    pub fn split_with_progress(
        &mut self,
        first_part: impl AsRef<Path>,
        part_size: u64,
        flags: WriteFlags,
        progress: &mut dyn ProgressSink,
    ) -> Result<Vec<PathBuf>> {
        let first_part = first_part.as_ref();
        let _span = info_span!("Wim::split", part_size).entered();
        if self.hdr.total_parts != 1 {
            return Err(WimError::SplitUnsupported);
        }
        if part_size == 0 {
            return Err(WimError::SplitInvalid("part size must be nonzero".into()));
        }
        self.blob_table.resolve_all_unhashed();

        // Partition the file-data blobs greedily by size. Metadata always
        // lands in part 1, so its estimated size seeds the first bucket.
        let metadata_hashes: HashSet<Sha1Hash> =
            self.images.iter().filter_map(|i| i.metadata_hash).collect();
        let mut parts: Vec<HashSet<Sha1Hash>> = vec![HashSet::new()];
        let mut current_size: u64 = metadata_hashes
            .iter()
            .filter_map(|h| self.blob_table.lookup(h))
            .map(|d| d.size)
            .sum();

        let mut blobs: Vec<(Sha1Hash, u64)> = self
            .blob_table
            .iter()
            .filter(|d| d.refcount > 0 && !metadata_hashes.contains(&d.hash))
            .map(|d| (d.hash, d.size))
            .collect();
        blobs.sort_by_key(|&(hash, _)| hash);

        for (hash, size) in blobs {
            if current_size + size > part_size && !parts.last().expect("nonempty").is_empty() {
                parts.push(HashSet::new());
                current_size = 0;
            }
            parts.last_mut().expect("nonempty").insert(hash);
            current_size += size;
        }

        let total_parts = parts.len() as u16;
        let mut paths = Vec::with_capacity(parts.len());
        for (i, blob_set) in parts.into_iter().enumerate() {
            let part_number = i as u16 + 1;
            let path = if part_number == 1 {
                first_part.to_owned()
            } else {
                part_path(first_part, part_number)
            };
            let part_bytes: u64 = blob_set
                .iter()
                .filter_map(|h| self.blob_table.lookup(h))
                .map(|d| d.size)
                .sum();
            check(progress.progress(ProgressEvent::SplitBeginPart {
                part_number,
                part_bytes,
            }))?;

            let spec = PartSpec {
                part_number,
                total_parts,
                include_images: part_number == 1,
                blobs: Some(blob_set),
            };
            self.write_archive_to_path(
                &path,
                flags | WriteFlags::RETAIN_GUID,
                0,
                Some(spec),
                progress,
            )
            .inspect_err(|_| {
                for p in &paths {
                    let _ = std::fs::remove_file(p);
                }
                let _ = std::fs::remove_file(&path);
            })?;
            paths.push(path);

            check(progress.progress(ProgressEvent::SplitEndPart { part_number }))?;
        }
        debug!(parts = paths.len(), "split complete");
        Ok(paths)
    }
}

/// `base.swm` -> `base{n}.swm`.
fn part_path(first: &Path, part_number: u16) -> PathBuf {
    let stem = first
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "part".into());
    let ext = first
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    first.with_file_name(format!("{stem}{part_number}{ext}"))
}

/// Joins the parts of a split archive into a new standalone WIM at
/// `out_path`.
///
/// All parts must share one GUID and form a complete set with part numbers
/// `1..=N`, each present exactly once. Blob contents are carried over
/// unchanged in meaning (not necessarily in layout).
pub fn join(
    parts: &[impl AsRef<Path>],
    out_path: impl AsRef<Path>,
    flags: WriteFlags,
    num_threads: usize,
) -> Result<()> {
    let _span = info_span!("join", parts = parts.len()).entered();
    if parts.is_empty() {
        return Err(WimError::SplitInvalid("no parts given".into()));
    }

    let mut opened: Vec<Wim> = Vec::with_capacity(parts.len());
    for path in parts {
        opened.push(Wim::open(path.as_ref(), OpenFlags::SPLIT_OK)?);
    }

    let guid = opened[0].guid();
    let total = opened[0].part_info().1;
    if total as usize != opened.len() {
        return Err(WimError::SplitInvalid(format!(
            "expected {total} parts, got {}",
            opened.len()
        )));
    }
    let mut seen = vec![false; total as usize + 1];
    for wim in &opened {
        let (number, wim_total) = wim.part_info();
        if wim.guid() != guid {
            return Err(WimError::SplitInvalid("parts have different GUIDs".into()));
        }
        if wim.compression_type() != opened[0].compression_type() {
            return Err(WimError::SplitInvalid(
                "parts have different compression types".into(),
            ));
        }
        if wim_total != total || number == 0 || number > total {
            return Err(WimError::SplitInvalid(format!(
                "part number {number} out of range"
            )));
        }
        if seen[number as usize] {
            return Err(WimError::SplitInvalid(format!(
                "part number {number} appears twice"
            )));
        }
        seen[number as usize] = true;
    }

    let first_index = opened
        .iter()
        .position(|w| w.part_info().0 == 1)
        .ok_or_else(|| WimError::SplitInvalid("part 1 is missing".into()))?;

    // The joined archive references blob storage across all parts; the
    // writer then copies everything into the output.
    let mut out = Wim::create_new(opened[first_index].compression_type())?;
    for wim in &opened {
        let first_metadata: HashSet<Sha1Hash> =
            wim.images.iter().filter_map(|i| i.metadata_hash).collect();
        for desc in wim.blob_table.iter() {
            if first_metadata.contains(&desc.hash) {
                continue;
            }
            out.blob_table.insert(crate::blob::BlobDescriptor {
                hash: desc.hash,
                size: desc.size,
                refcount: desc.refcount,
                location: desc.location.clone(),
                part_number: 1,
                sort_hint: desc.sort_hint.clone(),
            });
        }
    }

    {
        let first = &mut opened[first_index];
        for index in 1..=first.image_count() {
            first.load_image_metadata(index)?;
        }
        let boot = first.boot_index();
        out.hdr.boot_index = boot;
        out.xml.images = first.xml.images.clone();
        out.xml.mark_dirty();
        for image in &first.images {
            out.images.push(ImageEntry {
                metadata_hash: None,
                metadata: image.metadata.clone(),
                modified: true,
            });
        }
        out.hdr.image_count = out.image_count();
    }

    out.write(out_path, flags, num_threads)?;
    Ok(())
}
