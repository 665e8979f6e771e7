//! End-to-end scenarios over real files.

use std::io::{Read, Seek, SeekFrom, Write};

use rand::{Rng, RngCore, SeedableRng};
use wimarc::{
    join, sha1_buffer, CompressionType, OpenFlags, SourceEntry, Wim, WimError, WriteFlags,
    HEADER_SIZE,
};

fn tempdir() -> tempfile::TempDir {
    tempfile::tempdir().expect("create temp dir")
}

/// Round trip of a small image: files come back byte-identical with the
/// right image bookkeeping.
#[test]
fn roundtrip_small_image() {
    let dir = tempdir();
    let path = dir.path().join("out.wim");

    let mut wim = Wim::create_new(CompressionType::Xpress).unwrap();
    let entries = vec![
        SourceEntry::file("a.txt", b"hello"),
        SourceEntry::dir("sub"),
        SourceEntry::file("sub/b.txt", b"world!"),
    ];
    wim.add_image("A", None, &entries).unwrap();
    wim.write(&path, WriteFlags::empty(), 0).unwrap();

    let mut wim = Wim::open(&path, OpenFlags::empty()).unwrap();
    assert_eq!(wim.image_count(), 1);
    assert_eq!(wim.boot_index(), 0);
    assert_eq!(wim.image_name(1).unwrap(), "A");
    assert_eq!(wim.read_file(1, "a.txt").unwrap(), b"hello");
    assert_eq!(wim.read_file(1, "sub/b.txt").unwrap(), b"world!");

    // The tree is walkable and lists exactly the paths we added.
    let metadata = wim.image_metadata(1).unwrap();
    let mut paths = Vec::new();
    metadata.for_each_entry(|path, _, _| paths.push(path.to_owned()));
    paths.sort();
    assert_eq!(paths, vec!["/a.txt", "/sub", "/sub/b.txt"]);
}

/// Two files with identical contents produce one blob with refcount 2.
#[test]
fn dedup_identical_contents() {
    let dir = tempdir();
    let path = dir.path().join("dedup.wim");

    let mut wim = Wim::create_new(CompressionType::Xpress).unwrap();
    let entries = vec![
        SourceEntry::file("x", b"same"),
        SourceEntry::file("y", b"same"),
    ];
    wim.add_image("A", None, &entries).unwrap();
    wim.write(&path, WriteFlags::empty(), 0).unwrap();

    let wim = Wim::open(&path, OpenFlags::empty()).unwrap();
    let hash = sha1_buffer(b"same");
    assert!(wim.has_blob(&hash));
    assert_eq!(wim.blob_refcount(&hash).unwrap(), 2);
    // One data blob plus one metadata blob.
    assert_eq!(wim.blob_count(), 2);
}

/// Integrity checking: a flipped byte in the content region fails the
/// integrity verification, and reading the damaged blob fails its SHA-1
/// check even when integrity checking is skipped.
#[test]
fn integrity_detects_corruption() {
    let dir = tempdir();
    let path = dir.path().join("integrity.wim");

    // Uncompressed so the flipped byte lands in blob data, not in a
    // compressed bitstream.
    let mut wim = Wim::create_new(CompressionType::None).unwrap();
    let payload = vec![0x5au8; 100_000];
    wim.add_image("A", None, &[SourceEntry::file("data.bin", &payload)])
        .unwrap();
    wim.write(&path, WriteFlags::CHECK_INTEGRITY, 0).unwrap();

    // Sanity: the pristine file verifies.
    let wim_ok = Wim::open(&path, OpenFlags::CHECK_INTEGRITY).unwrap();
    drop(wim_ok);

    // Locate the blob and flip one byte of its stored data.
    let wim_ro = Wim::open(&path, OpenFlags::empty()).unwrap();
    let hash = sha1_buffer(&payload);
    assert!(wim_ro.has_blob(&hash));
    drop(wim_ro);
    {
        let mut f = std::fs::File::options()
            .read(true)
            .write(true)
            .open(&path)
            .unwrap();
        // Blob data begins right after the metadata resource; flipping a
        // byte halfway through the file is safely inside the content
        // region covered by the integrity table.
        let file_len = f.metadata().unwrap().len();
        let target = file_len / 2;
        assert!(target > HEADER_SIZE as u64);
        let mut b = [0u8; 1];
        f.seek(SeekFrom::Start(target)).unwrap();
        f.read_exact(&mut b).unwrap();
        f.seek(SeekFrom::Start(target)).unwrap();
        f.write_all(&[b[0] ^ 0xff]).unwrap();
    }

    match Wim::open(&path, OpenFlags::CHECK_INTEGRITY) {
        Err(WimError::IntegrityMismatch { .. }) => {}
        Err(e) => panic!("expected IntegrityMismatch, got {e:?}"),
        Ok(_) => panic!("expected IntegrityMismatch, got a successful open"),
    }

    // Without the flag the file opens; reading the damaged blob fails.
    let wim = Wim::open(&path, OpenFlags::empty()).unwrap();
    match wim.read_blob(&hash) {
        Err(WimError::InvalidResourceHash) => {}
        other => panic!("expected InvalidResourceHash, got {:?}", other.map(|v| v.len())),
    }
}

/// An interrupted overwrite leaves the original archive readable: the
/// header still points at the old tables, whatever garbage follows them.
#[test]
fn append_crash_leaves_old_archive_valid() {
    let dir = tempdir();
    let path = dir.path().join("crash.wim");

    let mut wim = Wim::create_new(CompressionType::Xpress).unwrap();
    wim.add_image("A", None, &[SourceEntry::file("keep.txt", b"keep me")])
        .unwrap();
    wim.write(&path, WriteFlags::empty(), 0).unwrap();
    drop(wim);

    // Simulate a crash mid-append: the write-in-progress mark is set and
    // partial blob data was appended, but the header was never finalized.
    {
        let mut f = std::fs::File::options()
            .read(true)
            .write(true)
            .open(&path)
            .unwrap();
        let mut flags_bytes = [0u8; 4];
        f.seek(SeekFrom::Start(16)).unwrap();
        f.read_exact(&mut flags_bytes).unwrap();
        let flags = u32::from_le_bytes(flags_bytes) | 0x40; // WRITE_IN_PROGRESS
        f.seek(SeekFrom::Start(16)).unwrap();
        f.write_all(&flags.to_le_bytes()).unwrap();
        f.seek(SeekFrom::End(0)).unwrap();
        f.write_all(&vec![0xddu8; 12345]).unwrap();
    }

    let mut reopened = Wim::open(&path, OpenFlags::empty()).unwrap();
    assert!(reopened.write_in_progress());
    assert_eq!(reopened.image_count(), 1);
    assert_eq!(reopened.read_file(1, "keep.txt").unwrap(), b"keep me");
}

/// Append-style overwrite: the new image lands in the same file, existing
/// blobs are not rewritten, and the file only grows.
#[test]
fn overwrite_appends_new_image() {
    let dir = tempdir();
    let path = dir.path().join("grow.wim");

    let mut wim = Wim::create_new(CompressionType::Xpress).unwrap();
    wim.add_image("A", None, &[SourceEntry::file("one.txt", b"first image")])
        .unwrap();
    wim.write(&path, WriteFlags::empty(), 0).unwrap();
    let size_before = std::fs::metadata(&path).unwrap().len();

    let mut wim = Wim::open(&path, OpenFlags::WRITE_ACCESS).unwrap();
    wim.add_image(
        "B",
        None,
        &[
            SourceEntry::file("one.txt", b"first image"), // dedups
            SourceEntry::file("two.txt", b"second image"),
        ],
    )
    .unwrap();
    wim.overwrite(WriteFlags::empty(), 0).unwrap();

    let size_after = std::fs::metadata(&path).unwrap().len();
    assert!(size_after > size_before);

    let mut wim = Wim::open(&path, OpenFlags::empty()).unwrap();
    assert_eq!(wim.image_count(), 2);
    assert_eq!(wim.read_file(1, "one.txt").unwrap(), b"first image");
    assert_eq!(wim.read_file(2, "two.txt").unwrap(), b"second image");
    assert_eq!(
        wim.blob_refcount(&sha1_buffer(b"first image")).unwrap(),
        2,
        "shared blob must not be duplicated by the append"
    );
}

/// Split then join: blob contents and image count survive.
#[test]
fn split_and_join_roundtrip() {
    let dir = tempdir();
    let original = dir.path().join("orig.wim");
    let first_part = dir.path().join("part.swm");
    let joined = dir.path().join("joined.wim");

    // A few MiB of compressible-but-distinct blobs.
    let mut rng = rand::rngs::StdRng::seed_from_u64(1234);
    let mut entries = Vec::new();
    let mut payloads = Vec::new();
    for i in 0..24 {
        let mut data = vec![0u8; 150_000];
        rng.fill_bytes(&mut data[..50_000]);
        for j in 50_000..data.len() {
            data[j] = data[j - rng.gen_range(1..50_000)];
        }
        entries.push(SourceEntry::file(&format!("f{i:02}.bin"), &data));
        payloads.push(data);
    }

    let mut wim = Wim::create_new(CompressionType::Xpress).unwrap();
    wim.add_image("A", None, &entries).unwrap();
    wim.write(&original, WriteFlags::empty(), 0).unwrap();

    let mut wim = Wim::open(&original, OpenFlags::empty()).unwrap();
    let original_hashes: std::collections::BTreeSet<_> =
        wim.blob_hashes().into_iter().collect();
    let parts = wim.split(&first_part, 600_000).unwrap();
    assert!(parts.len() >= 3, "expected several parts, got {}", parts.len());

    // Each part is itself a standalone WIM with the shared GUID.
    let guid = wim.guid();
    for part in &parts {
        let p = Wim::open(part, OpenFlags::SPLIT_OK).unwrap();
        assert_eq!(p.guid(), guid);
    }
    // A part refuses to open without SPLIT_OK.
    assert!(matches!(
        Wim::open(&parts[0], OpenFlags::empty()),
        Err(WimError::SplitUnsupported)
    ));

    join(&parts, &joined, WriteFlags::empty(), 0).unwrap();

    let mut joined_wim = Wim::open(&joined, OpenFlags::empty()).unwrap();
    assert_eq!(joined_wim.image_count(), 1);
    let joined_hashes: std::collections::BTreeSet<_> =
        joined_wim.blob_hashes().into_iter().collect();
    // Data blobs all carried over (metadata blobs differ by layout).
    for (i, payload) in payloads.iter().enumerate() {
        let hash = sha1_buffer(payload);
        assert!(original_hashes.contains(&hash));
        assert!(joined_hashes.contains(&hash), "blob {i} missing after join");
        assert_eq!(&joined_wim.read_file(1, &format!("f{i:02}.bin")).unwrap(), payload);
    }
}

/// Deleting an image and rewriting reclaims its unique blobs.
#[test]
fn delete_image_reclaims_blobs() {
    let dir = tempdir();
    let path = dir.path().join("del.wim");

    let mut wim = Wim::create_new(CompressionType::Xpress).unwrap();
    wim.add_image("A", None, &[SourceEntry::file("shared.txt", b"shared data here")])
        .unwrap();
    wim.add_image(
        "B",
        None,
        &[
            SourceEntry::file("shared.txt", b"shared data here"),
            SourceEntry::file("only-b.txt", b"unique to b"),
        ],
    )
    .unwrap();
    wim.write(&path, WriteFlags::empty(), 0).unwrap();

    let mut wim = Wim::open(&path, OpenFlags::WRITE_ACCESS).unwrap();
    wim.delete_image(2).unwrap();
    // Deletion forces the rebuild path (no soft delete requested).
    wim.overwrite(WriteFlags::empty(), 0).unwrap();

    let wim = Wim::open(&path, OpenFlags::empty()).unwrap();
    assert_eq!(wim.image_count(), 1);
    assert!(wim.has_blob(&sha1_buffer(b"shared data here")));
    assert!(!wim.has_blob(&sha1_buffer(b"unique to b")));
}

/// LZMS solid mode: many small files pack into one shared-dictionary
/// resource and read back intact.
#[test]
fn solid_mode_roundtrip() {
    let dir = tempdir();
    let path = dir.path().join("solid.wim");

    let mut entries = Vec::new();
    for i in 0..40 {
        let text: String = (0..200)
            .map(|j| format!("solid file {i} line {j} shared vocabulary\n"))
            .collect();
        entries.push(SourceEntry::file(&format!("texts/t{i}.txt"), text.as_bytes()));
    }

    let mut wim = Wim::create_new(CompressionType::Lzms).unwrap();
    wim.add_image("A", None, &entries).unwrap();
    wim.write(&path, WriteFlags::SOLID, 0).unwrap();

    let mut wim = Wim::open(&path, OpenFlags::empty()).unwrap();
    for i in [0usize, 7, 39] {
        let expected: String = (0..200)
            .map(|j| format!("solid file {i} line {j} shared vocabulary\n"))
            .collect();
        assert_eq!(
            wim.read_file(1, &format!("texts/t{i}.txt")).unwrap(),
            expected.as_bytes()
        );
    }
}

/// Pipable layout: written with per-blob headers and trailing chunk
/// tables, and still readable through the normal seekable path.
#[test]
fn pipable_write_reopens() {
    let dir = tempdir();
    let path = dir.path().join("pipe.wim");

    let mut wim = Wim::create_new(CompressionType::Xpress).unwrap();
    wim.add_image(
        "A",
        None,
        &[SourceEntry::file("p.txt", &b"pipable contents ".repeat(4000))],
    )
    .unwrap();
    wim.write(&path, WriteFlags::PIPABLE, 0).unwrap();

    let mut wim = Wim::open(&path, OpenFlags::empty()).unwrap();
    assert!(wim.is_pipable());
    assert_eq!(
        wim.read_file(1, "p.txt").unwrap(),
        b"pipable contents ".repeat(4000)
    );

    // Converting back to the classic layout requires a rebuild, which
    // overwrite performs transparently.
    let mut wim = Wim::open(&path, OpenFlags::WRITE_ACCESS).unwrap();
    wim.overwrite(WriteFlags::NOT_PIPABLE, 0).unwrap();
    let wim = Wim::open(&path, OpenFlags::empty()).unwrap();
    assert!(!wim.is_pipable());
}

/// Export shares blobs by hash across archives.
#[test]
fn export_image_between_archives() {
    let dir = tempdir();
    let src_path = dir.path().join("src.wim");
    let dst_path = dir.path().join("dst.wim");

    let mut src = Wim::create_new(CompressionType::Xpress).unwrap();
    src.add_image("exported", None, &[SourceEntry::file("e.txt", b"export me")])
        .unwrap();
    src.write(&src_path, WriteFlags::empty(), 0).unwrap();

    let mut src = Wim::open(&src_path, OpenFlags::empty()).unwrap();
    let mut dst = Wim::create_new(CompressionType::Xpress).unwrap();
    dst.add_image("local", None, &[SourceEntry::file("l.txt", b"local file")])
        .unwrap();
    dst.export_image(&mut src, 1, "exported", Some("copied"))
        .unwrap();
    dst.write(&dst_path, WriteFlags::empty(), 0).unwrap();

    let mut dst = Wim::open(&dst_path, OpenFlags::empty()).unwrap();
    assert_eq!(dst.image_count(), 2);
    assert_eq!(dst.image_name(2).unwrap(), "exported");
    assert_eq!(dst.read_file(2, "e.txt").unwrap(), b"export me");
    assert_eq!(dst.read_file(1, "l.txt").unwrap(), b"local file");
}

/// Unsafe compact shrinks the file after a deletion and leaves a valid
/// archive.
#[test]
fn unsafe_compact_reclaims_space() {
    let dir = tempdir();
    let path = dir.path().join("compact.wim");

    let big = vec![0x11u8; 400_000];
    let mut wim = Wim::create_new(CompressionType::None).unwrap();
    wim.add_image("A", None, &[SourceEntry::file("small.txt", b"stays")])
        .unwrap();
    wim.add_image("B", None, &[SourceEntry::file("big.bin", &big)])
        .unwrap();
    wim.write(&path, WriteFlags::empty(), 0).unwrap();
    let size_before = std::fs::metadata(&path).unwrap().len();

    let mut wim = Wim::open(&path, OpenFlags::WRITE_ACCESS).unwrap();
    wim.delete_image(2).unwrap();
    wim.overwrite(WriteFlags::UNSAFE_COMPACT, 0).unwrap();

    let size_after = std::fs::metadata(&path).unwrap().len();
    assert!(
        size_after < size_before,
        "compact must shrink: {size_after} >= {size_before}"
    );
    let mut wim = Wim::open(&path, OpenFlags::empty()).unwrap();
    assert_eq!(wim.image_count(), 1);
    assert_eq!(wim.read_file(1, "small.txt").unwrap(), b"stays");
}

/// Larger mixed-content archive across every compression format.
#[test]
fn mixed_content_all_formats() {
    let mut rng = rand::rngs::StdRng::seed_from_u64(42);
    let mut entries = Vec::new();
    for i in 0..10 {
        let mut data = vec![0u8; 60_000 + i * 1000];
        rng.fill_bytes(&mut data[..20_000]);
        for j in 20_000..data.len() {
            data[j] = data[j - rng.gen_range(1..20_000)];
        }
        entries.push(SourceEntry::file(&format!("blob{i}.dat"), &data));
    }

    for ctype in [
        CompressionType::None,
        CompressionType::Xpress,
        CompressionType::Lzx,
        CompressionType::Lzms,
    ] {
        let dir = tempdir();
        let path = dir.path().join("mixed.wim");
        let mut wim = Wim::create_new(ctype).unwrap();
        wim.add_image("A", None, &entries).unwrap();
        wim.write(&path, WriteFlags::empty(), 0).unwrap();

        let mut wim = Wim::open(&path, OpenFlags::empty()).unwrap();
        for (i, entry) in entries.iter().enumerate() {
            assert_eq!(
                wim.read_file(1, &format!("blob{i}.dat")).unwrap(),
                entry.contents,
                "{ctype}: blob {i} mismatch"
            );
        }
    }
}
