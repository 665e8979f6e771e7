use std::sync::Once;

use crate::blob::BlobLocation;
use crate::*;

fn init_logger() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .compact()
            .with_test_writer()
            .without_time()
            .with_ansi(false)
            .try_init();
    });
}

fn small_image() -> Vec<SourceEntry> {
    vec![
        SourceEntry::file("a.txt", b"hello"),
        SourceEntry::dir("sub"),
        SourceEntry::file("sub/b.txt", b"world!"),
    ]
}

#[test]
fn refcount_accounting_matches_tree_references() {
    init_logger();
    let mut wim = Wim::create_new(CompressionType::Xpress).unwrap();
    wim.add_image("A", None, &small_image()).unwrap();
    wim.add_image("B", None, &small_image()).unwrap();
    wim.blob_table.resolve_all_unhashed();

    // Each image references the same two blobs once.
    assert_eq!(wim.blob_table.len(), 2);
    assert_eq!(wim.blob_table.total_refcount(), 4);

    wim.delete_image(2).unwrap();
    assert_eq!(wim.blob_table.total_refcount(), 2);
    wim.delete_image(1).unwrap();
    assert_eq!(wim.blob_table.len(), 0);
}

#[test]
fn written_resources_do_not_overlap() {
    init_logger();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("overlap.wim");

    let mut wim = Wim::create_new(CompressionType::Xpress).unwrap();
    let mut entries = small_image();
    entries.push(SourceEntry::file("big.bin", &vec![0xabu8; 200_000]));
    wim.add_image("A", None, &entries).unwrap();
    wim.write(&path, WriteFlags::empty(), 1).unwrap();

    // Collect every resource range referenced by the reopened archive.
    let wim = Wim::open(&path, OpenFlags::empty()).unwrap();
    let file_size = std::fs::metadata(&path).unwrap().len();
    let mut ranges: Vec<(u64, u64)> = Vec::new();
    let mut seen = std::collections::HashSet::new();
    for desc in wim.blob_table.iter() {
        let BlobLocation::InWim { res, .. } = &desc.location else {
            panic!("all blobs must live in the file after write");
        };
        if seen.insert(res.reshdr.offset_in_wim) {
            ranges.push((res.reshdr.offset_in_wim, res.reshdr.end()));
        }
    }
    ranges.push((
        wim.hdr.blob_table_reshdr.offset_in_wim,
        wim.hdr.blob_table_reshdr.end(),
    ));
    ranges.push((
        wim.hdr.xml_data_reshdr.offset_in_wim,
        wim.hdr.xml_data_reshdr.end(),
    ));
    ranges.sort_unstable();
    let mut prev_end = HEADER_SIZE as u64;
    for (start, end) in ranges {
        assert!(start >= prev_end, "resources overlap: {start} < {prev_end}");
        assert!(end <= file_size);
        prev_end = end;
    }
}

#[test]
fn image_names_and_boot_index_survive_write() {
    init_logger();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("named.wim");

    let mut wim = Wim::create_new(CompressionType::Lzx).unwrap();
    wim.add_image("first", Some("the first image"), &small_image())
        .unwrap();
    wim.add_image("second", None, &[]).unwrap();
    wim.set_boot_index(2).unwrap();
    wim.write(&path, WriteFlags::empty(), 1).unwrap();

    let wim = Wim::open(&path, OpenFlags::empty()).unwrap();
    assert_eq!(wim.image_count(), 2);
    assert_eq!(wim.boot_index(), 2);
    assert_eq!(wim.image_name(1).unwrap(), "first");
    assert_eq!(
        wim.image_description(1).unwrap(),
        Some("the first image")
    );
    assert_eq!(wim.image_name(2).unwrap(), "second");
    assert_eq!(wim.resolve_image_name("SECOND"), Some(2));
}

#[test]
fn name_collisions_rejected() {
    init_logger();
    let mut wim = Wim::create_new(CompressionType::None).unwrap();
    wim.add_image("A", None, &[]).unwrap();
    assert!(matches!(
        wim.add_image("A", None, &[]),
        Err(WimError::ImageNameCollision(_))
    ));
    assert!(matches!(
        wim.set_boot_index(5),
        Err(WimError::InvalidImage(5))
    ));
}

#[test]
fn uncompressed_archive_roundtrips() {
    init_logger();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("plain.wim");

    let mut wim = Wim::create_new(CompressionType::None).unwrap();
    wim.add_image("A", None, &small_image()).unwrap();
    wim.write(&path, WriteFlags::empty(), 1).unwrap();

    let mut wim = Wim::open(&path, OpenFlags::empty()).unwrap();
    assert_eq!(wim.read_file(1, "a.txt").unwrap(), b"hello");
    assert_eq!(wim.read_file(1, "sub/b.txt").unwrap(), b"world!");
}
