use super::*;
use rand::{Rng, RngCore, SeedableRng};

fn roundtrip_one_chunk(ty: CompressionType, chunk_size: u32, data: &[u8]) -> bool {
    let mut c = Compressor::new(ty, chunk_size).unwrap();
    let mut d = Decompressor::new(ty, chunk_size).unwrap();
    let mut out = vec![0u8; data.len()];
    match c.compress(data, 0, &mut out) {
        Some(n) => {
            assert!(n < data.len(), "{ty}: compressed not smaller");
            let mut back = vec![0u8; data.len()];
            d.decompress(&out[..n], &mut back, 0).unwrap();
            assert_eq!(back, data, "{ty}: roundtrip mismatch");
            true
        }
        None => false,
    }
}

#[test]
fn xpress_all_zero_chunk() {
    let data = vec![0u8; 32768];
    assert!(roundtrip_one_chunk(CompressionType::Xpress, 32768, &data));
}

#[test]
fn lzx_mod256_ramp() {
    let data: Vec<u8> = (0..32768u32).map(|i| i as u8).collect();
    assert!(roundtrip_one_chunk(CompressionType::Lzx, 32768, &data));
}

#[test]
fn all_formats_roundtrip_mixed_data() {
    let mut rng = rand::rngs::StdRng::seed_from_u64(0x1dea);
    // Compressible: random bytes with long repeated stretches.
    let mut data = vec![0u8; 32768];
    rng.fill_bytes(&mut data[..8192]);
    for i in 8192..32768 {
        data[i] = data[i - rng.gen_range(1..4096)];
    }
    for ty in [
        CompressionType::Xpress,
        CompressionType::Lzx,
        CompressionType::Lzms,
    ] {
        assert!(roundtrip_one_chunk(ty, 32768, &data), "{ty}");
    }
}

#[test]
fn all_formats_handle_short_final_chunk() {
    let data: Vec<u8> = std::iter::repeat(&b"abcabcabd"[..])
        .take(150)
        .flatten()
        .copied()
        .collect();
    for ty in [
        CompressionType::Xpress,
        CompressionType::Lzx,
        CompressionType::Lzms,
    ] {
        roundtrip_one_chunk(ty, 32768, &data);
    }
}

#[test]
fn incompressible_chunks_are_refused_by_every_format() {
    let mut rng = rand::rngs::StdRng::seed_from_u64(99);
    let mut data = vec![0u8; 32768];
    rng.fill_bytes(&mut data);
    for ty in [
        CompressionType::Xpress,
        CompressionType::Lzx,
        CompressionType::Lzms,
    ] {
        assert!(!roundtrip_one_chunk(ty, 32768, &data), "{ty}");
    }
}

#[test]
fn chunk_size_validation() {
    assert!(CompressionType::Xpress.is_valid_chunk_size(4096));
    assert!(CompressionType::Xpress.is_valid_chunk_size(32768));
    assert!(!CompressionType::Xpress.is_valid_chunk_size(131072));
    assert!(!CompressionType::Lzx.is_valid_chunk_size(4096));
    assert!(CompressionType::Lzms.is_valid_chunk_size(1 << 20));
    assert!(!CompressionType::Lzms.is_valid_chunk_size(1 << 21));
    assert!(!CompressionType::Lzx.is_valid_chunk_size(33000));
    assert!(Compressor::new(CompressionType::Lzx, 33000).is_err());
}

#[test]
fn compression_type_codes_are_stable() {
    for (ty, code) in [
        (CompressionType::None, 0u32),
        (CompressionType::Xpress, 1),
        (CompressionType::Lzx, 2),
        (CompressionType::Lzms, 3),
    ] {
        assert_eq!(ty.to_code(), code);
        assert_eq!(CompressionType::try_from_code(code).unwrap(), ty);
    }
    assert!(CompressionType::try_from_code(7).is_err());
}

#[test]
fn lzms_solid_sequence_through_public_api() {
    // Three chunks of one solid stream; later chunks reference earlier ones.
    let base: Vec<u8> = (0..300)
        .flat_map(|i| format!("solid line #{i} lorem ipsum dolor\n").into_bytes())
        .collect();
    let mut stream = Vec::new();
    for _ in 0..3 {
        stream.extend_from_slice(&base);
    }
    let chunk = base.len();

    let mut c = Compressor::new(CompressionType::Lzms, 1 << 20).unwrap();
    let mut d = Decompressor::new(CompressionType::Lzms, 1 << 20).unwrap();

    let mut compressed = Vec::new();
    let mut start = 0;
    while start < stream.len() {
        let end = (start + chunk).min(stream.len());
        let mut out = vec![0u8; end - start];
        let n = c.compress(&stream[..end], start, &mut out).expect("solid chunk compresses");
        compressed.push(out[..n].to_vec());
        start = end;
    }

    let mut decoded: Vec<u8> = Vec::new();
    let mut start = 0;
    for cdata in &compressed {
        let end = (start + chunk).min(stream.len());
        decoded.resize(end, 0);
        d.decompress(cdata, &mut decoded, start).unwrap();
        start = end;
    }
    assert_eq!(decoded, stream);
}
