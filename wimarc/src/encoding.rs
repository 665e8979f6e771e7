//! UTF-16LE string handling and NTFS-semantic case-insensitive comparison.
//!
//! File names inside an image are UTF-16LE, compared case-insensitively
//! using the default upper-case table of NTFS volumes formatted by Windows
//! 10. The table is expanded once, on first use, from an LZ-compressed
//! literal followed by a delta filter.

use std::sync::OnceLock;

/// The compressed form of the 65536-entry upper-case table.
#[rustfmt::skip]
const UPCASE_COMPRESSED: [u16; 378] = [
    0x0000, 0x0000, 0x0060, 0x0000, 0x0000, 0xffe0, 0x0019, 0x0061,
    0x0061, 0x0000, 0x001b, 0x005d, 0x0008, 0x0060, 0x0000, 0x0079,
    0x0000, 0x0000, 0x0000, 0xffff, 0x002f, 0x0100, 0x0002, 0x0000,
    0x0007, 0x012b, 0x0011, 0x0121, 0x002f, 0x0103, 0x0006, 0x0101,
    0x0000, 0x00c3, 0x0006, 0x0131, 0x0007, 0x012e, 0x0004, 0x0000,
    0x0003, 0x012f, 0x0000, 0x0061, 0x0004, 0x0130, 0x0000, 0x00a3,
    0x0003, 0x0000, 0x0000, 0x0082, 0x000b, 0x0131, 0x0006, 0x0189,
    0x0008, 0x012f, 0x0007, 0x012e, 0x0000, 0x0038, 0x0006, 0x0000,
    0x0000, 0xfffe, 0x0007, 0x01c4, 0x000f, 0x0101, 0x0000, 0xffb1,
    0x0015, 0x011e, 0x0004, 0x01cc, 0x002a, 0x0149, 0x0014, 0x0149,
    0x0007, 0x0000, 0x0009, 0x018c, 0x000b, 0x0138, 0x0000, 0x2a1f,
    0x0000, 0x2a1c, 0x0000, 0x0000, 0x0000, 0xff2e, 0x0000, 0xff32,
    0x0000, 0x0000, 0x0000, 0xff33, 0x0000, 0xff33, 0x0000, 0x0000,
    0x0000, 0xff36, 0x0000, 0x0000, 0x0000, 0xff35, 0x0004, 0x0000,
    0x0002, 0x0257, 0x0000, 0x0000, 0x0000, 0xff31, 0x0004, 0x0000,
    0x0000, 0xff2f, 0x0000, 0xff2d, 0x0000, 0x0000, 0x0000, 0x29f7,
    0x0003, 0x0000, 0x0002, 0x0269, 0x0000, 0x29fd, 0x0000, 0xff2b,
    0x0002, 0x0000, 0x0000, 0xff2a, 0x0007, 0x0000, 0x0000, 0x29e7,
    0x0002, 0x0000, 0x0000, 0xff26, 0x0005, 0x027e, 0x0003, 0x027e,
    0x0000, 0xffbb, 0x0000, 0xff27, 0x0000, 0xff27, 0x0000, 0xffb9,
    0x0005, 0x0000, 0x0000, 0xff25, 0x0065, 0x007b, 0x0079, 0x0293,
    0x0008, 0x012d, 0x0003, 0x019c, 0x0002, 0x037b, 0x002e, 0x0000,
    0x0000, 0xffda, 0x0000, 0xffdb, 0x0002, 0x03ad, 0x0012, 0x0060,
    0x000a, 0x0060, 0x0000, 0xffc0, 0x0000, 0xffc1, 0x0000, 0xffc1,
    0x0008, 0x0000, 0x0000, 0xfff8, 0x001a, 0x0118, 0x0000, 0x0007,
    0x0008, 0x018d, 0x0009, 0x0233, 0x0046, 0x0035, 0x0006, 0x0061,
    0x0000, 0xffb0, 0x000f, 0x0450, 0x0025, 0x010e, 0x000a, 0x036b,
    0x0032, 0x048b, 0x000e, 0x0100, 0x0000, 0xfff1, 0x0037, 0x048a,
    0x0026, 0x0465, 0x0034, 0x0000, 0x0000, 0xffd0, 0x0025, 0x0561,
    0x00de, 0x0293, 0x1714, 0x0587, 0x0000, 0x8a04, 0x0003, 0x0000,
    0x0000, 0x0ee6, 0x0087, 0x02ee, 0x0092, 0x1e01, 0x0069, 0x1df7,
    0x0000, 0x0008, 0x0007, 0x1f00, 0x0008, 0x0000, 0x000e, 0x1f02,
    0x0008, 0x1f0e, 0x0010, 0x1f06, 0x001a, 0x1f06, 0x0002, 0x1f0f,
    0x0007, 0x1f50, 0x0017, 0x1f19, 0x0000, 0x004a, 0x0000, 0x004a,
    0x0000, 0x0056, 0x0003, 0x1f72, 0x0000, 0x0064, 0x0000, 0x0064,
    0x0000, 0x0080, 0x0000, 0x0080, 0x0000, 0x0070, 0x0000, 0x0070,
    0x0000, 0x007e, 0x0000, 0x007e, 0x0028, 0x1f1e, 0x000c, 0x1f06,
    0x0000, 0x0000, 0x0000, 0x0009, 0x000f, 0x0000, 0x000d, 0x1fb3,
    0x000d, 0x1f44, 0x0008, 0x1fcd, 0x0006, 0x03f2, 0x0015, 0x1fbb,
    0x014e, 0x0587, 0x0000, 0xffe4, 0x0021, 0x0000, 0x0000, 0xfff0,
    0x000f, 0x2170, 0x000a, 0x0238, 0x0346, 0x0587, 0x0000, 0xffe6,
    0x0019, 0x24d0, 0x0746, 0x0587, 0x0026, 0x0561, 0x000b, 0x057e,
    0x0004, 0x012f, 0x0000, 0xd5d5, 0x0000, 0xd5d8, 0x000c, 0x022e,
    0x000e, 0x03f8, 0x006e, 0x1e33, 0x0011, 0x0000, 0x0000, 0xe3a0,
    0x0025, 0x2d00, 0x17f2, 0x0587, 0x6129, 0x2d26, 0x002e, 0x0201,
    0x002a, 0x1def, 0x0098, 0xa5b7, 0x0040, 0x1dff, 0x000e, 0x0368,
    0x000d, 0x022b, 0x034c, 0x2184, 0x5469, 0x2d26, 0x007f, 0x0061,
    0x0040, 0x0000,
];

fn upcase_table() -> &'static [u16; 65536] {
    static TABLE: OnceLock<Box<[u16; 65536]>> = OnceLock::new();
    let table: &Box<[u16; 65536]> = TABLE.get_or_init(|| {
        let mut table = vec![0u16; 65536];

        // Simple LZ decoder.
        let mut input = UPCASE_COMPRESSED.iter();
        let mut i = 0usize;
        while i < table.len() {
            let length = *input.next().unwrap_or(&0) as usize;
            let src_pos = *input.next().unwrap_or(&0) as usize;
            if length == 0 {
                table[i] = src_pos as u16;
                i += 1;
            } else {
                for k in 0..length {
                    table[i + k] = table[src_pos + k];
                }
                i += length;
            }
        }

        // Delta filter.
        for (i, v) in table.iter_mut().enumerate() {
            *v = v.wrapping_add(i as u16);
        }

        table.into_boxed_slice().try_into().expect("table has 65536 entries")
    });
    table
}

/// Upper-cases one UTF-16 code unit.
pub fn upcase_char(c: u16) -> u16 {
    upcase_table()[c as usize]
}

/// Compares UTF-16LE strings, case-insensitively when `ignore_case`.
///
/// This matches NTFS semantics: code units are compared through the
/// upper-case table, not through full Unicode case folding.
pub fn cmp_utf16le(s1: &[u16], s2: &[u16], ignore_case: bool) -> std::cmp::Ordering {
    if ignore_case {
        let table = upcase_table();
        for (&a, &b) in s1.iter().zip(s2.iter()) {
            let (ua, ub) = (table[a as usize], table[b as usize]);
            if ua != ub {
                return ua.cmp(&ub);
            }
        }
        s1.len().cmp(&s2.len())
    } else {
        s1.cmp(s2)
    }
}

/// Whether two UTF-16LE names are equal under case-insensitive comparison.
pub fn names_equal(s1: &[u16], s2: &[u16]) -> bool {
    cmp_utf16le(s1, s2, true) == std::cmp::Ordering::Equal
}

/// Encodes a Rust string as UTF-16 code units.
pub fn str_to_utf16(s: &str) -> Vec<u16> {
    s.encode_utf16().collect()
}

/// Decodes UTF-16 code units to a Rust string, replacing invalid sequences.
pub fn utf16_to_string(units: &[u16]) -> String {
    String::from_utf16_lossy(units)
}

/// Serializes UTF-16 code units to little-endian bytes.
pub fn utf16_to_le_bytes(units: &[u16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(units.len() * 2);
    for &u in units {
        out.extend_from_slice(&u.to_le_bytes());
    }
    out
}

/// Parses little-endian bytes into UTF-16 code units.
pub fn utf16_from_le_bytes(bytes: &[u8]) -> Vec<u16> {
    bytes
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ascii_upcasing() {
        assert_eq!(upcase_char(b'a' as u16), b'A' as u16);
        assert_eq!(upcase_char(b'z' as u16), b'Z' as u16);
        assert_eq!(upcase_char(b'A' as u16), b'A' as u16);
        assert_eq!(upcase_char(b'0' as u16), b'0' as u16);
    }

    #[test]
    fn latin1_upcasing() {
        // U+00E9 é -> U+00C9 É
        assert_eq!(upcase_char(0x00e9), 0x00c9);
        // U+00FF ÿ -> U+0178 Ÿ
        assert_eq!(upcase_char(0x00ff), 0x0178);
    }

    #[test]
    fn case_insensitive_name_compare() {
        let a = str_to_utf16("Windows");
        let b = str_to_utf16("WINDOWS");
        let c = str_to_utf16("windows2");
        assert!(names_equal(&a, &b));
        assert!(!names_equal(&a, &c));
        assert_eq!(cmp_utf16le(&a, &b, false), std::cmp::Ordering::Greater);
    }

    #[test]
    fn utf16_byte_roundtrip() {
        let units = str_to_utf16("sub/ünïcode.txt");
        let bytes = utf16_to_le_bytes(&units);
        assert_eq!(utf16_from_le_bytes(&bytes), units);
    }
}
