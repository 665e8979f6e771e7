//! SHA-1 digests, the content identity of every blob.

use sha1::{Digest, Sha1};

/// A 20-byte SHA-1 message digest.
pub type Sha1Hash = [u8; 20];

/// The all-zero hash, a sentinel meaning "empty / no stream".
pub const ZERO_HASH: Sha1Hash = [0; 20];

/// Hashes an in-memory buffer.
pub fn sha1_buffer(data: &[u8]) -> Sha1Hash {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Incremental SHA-1 over streamed data.
pub struct Sha1Stream {
    hasher: Sha1,
}

impl Sha1Stream {
    /// Starts a new digest.
    pub fn new() -> Self {
        Self { hasher: Sha1::new() }
    }

    /// Feeds more bytes.
    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    /// Finishes and returns the digest.
    pub fn finish(self) -> Sha1Hash {
        self.hasher.finalize().into()
    }
}

impl Default for Sha1Stream {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_digest() {
        // SHA-1("abc")
        assert_eq!(
            sha1_buffer(b"abc"),
            [
                0xa9, 0x99, 0x3e, 0x36, 0x47, 0x06, 0x81, 0x6a, 0xba, 0x3e, 0x25, 0x71, 0x78,
                0x50, 0xc2, 0x6c, 0x9c, 0xd0, 0xd8, 0x9d
            ]
        );
    }

    #[test]
    fn streaming_matches_buffered() {
        let data = vec![7u8; 100_000];
        let mut s = Sha1Stream::new();
        for chunk in data.chunks(13) {
            s.update(chunk);
        }
        assert_eq!(s.finish(), sha1_buffer(&data));
    }
}
