//! The optional integrity table: SHA-1 digests over 10 MiB chunks of the
//! byte range from the end of the header to the end of the blob table.

use std::sync::Arc;

use sync_file::{RandomAccessFile, ReadAt};
use tracing::debug;

use crate::error::{Result, WimError};
use crate::header::HEADER_SIZE;
use crate::progress::{check, ProgressEvent, ProgressSink};
use crate::sha1::{sha1_buffer, Sha1Hash};

/// Chunk size covered by each digest.
pub const INTEGRITY_CHUNK_SIZE: u32 = 10_485_760;

/// An integrity table in memory.
#[derive(Clone, Debug, Default)]
pub struct IntegrityTable {
    /// Length of the covered byte range (from end of header).
    pub total_length: u64,
    /// Digests of consecutive [`INTEGRITY_CHUNK_SIZE`] chunks.
    pub hashes: Vec<Sha1Hash>,
}

impl IntegrityTable {
    /// Parses the uncompressed content of an integrity-table resource.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 12 {
            return Err(WimError::UnexpectedEof);
        }
        let total_length =
            u32::from_le_bytes(bytes[0..4].try_into().expect("4-byte slice")) as u64;
        let chunk_size = u32::from_le_bytes(bytes[4..8].try_into().expect("4-byte slice"));
        let num_chunks = u32::from_le_bytes(bytes[8..12].try_into().expect("4-byte slice")) as usize;
        if chunk_size != INTEGRITY_CHUNK_SIZE {
            return Err(WimError::InvalidChunkSize(chunk_size));
        }
        if bytes.len() < 12 + num_chunks * 20 {
            return Err(WimError::UnexpectedEof);
        }
        let mut hashes = Vec::with_capacity(num_chunks);
        for i in 0..num_chunks {
            let off = 12 + i * 20;
            hashes.push(bytes[off..off + 20].try_into().expect("20-byte slice"));
        }
        Ok(Self {
            total_length,
            hashes,
        })
    }

    /// Serializes to the resource's uncompressed content.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(12 + self.hashes.len() * 20);
        out.extend_from_slice(&(self.total_length as u32).to_le_bytes());
        out.extend_from_slice(&INTEGRITY_CHUNK_SIZE.to_le_bytes());
        out.extend_from_slice(&(self.hashes.len() as u32).to_le_bytes());
        for h in &self.hashes {
            out.extend_from_slice(h);
        }
        out
    }

    /// Verifies the covered range of `file`, reporting progress per chunk.
    pub fn verify(
        &self,
        file: &Arc<RandomAccessFile>,
        progress: &mut dyn ProgressSink,
    ) -> Result<()> {
        let computed = compute_hashes(
            file,
            HEADER_SIZE as u64,
            self.total_length,
            progress,
            /* verifying= */ true,
        )?;
        if computed.len() != self.hashes.len() {
            return Err(WimError::IntegrityMismatch {
                chunk: 0,
                num_chunks: self.hashes.len() as u32,
            });
        }
        for (i, (a, b)) in computed.iter().zip(self.hashes.iter()).enumerate() {
            if a != b {
                debug!(chunk = i, "integrity digest mismatch");
                return Err(WimError::IntegrityMismatch {
                    chunk: i as u32,
                    num_chunks: self.hashes.len() as u32,
                });
            }
        }
        Ok(())
    }

    /// Builds the table covering `[HEADER_SIZE, end_of_blob_table)` of
    /// `file`. When `old` is given (an append), chunk digests that lie
    /// entirely below the old table's coverage are reused rather than
    /// rehashed.
    pub fn build(
        file: &Arc<RandomAccessFile>,
        end_of_blob_table: u64,
        old: Option<&IntegrityTable>,
        progress: &mut dyn ProgressSink,
    ) -> Result<Self> {
        let total_length = end_of_blob_table - HEADER_SIZE as u64;
        let num_chunks = total_length.div_ceil(INTEGRITY_CHUNK_SIZE as u64) as usize;

        let reusable = match old {
            // Only whole chunks strictly inside the old coverage kept their
            // bytes; the old final (possibly partial) chunk is rehashed.
            Some(old) if old.total_length <= total_length => {
                let old_whole = (old.total_length / INTEGRITY_CHUNK_SIZE as u64) as usize;
                old_whole.min(old.hashes.len()).min(num_chunks)
            }
            _ => 0,
        };

        let mut hashes = Vec::with_capacity(num_chunks);
        if let Some(old) = old {
            hashes.extend_from_slice(&old.hashes[..reusable]);
        }
        debug!(num_chunks, reused = reusable, "building integrity table");

        let skip = reusable as u64 * INTEGRITY_CHUNK_SIZE as u64;
        let fresh = compute_hashes(
            file,
            HEADER_SIZE as u64 + skip,
            total_length - skip,
            progress,
            false,
        )?;
        hashes.extend(fresh);
        Ok(Self {
            total_length,
            hashes,
        })
    }
}

fn compute_hashes(
    file: &Arc<RandomAccessFile>,
    start: u64,
    length: u64,
    progress: &mut dyn ProgressSink,
    verifying: bool,
) -> Result<Vec<Sha1Hash>> {
    let mut hashes = Vec::new();
    let mut buf = vec![0u8; INTEGRITY_CHUNK_SIZE as usize];
    let mut done = 0u64;
    while done < length {
        let n = (length - done).min(INTEGRITY_CHUNK_SIZE as u64) as usize;
        file.read_exact_at(&mut buf[..n], start + done)
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::UnexpectedEof => WimError::UnexpectedEof,
                _ => WimError::from(e),
            })?;
        hashes.push(sha1_buffer(&buf[..n]));
        done += n as u64;

        let event = if verifying {
            ProgressEvent::VerifyIntegrity {
                completed_bytes: done,
                total_bytes: length,
            }
        } else {
            ProgressEvent::CalcIntegrity {
                completed_bytes: done,
                total_bytes: length,
            }
        };
        check(progress.progress(event))?;
    }
    Ok(hashes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialize_parse_roundtrip() {
        let table = IntegrityTable {
            total_length: 12345,
            hashes: vec![[1u8; 20], [2u8; 20]],
        };
        let bytes = table.serialize();
        assert_eq!(
            u32::from_le_bytes(bytes[4..8].try_into().unwrap()),
            INTEGRITY_CHUNK_SIZE
        );
        let parsed = IntegrityTable::parse(&bytes).unwrap();
        assert_eq!(parsed.total_length, 12345);
        assert_eq!(parsed.hashes, table.hashes);
    }

    #[test]
    fn wrong_chunk_size_rejected() {
        let mut bytes = IntegrityTable::default().serialize();
        bytes[4..8].copy_from_slice(&4096u32.to_le_bytes());
        assert!(IntegrityTable::parse(&bytes).is_err());
    }
}
