//! The error type for WIM operations.

use std::path::PathBuf;

/// Errors surfaced by this crate.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum WimError {
    /// The file's magic, header size, or version field is wrong.
    #[error("not a valid WIM file: {0}")]
    InvalidHeader(String),

    /// The header declares a chunk size the codecs do not support.
    #[error("unsupported chunk size {0}")]
    InvalidChunkSize(u32),

    /// The header or a solid resource declares an unknown compression type.
    #[error("unsupported compression type (code {0})")]
    InvalidCompressionType(u32),

    /// An integrity-table chunk digest does not match the file contents.
    #[error("integrity check failed in chunk {chunk} of {num_chunks}")]
    IntegrityMismatch {
        /// Index of the first mismatching chunk.
        chunk: u32,
        /// Total chunks covered by the integrity table.
        num_chunks: u32,
    },

    /// A blob decoded to bytes whose SHA-1 differs from its declared hash.
    #[error("blob data is corrupted (SHA-1 mismatch)")]
    InvalidResourceHash,

    /// A hash referenced by an image is absent from the blob table.
    #[error("a required blob is not present in the archive")]
    ResourceNotFound,

    /// A compressed resource contains an invalid bitstream.
    #[error("a compressed resource is invalid and cannot be decompressed")]
    DecompressionError,

    /// A read extended past a declared size or the end of the file.
    #[error("unexpected end of data")]
    UnexpectedEof,

    /// Resources overlap or sit past the in-place append point. The
    /// overwrite path catches this internally and falls back to a full
    /// rebuild.
    #[error("resources are not in the expected order for an in-place write")]
    ResourceOrder,

    /// Another process holds the advisory lock on the WIM file.
    #[error("the WIM file is locked by another process")]
    AlreadyLocked,

    /// The archive is flagged read-only and the override was not given.
    #[error("the WIM file is marked read-only")]
    WimIsReadonly,

    /// A split part set has a GUID mismatch, a missing part, or a duplicate.
    #[error("invalid split WIM part set: {0}")]
    SplitInvalid(String),

    /// The operation cannot be applied to a split WIM part.
    #[error("operation not supported on a split WIM part")]
    SplitUnsupported,

    /// An image name is already taken.
    #[error("an image named \"{0}\" already exists")]
    ImageNameCollision(String),

    /// The image index is out of range or otherwise invalid.
    #[error("no such image: {0}")]
    InvalidImage(u32),

    /// Image metadata failed to parse.
    #[error("image metadata is invalid: {0}")]
    InvalidMetadata(String),

    /// A progress sink requested cancellation.
    #[error("operation aborted by the caller")]
    Aborted,

    /// A memory allocation failed.
    #[error("out of memory")]
    Nomem,

    /// An underlying I/O operation failed.
    #[error("I/O error{}: {source}", path.as_ref().map(|p| format!(" on {}", p.display())).unwrap_or_default())]
    Io {
        /// The file involved, when known.
        path: Option<PathBuf>,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },
}

impl From<std::io::Error> for WimError {
    fn from(source: std::io::Error) -> Self {
        Self::Io { path: None, source }
    }
}

impl From<wimcodec::CodecError> for WimError {
    fn from(e: wimcodec::CodecError) -> Self {
        match e {
            wimcodec::CodecError::UnsupportedType(code) => Self::InvalidCompressionType(code),
            wimcodec::CodecError::InvalidChunkSize(size) => Self::InvalidChunkSize(size),
            wimcodec::CodecError::Corrupt => Self::DecompressionError,
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, WimError>;
