//! Progress reporting and cancellation.
//!
//! Long-running operations report typed events to a caller-provided sink.
//! The sink's return value doubles as the cancellation signal: returning
//! `ControlFlow::Break(())` aborts the operation at its next safe point
//! (between blobs during a write, between chunks during a read), after
//! which any partial output is rolled back and the operation returns
//! [`crate::WimError::Aborted`].

use std::ops::ControlFlow;
use std::path::Path;

/// A progress event, tagged with numeric counters.
#[derive(Debug)]
#[non_exhaustive]
pub enum ProgressEvent<'a> {
    /// Blob data is being written.
    WriteStreams {
        /// Uncompressed bytes written so far.
        completed_bytes: u64,
        /// Total uncompressed bytes to write.
        total_bytes: u64,
        /// Blobs fully written so far.
        completed_blobs: u64,
        /// Total blobs to write.
        total_blobs: u64,
    },
    /// Image metadata is being written.
    WriteMetadata {
        /// Images written so far.
        completed_images: u32,
        /// Total images to write.
        total_images: u32,
    },
    /// The integrity table is being computed.
    CalcIntegrity {
        /// Bytes hashed so far.
        completed_bytes: u64,
        /// Total bytes to hash.
        total_bytes: u64,
    },
    /// The integrity table is being verified.
    VerifyIntegrity {
        /// Bytes hashed so far.
        completed_bytes: u64,
        /// Total bytes to hash.
        total_bytes: u64,
    },
    /// A split part was started.
    SplitBeginPart {
        /// 1-based part number.
        part_number: u16,
        /// Bytes assigned to this part so far.
        part_bytes: u64,
    },
    /// A split part was finished.
    SplitEndPart {
        /// 1-based part number.
        part_number: u16,
    },
    /// A temporary file is about to be renamed over the original.
    Rename {
        /// Temporary path.
        from: &'a Path,
        /// Final path.
        to: &'a Path,
    },
}

/// Receives progress events; the return value is the cancellation signal.
pub trait ProgressSink {
    /// Reports one event. `Break` cancels the enclosing operation at its
    /// next safe point.
    fn progress(&mut self, event: ProgressEvent<'_>) -> ControlFlow<()>;
}

/// The no-op sink: reports nothing, never cancels.
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn progress(&mut self, _event: ProgressEvent<'_>) -> ControlFlow<()> {
        ControlFlow::Continue(())
    }
}

impl<F> ProgressSink for F
where
    F: FnMut(ProgressEvent<'_>) -> ControlFlow<()>,
{
    fn progress(&mut self, event: ProgressEvent<'_>) -> ControlFlow<()> {
        self(event)
    }
}

/// Maps a sink verdict to a `Result` for use with `?` at safe points.
pub(crate) fn check(verdict: ControlFlow<()>) -> crate::error::Result<()> {
    match verdict {
        ControlFlow::Continue(()) => Ok(()),
        ControlFlow::Break(()) => Err(crate::error::WimError::Aborted),
    }
}
