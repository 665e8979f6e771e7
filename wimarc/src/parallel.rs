//! The parallel chunk compressor: a bounded pipeline between the single
//! writer thread and a pool of codec workers.
//!
//! Three bounded queues move buffers through the pipeline: *free* holds
//! empty chunk buffers, *ready* holds filled buffers tagged with sequence
//! numbers, and *completed* carries each worker's output back. The caller
//! pulls results strictly in submission order; out-of-order completions
//! wait in a small reorder buffer. That ordering is what lets the resource
//! writer build the chunk offset table incrementally.
//!
//! Small jobs skip the threads entirely: below a work threshold (or if
//! worker spawning fails) a serial backend compresses inline behind the
//! same interface.

use std::collections::BTreeMap;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Receiver, Sender};
use tracing::{debug, warn};

use crate::error::Result;
use wimcodec::{CompressionType, Compressor};

/// Jobs smaller than this compress inline on the caller's thread.
const SERIAL_THRESHOLD: u64 = 2 << 20;

/// One chunk moving through the pipeline.
struct ReadyChunk {
    seq: u64,
    data: Vec<u8>,
}

/// A finished chunk: the original bytes plus the compressed form, when the
/// compressed form is smaller.
pub struct ChunkResult {
    /// Sequence number assigned at submission.
    pub seq: u64,
    /// The uncompressed chunk contents.
    pub data: Vec<u8>,
    /// Compressed bytes, or `None` when the chunk must be stored raw.
    pub compressed: Option<Vec<u8>>,
}

enum Backend {
    Serial {
        compressor: Option<Compressor>,
        pending: std::collections::VecDeque<ChunkResult>,
    },
    Threaded {
        free_tx: Sender<Vec<u8>>,
        free_rx: Receiver<Vec<u8>>,
        ready_tx: Option<Sender<ReadyChunk>>,
        completed_rx: Receiver<ChunkResult>,
        workers: Vec<JoinHandle<()>>,
        reorder: BTreeMap<u64, ChunkResult>,
        in_flight: u64,
    },
}

/// Compresses fixed-size chunks on worker threads, preserving submission
/// order on the output side.
///
/// The caller must keep [`ChunkPipeline::outstanding`] below
/// [`ChunkPipeline::capacity`] by retrieving results; the completed queue
/// is sized for exactly that many results, which is what keeps the workers
/// from ever blocking indefinitely.
pub struct ChunkPipeline {
    ctype: CompressionType,
    chunk_size: u32,
    capacity: usize,
    next_seq: u64,
    next_result: u64,
    backend: Backend,
}

impl ChunkPipeline {
    /// Creates a pipeline for `ctype`/`chunk_size`.
    ///
    /// `num_threads` of 0 uses one worker per logical CPU.
    /// `estimated_work` is the total number of uncompressed bytes expected;
    /// small estimates select the serial backend.
    pub fn new(
        ctype: CompressionType,
        chunk_size: u32,
        num_threads: usize,
        estimated_work: u64,
    ) -> Result<Self> {
        let num_threads = if num_threads == 0 {
            num_cpus::get()
        } else {
            num_threads
        };

        let backend = if ctype == CompressionType::None
            || estimated_work < SERIAL_THRESHOLD
            || num_threads <= 1
        {
            Self::serial_backend(ctype, chunk_size)?
        } else {
            match Self::threaded_backend(ctype, chunk_size, num_threads) {
                Ok(b) => b,
                Err(e) => {
                    warn!(error = %e, "falling back to serial compression");
                    Self::serial_backend(ctype, chunk_size)?
                }
            }
        };
        let capacity = match &backend {
            Backend::Serial { .. } => usize::MAX,
            Backend::Threaded { .. } => num_threads * 2 + 2,
        };

        Ok(Self {
            ctype,
            chunk_size,
            capacity,
            next_seq: 0,
            next_result: 0,
            backend,
        })
    }

    fn serial_backend(ctype: CompressionType, chunk_size: u32) -> Result<Backend> {
        let compressor = if ctype == CompressionType::None {
            None
        } else {
            Some(Compressor::new(ctype, chunk_size)?)
        };
        Ok(Backend::Serial {
            compressor,
            pending: std::collections::VecDeque::new(),
        })
    }

    fn threaded_backend(
        ctype: CompressionType,
        chunk_size: u32,
        num_threads: usize,
    ) -> std::io::Result<Backend> {
        let num_buffers = num_threads * 2 + 2;
        let (free_tx, free_rx) = bounded(num_buffers);
        let (ready_tx, ready_rx) = bounded::<ReadyChunk>(num_buffers);
        let (completed_tx, completed_rx) = bounded::<ChunkResult>(num_buffers);

        for _ in 0..num_buffers {
            free_tx
                .send(Vec::with_capacity(chunk_size as usize))
                .expect("fresh channel cannot be disconnected");
        }

        let mut workers = Vec::with_capacity(num_threads);
        for worker_index in 0..num_threads {
            let ready_rx = ready_rx.clone();
            let completed_tx = completed_tx.clone();
            let mut compressor = Compressor::new(ctype, chunk_size)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
            let handle = std::thread::Builder::new()
                .name(format!("wim-compress-{worker_index}"))
                .spawn(move || {
                    for chunk in ready_rx.iter() {
                        let mut out = vec![0u8; chunk.data.len()];
                        let compressed = compressor
                            .compress(&chunk.data, 0, &mut out)
                            .map(|n| {
                                out.truncate(n);
                                out
                            });
                        let result = ChunkResult {
                            seq: chunk.seq,
                            data: chunk.data,
                            compressed,
                        };
                        if completed_tx.send(result).is_err() {
                            // The consumer is gone (cancellation); drop the
                            // remaining work.
                            break;
                        }
                    }
                })?;
            workers.push(handle);
        }
        debug!(num_threads, num_buffers, "started compression workers");

        Ok(Backend::Threaded {
            free_tx,
            free_rx,
            ready_tx: Some(ready_tx),
            completed_rx,
            workers,
            reorder: BTreeMap::new(),
            in_flight: 0,
        })
    }

    /// The chunk size this pipeline was built for.
    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    /// The compression format this pipeline applies.
    pub fn compression_type(&self) -> CompressionType {
        self.ctype
    }

    /// How many submissions may be outstanding before the caller must
    /// retrieve a result.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Chunks submitted but not yet retrieved.
    pub fn outstanding(&self) -> u64 {
        self.next_seq - self.next_result
    }

    /// Obtains an empty chunk buffer, recycled when one is available.
    ///
    /// The caller must have retrieved enough results to keep
    /// [`Self::outstanding`] below [`Self::capacity`].
    pub fn get_chunk_buffer(&mut self) -> Vec<u8> {
        debug_assert!((self.outstanding() as usize) < self.capacity);
        match &mut self.backend {
            Backend::Serial { .. } => Vec::with_capacity(self.chunk_size as usize),
            Backend::Threaded { free_rx, .. } => match free_rx.try_recv() {
                Ok(mut buf) => {
                    buf.clear();
                    buf
                }
                Err(_) => Vec::with_capacity(self.chunk_size as usize),
            },
        }
    }

    /// Submits a filled buffer; its contents are `buf[..len]`.
    pub fn signal_chunk_filled(&mut self, mut buf: Vec<u8>, len: usize) {
        buf.truncate(len);
        debug_assert!(len <= self.chunk_size as usize && len > 0);
        let seq = self.next_seq;
        self.next_seq += 1;

        match &mut self.backend {
            Backend::Serial {
                compressor,
                pending,
            } => {
                let compressed = compressor.as_mut().and_then(|c| {
                    let mut out = vec![0u8; buf.len()];
                    c.compress(&buf, 0, &mut out).map(|n| {
                        out.truncate(n);
                        out
                    })
                });
                pending.push_back(ChunkResult {
                    seq,
                    data: buf,
                    compressed,
                });
            }
            Backend::Threaded {
                ready_tx,
                in_flight,
                ..
            } => {
                let tx = ready_tx.as_ref().expect("pipeline not shut down");
                if tx.send(ReadyChunk { seq, data: buf }).is_ok() {
                    *in_flight += 1;
                }
            }
        }
    }

    /// Returns the next result in submission order, blocking as needed.
    /// Returns `None` when every submitted chunk has been retrieved.
    pub fn get_compression_result(&mut self) -> Option<ChunkResult> {
        if self.next_result == self.next_seq {
            return None;
        }
        let want = self.next_result;
        self.next_result += 1;

        match &mut self.backend {
            Backend::Serial { pending, .. } => {
                let result = pending.pop_front();
                debug_assert!(result.as_ref().is_some_and(|r| r.seq == want));
                result
            }
            Backend::Threaded {
                completed_rx,
                reorder,
                in_flight,
                ..
            } => loop {
                if let Some(result) = reorder.remove(&want) {
                    return Some(result);
                }
                match completed_rx.recv() {
                    Ok(result) => {
                        *in_flight -= 1;
                        if result.seq == want {
                            return Some(result);
                        }
                        reorder.insert(result.seq, result);
                    }
                    Err(_) => return None,
                }
            },
        }
    }

    /// Returns a consumed buffer to the free queue.
    pub fn recycle_buffer(&mut self, buf: Vec<u8>) {
        if let Backend::Threaded { free_tx, .. } = &self.backend {
            let _ = free_tx.try_send(buf);
        }
    }
}

impl Drop for ChunkPipeline {
    fn drop(&mut self) {
        if let Backend::Threaded {
            ready_tx,
            completed_rx,
            workers,
            in_flight,
            ..
        } = &mut self.backend
        {
            // Close the ready queue so workers drain and exit, then unblock
            // any worker stuck sending a completion.
            drop(ready_tx.take());
            while *in_flight > 0 {
                if completed_rx.recv().is_err() {
                    break;
                }
                *in_flight -= 1;
            }
            for handle in workers.drain(..) {
                let _ = handle.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_pipeline(num_threads: usize, num_chunks: usize, chunk_size: u32) {
        let mut pipeline = ChunkPipeline::new(
            CompressionType::Xpress,
            chunk_size,
            num_threads,
            num_chunks as u64 * chunk_size as u64,
        )
        .unwrap();

        let mut submitted = Vec::new();
        let mut results = Vec::new();
        for i in 0..num_chunks {
            while pipeline.outstanding() as usize >= pipeline.capacity() {
                let r = pipeline.get_compression_result().unwrap();
                results.push(r);
            }
            let mut buf = pipeline.get_chunk_buffer();
            buf.resize(chunk_size as usize, (i % 251) as u8);
            submitted.push(buf.clone());
            pipeline.signal_chunk_filled(buf, chunk_size as usize);
        }
        while let Some(r) = pipeline.get_compression_result() {
            results.push(r);
        }

        assert_eq!(results.len(), num_chunks);
        for (i, r) in results.iter().enumerate() {
            // The ordering guarantee: results come back in submission order.
            assert_eq!(r.seq, i as u64);
            assert_eq!(r.data, submitted[i]);
            let data = r.data.clone();
            pipeline.recycle_buffer(data);
        }
    }

    #[test]
    fn serial_fallback_preserves_order() {
        run_pipeline(1, 10, 4096);
    }

    #[test]
    fn threaded_preserves_order() {
        // Enough work to clear the serial threshold.
        run_pipeline(4, 200, 32768);
    }

    #[test]
    fn default_thread_count() {
        run_pipeline(0, 100, 32768);
    }

    #[test]
    fn drop_mid_stream_joins_cleanly() {
        let mut pipeline =
            ChunkPipeline::new(CompressionType::Xpress, 32768, 4, u64::MAX).unwrap();
        let limit = pipeline.capacity().min(8);
        for i in 0..limit {
            let mut buf = pipeline.get_chunk_buffer();
            buf.resize(32768, i as u8);
            pipeline.signal_chunk_filled(buf, 32768);
        }
        // Dropping without draining must not hang or panic.
        drop(pipeline);
    }
}
