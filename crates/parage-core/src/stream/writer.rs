//! Plaintext to ciphertext pipeline.
//!
//! The caller's thread accumulates plaintext into a chunk buffer and
//! dispatches full chunks to the seal workers. A dedicated serializer thread
//! receives sealed chunks in dispatch order and writes them to the sink, so
//! ciphertext byte order matches plaintext byte order regardless of which
//! worker finishes first.

use std::io::{self, Write};
use std::mem;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use aead::AeadInPlace;
use chacha20poly1305::Nonce;
use crossbeam_channel::{Receiver, Sender, bounded};
use tracing::{debug, trace, warn};

use super::nonce::ChunkNonce;
use super::pool::{BufferPool, Job, JobPool};
use super::{
    CHUNK_SIZE, PayloadAead, PayloadKey, StickyError, StreamError, resolve_concurrency,
};

/// One chunk handed to the seal workers.
struct SealJob {
    /// Plaintext, sealed in place; the tag is appended by the worker.
    buffer: Vec<u8>,
    /// Counter value captured at dispatch.
    nonce: ChunkNonce,
    /// Set exactly once, on the final chunk.
    last: bool,
    slot: Job<Vec<u8>>,
}

/// Writes one age payload stream, sealing chunks on a pool of worker
/// threads.
///
/// Plaintext written here comes out of `sink` as ciphertext in the exact
/// serial STREAM format; the chunk nonces are deterministic, so the output
/// is bit-identical regardless of the worker count.
///
/// You **must** call [`StreamWriter::finish`] when done writing. The final
/// chunk can only be sealed once the end of the input is known, so dropping
/// the writer without finishing produces a truncated stream that will fail
/// to decrypt.
pub struct StreamWriter<W: Write + Send + 'static> {
    nonce: ChunkNonce,
    /// Accumulates plaintext until a full chunk is ready.
    in_buffer: Vec<u8>,
    todo_tx: Option<Sender<SealJob>>,
    ordered_tx: Option<Sender<Receiver<Vec<u8>>>>,
    buffers: BufferPool,
    jobs: JobPool<Vec<u8>>,
    sink_error: StickyError,
    workers: Vec<JoinHandle<()>>,
    serializer: Option<JoinHandle<W>>,
}

impl<W: Write + Send + 'static> StreamWriter<W> {
    /// Starts an encryption pipeline writing to `sink`.
    ///
    /// `concurrency` is the number of seal workers; `0` means one per
    /// logical CPU.
    #[must_use]
    pub fn encrypt(key: PayloadKey, sink: W, concurrency: usize) -> Self {
        Self::from_aead(key.into_aead(), sink, concurrency)
    }

    /// Starts an encryption pipeline on an already-keyed AEAD instance.
    #[must_use]
    pub fn from_aead(aead: PayloadAead, sink: W, concurrency: usize) -> Self {
        let worker_count = resolve_concurrency(concurrency);
        let aead = Arc::new(aead);

        let (todo_tx, todo_rx) = bounded::<SealJob>(worker_count);
        let (ordered_tx, ordered_rx) = bounded::<Receiver<Vec<u8>>>(worker_count);
        // One buffer per worker plus the accumulator held in hand.
        let buffers = BufferPool::new(worker_count + 1);
        let jobs = JobPool::new(worker_count);
        let sink_error = StickyError::default();

        let mut workers = Vec::with_capacity(worker_count);
        for worker_id in 0..worker_count {
            let aead = Arc::clone(&aead);
            let todo = todo_rx.clone();
            let jobs = jobs.clone();
            let handle = thread::Builder::new()
                .name(format!("seal-worker-{worker_id}"))
                .spawn(move || seal_worker(worker_id, &aead, &todo, &jobs))
                .expect("failed to spawn seal worker thread");
            workers.push(handle);
        }

        let serializer = {
            let buffers = buffers.clone();
            let sink_error = sink_error.clone();
            thread::Builder::new()
                .name("seal-serializer".into())
                .spawn(move || run_serializer(sink, &ordered_rx, &buffers, &sink_error))
                .expect("failed to spawn serializer thread")
        };

        debug!(workers = worker_count, "stream writer pipeline started");

        let in_buffer = buffers.take();
        Self {
            nonce: ChunkNonce::new(),
            in_buffer,
            todo_tx: Some(todo_tx),
            ordered_tx: Some(ordered_tx),
            buffers,
            jobs,
            sink_error,
            workers,
            serializer: Some(serializer),
        }
    }

    /// Seals and flushes the final chunk, waits for every in-flight chunk to
    /// reach the sink, and hands the sink back.
    ///
    /// The final chunk holds whatever plaintext is still accumulated: a full
    /// chunk when the stream length is an exact nonzero multiple of
    /// [`CHUNK_SIZE`], and zero bytes only for the empty stream. Returns the
    /// first sink error observed by the serializer, if any.
    pub fn finish(mut self) -> Result<W, StreamError> {
        self.dispatch(true)?;
        self.shutdown();

        let handle = self
            .serializer
            .take()
            .expect("serializer thread runs until finish");
        let sink = match handle.join() {
            Ok(sink) => sink,
            Err(panic) => std::panic::resume_unwind(panic),
        };

        match self.sink_error.get() {
            Some(error) => Err(error),
            None => Ok(sink),
        }
    }

    /// Dispatches the accumulated chunk. Non-last dispatches replace the
    /// accumulator from the buffer pool and advance the counter.
    fn dispatch(&mut self, last: bool) -> Result<(), StreamError> {
        let slot = self.jobs.take();
        let ordered_tx = self.ordered_tx.as_ref().ok_or_else(pipeline_gone)?;
        let todo_tx = self.todo_tx.as_ref().ok_or_else(pipeline_gone)?;

        // The result slot enters the ordered queue before any worker sees
        // the job; delivery order is therefore dispatch order.
        ordered_tx
            .send(slot.result_rx.clone())
            .map_err(|_| pipeline_gone())?;

        let buffer = mem::take(&mut self.in_buffer);
        trace!(chunk_len = buffer.len(), last, "dispatching chunk");
        todo_tx
            .send(SealJob {
                buffer,
                nonce: self.nonce,
                last,
                slot,
            })
            .map_err(|_| pipeline_gone())?;

        if !last {
            self.nonce.increment();
            self.in_buffer = self.buffers.take();
        }
        Ok(())
    }

    /// Closes the dispatch channels and waits for the workers.
    fn shutdown(&mut self) {
        // Closing todo stops the workers; closing the ordered queue lets
        // the serializer exit once it has drained every dispatched chunk.
        self.todo_tx = None;
        self.ordered_tx = None;
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl<W: Write + Send + 'static> Write for StreamWriter<W> {
    /// Accepts the whole of `buf`; on success `n == buf.len()`.
    ///
    /// Fails only when a previously dispatched chunk failed to reach the
    /// sink. Plaintext accepted before that point may still be buffered in
    /// the pipeline.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if let Some(error) = self.sink_error.get() {
            return Err(error.into());
        }

        let mut rest = buf;
        while !rest.is_empty() {
            // A full accumulator is sealed lazily, only once more input
            // shows up: if the stream ends here, this chunk is the final
            // one and must carry the last-chunk flag instead.
            if self.in_buffer.len() == CHUNK_SIZE {
                self.dispatch(false).map_err(io::Error::from)?;
            }
            let room = CHUNK_SIZE - self.in_buffer.len();
            let take = room.min(rest.len());
            self.in_buffer.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
        }
        Ok(buf.len())
    }

    /// Flushes nothing: chunks already dispatched reach the sink as the
    /// serializer writes them, and the partial chunk in hand cannot be
    /// sealed until the end of the stream is known. Use
    /// [`StreamWriter::finish`] to flush everything.
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<W: Write + Send + 'static> Drop for StreamWriter<W> {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(handle) = self.serializer.take() {
            // Finish was never called: the stream is abandoned and the
            // output is not decryptable, but the sink still gets every
            // chunk that was dispatched.
            let _ = handle.join();
        }
    }
}

fn pipeline_gone() -> StreamError {
    StreamError::SinkIo(io::Error::new(
        io::ErrorKind::BrokenPipe,
        "stream pipeline shut down",
    ))
}

/// Seals chunks until the todo channel closes.
fn seal_worker(
    worker_id: usize,
    aead: &PayloadAead,
    todo: &Receiver<SealJob>,
    jobs: &JobPool<Vec<u8>>,
) {
    trace!(worker_id, "seal worker started");
    while let Ok(job) = todo.recv() {
        let SealJob {
            mut buffer,
            nonce,
            last,
            slot,
        } = job;

        let mut nonce = nonce;
        if last {
            nonce.set_last();
        }

        aead.encrypt_in_place(Nonce::from_slice(nonce.as_bytes()), b"", &mut buffer)
            .expect("sealing a chunk-sized buffer cannot fail");

        // The slot keeps its own receiver alive, so this only blocks while
        // an earlier result from a reused job awaits the serializer.
        let _ = slot.result_tx.send(buffer);
        jobs.put(slot);
    }
    trace!(worker_id, "seal worker exiting");
}

/// Writes sealed chunks to the sink in dispatch order.
///
/// A sink error is recorded once and the remaining chunks are drained
/// without writing, so workers never block on a dead sink.
fn run_serializer<W: Write>(
    mut sink: W,
    ordered: &Receiver<Receiver<Vec<u8>>>,
    buffers: &BufferPool,
    sink_error: &StickyError,
) -> W {
    while let Ok(slot) = ordered.recv() {
        let Ok(buffer) = slot.recv() else {
            // A worker died before publishing; nothing more will arrive
            // on this slot.
            break;
        };
        if !sink_error.is_set() {
            if let Err(error) = sink.write_all(&buffer) {
                warn!(error = %error, "sink write failed, draining remaining chunks");
                sink_error.set(StreamError::SinkIo(error));
            }
        }
        buffers.put(buffer);
    }
    sink
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::TAG_SIZE;

    fn key() -> PayloadKey {
        PayloadKey::new([7; 32])
    }

    #[test]
    fn empty_stream_is_a_single_tag() {
        let writer = StreamWriter::encrypt(key(), Vec::new(), 2);
        let ciphertext = writer.finish().unwrap();
        assert_eq!(ciphertext.len(), TAG_SIZE);
    }

    #[test]
    fn write_never_short_writes() {
        let mut writer = StreamWriter::encrypt(key(), Vec::new(), 2);
        let data = vec![0xA5; CHUNK_SIZE * 2 + 123];
        assert_eq!(writer.write(&data).unwrap(), data.len());

        // Two full chunks plus the short final chunk.
        let ciphertext = writer.finish().unwrap();
        assert_eq!(ciphertext.len(), data.len() + 3 * TAG_SIZE);
    }

    #[test]
    fn exact_multiple_seals_the_full_chunk_as_last() {
        let mut writer = StreamWriter::encrypt(key(), Vec::new(), 4);
        writer.write_all(&vec![1; 2 * CHUNK_SIZE]).unwrap();
        let ciphertext = writer.finish().unwrap();
        // No empty trailing chunk: two chunks, two tags.
        assert_eq!(ciphertext.len(), 2 * CHUNK_SIZE + 2 * TAG_SIZE);
    }

    #[test]
    fn sink_error_surfaces_at_finish() {
        struct FailingSink;
        impl Write for FailingSink {
            fn write(&mut self, _: &[u8]) -> io::Result<usize> {
                Err(io::Error::other("disk full"))
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let mut writer = StreamWriter::encrypt(key(), FailingSink, 2);
        // Enough data to force dispatch of at least one chunk.
        let _ = writer.write(&vec![0; CHUNK_SIZE + 1]);
        assert!(matches!(writer.finish(), Err(StreamError::SinkIo(_))));
    }

    #[test]
    fn dropping_without_finish_does_not_hang() {
        let mut writer = StreamWriter::encrypt(key(), Vec::new(), 2);
        writer.write_all(&vec![9; CHUNK_SIZE * 3 + 17]).unwrap();
        drop(writer);
    }
}
