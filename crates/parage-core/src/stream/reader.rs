//! Ciphertext to plaintext pipeline.
//!
//! A pump thread performs fixed-size reads from the source and dispatches
//! ciphertext chunks to the open workers; the caller's own thread is the
//! delivery stage, receiving opened chunks in dispatch order through the
//! ordered queue.
//!
//! The format does not frame the final chunk: the last-chunk flag lives
//! inside the authenticated nonce. The pump marks a chunk as final when it
//! observes EOF through a short read; a final chunk of exactly
//! [`CHUNK_SIZE`](super::CHUNK_SIZE) plaintext looks like a middle chunk at
//! the pump, so a worker whose open fails under the middle-chunk nonce
//! retries once with the last-chunk flag set.

use std::io::{self, Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};

use aead::AeadInPlace;
use chacha20poly1305::Nonce;
use crossbeam_channel::{Receiver, Sender, bounded};
use tracing::{debug, trace, warn};

use super::nonce::ChunkNonce;
use super::pool::{BufferPool, Job, JobPool};
use super::{
    ENCRYPTED_CHUNK_SIZE, PayloadAead, PayloadKey, StickyError, StreamError, TAG_SIZE,
    resolve_concurrency,
};

/// Sentinel for "no final chunk observed yet".
const NO_FINAL_CHUNK: u64 = u64::MAX;

/// One ciphertext chunk handed to the open workers.
struct OpenJob {
    /// Ciphertext as read from the source, including the tag.
    buffer: Vec<u8>,
    /// Counter value captured at dispatch.
    nonce: ChunkNonce,
    /// The pump observed EOF inside this chunk.
    last: bool,
    /// Zero-based chunk index, for error reporting.
    index: u64,
    slot: Job<Option<OpenedChunk>>,
}

/// A successfully opened chunk.
struct OpenedChunk {
    buffer: Vec<u8>,
    /// Authenticated under the last-flag nonce.
    last: bool,
}

/// The chunk currently being served to the caller.
struct CurrentChunk {
    buffer: Vec<u8>,
    pos: usize,
    last: bool,
}

enum DeliveryState {
    Streaming,
    Finished,
    Failed,
}

/// Reads one age payload stream, opening chunks on a pool of worker
/// threads.
///
/// Plaintext is delivered strictly in stream order. Any authentication
/// failure, format violation, or source error is fatal: it is recorded once
/// and surfaced on this and every later call, and no plaintext from the
/// failing chunk onward is delivered. A truncated stream fails with
/// [`StreamError::Truncated`] instead of ending early.
///
/// Dropping the reader mid-stream winds the pipeline down and joins its
/// threads; if the source is blocking in a read, the drop waits for that
/// read to return.
pub struct StreamReader {
    ordered_rx: Receiver<Receiver<Option<OpenedChunk>>>,
    buffers: BufferPool,
    sticky: StickyError,
    stop: Arc<AtomicBool>,
    pump: Option<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
    current: Option<CurrentChunk>,
    state: DeliveryState,
}

impl StreamReader {
    /// Starts a decryption pipeline reading from `source`.
    ///
    /// `concurrency` is the number of open workers; `0` means one per
    /// logical CPU.
    #[must_use]
    pub fn decrypt<R: Read + Send + 'static>(
        key: PayloadKey,
        source: R,
        concurrency: usize,
    ) -> Self {
        Self::from_aead(key.into_aead(), source, concurrency)
    }

    /// Starts a decryption pipeline on an already-keyed AEAD instance.
    #[must_use]
    pub fn from_aead<R: Read + Send + 'static>(
        aead: PayloadAead,
        source: R,
        concurrency: usize,
    ) -> Self {
        let worker_count = resolve_concurrency(concurrency);
        let aead = Arc::new(aead);

        let (todo_tx, todo_rx) = bounded::<OpenJob>(worker_count);
        // One slot per job in existence: the queue can never reject a
        // dispatch for long, and delivery backpressure reaches the pump.
        let (ordered_tx, ordered_rx) = bounded::<Receiver<Option<OpenedChunk>>>(worker_count + 1);
        // The extra buffers let the pump fill the next chunk and the
        // delivery stage hold the one being served while all workers are
        // busy; the extra job keeps the pump a dispatch ahead.
        let buffers = BufferPool::new(worker_count + 2);
        let jobs = JobPool::new(worker_count + 1);
        let sticky = StickyError::default();
        let stop = Arc::new(AtomicBool::new(false));
        let final_index = Arc::new(AtomicU64::new(NO_FINAL_CHUNK));

        let mut workers = Vec::with_capacity(worker_count);
        for worker_id in 0..worker_count {
            let aead = Arc::clone(&aead);
            let todo = todo_rx.clone();
            let jobs = jobs.clone();
            let buffers = buffers.clone();
            let sticky = sticky.clone();
            let final_index = Arc::clone(&final_index);
            let handle = thread::Builder::new()
                .name(format!("open-worker-{worker_id}"))
                .spawn(move || {
                    open_worker(worker_id, &aead, &todo, &jobs, &buffers, &sticky, &final_index);
                })
                .expect("failed to spawn open worker thread");
            workers.push(handle);
        }

        let pump = {
            let buffers = buffers.clone();
            let sticky = sticky.clone();
            let stop = Arc::clone(&stop);
            thread::Builder::new()
                .name("open-pump".into())
                .spawn(move || {
                    pump_loop(source, &todo_tx, &ordered_tx, &buffers, &jobs, &sticky, &stop);
                })
                .expect("failed to spawn pump thread")
        };

        debug!(workers = worker_count, "stream reader pipeline started");

        Self {
            ordered_rx,
            buffers,
            sticky,
            stop,
            pump: Some(pump),
            workers,
            current: None,
            state: DeliveryState::Streaming,
        }
    }

    /// Decrypts the remainder of the stream directly into `sink`, skipping
    /// the caller-side chunk buffering of [`Read`].
    ///
    /// Returns the number of plaintext bytes written. A sink error is
    /// surfaced after the remaining in-flight chunks have been drained, so
    /// the worker threads always wind down.
    pub fn drain_to<S: Write + ?Sized>(&mut self, sink: &mut S) -> Result<u64, StreamError> {
        let mut written: u64 = 0;
        let mut sink_error: Option<StreamError> = None;

        loop {
            match self.state {
                DeliveryState::Failed => return Err(self.stored_error()),
                DeliveryState::Finished => break,
                DeliveryState::Streaming => {}
            }

            let (buffer, pos, last) = match self.current.take() {
                Some(current) => (current.buffer, current.pos, current.last),
                None => match self.next_chunk() {
                    Ok(Some(chunk)) => (chunk.buffer, 0, chunk.last),
                    Ok(None) => {
                        self.sticky.set(StreamError::Truncated);
                        self.state = DeliveryState::Failed;
                        if sink_error.is_none() {
                            return Err(self.stored_error());
                        }
                        break;
                    }
                    Err(error) => {
                        self.state = DeliveryState::Failed;
                        if sink_error.is_none() {
                            return Err(error);
                        }
                        break;
                    }
                },
            };

            if sink_error.is_none() && pos < buffer.len() {
                match sink.write_all(&buffer[pos..]) {
                    Ok(()) => written += (buffer.len() - pos) as u64,
                    Err(error) => {
                        warn!(error = %error, "sink write failed, draining remaining chunks");
                        sink_error = Some(StreamError::SinkIo(error));
                    }
                }
            }
            self.buffers.put(buffer);

            if last {
                match self.confirm_end() {
                    Ok(()) => break,
                    Err(error) => {
                        if sink_error.is_none() {
                            return Err(error);
                        }
                        break;
                    }
                }
            }
        }

        match sink_error {
            Some(error) => Err(error),
            None => Ok(written),
        }
    }

    /// Receives the next opened chunk in dispatch order.
    fn next_chunk(&mut self) -> Result<Option<OpenedChunk>, StreamError> {
        match self.ordered_rx.recv() {
            Ok(slot_rx) => match slot_rx.recv() {
                Ok(Some(chunk)) => Ok(Some(chunk)),
                // The worker recorded the failure before publishing.
                Ok(None) | Err(_) => Err(self.stored_error()),
            },
            // The pump closed the queue: clean end of input, or a fatal
            // condition it recorded first.
            Err(_) => match self.sticky.get() {
                Some(error) => Err(error),
                None => Ok(None),
            },
        }
    }

    /// Called after serving a last-flagged chunk: the pipeline must end
    /// here, anything further is trailing data.
    fn confirm_end(&mut self) -> Result<(), StreamError> {
        match self.next_chunk() {
            Ok(None) => {
                self.state = DeliveryState::Finished;
                Ok(())
            }
            Ok(Some(extra)) => {
                self.buffers.put(extra.buffer);
                self.sticky.set(StreamError::TrailingData);
                self.state = DeliveryState::Failed;
                Err(self.stored_error())
            }
            Err(error) => {
                self.state = DeliveryState::Failed;
                Err(error)
            }
        }
    }

    fn stored_error(&self) -> StreamError {
        self.sticky.get().unwrap_or_else(|| {
            StreamError::SourceIo(io::Error::other("stream pipeline failed"))
        })
    }
}

impl Read for StreamReader {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }

        loop {
            match self.state {
                DeliveryState::Failed => return Err(self.stored_error().into()),
                DeliveryState::Finished => return Ok(0),
                DeliveryState::Streaming => {}
            }

            if let Some(current) = self.current.as_mut() {
                if current.pos < current.buffer.len() {
                    let n = (current.buffer.len() - current.pos).min(out.len());
                    out[..n].copy_from_slice(&current.buffer[current.pos..current.pos + n]);
                    current.pos += n;
                    return Ok(n);
                }

                let served = self.current.take().expect("current chunk checked above");
                let was_last = served.last;
                self.buffers.put(served.buffer);
                if was_last {
                    self.confirm_end().map_err(io::Error::from)?;
                    return Ok(0);
                }
            }

            match self.next_chunk() {
                Ok(Some(chunk)) => {
                    self.current = Some(CurrentChunk {
                        buffer: chunk.buffer,
                        pos: 0,
                        last: chunk.last,
                    });
                }
                Ok(None) => {
                    // Input ended without any last-flagged chunk.
                    self.sticky.set(StreamError::Truncated);
                    self.state = DeliveryState::Failed;
                    return Err(self.stored_error().into());
                }
                Err(error) => {
                    self.state = DeliveryState::Failed;
                    return Err(error.into());
                }
            }
        }
    }
}

impl Drop for StreamReader {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(current) = self.current.take() {
            self.buffers.put(current.buffer);
        }
        // Consume every outstanding result so no worker stays blocked on a
        // full slot and the pump reaches its stop check, then join.
        while let Ok(slot_rx) = self.ordered_rx.recv() {
            if let Ok(Some(chunk)) = slot_rx.recv() {
                self.buffers.put(chunk.buffer);
            }
        }
        if let Some(handle) = self.pump.take() {
            let _ = handle.join();
        }
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

/// Reads fixed-size chunks from the source and dispatches them until EOF or
/// a fatal condition.
fn pump_loop<R: Read>(
    mut source: R,
    todo: &Sender<OpenJob>,
    ordered: &Sender<Receiver<Option<OpenedChunk>>>,
    buffers: &BufferPool,
    jobs: &JobPool<Option<OpenedChunk>>,
    sticky: &StickyError,
    stop: &AtomicBool,
) {
    let mut nonce = ChunkNonce::new();
    let mut index: u64 = 0;

    loop {
        if stop.load(Ordering::Acquire) || sticky.is_set() {
            break;
        }

        let slot = jobs.take();
        let mut buffer = buffers.take();
        buffer.resize(ENCRYPTED_CHUNK_SIZE, 0);

        let n = match read_full(&mut source, &mut buffer) {
            Ok(n) => n,
            Err(error) => {
                sticky.set(StreamError::SourceIo(error));
                buffers.put(buffer);
                jobs.put(slot);
                break;
            }
        };

        if n == ENCRYPTED_CHUNK_SIZE {
            // Tentatively a middle chunk. A full-length final chunk is
            // indistinguishable here; the worker's retry handles it.
            if dispatch(todo, ordered, slot, buffer, nonce, false, index).is_err() {
                break;
            }
            nonce.increment();
            index += 1;
            continue;
        }

        buffer.truncate(n);
        if n == 0 {
            // Clean EOF at a chunk boundary: the previous chunk, if any,
            // was the final one. Whether it carried the last-chunk flag is
            // checked at delivery.
            trace!(chunks = index, "source drained");
            buffers.put(buffer);
            jobs.put(slot);
            break;
        }
        if n < TAG_SIZE {
            // Not even a whole tag.
            sticky.set(StreamError::Truncated);
            buffers.put(buffer);
            jobs.put(slot);
            break;
        }
        if n == TAG_SIZE && index > 0 {
            // An empty final chunk is only legal as the sole chunk of an
            // empty stream.
            sticky.set(StreamError::EmptyLastChunk);
            buffers.put(buffer);
            jobs.put(slot);
            break;
        }

        let _ = dispatch(todo, ordered, slot, buffer, nonce, true, index);
        break;
    }
    trace!("pump exiting");
    // Dropping the senders closes todo for the workers and the ordered
    // queue for delivery.
}

fn dispatch(
    todo: &Sender<OpenJob>,
    ordered: &Sender<Receiver<Option<OpenedChunk>>>,
    slot: Job<Option<OpenedChunk>>,
    buffer: Vec<u8>,
    nonce: ChunkNonce,
    last: bool,
    index: u64,
) -> Result<(), ()> {
    trace!(chunk = index, len = buffer.len(), last, "dispatching chunk");
    // The result slot enters the ordered queue before any worker sees the
    // job; delivery order is therefore dispatch order.
    if ordered.send(slot.result_rx.clone()).is_err() {
        return Err(());
    }
    if todo
        .send(OpenJob {
            buffer,
            nonce,
            last,
            index,
            slot,
        })
        .is_err()
    {
        return Err(());
    }
    Ok(())
}

/// Fills `buffer` from the source, treating EOF as a short count.
fn read_full<R: Read>(source: &mut R, buffer: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        match source.read(&mut buffer[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Opens chunks until the todo channel closes.
fn open_worker(
    worker_id: usize,
    aead: &PayloadAead,
    todo: &Receiver<OpenJob>,
    jobs: &JobPool<Option<OpenedChunk>>,
    buffers: &BufferPool,
    sticky: &StickyError,
    final_index: &AtomicU64,
) {
    trace!(worker_id, "open worker started");
    while let Ok(job) = todo.recv() {
        let OpenJob {
            mut buffer,
            nonce,
            last,
            index,
            slot,
        } = job;

        if sticky.is_set() {
            // A fatal condition is already recorded; publish a failure
            // marker so delivery never blocks on this slot.
            buffers.put(buffer);
            let _ = slot.result_tx.send(None);
            jobs.put(slot);
            continue;
        }

        // Chunks before the final one may still be in flight when the
        // final chunk is opened, so only an index past it is trailing
        // data.
        if index > final_index.load(Ordering::Acquire) {
            sticky.set(StreamError::TrailingData);
            buffers.put(buffer);
            let _ = slot.result_tx.send(None);
            jobs.put(slot);
            continue;
        }

        let opened_as_last = if last {
            let mut flagged = nonce;
            flagged.set_last();
            aead.decrypt_in_place(Nonce::from_slice(flagged.as_bytes()), b"", &mut buffer)
                .ok()
                .map(|()| true)
        } else {
            match aead.decrypt_in_place(Nonce::from_slice(nonce.as_bytes()), b"", &mut buffer) {
                Ok(()) => Some(false),
                Err(_) => {
                    // A full-length final chunk authenticates only under
                    // the last-flag nonce. Tag verification happens before
                    // any decryption, so the buffer is intact for the
                    // retry.
                    let mut flagged = nonce;
                    flagged.set_last();
                    aead.decrypt_in_place(Nonce::from_slice(flagged.as_bytes()), b"", &mut buffer)
                        .ok()
                        .map(|()| true)
                }
            }
        };

        match opened_as_last {
            Some(is_last) => {
                if is_last {
                    // At most one chunk can authenticate under the
                    // last-flag nonce, so this store happens once.
                    final_index.store(index, Ordering::Release);
                }
                trace!(worker_id, chunk = index, last = is_last, "chunk opened");
                let _ = slot.result_tx.send(Some(OpenedChunk {
                    buffer,
                    last: is_last,
                }));
            }
            None => {
                warn!(worker_id, chunk = index, "chunk failed to authenticate");
                sticky.set(StreamError::Authentication { chunk: index });
                buffers.put(buffer);
                let _ = slot.result_tx.send(None);
            }
        }
        jobs.put(slot);
    }
    trace!(worker_id, "open worker exiting");
}
