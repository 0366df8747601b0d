//! Parallel `STREAM[key](plaintext)` payload codec.
//!
//! Implements the [STREAM] construction for online authenticated encryption
//! as used by the age file format: ChaCha20-Poly1305 over 64 KiB chunks,
//! with a nonce built from an 88-bit big-endian chunk counter and a one-byte
//! last-chunk flag (`0x00` / `0x01`). The wire format is identical to the
//! serial construction; only the scheduling differs.
//!
//! # Architecture
//!
//! Chunks are independent AEAD messages, so sealing and opening fan out
//! across a pool of worker threads. Output order is decoupled from worker
//! completion order by enqueueing each job's single-slot result channel into
//! an ordered queue *at dispatch time*; the consumer of that queue blocks on
//! the Nth slot until the Nth dispatched job completes.
//!
//! ```text
//! StreamWriter:
//!   caller ──▶ accumulator ──▶ todo ──▶ seal workers ──▶ result slots
//!                   │                                        │
//!                   └────▶ ordered queue ──▶ serializer ──▶ sink
//!
//! StreamReader:
//!   source ──▶ pump ──▶ todo ──▶ open workers ──▶ result slots
//!                │                                    │
//!                └────▶ ordered queue ──▶ delivery ──▶ caller
//! ```
//!
//! Buffers and jobs are pooled; all queues are bounded, so memory use is
//! `O(workers)` regardless of stream length and backpressure propagates to
//! the caller.
//!
//! [STREAM]: https://eprint.iacr.org/2015/189.pdf

use std::io;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::thread;

use chacha20poly1305::{ChaCha20Poly1305, Key, KeyInit};
use thiserror::Error;
use zeroize::Zeroize;

mod nonce;
mod pool;
mod reader;
mod writer;

pub use reader::StreamReader;
pub use writer::StreamWriter;

/// Plaintext bytes per chunk.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Poly1305 authentication tag appended to every chunk.
pub const TAG_SIZE: usize = 16;

/// Ciphertext bytes per full chunk.
pub const ENCRYPTED_CHUNK_SIZE: usize = CHUNK_SIZE + TAG_SIZE;

/// The AEAD instance both pipelines run on.
///
/// ChaCha20-Poly1305 is stateless beyond the supplied nonce, so a single
/// instance is shared across workers behind an [`Arc`].
pub type PayloadAead = ChaCha20Poly1305;

/// The HKDF-derived payload key for one stream.
///
/// Must never be reused across streams. The surrounding age implementation
/// derives it from the file key and a per-file nonce; how the caller obtains
/// it is outside this crate. The key material is zeroized on drop.
pub struct PayloadKey([u8; 32]);

impl PayloadKey {
    /// Wraps raw key bytes.
    #[must_use]
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub(crate) fn into_aead(self) -> PayloadAead {
        ChaCha20Poly1305::new(Key::from_slice(&self.0))
    }
}

impl From<[u8; 32]> for PayloadKey {
    fn from(bytes: [u8; 32]) -> Self {
        Self::new(bytes)
    }
}

impl Drop for PayloadKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl std::fmt::Debug for PayloadKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PayloadKey").field(&"[REDACTED]").finish()
    }
}

/// Errors surfaced by the stream pipelines.
#[derive(Debug, Error)]
pub enum StreamError {
    /// Reading ciphertext from the source failed.
    #[error("failed to read ciphertext: {0}")]
    SourceIo(#[source] io::Error),

    /// Writing to the downstream sink failed.
    #[error("failed to write ciphertext to sink: {0}")]
    SinkIo(#[source] io::Error),

    /// A chunk failed to authenticate.
    ///
    /// Indicates tampering, corruption, or a wrong key. No plaintext from
    /// this chunk onward is delivered.
    #[error("chunk {chunk} failed to authenticate: ciphertext is tampered or the key is wrong")]
    Authentication {
        /// Zero-based index of the offending chunk.
        chunk: u64,
    },

    /// Ciphertext continued past a chunk carrying the last-chunk flag.
    #[error("unexpected data after last chunk")]
    TrailingData,

    /// A final chunk carried no plaintext even though it was not the first
    /// chunk of the stream. Only an empty stream may end with an empty chunk.
    #[error("last chunk is empty")]
    EmptyLastChunk,

    /// The source ended before any chunk carrying the last-chunk flag.
    #[error("ciphertext is truncated: stream ended before the final chunk")]
    Truncated,
}

impl Clone for StreamError {
    fn clone(&self) -> Self {
        // io::Error is not Clone; rebuild it from kind and message so the
        // sticky slot can surface the same failure on every later call.
        match self {
            Self::SourceIo(e) => Self::SourceIo(io::Error::new(e.kind(), e.to_string())),
            Self::SinkIo(e) => Self::SinkIo(io::Error::new(e.kind(), e.to_string())),
            Self::Authentication { chunk } => Self::Authentication { chunk: *chunk },
            Self::TrailingData => Self::TrailingData,
            Self::EmptyLastChunk => Self::EmptyLastChunk,
            Self::Truncated => Self::Truncated,
        }
    }
}

impl From<StreamError> for io::Error {
    fn from(e: StreamError) -> Self {
        let kind = match &e {
            StreamError::SourceIo(inner) | StreamError::SinkIo(inner) => inner.kind(),
            StreamError::Truncated => io::ErrorKind::UnexpectedEof,
            StreamError::Authentication { .. }
            | StreamError::TrailingData
            | StreamError::EmptyLastChunk => io::ErrorKind::InvalidData,
        };
        io::Error::new(kind, e)
    }
}

/// First-observer-wins fatal error slot shared by pipeline stages.
///
/// Stages that hit a fatal condition record it here and keep draining so no
/// thread blocks forever; the user-facing call surfaces the stored error.
#[derive(Clone, Default)]
pub(crate) struct StickyError(Arc<Mutex<Option<StreamError>>>);

impl StickyError {
    pub(crate) fn set(&self, error: StreamError) {
        let mut slot = self.0.lock().expect("sticky error lock is never poisoned");
        if slot.is_none() {
            *slot = Some(error);
        }
    }

    pub(crate) fn get(&self) -> Option<StreamError> {
        self.0
            .lock()
            .expect("sticky error lock is never poisoned")
            .clone()
    }

    pub(crate) fn is_set(&self) -> bool {
        self.0
            .lock()
            .expect("sticky error lock is never poisoned")
            .is_some()
    }
}

/// Resolves the requested worker count; `0` means one worker per logical CPU.
pub(crate) fn resolve_concurrency(requested: usize) -> usize {
    if requested > 0 {
        requested
    } else {
        thread::available_parallelism().map_or(1, NonZeroUsize::get)
    }
}
