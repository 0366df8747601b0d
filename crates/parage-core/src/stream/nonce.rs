//! Chunk nonce bookkeeping.
//!
//! A nonce is 12 bytes: bytes 0..11 hold an 88-bit big-endian chunk counter
//! starting at zero, byte 11 holds the last-chunk flag. The flag is set
//! exactly once, on the true final chunk of the stream.

/// AEAD nonce length in bytes.
pub(crate) const NONCE_SIZE: usize = 12;

const LAST_CHUNK_FLAG: u8 = 0x01;

/// A per-chunk STREAM nonce.
///
/// `Copy` so the persistent counter can be captured by value into a job
/// while the pipeline keeps incrementing its own copy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct ChunkNonce([u8; NONCE_SIZE]);

impl ChunkNonce {
    /// The all-zero nonce of the first chunk.
    pub(crate) fn new() -> Self {
        Self([0; NONCE_SIZE])
    }

    /// Adds one to the 88-bit big-endian counter. The flag byte is untouched.
    ///
    /// # Panics
    ///
    /// Panics if all 11 counter bytes wrap. At 64 KiB per chunk that is
    /// 2^88 chunks, unreachable for any real stream; hitting it means the
    /// counter was corrupted.
    pub(crate) fn increment(&mut self) {
        for i in (0..NONCE_SIZE - 1).rev() {
            self.0[i] = self.0[i].wrapping_add(1);
            if self.0[i] != 0 {
                return;
            }
        }
        panic!("chunk counter wrapped around");
    }

    /// Marks this nonce as belonging to the final chunk.
    pub(crate) fn set_last(&mut self) {
        self.0[NONCE_SIZE - 1] = LAST_CHUNK_FLAG;
    }

    pub(crate) fn as_bytes(&self) -> &[u8; NONCE_SIZE] {
        &self.0
    }
}
