//! Fuzz target for stream decryption
//!
//! Feeds arbitrary bytes to the reader pipeline. Decryption must either
//! succeed and yield some plaintext or fail with a clean error: no panics,
//! no hangs, no out-of-bounds reads. The worker count is fuzzed too, since
//! the shutdown paths differ between a single worker and several.

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use parage_core::{PayloadKey, StreamReader};
use std::io::{Cursor, Read};

/// Fixed payload key for fuzzing
const FUZZ_KEY: [u8; 32] = [
    0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07,
    0x08, 0x09, 0x0a, 0x0b, 0x0c, 0x0d, 0x0e, 0x0f,
    0x10, 0x11, 0x12, 0x13, 0x14, 0x15, 0x16, 0x17,
    0x18, 0x19, 0x1a, 0x1b, 0x1c, 0x1d, 0x1e, 0x1f,
];

#[derive(Arbitrary, Debug)]
struct FuzzInput {
    /// Worker count, reduced to 1..=4.
    workers: u8,
    /// Candidate ciphertext.
    data: Vec<u8>,
}

fuzz_target!(|input: FuzzInput| {
    let workers = usize::from(input.workers % 4) + 1;

    let mut reader = StreamReader::decrypt(
        PayloadKey::new(FUZZ_KEY),
        Cursor::new(input.data),
        workers,
    );

    let mut plaintext = Vec::new();
    let _ = reader.read_to_end(&mut plaintext);
});
