//! Shared helpers for the stream integration suites.

#![allow(dead_code)]

use std::io::{Cursor, Read, Write};

use aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use parage_core::{CHUNK_SIZE, PayloadKey, StreamReader, StreamWriter};

pub const TEST_KEY: [u8; 32] = [7; 32];

/// Installs an env-filtered subscriber so `RUST_LOG=parage_core=trace`
/// surfaces the pipeline's tracing during a test run. Safe to call from
/// every test; only the first call wins.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn key() -> PayloadKey {
    PayloadKey::new(TEST_KEY)
}

pub fn other_key() -> PayloadKey {
    PayloadKey::new([8; 32])
}

/// Deterministic test payload, `buf[i] = i mod 256`.
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 256) as u8).collect()
}

/// Encrypts through the parallel pipeline.
pub fn seal_with(workers: usize, plaintext: &[u8]) -> Vec<u8> {
    init_tracing();
    let mut writer = StreamWriter::encrypt(key(), Vec::new(), workers);
    writer.write_all(plaintext).expect("pipeline write");
    writer.finish().expect("pipeline finish")
}

/// Decrypts through the parallel pipeline.
pub fn open_with(workers: usize, ciphertext: &[u8]) -> std::io::Result<Vec<u8>> {
    init_tracing();
    let mut reader = StreamReader::decrypt(key(), Cursor::new(ciphertext.to_vec()), workers);
    let mut out = Vec::new();
    reader.read_to_end(&mut out)?;
    Ok(out)
}

/// Serial reference construction of the wire format, chunk by chunk.
///
/// Independent of the pipeline code: the parallel writer must produce these
/// bytes exactly.
pub fn seal_serial(key_bytes: &[u8; 32], plaintext: &[u8]) -> Vec<u8> {
    let aead = ChaCha20Poly1305::new(Key::from_slice(key_bytes));
    let mut nonce = [0u8; 12];
    let mut out = Vec::new();

    let chunks: Vec<&[u8]> = if plaintext.is_empty() {
        // Even an empty stream carries one empty, last-flagged chunk.
        vec![&[][..]]
    } else {
        plaintext.chunks(CHUNK_SIZE).collect()
    };
    let count = chunks.len();
    for (i, chunk) in chunks.into_iter().enumerate() {
        if i + 1 == count {
            nonce[11] = 0x01;
        }
        let sealed = aead
            .encrypt(Nonce::from_slice(&nonce), chunk)
            .expect("serial seal");
        out.extend_from_slice(&sealed);
        for b in nonce[..11].iter_mut().rev() {
            *b = b.wrapping_add(1);
            if *b != 0 {
                break;
            }
        }
    }
    out
}
