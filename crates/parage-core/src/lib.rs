//! Parallel payload codec for the age file-encryption format.
//!
//! The age payload layer is a [STREAM] construction: ChaCha20-Poly1305 over
//! 64 KiB chunks, each sealed under a nonce made of an 88-bit big-endian
//! chunk counter and a last-chunk flag byte. Chunks are independent AEAD
//! messages, yet the reference implementations process them one at a time
//! on a single core. This crate seals and opens chunks on a pool of worker
//! threads while producing and consuming exactly the serial wire format:
//! ciphertext written here decrypts with any conforming age implementation,
//! and the output is bit-identical for every worker count.
//!
//! The crate starts where the age header ends. Callers bring the
//! HKDF-derived payload key (or an already-keyed AEAD instance) together
//! with a ciphertext source or plaintext sink; recipient handling, header
//! parsing, and file-key unwrapping belong to the surrounding age library.
//!
//! ```
//! use std::io::{Cursor, Read, Write};
//! use parage_core::{PayloadKey, StreamReader, StreamWriter};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let key = [0x2a; 32];
//!
//! let mut writer = StreamWriter::encrypt(PayloadKey::new(key), Vec::new(), 4);
//! writer.write_all(b"the quick brown fox")?;
//! let ciphertext = writer.finish()?;
//!
//! let mut reader = StreamReader::decrypt(PayloadKey::new(key), Cursor::new(ciphertext), 4);
//! let mut plaintext = Vec::new();
//! reader.read_to_end(&mut plaintext)?;
//! assert_eq!(plaintext, b"the quick brown fox");
//! # Ok(())
//! # }
//! ```
//!
//! [STREAM]: https://eprint.iacr.org/2015/189.pdf

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod stream;

pub use stream::{
    CHUNK_SIZE, ENCRYPTED_CHUNK_SIZE, PayloadAead, PayloadKey, StreamError, StreamReader,
    StreamWriter, TAG_SIZE,
};
