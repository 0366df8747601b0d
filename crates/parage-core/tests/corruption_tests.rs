//! Failure-path tests: tampering, truncation, trailing data, and wrong keys.
//!
//! A corrupted stream must fail with a clean error and must never deliver
//! plaintext from the corrupted chunk onward; bytes delivered before the
//! failure are always a prefix of the original plaintext.

mod common;

use std::io::{self, Cursor, Read, Write};

use aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};

use common::{TEST_KEY, key, open_with, other_key, pattern, seal_with};
use parage_core::{CHUNK_SIZE, ENCRYPTED_CHUNK_SIZE, StreamError, StreamReader, TAG_SIZE};

/// Reads until the pipeline fails, returning everything delivered first.
fn read_until_error(reader: &mut StreamReader) -> (Vec<u8>, io::Error) {
    let mut delivered = Vec::new();
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => panic!("expected a failure, stream ended cleanly"),
            Ok(n) => delivered.extend_from_slice(&buf[..n]),
            Err(error) => return (delivered, error),
        }
    }
}

#[test]
fn bit_flips_fail_and_never_leak_past_the_flip() {
    let plaintext = pattern(CHUNK_SIZE + CHUNK_SIZE / 2);
    let ciphertext = seal_with(3, &plaintext);

    let positions = [
        0,                           // first ciphertext byte
        CHUNK_SIZE / 2,              // middle of chunk 0
        ENCRYPTED_CHUNK_SIZE - 1,    // tag of chunk 0
        ENCRYPTED_CHUNK_SIZE,        // first byte of chunk 1
        ciphertext.len() - 1,        // tag of the final chunk
    ];

    for position in positions {
        let mut corrupted = ciphertext.clone();
        corrupted[position] ^= 0x01;

        let mut reader = StreamReader::decrypt(key(), Cursor::new(corrupted), 3);
        let (delivered, error) = read_until_error(&mut reader);

        assert_eq!(
            error.kind(),
            io::ErrorKind::InvalidData,
            "position {position}"
        );
        assert!(
            plaintext.starts_with(&delivered),
            "position {position}: delivered bytes diverge from the plaintext"
        );
        let affected_chunk = position / ENCRYPTED_CHUNK_SIZE;
        assert!(
            delivered.len() <= affected_chunk * CHUNK_SIZE,
            "position {position}: plaintext leaked from the corrupted chunk"
        );
    }
}

#[test]
fn corrupted_middle_chunk_stops_delivery_at_the_chunk_boundary() {
    let plaintext = pattern(3 * CHUNK_SIZE + 100);
    let mut ciphertext = seal_with(4, &plaintext);
    ciphertext[ENCRYPTED_CHUNK_SIZE + 10] ^= 0xFF;

    // A single worker opens chunks in dispatch order, so exactly the first
    // chunk is delivered before the failure.
    let mut reader = StreamReader::decrypt(key(), Cursor::new(ciphertext), 1);
    let (delivered, error) = read_until_error(&mut reader);

    assert_eq!(delivered, &plaintext[..CHUNK_SIZE]);
    assert_eq!(error.kind(), io::ErrorKind::InvalidData);
    assert!(error.to_string().contains("authenticate"));
}

#[test]
fn every_class_of_truncation_fails() {
    let plaintext = pattern(2 * CHUNK_SIZE + 333);
    let ciphertext = seal_with(2, &plaintext);
    let full = ciphertext.len();

    let cuts = [
        0,                            // nothing at all
        1,                            // less than one tag
        TAG_SIZE - 1,                 //
        TAG_SIZE,                     // exactly one tag, not a valid empty stream
        TAG_SIZE + 1,                 //
        ENCRYPTED_CHUNK_SIZE,         // clean boundary, no final chunk
        ENCRYPTED_CHUNK_SIZE + 100,   // partial second chunk
        2 * ENCRYPTED_CHUNK_SIZE,     // clean boundary, final chunk missing
        full - TAG_SIZE,              // final chunk loses its tag
        full - 1,                     // final chunk loses one byte
    ];

    for cut in cuts {
        let result = open_with(2, &ciphertext[..cut]);
        assert!(result.is_err(), "cut {cut}: truncated stream decrypted");
    }
}

#[test]
fn clean_boundary_truncation_reports_unexpected_eof() {
    let plaintext = pattern(2 * CHUNK_SIZE + 333);
    let ciphertext = seal_with(2, &plaintext);

    // Exactly the two full chunks, with the short final chunk cut away.
    let error = open_with(2, &ciphertext[..2 * ENCRYPTED_CHUNK_SIZE]).unwrap_err();
    assert_eq!(error.kind(), io::ErrorKind::UnexpectedEof);
}

#[test]
fn empty_ciphertext_reports_unexpected_eof() {
    let error = open_with(2, b"").unwrap_err();
    assert_eq!(error.kind(), io::ErrorKind::UnexpectedEof);
}

#[test]
fn trailing_garbage_after_full_length_final_chunk_is_detected() {
    // An exact-multiple stream ends in a full-length last-flagged chunk, so
    // appended bytes form a separate bogus chunk instead of merging into a
    // short final chunk.
    let plaintext = pattern(2 * CHUNK_SIZE);
    let mut ciphertext = seal_with(1, &plaintext);
    ciphertext.extend_from_slice(&[0xEE; 32]);

    // A single worker opens chunks in order, so the final chunk is seen
    // before the garbage and the failure is the trailing-data check.
    let mut reader = StreamReader::decrypt(key(), Cursor::new(ciphertext), 1);
    let (delivered, error) = read_until_error(&mut reader);

    assert_eq!(delivered, plaintext);
    assert_eq!(error.kind(), io::ErrorKind::InvalidData);
    assert!(error.to_string().contains("unexpected data after last chunk"));
}

#[test]
fn appended_empty_chunk_is_rejected() {
    let plaintext = pattern(2 * CHUNK_SIZE);
    let mut ciphertext = seal_with(2, &plaintext);
    ciphertext.extend_from_slice(&[0u8; TAG_SIZE]);

    let mut reader = StreamReader::decrypt(key(), Cursor::new(ciphertext), 2);
    let (delivered, error) = read_until_error(&mut reader);

    // The pump records the violation as soon as it sees the 16-byte tail;
    // a worker that observes the record first may cut delivery short, but
    // whatever was delivered is untampered prefix plaintext.
    assert!(plaintext.starts_with(&delivered));
    assert_eq!(error.kind(), io::ErrorKind::InvalidData);
    assert!(error.to_string().contains("last chunk is empty"));
}

#[test]
fn legacy_empty_trailing_chunk_is_rejected() {
    // Early drafts of the format closed an exact-multiple stream with an
    // empty last-flagged chunk. Build one by hand: a full middle chunk
    // followed by an empty final chunk under counter one.
    let aead = ChaCha20Poly1305::new(Key::from_slice(&TEST_KEY));
    let full_chunk = pattern(CHUNK_SIZE);

    let mut ciphertext = aead
        .encrypt(Nonce::from_slice(&[0u8; 12]), full_chunk.as_slice())
        .unwrap();
    let mut final_nonce = [0u8; 12];
    final_nonce[10] = 1;
    final_nonce[11] = 1;
    ciphertext.extend_from_slice(&aead.encrypt(Nonce::from_slice(&final_nonce), &[][..]).unwrap());

    let error = open_with(2, &ciphertext).unwrap_err();
    assert_eq!(error.kind(), io::ErrorKind::InvalidData);
    assert!(error.to_string().contains("last chunk is empty"));
}

#[test]
fn wrong_key_fails_before_delivering_anything() {
    let ciphertext = seal_with(2, &pattern(CHUNK_SIZE + 5));

    let mut reader = StreamReader::decrypt(other_key(), Cursor::new(ciphertext), 2);
    let (delivered, error) = read_until_error(&mut reader);

    assert!(delivered.is_empty());
    assert_eq!(error.kind(), io::ErrorKind::InvalidData);
}

#[test]
fn tampered_empty_stream_fails() {
    let mut ciphertext = seal_with(1, b"");
    ciphertext[3] ^= 0x10;
    assert!(open_with(1, &ciphertext).is_err());
}

#[test]
fn drain_to_surfaces_sink_error_after_draining() {
    struct FailingSink;
    impl Write for FailingSink {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::other("sink closed"))
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    let ciphertext = seal_with(2, &pattern(3 * CHUNK_SIZE));
    let mut reader = StreamReader::decrypt(key(), Cursor::new(ciphertext), 2);

    let error = reader.drain_to(&mut FailingSink).unwrap_err();
    assert!(matches!(error, StreamError::SinkIo(_)));
}

#[test]
fn source_error_surfaces_on_read() {
    /// Yields half a stream, then an I/O error.
    struct FailingSource {
        data: Cursor<Vec<u8>>,
        remaining: usize,
    }
    impl Read for FailingSource {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.remaining == 0 {
                return Err(io::Error::other("connection reset by peer"));
            }
            let len = buf.len().min(self.remaining);
            let n = self.data.read(&mut buf[..len])?;
            self.remaining -= n;
            Ok(n)
        }
    }

    let plaintext = pattern(3 * CHUNK_SIZE);
    let ciphertext = seal_with(2, &plaintext);
    let source = FailingSource {
        data: Cursor::new(ciphertext),
        remaining: ENCRYPTED_CHUNK_SIZE + 17,
    };

    let mut reader = StreamReader::decrypt(key(), source, 2);
    let (delivered, error) = read_until_error(&mut reader);

    assert!(plaintext.starts_with(&delivered));
    assert!(error.to_string().contains("failed to read ciphertext"));
}
