//! Chunked AES-256-GCM stream format.
//!
//! ```text
//! "KEEPENC1"
//! repeat: [flags u8][len u32 LE][nonce 12][ciphertext + tag (len bytes)]
//! ```
//!
//! Every chunk but the last carries exactly `CHUNK_SIZE` plaintext bytes. The
//! AAD binds the chunk index and the final flag, so reordered, dropped or
//! truncated chunks fail authentication.

use std::io::{self, Read, Write};

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;

use super::EncryptionKey;

pub const ENCRYPTED_MAGIC: &[u8; 8] = b"KEEPENC1";

const CHUNK_SIZE: usize = 1024 * 1024;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const FLAG_FINAL: u8 = 0x01;

fn aad(index: u64, flags: u8) -> [u8; 17] {
    let mut out = [0u8; 17];
    out[..8].copy_from_slice(ENCRYPTED_MAGIC);
    out[8..16].copy_from_slice(&index.to_le_bytes());
    out[16] = flags;
    out
}

fn invalid(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

/// Encrypting writer. [`EncryptWriter::finish`] must be called to emit the final chunk.
pub struct EncryptWriter<W: Write> {
    inner: W,
    cipher: Aes256Gcm,
    buf: Vec<u8>,
    index: u64,
}

impl<W: Write> EncryptWriter<W> {
    pub fn new(key: &EncryptionKey, mut inner: W) -> io::Result<Self> {
        inner.write_all(ENCRYPTED_MAGIC)?;
        let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
            .map_err(|e| invalid(format!("AES-GCM key: {e}")))?;
        Ok(Self {
            inner,
            cipher,
            buf: Vec::with_capacity(CHUNK_SIZE),
            index: 0,
        })
    }

    fn emit(&mut self, flags: u8) -> io::Result<()> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let aad = aad(self.index, flags);
        let ciphertext = self
            .cipher
            .encrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: &self.buf,
                    aad: &aad,
                },
            )
            .map_err(|e| invalid(format!("AES-GCM encrypt: {e}")))?;

        self.inner.write_all(&[flags])?;
        self.inner
            .write_all(&(ciphertext.len() as u32).to_le_bytes())?;
        self.inner.write_all(&nonce_bytes)?;
        self.inner.write_all(&ciphertext)?;
        self.buf.clear();
        self.index += 1;
        Ok(())
    }

    /// Emit the final chunk and return the inner writer.
    pub fn finish(mut self) -> io::Result<W> {
        self.emit(FLAG_FINAL)?;
        self.inner.flush()?;
        Ok(self.inner)
    }
}

impl<W: Write> Write for EncryptWriter<W> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if self.buf.len() == CHUNK_SIZE {
            self.emit(0)?;
        }
        let take = data.len().min(CHUNK_SIZE - self.buf.len());
        self.buf.extend_from_slice(&data[..take]);
        Ok(take)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Decrypting reader over a stream produced by [`EncryptWriter`].
///
/// Authentication failures, truncation and trailing data all surface as
/// `InvalidData` I/O errors.
pub struct DecryptReader<R: Read> {
    inner: R,
    cipher: Aes256Gcm,
    plain: Vec<u8>,
    pos: usize,
    index: u64,
    finished: bool,
}

impl<R: Read> DecryptReader<R> {
    pub fn new(key: &EncryptionKey, mut inner: R) -> io::Result<Self> {
        let mut magic = [0u8; 8];
        inner
            .read_exact(&mut magic)
            .map_err(|_| invalid("not an encrypted backup stream"))?;
        if &magic != ENCRYPTED_MAGIC {
            return Err(invalid("not an encrypted backup stream"));
        }
        let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
            .map_err(|e| invalid(format!("AES-GCM key: {e}")))?;
        Ok(Self {
            inner,
            cipher,
            plain: Vec::new(),
            pos: 0,
            index: 0,
            finished: false,
        })
    }

    fn next_chunk(&mut self) -> io::Result<()> {
        let mut head = [0u8; 1 + 4 + NONCE_LEN];
        match self.inner.read_exact(&mut head) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(invalid("encrypted stream truncated"));
            }
            Err(e) => return Err(e),
        }
        let flags = head[0];
        let len = u32::from_le_bytes([head[1], head[2], head[3], head[4]]) as usize;
        if !(TAG_LEN..=CHUNK_SIZE + TAG_LEN).contains(&len) {
            return Err(invalid(format!("invalid chunk length {len}")));
        }
        let mut ciphertext = vec![0u8; len];
        self.inner
            .read_exact(&mut ciphertext)
            .map_err(|_| invalid("encrypted stream truncated"))?;

        let aad = aad(self.index, flags);
        self.plain = self
            .cipher
            .decrypt(
                Nonce::from_slice(&head[5..]),
                Payload {
                    msg: &ciphertext,
                    aad: &aad,
                },
            )
            .map_err(|_| invalid("decryption failed: wrong key or corrupted data"))?;
        self.pos = 0;
        self.index += 1;

        if flags & FLAG_FINAL != 0 {
            self.finished = true;
            let mut trailing = [0u8; 1];
            if self.inner.read(&mut trailing)? != 0 {
                return Err(invalid("trailing data after final chunk"));
            }
        }
        Ok(())
    }
}

impl<R: Read> Read for DecryptReader<R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        while self.pos == self.plain.len() {
            if self.finished {
                return Ok(0);
            }
            self.next_chunk()?;
        }
        let n = out.len().min(self.plain.len() - self.pos);
        out[..n].copy_from_slice(&self.plain[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encrypt(key: &EncryptionKey, data: &[u8]) -> Vec<u8> {
        let mut w = EncryptWriter::new(key, Vec::new()).unwrap();
        w.write_all(data).unwrap();
        w.finish().unwrap()
    }

    fn decrypt(key: &EncryptionKey, data: &[u8]) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        DecryptReader::new(key, data)?.read_to_end(&mut out)?;
        Ok(out)
    }

    #[test]
    fn multi_chunk_stream() {
        let key = EncryptionKey::generate();
        let data: Vec<u8> = (0..(CHUNK_SIZE * 2 + 123)).map(|i| (i % 253) as u8).collect();
        let enc = encrypt(&key, &data);
        assert!(enc.starts_with(ENCRYPTED_MAGIC));
        assert_eq!(decrypt(&key, &enc).unwrap(), data);
    }

    #[test]
    fn empty_payload_still_has_final_chunk() {
        let key = EncryptionKey::generate();
        let enc = encrypt(&key, b"");
        assert_eq!(enc.len(), 8 + 1 + 4 + NONCE_LEN + TAG_LEN);
        assert!(decrypt(&key, &enc).unwrap().is_empty());
    }

    #[test]
    fn wrong_key_fails() {
        let enc = encrypt(&EncryptionKey::generate(), b"secret rows");
        let err = decrypt(&EncryptionKey::generate(), &enc).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn truncation_after_full_chunk_is_detected() {
        let key = EncryptionKey::generate();
        let data = vec![1u8; CHUNK_SIZE + 10];
        let enc = encrypt(&key, &data);
        // Keep the magic and the first (non-final) chunk only.
        let first_chunk = 1 + 4 + NONCE_LEN + CHUNK_SIZE + TAG_LEN;
        let err = decrypt(&key, &enc[..8 + first_chunk]).unwrap_err();
        assert!(err.to_string().contains("truncated"), "{err}");
    }

    #[test]
    fn flipped_final_flag_fails_authentication() {
        let key = EncryptionKey::generate();
        let mut enc = encrypt(&key, b"abc");
        enc[8] ^= FLAG_FINAL;
        assert!(decrypt(&key, &enc).is_err());
    }

    #[test]
    fn trailing_garbage_is_rejected() {
        let key = EncryptionKey::generate();
        let mut enc = encrypt(&key, b"abc");
        enc.push(0);
        assert!(decrypt(&key, &enc).is_err());
    }

    #[test]
    fn plaintext_is_not_accepted() {
        let key = EncryptionKey::generate();
        assert!(DecryptReader::new(&key, &b"plain tar bytes"[..]).is_err());
    }
}
