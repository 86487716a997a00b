//! Streaming AES-256-CBC wrappers
//!
//! [`CryptoReader`] decrypts lazily while it is read and [`CryptoWriter`]
//! encrypts lazily while it is written, so file contents are never buffered
//! in full. Both wrappers also have a pass-through mode that forwards bytes
//! unchanged.

use crate::crypto::{DerivedKeyIv, BLOCK_SIZE};
use crate::error::{Error, Result};
use aes::Aes256;
use cbc::cipher::block_padding::{Pkcs7, RawPadding};
use cbc::cipher::generic_array::GenericArray;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use std::fmt;
use std::io::{self, Read, Write};
use tracing::warn;
use zeroize::Zeroizing;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// Bytes pulled from the inner reader per refill
const READ_CHUNK: usize = 8 * 1024;

/// Reader that yields the plaintext of an inner cipher-text stream
pub struct CryptoReader<R> {
    inner: R,
    state: Option<DecryptState>,
}

struct DecryptState {
    cipher: Aes256CbcDec,
    /// Cipher-text read but not yet decrypted; the last full block is held
    /// back until EOF so the padding can be stripped
    pending: Vec<u8>,
    /// Decrypted bytes not yet handed out
    plain: Zeroizing<Vec<u8>>,
    pos: usize,
    eof: bool,
    /// Set once the stream is known to be corrupt; every later read fails
    failed: Option<String>,
}

impl<R: Read> CryptoReader<R> {
    pub(crate) fn pass_through(inner: R) -> Self {
        CryptoReader { inner, state: None }
    }

    pub(crate) fn decrypting(inner: R, derived: &DerivedKeyIv) -> Result<Self> {
        let cipher = Aes256CbcDec::new_from_slices(derived.key(), derived.iv())
            .map_err(|e| Error::KeyDerivation(format!("invalid key material: {}", e)))?;

        Ok(CryptoReader {
            inner,
            state: Some(DecryptState {
                cipher,
                pending: Vec::with_capacity(READ_CHUNK + BLOCK_SIZE),
                plain: Zeroizing::new(Vec::with_capacity(READ_CHUNK + BLOCK_SIZE)),
                pos: 0,
                eof: false,
                failed: None,
            }),
        })
    }

    /// Whether this reader decrypts (false for pass-through)
    pub fn is_encrypted(&self) -> bool {
        self.state.is_some()
    }

    /// Unwrap the inner stream, discarding any buffered data
    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read> Read for CryptoReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.state {
            None => self.inner.read(buf),
            Some(state) => state.read(&mut self.inner, buf),
        }
    }
}

impl DecryptState {
    fn read<R: Read>(&mut self, inner: &mut R, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if self.pos < self.plain.len() {
                let n = buf.len().min(self.plain.len() - self.pos);
                buf[..n].copy_from_slice(&self.plain[self.pos..self.pos + n]);
                self.pos += n;
                return Ok(n);
            }

            if let Some(reason) = &self.failed {
                return Err(io::Error::new(io::ErrorKind::InvalidData, reason.clone()));
            }

            if self.eof || buf.is_empty() {
                return Ok(0);
            }

            if let Err(e) = self.refill(inner) {
                if e.kind() == io::ErrorKind::InvalidData {
                    self.failed = Some(e.to_string());
                }
                return Err(e);
            }
        }
    }

    fn refill<R: Read>(&mut self, inner: &mut R) -> io::Result<()> {
        self.plain.clear();
        self.pos = 0;

        let mut chunk = [0u8; READ_CHUNK];
        let n = loop {
            match inner.read(&mut chunk) {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        };

        if n == 0 {
            self.eof = true;
            return self.finish();
        }

        self.pending.extend_from_slice(&chunk[..n]);

        let full = self.pending.len() / BLOCK_SIZE * BLOCK_SIZE;
        let ready = if full == self.pending.len() {
            full.saturating_sub(BLOCK_SIZE)
        } else {
            full
        };
        self.decrypt_prefix(ready);

        Ok(())
    }

    fn decrypt_prefix(&mut self, len: usize) {
        if len == 0 {
            return;
        }

        let start = self.plain.len();
        self.plain.extend_from_slice(&self.pending[..len]);
        self.pending.drain(..len);

        for block in self.plain[start..].chunks_exact_mut(BLOCK_SIZE) {
            self.cipher
                .decrypt_block_mut(GenericArray::from_mut_slice(block));
        }
    }

    fn finish(&mut self) -> io::Result<()> {
        if self.pending.len() != BLOCK_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "truncated cipher text: {} trailing bytes",
                    self.pending.len()
                ),
            ));
        }

        self.decrypt_prefix(BLOCK_SIZE);

        let last = self.plain.len() - BLOCK_SIZE;
        let kept = match Pkcs7::raw_unpad(&self.plain[last..]) {
            Ok(data) => data.len(),
            Err(_) => {
                self.plain.clear();
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "invalid padding - data corrupted or wrong key",
                ));
            }
        };

        self.plain.truncate(last + kept);
        Ok(())
    }
}

/// Writer that encrypts everything written into an inner stream
///
/// The final (padded) block is written by [`CryptoWriter::finish`] or
/// [`CryptoWriter::flush_final_block`]. Either runs at most once; dropping an
/// unfinished writer finalizes it best-effort.
pub struct CryptoWriter<W: Write> {
    inner: Option<W>,
    cipher: Option<Aes256CbcEnc>,
    /// Plaintext tail shorter than one block
    pending: Zeroizing<Vec<u8>>,
    finalized: bool,
}

impl<W: Write> CryptoWriter<W> {
    pub(crate) fn pass_through(inner: W) -> Self {
        CryptoWriter {
            inner: Some(inner),
            cipher: None,
            pending: Zeroizing::new(Vec::new()),
            finalized: false,
        }
    }

    pub(crate) fn encrypting(inner: W, derived: &DerivedKeyIv) -> Result<Self> {
        let cipher = Aes256CbcEnc::new_from_slices(derived.key(), derived.iv())
            .map_err(|e| Error::KeyDerivation(format!("invalid key material: {}", e)))?;

        Ok(CryptoWriter {
            inner: Some(inner),
            cipher: Some(cipher),
            pending: Zeroizing::new(Vec::with_capacity(BLOCK_SIZE * 2)),
            finalized: false,
        })
    }

    /// Whether this writer encrypts (false for pass-through)
    pub fn is_encrypted(&self) -> bool {
        self.cipher.is_some()
    }

    /// Whether the final block has already been written
    pub fn has_flushed_final_block(&self) -> bool {
        self.finalized
    }

    /// Pad and write the final block, then flush the inner stream.
    ///
    /// Only the first call writes anything.
    pub fn flush_final_block(&mut self) -> io::Result<()> {
        if self.finalized {
            return Ok(());
        }
        self.finalized = true;

        let inner = self
            .inner
            .as_mut()
            .ok_or_else(|| io::Error::other("stream already released"))?;

        if let Some(cipher) = self.cipher.as_mut() {
            // Full blocks are flushed on write, so the tail is always short
            let len = self.pending.len();
            let mut block = Zeroizing::new([0u8; BLOCK_SIZE]);
            block[..len].copy_from_slice(&self.pending);
            Pkcs7::raw_pad(&mut block[..], len);
            self.pending.clear();

            cipher.encrypt_block_mut(GenericArray::from_mut_slice(&mut block[..]));
            inner.write_all(&block[..])?;
        }

        inner.flush()
    }

    /// Finalize and return the inner stream
    pub fn finish(mut self) -> io::Result<W> {
        self.flush_final_block()?;
        self.inner
            .take()
            .ok_or_else(|| io::Error::other("stream already released"))
    }
}

impl<W: Write> Write for CryptoWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.finalized {
            return Err(io::Error::other("write after final block"));
        }

        let inner = self
            .inner
            .as_mut()
            .ok_or_else(|| io::Error::other("stream already released"))?;

        let Some(cipher) = self.cipher.as_mut() else {
            return inner.write(buf);
        };

        self.pending.extend_from_slice(buf);
        let full = self.pending.len() / BLOCK_SIZE * BLOCK_SIZE;
        if full > 0 {
            let mut out = self.pending[..full].to_vec();
            for block in out.chunks_exact_mut(BLOCK_SIZE) {
                cipher.encrypt_block_mut(GenericArray::from_mut_slice(block));
            }
            self.pending.drain(..full);
            inner.write_all(&out)?;
        }

        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.inner.as_mut() {
            Some(inner) => inner.flush(),
            None => Ok(()),
        }
    }
}

impl<R> fmt::Debug for CryptoReader<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CryptoReader")
            .field("encrypted", &self.state.is_some())
            .finish()
    }
}

impl<W: Write> fmt::Debug for CryptoWriter<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CryptoWriter")
            .field("encrypted", &self.cipher.is_some())
            .field("finalized", &self.finalized)
            .finish()
    }
}

impl<W: Write> Drop for CryptoWriter<W> {
    fn drop(&mut self) {
        if self.inner.is_some() && !self.finalized {
            if let Err(e) = self.flush_final_block() {
                warn!("Failed to finalize cipher stream on drop: {}", e);
            }
        }
    }
}
