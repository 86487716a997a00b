//! Crypter implementation
//!
//! A [`Crypter`] is either keyed (AES-256-CBC with a PBKDF2-derived key and
//! IV) or pass-through. Key material is derived per stream operation and
//! wiped together with the stream that used it.

use crate::crypto::{derive_key_iv, CryptoReader, CryptoWriter, CrypterParams};
use crate::error::{Error, Result};
use std::io::{self, Read, Write};

/// Symmetric stream crypter
#[derive(Debug, Clone)]
pub enum Crypter {
    /// Copies bytes unchanged
    PassThrough,
    /// Encrypts with a key derived from the parameters
    Keyed(CrypterParams),
}

impl Crypter {
    /// Create a keyed crypter from a password, with optional salt and
    /// iteration count
    pub fn keyed(password: &[u8], salt: Option<&[u8]>, iterations: Option<u32>) -> Result<Self> {
        Ok(Crypter::Keyed(CrypterParams::new(password, salt, iterations)?))
    }

    /// Keyed when parameters are given, pass-through otherwise
    pub fn from_params(params: Option<CrypterParams>) -> Self {
        match params {
            Some(params) => Crypter::Keyed(params),
            None => Crypter::PassThrough,
        }
    }

    /// Whether this crypter transforms data
    pub fn is_keyed(&self) -> bool {
        matches!(self, Crypter::Keyed(_))
    }

    /// Wrap a cipher-text stream so that reading yields plaintext
    pub fn open_read<R: Read>(&self, stream: R) -> Result<CryptoReader<R>> {
        match self {
            Crypter::PassThrough => Ok(CryptoReader::pass_through(stream)),
            Crypter::Keyed(params) => {
                let derived = derive_key_iv(params)?;
                CryptoReader::decrypting(stream, &derived)
            }
        }
    }

    /// Wrap a target stream so that written plaintext is stored encrypted
    pub fn open_write<W: Write>(&self, stream: W) -> Result<CryptoWriter<W>> {
        match self {
            Crypter::PassThrough => Ok(CryptoWriter::pass_through(stream)),
            Crypter::Keyed(params) => {
                let derived = derive_key_iv(params)?;
                CryptoWriter::encrypting(stream, &derived)
            }
        }
    }

    /// Encrypt everything from `src` into `dest`
    ///
    /// Returns the number of plaintext bytes consumed.
    pub fn encrypt<R: Read, W: Write>(&self, src: &mut R, dest: &mut W) -> Result<u64> {
        let mut writer = self.open_write(dest)?;
        let copied = io::copy(src, &mut writer)?;
        writer.finish()?;
        Ok(copied)
    }

    /// Decrypt everything from `src` into `dest`
    ///
    /// Returns the number of plaintext bytes produced. Bad padding or
    /// truncated input surfaces as [`Error::Undecryptable`].
    pub fn decrypt<R: Read, W: Write>(&self, src: &mut R, dest: &mut W) -> Result<u64> {
        let mut reader = self.open_read(src)?;
        let copied = io::copy(&mut reader, dest).map_err(Error::from_stream)?;
        dest.flush()?;
        Ok(copied)
    }

    /// Encrypt a buffer
    pub fn encrypt_to_vec(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(plaintext.len() + crate::crypto::BLOCK_SIZE);
        self.encrypt(&mut &plaintext[..], &mut out)?;
        Ok(out)
    }

    /// Decrypt a buffer
    pub fn decrypt_to_vec(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(ciphertext.len());
        self.decrypt(&mut &ciphertext[..], &mut out)?;
        Ok(out)
    }
}
