//! PBKDF2 key derivation
//!
//! Key and IV are taken from one PBKDF2-HMAC-SHA1 output stream: the first
//! 32 bytes form the AES-256 key, the following 16 bytes the CBC IV.

use crate::crypto::{CrypterParams, IV_SIZE, KEY_SIZE};
use crate::error::{Error, Result};
use ring::pbkdf2;
use std::num::NonZeroU32;
use zeroize::Zeroizing;

/// Key and IV derived for a single stream operation
pub struct DerivedKeyIv {
    material: Zeroizing<[u8; KEY_SIZE + IV_SIZE]>,
}

impl DerivedKeyIv {
    /// Get the AES-256 key
    pub fn key(&self) -> &[u8] {
        &self.material[..KEY_SIZE]
    }

    /// Get the CBC initialization vector
    pub fn iv(&self) -> &[u8] {
        &self.material[KEY_SIZE..]
    }
}

/// Derive key and IV from crypter parameters
pub fn derive_key_iv(params: &CrypterParams) -> Result<DerivedKeyIv> {
    let iterations = NonZeroU32::new(params.iterations())
        .ok_or_else(|| Error::KeyDerivation("iteration count must be positive".to_string()))?;

    let mut material = Zeroizing::new([0u8; KEY_SIZE + IV_SIZE]);
    pbkdf2::derive(
        pbkdf2::PBKDF2_HMAC_SHA1,
        iterations,
        params.salt(),
        params.password(),
        &mut material[..],
    );

    Ok(DerivedKeyIv { material })
}
