//! Crypter parameters
//!
//! Holds the password/salt/iteration triple a key is derived from. Both
//! secrets live in zeroizing buffers and are wiped when the parameters drop.

use crate::crypto::{DEFAULT_ITERATIONS, DEFAULT_SALT};
use crate::error::{Error, Result};
use rand::RngCore;
use std::fmt;
use zeroize::Zeroizing;

/// Length of generated per-file passwords
pub const GENERATED_PASSWORD_LEN: usize = 32;

/// Length of generated per-file salts
pub const GENERATED_SALT_LEN: usize = 16;

/// Password, salt and PBKDF2 iteration count for one keyed crypter
#[derive(Clone)]
pub struct CrypterParams {
    password: Zeroizing<Vec<u8>>,
    salt: Zeroizing<Vec<u8>>,
    iterations: u32,
}

impl CrypterParams {
    /// Build validated parameters.
    ///
    /// A missing salt falls back to [`DEFAULT_SALT`], a missing iteration
    /// count to [`DEFAULT_ITERATIONS`]. The password must not be empty, an
    /// explicit salt must hold at least one byte and iterations must be
    /// positive.
    pub fn new(password: &[u8], salt: Option<&[u8]>, iterations: Option<u32>) -> Result<Self> {
        if password.is_empty() {
            return Err(Error::InvalidArgument("password must not be empty".to_string()));
        }

        let salt = match salt {
            Some([]) => {
                return Err(Error::InvalidArgument(
                    "salt must hold at least one byte".to_string(),
                ))
            }
            Some(salt) => salt,
            None => &DEFAULT_SALT[..],
        };

        let iterations = iterations.unwrap_or(DEFAULT_ITERATIONS);
        if iterations == 0 {
            return Err(Error::InvalidArgument(
                "iteration count must be greater than 0".to_string(),
            ));
        }

        Ok(CrypterParams {
            password: Zeroizing::new(password.to_vec()),
            salt: Zeroizing::new(salt.to_vec()),
            iterations,
        })
    }

    /// Parameters with the default salt and iteration count
    pub fn with_password(password: &[u8]) -> Result<Self> {
        Self::new(password, None, None)
    }

    /// Fresh random password and salt, for per-file keys
    pub fn generate(iterations: Option<u32>) -> Result<Self> {
        let mut password = Zeroizing::new([0u8; GENERATED_PASSWORD_LEN]);
        let mut salt = [0u8; GENERATED_SALT_LEN];
        rand::thread_rng().fill_bytes(&mut password[..]);
        rand::thread_rng().fill_bytes(&mut salt);

        Self::new(&password[..], Some(&salt), iterations)
    }

    /// Get the raw password bytes
    pub fn password(&self) -> &[u8] {
        &self.password
    }

    /// Get the salt
    pub fn salt(&self) -> &[u8] {
        &self.salt
    }

    /// Get the PBKDF2 iteration count
    pub fn iterations(&self) -> u32 {
        self.iterations
    }
}

impl fmt::Debug for CrypterParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CrypterParams")
            .field("password", &"<redacted>")
            .field("salt_len", &self.salt.len())
            .field("iterations", &self.iterations)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_applied() {
        let params = CrypterParams::with_password(b"p").unwrap();
        assert_eq!(params.salt(), &DEFAULT_SALT[..]);
        assert_eq!(params.iterations(), DEFAULT_ITERATIONS);
    }

    #[test]
    fn test_empty_password_rejected() {
        let err = CrypterParams::new(b"", None, None).unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn test_empty_salt_rejected() {
        let err = CrypterParams::new(b"p", Some(&[]), None).unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn test_zero_iterations_rejected() {
        let err = CrypterParams::new(b"p", None, Some(0)).unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn test_generated_keys_differ() {
        let a = CrypterParams::generate(Some(10)).unwrap();
        let b = CrypterParams::generate(Some(10)).unwrap();

        assert_eq!(a.password().len(), GENERATED_PASSWORD_LEN);
        assert_eq!(a.salt().len(), GENERATED_SALT_LEN);
        assert_ne!(a.password(), b.password());
        assert_eq!(a.iterations(), 10);
    }

    #[test]
    fn test_debug_redacts_password() {
        let params = CrypterParams::with_password(b"hunter2").unwrap();
        let printed = format!("{:?}", params);
        assert!(!printed.contains("hunter2"));
    }
}
