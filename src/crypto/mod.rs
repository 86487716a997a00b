//! Cryptography module for cryptsync
//!
//! Provides AES-256-CBC stream encryption with PBKDF2 key derivation.
//! Every file and every directory index is passed through a [`Crypter`]
//! before it touches the destination tree.

mod encryption;
mod kdf;
mod keys;
mod stream;

pub use encryption::Crypter;
pub use kdf::{derive_key_iv, DerivedKeyIv};
pub use keys::CrypterParams;
pub use stream::{CryptoReader, CryptoWriter};

/// Size of AES-256 key in bytes
pub const KEY_SIZE: usize = 32;

/// Size of the CBC initialization vector in bytes
pub const IV_SIZE: usize = 16;

/// AES block size in bytes
pub const BLOCK_SIZE: usize = 16;

/// Default PBKDF2 iteration count
pub const DEFAULT_ITERATIONS: u32 = 1000;

/// Salt used when none is configured
pub const DEFAULT_SALT: [u8; 32] = [
    0x70, 0x66, 0x58, 0xE6, 0x09, 0x2C, 0x79, 0x83, 0x5F, 0xD3, 0xC9, 0xFF, 0x6E, 0x0C, 0x08, 0xD9,
    0x81, 0x10, 0xC3, 0xF5, 0xAC, 0x94, 0x6B, 0x5B, 0xC8, 0xA7, 0xC4, 0x6E, 0x54, 0xD3, 0x9E, 0x29,
];
