//! cryptsync - Encrypted mirror of a plaintext directory tree
//!
//! This library keeps an encrypted copy of a source directory: names on the
//! destination are obfuscated, content is encrypted per file, and an
//! encrypted index in every directory reconstructs the logical hierarchy.
//! Changes on the source are watched and queued as tasks.

pub mod config;
pub mod crypto;
pub mod error;
pub mod events;
pub mod metadata;
pub mod sync;
pub mod task;
pub mod vfs;

pub use config::Config;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::crypto::{Crypter, CrypterParams};
    pub use crate::error::{Error, Result};
    pub use crate::events::{ErrorChannel, Events, Lifecycle};
    pub use crate::sync::{ChangeEvent, ContextState, SyncContext};
    pub use crate::task::{Task, TaskKind, TaskManager, TaskRunner};
    pub use crate::vfs::{
        Container, CryptedFileSystem, Directory, File, FileSystem, LocalFileSystem,
    };
}
