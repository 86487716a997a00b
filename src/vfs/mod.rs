//! Virtual filesystem layer
//!
//! One capability set ([`FileSystem`], [`Directory`], [`File`]) with two
//! implementations: the plain [`LocalFileSystem`] used for the source tree
//! and the [`CryptedFileSystem`] used for the destination, whose hierarchy
//! is reconstructed from encrypted per-directory indexes.
//!
//! A node's logical path is always built by walking its logical parents.
//! Physical locations never leak into it.

mod crypted;
mod local;

pub use crypted::{Container, CryptedDirectory, CryptedFile, CryptedFileSystem};
pub use local::{LocalDirectory, LocalFile, LocalFileSystem};

use crate::crypto::{CryptoReader, CryptoWriter};
use crate::error::Result;
use std::cmp::Ordering;
use std::path::Path;

/// Stream returned by [`File::open_read`]
pub type FileReader = CryptoReader<std::fs::File>;

/// Stream returned by [`File::open_write`]; call `finish` when done
pub type FileWriter = CryptoWriter<std::fs::File>;

/// Lazy sequence of child directories
pub type Directories<'a> = Box<dyn Iterator<Item = Box<dyn Directory + 'a>> + 'a>;

/// Lazy sequence of child files
pub type Files<'a> = Box<dyn Iterator<Item = Box<dyn File + 'a>> + 'a>;

/// A directory tree rooted at a physical directory
pub trait FileSystem: Send + Sync {
    /// Absolute physical path of the root
    fn root_directory(&self) -> &Path;

    /// Top-level directories, sorted by name
    fn enumerate_directories(&self) -> Directories<'_>;

    /// Top-level files, sorted by name
    fn enumerate_files(&self) -> Files<'_>;
}

pub trait Directory {
    /// Logical name
    fn name(&self) -> &str;

    /// Logical parent; `None` for top-level directories
    fn parent(&self) -> Option<&dyn Directory>;

    /// Physical location of the backing directory
    fn local_path(&self) -> &Path;

    /// Child directories, sorted by name
    fn enumerate_directories(&self) -> Directories<'_>;

    /// Child files, sorted by name
    fn enumerate_files(&self) -> Files<'_>;

    /// Logical path, e.g. `/a/b`
    fn path(&self) -> String {
        logical_path(self.name(), self.parent())
    }
}

pub trait File {
    /// Logical name
    fn name(&self) -> &str;

    /// Containing directory; `None` for top-level files
    fn directory(&self) -> Option<&dyn Directory>;

    /// Physical location of the backing file
    fn local_path(&self) -> &Path;

    /// Open the content for reading (decrypted where applicable)
    fn open_read(&self) -> Result<FileReader>;

    /// Open the content for writing, replacing what was there
    fn open_write(&self) -> Result<FileWriter>;

    /// Logical path, e.g. `/a/b/c.txt`
    fn path(&self) -> String {
        logical_path(self.name(), self.directory())
    }
}

/// Join a leaf name onto the logical names of its ancestors
fn logical_path(leaf: &str, parent: Option<&dyn Directory>) -> String {
    let mut parts = vec![leaf];
    let mut current = parent;
    while let Some(dir) = current {
        parts.push(dir.name());
        current = dir.parent();
    }
    parts.reverse();

    format!("/{}", parts.join("/"))
}

/// Case-insensitive name ordering with an ordinal tie-break
pub fn compare_names(a: &str, b: &str) -> Ordering {
    a.chars()
        .flat_map(char::to_lowercase)
        .cmp(b.chars().flat_map(char::to_lowercase))
        .then_with(|| a.cmp(b))
}
