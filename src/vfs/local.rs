//! Plain local filesystem
//!
//! Lists physical entries directly; logical names equal physical names.

use crate::crypto::{CryptoReader, CryptoWriter};
use crate::error::{Error, Result};
use crate::events::ErrorChannel;
use crate::vfs::{
    compare_names, Directories, Directory, File, FileReader, FileSystem, FileWriter, Files,
};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Source-side filesystem over a plaintext directory tree
#[derive(Debug)]
pub struct LocalFileSystem {
    root: PathBuf,
    errors: ErrorChannel,
}

impl LocalFileSystem {
    /// Create a filesystem rooted at `root` (relative paths resolve against
    /// the current directory)
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        Self::with_errors(root, ErrorChannel::new())
    }

    /// Create a filesystem that reports into an existing error channel
    pub fn with_errors(root: impl AsRef<Path>, errors: ErrorChannel) -> Result<Self> {
        let root = std::path::absolute(root.as_ref())?;
        Ok(LocalFileSystem { root, errors })
    }

    pub fn errors(&self) -> &ErrorChannel {
        &self.errors
    }

    /// Logical path (`/a/b.txt`) of a physical path below the root
    pub fn logical_path_of(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let parts: Vec<String> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        Some(format!("/{}", parts.join("/")))
    }
}

impl FileSystem for LocalFileSystem {
    fn root_directory(&self) -> &Path {
        &self.root
    }

    fn enumerate_directories(&self) -> Directories<'_> {
        let (dirs, _) = list_children(&self.root, &self.errors);
        Box::new(dirs.into_iter().map(move |(name, local_path)| {
            Box::new(LocalDirectory {
                fs: self,
                parent: None,
                name,
                local_path,
            }) as Box<dyn Directory + '_>
        }))
    }

    fn enumerate_files(&self) -> Files<'_> {
        let (_, files) = list_children(&self.root, &self.errors);
        Box::new(files.into_iter().map(|(name, local_path)| {
            Box::new(LocalFile {
                directory: None,
                name,
                local_path,
            }) as Box<dyn File + '_>
        }))
    }
}

/// Directory in a local filesystem
#[derive(Debug)]
pub struct LocalDirectory<'a> {
    fs: &'a LocalFileSystem,
    parent: Option<&'a LocalDirectory<'a>>,
    name: String,
    local_path: PathBuf,
}

impl Directory for LocalDirectory<'_> {
    fn name(&self) -> &str {
        &self.name
    }

    fn parent(&self) -> Option<&dyn Directory> {
        self.parent.map(|p| p as &dyn Directory)
    }

    fn local_path(&self) -> &Path {
        &self.local_path
    }

    fn enumerate_directories(&self) -> Directories<'_> {
        let (dirs, _) = list_children(&self.local_path, &self.fs.errors);
        Box::new(dirs.into_iter().map(move |(name, local_path)| {
            Box::new(LocalDirectory {
                fs: self.fs,
                parent: Some(self),
                name,
                local_path,
            }) as Box<dyn Directory + '_>
        }))
    }

    fn enumerate_files(&self) -> Files<'_> {
        let (_, files) = list_children(&self.local_path, &self.fs.errors);
        Box::new(files.into_iter().map(move |(name, local_path)| {
            Box::new(LocalFile {
                directory: Some(self),
                name,
                local_path,
            }) as Box<dyn File + '_>
        }))
    }
}

/// File in a local filesystem
#[derive(Debug)]
pub struct LocalFile<'a> {
    directory: Option<&'a LocalDirectory<'a>>,
    name: String,
    local_path: PathBuf,
}

impl File for LocalFile<'_> {
    fn name(&self) -> &str {
        &self.name
    }

    fn directory(&self) -> Option<&dyn Directory> {
        self.directory.map(|d| d as &dyn Directory)
    }

    fn local_path(&self) -> &Path {
        &self.local_path
    }

    fn open_read(&self) -> Result<FileReader> {
        let file = fs::File::open(&self.local_path)?;
        Ok(CryptoReader::pass_through(file))
    }

    fn open_write(&self) -> Result<FileWriter> {
        let file = fs::OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&self.local_path)?;
        Ok(CryptoWriter::pass_through(file))
    }
}

type Children = Vec<(String, PathBuf)>;

/// Physical children of `path`, split into directories and files, each
/// sorted by name. A missing directory has no children.
fn list_children(path: &Path, errors: &ErrorChannel) -> (Children, Children) {
    let mut dirs = Vec::new();
    let mut files = Vec::new();

    let entries = match fs::read_dir(path) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!("Directory {:?} does not exist", path);
            return (dirs, files);
        }
        Err(e) => {
            errors.report(&Error::Io(e));
            return (dirs, files);
        }
    };

    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                errors.report(&Error::Io(e));
                continue;
            }
        };

        let child = entry.path();
        // Follow symlinks like a regular listing would
        let metadata = match fs::metadata(&child) {
            Ok(m) => m,
            Err(e) => {
                errors.report(&Error::Io(e));
                continue;
            }
        };

        let name = entry.file_name().to_string_lossy().into_owned();
        if metadata.is_dir() {
            dirs.push((name, child));
        } else if metadata.is_file() {
            files.push((name, child));
        }
    }

    dirs.sort_by(|a, b| compare_names(&a.0, &b.0));
    files.sort_by(|a, b| compare_names(&a.0, &b.0));
    (dirs, files)
}
