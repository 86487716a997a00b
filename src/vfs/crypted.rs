//! Crypted filesystem
//!
//! The destination tree stores every object under a random real name. Each
//! physical directory carries an encrypted index that maps logical child
//! names to real names and per-file crypter parameters. Enumeration is
//! driven by the index; the disk decides whether an indexed object still
//! exists.

use crate::crypto::{Crypter, CrypterParams};
use crate::error::{Error, Result};
use crate::events::ErrorChannel;
use crate::metadata::{
    validate_logical_name, validate_real_name, DirectoryEntry, FileEntry, IndexEntry, MetaIndex,
    RemovedEntry,
};
use crate::vfs::{Directories, Directory, File, FileReader, FileSystem, FileWriter, Files};
use chrono::Utc;
use parking_lot::Mutex;
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use uuid::Uuid;

/// Write-side operations shared by the crypted root and its directories
pub trait Container {
    /// Logical path of this container (`/` for the root)
    fn logical_path(&self) -> String;

    /// Live child directories, sorted by name
    fn directories(&self) -> Box<dyn Iterator<Item = CryptedDirectory<'_>> + '_>;

    /// Live child files, sorted by name
    fn files(&self) -> Box<dyn Iterator<Item = CryptedFile<'_>> + '_>;

    /// Child directory by exact logical name
    fn find_directory(&self, name: &str) -> Option<CryptedDirectory<'_>>;

    /// Child file by exact logical name
    fn find_file(&self, name: &str) -> Option<CryptedFile<'_>>;

    /// Create a child directory under a fresh real name
    fn create_directory(&self, name: &str) -> Result<CryptedDirectory<'_>>;

    /// Create an empty child file; `None` stores its content as plaintext
    fn create_file(&self, name: &str, crypter: Option<CrypterParams>) -> Result<CryptedFile<'_>>;

    /// Remove a child entry and its physical object. Returns whether an
    /// entry was removed.
    fn remove(&self, name: &str) -> Result<bool>;

    /// Bump the change time of a child file entry
    fn touch(&self, name: &str) -> Result<()>;

    /// Return the child directory `name`, creating it if needed
    fn ensure_directory(&self, name: &str) -> Result<CryptedDirectory<'_>> {
        match self.find_directory(name) {
            Some(dir) => Ok(dir),
            None => self.create_directory(name),
        }
    }
}

/// Destination-side filesystem with obfuscated names and encrypted content
pub struct CryptedFileSystem {
    root: PathBuf,
    /// Filesystem-level crypter protecting the directory indexes
    crypter: Crypter,
    errors: ErrorChannel,
    /// Serializes index read-modify-write cycles
    index_lock: Mutex<()>,
}

impl CryptedFileSystem {
    /// Create a filesystem rooted at `root` (relative paths resolve against
    /// the current directory)
    pub fn new(root: impl AsRef<Path>, crypter: Crypter) -> Result<Self> {
        Self::with_errors(root, crypter, ErrorChannel::new())
    }

    /// Create a filesystem that reports into an existing error channel
    pub fn with_errors(
        root: impl AsRef<Path>,
        crypter: Crypter,
        errors: ErrorChannel,
    ) -> Result<Self> {
        let root = std::path::absolute(root.as_ref())?;
        Ok(CryptedFileSystem {
            root,
            crypter,
            errors,
            index_lock: Mutex::new(()),
        })
    }

    /// The crypter protecting the directory indexes
    pub fn crypter(&self) -> &Crypter {
        &self.crypter
    }

    pub fn errors(&self) -> &ErrorChannel {
        &self.errors
    }

    /// Load the index of a physical directory.
    ///
    /// A missing index is an empty one. Unreadable or undecryptable indexes
    /// are reported on the error channel and returned as errors.
    pub fn load_index(&self, dir: &Path) -> Result<MetaIndex> {
        match MetaIndex::read_from(dir, &self.crypter) {
            Ok(index) => Ok(index.unwrap_or_default()),
            Err(e) => {
                self.errors.report(&e);
                Err(e)
            }
        }
    }

    /// Store the index of a physical directory
    pub fn save_index(&self, dir: &Path, index: &MetaIndex) -> Result<()> {
        index.write_to(dir, &self.crypter)
    }

    /// Index used for enumeration: any failure reads as an empty directory
    fn index_or_empty(&self, dir: &Path) -> MetaIndex {
        match MetaIndex::read_from(dir, &self.crypter) {
            Ok(index) => index.unwrap_or_default(),
            Err(e) => {
                debug!("Treating {:?} as empty, index unusable: {}", dir, e);
                MetaIndex::new()
            }
        }
    }

    fn location(&self) -> Location<'_> {
        Location {
            fs: self,
            local_path: &self.root,
            parent: None,
        }
    }
}

impl Container for CryptedFileSystem {
    fn logical_path(&self) -> String {
        "/".to_string()
    }

    fn directories(&self) -> Box<dyn Iterator<Item = CryptedDirectory<'_>> + '_> {
        Box::new(self.location().directories())
    }

    fn files(&self) -> Box<dyn Iterator<Item = CryptedFile<'_>> + '_> {
        Box::new(self.location().files())
    }

    fn find_directory(&self, name: &str) -> Option<CryptedDirectory<'_>> {
        self.location().find_directory(name)
    }

    fn find_file(&self, name: &str) -> Option<CryptedFile<'_>> {
        self.location().find_file(name)
    }

    fn create_directory(&self, name: &str) -> Result<CryptedDirectory<'_>> {
        self.location().create_directory(name)
    }

    fn create_file(&self, name: &str, crypter: Option<CrypterParams>) -> Result<CryptedFile<'_>> {
        self.location().create_file(name, crypter)
    }

    fn remove(&self, name: &str) -> Result<bool> {
        self.location().remove(name)
    }

    fn touch(&self, name: &str) -> Result<()> {
        self.location().touch(name)
    }
}

impl std::fmt::Debug for CryptedFileSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptedFileSystem")
            .field("root", &self.root)
            .field("keyed", &self.crypter.is_keyed())
            .finish()
    }
}

impl FileSystem for CryptedFileSystem {
    fn root_directory(&self) -> &Path {
        &self.root
    }

    fn enumerate_directories(&self) -> Directories<'_> {
        Box::new(
            self.directories()
                .map(|d| Box::new(d) as Box<dyn Directory + '_>),
        )
    }

    fn enumerate_files(&self) -> Files<'_> {
        Box::new(self.files().map(|f| Box::new(f) as Box<dyn File + '_>))
    }
}

/// Directory in a crypted filesystem
#[derive(Debug)]
pub struct CryptedDirectory<'a> {
    fs: &'a CryptedFileSystem,
    parent: Option<&'a CryptedDirectory<'a>>,
    entry: DirectoryEntry,
    local_path: PathBuf,
}

impl<'a> CryptedDirectory<'a> {
    /// The index entry this directory was built from
    pub fn entry(&self) -> &DirectoryEntry {
        &self.entry
    }

    /// Typed parent accessor
    pub fn parent_directory(&self) -> Option<&'a CryptedDirectory<'a>> {
        self.parent
    }

    fn location(&self) -> Location<'_> {
        Location {
            fs: self.fs,
            local_path: &self.local_path,
            parent: Some(self),
        }
    }

    /// Load this directory's own index, reporting failures
    pub fn load_index(&self) -> Result<MetaIndex> {
        self.fs.load_index(&self.local_path)
    }
}

impl Container for CryptedDirectory<'_> {
    fn logical_path(&self) -> String {
        self.path()
    }

    fn directories(&self) -> Box<dyn Iterator<Item = CryptedDirectory<'_>> + '_> {
        Box::new(self.location().directories())
    }

    fn files(&self) -> Box<dyn Iterator<Item = CryptedFile<'_>> + '_> {
        Box::new(self.location().files())
    }

    fn find_directory(&self, name: &str) -> Option<CryptedDirectory<'_>> {
        self.location().find_directory(name)
    }

    fn find_file(&self, name: &str) -> Option<CryptedFile<'_>> {
        self.location().find_file(name)
    }

    fn create_directory(&self, name: &str) -> Result<CryptedDirectory<'_>> {
        self.location().create_directory(name)
    }

    fn create_file(&self, name: &str, crypter: Option<CrypterParams>) -> Result<CryptedFile<'_>> {
        self.location().create_file(name, crypter)
    }

    fn remove(&self, name: &str) -> Result<bool> {
        self.location().remove(name)
    }

    fn touch(&self, name: &str) -> Result<()> {
        self.location().touch(name)
    }
}

impl Directory for CryptedDirectory<'_> {
    fn name(&self) -> &str {
        &self.entry.name
    }

    fn parent(&self) -> Option<&dyn Directory> {
        self.parent.map(|p| p as &dyn Directory)
    }

    fn local_path(&self) -> &Path {
        &self.local_path
    }

    fn enumerate_directories(&self) -> Directories<'_> {
        Box::new(
            self.directories()
                .map(|d| Box::new(d) as Box<dyn Directory + '_>),
        )
    }

    fn enumerate_files(&self) -> Files<'_> {
        Box::new(self.files().map(|f| Box::new(f) as Box<dyn File + '_>))
    }
}

/// File in a crypted filesystem
#[derive(Debug)]
pub struct CryptedFile<'a> {
    fs: &'a CryptedFileSystem,
    directory: Option<&'a CryptedDirectory<'a>>,
    entry: FileEntry,
    local_path: PathBuf,
}

impl<'a> CryptedFile<'a> {
    /// The index entry this file was built from
    pub fn entry(&self) -> &FileEntry {
        &self.entry
    }

    /// Typed directory accessor
    pub fn parent_directory(&self) -> Option<&'a CryptedDirectory<'a>> {
        self.directory
    }

    /// Resolve the content crypter from the entry
    pub fn crypter(&self) -> Result<Crypter> {
        self.entry.crypter()
    }

    /// Decrypt the whole content into `dest`
    pub fn copy_to<W: Write>(&self, dest: &mut W) -> Result<u64> {
        let mut reader = self.open_read()?;
        io::copy(&mut reader, dest)
            .map_err(Error::from_stream)
            .map_err(|e| self.report(e))
    }

    /// Decrypt the whole content into memory
    pub fn read_all(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.copy_to(&mut out)?;
        Ok(out)
    }

    /// Replace the content with everything from `src` and bump the change
    /// time in the index
    pub fn write_from<R: Read>(&self, src: &mut R) -> Result<u64> {
        let mut writer = self.open_write()?;
        let copied = io::copy(src, &mut writer)?;
        writer.finish()?;

        self.touch()?;
        Ok(copied)
    }

    /// Set the entry's change time to now
    pub fn touch(&self) -> Result<()> {
        let location = Location {
            fs: self.fs,
            local_path: self
                .directory
                .map(|d| d.local_path.as_path())
                .unwrap_or(self.fs.root.as_path()),
            parent: self.directory,
        };
        location.touch(&self.entry.name)
    }

    fn report(&self, e: Error) -> Error {
        self.fs.errors.report(&e);
        e
    }
}

impl File for CryptedFile<'_> {
    fn name(&self) -> &str {
        &self.entry.name
    }

    fn directory(&self) -> Option<&dyn Directory> {
        self.directory.map(|d| d as &dyn Directory)
    }

    fn local_path(&self) -> &Path {
        &self.local_path
    }

    fn open_read(&self) -> Result<FileReader> {
        let file = fs::File::open(&self.local_path).map_err(|e| self.report(e.into()))?;
        // On failure `file` is dropped here, closing the physical handle
        self.crypter()
            .and_then(|crypter| crypter.open_read(file))
            .map_err(|e| self.report(e))
    }

    fn open_write(&self) -> Result<FileWriter> {
        let file = fs::OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&self.local_path)
            .map_err(|e| self.report(e.into()))?;
        self.crypter()
            .and_then(|crypter| crypter.open_write(file))
            .map_err(|e| self.report(e))
    }
}

/// A physical directory whose index lists children, plus the logical parent
/// that children should point back to
#[derive(Clone, Copy)]
struct Location<'a> {
    fs: &'a CryptedFileSystem,
    local_path: &'a Path,
    parent: Option<&'a CryptedDirectory<'a>>,
}

impl<'a> Location<'a> {
    fn directories(self) -> impl Iterator<Item = CryptedDirectory<'a>> + 'a {
        let (entries, _) = self.fs.index_or_empty(self.local_path).into_live();
        entries.into_iter().filter_map(move |entry| {
            let local_path = self.resolve(&entry, true)?;
            Some(CryptedDirectory {
                fs: self.fs,
                parent: self.parent,
                entry,
                local_path,
            })
        })
    }

    fn files(self) -> impl Iterator<Item = CryptedFile<'a>> + 'a {
        let (_, entries) = self.fs.index_or_empty(self.local_path).into_live();
        entries.into_iter().filter_map(move |entry| {
            let local_path = self.resolve(&entry, false)?;
            Some(CryptedFile {
                fs: self.fs,
                directory: self.parent,
                entry,
                local_path,
            })
        })
    }

    /// Physical path of a live entry, or `None` when the entry is unusable
    /// or its object no longer exists
    fn resolve<E: IndexEntry>(&self, entry: &E, want_dir: bool) -> Option<PathBuf> {
        let real_name = entry.real_name()?;
        if let Err(e) = validate_real_name(real_name) {
            self.fs.errors.report(&e);
            return None;
        }

        let path = self.local_path.join(real_name);
        match fs::metadata(&path) {
            Ok(m) if (want_dir && m.is_dir()) || (!want_dir && m.is_file()) => Some(path),
            Ok(_) => {
                debug!("Skipping '{}': {:?} has the wrong type", entry.name(), path);
                None
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("Skipping '{}': {:?} no longer exists", entry.name(), path);
                None
            }
            Err(e) => {
                self.fs.errors.report(&Error::Io(e));
                None
            }
        }
    }

    fn find_directory(self, name: &str) -> Option<CryptedDirectory<'a>> {
        self.directories().find(|d| d.entry.name == name)
    }

    fn find_file(self, name: &str) -> Option<CryptedFile<'a>> {
        self.files().find(|f| f.entry.name == name)
    }

    fn child_path(&self, name: &str) -> String {
        match self.parent {
            Some(parent) => format!("{}/{}", parent.path(), name),
            None => format!("/{}", name),
        }
    }

    /// Load the index for modification, dropping a stale entry for `name`
    /// whose physical object has vanished
    fn index_for_insert(&self, name: &str) -> Result<MetaIndex> {
        let mut index = self.fs.load_index(self.local_path)?;

        let existing = index
            .directory(name)
            .and_then(|d| d.real_name.clone())
            .or_else(|| index.file(name).and_then(|f| f.real_name.clone()));

        if let Some(real_name) = existing {
            let alive = validate_real_name(&real_name).is_ok()
                && self.local_path.join(&real_name).exists();
            if alive {
                return Err(Error::AlreadyExists(self.child_path(name)));
            }
            debug!("Replacing stale entry '{}'", name);
            index.remove(name);
        }

        Ok(index)
    }

    fn create_directory(self, name: &str) -> Result<CryptedDirectory<'a>> {
        validate_logical_name(name)?;
        let _guard = self.fs.index_lock.lock();

        let mut index = self.index_for_insert(name)?;
        let real_name = new_real_name();
        let local_path = self.local_path.join(&real_name);
        fs::create_dir_all(&local_path)?;

        let entry = DirectoryEntry::new(name, real_name);
        index.directories.push(entry.clone());
        if let Err(e) = self.fs.save_index(self.local_path, &index) {
            let _ = fs::remove_dir_all(&local_path);
            return Err(e);
        }

        info!("Created directory {}", self.child_path(name));
        Ok(CryptedDirectory {
            fs: self.fs,
            parent: self.parent,
            entry,
            local_path,
        })
    }

    fn create_file(self, name: &str, crypter: Option<CrypterParams>) -> Result<CryptedFile<'a>> {
        validate_logical_name(name)?;
        let _guard = self.fs.index_lock.lock();

        let mut index = self.index_for_insert(name)?;
        fs::create_dir_all(self.local_path)?;

        let real_name = new_real_name();
        let local_path = self.local_path.join(&real_name);
        fs::File::create(&local_path)?;

        let file = CryptedFile {
            fs: self.fs,
            directory: self.parent,
            entry: FileEntry::new(name, real_name, crypter.as_ref()),
            local_path,
        };

        // Keyed content always carries at least the padding block
        let stored = file
            .open_write()
            .and_then(|w| w.finish().map_err(Error::from))
            .and_then(|_| {
                index.files.push(file.entry.clone());
                self.fs.save_index(self.local_path, &index)
            });
        if let Err(e) = stored {
            let _ = fs::remove_file(&file.local_path);
            return Err(e);
        }

        info!("Created file {}", self.child_path(name));
        Ok(file)
    }

    fn touch(self, name: &str) -> Result<()> {
        let _guard = self.fs.index_lock.lock();

        let mut index = self.fs.load_index(self.local_path)?;
        match index.file_mut(name) {
            Some(entry) => entry.changed_at = Some(Utc::now()),
            None => return Err(Error::PathNotFound(PathBuf::from(self.child_path(name)))),
        }
        self.fs.save_index(self.local_path, &index)
    }

    fn remove(self, name: &str) -> Result<bool> {
        let _guard = self.fs.index_lock.lock();

        let mut index = self.fs.load_index(self.local_path)?;
        let Some(removed) = index.remove(name) else {
            return Ok(false);
        };
        self.fs.save_index(self.local_path, &index)?;

        if let Some(real_name) = removed.real_name() {
            if validate_real_name(real_name).is_ok() {
                let path = self.local_path.join(real_name);
                let result = match removed {
                    RemovedEntry::Directory(_) => fs::remove_dir_all(&path),
                    RemovedEntry::File(_) => fs::remove_file(&path),
                };
                match result {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => {
                        self.fs.errors.report(&Error::Io(e));
                    }
                }
            }
        }

        info!("Removed {}", self.child_path(name));
        Ok(true)
    }
}

fn new_real_name() -> String {
    Uuid::new_v4().simple().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{EntryCrypter, INDEX_FILE};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn fs_crypter() -> Crypter {
        Crypter::keyed(b"fs-key", None, Some(10)).unwrap()
    }

    fn crypted(temp: &TempDir) -> CryptedFileSystem {
        CryptedFileSystem::new(temp.path(), fs_crypter()).unwrap()
    }

    fn file_key() -> CrypterParams {
        CrypterParams::new(b"file-key", Some(b"file-salt"), Some(10)).unwrap()
    }

    fn raw_dir(name: &str, real: Option<&str>) -> DirectoryEntry {
        DirectoryEntry {
            name: name.to_string(),
            real_name: real.map(str::to_string),
            ..Default::default()
        }
    }

    #[test]
    fn test_logical_path_independent_of_real_names() {
        let temp = TempDir::new().unwrap();
        let fs = crypted(&temp);

        {
            let root = fs.create_directory("root").unwrap();
            let a = root.create_directory("a").unwrap();
            let b = a.create_directory("b").unwrap();
            b.create_file("c.txt", Some(file_key())).unwrap();
        }

        let root = fs.find_directory("root").unwrap();
        let a = root.find_directory("a").unwrap();
        let b = a.find_directory("b").unwrap();
        let c = b.find_file("c.txt").unwrap();

        assert_eq!(c.path(), "/root/a/b/c.txt");
        assert_eq!(b.path(), "/root/a/b");
        for (logical, physical) in [("a", a.local_path()), ("b", b.local_path())] {
            assert_ne!(physical.file_name().unwrap(), logical);
        }
        assert_ne!(c.local_path().file_name().unwrap(), "c.txt");
    }

    #[test]
    fn test_missing_index_is_empty() {
        let temp = TempDir::new().unwrap();
        let fs = crypted(&temp);

        assert_eq!(fs.enumerate_directories().count(), 0);
        assert_eq!(fs.enumerate_files().count(), 0);
    }

    #[test]
    fn test_corrupt_index_is_empty_but_reported_on_explicit_load() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join(INDEX_FILE), b"definitely not an index").unwrap();

        let fs = crypted(&temp);
        let reported = Arc::new(Mutex::new(0usize));
        let counter = Arc::clone(&reported);
        fs.errors().subscribe(move |_| *counter.lock() += 1);

        assert_eq!(fs.enumerate_directories().count(), 0);
        assert_eq!(fs.enumerate_files().count(), 0);
        assert_eq!(*reported.lock(), 0);

        let err = fs.load_index(fs.root_directory()).unwrap_err();
        assert!(err.is_undecryptable());
        assert_eq!(*reported.lock(), 1);
    }

    #[test]
    fn test_tombstones_filtered() {
        let temp = TempDir::new().unwrap();
        let fs = crypted(&temp);
        fs::create_dir(temp.path().join("live")).unwrap();

        let mut index = MetaIndex::new();
        index.directories = vec![
            raw_dir("missing-real-name", None),
            raw_dir("blank-real-name", Some("  ")),
            raw_dir("kept", Some("live")),
        ];
        fs.save_index(temp.path(), &index).unwrap();

        let names: Vec<String> = fs.enumerate_directories().map(|d| d.name().to_string()).collect();
        assert_eq!(names, vec!["kept"]);
    }

    #[test]
    fn test_vanished_objects_skipped() {
        let temp = TempDir::new().unwrap();
        let fs = crypted(&temp);

        let gone = fs.create_directory("gone").unwrap().local_path().to_path_buf();
        fs.create_directory("stays").unwrap();
        let gone_file = fs.create_file("gone.txt", None).unwrap().local_path().to_path_buf();

        fs::remove_dir_all(&gone).unwrap();
        fs::remove_file(&gone_file).unwrap();

        let index = fs.load_index(fs.root_directory()).unwrap();
        assert!(index.directory("gone").is_some());

        let names: Vec<String> = fs.enumerate_directories().map(|d| d.name().to_string()).collect();
        assert_eq!(names, vec!["stays"]);
        assert_eq!(fs.enumerate_files().count(), 0);
    }

    #[test]
    fn test_enumeration_sorted_from_unsorted_index() {
        let temp = TempDir::new().unwrap();
        let fs = crypted(&temp);

        let mut index = MetaIndex::new();
        for (name, real) in [("delta", "r1"), ("Bravo", "r2"), ("alpha", "r3"), ("Charlie", "r4")] {
            fs::create_dir(temp.path().join(real)).unwrap();
            index.directories.push(raw_dir(name, Some(real)));
        }
        fs.save_index(temp.path(), &index).unwrap();

        let names: Vec<String> = fs.enumerate_directories().map(|d| d.name().to_string()).collect();
        assert_eq!(names, vec!["alpha", "Bravo", "Charlie", "delta"]);
    }

    fn raw_file(name: &str, real: &str) -> FileEntry {
        FileEntry {
            name: name.to_string(),
            real_name: Some(real.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_file_enumeration_sorted_from_unsorted_index() {
        let temp = TempDir::new().unwrap();
        let fs = crypted(&temp);

        let mut index = MetaIndex::new();
        for (name, real) in [("zulu.txt", "f1"), ("Echo.txt", "f2"), ("alpha.txt", "f3")] {
            fs::write(temp.path().join(real), b"").unwrap();
            index.files.push(raw_file(name, real));
        }
        fs.save_index(temp.path(), &index).unwrap();

        let names: Vec<String> = fs.enumerate_files().map(|f| f.name().to_string()).collect();
        assert_eq!(names, vec!["alpha.txt", "Echo.txt", "zulu.txt"]);
    }

    #[test]
    fn test_wrong_object_kind_skipped() {
        let temp = TempDir::new().unwrap();
        let fs = crypted(&temp);
        fs::create_dir(temp.path().join("is-a-dir")).unwrap();
        fs::write(temp.path().join("is-a-file"), b"").unwrap();

        let mut index = MetaIndex::new();
        index.files.push(raw_file("listed-as-file", "is-a-dir"));
        index.directories.push(raw_dir("listed-as-dir", Some("is-a-file")));
        fs.save_index(temp.path(), &index).unwrap();

        let reported = Arc::new(Mutex::new(0usize));
        let counter = Arc::clone(&reported);
        fs.errors().subscribe(move |_| *counter.lock() += 1);

        assert_eq!(fs.enumerate_files().count(), 0);
        assert_eq!(fs.enumerate_directories().count(), 0);
        assert!(fs.find_file("listed-as-file").is_none());
        assert_eq!(*reported.lock(), 0);
    }

    #[test]
    fn test_invalid_real_name_reported_and_skipped() {
        let temp = TempDir::new().unwrap();
        let fs = crypted(&temp);
        fs::create_dir(temp.path().join("ok")).unwrap();

        let mut index = MetaIndex::new();
        index.directories = vec![raw_dir("escape", Some("../outside")), raw_dir("fine", Some("ok"))];
        fs.save_index(temp.path(), &index).unwrap();

        let reported = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&reported);
        fs.errors().subscribe(move |e| sink.lock().push(e.to_string()));

        let names: Vec<String> = fs.enumerate_directories().map(|d| d.name().to_string()).collect();
        assert_eq!(names, vec!["fine"]);
        assert_eq!(reported.lock().len(), 1);
    }

    #[test]
    fn test_keyed_file_content_round_trip() {
        let temp = TempDir::new().unwrap();
        let fs = crypted(&temp);

        let file = fs.create_file("secret.txt", Some(file_key())).unwrap();
        assert_eq!(file.read_all().unwrap(), b"");

        file.write_from(&mut &b"hello"[..]).unwrap();
        assert_eq!(file.read_all().unwrap(), b"hello");

        let raw = fs::read(file.local_path()).unwrap();
        assert_ne!(raw, b"hello");

        // The filesystem key does not open per-file content
        match fs.crypter().decrypt_to_vec(&raw) {
            Ok(garbage) => assert_ne!(garbage, b"hello"),
            Err(e) => assert!(e.is_undecryptable()),
        }
    }

    #[test]
    fn test_plain_file_stored_as_is() {
        let temp = TempDir::new().unwrap();
        let fs = crypted(&temp);

        let file = fs.create_file("plain.txt", None).unwrap();
        file.write_from(&mut &b"visible"[..]).unwrap();

        assert_eq!(fs::read(file.local_path()).unwrap(), b"visible");
        let found = fs.find_file("plain.txt").unwrap();
        assert_eq!(found.read_all().unwrap(), b"visible");
    }

    #[test]
    fn test_write_from_updates_change_time() {
        let temp = TempDir::new().unwrap();
        let fs = crypted(&temp);

        let file = fs.create_file("t.txt", None).unwrap();
        let before = file.entry().changed_at.unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        file.write_from(&mut &b"x"[..]).unwrap();

        let after = fs.find_file("t.txt").unwrap().entry().changed_at.unwrap();
        assert!(after > before);
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let temp = TempDir::new().unwrap();
        let fs = crypted(&temp);

        fs.create_directory("docs").unwrap();
        let err = fs.create_file("docs", None).unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));

        let again = fs.ensure_directory("docs").unwrap();
        assert_eq!(again.name(), "docs");
        assert_eq!(fs.enumerate_directories().count(), 1);
    }

    #[test]
    fn test_stale_entry_replaced_on_create() {
        let temp = TempDir::new().unwrap();
        let fs = crypted(&temp);

        let old = fs.create_directory("docs").unwrap().local_path().to_path_buf();
        fs::remove_dir_all(&old).unwrap();

        let fresh = fs.create_directory("docs").unwrap();
        assert_ne!(fresh.local_path(), old.as_path());
        assert_eq!(fs.load_index(fs.root_directory()).unwrap().directories.len(), 1);
    }

    #[test]
    fn test_remove_deletes_entry_and_object() {
        let temp = TempDir::new().unwrap();
        let fs = crypted(&temp);

        let dir_path = {
            let docs = fs.create_directory("docs").unwrap();
            docs.create_file("inner.txt", None).unwrap();
            docs.local_path().to_path_buf()
        };

        assert!(fs.remove("docs").unwrap());
        assert!(!dir_path.exists());
        assert!(fs.find_directory("docs").is_none());
        assert!(!fs.remove("docs").unwrap());
    }

    #[test]
    fn test_bad_file_crypter_reported_on_open() {
        let temp = TempDir::new().unwrap();
        let fs = crypted(&temp);
        fs::write(temp.path().join("blob"), b"").unwrap();

        let mut index = MetaIndex::new();
        index.files.push(FileEntry {
            name: "broken.bin".to_string(),
            real_name: Some("blob".to_string()),
            crypter: Some(EntryCrypter {
                password: Some(b"pw".to_vec()),
                salt: None,
                iterations: Some(0),
            }),
            ..Default::default()
        });
        fs.save_index(temp.path(), &index).unwrap();

        let reported = Arc::new(Mutex::new(0usize));
        let counter = Arc::clone(&reported);
        fs.errors().subscribe(move |_| *counter.lock() += 1);

        let file = fs.find_file("broken.bin").unwrap();
        assert!(file.open_read().unwrap_err().is_validation());
        assert_eq!(*reported.lock(), 1);
    }

    #[test]
    fn test_wrong_filesystem_key_sees_nothing() {
        let temp = TempDir::new().unwrap();
        crypted(&temp).create_directory("docs").unwrap();

        let other = CryptedFileSystem::new(
            temp.path(),
            Crypter::keyed(b"another-key", None, Some(10)).unwrap(),
        )
        .unwrap();
        assert_eq!(other.enumerate_directories().count(), 0);
    }
}
