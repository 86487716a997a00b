//! Encrypted per-directory index
//!
//! Every crypted directory carries an index file listing its logical
//! children and the obfuscated names they are stored under. The index is
//! JSON, encrypted with the filesystem-level crypter.

use crate::crypto::{Crypter, CrypterParams};
use crate::error::{Error, Result};
use crate::vfs::compare_names;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io::{self, BufReader, BufWriter};
use std::path::{Component, Path};
use tracing::debug;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Reserved name of the index file inside a physical directory
pub const INDEX_FILE: &str = "0.bin";

/// Scratch name used while replacing the index
pub const INDEX_TMP_FILE: &str = "0.bin.tmp";

/// Common view over directory and file entries
pub trait IndexEntry {
    /// Logical name
    fn name(&self) -> &str;

    /// Obfuscated on-disk name
    fn real_name(&self) -> Option<&str>;

    /// Entries without a usable real name are tombstones
    fn is_live(&self) -> bool {
        self.real_name().is_some_and(|n| !n.trim().is_empty())
    }
}

/// Index entry for a child directory
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryEntry {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub real_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changed_at: Option<DateTime<Utc>>,
}

impl DirectoryEntry {
    /// New entry stamped with the current time
    pub fn new(name: impl Into<String>, real_name: impl Into<String>) -> Self {
        let now = Utc::now();
        DirectoryEntry {
            name: name.into(),
            real_name: Some(real_name.into()),
            created_at: Some(now),
            changed_at: Some(now),
        }
    }
}

impl IndexEntry for DirectoryEntry {
    fn name(&self) -> &str {
        &self.name
    }

    fn real_name(&self) -> Option<&str> {
        self.real_name.as_deref()
    }
}

/// Index entry for a child file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub real_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changed_at: Option<DateTime<Utc>>,
    /// Per-file key; absent means the content is stored as plaintext
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crypter: Option<EntryCrypter>,
}

impl FileEntry {
    /// New entry stamped with the current time
    pub fn new(
        name: impl Into<String>,
        real_name: impl Into<String>,
        crypter: Option<&CrypterParams>,
    ) -> Self {
        let now = Utc::now();
        FileEntry {
            name: name.into(),
            real_name: Some(real_name.into()),
            created_at: Some(now),
            changed_at: Some(now),
            crypter: crypter.map(EntryCrypter::from_params),
        }
    }

    /// Resolve the crypter for this file's content
    pub fn crypter(&self) -> Result<Crypter> {
        let params = match &self.crypter {
            Some(c) => c.to_params()?,
            None => None,
        };
        Ok(Crypter::from_params(params))
    }
}

impl IndexEntry for FileEntry {
    fn name(&self) -> &str {
        &self.name
    }

    fn real_name(&self) -> Option<&str> {
        self.real_name.as_deref()
    }
}

/// Serialized per-file crypter parameters
#[derive(Clone, Default, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct EntryCrypter {
    #[serde(default, with = "base64_opt", skip_serializing_if = "Option::is_none")]
    pub password: Option<Vec<u8>>,
    #[serde(default, with = "base64_opt", skip_serializing_if = "Option::is_none")]
    pub salt: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iterations: Option<u32>,
}

impl EntryCrypter {
    pub fn from_params(params: &CrypterParams) -> Self {
        EntryCrypter {
            password: Some(params.password().to_vec()),
            salt: Some(params.salt().to_vec()),
            iterations: Some(params.iterations()),
        }
    }

    /// Validated parameters, or `None` when no password is set
    pub fn to_params(&self) -> Result<Option<CrypterParams>> {
        match self.password.as_deref() {
            None | Some([]) => Ok(None),
            Some(password) => {
                let salt = self.salt.as_deref().filter(|s| !s.is_empty());
                CrypterParams::new(password, salt, self.iterations).map(Some)
            }
        }
    }
}

impl fmt::Debug for EntryCrypter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntryCrypter")
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("salt_len", &self.salt.as_ref().map(Vec::len))
            .field("iterations", &self.iterations)
            .finish()
    }
}

/// Entry removed from an index
#[derive(Debug)]
pub enum RemovedEntry {
    Directory(DirectoryEntry),
    File(FileEntry),
}

impl RemovedEntry {
    pub fn real_name(&self) -> Option<&str> {
        match self {
            RemovedEntry::Directory(d) => d.real_name(),
            RemovedEntry::File(f) => f.real_name(),
        }
    }
}

/// Decrypted directory index
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetaIndex {
    #[serde(default)]
    pub directories: Vec<DirectoryEntry>,
    #[serde(default)]
    pub files: Vec<FileEntry>,
}

impl MetaIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse the plaintext form of an index
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Serialize to the plaintext form
    pub fn encode(&self) -> Result<Zeroizing<Vec<u8>>> {
        let bytes = serde_json::to_vec(self).map_err(|e| Error::Serialization(e.to_string()))?;
        Ok(Zeroizing::new(bytes))
    }

    /// Read and decrypt the index stored in `dir`.
    ///
    /// Returns `Ok(None)` when the directory has no index file.
    pub fn read_from(dir: &Path, crypter: &Crypter) -> Result<Option<Self>> {
        let path = dir.join(INDEX_FILE);
        let file = match fs::File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut plain = Zeroizing::new(Vec::new());
        crypter.decrypt(&mut BufReader::new(file), &mut *plain)?;

        let index = Self::decode(&plain)?;
        debug!(
            "Loaded index {:?}: {} directories, {} files",
            path,
            index.directories.len(),
            index.files.len()
        );
        Ok(Some(index))
    }

    /// Encrypt and store the index in `dir`, replacing any previous one
    pub fn write_to(&self, dir: &Path, crypter: &Crypter) -> Result<()> {
        fs::create_dir_all(dir)?;

        let encoded = self.encode()?;
        let tmp = dir.join(INDEX_TMP_FILE);
        {
            let mut writer = BufWriter::new(fs::File::create(&tmp)?);
            crypter.encrypt(&mut &encoded[..], &mut writer)?;
            let file = writer.into_inner().map_err(|e| Error::Io(e.into_error()))?;
            file.sync_all()?;
        }
        fs::rename(&tmp, dir.join(INDEX_FILE))?;

        debug!("Saved index in {:?}", dir);
        Ok(())
    }

    /// Live directory entries sorted by logical name
    pub fn live_directories(&self) -> Vec<&DirectoryEntry> {
        live_sorted(&self.directories)
    }

    /// Live file entries sorted by logical name
    pub fn live_files(&self) -> Vec<&FileEntry> {
        live_sorted(&self.files)
    }

    /// Consume the index, keeping only live entries sorted by logical name
    pub fn into_live(self) -> (Vec<DirectoryEntry>, Vec<FileEntry>) {
        let mut directories: Vec<DirectoryEntry> =
            self.directories.into_iter().filter(|d| d.is_live()).collect();
        let mut files: Vec<FileEntry> = self.files.into_iter().filter(|f| f.is_live()).collect();

        directories.sort_by(|a, b| compare_names(&a.name, &b.name));
        files.sort_by(|a, b| compare_names(&a.name, &b.name));
        (directories, files)
    }

    /// Look up a live directory entry by exact logical name
    pub fn directory(&self, name: &str) -> Option<&DirectoryEntry> {
        self.directories.iter().find(|d| d.is_live() && d.name == name)
    }

    /// Look up a live file entry by exact logical name
    pub fn file(&self, name: &str) -> Option<&FileEntry> {
        self.files.iter().find(|f| f.is_live() && f.name == name)
    }

    /// Mutable lookup of a live file entry
    pub fn file_mut(&mut self, name: &str) -> Option<&mut FileEntry> {
        self.files.iter_mut().find(|f| f.is_live() && f.name == name)
    }

    /// Whether any live entry uses this logical name
    pub fn contains(&self, name: &str) -> bool {
        self.directory(name).is_some() || self.file(name).is_some()
    }

    /// Remove the live entry with this logical name
    pub fn remove(&mut self, name: &str) -> Option<RemovedEntry> {
        if let Some(pos) = self
            .directories
            .iter()
            .position(|d| d.is_live() && d.name == name)
        {
            return Some(RemovedEntry::Directory(self.directories.remove(pos)));
        }

        self.files
            .iter()
            .position(|f| f.is_live() && f.name == name)
            .map(|pos| RemovedEntry::File(self.files.remove(pos)))
    }
}

fn live_sorted<T: IndexEntry>(entries: &[T]) -> Vec<&T> {
    let mut live: Vec<&T> = entries.iter().filter(|e| e.is_live()).collect();
    live.sort_by(|a, b| compare_names(a.name(), b.name()));
    live
}

/// Check that a real name is a single plain path component.
///
/// Anything else could escape the parent directory or collide with the
/// index file.
pub fn validate_real_name(real_name: &str) -> Result<()> {
    let invalid = |reason: &str| Error::InvalidEntry {
        name: real_name.to_string(),
        reason: reason.to_string(),
    };

    if real_name == INDEX_FILE || real_name == INDEX_TMP_FILE {
        return Err(invalid("collides with the index file"));
    }

    let mut components = Path::new(real_name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(c)), None) if c == real_name => Ok(()),
        _ => Err(invalid("not a single path component")),
    }
}

/// Check a logical name supplied by a caller
pub fn validate_logical_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(Error::InvalidArgument("name must not be empty".to_string()));
    }
    if name.contains('/') || name == "." || name == ".." {
        return Err(Error::InvalidArgument(format!(
            "'{}' is not a valid entry name",
            name
        )));
    }
    Ok(())
}

/// Base64 serialization for optional byte buffers
mod base64_opt {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};
    use zeroize::Zeroizing;

    pub fn serialize<S>(bytes: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match bytes {
            Some(bytes) => serializer.serialize_str(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        // The encoded text is key material too
        let encoded: Option<Zeroizing<String>> =
            Option::<String>::deserialize(deserializer)?.map(Zeroizing::new);
        match encoded {
            None => Ok(None),
            Some(encoded) => STANDARD
                .decode(encoded.as_bytes())
                .map(Some)
                .map_err(serde::de::Error::custom),
        }
    }
}
