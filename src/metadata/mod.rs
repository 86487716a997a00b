//! Directory index storage
//!
//! Each crypted directory stores its listing in an encrypted index file.
//! The index maps logical names to obfuscated on-disk names and carries the
//! per-file crypter parameters.

mod index;

pub use index::{
    validate_logical_name, validate_real_name, DirectoryEntry, EntryCrypter, FileEntry,
    IndexEntry, MetaIndex, RemovedEntry, INDEX_FILE, INDEX_TMP_FILE,
};
