//! The filesystem contract the engine executes against.
//!
//! Every primitive is synchronous and blocking; the engine only ever calls
//! them from worker threads or from the coordinator's conflict checks.
//! Front-ends hand an adapter to the engine and then go through
//! `add_operation` + `commit`; the only read they get directly is the trash
//! listing on the manager.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// What kind of entry lives at a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
}

/// Metadata describing one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryMeta {
    /// Entry kind. Symlinks are not followed.
    pub kind: EntryKind,
    /// Size in bytes (0 for directories).
    pub len: u64,
}

impl EntryMeta {
    /// Whether the entry is a real directory.
    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }
}

/// Handle to an item in the trash, sufficient to restore it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrashItem {
    /// Adapter-specific identifier.
    pub id: String,
    /// Where the item lived before it was trashed.
    pub original_path: PathBuf,
    /// Deletion time, seconds since the Unix epoch.
    pub deleted_at: i64,
}

/// A filesystem the engine can run jobs against.
///
/// The trait is sealed: its primitives live on a crate-private supertrait,
/// so holding an adapter does not let a caller mutate the filesystem
/// outside a transaction. [`LocalFs`](crate::LocalFs) is the production
/// implementation.
pub trait FileSystemAdapter: sealed::Primitives {}

pub(crate) mod sealed {
    use std::path::{Path, PathBuf};

    use ferry_core::FsError;

    use super::{EntryMeta, TrashItem};

    /// Synchronous filesystem primitives used by the engine.
    pub trait Primitives: Send + Sync {
        /// Inspect `path` without following symlinks.
        fn stat(&self, path: &Path) -> Option<EntryMeta>;

        /// List the children of a directory, sorted by name.
        fn read_dir(&self, path: &Path) -> Result<Vec<PathBuf>, FsError>;

        /// Copy a single file or symlink. Returns the number of bytes copied.
        fn copy_file(
            &self,
            source: &Path,
            destination: &Path,
            overwrite: bool,
        ) -> Result<u64, FsError>;

        /// Create a single directory.
        fn create_folder(&self, path: &Path) -> Result<PathBuf, FsError>;

        /// Create an empty file.
        fn create_file(&self, path: &Path) -> Result<PathBuf, FsError>;

        /// Create a symbolic link at `link` pointing to `target`.
        fn create_symlink(&self, target: &Path, link: &Path) -> Result<PathBuf, FsError>;

        /// Move an entry with a single rename.
        ///
        /// Fails with [`FsError::CrossDevice`] when the rename would cross a
        /// filesystem boundary and with [`FsError::WouldMerge`] when a
        /// directory would land on an existing directory.
        fn move_entry(
            &self,
            source: &Path,
            destination: &Path,
            overwrite: bool,
        ) -> Result<PathBuf, FsError>;

        /// Rename an entry within its parent directory.
        fn rename(&self, path: &Path, new_name: &str) -> Result<PathBuf, FsError>;

        /// Remove a file, symlink or empty directory.
        fn remove(&self, path: &Path) -> Result<(), FsError>;

        /// Move an entry to the trash.
        fn trash(&self, path: &Path) -> Result<TrashItem, FsError>;

        /// Restore a trashed item to its original location.
        fn restore(&self, item: &TrashItem) -> Result<PathBuf, FsError>;

        /// List the items currently in the trash.
        fn enumerate_trash(&self) -> Result<Vec<TrashItem>, FsError>;

        /// Permanently purge the trash.
        fn empty_trash(&self) -> Result<(), FsError>;

        /// Whether anything exists at `path`.
        fn exists(&self, path: &Path) -> bool {
            self.stat(path).is_some()
        }
    }
}
