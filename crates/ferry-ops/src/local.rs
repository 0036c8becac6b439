//! Adapter backed by the local filesystem and the platform trash.

use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use ferry_core::FsError;

use crate::adapter::sealed::Primitives;
use crate::adapter::{EntryKind, EntryMeta, FileSystemAdapter, TrashItem};
use crate::operation::sibling;

/// [`FileSystemAdapter`] over `std::fs` and the `trash` crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFs;

impl LocalFs {
    /// Create a new local adapter.
    pub fn new() -> Self {
        Self
    }
}

impl FileSystemAdapter for LocalFs {}

impl Primitives for LocalFs {
    fn stat(&self, path: &Path) -> Option<EntryMeta> {
        let metadata = fs::symlink_metadata(path).ok()?;
        let file_type = metadata.file_type();
        let kind = if file_type.is_symlink() {
            EntryKind::Symlink
        } else if file_type.is_dir() {
            EntryKind::Directory
        } else {
            EntryKind::File
        };
        let len = if kind == EntryKind::Directory {
            0
        } else {
            metadata.len()
        };
        Some(EntryMeta { kind, len })
    }

    fn read_dir(&self, path: &Path) -> Result<Vec<PathBuf>, FsError> {
        let entries = fs::read_dir(path).map_err(|e| FsError::io(path, e))?;
        let mut children = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| FsError::io(path, e))?;
            children.push(entry.path());
        }
        children.sort();
        Ok(children)
    }

    fn copy_file(
        &self,
        source: &Path,
        destination: &Path,
        overwrite: bool,
    ) -> Result<u64, FsError> {
        let meta = self.stat(source).ok_or_else(|| FsError::NotFound {
            path: source.to_path_buf(),
        })?;

        if let Some(existing) = self.stat(destination) {
            if !overwrite {
                return Err(FsError::AlreadyExists {
                    path: destination.to_path_buf(),
                });
            }
            if existing.is_dir() {
                return Err(FsError::invalid_target(
                    destination,
                    "Cannot replace a directory with a file",
                ));
            }
            if meta.kind == EntryKind::Symlink || existing.kind == EntryKind::Symlink {
                fs::remove_file(destination).map_err(|e| FsError::io(destination, e))?;
            }
        }

        if meta.kind == EntryKind::Symlink {
            let target = fs::read_link(source).map_err(|e| FsError::io(source, e))?;
            self.create_symlink(&target, destination)?;
            return Ok(0);
        }

        fs::copy(source, destination).map_err(|e| FsError::io(destination, e))
    }

    fn create_folder(&self, path: &Path) -> Result<PathBuf, FsError> {
        fs::create_dir(path).map_err(|e| FsError::io(path, e))?;
        Ok(path.to_path_buf())
    }

    fn create_file(&self, path: &Path) -> Result<PathBuf, FsError> {
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| FsError::io(path, e))?;
        Ok(path.to_path_buf())
    }

    fn create_symlink(&self, target: &Path, link: &Path) -> Result<PathBuf, FsError> {
        #[cfg(unix)]
        {
            std::os::unix::fs::symlink(target, link).map_err(|e| FsError::io(link, e))?;
            Ok(link.to_path_buf())
        }

        #[cfg(windows)]
        {
            let result = if target.is_dir() {
                std::os::windows::fs::symlink_dir(target, link)
            } else {
                std::os::windows::fs::symlink_file(target, link)
            };
            result.map_err(|e| FsError::io(link, e))?;
            Ok(link.to_path_buf())
        }

        #[cfg(not(any(unix, windows)))]
        {
            let _ = target;
            Err(FsError::Unsupported {
                message: format!("symlinks are not supported for {}", link.display()),
            })
        }
    }

    fn move_entry(
        &self,
        source: &Path,
        destination: &Path,
        overwrite: bool,
    ) -> Result<PathBuf, FsError> {
        let meta = self.stat(source).ok_or_else(|| FsError::NotFound {
            path: source.to_path_buf(),
        })?;

        if let Some(existing) = self.stat(destination) {
            if !overwrite {
                return Err(FsError::AlreadyExists {
                    path: destination.to_path_buf(),
                });
            }
            match (meta.is_dir(), existing.is_dir()) {
                (true, true) => {
                    return Err(FsError::WouldMerge {
                        from: source.to_path_buf(),
                        to: destination.to_path_buf(),
                    });
                }
                (false, true) => {
                    return Err(FsError::invalid_target(
                        destination,
                        "Cannot replace a directory with a file",
                    ));
                }
                (true, false) => {
                    fs::remove_file(destination).map_err(|e| FsError::io(destination, e))?;
                }
                (false, false) => {}
            }
        }

        match fs::rename(source, destination) {
            Ok(()) => Ok(destination.to_path_buf()),
            Err(e) if is_cross_device(&e) => Err(FsError::CrossDevice {
                from: source.to_path_buf(),
                to: destination.to_path_buf(),
            }),
            Err(e) => Err(FsError::io(source, e)),
        }
    }

    fn rename(&self, path: &Path, new_name: &str) -> Result<PathBuf, FsError> {
        let destination = sibling(path, new_name);
        if destination != path && self.exists(&destination) {
            return Err(FsError::AlreadyExists { path: destination });
        }
        fs::rename(path, &destination).map_err(|e| FsError::io(path, e))?;
        Ok(destination)
    }

    fn remove(&self, path: &Path) -> Result<(), FsError> {
        let meta = self.stat(path).ok_or_else(|| FsError::NotFound {
            path: path.to_path_buf(),
        })?;
        let result = if meta.is_dir() {
            fs::remove_dir(path)
        } else {
            fs::remove_file(path)
        };
        result.map_err(|e| FsError::io(path, e))
    }

    fn trash(&self, path: &Path) -> Result<TrashItem, FsError> {
        if !self.exists(path) {
            return Err(FsError::NotFound {
                path: path.to_path_buf(),
            });
        }
        trash::delete(path).map_err(|e| trash_error(path, e))?;
        platform::find_trashed(path)
    }

    fn restore(&self, item: &TrashItem) -> Result<PathBuf, FsError> {
        if self.exists(&item.original_path) {
            return Err(FsError::AlreadyExists {
                path: item.original_path.clone(),
            });
        }
        platform::restore(item)
    }

    fn enumerate_trash(&self) -> Result<Vec<TrashItem>, FsError> {
        platform::list()
    }

    fn empty_trash(&self) -> Result<(), FsError> {
        platform::purge()
    }
}

fn is_cross_device(error: &io::Error) -> bool {
    if error.kind() == io::ErrorKind::CrossesDevices {
        return true;
    }
    #[cfg(unix)]
    {
        // EXDEV
        error.raw_os_error() == Some(18)
    }
    #[cfg(not(unix))]
    {
        false
    }
}

fn trash_error(path: &Path, error: trash::Error) -> FsError {
    FsError::Io {
        path: path.to_path_buf(),
        source: io::Error::other(error.to_string()),
    }
}

#[cfg(any(
    target_os = "windows",
    all(
        unix,
        not(target_os = "macos"),
        not(target_os = "ios"),
        not(target_os = "android")
    )
))]
mod platform {
    use std::path::{Path, PathBuf};

    use ferry_core::FsError;
    use trash::os_limited;

    use super::trash_error;
    use crate::adapter::TrashItem;

    fn convert(item: &trash::TrashItem) -> TrashItem {
        TrashItem {
            id: item.id.to_string_lossy().into_owned(),
            original_path: item.original_path(),
            deleted_at: item.time_deleted,
        }
    }

    fn list_raw() -> Result<Vec<trash::TrashItem>, FsError> {
        os_limited::list().map_err(|e| trash_error(Path::new("trash"), e))
    }

    pub(super) fn find_trashed(path: &Path) -> Result<TrashItem, FsError> {
        list_raw()?
            .iter()
            .filter(|item| item.original_path() == path)
            .max_by_key(|item| item.time_deleted)
            .map(convert)
            .ok_or_else(|| FsError::NotFound {
                path: path.to_path_buf(),
            })
    }

    pub(super) fn restore(item: &TrashItem) -> Result<PathBuf, FsError> {
        let raw = list_raw()?
            .into_iter()
            .find(|raw| raw.id.to_string_lossy() == item.id.as_str())
            .ok_or_else(|| FsError::NotFound {
                path: item.original_path.clone(),
            })?;
        os_limited::restore_all(vec![raw]).map_err(|e| trash_error(&item.original_path, e))?;
        Ok(item.original_path.clone())
    }

    pub(super) fn list() -> Result<Vec<TrashItem>, FsError> {
        Ok(list_raw()?.iter().map(convert).collect())
    }

    pub(super) fn purge() -> Result<(), FsError> {
        let items = list_raw()?;
        if items.is_empty() {
            return Ok(());
        }
        os_limited::purge_all(items).map_err(|e| trash_error(Path::new("trash"), e))
    }
}

#[cfg(not(any(
    target_os = "windows",
    all(
        unix,
        not(target_os = "macos"),
        not(target_os = "ios"),
        not(target_os = "android")
    )
)))]
mod platform {
    use std::path::{Path, PathBuf};

    use ferry_core::FsError;

    use crate::adapter::TrashItem;

    fn unsupported() -> FsError {
        FsError::Unsupported {
            message: "trash listing is not available on this platform".to_string(),
        }
    }

    // Without listing support the item cannot be located again, so the
    // handle only carries the original path.
    pub(super) fn find_trashed(path: &Path) -> Result<TrashItem, FsError> {
        Ok(TrashItem {
            id: String::new(),
            original_path: path.to_path_buf(),
            deleted_at: 0,
        })
    }

    pub(super) fn restore(_item: &TrashItem) -> Result<PathBuf, FsError> {
        Err(unsupported())
    }

    pub(super) fn list() -> Result<Vec<TrashItem>, FsError> {
        Err(unsupported())
    }

    pub(super) fn purge() -> Result<(), FsError> {
        Err(unsupported())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_stat_and_read_dir() {
        let temp = TempDir::new().unwrap();
        let fs_ = LocalFs::new();
        fs::write(temp.path().join("b.txt"), b"hello").unwrap();
        fs::create_dir(temp.path().join("a")).unwrap();

        let meta = fs_.stat(&temp.path().join("b.txt")).unwrap();
        assert_eq!(meta.kind, EntryKind::File);
        assert_eq!(meta.len, 5);
        assert!(fs_.stat(&temp.path().join("a")).unwrap().is_dir());
        assert!(fs_.stat(&temp.path().join("missing")).is_none());

        let children = fs_.read_dir(temp.path()).unwrap();
        assert_eq!(children, vec![temp.path().join("a"), temp.path().join("b.txt")]);
    }

    #[test]
    fn test_move_entry_reports_merge() {
        let temp = TempDir::new().unwrap();
        let fs_ = LocalFs::new();
        let src = temp.path().join("src");
        let dst = temp.path().join("dst");
        fs::create_dir(&src).unwrap();
        fs::create_dir(&dst).unwrap();

        let err = fs_.move_entry(&src, &dst, false).unwrap_err();
        assert!(matches!(err, FsError::AlreadyExists { .. }));

        let err = fs_.move_entry(&src, &dst, true).unwrap_err();
        assert!(matches!(err, FsError::WouldMerge { .. }));
    }

    #[test]
    fn test_rename_refuses_existing() {
        let temp = TempDir::new().unwrap();
        let fs_ = LocalFs::new();
        fs::write(temp.path().join("a.txt"), b"a").unwrap();
        fs::write(temp.path().join("b.txt"), b"b").unwrap();

        let err = fs_.rename(&temp.path().join("a.txt"), "b.txt").unwrap_err();
        assert!(matches!(err, FsError::AlreadyExists { .. }));

        let renamed = fs_.rename(&temp.path().join("a.txt"), "c.txt").unwrap();
        assert_eq!(renamed, temp.path().join("c.txt"));
        assert!(!temp.path().join("a.txt").exists());
    }

    #[test]
    fn test_copy_file_respects_overwrite() {
        let temp = TempDir::new().unwrap();
        let fs_ = LocalFs::new();
        let src = temp.path().join("src.txt");
        let dst = temp.path().join("dst.txt");
        fs::write(&src, b"new").unwrap();
        fs::write(&dst, b"old").unwrap();

        assert!(fs_.copy_file(&src, &dst, false).is_err());
        assert_eq!(fs_.copy_file(&src, &dst, true).unwrap(), 3);
        assert_eq!(fs::read(&dst).unwrap(), b"new");
    }

    #[test]
    fn test_create_folder_and_file() {
        let temp = TempDir::new().unwrap();
        let fs_ = LocalFs::new();
        let dir = temp.path().join("new");

        assert_eq!(fs_.create_folder(&dir).unwrap(), dir);
        assert!(matches!(
            fs_.create_folder(&dir).unwrap_err(),
            FsError::AlreadyExists { .. }
        ));

        let file = dir.join("note.txt");
        fs_.create_file(&file).unwrap();
        assert!(file.is_file());
        fs_.remove(&file).unwrap();
        fs_.remove(&dir).unwrap();
        assert!(!dir.exists());
    }
}
