//! File operation types.

use std::path::{Path, PathBuf};

use ferry_core::{ErrorKind, FsError};
use serde::{Deserialize, Serialize};
use strum::Display;

use crate::adapter::TrashItem;
use crate::rename::validate_filename;

/// A single filesystem operation carried by a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    /// Copy a file or directory to an exact destination path.
    Copy {
        source: PathBuf,
        destination: PathBuf,
    },
    /// Move a file or directory to an exact destination path.
    ///
    /// With `entries`, only the listed paths (relative to `source`) and
    /// what lies below them are moved, merging into directories that
    /// already exist at the destination.
    Move {
        source: PathBuf,
        destination: PathBuf,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        entries: Option<Vec<PathBuf>>,
    },
    /// Move a file or directory to the trash.
    Trash { path: PathBuf },
    /// Restore a trashed item to its original location.
    Restore { item: TrashItem },
    /// Rename an entry within its parent directory.
    Rename { source: PathBuf, new_name: String },
    /// Create a new directory.
    CreateFolder { path: PathBuf },
    /// Create a new empty file.
    CreateFile { path: PathBuf },
    /// Create a symbolic link at `link` pointing to `target`.
    CreateSymlink { target: PathBuf, link: PathBuf },
    /// Permanently purge the trash.
    EmptyTrash,
}

impl Operation {
    /// Create a copy operation.
    pub fn copy(source: impl Into<PathBuf>, destination: impl Into<PathBuf>) -> Self {
        Self::Copy {
            source: source.into(),
            destination: destination.into(),
        }
    }

    /// Create a move operation.
    pub fn move_to(source: impl Into<PathBuf>, destination: impl Into<PathBuf>) -> Self {
        Self::Move {
            source: source.into(),
            destination: destination.into(),
            entries: None,
        }
    }

    /// Create a move of selected entries below `source`.
    pub fn move_entries(
        source: impl Into<PathBuf>,
        destination: impl Into<PathBuf>,
        entries: Vec<PathBuf>,
    ) -> Self {
        Self::Move {
            source: source.into(),
            destination: destination.into(),
            entries: Some(entries),
        }
    }

    /// Create a trash operation.
    pub fn trash(path: impl Into<PathBuf>) -> Self {
        Self::Trash { path: path.into() }
    }

    /// Create a restore operation.
    pub fn restore(item: TrashItem) -> Self {
        Self::Restore { item }
    }

    /// Create a rename operation.
    pub fn rename(source: impl Into<PathBuf>, new_name: impl Into<String>) -> Self {
        Self::Rename {
            source: source.into(),
            new_name: new_name.into(),
        }
    }

    /// Create a directory creation operation.
    pub fn create_folder(path: impl Into<PathBuf>) -> Self {
        Self::CreateFolder { path: path.into() }
    }

    /// Create a file creation operation.
    pub fn create_file(path: impl Into<PathBuf>) -> Self {
        Self::CreateFile { path: path.into() }
    }

    /// Create a symlink creation operation.
    pub fn create_symlink(target: impl Into<PathBuf>, link: impl Into<PathBuf>) -> Self {
        Self::CreateSymlink {
            target: target.into(),
            link: link.into(),
        }
    }

    /// Create an empty-trash operation.
    pub fn empty_trash() -> Self {
        Self::EmptyTrash
    }

    /// The kind of this operation.
    pub fn kind(&self) -> JobKind {
        match self {
            Self::Copy { .. } => JobKind::Copy,
            Self::Move { .. } => JobKind::Move,
            Self::Trash { .. } => JobKind::Trash,
            Self::Restore { .. } => JobKind::Restore,
            Self::Rename { .. } => JobKind::Rename,
            Self::CreateFolder { .. } => JobKind::CreateFolder,
            Self::CreateFile { .. } => JobKind::CreateFile,
            Self::CreateSymlink { .. } => JobKind::CreateSymlink,
            Self::EmptyTrash => JobKind::EmptyTrash,
        }
    }

    /// The existing entry this operation reads from, if any.
    pub fn source(&self) -> Option<&Path> {
        match self {
            Self::Copy { source, .. } | Self::Move { source, .. } | Self::Rename { source, .. } => {
                Some(source)
            }
            Self::Trash { path } => Some(path),
            _ => None,
        }
    }

    /// The path this operation will write to, if any.
    pub fn destination(&self) -> Option<PathBuf> {
        match self {
            Self::Copy { destination, .. } | Self::Move { destination, .. } => {
                Some(destination.clone())
            }
            Self::Rename { source, new_name } => Some(sibling(source, new_name)),
            Self::CreateFolder { path } | Self::CreateFile { path } => Some(path.clone()),
            Self::CreateSymlink { link, .. } => Some(link.clone()),
            Self::Restore { item } => Some(item.original_path.clone()),
            Self::Trash { .. } | Self::EmptyTrash => None,
        }
    }

    /// The path shown to users for this operation.
    pub fn display_path(&self) -> PathBuf {
        self.source()
            .map(Path::to_path_buf)
            .or_else(|| self.destination())
            .unwrap_or_default()
    }

    /// Return a copy of this operation writing to `destination` instead.
    ///
    /// Used when a conflict is resolved by renaming. Operations that cannot be
    /// redirected are returned unchanged.
    pub fn with_destination(&self, destination: PathBuf) -> Self {
        match self {
            Self::Copy { source, .. } => Self::Copy {
                source: source.clone(),
                destination,
            },
            Self::Move {
                source, entries, ..
            } => Self::Move {
                source: source.clone(),
                destination,
                entries: entries.clone(),
            },
            Self::Rename { source, new_name } => Self::Rename {
                source: source.clone(),
                new_name: destination
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| new_name.clone()),
            },
            Self::CreateFolder { .. } => Self::CreateFolder { path: destination },
            Self::CreateFile { .. } => Self::CreateFile { path: destination },
            Self::CreateSymlink { target, .. } => Self::CreateSymlink {
                target: target.clone(),
                link: destination,
            },
            Self::Trash { .. } | Self::Restore { .. } | Self::EmptyTrash => self.clone(),
        }
    }

    /// Check names and resolve relative paths against the current directory.
    pub fn normalized(self) -> Result<Self, FsError> {
        let op = match self {
            Self::Copy {
                source,
                destination,
            } => Self::Copy {
                source: absolute(source)?,
                destination: absolute(destination)?,
            },
            Self::Move {
                source,
                destination,
                entries,
            } => {
                if let Some(bad) = entries.iter().flatten().find(|e| !is_plain_relative(e)) {
                    return Err(FsError::invalid_target(
                        bad,
                        "Selected entries must be relative paths below the source",
                    ));
                }
                Self::Move {
                    source: absolute(source)?,
                    destination: absolute(destination)?,
                    entries,
                }
            }
            Self::Trash { path } => Self::Trash {
                path: absolute(path)?,
            },
            Self::Rename { source, new_name } => {
                validate_filename(&new_name).map_err(|e| FsError::invalid_name(&new_name, e))?;
                Self::Rename {
                    source: absolute(source)?,
                    new_name,
                }
            }
            Self::CreateFolder { path } => Self::CreateFolder {
                path: absolute(checked_leaf(path)?)?,
            },
            Self::CreateFile { path } => Self::CreateFile {
                path: absolute(checked_leaf(path)?)?,
            },
            Self::CreateSymlink { target, link } => Self::CreateSymlink {
                target,
                link: absolute(checked_leaf(link)?)?,
            },
            op @ (Self::Restore { .. } | Self::EmptyTrash) => op,
        };
        Ok(op)
    }
}

/// The kind of a job, without its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
pub enum JobKind {
    Copy,
    Move,
    Trash,
    Restore,
    Rename,
    #[strum(to_string = "Create folder")]
    CreateFolder,
    #[strum(to_string = "Create file")]
    CreateFile,
    #[strum(to_string = "Create symlink")]
    CreateSymlink,
    #[strum(to_string = "Empty trash")]
    EmptyTrash,
}

impl JobKind {
    /// Whether a completed job of this kind can be reversed.
    ///
    /// Copies are not undone (the reverse would delete user data) and
    /// emptying the trash destroys the data outright.
    pub fn is_reversible(&self) -> bool {
        !matches!(self, Self::Copy | Self::EmptyTrash)
    }

    /// Past-tense verb used in summaries.
    pub fn past_tense(&self) -> &'static str {
        match self {
            Self::Copy => "Copied",
            Self::Move => "Moved",
            Self::Trash => "Trashed",
            Self::Restore => "Restored",
            Self::Rename => "Renamed",
            Self::CreateFolder | Self::CreateFile | Self::CreateSymlink => "Created",
            Self::EmptyTrash => "Emptied trash",
        }
    }
}

/// An error recorded against a job or one of its sub-paths.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    /// Classification of the error.
    pub kind: ErrorKind,
    /// The path that caused the error.
    pub path: PathBuf,
    /// A human-readable error message.
    pub message: String,
}

impl JobError {
    /// Create a new job error.
    pub fn new(kind: ErrorKind, path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self {
            kind,
            path: path.into(),
            message: message.into(),
        }
    }

    /// Build a record from an adapter error.
    pub fn from_fs(path: impl Into<PathBuf>, error: &FsError) -> Self {
        Self::new(error.kind(), path, error.to_string())
    }

    /// A cancellation record for `path`.
    pub fn cancelled(path: impl Into<PathBuf>) -> Self {
        Self::new(ErrorKind::Cancelled, path, "Cancelled")
    }
}

impl std::fmt::Display for JobError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path.display(), self.message)
    }
}

/// The sibling path `name` next to `path`.
pub(crate) fn sibling(path: &Path, name: &str) -> PathBuf {
    path.parent().unwrap_or(Path::new("")).join(name)
}

fn absolute(path: PathBuf) -> Result<PathBuf, FsError> {
    if path.is_absolute() {
        return Ok(path);
    }
    std::path::absolute(&path).map_err(|e| FsError::io(&path, e))
}

fn is_plain_relative(path: &Path) -> bool {
    path.components().next().is_some()
        && path
            .components()
            .all(|c| matches!(c, std::path::Component::Normal(_)))
}

fn checked_leaf(path: PathBuf) -> Result<PathBuf, FsError> {
    match path.file_name().and_then(|n| n.to_str()) {
        Some(name) => {
            validate_filename(name).map_err(|e| FsError::invalid_name(name, e))?;
            Ok(path)
        }
        None => Err(FsError::invalid_target(&path, "Path has no file name")),
    }
}
