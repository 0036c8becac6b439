//! Conflict detection and resolution for file operations.

use std::path::{Path, PathBuf};

use ferry_core::{FsError, JobId, TransactionId};
use serde::{Deserialize, Serialize};
use strum::Display;

use crate::operation::JobKind;

/// A destination collision detected before a job was submitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conflict {
    /// The held job.
    pub job_id: JobId,
    /// The transaction the job belongs to.
    pub transaction_id: TransactionId,
    /// Kind of the held job.
    pub job_kind: JobKind,
    /// The path being operated on, if the job reads one.
    pub source: Option<PathBuf>,
    /// The destination that already exists.
    pub destination: PathBuf,
    /// What occupies the destination.
    pub kind: ConflictKind,
    /// Actions the caller may choose from.
    pub options: Vec<ConflictAction>,
}

impl Conflict {
    /// Whether `action` is offered for this conflict.
    pub fn allows(&self, action: ConflictAction) -> bool {
        self.options.contains(&action)
    }
}

/// What occupies a conflicting destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
pub enum ConflictKind {
    #[strum(to_string = "File already exists")]
    FileExists,
    #[strum(to_string = "Directory already exists")]
    DirectoryExists,
}

/// How to resolve a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Display, Serialize, Deserialize)]
pub enum ConflictAction {
    /// Leave the destination alone and skip this job.
    #[default]
    Skip,
    /// Replace the destination. Directories are merged.
    Overwrite,
    /// Write to a collision-free sibling name instead.
    Rename,
    /// Cancel every remaining job in the transaction.
    #[strum(to_string = "Cancel all")]
    CancelAll,
}

impl ConflictAction {
    /// Actions offered for a job kind.
    pub fn options_for(kind: JobKind) -> &'static [ConflictAction] {
        use ConflictAction::*;
        match kind {
            JobKind::Copy | JobKind::Move | JobKind::Rename => {
                &[Skip, Overwrite, Rename, CancelAll]
            }
            JobKind::CreateFolder | JobKind::CreateFile | JobKind::CreateSymlink => {
                &[Skip, Rename, CancelAll]
            }
            // Overwrite trashes whatever now occupies the original location.
            JobKind::Restore => &[Skip, Overwrite, CancelAll],
            JobKind::Trash | JobKind::EmptyTrash => &[],
        }
    }
}

/// A decision returned by a [`ConflictResolver`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    /// The chosen action.
    pub action: ConflictAction,
    /// Reuse this action for every later conflict in the same transaction.
    #[serde(default)]
    pub apply_to_all: bool,
    /// Explicit name for [`ConflictAction::Rename`]; generated when absent.
    #[serde(default)]
    pub new_name: Option<String>,
}

impl Resolution {
    /// Resolve only the current conflict.
    pub fn once(action: ConflictAction) -> Self {
        Self {
            action,
            apply_to_all: false,
            new_name: None,
        }
    }

    /// Resolve this and every later conflict in the transaction.
    pub fn for_all(action: ConflictAction) -> Self {
        Self {
            action,
            apply_to_all: true,
            new_name: None,
        }
    }

    /// Rename to an explicit name.
    pub fn rename_to(name: impl Into<String>) -> Self {
        Self {
            action: ConflictAction::Rename,
            apply_to_all: false,
            new_name: Some(name.into()),
        }
    }
}

/// Synchronous conflict callback, invoked on the coordinator.
pub trait ConflictResolver: Send {
    /// Decide how to handle `conflict`.
    fn resolve(&mut self, conflict: &Conflict) -> Resolution;
}

impl<F> ConflictResolver for F
where
    F: FnMut(&Conflict) -> Resolution + Send,
{
    fn resolve(&mut self, conflict: &Conflict) -> Resolution {
        self(conflict)
    }
}

/// Resolver that answers every conflict with the same action.
#[derive(Debug, Clone, Copy)]
pub struct FixedResolver(pub ConflictAction);

impl ConflictResolver for FixedResolver {
    fn resolve(&mut self, _conflict: &Conflict) -> Resolution {
        Resolution::for_all(self.0)
    }
}

/// Conflict gating state of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConflictState {
    #[default]
    NoConflict,
    ConflictDetected,
    AwaitingUserInput,
    Resolved(ConflictAction),
}

/// Suffix scheme used when generating a free name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamingStyle {
    /// `name (Copy)`, `name (Copy 2)`, ...
    Copy,
    /// `name (2)`, `name (3)`, ...
    Rename,
}

impl NamingStyle {
    /// Naming used when resolving a conflict for `kind`.
    pub fn for_kind(kind: JobKind) -> Self {
        match kind {
            JobKind::Copy => Self::Copy,
            _ => Self::Rename,
        }
    }

    fn suffix(&self, attempt: usize) -> String {
        match (self, attempt) {
            (Self::Copy, 1) => " (Copy)".to_string(),
            (Self::Copy, n) => format!(" (Copy {n})"),
            (Self::Rename, n) => format!(" ({})", n + 1),
        }
    }
}

/// Find the first sibling of `path` for which `exists` is false.
///
/// Files keep their extension (`b (2).txt`); directories are suffixed as a
/// whole. At most `limit` candidates are tried.
pub fn unique_name(
    path: &Path,
    is_dir: bool,
    style: NamingStyle,
    limit: usize,
    exists: impl Fn(&Path) -> bool,
) -> Result<PathBuf, FsError> {
    let parent = path.parent().unwrap_or(Path::new(""));
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let (stem, extension) = match (is_dir, path.file_stem(), path.extension()) {
        (false, Some(stem), Some(ext)) => (
            stem.to_string_lossy().into_owned(),
            Some(ext.to_string_lossy().into_owned()),
        ),
        _ => (file_name, None),
    };

    for attempt in 1..=limit {
        let suffix = style.suffix(attempt);
        let name = match &extension {
            Some(ext) => format!("{stem}{suffix}.{ext}"),
            None => format!("{stem}{suffix}"),
        };
        let candidate = parent.join(name);
        if !exists(&candidate) {
            return Ok(candidate);
        }
    }

    Err(FsError::NameCollisionExhausted {
        path: path.to_path_buf(),
        attempts: limit,
    })
}
