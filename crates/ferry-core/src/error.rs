//! Error types for file operations and engine commands.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use strum::Display;
use thiserror::Error;

use crate::{JobId, TransactionId};

/// Errors raised by filesystem adapter primitives.
#[derive(Debug, Error)]
pub enum FsError {
    /// The path does not exist.
    #[error("Not found: {path}")]
    NotFound { path: PathBuf },

    /// Permission denied for a path.
    #[error("Permission denied: {path}")]
    PermissionDenied { path: PathBuf },

    /// The destination already exists.
    #[error("Already exists: {path}")]
    AlreadyExists { path: PathBuf },

    /// A directory would be moved onto an existing directory.
    #[error("Directory {to} already exists, moving {from} would merge them")]
    WouldMerge { from: PathBuf, to: PathBuf },

    /// A rename cannot cross filesystem boundaries.
    #[error("Cannot move {from} to {to} across devices")]
    CrossDevice { from: PathBuf, to: PathBuf },

    /// The operation observed its cancellation flag.
    #[error("Operation cancelled")]
    Cancelled,

    /// No free name was found within the probing limit.
    #[error("No free name for {path} after {attempts} attempts")]
    NameCollisionExhausted { path: PathBuf, attempts: usize },

    /// A file name failed validation.
    #[error("Invalid name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    /// Source and target combination is not allowed.
    #[error("Invalid target {path}: {reason}")]
    InvalidTarget { path: PathBuf, reason: String },

    /// The adapter does not support this primitive on this platform.
    #[error("Unsupported: {message}")]
    Unsupported { message: String },

    /// Generic I/O error.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl FsError {
    /// Create an I/O error with path context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        match source.kind() {
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied { path },
            std::io::ErrorKind::NotFound => Self::NotFound { path },
            std::io::ErrorKind::AlreadyExists => Self::AlreadyExists { path },
            _ => Self::Io { path, source },
        }
    }

    /// Create an invalid name error.
    pub fn invalid_name(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidName {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid target error.
    pub fn invalid_target(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::InvalidTarget {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Classify the error for event consumers.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::PermissionDenied { .. } => ErrorKind::PermissionDenied,
            Self::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            Self::WouldMerge { .. } => ErrorKind::WouldMerge,
            Self::CrossDevice { .. } => ErrorKind::CrossDevice,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::NameCollisionExhausted { .. } => ErrorKind::NameCollisionExhausted,
            Self::InvalidName { .. } => ErrorKind::InvalidName,
            Self::InvalidTarget { .. } => ErrorKind::InvalidTarget,
            Self::Unsupported { .. } => ErrorKind::Unsupported,
            Self::Io { .. } => ErrorKind::Io,
        }
    }

    /// Whether this error is a cancellation rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Classification of an error, carried by engine events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
pub enum ErrorKind {
    #[strum(to_string = "Not found")]
    NotFound,
    #[strum(to_string = "Permission denied")]
    PermissionDenied,
    #[strum(to_string = "Already exists")]
    AlreadyExists,
    #[strum(to_string = "Would merge directories")]
    WouldMerge,
    #[strum(to_string = "Cross-device move")]
    CrossDevice,
    #[strum(to_string = "Cancelled")]
    Cancelled,
    #[strum(to_string = "No free name")]
    NameCollisionExhausted,
    #[strum(to_string = "Invalid name")]
    InvalidName,
    #[strum(to_string = "Invalid target")]
    InvalidTarget,
    #[strum(to_string = "Unsupported")]
    Unsupported,
    #[strum(to_string = "I/O error")]
    Io,
}

impl ErrorKind {
    /// Errors that skip an item without counting against the batch.
    pub fn is_skip(&self) -> bool {
        matches!(self, Self::NotFound | Self::Cancelled)
    }
}

/// Errors returned by engine commands.
#[derive(Debug, Error)]
pub enum EngineError {
    /// No active transaction with this id.
    #[error("Unknown transaction: {id}")]
    UnknownTransaction { id: TransactionId },

    /// No active job with this id.
    #[error("Unknown job: {id}")]
    UnknownJob { id: JobId },

    /// Operations cannot be added after commit.
    #[error("Transaction {id} is already committed")]
    AlreadyCommitted { id: TransactionId },

    /// The job is not waiting on a conflict.
    #[error("Job {id} has no pending conflict")]
    NoPendingConflict { id: JobId },

    /// The Rename resolution produced no usable name.
    #[error("Conflict rename for job {id} failed: {source}")]
    RenameFailed {
        id: JobId,
        #[source]
        source: FsError,
    },

    /// An undo or redo is already running.
    #[error("An undo or redo is already in progress")]
    HistoryBusy,

    /// The undo stack is empty.
    #[error("Nothing to undo")]
    NothingToUndo,

    /// The redo stack is empty.
    #[error("Nothing to redo")]
    NothingToRedo,

    /// An operation was rejected at registration.
    #[error("Invalid operation: {source}")]
    InvalidOperation {
        #[source]
        source: FsError,
    },
}
