//! Jobs: a single operation inside a transaction.

use std::path::{Path, PathBuf};

use ferry_core::{ErrorKind, JobId, TransactionId};
use serde::{Deserialize, Serialize};
use strum::Display;
use tokio_util::sync::CancellationToken;

use crate::adapter::TrashItem;
use crate::operation::{JobError, JobKind, Operation};
use crate::progress::{JobProgress, ResultDescriptor};

/// Lifecycle of a job. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Whether no further transition is possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether moving from `self` to `next` is allowed.
    pub fn can_advance_to(&self, next: JobStatus) -> bool {
        match self {
            Self::Pending => next != Self::Pending,
            Self::Running => next.is_terminal(),
            _ => false,
        }
    }
}

/// Per-job registration options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOptions {
    /// On a destination collision, pick a free name instead of raising a conflict.
    #[serde(default)]
    pub auto_rename: bool,
}

impl JobOptions {
    /// Options with auto-rename enabled.
    pub fn auto_rename() -> Self {
        Self { auto_rename: true }
    }
}

/// A sub-path a job could not process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedPath {
    pub path: PathBuf,
    pub kind: ErrorKind,
    pub reason: String,
}

impl From<JobError> for SkippedPath {
    fn from(error: JobError) -> Self {
        Self {
            path: error.path,
            kind: error.kind,
            reason: error.message,
        }
    }
}

/// What a finished job actually did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOutcome {
    /// Final absolute path, which may differ from the requested destination.
    pub result_path: Option<PathBuf>,
    /// Restore handle for trash jobs.
    pub trash_item: Option<TrashItem>,
    pub files_done: u64,
    pub bytes_done: u64,
    /// Sub-paths that were skipped, with reasons.
    pub skipped: Vec<SkippedPath>,
    /// For entry-wise moves that merged into existing directories or left
    /// entries behind: the paths, relative to the result, that this job
    /// actually put there.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub moved: Option<Vec<PathBuf>>,
}

impl JobOutcome {
    /// An outcome with a result path and counters.
    pub fn with_result(result_path: PathBuf, files_done: u64, bytes_done: u64) -> Self {
        Self {
            result_path: Some(result_path),
            files_done,
            bytes_done,
            ..Self::default()
        }
    }

    /// Whether some sub-paths were skipped.
    pub fn is_partial(&self) -> bool {
        !self.skipped.is_empty()
    }

    pub(crate) fn skip(&mut self, error: JobError) {
        self.skipped.push(error.into());
    }
}

/// One operation registered in a transaction.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub transaction_id: TransactionId,
    /// The operation as registered.
    pub requested: Operation,
    /// The operation that is (or was) executed, after conflict resolution.
    pub operation: Operation,
    pub options: JobOptions,
    /// Whether the destination may be replaced.
    pub overwrite: bool,
    pub progress: JobProgress,
    pub outcome: Option<JobOutcome>,
    pub error: Option<JobError>,
    /// For undo and redo jobs, the history job this one reverses.
    pub reverses: Option<JobId>,
    status: JobStatus,
    pub(crate) cancel: CancellationToken,
    /// Times the job went back through conflict resolution after its
    /// destination appeared mid-run.
    pub(crate) regated: u8,
}

impl Job {
    pub(crate) fn new(
        transaction_id: TransactionId,
        operation: Operation,
        options: JobOptions,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id: JobId::new(),
            transaction_id,
            requested: operation.clone(),
            operation,
            options,
            overwrite: false,
            progress: JobProgress::default(),
            outcome: None,
            error: None,
            reverses: None,
            status: JobStatus::Pending,
            cancel,
            regated: 0,
        }
    }

    pub fn kind(&self) -> JobKind {
        self.operation.kind()
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether the job finished and did its work, possibly partially.
    pub fn succeeded(&self) -> bool {
        self.status == JobStatus::Completed
    }

    /// Whether the job completed with skipped sub-paths.
    pub fn is_partial(&self) -> bool {
        self.outcome.as_ref().is_some_and(JobOutcome::is_partial)
    }

    /// The actual final path of the job, once completed.
    pub fn result_path(&self) -> Option<&Path> {
        self.outcome.as_ref()?.result_path.as_deref()
    }

    /// Path shown to users.
    pub fn display_path(&self) -> PathBuf {
        self.operation.display_path()
    }

    /// Summary of how the job ended, if it has.
    pub fn result(&self) -> Option<ResultDescriptor> {
        match self.status {
            JobStatus::Pending | JobStatus::Running => None,
            JobStatus::Completed => Some(match &self.outcome {
                Some(outcome) if outcome.is_partial() => ResultDescriptor::Partial {
                    skipped: outcome.skipped.len(),
                },
                _ => ResultDescriptor::Success,
            }),
            JobStatus::Failed => Some(ResultDescriptor::Failed {
                error: self.error.as_ref().map_or(ErrorKind::Io, |e| e.kind),
            }),
            JobStatus::Cancelled => Some(ResultDescriptor::Cancelled),
        }
    }

    /// Move to `next` if the transition is allowed. Returns whether it moved.
    pub(crate) fn advance(&mut self, next: JobStatus) -> bool {
        if self.status.can_advance_to(next) {
            self.status = next;
            true
        } else {
            false
        }
    }
}
