//! Events flowing from workers to the coordinator and from the engine to
//! front-ends.

use std::path::PathBuf;

use ferry_core::{ErrorKind, JobId, TransactionId};
use serde::Serialize;

use crate::conflict::Conflict;
use crate::job::JobOutcome;
use crate::operation::{JobError, JobKind};
use crate::progress::{JobProgress, ResultDescriptor};
use crate::transaction::TransactionStatus;

/// Message sent by a worker to the coordinator.
#[derive(Debug)]
pub(crate) struct WorkerEvent {
    pub job_id: JobId,
    pub kind: WorkerEventKind,
}

#[derive(Debug)]
pub(crate) enum WorkerEventKind {
    Started,
    Progress(JobProgress),
    Finished(Result<JobOutcome, JobError>),
}

/// Notification published by the engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    TransactionStarted {
        id: TransactionId,
        description: String,
        total_ops: usize,
    },
    TransactionProgress {
        id: TransactionId,
        completed_ops: usize,
        total_ops: usize,
        bytes_done: u64,
        bytes_total: u64,
    },
    TransactionFinished {
        id: TransactionId,
        description: String,
        status: TransactionStatus,
        partial: bool,
        summary: String,
    },
    JobStarted {
        id: JobId,
        transaction_id: TransactionId,
        kind: JobKind,
        path: PathBuf,
    },
    JobProgress {
        id: JobId,
        current: Option<PathBuf>,
        files_done: u64,
        files_total: u64,
        bytes_done: u64,
        bytes_total: u64,
    },
    JobCompleted {
        id: JobId,
        transaction_id: TransactionId,
        kind: JobKind,
        path: PathBuf,
        result_path: Option<PathBuf>,
        result: ResultDescriptor,
    },
    JobError {
        id: JobId,
        transaction_id: TransactionId,
        kind: JobKind,
        path: PathBuf,
        error: ErrorKind,
        message: String,
    },
    ConflictDetected {
        conflict: Conflict,
    },
    CanUndoChanged {
        can_undo: bool,
    },
    CanRedoChanged {
        can_redo: bool,
    },
}
