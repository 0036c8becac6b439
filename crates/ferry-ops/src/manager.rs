//! The transaction manager: single owner of all engine state.
//!
//! Workers never touch transactions, jobs or history. They report over a
//! channel and the manager applies those reports in [`TransactionManager::poll`]
//! or [`TransactionManager::run_until_idle`].

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ferry_core::{EngineConfig, EngineError, ErrorKind, FsError, JobId, TransactionId};
use indexmap::IndexMap;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, trace, warn};

use crate::adapter::{FileSystemAdapter, TrashItem};
use crate::conflict::{
    unique_name, Conflict, ConflictAction, ConflictKind, ConflictResolver, ConflictState,
    NamingStyle, Resolution,
};
use crate::event::{EngineEvent, WorkerEvent, WorkerEventKind};
use crate::job::{Job, JobOptions, JobOutcome, JobStatus};
use crate::operation::{sibling, JobError, JobKind, Operation};
use crate::pool::{JobHandle, WorkItem, WorkerPool};
use crate::rename::validate_filename;
use crate::transaction::{Transaction, TransactionOrigin};
use crate::undo::{HistoryEntry, UndoHistory};

const REMAINING_SUFFIX: &str = " (remaining)";

/// How often one job may go back through conflict resolution.
const MAX_REGATES: u8 = 3;

/// What [`TransactionManager::cancel`] applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelTarget {
    Transaction(TransactionId),
    Job(JobId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Undo,
    Redo,
}

/// Coordinates transactions, conflict gating, workers and history.
pub struct TransactionManager {
    config: EngineConfig,
    adapter: Arc<dyn FileSystemAdapter>,
    pool: WorkerPool,
    worker_rx: mpsc::UnboundedReceiver<WorkerEvent>,
    events: broadcast::Sender<EngineEvent>,
    active: IndexMap<TransactionId, Transaction>,
    job_index: HashMap<JobId, TransactionId>,
    in_flight: HashMap<JobId, JobHandle>,
    held: IndexMap<JobId, Conflict>,
    resolver: Option<Box<dyn ConflictResolver>>,
    history: UndoHistory,
    history_op: Option<TransactionId>,
    finished: VecDeque<Transaction>,
    can_undo: bool,
    can_redo: bool,
}

impl TransactionManager {
    /// Create a manager running its workers on the current tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn new(adapter: Arc<dyn FileSystemAdapter>, config: EngineConfig) -> Self {
        Self::with_runtime(Handle::current(), adapter, config)
    }

    /// Create a manager running its workers on `runtime`.
    pub fn with_runtime(
        runtime: Handle,
        adapter: Arc<dyn FileSystemAdapter>,
        config: EngineConfig,
    ) -> Self {
        let (worker_tx, worker_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let pool = WorkerPool::new(
            runtime,
            config.effective_workers(),
            Arc::clone(&adapter),
            worker_tx,
            config.progress_interval(),
        );
        debug!(target: "ferry::txn", workers = pool.size(), history_depth = config.history_depth, "Transaction manager ready");

        Self {
            history: UndoHistory::new(config.history_depth),
            config,
            adapter,
            pool,
            worker_rx,
            events,
            active: IndexMap::new(),
            job_index: HashMap::new(),
            in_flight: HashMap::new(),
            held: IndexMap::new(),
            resolver: None,
            history_op: None,
            finished: VecDeque::new(),
            can_undo: false,
            can_redo: false,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Number of jobs that may execute at once.
    pub fn worker_count(&self) -> usize {
        self.pool.size()
    }

    /// Receive engine events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Answer conflicts synchronously instead of holding jobs.
    pub fn set_conflict_resolver(&mut self, resolver: impl ConflictResolver + 'static) {
        self.resolver = Some(Box::new(resolver));
    }

    /// Hold conflicting jobs until [`TransactionManager::resolve_conflict`].
    pub fn clear_conflict_resolver(&mut self) {
        self.resolver = None;
    }

    // ---- Commands -------------------------------------------------------

    /// Open a new, empty transaction.
    pub fn start_transaction(&mut self, description: impl Into<String>) -> TransactionId {
        let txn = Transaction::new(description, TransactionOrigin::Fresh);
        let id = txn.id;
        debug!(target: "ferry::txn", txn = %id, description = %txn.description, "Transaction started");
        self.active.insert(id, txn);
        id
    }

    /// Register an operation. Nothing touches the filesystem until commit.
    pub fn add_operation(
        &mut self,
        transaction_id: TransactionId,
        operation: Operation,
    ) -> Result<JobId, EngineError> {
        self.add_operation_with(transaction_id, operation, JobOptions::default())
    }

    /// Register an operation with per-job options.
    pub fn add_operation_with(
        &mut self,
        transaction_id: TransactionId,
        operation: Operation,
        options: JobOptions,
    ) -> Result<JobId, EngineError> {
        let txn = self
            .active
            .get_mut(&transaction_id)
            .ok_or(EngineError::UnknownTransaction { id: transaction_id })?;
        if txn.committed {
            return Err(EngineError::AlreadyCommitted { id: transaction_id });
        }

        let operation = operation
            .normalized()
            .map_err(|source| EngineError::InvalidOperation { source })?;
        let job = Job::new(txn.id, operation, options, txn.cancel.child_token());
        trace!(target: "ferry::txn", txn = %transaction_id, job = %job.id, kind = %job.kind(), "Operation registered");
        let id = txn.push(job);
        self.job_index.insert(id, transaction_id);
        Ok(id)
    }

    /// Gate every job of the transaction for conflicts and submit the rest.
    pub fn commit(&mut self, transaction_id: TransactionId) -> Result<(), EngineError> {
        let txn = self
            .active
            .get_mut(&transaction_id)
            .ok_or(EngineError::UnknownTransaction { id: transaction_id })?;
        if txn.committed {
            return Err(EngineError::AlreadyCommitted { id: transaction_id });
        }
        txn.committed = true;
        txn.mark_running();

        let job_ids: Vec<JobId> = txn.jobs().map(|j| j.id).collect();
        info!(target: "ferry::txn", txn = %transaction_id, description = %txn.description, jobs = job_ids.len(), "Committing transaction");
        let event = EngineEvent::TransactionStarted {
            id: transaction_id,
            description: txn.description.clone(),
            total_ops: job_ids.len(),
        };
        self.emit(event);

        for job_id in job_ids {
            self.gate(transaction_id, job_id);
        }
        self.try_finish(transaction_id);
        Ok(())
    }

    /// Answer a held conflict.
    ///
    /// With `apply_to_all`, the action is cached for the transaction and
    /// applied to its other held jobs as well.
    pub fn resolve_conflict(
        &mut self,
        job_id: JobId,
        action: ConflictAction,
        new_name: Option<String>,
        apply_to_all: bool,
    ) -> Result<(), EngineError> {
        if !self.held.contains_key(&job_id) {
            return Err(if self.job_index.contains_key(&job_id) {
                EngineError::NoPendingConflict { id: job_id }
            } else {
                EngineError::UnknownJob { id: job_id }
            });
        }
        if let (ConflictAction::Rename, Some(name)) = (action, new_name.as_deref()) {
            validate_filename(name).map_err(|reason| EngineError::RenameFailed {
                id: job_id,
                source: FsError::invalid_name(name, reason),
            })?;
        }
        let Some(conflict) = self.held.shift_remove(&job_id) else {
            return Err(EngineError::NoPendingConflict { id: job_id });
        };

        let txn_id = conflict.transaction_id;
        if apply_to_all {
            if let Some(txn) = self.active.get_mut(&txn_id) {
                txn.apply_to_all = Some(action);
            }
        }
        self.apply_resolution(
            conflict,
            Resolution {
                action,
                apply_to_all,
                new_name,
            },
        );

        if apply_to_all {
            let others: Vec<JobId> = self
                .held
                .values()
                .filter(|c| c.transaction_id == txn_id)
                .map(|c| c.job_id)
                .collect();
            for other in others {
                if let Some(conflict) = self.held.shift_remove(&other) {
                    self.apply_resolution(conflict, Resolution::once(action));
                }
            }
        }

        self.try_finish(txn_id);
        Ok(())
    }

    /// Request cooperative cancellation.
    ///
    /// Jobs that have not reached a worker are cancelled at once; running
    /// jobs stop at their next file.
    pub fn cancel(&mut self, target: CancelTarget) -> Result<(), EngineError> {
        match target {
            CancelTarget::Transaction(id) => {
                if !self.active.contains_key(&id) {
                    return Err(EngineError::UnknownTransaction { id });
                }
                self.cancel_transaction(id);
                self.try_finish(id);
            }
            CancelTarget::Job(id) => {
                let txn_id = *self
                    .job_index
                    .get(&id)
                    .ok_or(EngineError::UnknownJob { id })?;
                self.cancel_job(txn_id, id);
                self.try_finish(txn_id);
            }
        }
        Ok(())
    }

    /// Reverse the most recent history entry.
    ///
    /// Returns the id of the reciprocal transaction, which runs like any
    /// other. The entry leaves the undo stack once that transaction is done.
    pub fn undo(&mut self) -> Result<TransactionId, EngineError> {
        if self.history_op.is_some() {
            return Err(EngineError::HistoryBusy);
        }
        let entry = self.history.peek_undo().ok_or(EngineError::NothingToUndo)?;
        let description = format!("Undo {}", entry.label);
        let origin = TransactionOrigin::Undo { of: entry.id() };
        let ops = entry.reciprocal();
        self.run_history(description, origin, ops)
    }

    /// Re-apply the most recently undone entry.
    pub fn redo(&mut self) -> Result<TransactionId, EngineError> {
        if self.history_op.is_some() {
            return Err(EngineError::HistoryBusy);
        }
        let entry = self.history.peek_redo().ok_or(EngineError::NothingToRedo)?;
        let description = format!("Redo {}", entry.label);
        let origin = TransactionOrigin::Redo { of: entry.id() };
        let ops = entry.reciprocal();
        self.run_history(description, origin, ops)
    }

    // ---- Driving --------------------------------------------------------

    /// Apply every worker report received so far without waiting.
    ///
    /// Returns the number of reports applied.
    pub fn poll(&mut self) -> usize {
        let mut applied = 0;
        while let Ok(event) = self.worker_rx.try_recv() {
            self.handle_worker_event(event);
            applied += 1;
        }
        applied
    }

    /// Wait until no job is executing.
    ///
    /// Jobs held on an unanswered conflict do not keep this waiting.
    pub async fn run_until_idle(&mut self) {
        while !self.in_flight.is_empty() {
            match self.worker_rx.recv().await {
                Some(event) => self.handle_worker_event(event),
                None => break,
            }
        }
        self.poll();
    }

    /// Whether no job is executing.
    pub fn is_idle(&self) -> bool {
        self.in_flight.is_empty()
    }

    // ---- Queries --------------------------------------------------------

    /// An active or recently finished transaction.
    pub fn transaction(&self, id: TransactionId) -> Option<&Transaction> {
        self.active
            .get(&id)
            .or_else(|| self.finished.iter().rev().find(|t| t.id == id))
    }

    /// Transactions not yet terminal, in creation order.
    pub fn active_transactions(&self) -> impl Iterator<Item = &Transaction> {
        self.active.values()
    }

    /// A job of an active or recently finished transaction.
    pub fn job(&self, id: JobId) -> Option<&Job> {
        if let Some(txn_id) = self.job_index.get(&id) {
            return self.active.get(txn_id).and_then(|t| t.job(id));
        }
        self.finished.iter().rev().find_map(|t| t.job(id))
    }

    /// Conflicts waiting for [`TransactionManager::resolve_conflict`].
    pub fn pending_conflicts(&self) -> Vec<&Conflict> {
        self.held.values().collect()
    }

    pub fn can_undo(&self) -> bool {
        self.history.can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.history.can_redo()
    }

    /// Menu label for the next undo, e.g. "Undo Move 2 items".
    pub fn undo_description(&self) -> Option<String> {
        self.history
            .peek_undo()
            .map(|e| format!("Undo {}", e.label))
    }

    /// Menu label for the next redo.
    pub fn redo_description(&self) -> Option<String> {
        self.history
            .peek_redo()
            .map(|e| format!("Redo {}", e.label))
    }

    /// Undo entries, oldest first.
    pub fn undo_stack(&self) -> Vec<&HistoryEntry> {
        self.history.undo_entries().collect()
    }

    /// Redo entries, oldest first.
    pub fn redo_stack(&self) -> Vec<&HistoryEntry> {
        self.history.redo_entries().collect()
    }

    /// A history entry on either stack.
    pub fn history_entry(&self, id: TransactionId) -> Option<&HistoryEntry> {
        self.history
            .undo_entry(id)
            .or_else(|| self.history.redo_entry(id))
    }

    /// Items currently in the trash, newest first.
    ///
    /// Reads go straight to the adapter; emptying the trash is a job like
    /// any other mutation.
    pub fn trash_items(&self) -> Result<Vec<TrashItem>, FsError> {
        let mut items = self.adapter.enumerate_trash()?;
        items.sort_by_key(|item| std::cmp::Reverse(item.deleted_at));
        Ok(items)
    }

    // ---- Conflict gating ------------------------------------------------

    fn gate(&mut self, txn_id: TransactionId, job_id: JobId) {
        let Some(txn) = self.active.get(&txn_id) else {
            return;
        };
        let Some(job) = txn.job(job_id) else {
            return;
        };
        if job.is_terminal() {
            return;
        }
        if job.cancel.is_cancelled() {
            let error = JobError::cancelled(job.display_path());
            self.finish_job(txn_id, job_id, Err(error));
            return;
        }

        let auto_rename = job.options.auto_rename;
        let cached = txn.apply_to_all;
        let Some(conflict) = self.detect_conflict(job) else {
            self.submit(txn_id, job_id);
            return;
        };
        debug!(target: "ferry::txn", job = %job_id, destination = %conflict.destination.display(), kind = %conflict.kind, "Conflict detected");
        self.set_conflict_state(txn_id, ConflictState::ConflictDetected);

        let resolution = if auto_rename {
            Some(Resolution::once(ConflictAction::Rename))
        } else if let Some(action) = cached {
            Some(Resolution::once(action))
        } else {
            self.resolver.as_mut().map(|r| r.resolve(&conflict))
        };

        match resolution {
            Some(resolution) => {
                if resolution.apply_to_all && !auto_rename {
                    if let Some(txn) = self.active.get_mut(&txn_id) {
                        txn.apply_to_all = Some(resolution.action);
                    }
                }
                self.apply_resolution(conflict, resolution);
            }
            None => {
                self.set_conflict_state(txn_id, ConflictState::AwaitingUserInput);
                self.emit(EngineEvent::ConflictDetected {
                    conflict: conflict.clone(),
                });
                self.held.insert(job_id, conflict);
            }
        }
    }

    /// Whether a job that hit an existing destination should go back
    /// through conflict resolution instead of failing. Another job in the
    /// same batch may have created the destination after this one was gated.
    fn should_regate(&self, txn_id: TransactionId, job_id: JobId, error: &JobError) -> bool {
        if error.kind != ErrorKind::AlreadyExists {
            return false;
        }
        self.active
            .get(&txn_id)
            .and_then(|txn| txn.job(job_id))
            .is_some_and(|job| {
                !job.overwrite
                    && !job.cancel.is_cancelled()
                    && job.regated < MAX_REGATES
                    && !ConflictAction::options_for(job.kind()).is_empty()
            })
    }

    fn detect_conflict(&self, job: &Job) -> Option<Conflict> {
        let destination = job.operation.destination()?;
        let kind = job.kind();
        // Moving or renaming onto itself is a no-op, not a collision.
        if kind != JobKind::Copy && job.operation.source() == Some(destination.as_path()) {
            return None;
        }
        // Selected-entry moves merge into whatever is already there.
        if let Operation::Move { entries: Some(_), .. } = &job.operation {
            return None;
        }
        let options = ConflictAction::options_for(kind);
        if options.is_empty() {
            return None;
        }
        let meta = self.adapter.stat(&destination)?;

        Some(Conflict {
            job_id: job.id,
            transaction_id: job.transaction_id,
            job_kind: kind,
            source: job.operation.source().map(Path::to_path_buf),
            destination,
            kind: if meta.is_dir() {
                ConflictKind::DirectoryExists
            } else {
                ConflictKind::FileExists
            },
            options: options.to_vec(),
        })
    }

    fn apply_resolution(&mut self, conflict: Conflict, resolution: Resolution) {
        let txn_id = conflict.transaction_id;
        let job_id = conflict.job_id;
        let mut action = resolution.action;
        if !conflict.allows(action) {
            warn!(target: "ferry::txn", job = %job_id, %action, kind = %conflict.job_kind, "Action not offered for this job, skipping");
            action = ConflictAction::Skip;
        }
        debug!(target: "ferry::txn", job = %job_id, %action, "Conflict resolved");

        match action {
            ConflictAction::Skip => {
                let error = JobError::new(ErrorKind::Cancelled, &conflict.destination, "Skipped");
                self.finish_job(txn_id, job_id, Err(error));
            }
            ConflictAction::Overwrite => {
                if let Some(job) = self.job_mut(txn_id, job_id) {
                    job.overwrite = true;
                }
                self.submit(txn_id, job_id);
            }
            ConflictAction::Rename => {
                match self.rename_target(&conflict, resolution.new_name.as_deref()) {
                    Ok(target) => {
                        if let Some(job) = self.job_mut(txn_id, job_id) {
                            job.operation = job.operation.with_destination(target);
                        }
                        self.submit(txn_id, job_id);
                    }
                    Err(e) => {
                        warn!(target: "ferry::txn", job = %job_id, error = %e, "No free name");
                        let error = JobError::from_fs(&conflict.destination, &e);
                        self.finish_job(txn_id, job_id, Err(error));
                    }
                }
            }
            ConflictAction::CancelAll => self.cancel_transaction(txn_id),
        }
        self.refresh_conflict_state(txn_id, action);
    }

    fn rename_target(&self, conflict: &Conflict, new_name: Option<&str>) -> Result<PathBuf, FsError> {
        let is_dir = match conflict.job_kind {
            JobKind::CreateFolder => true,
            JobKind::CreateFile | JobKind::CreateSymlink => false,
            _ => conflict
                .source
                .as_deref()
                .and_then(|s| self.adapter.stat(s))
                .is_some_and(|m| m.is_dir()),
        };
        let base = match new_name {
            Some(name) => {
                let requested = sibling(&conflict.destination, name);
                if !self.adapter.exists(&requested) {
                    return Ok(requested);
                }
                requested
            }
            None => conflict.destination.clone(),
        };
        unique_name(
            &base,
            is_dir,
            NamingStyle::for_kind(conflict.job_kind),
            self.config.name_probe_limit,
            |p| self.adapter.exists(p),
        )
    }

    fn set_conflict_state(&mut self, txn_id: TransactionId, state: ConflictState) {
        if let Some(txn) = self.active.get_mut(&txn_id) {
            txn.conflict_state = state;
        }
    }

    fn refresh_conflict_state(&mut self, txn_id: TransactionId, last: ConflictAction) {
        let waiting = self.held.values().any(|c| c.transaction_id == txn_id);
        let state = if waiting {
            ConflictState::AwaitingUserInput
        } else {
            ConflictState::Resolved(last)
        };
        self.set_conflict_state(txn_id, state);
    }

    // ---- Jobs -----------------------------------------------------------

    fn job_mut(&mut self, txn_id: TransactionId, job_id: JobId) -> Option<&mut Job> {
        self.active.get_mut(&txn_id)?.job_mut(job_id)
    }

    fn submit(&mut self, txn_id: TransactionId, job_id: JobId) {
        let Some(job) = self.active.get(&txn_id).and_then(|t| t.job(job_id)) else {
            return;
        };
        let work = WorkItem {
            job_id,
            operation: job.operation.clone(),
            overwrite: job.overwrite,
            cancel: job.cancel.clone(),
        };
        trace!(target: "ferry::worker", job = %job_id, "Submitting job");
        let handle = self.pool.submit(work);
        self.in_flight.insert(handle.job_id, handle);
    }

    fn cancel_transaction(&mut self, txn_id: TransactionId) {
        let Some(txn) = self.active.get_mut(&txn_id) else {
            return;
        };
        info!(target: "ferry::txn", txn = %txn_id, "Cancelling transaction");
        txn.cancel.cancel();
        txn.committed = true;
        txn.mark_running();
        let pending: Vec<JobId> = txn
            .jobs()
            .filter(|j| !j.is_terminal())
            .map(|j| j.id)
            .collect();
        for job_id in pending {
            self.cancel_job(txn_id, job_id);
        }
    }

    fn cancel_job(&mut self, txn_id: TransactionId, job_id: JobId) {
        if let Some(handle) = self.in_flight.get(&job_id) {
            debug!(target: "ferry::worker", job = %job_id, "Signalling cancellation");
            handle.cancel();
            return;
        }
        self.held.shift_remove(&job_id);
        let Some(job) = self.job_mut(txn_id, job_id) else {
            return;
        };
        job.cancel.cancel();
        let error = JobError::cancelled(job.display_path());
        self.finish_job(txn_id, job_id, Err(error));
    }

    /// Move a job to its terminal state and publish it.
    fn finish_job(
        &mut self,
        txn_id: TransactionId,
        job_id: JobId,
        result: Result<JobOutcome, JobError>,
    ) {
        let Some(job) = self.job_mut(txn_id, job_id) else {
            return;
        };

        let status = match result {
            Ok(outcome) => {
                job.progress.files_done = outcome.files_done;
                job.progress.bytes_done = outcome.bytes_done;
                job.progress.files_total = job.progress.files_total.max(outcome.files_done);
                job.progress.bytes_total = job.progress.bytes_total.max(outcome.bytes_done);
                job.outcome = Some(outcome);
                JobStatus::Completed
            }
            Err(error) => {
                let status = if error.kind.is_skip() {
                    JobStatus::Cancelled
                } else {
                    JobStatus::Failed
                };
                job.error = Some(error);
                status
            }
        };
        if !job.advance(status) {
            return;
        }

        let kind = job.kind();
        let path = job.display_path();
        let mut events = Vec::with_capacity(2);
        match (status, &job.error) {
            (JobStatus::Failed, Some(error)) => {
                warn!(target: "ferry::worker", job = %job_id, %kind, path = %path.display(), error = %error.message, "Job failed");
                events.push(EngineEvent::JobError {
                    id: job_id,
                    transaction_id: txn_id,
                    kind,
                    path: error.path.clone(),
                    error: error.kind,
                    message: error.message.clone(),
                });
            }
            _ => {
                if let Some(outcome) = job.outcome.as_ref().filter(|o| o.is_partial()) {
                    warn!(target: "ferry::worker", job = %job_id, skipped = outcome.skipped.len(), "Job completed with skipped entries");
                }
                debug!(target: "ferry::worker", job = %job_id, %kind, %status, "Job finished");
            }
        }
        if let Some(result) = job.result() {
            events.push(EngineEvent::JobCompleted {
                id: job_id,
                transaction_id: txn_id,
                kind,
                path,
                result_path: job.result_path().map(Path::to_path_buf),
                result,
            });
        }

        for event in events {
            self.emit(event);
        }
        self.emit_transaction_progress(txn_id);
    }

    fn handle_worker_event(&mut self, event: WorkerEvent) {
        let job_id = event.job_id;
        let Some(&txn_id) = self.job_index.get(&job_id) else {
            trace!(target: "ferry::worker", job = %job_id, "Report for unknown job");
            return;
        };

        match event.kind {
            WorkerEventKind::Started => {
                let Some(job) = self.job_mut(txn_id, job_id) else {
                    return;
                };
                if job.advance(JobStatus::Running) {
                    let event = EngineEvent::JobStarted {
                        id: job_id,
                        transaction_id: txn_id,
                        kind: job.kind(),
                        path: job.display_path(),
                    };
                    self.emit(event);
                }
            }
            WorkerEventKind::Progress(progress) => {
                let Some(job) = self.job_mut(txn_id, job_id) else {
                    return;
                };
                let event = EngineEvent::JobProgress {
                    id: job_id,
                    current: progress.current.clone(),
                    files_done: progress.files_done,
                    files_total: progress.files_total,
                    bytes_done: progress.bytes_done,
                    bytes_total: progress.bytes_total,
                };
                job.progress = progress;
                self.emit(event);
                self.emit_transaction_progress(txn_id);
            }
            WorkerEventKind::Finished(Err(error)) if self.should_regate(txn_id, job_id, &error) => {
                self.in_flight.remove(&job_id);
                debug!(target: "ferry::txn", job = %job_id, path = %error.path.display(), "Destination appeared after gating, checking again");
                if let Some(job) = self.job_mut(txn_id, job_id) {
                    job.regated += 1;
                    job.progress = Default::default();
                }
                self.gate(txn_id, job_id);
            }
            WorkerEventKind::Finished(result) => {
                self.in_flight.remove(&job_id);
                self.finish_job(txn_id, job_id, result);
                self.try_finish(txn_id);
            }
        }
    }

    // ---- Transactions and history ---------------------------------------

    fn try_finish(&mut self, txn_id: TransactionId) {
        let Some(txn) = self.active.get_mut(&txn_id) else {
            return;
        };
        if !txn.settle() {
            return;
        }
        let Some(txn) = self.active.shift_remove(&txn_id) else {
            return;
        };
        for job in txn.jobs() {
            self.job_index.remove(&job.id);
            self.held.shift_remove(&job.id);
        }

        let summary = txn.summary();
        info!(target: "ferry::txn", txn = %txn_id, status = %txn.status(), partial = txn.is_partial(), %summary, "Transaction finished");
        self.emit(EngineEvent::TransactionFinished {
            id: txn_id,
            description: txn.description.clone(),
            status: txn.status(),
            partial: txn.is_partial(),
            summary,
        });

        self.record_history(&txn);
        self.finished.push_back(txn);
        while self.finished.len() > self.config.history_depth {
            self.finished.pop_front();
        }
        self.publish_history_flags();
    }

    fn record_history(&mut self, txn: &Transaction) {
        match txn.origin {
            TransactionOrigin::Fresh => {
                if txn.jobs().any(Job::succeeded) {
                    self.history.clear_redo();
                }
                if let Some(subset) = txn.reversible_subset() {
                    info!(target: "ferry::history", txn = %txn.id, jobs = subset.total_ops(), "Recorded for undo");
                    self.history
                        .push_undo(HistoryEntry::new(subset, txn.description.clone()));
                }
            }
            TransactionOrigin::Undo { of } => {
                self.history_op = None;
                self.settle_history(of, txn, Direction::Undo);
            }
            TransactionOrigin::Redo { of } => {
                self.history_op = None;
                self.settle_history(of, txn, Direction::Redo);
            }
        }
    }

    /// Move the reversed part of entry `of` to the opposite stack.
    ///
    /// Jobs whose reversal failed stay on the original stack as a separate
    /// entry. When nothing was reversed the entry is left untouched.
    fn settle_history(&mut self, of: TransactionId, executed: &Transaction, direction: Direction) {
        // A reversal that skipped sub-paths only undid part of its job. The
        // job stays on this stack, narrowed to what was left behind.
        let mut reversed: HashSet<JobId> = HashSet::new();
        let mut leftovers: HashMap<JobId, Vec<PathBuf>> = HashMap::new();
        for job in executed.jobs().filter(|j| j.succeeded()) {
            let Some(original) = job.reverses else {
                continue;
            };
            if !job.is_partial() {
                reversed.insert(original);
            } else if let Some(rest) = left_behind(job) {
                leftovers.insert(original, rest);
            }
        }
        if reversed.is_empty() && leftovers.is_empty() {
            warn!(target: "ferry::history", entry = %of, ?direction, "Nothing was reversed, history unchanged");
            return;
        }

        let entry = match direction {
            Direction::Undo => self.history.take_undo(of),
            Direction::Redo => self.history.take_redo(of),
        };
        let Some(entry) = entry else {
            debug!(target: "ferry::history", entry = %of, "History entry evicted while reversing");
            return;
        };

        let counted = |j: &Job| {
            j.reverses
                .is_some_and(|o| reversed.contains(&o) || leftovers.contains_key(&o))
        };
        let done = executed.reversible_subset().and_then(|t| {
            if t.jobs().all(counted) {
                Some(t)
            } else {
                t.retain_jobs(counted)
            }
        });
        if let Some(done) = done {
            let done = HistoryEntry::new(done, entry.label.clone());
            match direction {
                Direction::Undo => self.history.push_redo(done),
                Direction::Redo => self.history.push_undo(done),
            }
        }

        if let Some(mut rest) = entry
            .transaction
            .retain_jobs(|j| !reversed.contains(&j.id))
        {
            for (id, paths) in leftovers.iter() {
                if let Some(outcome) = rest.job_mut(*id).and_then(|j| j.outcome.as_mut()) {
                    outcome.moved = Some(paths.clone());
                }
            }
            let label = if entry.label.ends_with(REMAINING_SUFFIX) {
                entry.label.clone()
            } else {
                format!("{}{REMAINING_SUFFIX}", entry.label)
            };
            warn!(target: "ferry::history", entry = %of, jobs = rest.total_ops(), "Part of the entry could not be reversed");
            let rest = HistoryEntry::new(rest, label);
            match direction {
                Direction::Undo => self.history.push_undo(rest),
                Direction::Redo => self.history.push_redo(rest),
            }
        }
        info!(target: "ferry::history", entry = %of, ?direction, reversed = reversed.len(), narrowed = leftovers.len(), "History updated");
    }

    fn run_history(
        &mut self,
        description: String,
        origin: TransactionOrigin,
        ops: Vec<(JobId, Operation)>,
    ) -> Result<TransactionId, EngineError> {
        let mut txn = Transaction::new(description, origin);
        for (reverses, operation) in ops {
            let mut job = Job::new(
                txn.id,
                operation,
                JobOptions::default(),
                txn.cancel.child_token(),
            );
            job.reverses = Some(reverses);
            self.job_index.insert(job.id, txn.id);
            txn.push(job);
        }

        let id = txn.id;
        info!(target: "ferry::history", txn = %id, description = %txn.description, "Running history transaction");
        self.active.insert(id, txn);
        self.history_op = Some(id);
        self.commit(id)?;
        Ok(id)
    }

    fn publish_history_flags(&mut self) {
        let can_undo = self.history.can_undo();
        if can_undo != self.can_undo {
            self.can_undo = can_undo;
            self.emit(EngineEvent::CanUndoChanged { can_undo });
        }
        let can_redo = self.history.can_redo();
        if can_redo != self.can_redo {
            self.can_redo = can_redo;
            self.emit(EngineEvent::CanRedoChanged { can_redo });
        }
    }

    fn emit_transaction_progress(&self, txn_id: TransactionId) {
        if let Some(txn) = self.active.get(&txn_id) {
            self.emit(EngineEvent::TransactionProgress {
                id: txn_id,
                completed_ops: txn.completed_ops(),
                total_ops: txn.total_ops(),
                bytes_done: txn.bytes_done(),
                bytes_total: txn.bytes_total(),
            });
        }
    }

    fn emit(&self, event: EngineEvent) {
        // No subscribers is not an error.
        let _ = self.events.send(event);
    }
}

impl Drop for TransactionManager {
    fn drop(&mut self) {
        for handle in self.in_flight.values() {
            handle.cancel();
        }
    }
}

/// Paths, relative to the moved root, that a partial entry-wise move left
/// at its source. `None` when the job cannot be narrowed that way.
fn left_behind(job: &Job) -> Option<Vec<PathBuf>> {
    let Operation::Move { source, .. } = &job.operation else {
        return None;
    };
    job.outcome
        .as_ref()?
        .skipped
        .iter()
        .map(|skipped| {
            skipped
                .path
                .strip_prefix(source)
                .ok()
                .filter(|rel| !rel.as_os_str().is_empty())
                .map(Path::to_path_buf)
        })
        .collect()
}
