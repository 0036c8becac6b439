//! Transactions: named, ordered batches of jobs.

use chrono::{DateTime, Utc};
use ferry_core::{JobId, TransactionId};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use strum::Display;
use tokio_util::sync::CancellationToken;

use crate::conflict::{ConflictAction, ConflictState};
use crate::job::{Job, JobStatus};
use crate::operation::JobKind;
use crate::progress::summarize;

/// Lifecycle of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
pub enum TransactionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TransactionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Why a transaction exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionOrigin {
    /// New work requested by the caller.
    Fresh,
    /// Reverses the history entry with this id.
    Undo { of: TransactionId },
    /// Re-applies the redo entry with this id.
    Redo { of: TransactionId },
}

/// A batch of jobs with aggregate progress.
#[derive(Debug, Clone)]
pub struct Transaction {
    pub id: TransactionId,
    pub description: String,
    pub origin: TransactionOrigin,
    pub created_at: DateTime<Utc>,
    jobs: IndexMap<JobId, Job>,
    status: TransactionStatus,
    partial: bool,
    pub(crate) committed: bool,
    pub(crate) conflict_state: ConflictState,
    /// Cached "apply to all" resolution.
    pub(crate) apply_to_all: Option<ConflictAction>,
    pub(crate) cancel: CancellationToken,
}

impl Transaction {
    pub(crate) fn new(description: impl Into<String>, origin: TransactionOrigin) -> Self {
        Self {
            id: TransactionId::new(),
            description: description.into(),
            origin,
            created_at: Utc::now(),
            jobs: IndexMap::new(),
            status: TransactionStatus::Pending,
            partial: false,
            committed: false,
            conflict_state: ConflictState::NoConflict,
            apply_to_all: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn status(&self) -> TransactionStatus {
        self.status
    }

    /// Some jobs succeeded while others failed, were skipped or completed
    /// with skipped sub-paths.
    pub fn is_partial(&self) -> bool {
        self.partial
    }

    pub fn is_committed(&self) -> bool {
        self.committed
    }

    pub fn conflict_state(&self) -> ConflictState {
        self.conflict_state
    }

    /// Jobs in registration order.
    pub fn jobs(&self) -> impl DoubleEndedIterator<Item = &Job> + ExactSizeIterator {
        self.jobs.values()
    }

    pub fn job(&self, id: JobId) -> Option<&Job> {
        self.jobs.get(&id)
    }

    pub(crate) fn job_mut(&mut self, id: JobId) -> Option<&mut Job> {
        self.jobs.get_mut(&id)
    }

    pub(crate) fn push(&mut self, job: Job) -> JobId {
        let id = job.id;
        self.jobs.insert(id, job);
        id
    }

    pub fn total_ops(&self) -> usize {
        self.jobs.len()
    }

    /// Number of jobs in a terminal state.
    pub fn completed_ops(&self) -> usize {
        self.jobs.values().filter(|j| j.is_terminal()).count()
    }

    pub fn bytes_done(&self) -> u64 {
        self.jobs.values().map(|j| j.progress.bytes_done).sum()
    }

    pub fn bytes_total(&self) -> u64 {
        self.jobs.values().map(|j| j.progress.bytes_total).sum()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// The kind shared by every job, if there is one.
    pub fn common_kind(&self) -> Option<JobKind> {
        let mut kinds = self.jobs.values().map(Job::kind);
        let first = kinds.next()?;
        kinds.all(|k| k == first).then_some(first)
    }

    /// Summary such as "Moved 3 items, 1 failed".
    pub fn summary(&self) -> String {
        let count = |status| self.jobs.values().filter(|j| j.status() == status).count();
        summarize(
            self.common_kind(),
            count(JobStatus::Completed),
            count(JobStatus::Failed),
            count(JobStatus::Cancelled),
        )
    }

    pub(crate) fn mark_running(&mut self) {
        if self.status == TransactionStatus::Pending {
            self.status = TransactionStatus::Running;
        }
    }

    /// Recompute the terminal status once every job is terminal.
    ///
    /// Returns true when the transaction became terminal by this call.
    pub(crate) fn settle(&mut self) -> bool {
        if self.status.is_terminal() || !self.committed {
            return false;
        }
        if self.jobs.values().any(|j| !j.is_terminal()) {
            return false;
        }

        let succeeded = self.jobs.values().filter(|j| j.succeeded()).count();
        let failed = self
            .jobs
            .values()
            .any(|j| j.status() == JobStatus::Failed);
        let all_clean = self.jobs.values().all(|j| j.succeeded() && !j.is_partial());

        // Skipped jobs do not stop a transaction from completing; only an
        // explicit cancellation does.
        self.status = if succeeded == self.jobs.len() {
            TransactionStatus::Completed
        } else if failed {
            TransactionStatus::Failed
        } else if self.cancel.is_cancelled() {
            TransactionStatus::Cancelled
        } else {
            TransactionStatus::Completed
        };
        self.partial = succeeded > 0 && !all_clean;
        true
    }

    /// A copy holding only the completed, reversible jobs.
    ///
    /// Returns `None` when nothing reversible succeeded.
    pub(crate) fn reversible_subset(&self) -> Option<Transaction> {
        let jobs: IndexMap<JobId, Job> = self
            .jobs
            .iter()
            .filter(|(_, j)| j.succeeded() && j.kind().is_reversible())
            .map(|(id, j)| (*id, j.clone()))
            .collect();
        if jobs.is_empty() {
            return None;
        }
        Some(Self {
            jobs,
            ..self.clone()
        })
    }

    /// A copy restricted to the jobs for which `keep` is true.
    pub(crate) fn retain_jobs(&self, keep: impl Fn(&Job) -> bool) -> Option<Transaction> {
        let jobs: IndexMap<JobId, Job> = self
            .jobs
            .iter()
            .filter(|(_, j)| keep(j))
            .map(|(id, j)| (*id, j.clone()))
            .collect();
        if jobs.is_empty() {
            return None;
        }
        Some(Self {
            id: TransactionId::new(),
            jobs,
            ..self.clone()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobOptions, JobOutcome};
    use crate::operation::{JobError, Operation};
    use ferry_core::ErrorKind;

    fn txn(ops: Vec<Operation>) -> Transaction {
        let mut txn = Transaction::new("Test", TransactionOrigin::Fresh);
        for op in ops {
            let job = Job::new(txn.id, op, JobOptions::default(), txn.cancel.child_token());
            txn.push(job);
        }
        txn.committed = true;
        txn
    }

    fn finish(txn: &mut Transaction, index: usize, status: JobStatus) {
        let id = *txn.jobs.get_index(index).unwrap().0;
        let job = txn.job_mut(id).unwrap();
        job.advance(JobStatus::Running);
        match status {
            JobStatus::Completed => job.outcome = Some(JobOutcome::with_result("/r".into(), 1, 0)),
            JobStatus::Failed => {
                job.error = Some(JobError::new(ErrorKind::PermissionDenied, "/p", "denied"))
            }
            _ => {}
        }
        job.advance(status);
    }

    #[test]
    fn test_all_completed() {
        let mut t = txn(vec![Operation::create_folder("/a"), Operation::create_folder("/b")]);
        finish(&mut t, 0, JobStatus::Completed);
        assert!(!t.settle());
        finish(&mut t, 1, JobStatus::Completed);
        assert!(t.settle());
        assert_eq!(t.status(), TransactionStatus::Completed);
        assert!(!t.is_partial());
        assert_eq!(t.completed_ops(), 2);
        assert_eq!(t.summary(), "Created 2 items");
    }

    #[test]
    fn test_mixed_is_partial_failure() {
        let mut t = txn(vec![
            Operation::move_to("/a", "/x/a"),
            Operation::move_to("/b", "/x/b"),
            Operation::move_to("/c", "/x/c"),
        ]);
        finish(&mut t, 0, JobStatus::Completed);
        finish(&mut t, 1, JobStatus::Failed);
        finish(&mut t, 2, JobStatus::Completed);
        assert!(t.settle());

        assert_eq!(t.status(), TransactionStatus::Failed);
        assert!(t.is_partial());
        assert_eq!(t.summary(), "Moved 2 items, 1 failed");

        let subset = t.reversible_subset().unwrap();
        assert_eq!(subset.total_ops(), 2);
        assert_eq!(subset.id, t.id);
        assert!(subset.jobs().all(Job::succeeded));
    }

    #[test]
    fn test_skips_complete_but_cancel_does_not() {
        let mut t = txn(vec![Operation::create_folder("/a"), Operation::create_folder("/b")]);
        finish(&mut t, 0, JobStatus::Completed);
        finish(&mut t, 1, JobStatus::Cancelled);
        assert!(t.settle());
        assert_eq!(t.status(), TransactionStatus::Completed);
        assert!(t.is_partial());
        assert_eq!(t.summary(), "Created 1 item, 1 skipped");

        let mut t = txn(vec![Operation::create_folder("/a"), Operation::create_folder("/b")]);
        finish(&mut t, 0, JobStatus::Completed);
        t.cancel.cancel();
        finish(&mut t, 1, JobStatus::Cancelled);
        assert!(t.settle());
        assert_eq!(t.status(), TransactionStatus::Cancelled);
        assert!(t.is_partial());
    }

    #[test]
    fn test_copies_are_not_reversible() {
        let mut t = txn(vec![Operation::copy("/a", "/b")]);
        finish(&mut t, 0, JobStatus::Completed);
        t.settle();
        assert!(t.reversible_subset().is_none());
    }
}
