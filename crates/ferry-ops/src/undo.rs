//! Undo and redo history of completed transactions.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use ferry_core::{JobId, TransactionId};

use crate::job::Job;
use crate::operation::Operation;
use crate::transaction::Transaction;

/// A completed transaction recorded in the history.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    /// The executed transaction, restricted to its reversible successful jobs.
    pub transaction: Transaction,
    /// Menu label, e.g. "Move 2 items".
    pub label: String,
    pub recorded_at: DateTime<Utc>,
}

impl HistoryEntry {
    pub(crate) fn new(transaction: Transaction, label: impl Into<String>) -> Self {
        Self {
            transaction,
            label: label.into(),
            recorded_at: Utc::now(),
        }
    }

    pub fn id(&self) -> TransactionId {
        self.transaction.id
    }

    /// The operations that reverse this entry, newest job first.
    ///
    /// Each operation is paired with the id of the job it reverses.
    pub fn reciprocal(&self) -> Vec<(JobId, Operation)> {
        self.transaction
            .jobs()
            .rev()
            .filter_map(|job| reverse_job(job).map(|op| (job.id, op)))
            .collect()
    }
}

/// The operation that undoes a completed job.
fn reverse_job(job: &Job) -> Option<Operation> {
    let outcome = job.outcome.as_ref()?;
    match &job.operation {
        Operation::Move { source, .. } => {
            let result = outcome.result_path.clone()?;
            Some(match &outcome.moved {
                Some(moved) => Operation::move_entries(result, source.clone(), moved.clone()),
                None => Operation::move_to(result, source.clone()),
            })
        }
        Operation::Rename { source, .. } => {
            let old_name = source.file_name()?.to_string_lossy().into_owned();
            Some(Operation::rename(outcome.result_path.clone()?, old_name))
        }
        Operation::CreateFolder { .. }
        | Operation::CreateFile { .. }
        | Operation::CreateSymlink { .. }
        | Operation::Restore { .. } => Some(Operation::trash(outcome.result_path.clone()?)),
        Operation::Trash { .. } => Some(Operation::restore(outcome.trash_item.clone()?)),
        Operation::Copy { .. } | Operation::EmptyTrash => None,
    }
}

/// A bounded stack; the most recent entry is at the back.
#[derive(Debug)]
struct Stack {
    entries: VecDeque<HistoryEntry>,
    max_entries: usize,
}

impl Stack {
    fn new(max_entries: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(max_entries.min(1000)),
            max_entries: max_entries.max(1),
        }
    }

    fn push(&mut self, entry: HistoryEntry) {
        // Remove oldest entry if at capacity
        while self.entries.len() >= self.max_entries {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    fn take(&mut self, id: TransactionId) -> Option<HistoryEntry> {
        let index = self.entries.iter().position(|e| e.id() == id)?;
        self.entries.remove(index)
    }

    fn get(&self, id: TransactionId) -> Option<&HistoryEntry> {
        self.entries.iter().find(|e| e.id() == id)
    }
}

/// Two bounded stacks of completed transactions.
#[derive(Debug)]
pub struct UndoHistory {
    undo: Stack,
    redo: Stack,
}

impl Default for UndoHistory {
    fn default() -> Self {
        Self::new(100)
    }
}

impl UndoHistory {
    /// Create a history keeping at most `depth` entries per stack.
    pub fn new(depth: usize) -> Self {
        Self {
            undo: Stack::new(depth),
            redo: Stack::new(depth),
        }
    }

    pub fn can_undo(&self) -> bool {
        !self.undo.entries.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo.entries.is_empty()
    }

    /// The entry the next undo would reverse.
    pub fn peek_undo(&self) -> Option<&HistoryEntry> {
        self.undo.entries.back()
    }

    /// The entry the next redo would re-apply.
    pub fn peek_redo(&self) -> Option<&HistoryEntry> {
        self.redo.entries.back()
    }

    /// Undo entries, oldest first.
    pub fn undo_entries(&self) -> impl DoubleEndedIterator<Item = &HistoryEntry> {
        self.undo.entries.iter()
    }

    /// Redo entries, oldest first.
    pub fn redo_entries(&self) -> impl DoubleEndedIterator<Item = &HistoryEntry> {
        self.redo.entries.iter()
    }

    pub(crate) fn push_undo(&mut self, entry: HistoryEntry) {
        self.undo.push(entry);
    }

    pub(crate) fn push_redo(&mut self, entry: HistoryEntry) {
        self.redo.push(entry);
    }

    pub(crate) fn clear_redo(&mut self) {
        self.redo.entries.clear();
    }

    pub(crate) fn undo_entry(&self, id: TransactionId) -> Option<&HistoryEntry> {
        self.undo.get(id)
    }

    pub(crate) fn redo_entry(&self, id: TransactionId) -> Option<&HistoryEntry> {
        self.redo.get(id)
    }

    pub(crate) fn take_undo(&mut self, id: TransactionId) -> Option<HistoryEntry> {
        self.undo.take(id)
    }

    pub(crate) fn take_redo(&mut self, id: TransactionId) -> Option<HistoryEntry> {
        self.redo.take(id)
    }
}
