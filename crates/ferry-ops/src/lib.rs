//! Transaction and undo engine for ferry.
//!
//! File operations are registered as jobs inside a [`Transaction`], gated for
//! destination conflicts, executed on a bounded worker pool and recorded in a
//! reversible history. All mutation goes through
//! [`TransactionManager::add_operation`] and [`TransactionManager::commit`].
//!
//! The `test-util` feature exposes `MemoryFs`, an in-memory adapter with
//! fault injection for exercising the engine without touching disk.

mod adapter;
mod conflict;
mod copy;
mod create;
mod event;
mod executor;
mod job;
mod local;
mod manager;
#[cfg(any(test, feature = "test-util"))]
mod memory;
mod move_op;
mod operation;
mod pool;
mod progress;
mod rename;
mod transaction;
mod undo;

pub use adapter::{EntryKind, EntryMeta, FileSystemAdapter, TrashItem};
pub use conflict::{
    unique_name, Conflict, ConflictAction, ConflictKind, ConflictResolver, ConflictState,
    FixedResolver, NamingStyle, Resolution,
};
pub use event::EngineEvent;
pub use job::{Job, JobOptions, JobOutcome, JobStatus, SkippedPath};
pub use local::LocalFs;
pub use manager::{CancelTarget, TransactionManager};
#[cfg(any(test, feature = "test-util"))]
pub use memory::MemoryFs;
pub use operation::{JobError, JobKind, Operation};
pub use progress::{summarize, JobProgress, ResultDescriptor};
pub use rename::validate_filename;
pub use transaction::{Transaction, TransactionOrigin, TransactionStatus};
pub use undo::{HistoryEntry, UndoHistory};
