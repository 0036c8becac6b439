//! Dispatch of a single operation to its worker routine.

use ferry_core::FsError;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::adapter::FileSystemAdapter;
use crate::copy::run_copy;
use crate::create::{run_create, CreateKind};
use crate::job::JobOutcome;
use crate::move_op::run_move;
use crate::operation::Operation;
use crate::progress::ProgressReporter;
use crate::rename::run_rename;

/// Run `operation` to completion on the current thread.
pub(crate) fn execute(
    adapter: &dyn FileSystemAdapter,
    operation: &Operation,
    overwrite: bool,
    cancel: &CancellationToken,
    reporter: &mut ProgressReporter,
) -> Result<JobOutcome, FsError> {
    if cancel.is_cancelled() {
        return Err(FsError::Cancelled);
    }

    match operation {
        Operation::Copy {
            source,
            destination,
        } => run_copy(adapter, source, destination, overwrite, cancel, reporter),
        Operation::Move {
            source,
            destination,
            entries,
        } => run_move(
            adapter,
            source,
            destination,
            entries.as_deref(),
            overwrite,
            cancel,
            reporter,
        ),
        Operation::Rename { source, new_name } => {
            run_rename(adapter, source, new_name, overwrite, reporter)
        }
        Operation::CreateFolder { path } => {
            run_create(adapter, path, CreateKind::Folder, reporter)
        }
        Operation::CreateFile { path } => run_create(adapter, path, CreateKind::File, reporter),
        Operation::CreateSymlink { target, link } => {
            run_create(adapter, link, CreateKind::Symlink { target }, reporter)
        }
        Operation::Trash { path } => {
            let len = adapter.stat(path).map_or(0, |m| m.len);
            reporter.begin(1, len);
            reporter.set_current(path);
            let item = adapter.trash(path)?;
            reporter.file_done(len);
            Ok(JobOutcome {
                trash_item: Some(item),
                files_done: 1,
                bytes_done: len,
                ..JobOutcome::default()
            })
        }
        Operation::Restore { item } => {
            reporter.begin(1, 0);
            reporter.set_current(&item.original_path);
            if overwrite && adapter.exists(&item.original_path) {
                debug!(target: "ferry::worker", path = %item.original_path.display(), "Trashing entry in the way of restore");
                adapter.trash(&item.original_path)?;
            }
            let restored = adapter.restore(item)?;
            reporter.file_done(0);
            Ok(JobOutcome::with_result(restored, 1, 0))
        }
        Operation::EmptyTrash => {
            reporter.begin(1, 0);
            adapter.empty_trash()?;
            reporter.file_done(0);
            Ok(JobOutcome::default())
        }
    }
}
