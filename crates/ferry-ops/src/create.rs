//! Creation of folders, files and symlinks.

use std::path::Path;

use ferry_core::FsError;

use crate::adapter::FileSystemAdapter;
use crate::job::JobOutcome;
use crate::progress::ProgressReporter;

/// What to create.
#[derive(Debug, Clone, Copy)]
pub(crate) enum CreateKind<'a> {
    Folder,
    File,
    Symlink { target: &'a Path },
}

pub(crate) fn run_create(
    adapter: &dyn FileSystemAdapter,
    path: &Path,
    kind: CreateKind<'_>,
    reporter: &mut ProgressReporter,
) -> Result<JobOutcome, FsError> {
    reporter.begin(1, 0);
    reporter.set_current(path);

    let created = match kind {
        CreateKind::Folder => adapter.create_folder(path)?,
        CreateKind::File => adapter.create_file(path)?,
        CreateKind::Symlink { target } => adapter.create_symlink(target, path)?,
    };

    reporter.file_done(0);
    Ok(JobOutcome::with_result(created, 1, 0))
}
