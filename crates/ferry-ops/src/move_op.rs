//! Move with same-device fast path and copy+delete / merge fallbacks.

use std::path::{Path, PathBuf};

use ferry_core::FsError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::adapter::FileSystemAdapter;
use crate::copy::{
    check_not_nested, copy_entry, is_below_any, skip_below, skip_cancelled, Plan, PlanEntry,
};
use crate::job::JobOutcome;
use crate::operation::JobError;
use crate::progress::ProgressReporter;

/// Move `source` to `destination`.
///
/// A single `move_entry` is attempted first. When it reports a device
/// boundary or a directory merge, the tree is moved entry by entry. A move
/// restricted to `selected` entries always goes entry by entry.
pub(crate) fn run_move(
    adapter: &dyn FileSystemAdapter,
    source: &Path,
    destination: &Path,
    selected: Option<&[PathBuf]>,
    overwrite: bool,
    cancel: &CancellationToken,
    reporter: &mut ProgressReporter,
) -> Result<JobOutcome, FsError> {
    let meta = adapter.stat(source).ok_or_else(|| FsError::NotFound {
        path: source.to_path_buf(),
    })?;
    if source == destination {
        return Ok(JobOutcome::with_result(destination.to_path_buf(), 0, 0));
    }
    check_not_nested(adapter, source, destination)?;
    if cancel.is_cancelled() {
        return Err(FsError::Cancelled);
    }
    if selected.is_some() {
        return move_tree(adapter, source, destination, selected, overwrite, cancel, reporter);
    }

    reporter.set_current(source);
    match adapter.move_entry(source, destination, overwrite) {
        Ok(path) => {
            reporter.begin(1, meta.len);
            reporter.file_done(meta.len);
            Ok(JobOutcome::with_result(path, 1, meta.len))
        }
        Err(e @ (FsError::CrossDevice { .. } | FsError::WouldMerge { .. })) => {
            debug!(target: "ferry::worker", source = %source.display(), reason = %e, "Falling back to entry-wise move");
            move_tree(adapter, source, destination, None, overwrite, cancel, reporter)
        }
        Err(e) => Err(e),
    }
}

fn move_tree(
    adapter: &dyn FileSystemAdapter,
    source: &Path,
    destination: &Path,
    selected: Option<&[PathBuf]>,
    overwrite: bool,
    cancel: &CancellationToken,
    reporter: &mut ProgressReporter,
) -> Result<JobOutcome, FsError> {
    let mut plan = Plan::walk(adapter, source, destination)?;
    if let Some(selected) = selected {
        plan.retain_selected(source, selected);
    }
    reporter.begin(plan.files_total(), plan.bytes_total);

    let mut outcome = JobOutcome::with_result(destination.to_path_buf(), 0, 0);
    for error in &plan.unreadable {
        outcome.skip(error.clone());
    }

    // Directories are reused rather than replaced when merging.
    let merge_dirs = overwrite || selected.is_some();
    let mut merged = false;
    let mut moved: Vec<PathBuf> = Vec::new();
    let mut failed_dirs: Vec<PathBuf> = Vec::new();
    let mut emptied_dirs: Vec<PathBuf> = Vec::new();
    for (index, entry) in plan.entries.iter().enumerate() {
        if cancel.is_cancelled() {
            if index == 0 {
                return Err(FsError::Cancelled);
            }
            skip_cancelled(&plan.entries[index..], &failed_dirs, &mut outcome);
            break;
        }

        if is_below_any(entry.source(), &failed_dirs) {
            continue;
        }

        reporter.set_current(entry.source());
        let result = match entry {
            PlanEntry::Dir {
                source: dir,
                destination: target,
            } => {
                let existed = adapter.stat(target).is_some_and(|m| m.is_dir());
                let created = if existed && merge_dirs {
                    Ok(0)
                } else {
                    copy_entry(adapter, entry, overwrite)
                };
                created.map(|bytes| {
                    merged |= existed;
                    emptied_dirs.push(dir.clone());
                    if !existed {
                        record(&mut moved, source, dir);
                    }
                    bytes
                })
            }
            PlanEntry::File {
                source: file,
                destination: target,
                len,
            } => relocate_file(adapter, file, target, overwrite).map(|()| {
                record(&mut moved, source, file);
                *len
            }),
        };

        match result {
            Ok(bytes) => {
                outcome.files_done += 1;
                outcome.bytes_done += bytes;
                reporter.file_done(bytes);
            }
            Err(e) if index == 0 => return Err(e),
            Err(e) => {
                warn!(target: "ferry::worker", path = %entry.source().display(), error = %e, "Skipping entry");
                if let PlanEntry::Dir { source: dir, .. } = entry {
                    failed_dirs.push(dir.clone());
                    skip_below(
                        &plan.entries[index + 1..],
                        dir,
                        "Parent directory could not be moved",
                        &mut outcome,
                    );
                }
                outcome.skip(JobError::from_fs(entry.source(), &e));
            }
        }
    }

    // Source directories still holding skipped entries stay in place.
    for dir in emptied_dirs.iter().rev() {
        if let Err(e) = adapter.remove(dir) {
            debug!(target: "ferry::worker", path = %dir.display(), error = %e, "Source directory kept");
        }
    }

    // Moving the whole result back is only correct when this job owns all
    // of it; otherwise remember exactly what it moved.
    if merged || selected.is_some() || outcome.is_partial() {
        outcome.moved = Some(moved);
    }

    reporter.flush();
    Ok(outcome)
}

/// Remember `path` relative to the moved root. The root itself is implied.
fn record(moved: &mut Vec<PathBuf>, root: &Path, path: &Path) {
    match path.strip_prefix(root) {
        Ok(rel) if !rel.as_os_str().is_empty() => moved.push(rel.to_path_buf()),
        _ => {}
    }
}

fn relocate_file(
    adapter: &dyn FileSystemAdapter,
    source: &Path,
    destination: &Path,
    overwrite: bool,
) -> Result<(), FsError> {
    match adapter.move_entry(source, destination, overwrite) {
        Ok(_) => Ok(()),
        Err(FsError::CrossDevice { .. }) => {
            adapter.copy_file(source, destination, overwrite)?;
            adapter.remove(source)
        }
        Err(e) => Err(e),
    }
}
