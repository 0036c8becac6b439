//! Recursive copy with per-file progress and cancellation.

use std::path::{Path, PathBuf};

use ferry_core::FsError;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::adapter::FileSystemAdapter;
use crate::job::JobOutcome;
use crate::operation::JobError;
use crate::progress::ProgressReporter;

/// One entry of a pre-walked tree, in depth-first pre-order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PlanEntry {
    Dir { source: PathBuf, destination: PathBuf },
    File {
        source: PathBuf,
        destination: PathBuf,
        len: u64,
    },
}

impl PlanEntry {
    pub(crate) fn source(&self) -> &Path {
        match self {
            Self::Dir { source, .. } | Self::File { source, .. } => source,
        }
    }
}

/// The full list of entries below a source, with totals.
#[derive(Debug, Default)]
pub(crate) struct Plan {
    pub entries: Vec<PlanEntry>,
    pub bytes_total: u64,
    /// Directories that could not be listed.
    pub unreadable: Vec<JobError>,
}

impl Plan {
    /// Walk `source` depth-first, mapping every entry below `destination`.
    pub(crate) fn walk(
        adapter: &dyn FileSystemAdapter,
        source: &Path,
        destination: &Path,
    ) -> Result<Self, FsError> {
        let meta = adapter.stat(source).ok_or_else(|| FsError::NotFound {
            path: source.to_path_buf(),
        })?;

        let mut plan = Plan::default();
        if meta.is_dir() {
            plan.walk_dir(adapter, source, destination, true)?;
        } else {
            plan.bytes_total = meta.len;
            plan.entries.push(PlanEntry::File {
                source: source.to_path_buf(),
                destination: destination.to_path_buf(),
                len: meta.len,
            });
        }
        Ok(plan)
    }

    fn walk_dir(
        &mut self,
        adapter: &dyn FileSystemAdapter,
        source: &Path,
        destination: &Path,
        is_root: bool,
    ) -> Result<(), FsError> {
        self.entries.push(PlanEntry::Dir {
            source: source.to_path_buf(),
            destination: destination.to_path_buf(),
        });

        let children = match adapter.read_dir(source) {
            Ok(children) => children,
            Err(e) if is_root => return Err(e),
            Err(e) => {
                self.unreadable.push(JobError::from_fs(source, &e));
                return Ok(());
            }
        };

        for child in children {
            let Some(name) = child.file_name() else {
                continue;
            };
            let target = destination.join(name);
            match adapter.stat(&child) {
                Some(meta) if meta.is_dir() => self.walk_dir(adapter, &child, &target, false)?,
                Some(meta) => {
                    self.bytes_total += meta.len;
                    self.entries.push(PlanEntry::File {
                        source: child,
                        destination: target,
                        len: meta.len,
                    });
                }
                // Vanished between listing and stat.
                None => {}
            }
        }
        Ok(())
    }

    pub(crate) fn files_total(&self) -> u64 {
        self.entries.len() as u64
    }

    /// Keep only the root, the `selected` paths (relative to `source`),
    /// everything below them and the directories leading to them.
    pub(crate) fn retain_selected(&mut self, source: &Path, selected: &[PathBuf]) {
        let keep = |path: &Path| match path.strip_prefix(source) {
            Ok(rel) if rel.as_os_str().is_empty() => true,
            Ok(rel) => selected
                .iter()
                .any(|s| rel.starts_with(s) || s.starts_with(rel)),
            Err(_) => false,
        };
        self.entries.retain(|entry| keep(entry.source()));
        self.unreadable.retain(|error| keep(&error.path));
        self.bytes_total = self
            .entries
            .iter()
            .map(|entry| match entry {
                PlanEntry::File { len, .. } => *len,
                PlanEntry::Dir { .. } => 0,
            })
            .sum();
    }
}

/// Fail with `InvalidTarget` if `destination` lies inside the directory `source`.
pub(crate) fn check_not_nested(
    adapter: &dyn FileSystemAdapter,
    source: &Path,
    destination: &Path,
) -> Result<(), FsError> {
    let is_dir = adapter.stat(source).is_some_and(|m| m.is_dir());
    if is_dir && destination != source && destination.starts_with(source) {
        return Err(FsError::invalid_target(
            destination,
            "Cannot copy or move a directory into itself",
        ));
    }
    Ok(())
}

/// Copy `source` to `destination`.
///
/// Failure of the top-level entry fails the job; failures below it are
/// recorded as skipped sub-paths and the job completes partially.
pub(crate) fn run_copy(
    adapter: &dyn FileSystemAdapter,
    source: &Path,
    destination: &Path,
    overwrite: bool,
    cancel: &CancellationToken,
    reporter: &mut ProgressReporter,
) -> Result<JobOutcome, FsError> {
    check_not_nested(adapter, source, destination)?;
    let plan = Plan::walk(adapter, source, destination)?;
    reporter.begin(plan.files_total(), plan.bytes_total);

    let mut outcome = JobOutcome::with_result(destination.to_path_buf(), 0, 0);
    for error in &plan.unreadable {
        outcome.skip(error.clone());
    }

    let mut failed_dirs: Vec<PathBuf> = Vec::new();
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
        match copy_entry(adapter, entry, overwrite) {
            Ok(bytes) => {
                outcome.files_done += 1;
                outcome.bytes_done += bytes;
                reporter.file_done(bytes);
            }
            Err(e) if index == 0 => return Err(e),
            Err(e) => {
                warn!(target: "ferry::worker", path = %entry.source().display(), error = %e, "Skipping entry");
                if let PlanEntry::Dir { source, .. } = entry {
                    failed_dirs.push(source.clone());
                    skip_below(
                        &plan.entries[index + 1..],
                        source,
                        "Parent directory could not be copied",
                        &mut outcome,
                    );
                }
                outcome.skip(JobError::from_fs(entry.source(), &e));
            }
        }
    }

    reporter.flush();
    Ok(outcome)
}

/// Copy a single planned entry. Existing directories are merged into.
pub(crate) fn copy_entry(
    adapter: &dyn FileSystemAdapter,
    entry: &PlanEntry,
    overwrite: bool,
) -> Result<u64, FsError> {
    match entry {
        PlanEntry::Dir { destination, .. } => {
            match adapter.stat(destination) {
                Some(meta) if meta.is_dir() && overwrite => {}
                Some(_) if overwrite => {
                    adapter.remove(destination)?;
                    adapter.create_folder(destination)?;
                }
                _ => {
                    adapter.create_folder(destination)?;
                }
            }
            Ok(0)
        }
        PlanEntry::File {
            source,
            destination,
            ..
        } => adapter.copy_file(source, destination, overwrite),
    }
}

pub(crate) fn is_below_any(path: &Path, dirs: &[PathBuf]) -> bool {
    dirs.iter().any(|dir| path.starts_with(dir))
}

/// Record the entries of `rest` below the failed directory `dir`.
pub(crate) fn skip_below(rest: &[PlanEntry], dir: &Path, message: &str, outcome: &mut JobOutcome) {
    for entry in rest.iter().filter(|e| e.source().starts_with(dir)) {
        outcome.skip(JobError::new(
            ferry_core::ErrorKind::NotFound,
            entry.source(),
            message,
        ));
    }
}

/// Record the entries of `rest` as cancelled. Entries below a failed
/// directory were already recorded when it failed.
pub(crate) fn skip_cancelled(rest: &[PlanEntry], failed_dirs: &[PathBuf], outcome: &mut JobOutcome) {
    for entry in rest.iter().filter(|e| !is_below_any(e.source(), failed_dirs)) {
        outcome.skip(JobError::cancelled(entry.source()));
    }
}
