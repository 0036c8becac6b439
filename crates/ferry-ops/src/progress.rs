//! Progress reporting types for jobs and transactions.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use ferry_core::{ErrorKind, JobId};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::event::{WorkerEvent, WorkerEventKind};
use crate::operation::JobKind;

/// Progress information for a running job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobProgress {
    /// Number of files and directories completed.
    pub files_done: u64,
    /// Total number of files and directories to process.
    pub files_total: u64,
    /// Bytes processed so far.
    pub bytes_done: u64,
    /// Total bytes to process (0 if unknown).
    pub bytes_total: u64,
    /// The entry currently being processed.
    pub current: Option<PathBuf>,
}

impl JobProgress {
    /// Get the progress as a percentage (0.0 to 100.0).
    pub fn percentage(&self) -> f64 {
        if self.bytes_total > 0 {
            (self.bytes_done as f64 / self.bytes_total as f64) * 100.0
        } else if self.files_total > 0 {
            (self.files_done as f64 / self.files_total as f64) * 100.0
        } else {
            0.0
        }
    }
}

/// How a job ended, as reported to front-ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ResultDescriptor {
    Success,
    Partial { skipped: usize },
    Failed { error: ErrorKind },
    Cancelled,
}

/// Throttled progress sink used by workers.
///
/// Updates are sent at most once per interval; [`ProgressReporter::flush`]
/// always sends.
#[derive(Debug)]
pub(crate) struct ProgressReporter {
    job_id: JobId,
    tx: Option<mpsc::UnboundedSender<WorkerEvent>>,
    interval: Duration,
    last_sent: Option<Instant>,
    progress: JobProgress,
}

impl ProgressReporter {
    pub(crate) fn new(
        job_id: JobId,
        tx: mpsc::UnboundedSender<WorkerEvent>,
        interval: Duration,
    ) -> Self {
        Self {
            job_id,
            tx: Some(tx),
            interval,
            last_sent: None,
            progress: JobProgress::default(),
        }
    }

    /// A reporter that discards every update.
    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        Self {
            job_id: JobId::new(),
            tx: None,
            interval: Duration::ZERO,
            last_sent: None,
            progress: JobProgress::default(),
        }
    }

    /// Set the totals once they are known.
    pub(crate) fn begin(&mut self, files_total: u64, bytes_total: u64) {
        self.progress.files_total = files_total;
        self.progress.bytes_total = bytes_total;
        self.send(true);
    }

    pub(crate) fn set_current(&mut self, path: &Path) {
        self.progress.current = Some(path.to_path_buf());
    }

    /// Record one finished entry.
    pub(crate) fn file_done(&mut self, bytes: u64) {
        self.progress.files_done += 1;
        self.progress.bytes_done += bytes;
        self.send(false);
    }

    pub(crate) fn flush(&mut self) {
        self.send(true);
    }

    fn send(&mut self, force: bool) {
        let Some(tx) = &self.tx else {
            return;
        };
        let due = self
            .last_sent
            .is_none_or(|last| last.elapsed() >= self.interval);
        if force || due {
            self.last_sent = Some(Instant::now());
            // The coordinator may have been dropped; nothing left to inform.
            let _ = tx.send(WorkerEvent {
                job_id: self.job_id,
                kind: WorkerEventKind::Progress(self.progress.clone()),
            });
        }
    }
}

/// Human-readable summary such as "Moved 3 items, 1 failed".
pub fn summarize(kind: Option<JobKind>, succeeded: usize, failed: usize, cancelled: usize) -> String {
    let action = match kind {
        Some(JobKind::EmptyTrash) => return "Emptied trash".to_string(),
        Some(kind) => kind.past_tense(),
        None => "Completed",
    };
    let noun = if succeeded == 1 { "item" } else { "items" };

    let mut summary = format!("{action} {succeeded} {noun}");
    if failed > 0 {
        summary.push_str(&format!(", {failed} failed"));
    }
    if cancelled > 0 {
        summary.push_str(&format!(", {cancelled} skipped"));
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentage() {
        let progress = JobProgress {
            files_done: 1,
            files_total: 4,
            ..Default::default()
        };
        assert_eq!(progress.percentage(), 25.0);

        let progress = JobProgress {
            bytes_done: 50,
            bytes_total: 200,
            files_total: 4,
            ..Default::default()
        };
        assert_eq!(progress.percentage(), 25.0);
        assert_eq!(JobProgress::default().percentage(), 0.0);
    }

    #[test]
    fn test_summary() {
        assert_eq!(summarize(Some(JobKind::Move), 3, 1, 0), "Moved 3 items, 1 failed");
        assert_eq!(summarize(Some(JobKind::Rename), 1, 0, 0), "Renamed 1 item");
        assert_eq!(summarize(None, 2, 0, 1), "Completed 2 items, 1 skipped");
    }

    #[test]
    fn test_reporter_throttles() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut reporter = ProgressReporter::new(JobId::new(), tx, Duration::from_secs(60));

        reporter.begin(3, 30);
        reporter.file_done(10);
        reporter.file_done(10);
        reporter.flush();

        let mut updates = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let WorkerEventKind::Progress(p) = event.kind {
                updates.push(p);
            }
        }
        // begin and flush only; the per-file updates fall inside the interval.
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[1].files_done, 2);
        assert_eq!(updates[1].bytes_done, 20);
        assert_eq!(reporter.progress.files_total, 3);
    }
}
