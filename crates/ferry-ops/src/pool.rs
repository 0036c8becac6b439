//! Bounded worker pool running jobs on blocking threads.

use std::sync::Arc;
use std::time::Duration;

use ferry_core::{ErrorKind, JobId};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::adapter::FileSystemAdapter;
use crate::event::{WorkerEvent, WorkerEventKind};
use crate::executor::execute;
use crate::operation::{JobError, Operation};
use crate::progress::ProgressReporter;

/// A job ready to run.
#[derive(Debug, Clone)]
pub(crate) struct WorkItem {
    pub job_id: JobId,
    pub operation: Operation,
    pub overwrite: bool,
    pub cancel: CancellationToken,
}

/// Handle to a submitted job. Dropping it does not stop the job.
#[derive(Debug)]
pub(crate) struct JobHandle {
    pub job_id: JobId,
    cancel: CancellationToken,
}

impl JobHandle {
    pub(crate) fn cancel(&self) {
        self.cancel.cancel();
    }
}

/// Runs submitted work with at most `size` jobs executing at once.
///
/// Waiting jobs queue on a fair semaphore, so they start in submission order.
pub(crate) struct WorkerPool {
    runtime: Handle,
    permits: Arc<Semaphore>,
    adapter: Arc<dyn FileSystemAdapter>,
    events: mpsc::UnboundedSender<WorkerEvent>,
    progress_interval: Duration,
    size: usize,
}

impl WorkerPool {
    pub(crate) fn new(
        runtime: Handle,
        size: usize,
        adapter: Arc<dyn FileSystemAdapter>,
        events: mpsc::UnboundedSender<WorkerEvent>,
        progress_interval: Duration,
    ) -> Self {
        let size = size.max(1);
        Self {
            runtime,
            permits: Arc::new(Semaphore::new(size)),
            adapter,
            events,
            progress_interval,
            size,
        }
    }

    pub(crate) fn size(&self) -> usize {
        self.size
    }

    /// Enqueue `work` and return immediately.
    pub(crate) fn submit(&self, work: WorkItem) -> JobHandle {
        let permits = Arc::clone(&self.permits);
        let adapter = Arc::clone(&self.adapter);
        let events = self.events.clone();
        let interval = self.progress_interval;
        let cancel = work.cancel.clone();
        let runtime = self.runtime.clone();

        let job_id = work.job_id;
        self.runtime.spawn(async move {
            let job_id = work.job_id;
            let path = work.operation.display_path();

            let result = match permits.acquire_owned().await {
                Ok(_permit) if work.cancel.is_cancelled() => Err(JobError::cancelled(&path)),
                Ok(_permit) => {
                    let _ = events.send(WorkerEvent {
                        job_id,
                        kind: WorkerEventKind::Started,
                    });
                    debug!(target: "ferry::worker", job = %job_id, kind = %work.operation.kind(), "Job started");

                    let reporter_events = events.clone();
                    let blocking = runtime.spawn_blocking(move || {
                        let mut reporter =
                            ProgressReporter::new(work.job_id, reporter_events, interval);
                        execute(
                            adapter.as_ref(),
                            &work.operation,
                            work.overwrite,
                            &work.cancel,
                            &mut reporter,
                        )
                        .map_err(|e| JobError::from_fs(work.operation.display_path(), &e))
                    });
                    match blocking.await {
                        Ok(result) => result,
                        Err(e) => {
                            error!(target: "ferry::worker", job = %job_id, error = %e, "Worker task failed");
                            Err(JobError::new(
                                ErrorKind::Io,
                                &path,
                                format!("Worker failed: {e}"),
                            ))
                        }
                    }
                }
                Err(_closed) => Err(JobError::cancelled(&path)),
            };

            let _ = events.send(WorkerEvent {
                job_id,
                kind: WorkerEventKind::Finished(result),
            });
        });

        JobHandle { job_id, cancel }
    }
}
