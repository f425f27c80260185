use std::future::Future;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::admission::{AdmissionController, AdmissionPermit};
use crate::error::AppError;
use crate::job::{CrawlJob, JobState};
use crate::models::Source;

/// Drives an admitted job to a terminal state.
pub trait JobExecutor: Send + Sync + Clone + 'static {
    fn execute(
        &self,
        job: CrawlJob,
        source: Source,
        permit: AdmissionPermit,
    ) -> impl Future<Output = CrawlJob> + Send;
}

/// Admission-controlled worker pool for one run.
///
/// Each submitted job waits for admission on its own task; finished jobs are
/// streamed back over the report channel.
pub struct JobQueue<E> {
    executor: E,
    admission: AdmissionController,
    tracker: TaskTracker,
    cancel: CancellationToken,
    reports: mpsc::UnboundedSender<CrawlJob>,
}

impl<E: JobExecutor> JobQueue<E> {
    pub fn new(
        executor: E,
        admission: AdmissionController,
        cancel: CancellationToken,
    ) -> (Self, mpsc::UnboundedReceiver<CrawlJob>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let queue = Self {
            executor,
            admission,
            tracker: TaskTracker::new(),
            cancel,
            reports: tx,
        };
        (queue, rx)
    }

    /// Enqueue a job for `source`. Fails fast when the pending queue is full.
    pub fn submit(&self, source: Source, mut job: CrawlJob) -> Result<Uuid, AppError> {
        let slot = self.admission.reserve(&source.source_id)?;
        let job_id = job.job_id;
        let executor = self.executor.clone();
        let admission = self.admission.clone();
        let cancel = self.cancel.clone();
        let reports = self.reports.clone();

        debug!(%job_id, source_id = %source.source_id, "Job submitted");
        self.tracker.spawn(async move {
            let admitted = tokio::select! {
                biased;
                () = cancel.cancelled() => None,
                permit = admission.admit(&source, slot) => permit.ok(),
            };
            let job = match admitted {
                Some(permit) => executor.execute(job, source, permit).await,
                None => {
                    if let Err(e) = job.transition(JobState::Interrupted) {
                        warn!(%job_id, error = %e, "Could not interrupt pending job");
                    }
                    job
                }
            };
            if reports.send(job).is_err() {
                debug!(%job_id, "Report receiver dropped");
            }
        });
        Ok(job_id)
    }

    /// Stop accepting jobs and wait for every submitted job to finish.
    pub async fn drain(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }

    pub fn len(&self) -> usize {
        self.tracker.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracker.is_empty()
    }
}
