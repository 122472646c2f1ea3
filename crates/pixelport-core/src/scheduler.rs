//! Job scheduler and worker pool.
//!
//! `submit` creates jobs (rejecting duplicates for in-flight targets) and
//! feeds a fixed pool of tokio workers. Workers drive jobs through the
//! pipeline under a per-job wall-clock budget; per-installation commit
//! serialization lives inside the pipeline's installation locks.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info_span, warn, Instrument};

use pixelport_store::{
    ContentDigest, InstallationId, JobError, JobErrorKind, JobId, JobState, JobStore, PostId,
    PublishJob, StorageError,
};

use crate::config::{SchedulerConfig, ValidationLimits};
use crate::error::{PublishError, Result};
use crate::notify::JobNotifier;
use crate::pipeline::{PipelineDeps, PublishPipeline};
use crate::retry::RetryPolicy;

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Result of a cancellation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The request was recorded; it takes effect immediately before any
    /// side effect, or at the next retry boundary once committing.
    Accepted,
    /// The job already reached a terminal state.
    TooLate,
}

/// Fixed-size worker pool over the durable job queue.
pub struct Scheduler {
    jobs: Arc<dyn JobStore>,
    notifier: Arc<dyn JobNotifier>,
    sender: Mutex<Option<mpsc::Sender<JobId>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    /// Spawn the worker pool and return the scheduling handle.
    pub fn start(
        deps: PipelineDeps,
        limits: ValidationLimits,
        retry: RetryPolicy,
        config: SchedulerConfig,
    ) -> Arc<Self> {
        let pipeline = Arc::new(PublishPipeline::new(deps.clone(), limits, retry));
        let (tx, rx) = mpsc::channel(config.queue_depth.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let scheduler = Arc::new(Self {
            jobs: deps.jobs.clone(),
            notifier: deps.notifier.clone(),
            sender: Mutex::new(Some(tx)),
            workers: Mutex::new(Vec::new()),
        });

        let mut workers = scheduler.workers.lock().unwrap();
        for worker_id in 0..config.workers.max(1) {
            workers.push(tokio::spawn(worker_loop(
                worker_id,
                rx.clone(),
                pipeline.clone(),
                deps.jobs.clone(),
                deps.notifier.clone(),
                config.job_timeout,
            )));
        }
        drop(workers);

        scheduler
    }

    /// Create a publish job for (installation, post).
    ///
    /// Returns [`PublishError::Conflict`] while a non-terminal job exists
    /// for the same pair - callers poll or cancel the existing job instead
    /// of queueing a second one.
    pub async fn submit(
        &self,
        post: &PostId,
        installation: &InstallationId,
        archive_digest: &ContentDigest,
    ) -> Result<PublishJob> {
        let job = match self.jobs.create_job(post, installation, archive_digest).await {
            Ok(job) => job,
            Err(StorageError::DuplicateJob { installation, post }) => {
                return Err(PublishError::Conflict { installation, post });
            }
            Err(err) => return Err(err.into()),
        };

        self.notifier
            .job_state_changed(&job.id, JobState::Queued)
            .await;

        let sender = { self.sender.lock().unwrap().clone() };
        let Some(sender) = sender else {
            return Err(PublishError::Shutdown);
        };
        sender
            .send(job.id.clone())
            .await
            .map_err(|_| PublishError::Shutdown)?;

        debug!(job_id = %job.id, post = %post, "job queued");
        Ok(job)
    }

    /// Current snapshot of a job, for polling callers.
    pub async fn job(&self, id: &JobId) -> Result<PublishJob> {
        Ok(self.jobs.get_job(id).await?)
    }

    /// Request cancellation. Jobs that have not produced side effects stop
    /// immediately; committing jobs stop at their next retry boundary.
    pub async fn cancel(&self, id: &JobId) -> Result<CancelOutcome> {
        match self.jobs.request_cancel(id).await {
            Ok(_) => Ok(CancelOutcome::Accepted),
            Err(StorageError::TerminalJob { .. }) => Ok(CancelOutcome::TooLate),
            Err(err) => Err(err.into()),
        }
    }

    /// Block until the job reaches a terminal state or the timeout elapses,
    /// returning the final snapshot.
    pub async fn wait_for_terminal(&self, id: &JobId, timeout: Duration) -> Result<PublishJob> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let job = self.jobs.get_job(id).await?;
            if job.is_terminal() {
                return Ok(job);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(PublishError::Storage(StorageError::Backend(format!(
                    "job `{id}` not terminal after {timeout:?}"
                ))));
            }
            tokio::time::sleep(WAIT_POLL_INTERVAL).await;
        }
    }

    /// Stop accepting work and wait for in-flight jobs to finish.
    pub async fn shutdown(&self) {
        let sender = self.sender.lock().unwrap().take();
        drop(sender);

        let handles: Vec<_> = std::mem::take(&mut *self.workers.lock().unwrap());
        for handle in handles {
            if let Err(err) = handle.await {
                error!(error = %err, "worker task panicked");
            }
        }
    }
}

async fn worker_loop(
    worker_id: usize,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<JobId>>>,
    pipeline: Arc<PublishPipeline>,
    jobs: Arc<dyn JobStore>,
    notifier: Arc<dyn JobNotifier>,
    job_timeout: Duration,
) {
    loop {
        let next = { rx.lock().await.recv().await };
        let Some(job_id) = next else {
            debug!(worker_id, "queue closed, worker stopping");
            break;
        };

        debug!(worker_id, job_id = %job_id, "worker picked job");
        let run = pipeline
            .run(&job_id)
            .instrument(info_span!("pixelport.job", job_id = %job_id));
        match tokio::time::timeout(job_timeout, run).await {
            Ok(Ok(job)) => {
                debug!(worker_id, job_id = %job_id, state = %job.state, "job finished");
            }
            Ok(Err(err)) => {
                error!(worker_id, job_id = %job_id, error = %err, "pipeline run failed");
            }
            Err(_) => {
                warn!(worker_id, job_id = %job_id, "job exceeded wall-clock budget");
                let timeout_error = JobError::new(
                    JobErrorKind::Timeout,
                    format!("job exceeded wall-clock budget of {job_timeout:?}"),
                );
                match jobs.fail_job(&job_id, timeout_error).await {
                    Ok(job) => {
                        notifier.job_state_changed(&job.id, JobState::Failed).await;
                    }
                    // Lost the race against the pipeline's own terminal write.
                    Err(StorageError::TerminalJob { .. }) => {}
                    Err(err) => {
                        error!(job_id = %job_id, error = %err, "could not record timeout");
                    }
                }
            }
        }
    }
}
