//! Publish pipeline: drives one job through its state machine.
//!
//! `Queued -> Validating -> Committing -> Publishing -> Committed`, with
//! `Failed` from any non-terminal state. Every attempt re-derives its work
//! from the immutable job input (archive digest, expected content digest),
//! so retried stages are safe to repeat: commits are keyed by content
//! digest and visibility/pages calls are idempotent at the provider.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use pixelport_hosting::{CommitFile, HostingClient};
use pixelport_store::{
    ArchiveStore, AuditLog, CommitRecord, ContentDigest, DelegatedCredential, Installation,
    InstallationId, InstallationRegistry, JobError, JobErrorKind, JobId, JobState, JobStore,
    PostStore, PublishJob, RepoCoords, StorageError,
};

use crate::config::ValidationLimits;
use crate::error::{PublishError, Result};
use crate::monitor::ConsistencyMonitor;
use crate::notify::JobNotifier;
use crate::obs;
use crate::retry::RetryPolicy;
use crate::validator;

/// Everything the pipeline talks to, behind trait objects.
#[derive(Clone)]
pub struct PipelineDeps {
    pub jobs: Arc<dyn JobStore>,
    pub installations: Arc<dyn InstallationRegistry>,
    pub archives: Arc<dyn ArchiveStore>,
    pub posts: Arc<dyn PostStore>,
    pub audit: Arc<dyn AuditLog>,
    pub hosting: Arc<dyn HostingClient>,
    pub notifier: Arc<dyn JobNotifier>,
}

/// Per-installation commit locks.
///
/// The provider's per-repository write consistency cannot tolerate two
/// concurrent commit flows against the same installation; workers take
/// this lock for the COMMITTING and PUBLISHING stages.
#[derive(Default)]
pub struct InstallationLocks {
    locks: std::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl InstallationLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn for_installation(&self, id: &InstallationId) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .unwrap()
            .entry(id.0.clone())
            .or_default()
            .clone()
    }
}

/// Outcome of a retried provider stage.
enum StageOutcome {
    Done(Option<CommitRecord>),
    Failed(JobError),
}

/// A provider-facing stage the retry loop can drive.
enum ProviderStage<'a> {
    Commit {
        files: &'a [CommitFile],
        digest: &'a ContentDigest,
    },
    Publish,
}

impl ProviderStage<'_> {
    fn name(&self) -> &'static str {
        match self {
            ProviderStage::Commit { .. } => "committing",
            ProviderStage::Publish => "publishing",
        }
    }
}

/// Drives publish jobs to a terminal state.
pub struct PublishPipeline {
    deps: PipelineDeps,
    limits: ValidationLimits,
    retry: RetryPolicy,
    locks: Arc<InstallationLocks>,
    monitor: ConsistencyMonitor,
}

impl PublishPipeline {
    pub fn new(deps: PipelineDeps, limits: ValidationLimits, retry: RetryPolicy) -> Self {
        let monitor = ConsistencyMonitor::new(deps.clone());
        Self {
            deps,
            limits,
            retry,
            locks: Arc::new(InstallationLocks::new()),
            monitor,
        }
    }

    /// Drive one job from `Queued` to a terminal state and return the final
    /// snapshot. Picking up a job that is no longer `Queued` is a no-op.
    pub async fn run(&self, job_id: &JobId) -> Result<PublishJob> {
        let job = self.deps.jobs.get_job(job_id).await?;
        if job.state != JobState::Queued {
            debug!(state = %job.state, "job already picked up, skipping");
            return Ok(job);
        }
        if job.cancel_requested {
            return self
                .fail(job_id, JobError::new(JobErrorKind::Canceled, "canceled while queued"))
                .await;
        }

        // -- VALIDATING ------------------------------------------------------
        self.advance(job_id, JobState::Validating).await?;

        let archive = match self.deps.archives.get(&job.archive_digest).await {
            Ok(bytes) => bytes,
            Err(StorageError::ArchiveNotFound { digest }) => {
                return self
                    .fail(
                        job_id,
                        JobError::new(
                            JobErrorKind::ValidationFailed,
                            format!("uploaded archive {digest} is gone"),
                        ),
                    )
                    .await;
            }
            Err(err) => return Err(err.into()),
        };

        let validation = validator::validate(&archive, &self.limits);
        if let Some(violation) = &validation.violation {
            obs::emit_validation_rejected(&job_id.0, &violation.reason);
            return self
                .fail(
                    job_id,
                    JobError::new(JobErrorKind::ValidationFailed, violation.reason.clone()),
                )
                .await;
        }
        let digest = validation
            .digest
            .clone()
            .expect("accepted validation always carries a digest");
        self.deps.jobs.set_content_digest(job_id, &digest).await?;

        // No side effect has happened yet; honor cancellation immediately.
        if self.deps.jobs.get_job(job_id).await?.cancel_requested {
            return self
                .fail(
                    job_id,
                    JobError::new(JobErrorKind::Canceled, "canceled during validation"),
                )
                .await;
        }

        // Credentials are resolved per attempt inside the retry loops;
        // only the repository coordinates are needed up front.
        let installation = match self.deps.installations.resolve(&job.installation).await {
            Ok(installation) => installation,
            Err(StorageError::BindingNotFound { installation }) => {
                return self
                    .fail(
                        job_id,
                        JobError::new(
                            JobErrorKind::BindingNotFound,
                            format!("installation {installation} is unknown or revoked"),
                        ),
                    )
                    .await;
            }
            Err(err) => return Err(err.into()),
        };

        // One in-flight commit per installation.
        let lock = self.locks.for_installation(&job.installation);
        let _guard = lock.lock().await;

        // -- COMMITTING ------------------------------------------------------
        self.advance(job_id, JobState::Committing).await?;

        let files: Vec<CommitFile> = validation
            .files
            .iter()
            .map(|f| CommitFile::new(f.path.clone(), f.content.clone()))
            .collect();

        let stage = ProviderStage::Commit {
            files: &files,
            digest: &digest,
        };
        let mut commit = match self.run_provider_stage(job_id, &installation, stage).await? {
            StageOutcome::Done(record) => record.expect("commit stage returns a record"),
            StageOutcome::Failed(error) => return self.fail(job_id, error).await,
        };

        // -- PUBLISHING ------------------------------------------------------
        self.advance(job_id, JobState::Publishing).await?;

        match self
            .run_provider_stage(job_id, &installation, ProviderStage::Publish)
            .await?
        {
            StageOutcome::Done(_) => {}
            StageOutcome::Failed(error) => return self.fail(job_id, error).await,
        }

        // -- COMMITTED -------------------------------------------------------
        commit.visibility_public = true;
        commit.pages_enabled = true;
        self.deps.jobs.set_commit_record(job_id, commit).await?;
        let job = self.advance(job_id, JobState::Committed).await?;
        self.deps.posts.mark_published(&job.post, &digest).await?;

        // Reconciliation runs as the pipeline's final step; a failed
        // read-back is logged, not a publish failure.
        if let Err(err) = self.monitor.verify_job(&job).await {
            warn!(job_id = %job_id, error = %err, "consistency check could not run");
        }

        self.deps.jobs.get_job(job_id).await.map_err(Into::into)
    }

    /// Retry loop around one provider stage. Transient errors back off and
    /// retry up to the policy ceiling, honoring provider-suggested delays;
    /// non-retryable errors flag the installation and end the job.
    async fn run_provider_stage(
        &self,
        job_id: &JobId,
        installation: &Installation,
        stage: ProviderStage<'_>,
    ) -> Result<StageOutcome> {
        let mut stage_attempts = 0u32;

        loop {
            stage_attempts += 1;
            self.deps.jobs.record_attempt(job_id).await?;

            let credential = match self
                .deps
                .installations
                .credential_for(&installation.id)
                .await
            {
                Ok(credential) => credential,
                Err(StorageError::CredentialExpired { installation }) => {
                    return Ok(StageOutcome::Failed(JobError::new(
                        JobErrorKind::CredentialExpired,
                        format!("credential for installation {installation} has expired"),
                    )));
                }
                Err(StorageError::BindingNotFound { installation }) => {
                    return Ok(StageOutcome::Failed(JobError::new(
                        JobErrorKind::BindingNotFound,
                        format!("installation {installation} vanished mid-publish"),
                    )));
                }
                Err(err) => return Err(err.into()),
            };

            match self
                .call_provider(&stage, &installation.repo, &credential)
                .await
            {
                Ok(record) => return Ok(StageOutcome::Done(record)),
                Err(err) if err.is_retryable() => {
                    if !self.retry.attempts_remaining(stage_attempts) {
                        return Ok(StageOutcome::Failed(JobError::new(
                            JobErrorKind::CommitExhausted,
                            format!(
                                "{} gave up after {} attempts: {}",
                                stage.name(),
                                stage_attempts,
                                err
                            ),
                        )));
                    }

                    let delay =
                        self.retry
                            .delay_for(&job_id.0, stage_attempts, err.suggested_delay());
                    obs::emit_retry_scheduled(
                        &job_id.0,
                        stage.name(),
                        stage_attempts,
                        delay.as_millis() as u64,
                    );
                    tokio::time::sleep(delay).await;

                    // Deferred cancellation lands exactly here, between
                    // attempts, never mid-commit.
                    if self.deps.jobs.get_job(job_id).await?.cancel_requested {
                        return Ok(StageOutcome::Failed(JobError::new(
                            JobErrorKind::Canceled,
                            "canceled at retry boundary",
                        )));
                    }
                }
                Err(err) => {
                    if let Err(flag_err) = self
                        .deps
                        .installations
                        .flag_for_revalidation(&installation.id)
                        .await
                    {
                        warn!(error = %flag_err, "could not flag installation for re-validation");
                    }
                    return Ok(StageOutcome::Failed(JobError::new(
                        JobErrorKind::CommitRejected,
                        format!("{} rejected by provider: {}", stage.name(), err),
                    )));
                }
            }
        }
    }

    async fn call_provider(
        &self,
        stage: &ProviderStage<'_>,
        repo: &RepoCoords,
        credential: &DelegatedCredential,
    ) -> std::result::Result<Option<CommitRecord>, pixelport_hosting::HostingError> {
        match stage {
            ProviderStage::Commit { files, digest } => {
                let record = self
                    .deps
                    .hosting
                    .commit_files(repo, credential, files, digest)
                    .await?;
                Ok(Some(record))
            }
            ProviderStage::Publish => {
                self.deps
                    .hosting
                    .set_visibility(repo, credential, true)
                    .await?;
                self.deps.hosting.enable_pages(repo, credential).await?;
                Ok(None)
            }
        }
    }

    async fn advance(&self, job_id: &JobId, to: JobState) -> Result<PublishJob> {
        let job = self.deps.jobs.transition(job_id, to).await?;
        self.deps.notifier.job_state_changed(&job.id, to).await;
        Ok(job)
    }

    async fn fail(&self, job_id: &JobId, error: JobError) -> Result<PublishJob> {
        obs::emit_job_failed(&job_id.0, error.kind, &error.message);
        let job = self.deps.jobs.fail_job(job_id, error).await?;
        self.deps
            .notifier
            .job_state_changed(&job.id, JobState::Failed)
            .await;
        Ok(job)
    }
}
