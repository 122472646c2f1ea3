//! Consistency monitor: post-commit reconciliation.
//!
//! Compares the digest observed at the provider against the digest a job
//! recorded when it committed. On mismatch the post is hidden and exactly
//! one audit entry is written - the only place in this core that changes a
//! user-facing post's visibility without an explicit user action.

use chrono::Utc;
use tracing::{debug, warn};

use pixelport_hosting::HostingClient;
use pixelport_store::{
    AuditEntry, AuditLog, ContentDigest, InstallationRegistry, JobId, JobState, JobStore,
    PostStore, PublishJob, StorageError, AUDIT_ACTION_AUTO_HIDE,
};

use crate::error::{PublishError, Result};
use crate::obs;
use crate::pipeline::PipelineDeps;

/// Outcome of one consistency check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyOutcome {
    /// Observed digest matches the job's expected digest.
    Match,
    /// Observed digest differs (or is unreadable); the post was hidden.
    Mismatch {
        expected: ContentDigest,
        observed: Option<ContentDigest>,
    },
}

/// Post-commit digest verification with automatic visibility revocation.
pub struct ConsistencyMonitor {
    deps: PipelineDeps,
}

impl ConsistencyMonitor {
    pub fn new(deps: PipelineDeps) -> Self {
        Self { deps }
    }

    /// Verify one committed job against the provider.
    ///
    /// On mismatch: hides the post and appends one [`AuditEntry`] carrying
    /// both digests.
    pub async fn verify_job(&self, job: &PublishJob) -> Result<VerifyOutcome> {
        if job.state != JobState::Committed {
            return Err(PublishError::Storage(StorageError::Backend(format!(
                "job {} is {}, only committed jobs can be verified",
                job.id, job.state
            ))));
        }
        let Some(expected) = job.content_digest.clone() else {
            return Err(PublishError::Storage(StorageError::Backend(format!(
                "committed job {} has no expected digest",
                job.id
            ))));
        };

        let installation = self.deps.installations.resolve(&job.installation).await?;
        let credential = self
            .deps
            .installations
            .credential_for(&installation.id)
            .await?;
        let observed = self
            .deps
            .hosting
            .published_digest(&installation.repo, &credential)
            .await?;

        if observed.as_ref() == Some(&expected) {
            debug!(job_id = %job.id, digest = %expected.short(), "published digest verified");
            return Ok(VerifyOutcome::Match);
        }

        obs::emit_digest_mismatch(
            &job.id.0,
            expected.as_str(),
            observed.as_ref().map(|d| d.as_str()),
        );

        self.deps
            .posts
            .mark_hidden(&job.post, "published content failed its integrity check")
            .await?;
        self.deps
            .audit
            .append(AuditEntry {
                job: job.id.clone(),
                post: job.post.clone(),
                expected: expected.clone(),
                observed: observed.clone(),
                action: AUDIT_ACTION_AUTO_HIDE.to_string(),
                recorded_at: Utc::now(),
            })
            .await?;

        Ok(VerifyOutcome::Mismatch { expected, observed })
    }

    /// Re-verify every committed job (reconciliation sweep). Jobs whose
    /// check cannot run are skipped with a warning.
    pub async fn sweep(&self) -> Result<Vec<(JobId, VerifyOutcome)>> {
        let committed = self.deps.jobs.list_in_state(JobState::Committed).await?;
        let mut outcomes = Vec::with_capacity(committed.len());

        for job in committed {
            match self.verify_job(&job).await {
                Ok(outcome) => outcomes.push((job.id, outcome)),
                Err(err) => {
                    warn!(job_id = %job.id, error = %err, "consistency sweep skipped job");
                }
            }
        }
        Ok(outcomes)
    }
}
