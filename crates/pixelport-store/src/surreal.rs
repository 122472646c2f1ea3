//! SurrealDB-backed implementations of the storage traits
//!
//! Uses the row types from [`crate::schema`] for persistence, converting
//! to/from the `records` types at the boundary.

use async_trait::async_trait;
use chrono::Utc;
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

use crate::error::StorageError;
use crate::migrations;
use crate::records::*;
use crate::schema::{AuditRow, InstallationRow, JobEventRow, JobRow};

/// Connect to an in-memory instance (testing and dry runs).
///
/// Connects to `mem://`, selects `pixelport/main`, and runs `init_schema`.
pub async fn connect_memory() -> crate::Result<Surreal<Any>> {
    let db = surrealdb::engine::any::connect("mem://").await?;
    db.use_ns("pixelport").use_db("main").await?;
    migrations::init_schema(&db).await?;
    info!("SurrealDB connected (in-memory)");
    Ok(db)
}

/// Connect to a local persistent store at the given directory.
pub async fn connect_local(path: &str) -> crate::Result<Surreal<Any>> {
    std::fs::create_dir_all(path).map_err(|e| {
        StorageError::Backend(format!("failed to create database directory {path}: {e}"))
    })?;
    let url = format!("surrealkv://{path}");
    let db = surrealdb::engine::any::connect(&url).await?;
    db.use_ns("pixelport").use_db("main").await?;
    migrations::init_schema(&db).await?;
    info!("SurrealDB connected ({})", url);
    Ok(db)
}

/// Connect using `SURREALDB_URL`, falling back to local persistence
/// under `.pixelport/db`.
pub async fn connect_from_env() -> crate::Result<Surreal<Any>> {
    if let Ok(url) = std::env::var("SURREALDB_URL") {
        let db = surrealdb::engine::any::connect(&url).await?;
        db.use_ns("pixelport").use_db("main").await?;
        migrations::init_schema(&db).await?;
        info!("SurrealDB connected ({})", url);
        return Ok(db);
    }
    connect_local(".pixelport/db").await
}

fn parse_state(raw: &str) -> crate::Result<JobState> {
    match raw {
        "queued" => Ok(JobState::Queued),
        "validating" => Ok(JobState::Validating),
        "committing" => Ok(JobState::Committing),
        "publishing" => Ok(JobState::Publishing),
        "committed" => Ok(JobState::Committed),
        "failed" => Ok(JobState::Failed),
        other => Err(StorageError::Backend(format!("unknown job state: {other}"))),
    }
}

fn parse_error_kind(raw: &str) -> crate::Result<JobErrorKind> {
    match raw {
        "validation_failed" => Ok(JobErrorKind::ValidationFailed),
        "binding_not_found" => Ok(JobErrorKind::BindingNotFound),
        "credential_expired" => Ok(JobErrorKind::CredentialExpired),
        "commit_exhausted" => Ok(JobErrorKind::CommitExhausted),
        "commit_rejected" => Ok(JobErrorKind::CommitRejected),
        "timeout" => Ok(JobErrorKind::Timeout),
        "canceled" => Ok(JobErrorKind::Canceled),
        other => Err(StorageError::Backend(format!(
            "unknown job error kind: {other}"
        ))),
    }
}

// ---------------------------------------------------------------------------
// SurrealJobStore
// ---------------------------------------------------------------------------

/// SurrealDB-backed implementation of [`JobStore`].
pub struct SurrealJobStore {
    db: Surreal<Any>,
}

impl SurrealJobStore {
    /// Wrap an already-connected database handle.
    pub fn new(db: Surreal<Any>) -> Self {
        Self { db }
    }

    /// Create an in-memory instance for testing.
    pub async fn in_memory() -> crate::Result<Self> {
        Ok(Self::new(connect_memory().await?))
    }

    // -- private helpers -----------------------------------------------------

    async fn fetch_job(&self, jid: &str) -> crate::Result<JobRow> {
        let jid_owned = jid.to_string();
        let mut res = self
            .db
            .query("SELECT * FROM publish_jobs WHERE job_id = $jid")
            .bind(("jid", jid_owned))
            .await?;

        let rows: Vec<JobRow> = res.take(0)?;
        rows.into_iter()
            .next()
            .ok_or_else(|| StorageError::JobNotFound {
                job_id: jid.to_string(),
            })
    }

    async fn store_job(&self, row: JobRow) -> crate::Result<()> {
        let jid_owned = row.job_id.clone();
        self.db
            .query("UPDATE publish_jobs CONTENT $row WHERE job_id = $jid")
            .bind(("row", row))
            .bind(("jid", jid_owned))
            .await?;
        Ok(())
    }

    async fn next_event_seq(&self, jid: &str) -> crate::Result<u64> {
        let jid_owned = jid.to_string();
        let mut res = self
            .db
            .query("SELECT * FROM publish_job_events WHERE job_id = $jid")
            .bind(("jid", jid_owned))
            .await?;
        let rows: Vec<JobEventRow> = res.take(0)?;
        Ok(rows.len() as u64 + 1)
    }

    async fn append_transition(&self, jid: &str, from: JobState, to: JobState) -> crate::Result<()> {
        let seq = self.next_event_seq(jid).await?;
        let event = JobEventRow {
            job_id: jid.to_string(),
            seq,
            from_state: from.as_str().to_string(),
            to_state: to.as_str().to_string(),
            at: Utc::now(),
        };
        let _created: Option<JobEventRow> =
            self.db.create("publish_job_events").content(event).await?;
        Ok(())
    }

    /// Convert a DB row into a `PublishJob`.
    fn row_to_record(row: JobRow) -> crate::Result<PublishJob> {
        let state = parse_state(&row.state)?;

        let last_error = match (row.error_kind, row.error_message) {
            (Some(kind), Some(message)) => Some(JobError {
                kind: parse_error_kind(&kind)?,
                message,
            }),
            _ => None,
        };

        let commit = match row.commit_revision {
            Some(revision) => Some(CommitRecord {
                revision,
                file_count: row.commit_file_count.unwrap_or(0),
                visibility_public: row.commit_public.unwrap_or(false),
                pages_enabled: row.commit_pages.unwrap_or(false),
            }),
            None => None,
        };

        Ok(PublishJob {
            id: JobId(row.job_id),
            post: PostId(row.post_id),
            installation: InstallationId(row.installation_id),
            archive_digest: ContentDigest::try_from(row.archive_digest)?,
            content_digest: row.content_digest.map(ContentDigest::try_from).transpose()?,
            state,
            attempts: row.attempts,
            last_error,
            cancel_requested: row.cancel_requested,
            commit,
            created_at: row.created_at,
            transitioned_at: row.transitioned_at,
        })
    }
}

#[async_trait]
impl JobStore for SurrealJobStore {
    async fn create_job(
        &self,
        post: &PostId,
        installation: &InstallationId,
        archive_digest: &ContentDigest,
    ) -> StorageResult<PublishJob> {
        if let Some(active) = self.find_active(installation, post).await? {
            debug!(job_id = %active.id, "duplicate submit for in-flight target");
            return Err(StorageError::DuplicateJob {
                installation: installation.to_string(),
                post: post.to_string(),
            });
        }

        let now = Utc::now();
        let record = PublishJob {
            id: JobId::new(),
            post: post.clone(),
            installation: installation.clone(),
            archive_digest: archive_digest.clone(),
            content_digest: None,
            state: JobState::Queued,
            attempts: 0,
            last_error: None,
            cancel_requested: false,
            commit: None,
            created_at: now,
            transitioned_at: now,
        };

        let row = JobRow {
            job_id: record.id.0.clone(),
            post_id: record.post.0.clone(),
            installation_id: record.installation.0.clone(),
            archive_digest: record.archive_digest.as_str().to_string(),
            content_digest: None,
            state: record.state.as_str().to_string(),
            attempts: 0,
            error_kind: None,
            error_message: None,
            cancel_requested: false,
            commit_revision: None,
            commit_file_count: None,
            commit_public: None,
            commit_pages: None,
            created_at: now,
            transitioned_at: now,
        };

        debug!(job_id = %record.id, "creating publish job");
        let _created: Option<JobRow> = self.db.create("publish_jobs").content(row).await?;
        Ok(record)
    }

    async fn get_job(&self, id: &JobId) -> StorageResult<PublishJob> {
        let row = self.fetch_job(&id.0).await?;
        Self::row_to_record(row)
    }

    async fn transition(&self, id: &JobId, to: JobState) -> StorageResult<PublishJob> {
        let mut row = self.fetch_job(&id.0).await?;
        let from = parse_state(&row.state)?;

        if from.is_terminal() {
            return Err(StorageError::TerminalJob {
                job_id: id.0.clone(),
                state: from.to_string(),
            });
        }
        if to == JobState::Failed || !from.can_transition_to(to) {
            return Err(StorageError::InvalidTransition {
                job_id: id.0.clone(),
                from: from.to_string(),
                to: to.to_string(),
            });
        }

        row.state = to.as_str().to_string();
        row.transitioned_at = Utc::now();
        self.store_job(row.clone()).await?;
        self.append_transition(&id.0, from, to).await?;
        Self::row_to_record(row)
    }

    async fn fail_job(&self, id: &JobId, error: JobError) -> StorageResult<PublishJob> {
        let mut row = self.fetch_job(&id.0).await?;
        let from = parse_state(&row.state)?;

        if from.is_terminal() {
            return Err(StorageError::TerminalJob {
                job_id: id.0.clone(),
                state: from.to_string(),
            });
        }

        row.state = JobState::Failed.as_str().to_string();
        row.error_kind = Some(error.kind.as_str().to_string());
        row.error_message = Some(error.message);
        row.transitioned_at = Utc::now();
        self.store_job(row.clone()).await?;
        self.append_transition(&id.0, from, JobState::Failed).await?;
        Self::row_to_record(row)
    }

    async fn record_attempt(&self, id: &JobId) -> StorageResult<u32> {
        let mut row = self.fetch_job(&id.0).await?;
        row.attempts += 1;
        let attempts = row.attempts;
        self.store_job(row).await?;
        Ok(attempts)
    }

    async fn set_content_digest(&self, id: &JobId, digest: &ContentDigest) -> StorageResult<()> {
        let mut row = self.fetch_job(&id.0).await?;
        row.content_digest = Some(digest.as_str().to_string());
        self.store_job(row).await
    }

    async fn set_commit_record(&self, id: &JobId, commit: CommitRecord) -> StorageResult<()> {
        let mut row = self.fetch_job(&id.0).await?;
        row.commit_revision = Some(commit.revision);
        row.commit_file_count = Some(commit.file_count);
        row.commit_public = Some(commit.visibility_public);
        row.commit_pages = Some(commit.pages_enabled);
        self.store_job(row).await
    }

    async fn request_cancel(&self, id: &JobId) -> StorageResult<PublishJob> {
        let mut row = self.fetch_job(&id.0).await?;
        let state = parse_state(&row.state)?;
        if state.is_terminal() {
            return Err(StorageError::TerminalJob {
                job_id: id.0.clone(),
                state: state.to_string(),
            });
        }
        row.cancel_requested = true;
        self.store_job(row.clone()).await?;
        Self::row_to_record(row)
    }

    async fn events(&self, id: &JobId) -> StorageResult<Vec<JobEvent>> {
        // Verify the job exists so unknown ids surface as JobNotFound.
        self.fetch_job(&id.0).await?;

        let jid_owned = id.0.clone();
        let mut res = self
            .db
            .query("SELECT * FROM publish_job_events WHERE job_id = $jid")
            .bind(("jid", jid_owned))
            .await?;
        let rows: Vec<JobEventRow> = res.take(0)?;

        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            events.push(JobEvent {
                seq: row.seq,
                from: parse_state(&row.from_state)?,
                to: parse_state(&row.to_state)?,
                at: row.at,
            });
        }
        events.sort_by_key(|e| e.seq);
        Ok(events)
    }

    async fn find_active(
        &self,
        installation: &InstallationId,
        post: &PostId,
    ) -> StorageResult<Option<PublishJob>> {
        let iid_owned = installation.0.clone();
        let pid_owned = post.0.clone();
        let mut res = self
            .db
            .query(
                "SELECT * FROM publish_jobs \
                 WHERE installation_id = $iid AND post_id = $pid \
                 AND state != 'committed' AND state != 'failed'",
            )
            .bind(("iid", iid_owned))
            .bind(("pid", pid_owned))
            .await?;
        let rows: Vec<JobRow> = res.take(0)?;
        rows.into_iter().next().map(Self::row_to_record).transpose()
    }

    async fn list_in_state(&self, state: JobState) -> StorageResult<Vec<PublishJob>> {
        let state_owned = state.as_str().to_string();
        let mut res = self
            .db
            .query("SELECT * FROM publish_jobs WHERE state = $state")
            .bind(("state", state_owned))
            .await?;
        let rows: Vec<JobRow> = res.take(0)?;
        rows.into_iter().map(Self::row_to_record).collect()
    }

    async fn list_jobs(&self) -> StorageResult<Vec<PublishJob>> {
        let mut res = self
            .db
            .query("SELECT * FROM publish_jobs ORDER BY created_at DESC")
            .await?;
        let rows: Vec<JobRow> = res.take(0)?;
        rows.into_iter().map(Self::row_to_record).collect()
    }
}

// ---------------------------------------------------------------------------
// SurrealInstallationRegistry
// ---------------------------------------------------------------------------

/// SurrealDB-backed implementation of [`InstallationRegistry`].
pub struct SurrealInstallationRegistry {
    db: Surreal<Any>,
}

impl SurrealInstallationRegistry {
    pub fn new(db: Surreal<Any>) -> Self {
        Self { db }
    }

    pub async fn in_memory() -> crate::Result<Self> {
        Ok(Self::new(connect_memory().await?))
    }

    async fn fetch(&self, iid: &str) -> crate::Result<InstallationRow> {
        let iid_owned = iid.to_string();
        let mut res = self
            .db
            .query("SELECT * FROM installations WHERE installation_id = $iid")
            .bind(("iid", iid_owned))
            .await?;
        let rows: Vec<InstallationRow> = res.take(0)?;
        rows.into_iter()
            .next()
            .ok_or_else(|| StorageError::BindingNotFound {
                installation: iid.to_string(),
            })
    }

    async fn store(&self, row: InstallationRow) -> crate::Result<()> {
        let iid_owned = row.installation_id.clone();
        self.db
            .query("UPDATE installations CONTENT $row WHERE installation_id = $iid")
            .bind(("row", row))
            .bind(("iid", iid_owned))
            .await?;
        Ok(())
    }

    fn row_to_record(row: InstallationRow) -> Installation {
        Installation {
            id: InstallationId(row.installation_id),
            user: UserId(row.user_id),
            repo: RepoCoords::new(row.repo_owner, row.repo_name),
            credential: DelegatedCredential {
                token: row.token,
                expires_at: row.expires_at,
                scopes: row.scopes,
            },
            revoked: row.revoked,
            needs_revalidation: row.needs_revalidation,
            created_at: row.created_at,
        }
    }
}

#[async_trait]
impl InstallationRegistry for SurrealInstallationRegistry {
    async fn bind(
        &self,
        user: &UserId,
        repo: RepoCoords,
        credential: DelegatedCredential,
    ) -> StorageResult<Installation> {
        // Revoke any prior active binding for the same (user, repo) pair.
        let uid_owned = user.0.clone();
        let owner_owned = repo.owner.clone();
        let name_owned = repo.name.clone();
        self.db
            .query(
                "UPDATE installations SET revoked = true \
                 WHERE user_id = $uid AND repo_owner = $owner \
                 AND repo_name = $name AND revoked = false",
            )
            .bind(("uid", uid_owned))
            .bind(("owner", owner_owned))
            .bind(("name", name_owned))
            .await?;

        let installation = Installation {
            id: InstallationId::new(),
            user: user.clone(),
            repo,
            credential,
            revoked: false,
            needs_revalidation: false,
            created_at: Utc::now(),
        };
        let row = InstallationRow {
            installation_id: installation.id.0.clone(),
            user_id: installation.user.0.clone(),
            repo_owner: installation.repo.owner.clone(),
            repo_name: installation.repo.name.clone(),
            token: installation.credential.token.clone(),
            expires_at: installation.credential.expires_at,
            scopes: installation.credential.scopes.clone(),
            revoked: false,
            needs_revalidation: false,
            created_at: installation.created_at,
        };

        debug!(installation_id = %installation.id, repo = %installation.repo, "binding installation");
        let _created: Option<InstallationRow> =
            self.db.create("installations").content(row).await?;
        Ok(installation)
    }

    async fn resolve(&self, id: &InstallationId) -> StorageResult<Installation> {
        let row = self.fetch(&id.0).await?;
        if row.revoked {
            return Err(StorageError::BindingNotFound {
                installation: id.to_string(),
            });
        }
        Ok(Self::row_to_record(row))
    }

    async fn credential_for(&self, id: &InstallationId) -> StorageResult<DelegatedCredential> {
        let installation = self.resolve(id).await?;
        if installation.credential.is_expired_at(Utc::now()) {
            return Err(StorageError::CredentialExpired {
                installation: id.to_string(),
            });
        }
        Ok(installation.credential)
    }

    async fn refresh_credential(
        &self,
        id: &InstallationId,
        credential: DelegatedCredential,
    ) -> StorageResult<Installation> {
        let mut row = self.fetch(&id.0).await?;
        if row.revoked {
            return Err(StorageError::BindingNotFound {
                installation: id.to_string(),
            });
        }
        row.token = credential.token;
        row.expires_at = credential.expires_at;
        row.scopes = credential.scopes;
        row.needs_revalidation = false;
        self.store(row.clone()).await?;
        Ok(Self::row_to_record(row))
    }

    async fn flag_for_revalidation(&self, id: &InstallationId) -> StorageResult<()> {
        let mut row = self.fetch(&id.0).await?;
        row.needs_revalidation = true;
        self.store(row).await
    }

    async fn revoke(&self, id: &InstallationId) -> StorageResult<()> {
        let mut row = self.fetch(&id.0).await?;
        row.revoked = true;
        self.store(row).await
    }

    async fn list(&self) -> StorageResult<Vec<Installation>> {
        let mut res = self.db.query("SELECT * FROM installations").await?;
        let rows: Vec<InstallationRow> = res.take(0)?;
        Ok(rows.into_iter().map(Self::row_to_record).collect())
    }
}

// ---------------------------------------------------------------------------
// SurrealAuditLog
// ---------------------------------------------------------------------------

/// SurrealDB-backed implementation of [`AuditLog`].
pub struct SurrealAuditLog {
    db: Surreal<Any>,
}

impl SurrealAuditLog {
    pub fn new(db: Surreal<Any>) -> Self {
        Self { db }
    }

    pub async fn in_memory() -> crate::Result<Self> {
        Ok(Self::new(connect_memory().await?))
    }

    fn row_to_entry(row: AuditRow) -> crate::Result<AuditEntry> {
        Ok(AuditEntry {
            job: JobId(row.job_id),
            post: PostId(row.post_id),
            expected: ContentDigest::try_from(row.expected_digest)?,
            observed: row.observed_digest.map(ContentDigest::try_from).transpose()?,
            action: row.action,
            recorded_at: row.recorded_at,
        })
    }
}

#[async_trait]
impl AuditLog for SurrealAuditLog {
    async fn append(&self, entry: AuditEntry) -> StorageResult<()> {
        let row = AuditRow {
            job_id: entry.job.0,
            post_id: entry.post.0,
            expected_digest: entry.expected.as_str().to_string(),
            observed_digest: entry.observed.map(|d| d.as_str().to_string()),
            action: entry.action,
            recorded_at: entry.recorded_at,
        };
        let _created: Option<AuditRow> = self.db.create("audit_log").content(row).await?;
        Ok(())
    }

    async fn entries_for_post(&self, post: &PostId) -> StorageResult<Vec<AuditEntry>> {
        let pid_owned = post.0.clone();
        let mut res = self
            .db
            .query("SELECT * FROM audit_log WHERE post_id = $pid ORDER BY recorded_at ASC")
            .bind(("pid", pid_owned))
            .await?;
        let rows: Vec<AuditRow> = res.take(0)?;
        rows.into_iter().map(Self::row_to_entry).collect()
    }

    async fn list(&self) -> StorageResult<Vec<AuditEntry>> {
        let mut res = self
            .db
            .query("SELECT * FROM audit_log ORDER BY recorded_at ASC")
            .await?;
        let rows: Vec<AuditRow> = res.take(0)?;
        rows.into_iter().map(Self::row_to_entry).collect()
    }
}
