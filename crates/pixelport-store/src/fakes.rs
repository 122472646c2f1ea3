//! In-memory fakes for storage traits (testing only)
//!
//! Provides `MemoryArchiveStore`, `MemoryJobStore`, `MemoryInstallationRegistry`,
//! `MemoryAuditLog`, and `MemoryPostStore` that satisfy the trait contracts
//! without any external dependencies.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use crate::error::StorageError;
use crate::records::*;

// ---------------------------------------------------------------------------
// MemoryArchiveStore
// ---------------------------------------------------------------------------

/// In-memory content-addressed store backed by a `HashMap<digest, bytes>`.
#[derive(Debug, Default)]
pub struct MemoryArchiveStore {
    store: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryArchiveStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ArchiveStore for MemoryArchiveStore {
    async fn put(&self, data: &[u8]) -> StorageResult<ContentDigest> {
        let digest = ContentDigest::from_bytes(data);
        let mut store = self.store.lock().unwrap();
        store.insert(digest.as_str().to_string(), data.to_vec());
        Ok(digest)
    }

    async fn get(&self, digest: &ContentDigest) -> StorageResult<Vec<u8>> {
        let store = self.store.lock().unwrap();
        store
            .get(digest.as_str())
            .cloned()
            .ok_or_else(|| StorageError::ArchiveNotFound {
                digest: digest.as_str().to_string(),
            })
    }

    async fn contains(&self, digest: &ContentDigest) -> StorageResult<bool> {
        let store = self.store.lock().unwrap();
        Ok(store.contains_key(digest.as_str()))
    }
}

// ---------------------------------------------------------------------------
// MemoryJobStore
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct JobSlot {
    record: PublishJob,
    events: Vec<JobEvent>,
}

/// In-memory job store backed by a `HashMap<JobId, JobSlot>`.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<String, JobSlot>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn push_event(slot: &mut JobSlot, from: JobState, to: JobState) {
        let seq = slot.events.len() as u64 + 1;
        slot.events.push(JobEvent {
            seq,
            from,
            to,
            at: Utc::now(),
        });
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create_job(
        &self,
        post: &PostId,
        installation: &InstallationId,
        archive_digest: &ContentDigest,
    ) -> StorageResult<PublishJob> {
        let mut jobs = self.jobs.lock().unwrap();

        // Uniqueness check and insert happen under one lock so two
        // concurrent submits cannot both pass.
        let in_flight = jobs.values().any(|slot| {
            !slot.record.is_terminal()
                && slot.record.installation == *installation
                && slot.record.post == *post
        });
        if in_flight {
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
        jobs.insert(
            record.id.0.clone(),
            JobSlot {
                record: record.clone(),
                events: Vec::new(),
            },
        );
        Ok(record)
    }

    async fn get_job(&self, id: &JobId) -> StorageResult<PublishJob> {
        let jobs = self.jobs.lock().unwrap();
        jobs.get(&id.0)
            .map(|slot| slot.record.clone())
            .ok_or_else(|| StorageError::JobNotFound { job_id: id.0.clone() })
    }

    async fn transition(&self, id: &JobId, to: JobState) -> StorageResult<PublishJob> {
        let mut jobs = self.jobs.lock().unwrap();
        let slot = jobs
            .get_mut(&id.0)
            .ok_or_else(|| StorageError::JobNotFound { job_id: id.0.clone() })?;

        let from = slot.record.state;
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

        slot.record.state = to;
        slot.record.transitioned_at = Utc::now();
        Self::push_event(slot, from, to);
        Ok(slot.record.clone())
    }

    async fn fail_job(&self, id: &JobId, error: JobError) -> StorageResult<PublishJob> {
        let mut jobs = self.jobs.lock().unwrap();
        let slot = jobs
            .get_mut(&id.0)
            .ok_or_else(|| StorageError::JobNotFound { job_id: id.0.clone() })?;

        let from = slot.record.state;
        if from.is_terminal() {
            return Err(StorageError::TerminalJob {
                job_id: id.0.clone(),
                state: from.to_string(),
            });
        }

        slot.record.state = JobState::Failed;
        slot.record.last_error = Some(error);
        slot.record.transitioned_at = Utc::now();
        Self::push_event(slot, from, JobState::Failed);
        Ok(slot.record.clone())
    }

    async fn record_attempt(&self, id: &JobId) -> StorageResult<u32> {
        let mut jobs = self.jobs.lock().unwrap();
        let slot = jobs
            .get_mut(&id.0)
            .ok_or_else(|| StorageError::JobNotFound { job_id: id.0.clone() })?;
        slot.record.attempts += 1;
        Ok(slot.record.attempts)
    }

    async fn set_content_digest(&self, id: &JobId, digest: &ContentDigest) -> StorageResult<()> {
        let mut jobs = self.jobs.lock().unwrap();
        let slot = jobs
            .get_mut(&id.0)
            .ok_or_else(|| StorageError::JobNotFound { job_id: id.0.clone() })?;
        slot.record.content_digest = Some(digest.clone());
        Ok(())
    }

    async fn set_commit_record(&self, id: &JobId, commit: CommitRecord) -> StorageResult<()> {
        let mut jobs = self.jobs.lock().unwrap();
        let slot = jobs
            .get_mut(&id.0)
            .ok_or_else(|| StorageError::JobNotFound { job_id: id.0.clone() })?;
        slot.record.commit = Some(commit);
        Ok(())
    }

    async fn request_cancel(&self, id: &JobId) -> StorageResult<PublishJob> {
        let mut jobs = self.jobs.lock().unwrap();
        let slot = jobs
            .get_mut(&id.0)
            .ok_or_else(|| StorageError::JobNotFound { job_id: id.0.clone() })?;

        if slot.record.is_terminal() {
            return Err(StorageError::TerminalJob {
                job_id: id.0.clone(),
                state: slot.record.state.to_string(),
            });
        }
        slot.record.cancel_requested = true;
        Ok(slot.record.clone())
    }

    async fn events(&self, id: &JobId) -> StorageResult<Vec<JobEvent>> {
        let jobs = self.jobs.lock().unwrap();
        let slot = jobs
            .get(&id.0)
            .ok_or_else(|| StorageError::JobNotFound { job_id: id.0.clone() })?;
        let mut events = slot.events.clone();
        events.sort_by_key(|e| e.seq);
        Ok(events)
    }

    async fn find_active(
        &self,
        installation: &InstallationId,
        post: &PostId,
    ) -> StorageResult<Option<PublishJob>> {
        let jobs = self.jobs.lock().unwrap();
        Ok(jobs
            .values()
            .find(|slot| {
                !slot.record.is_terminal()
                    && slot.record.installation == *installation
                    && slot.record.post == *post
            })
            .map(|slot| slot.record.clone()))
    }

    async fn list_in_state(&self, state: JobState) -> StorageResult<Vec<PublishJob>> {
        let jobs = self.jobs.lock().unwrap();
        Ok(jobs
            .values()
            .filter(|slot| slot.record.state == state)
            .map(|slot| slot.record.clone())
            .collect())
    }

    async fn list_jobs(&self) -> StorageResult<Vec<PublishJob>> {
        let jobs = self.jobs.lock().unwrap();
        let mut records: Vec<PublishJob> =
            jobs.values().map(|slot| slot.record.clone()).collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }
}

// ---------------------------------------------------------------------------
// MemoryInstallationRegistry
// ---------------------------------------------------------------------------

/// In-memory installation registry backed by a `HashMap<InstallationId, Installation>`.
#[derive(Debug, Default)]
pub struct MemoryInstallationRegistry {
    installations: Mutex<HashMap<String, Installation>>,
}

impl MemoryInstallationRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl InstallationRegistry for MemoryInstallationRegistry {
    async fn bind(
        &self,
        user: &UserId,
        repo: RepoCoords,
        credential: DelegatedCredential,
    ) -> StorageResult<Installation> {
        let mut installations = self.installations.lock().unwrap();

        // Rebinding replaces, never duplicates: revoke any prior active
        // binding for the same (user, repo) pair under the same lock.
        for existing in installations.values_mut() {
            if !existing.revoked && existing.user == *user && existing.repo == repo {
                existing.revoked = true;
            }
        }

        let installation = Installation {
            id: InstallationId::new(),
            user: user.clone(),
            repo,
            credential,
            revoked: false,
            needs_revalidation: false,
            created_at: Utc::now(),
        };
        installations.insert(installation.id.0.clone(), installation.clone());
        Ok(installation)
    }

    async fn resolve(&self, id: &InstallationId) -> StorageResult<Installation> {
        let installations = self.installations.lock().unwrap();
        installations
            .get(&id.0)
            .filter(|i| !i.revoked)
            .cloned()
            .ok_or_else(|| StorageError::BindingNotFound {
                installation: id.to_string(),
            })
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
        let mut installations = self.installations.lock().unwrap();
        let installation = installations
            .get_mut(&id.0)
            .filter(|i| !i.revoked)
            .ok_or_else(|| StorageError::BindingNotFound {
                installation: id.to_string(),
            })?;
        installation.credential = credential;
        installation.needs_revalidation = false;
        Ok(installation.clone())
    }

    async fn flag_for_revalidation(&self, id: &InstallationId) -> StorageResult<()> {
        let mut installations = self.installations.lock().unwrap();
        let installation = installations
            .get_mut(&id.0)
            .ok_or_else(|| StorageError::BindingNotFound {
                installation: id.to_string(),
            })?;
        installation.needs_revalidation = true;
        Ok(())
    }

    async fn revoke(&self, id: &InstallationId) -> StorageResult<()> {
        let mut installations = self.installations.lock().unwrap();
        let installation = installations
            .get_mut(&id.0)
            .ok_or_else(|| StorageError::BindingNotFound {
                installation: id.to_string(),
            })?;
        installation.revoked = true;
        Ok(())
    }

    async fn list(&self) -> StorageResult<Vec<Installation>> {
        let installations = self.installations.lock().unwrap();
        Ok(installations.values().cloned().collect())
    }
}

// ---------------------------------------------------------------------------
// MemoryAuditLog
// ---------------------------------------------------------------------------

/// In-memory append-only audit log.
#[derive(Debug, Default)]
pub struct MemoryAuditLog {
    entries: Mutex<Vec<AuditEntry>>,
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AuditLog for MemoryAuditLog {
    async fn append(&self, entry: AuditEntry) -> StorageResult<()> {
        let mut entries = self.entries.lock().unwrap();
        entries.push(entry);
        Ok(())
    }

    async fn entries_for_post(&self, post: &PostId) -> StorageResult<Vec<AuditEntry>> {
        let entries = self.entries.lock().unwrap();
        Ok(entries
            .iter()
            .filter(|e| e.post == *post)
            .cloned()
            .collect())
    }

    async fn list(&self) -> StorageResult<Vec<AuditEntry>> {
        let entries = self.entries.lock().unwrap();
        Ok(entries.clone())
    }
}

// ---------------------------------------------------------------------------
// MemoryPostStore
// ---------------------------------------------------------------------------

/// In-memory stand-in for the external post storage.
#[derive(Debug, Default)]
pub struct MemoryPostStore {
    posts: Mutex<HashMap<String, PostRecord>>,
}

impl MemoryPostStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a post the way the (external) authoring flow would.
    pub fn insert_post(&self, id: &PostId, title: impl Into<String>) {
        let mut posts = self.posts.lock().unwrap();
        posts.insert(
            id.0.clone(),
            PostRecord {
                id: id.clone(),
                title: title.into(),
                published: false,
                hidden_reason: None,
                published_digest: None,
            },
        );
    }
}

#[async_trait]
impl PostStore for MemoryPostStore {
    async fn get_post(&self, id: &PostId) -> StorageResult<PostRecord> {
        let posts = self.posts.lock().unwrap();
        posts
            .get(&id.0)
            .cloned()
            .ok_or_else(|| StorageError::PostNotFound { post: id.to_string() })
    }

    async fn mark_published(&self, id: &PostId, digest: &ContentDigest) -> StorageResult<()> {
        let mut posts = self.posts.lock().unwrap();
        let post = posts
            .get_mut(&id.0)
            .ok_or_else(|| StorageError::PostNotFound { post: id.to_string() })?;
        post.published = true;
        post.hidden_reason = None;
        post.published_digest = Some(digest.clone());
        Ok(())
    }

    async fn mark_hidden(&self, id: &PostId, reason: &str) -> StorageResult<()> {
        let mut posts = self.posts.lock().unwrap();
        let post = posts
            .get_mut(&id.0)
            .ok_or_else(|| StorageError::PostNotFound { post: id.to_string() })?;
        post.published = false;
        post.hidden_reason = Some(reason.to_string());
        Ok(())
    }
}
