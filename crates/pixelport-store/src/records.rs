//! Storage trait definitions for Pixelport
//!
//! These traits define the core storage abstractions:
//! - `ArchiveStore`: Content-addressed storage for uploaded bundles
//! - `JobStore`: Durable publish-job records with their state machine rules
//! - `InstallationRegistry`: Delegated-credential bindings (user, repo)
//! - `AuditLog`: Append-only consistency-check records
//! - `PostStore`: Narrow contract against the external post storage
//!
//! All traits are async and backend-agnostic. In-memory fakes are provided
//! for testing via the `fakes` module.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::StorageError;

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

// ---------------------------------------------------------------------------
// ContentDigest
// ---------------------------------------------------------------------------

/// Content digest (SHA-256 hex string).
///
/// The inner field is private to guarantee the string is always valid
/// lowercase hex produced by `from_bytes` or validated via `TryFrom<String>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentDigest(String);

impl ContentDigest {
    /// Compute the SHA-256 digest of the given bytes.
    pub fn from_bytes(data: &[u8]) -> Self {
        use sha2::Digest;
        let mut hasher = Sha256::new();
        hasher.update(data);
        ContentDigest(hex::encode(hasher.finalize()))
    }

    /// Return the full hex string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form (first 12 hex chars).
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl TryFrom<String> for ContentDigest {
    type Error = StorageError;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        if s.len() != 64 || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(StorageError::InvalidDigest { digest: s });
        }
        Ok(ContentDigest(s.to_ascii_lowercase()))
    }
}

impl std::fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

macro_rules! string_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl $name {
            /// Generate a new random identifier.
            pub fn new() -> Self {
                $name(uuid::Uuid::new_v4().to_string())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                $name(s.to_string())
            }
        }
    };
}

string_id!(
    /// Unique identifier for a publish job.
    JobId
);
string_id!(
    /// Unique identifier for an installation binding.
    InstallationId
);
string_id!(
    /// Identifier of the user owning an installation.
    UserId
);
string_id!(
    /// Identifier of the post a publish job targets.
    PostId
);

// ---------------------------------------------------------------------------
// InstallationRegistry - delegated-credential bindings
// ---------------------------------------------------------------------------

/// Coordinates of the target repository at the hosting provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RepoCoords {
    pub owner: String,
    pub name: String,
}

impl RepoCoords {
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for RepoCoords {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

impl std::str::FromStr for RepoCoords {
    type Err = StorageError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((owner, name)) if !owner.is_empty() && !name.is_empty() => {
                Ok(RepoCoords::new(owner, name))
            }
            _ => Err(StorageError::Serialization(format!(
                "repository coordinates must be owner/name, got '{s}'"
            ))),
        }
    }
}

/// Opaque, time-limited credential material delegated by the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelegatedCredential {
    /// Opaque token issued by the provider for this installation.
    pub token: String,
    /// Expiry instant; the registry refuses to hand out expired material.
    pub expires_at: DateTime<Utc>,
    /// Permission scope snapshot captured at delegation time.
    pub scopes: Vec<String>,
}

impl DelegatedCredential {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// A delegated-credential binding between a user and one target repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Installation {
    pub id: InstallationId,
    pub user: UserId,
    pub repo: RepoCoords,
    pub credential: DelegatedCredential,
    /// Set when the user revokes delegation or a rebind replaces this record.
    pub revoked: bool,
    /// Set when the pipeline hits a non-retryable provider rejection.
    pub needs_revalidation: bool,
    pub created_at: DateTime<Utc>,
}

/// Installation binding registry.
///
/// Semantics:
/// - Exactly one active installation per (user, repo) pair; `bind` upserts,
///   revoking any prior active binding for the same pair.
/// - `resolve` never returns revoked bindings.
/// - Credentials are handed out per call; callers must not cache them
///   across publish attempts.
#[async_trait]
pub trait InstallationRegistry: Send + Sync {
    /// Create or replace the active binding for (user, repo).
    async fn bind(
        &self,
        user: &UserId,
        repo: RepoCoords,
        credential: DelegatedCredential,
    ) -> StorageResult<Installation>;

    /// Look up an active installation. `BindingNotFound` if unknown or revoked.
    async fn resolve(&self, id: &InstallationId) -> StorageResult<Installation>;

    /// Current credential material for an installation.
    /// `CredentialExpired` once past its expiry.
    async fn credential_for(&self, id: &InstallationId) -> StorageResult<DelegatedCredential>;

    /// Replace credential material after the binding flow refreshes it.
    async fn refresh_credential(
        &self,
        id: &InstallationId,
        credential: DelegatedCredential,
    ) -> StorageResult<Installation>;

    /// Mark an installation as needing re-validation by the binding flow.
    async fn flag_for_revalidation(&self, id: &InstallationId) -> StorageResult<()>;

    /// Revoke an installation (user withdrew delegation).
    async fn revoke(&self, id: &InstallationId) -> StorageResult<()>;

    /// All bindings, revoked included (operator surface).
    async fn list(&self) -> StorageResult<Vec<Installation>>;
}

// ---------------------------------------------------------------------------
// JobStore - publish job records
// ---------------------------------------------------------------------------

/// Publish job state machine.
///
/// `Queued -> Validating -> Committing -> Publishing -> Committed`, with
/// `Failed` reachable from any non-terminal state. No skips, no backward
/// transitions; re-entry into the current state is a retry, not a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Validating,
    Committing,
    Publishing,
    Committed,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Committed | JobState::Failed)
    }

    /// Whether `self -> next` is a legal forward transition.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        if next == JobState::Failed {
            return !self.is_terminal();
        }
        matches!(
            (self, next),
            (JobState::Queued, JobState::Validating)
                | (JobState::Validating, JobState::Committing)
                | (JobState::Committing, JobState::Publishing)
                | (JobState::Publishing, JobState::Committed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Validating => "validating",
            JobState::Committing => "committing",
            JobState::Publishing => "publishing",
            JobState::Committed => "committed",
            JobState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal failure taxonomy surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobErrorKind {
    ValidationFailed,
    BindingNotFound,
    CredentialExpired,
    CommitExhausted,
    CommitRejected,
    Timeout,
    Canceled,
}

impl JobErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobErrorKind::ValidationFailed => "validation_failed",
            JobErrorKind::BindingNotFound => "binding_not_found",
            JobErrorKind::CredentialExpired => "credential_expired",
            JobErrorKind::CommitExhausted => "commit_exhausted",
            JobErrorKind::CommitRejected => "commit_rejected",
            JobErrorKind::Timeout => "timeout",
            JobErrorKind::Canceled => "canceled",
        }
    }
}

impl std::fmt::Display for JobErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error kind plus the human-readable reason carried by a failed job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: JobErrorKind,
    pub message: String,
}

impl JobError {
    pub fn new(kind: JobErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Provider-side result folded into the job after a successful commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRecord {
    /// Revision identifier returned by the hosting provider.
    pub revision: String,
    /// Number of files written in the commit.
    pub file_count: u64,
    /// Repository visibility after the publish step.
    pub visibility_public: bool,
    /// Whether static-page hosting is enabled.
    pub pages_enabled: bool,
}

/// One entry in a job's append-only transition log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobEvent {
    /// Monotonic sequence number within the job.
    pub seq: u64,
    pub from: JobState,
    pub to: JobState,
    pub at: DateTime<Utc>,
}

/// Durable record of one publish request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishJob {
    pub id: JobId,
    pub post: PostId,
    pub installation: InstallationId,
    /// Content-addressed reference to the uploaded archive.
    pub archive_digest: ContentDigest,
    /// Canonical digest of the validated file set; the expected hash for
    /// consistency checks once the job commits.
    pub content_digest: Option<ContentDigest>,
    pub state: JobState,
    /// Commit/publish attempts consumed so far.
    pub attempts: u32,
    pub last_error: Option<JobError>,
    /// Caller asked for cancellation; honored at the next safe boundary.
    pub cancel_requested: bool,
    pub commit: Option<CommitRecord>,
    pub created_at: DateTime<Utc>,
    pub transitioned_at: DateTime<Utc>,
}

impl PublishJob {
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

/// Durable publish-job store.
///
/// Guarantees:
/// - `create_job` is atomic with respect to the one-non-terminal-job-per-
///   (installation, post) invariant: a second create while one is in flight
///   fails with `DuplicateJob`.
/// - State changes go through `transition`/`fail_job`, which enforce the
///   state machine rules and append a `JobEvent`.
/// - Terminal jobs are immutable.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Create a job in `Queued`, enforcing the in-flight uniqueness invariant.
    async fn create_job(
        &self,
        post: &PostId,
        installation: &InstallationId,
        archive_digest: &ContentDigest,
    ) -> StorageResult<PublishJob>;

    /// Snapshot of a job by id.
    async fn get_job(&self, id: &JobId) -> StorageResult<PublishJob>;

    /// Advance a job to `to`. Fails with `InvalidTransition` for illegal
    /// moves and `TerminalJob` once terminal. Use `fail_job` for `Failed`.
    async fn transition(&self, id: &JobId, to: JobState) -> StorageResult<PublishJob>;

    /// Terminate a job as `Failed`, recording the error kind and reason.
    async fn fail_job(&self, id: &JobId, error: JobError) -> StorageResult<PublishJob>;

    /// Bump and return the attempt counter for the current stage.
    async fn record_attempt(&self, id: &JobId) -> StorageResult<u32>;

    /// Record the validated content digest (expected hash).
    async fn set_content_digest(
        &self,
        id: &JobId,
        digest: &ContentDigest,
    ) -> StorageResult<()>;

    /// Fold the provider commit result into the job.
    async fn set_commit_record(&self, id: &JobId, commit: CommitRecord) -> StorageResult<()>;

    /// Flag a non-terminal job for cancellation; returns the updated job.
    /// `TerminalJob` if the job already finished.
    async fn request_cancel(&self, id: &JobId) -> StorageResult<PublishJob>;

    /// Append-only transition log, ordered by seq.
    async fn events(&self, id: &JobId) -> StorageResult<Vec<JobEvent>>;

    /// The non-terminal job for (installation, post), if one exists.
    async fn find_active(
        &self,
        installation: &InstallationId,
        post: &PostId,
    ) -> StorageResult<Option<PublishJob>>;

    /// All jobs currently in `state`.
    async fn list_in_state(&self, state: JobState) -> StorageResult<Vec<PublishJob>>;

    /// Every job, newest first.
    async fn list_jobs(&self) -> StorageResult<Vec<PublishJob>>;
}

// ---------------------------------------------------------------------------
// ArchiveStore - content-addressed bundle storage
// ---------------------------------------------------------------------------

/// Content-addressed archive store.
///
/// Guarantees:
/// - `put(data)` always returns the SHA-256 digest of `data`.
/// - `get(digest)` returns the exact bytes previously stored.
/// - Same content always yields the same digest (deduplication).
#[async_trait]
pub trait ArchiveStore: Send + Sync {
    /// Store bytes and return their content digest.
    async fn put(&self, data: &[u8]) -> StorageResult<ContentDigest>;

    /// Retrieve bytes by digest. `ArchiveNotFound` if absent.
    async fn get(&self, digest: &ContentDigest) -> StorageResult<Vec<u8>>;

    /// Check whether a digest exists in the store.
    async fn contains(&self, digest: &ContentDigest) -> StorageResult<bool>;
}

// ---------------------------------------------------------------------------
// AuditLog - append-only consistency records
// ---------------------------------------------------------------------------

/// Audit action recorded when the consistency monitor hides a post.
pub const AUDIT_ACTION_AUTO_HIDE: &str = "post.auto_hide";

/// Append-only record of a consistency-check outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub job: JobId,
    pub post: PostId,
    /// Digest the job recorded at commit time.
    pub expected: ContentDigest,
    /// Digest observed at the provider, when readable.
    pub observed: Option<ContentDigest>,
    /// Action taken, e.g. [`AUDIT_ACTION_AUTO_HIDE`].
    pub action: String,
    pub recorded_at: DateTime<Utc>,
}

/// Append-only audit log. The core never mutates or deletes entries.
#[async_trait]
pub trait AuditLog: Send + Sync {
    async fn append(&self, entry: AuditEntry) -> StorageResult<()>;

    /// Entries touching one post, oldest first.
    async fn entries_for_post(&self, post: &PostId) -> StorageResult<Vec<AuditEntry>>;

    /// Every entry, oldest first.
    async fn list(&self) -> StorageResult<Vec<AuditEntry>>;
}

// ---------------------------------------------------------------------------
// PostStore - narrow contract against the external post storage
// ---------------------------------------------------------------------------

/// The slice of a post record the pipeline reads and writes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostRecord {
    pub id: PostId,
    pub title: String,
    pub published: bool,
    pub hidden_reason: Option<String>,
    /// Digest recorded when the post was last published.
    pub published_digest: Option<ContentDigest>,
}

/// Read/write contract against the relational post storage. The relational
/// layer itself is owned elsewhere; this core only touches these three calls.
#[async_trait]
pub trait PostStore: Send + Sync {
    async fn get_post(&self, id: &PostId) -> StorageResult<PostRecord>;

    /// Mark the post published with the committed content digest.
    async fn mark_published(&self, id: &PostId, digest: &ContentDigest) -> StorageResult<()>;

    /// Hide the post, recording why.
    async fn mark_hidden(&self, id: &PostId, reason: &str) -> StorageResult<()>;
}
