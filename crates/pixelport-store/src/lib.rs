//! Pixelport-Store: persistence layer for the publishing pipeline
//!
//! This crate owns the durable state the pipeline operates on: publish
//! jobs and their transition logs, installation bindings, the append-only
//! audit log, and the content-addressed archive store.
//!
//! ## Key Components
//!
//! - Storage traits (`JobStore`, `InstallationRegistry`, `AuditLog`,
//!   `ArchiveStore`, `PostStore`) - backend-agnostic contracts
//! - SurrealDB implementations for jobs, installations, and audit entries
//! - In-memory fakes for every trait (testing and dry runs)

mod error;
pub mod fakes;
mod migrations;
pub mod records;
mod schema;
pub mod surreal;

pub use error::StorageError;
pub use records::{
    ArchiveStore, AuditEntry, AuditLog, CommitRecord, ContentDigest, DelegatedCredential,
    Installation, InstallationId, InstallationRegistry, JobError, JobErrorKind, JobEvent, JobId,
    JobState, JobStore, PostId, PostRecord, PostStore, PublishJob, RepoCoords, StorageResult,
    UserId, AUDIT_ACTION_AUTO_HIDE,
};
pub use surreal::{
    connect_from_env, connect_local, connect_memory, SurrealAuditLog, SurrealInstallationRegistry,
    SurrealJobStore,
};

/// Result type for pixelport-store operations
pub type Result<T> = std::result::Result<T, StorageError>;
