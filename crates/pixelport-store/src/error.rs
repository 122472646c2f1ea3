//! Error types for pixelport-store

use thiserror::Error;

/// Errors that can occur in the persistence layer
#[derive(Error, Debug)]
pub enum StorageError {
    /// Backend (database) failure
    #[error("storage backend error: {0}")]
    Backend(String),

    /// Archive content not found in the CAS
    #[error("archive not found for digest: {digest}")]
    ArchiveNotFound { digest: String },

    /// Digest string is not valid lowercase SHA-256 hex
    #[error("invalid content digest: {digest}")]
    InvalidDigest { digest: String },

    /// Publish job not found
    #[error("publish job not found: {job_id}")]
    JobNotFound { job_id: String },

    /// A non-terminal job already exists for the same (installation, post) pair
    #[error("a publish job is already in flight for installation {installation} and post {post}")]
    DuplicateJob { installation: String, post: String },

    /// Requested state transition is not legal
    #[error("illegal job transition for {job_id}: {from} -> {to}")]
    InvalidTransition {
        job_id: String,
        from: String,
        to: String,
    },

    /// Job is terminal and immutable
    #[error("publish job {job_id} is terminal ({state}) and cannot change")]
    TerminalJob { job_id: String, state: String },

    /// Installation unknown or revoked
    #[error("installation binding not found: {installation}")]
    BindingNotFound { installation: String },

    /// Delegated credential has expired
    #[error("delegated credential expired for installation {installation}")]
    CredentialExpired { installation: String },

    /// Post record not found
    #[error("post not found: {post}")]
    PostNotFound { post: String },

    /// Serialization failure at the storage boundary
    #[error("serialization failed: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

impl From<surrealdb::Error> for StorageError {
    fn from(err: surrealdb::Error) -> Self {
        StorageError::Backend(err.to_string())
    }
}
