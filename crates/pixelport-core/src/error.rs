//! Error taxonomy for the publishing pipeline.

use pixelport_hosting::HostingError;
use pixelport_store::StorageError;

/// Errors surfaced by the pipeline's public API.
///
/// Job-level failures (validation rejections, commit exhaustion, timeouts)
/// are not errors here: they terminate the job as `Failed` and are read
/// from the job record. This enum covers what the caller themselves did
/// wrong or what the infrastructure refused to do.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    /// A non-terminal job already exists for this (installation, post) pair.
    #[error("a publish job is already in flight for installation {installation}, post {post}")]
    Conflict { installation: String, post: String },

    /// The scheduler is no longer accepting work.
    #[error("scheduler has shut down")]
    Shutdown,

    /// The persistence layer failed.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// The hosting provider failed outside a retried job stage
    /// (consistency read-back).
    #[error("hosting error: {0}")]
    Hosting(#[from] HostingError),
}

/// Result type for pipeline operations.
pub type Result<T> = std::result::Result<T, PublishError>;
