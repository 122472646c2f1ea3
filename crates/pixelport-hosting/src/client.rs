//! The `HostingClient` trait - authenticated writes against the provider.
//!
//! All operations are scoped to credential material resolved fresh for the
//! current publish attempt; implementations never cache tokens themselves.

use async_trait::async_trait;

use pixelport_store::{CommitRecord, ContentDigest, DelegatedCredential, RepoCoords};

use crate::error::HostingError;

/// Path of the marker file committed alongside every file set. Holds the
/// canonical content digest, making identical re-commits detectable and
/// giving the consistency monitor a read-back source.
pub const DIGEST_MARKER_PATH: &str = ".relay/digest";

/// One file to be written into the target repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitFile {
    /// Repository-relative path (validated upstream).
    pub path: String,
    pub content: Vec<u8>,
}

impl CommitFile {
    pub fn new(path: impl Into<String>, content: Vec<u8>) -> Self {
        Self {
            path: path.into(),
            content,
        }
    }
}

/// Result type for hosting operations
pub type HostingResult<T> = std::result::Result<T, HostingError>;

/// Authenticated write operations against the Git-hosting provider.
///
/// Guarantees:
/// - `commit_files` is keyed by the content digest: re-committing an
///   identical file set is a provider-level no-op returning the existing
///   revision.
/// - `set_visibility` and `enable_pages` are idempotent; reaching the
///   already-desired state is success.
/// - Rate limits surface as [`HostingError::RateLimited`] carrying any
///   provider-suggested delay verbatim.
#[async_trait]
pub trait HostingClient: Send + Sync {
    /// Write the validated file set (plus the digest marker) to the
    /// repository, returning the resulting revision.
    async fn commit_files(
        &self,
        repo: &RepoCoords,
        credential: &DelegatedCredential,
        files: &[CommitFile],
        content_digest: &ContentDigest,
    ) -> HostingResult<CommitRecord>;

    /// Flip repository visibility. No-op success when already there.
    async fn set_visibility(
        &self,
        repo: &RepoCoords,
        credential: &DelegatedCredential,
        public: bool,
    ) -> HostingResult<()>;

    /// Enable static-page hosting. No-op success when already enabled.
    async fn enable_pages(
        &self,
        repo: &RepoCoords,
        credential: &DelegatedCredential,
    ) -> HostingResult<()>;

    /// Read back the digest marker from the repository, if present.
    async fn published_digest(
        &self,
        repo: &RepoCoords,
        credential: &DelegatedCredential,
    ) -> HostingResult<Option<ContentDigest>>;
}
