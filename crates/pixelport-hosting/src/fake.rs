//! In-memory fake of the hosting provider (testing and dry runs)
//!
//! Holds per-repository state behind a mutex and lets tests script
//! failures per operation. Mirrors the provider guarantees the pipeline
//! relies on: digest-keyed idempotent commits and idempotent
//! visibility/pages toggles.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::debug;

use pixelport_store::{CommitRecord, ContentDigest, DelegatedCredential, RepoCoords};

use crate::client::{CommitFile, HostingClient, HostingResult};
use crate::error::HostingError;

#[derive(Debug, Default)]
struct RepoState {
    digest: Option<ContentDigest>,
    files: Vec<CommitFile>,
    revision: String,
    public: bool,
    pages: bool,
}

#[derive(Debug, Default)]
struct FakeState {
    repos: HashMap<String, RepoState>,
    commit_failures: VecDeque<HostingError>,
    visibility_failures: VecDeque<HostingError>,
    pages_failures: VecDeque<HostingError>,
    /// Overrides what `published_digest` reports (tamper simulation).
    published_overrides: HashMap<String, Option<ContentDigest>>,
    commit_calls: u64,
    effective_commits: u64,
    visibility_calls: u64,
    pages_calls: u64,
    revision_counter: u64,
}

/// Scriptable in-memory [`HostingClient`].
#[derive(Debug, Default)]
pub struct FakeHostingClient {
    state: Mutex<FakeState>,
}

impl FakeHostingClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an error returned by the next `commit_files` call.
    pub fn push_commit_failure(&self, error: HostingError) {
        self.state.lock().unwrap().commit_failures.push_back(error);
    }

    /// Queue an error returned by the next `set_visibility` call.
    pub fn push_visibility_failure(&self, error: HostingError) {
        self.state
            .lock()
            .unwrap()
            .visibility_failures
            .push_back(error);
    }

    /// Queue an error returned by the next `enable_pages` call.
    pub fn push_pages_failure(&self, error: HostingError) {
        self.state.lock().unwrap().pages_failures.push_back(error);
    }

    /// Override what `published_digest` reports for a repository,
    /// simulating tampering or a corrupted commit.
    pub fn set_published_digest(&self, repo: &RepoCoords, digest: Option<ContentDigest>) {
        self.state
            .lock()
            .unwrap()
            .published_overrides
            .insert(repo.to_string(), digest);
    }

    /// Total `commit_files` invocations, failures included.
    pub fn commit_calls(&self) -> u64 {
        self.state.lock().unwrap().commit_calls
    }

    /// Commits that actually changed repository content (no-ops excluded).
    pub fn effective_commits(&self) -> u64 {
        self.state.lock().unwrap().effective_commits
    }

    /// Total calls across all operations.
    pub fn total_calls(&self) -> u64 {
        let state = self.state.lock().unwrap();
        state.commit_calls + state.visibility_calls + state.pages_calls
    }

    /// Current visibility of a repository.
    pub fn is_public(&self, repo: &RepoCoords) -> bool {
        self.state
            .lock()
            .unwrap()
            .repos
            .get(&repo.to_string())
            .map(|r| r.public)
            .unwrap_or(false)
    }

    /// Whether pages hosting is enabled for a repository.
    pub fn pages_enabled(&self, repo: &RepoCoords) -> bool {
        self.state
            .lock()
            .unwrap()
            .repos
            .get(&repo.to_string())
            .map(|r| r.pages)
            .unwrap_or(false)
    }

    /// Files currently committed to a repository.
    pub fn committed_files(&self, repo: &RepoCoords) -> Vec<CommitFile> {
        self.state
            .lock()
            .unwrap()
            .repos
            .get(&repo.to_string())
            .map(|r| r.files.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl HostingClient for FakeHostingClient {
    async fn commit_files(
        &self,
        repo: &RepoCoords,
        _credential: &DelegatedCredential,
        files: &[CommitFile],
        content_digest: &ContentDigest,
    ) -> HostingResult<CommitRecord> {
        let mut state = self.state.lock().unwrap();
        state.commit_calls += 1;

        if let Some(error) = state.commit_failures.pop_front() {
            return Err(error);
        }

        let key = repo.to_string();

        // Identical content is a no-op at the provider level.
        if let Some(entry) = state.repos.get(&key) {
            if entry.digest.as_ref() == Some(content_digest) {
                debug!(repo = %repo, "fake provider: content unchanged");
                return Ok(CommitRecord {
                    revision: entry.revision.clone(),
                    file_count: files.len() as u64,
                    visibility_public: entry.public,
                    pages_enabled: entry.pages,
                });
            }
        }

        state.revision_counter += 1;
        state.effective_commits += 1;
        let revision = format!("rev-{}", state.revision_counter);

        let entry = state.repos.entry(key).or_default();
        entry.digest = Some(content_digest.clone());
        entry.files = files.to_vec();
        entry.revision = revision.clone();

        Ok(CommitRecord {
            revision,
            file_count: files.len() as u64,
            visibility_public: entry.public,
            pages_enabled: entry.pages,
        })
    }

    async fn set_visibility(
        &self,
        repo: &RepoCoords,
        _credential: &DelegatedCredential,
        public: bool,
    ) -> HostingResult<()> {
        let mut state = self.state.lock().unwrap();
        state.visibility_calls += 1;

        if let Some(error) = state.visibility_failures.pop_front() {
            return Err(error);
        }

        state.repos.entry(repo.to_string()).or_default().public = public;
        Ok(())
    }

    async fn enable_pages(
        &self,
        repo: &RepoCoords,
        _credential: &DelegatedCredential,
    ) -> HostingResult<()> {
        let mut state = self.state.lock().unwrap();
        state.pages_calls += 1;

        if let Some(error) = state.pages_failures.pop_front() {
            return Err(error);
        }

        state.repos.entry(repo.to_string()).or_default().pages = true;
        Ok(())
    }

    async fn published_digest(
        &self,
        repo: &RepoCoords,
        _credential: &DelegatedCredential,
    ) -> HostingResult<Option<ContentDigest>> {
        let state = self.state.lock().unwrap();
        let key = repo.to_string();
        if let Some(overridden) = state.published_overrides.get(&key) {
            return Ok(overridden.clone());
        }
        Ok(state.repos.get(&key).and_then(|r| r.digest.clone()))
    }
}
