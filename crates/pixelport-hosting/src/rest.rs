//! REST client for the hosting provider's HTTP API.
//!
//! Writes go through the contents endpoint (one request per file, base64
//! payloads), visibility through the repository PATCH endpoint, and pages
//! through the pages endpoint. Rate-limit responses are mapped to
//! [`HostingError::RateLimited`] with any `Retry-After` value attached.

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use reqwest::{Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use pixelport_store::{CommitRecord, ContentDigest, DelegatedCredential, RepoCoords};

use crate::client::{CommitFile, HostingClient, HostingResult, DIGEST_MARKER_PATH};
use crate::error::HostingError;

/// Hosting provider configuration
#[derive(Debug, Clone)]
pub struct HostingConfig {
    /// Provider API base URL
    pub api_base: String,
    /// Branch the file set is committed to
    pub commit_branch: String,
    /// Per-request timeout
    pub request_timeout: Duration,
}

impl Default for HostingConfig {
    fn default() -> Self {
        HostingConfig {
            api_base: std::env::var("HOSTING_API_BASE")
                .unwrap_or_else(|_| "https://api.github.com".to_string()),
            commit_branch: std::env::var("HOSTING_BRANCH").unwrap_or_else(|_| "main".to_string()),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl HostingConfig {
    /// Create a config from environment variables
    pub fn from_env() -> Self {
        Self::default()
    }

    /// Create config for a specific API base
    pub fn new(api_base: &str) -> Self {
        HostingConfig {
            api_base: api_base.trim_end_matches('/').to_string(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Deserialize)]
struct ContentsResponse {
    sha: String,
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CommitInfo {
    sha: String,
}

#[derive(Debug, Deserialize)]
struct PutContentsResponse {
    commit: CommitInfo,
}

/// REST implementation of [`HostingClient`].
pub struct RestHostingClient {
    config: HostingConfig,
    http_client: reqwest::Client,
}

impl RestHostingClient {
    /// Create a new client
    pub fn new(config: HostingConfig) -> HostingResult<Self> {
        let http_client = reqwest::Client::builder()
            .user_agent(concat!("pixelport/", env!("CARGO_PKG_VERSION")))
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| HostingError::Transport(e.to_string()))?;

        Ok(RestHostingClient {
            config,
            http_client,
        })
    }

    /// Create client from environment variables
    pub fn from_env() -> HostingResult<Self> {
        Self::new(HostingConfig::from_env())
    }

    fn repo_url(&self, repo: &RepoCoords) -> String {
        format!("{}/repos/{}/{}", self.config.api_base, repo.owner, repo.name)
    }

    fn contents_url(&self, repo: &RepoCoords, path: &str) -> String {
        format!("{}/contents/{}", self.repo_url(repo), path)
    }

    /// Map a non-success response to the error taxonomy.
    fn classify_failure(response: Response) -> HostingError {
        let status = response.status();
        let retry_after = parse_retry_after(&response);
        let rate_limit_exhausted = response
            .headers()
            .get("x-ratelimit-remaining")
            .and_then(|v| v.to_str().ok())
            .map(|v| v == "0")
            .unwrap_or(false);

        match status {
            StatusCode::TOO_MANY_REQUESTS => HostingError::RateLimited { retry_after },
            StatusCode::FORBIDDEN if rate_limit_exhausted => {
                HostingError::RateLimited { retry_after }
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => HostingError::PermissionDenied,
            StatusCode::NOT_FOUND => HostingError::RepoNotFound,
            s if s.is_server_error() => HostingError::Unavailable {
                status: s.as_u16(),
            },
            s => HostingError::Protocol(format!("unexpected status {s}")),
        }
    }

    /// Fetch a file's metadata. `None` when the path does not exist yet.
    async fn get_file(
        &self,
        repo: &RepoCoords,
        credential: &DelegatedCredential,
        path: &str,
    ) -> HostingResult<Option<ContentsResponse>> {
        let response = self
            .http_client
            .get(self.contents_url(repo, path))
            .bearer_auth(&credential.token)
            .header("accept", "application/vnd.github+json")
            .query(&[("ref", self.config.commit_branch.as_str())])
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(Self::classify_failure(response));
        }
        let body: ContentsResponse = response
            .json()
            .await
            .map_err(|e| HostingError::Protocol(e.to_string()))?;
        Ok(Some(body))
    }

    /// Create or update a single file, returning the commit revision.
    async fn put_file(
        &self,
        repo: &RepoCoords,
        credential: &DelegatedCredential,
        path: &str,
        content: &[u8],
        prior_sha: Option<&str>,
        message: &str,
    ) -> HostingResult<String> {
        let mut body = json!({
            "message": message,
            "content": BASE64.encode(content),
            "branch": self.config.commit_branch,
        });
        if let Some(sha) = prior_sha {
            body["sha"] = json!(sha);
        }

        let response = self
            .http_client
            .put(self.contents_url(repo, path))
            .bearer_auth(&credential.token)
            .header("accept", "application/vnd.github+json")
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::classify_failure(response));
        }
        let body: PutContentsResponse = response
            .json()
            .await
            .map_err(|e| HostingError::Protocol(e.to_string()))?;
        Ok(body.commit.sha)
    }
}

#[async_trait]
impl HostingClient for RestHostingClient {
    async fn commit_files(
        &self,
        repo: &RepoCoords,
        credential: &DelegatedCredential,
        files: &[CommitFile],
        content_digest: &ContentDigest,
    ) -> HostingResult<CommitRecord> {
        // Identical content already committed? The digest marker makes a
        // retried commit a no-op.
        if let Some(marker) = self.get_file(repo, credential, DIGEST_MARKER_PATH).await? {
            if let Some(existing) = marker.content.as_deref().and_then(decode_marker) {
                if existing == *content_digest {
                    debug!(repo = %repo, digest = %content_digest.short(), "content already committed");
                    return Ok(CommitRecord {
                        revision: marker.sha,
                        file_count: files.len() as u64,
                        visibility_public: false,
                        pages_enabled: false,
                    });
                }
            }
        }

        let message = format!("pixelport: publish {}", content_digest.short());
        for file in files {
            let prior = self.get_file(repo, credential, &file.path).await?;
            self.put_file(
                repo,
                credential,
                &file.path,
                &file.content,
                prior.as_ref().map(|c| c.sha.as_str()),
                &message,
            )
            .await?;
        }

        // Marker goes last so a partially-applied commit never looks
        // complete; its commit sha is the published revision.
        let prior_marker = self.get_file(repo, credential, DIGEST_MARKER_PATH).await?;
        let revision = self
            .put_file(
                repo,
                credential,
                DIGEST_MARKER_PATH,
                content_digest.as_str().as_bytes(),
                prior_marker.as_ref().map(|c| c.sha.as_str()),
                &message,
            )
            .await?;

        info!(repo = %repo, revision = %revision, files = files.len(), "file set committed");
        Ok(CommitRecord {
            revision,
            file_count: files.len() as u64,
            visibility_public: false,
            pages_enabled: false,
        })
    }

    async fn set_visibility(
        &self,
        repo: &RepoCoords,
        credential: &DelegatedCredential,
        public: bool,
    ) -> HostingResult<()> {
        let response = self
            .http_client
            .patch(self.repo_url(repo))
            .bearer_auth(&credential.token)
            .header("accept", "application/vnd.github+json")
            .json(&json!({ "private": !public }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::classify_failure(response));
        }
        debug!(repo = %repo, public, "visibility updated");
        Ok(())
    }

    async fn enable_pages(
        &self,
        repo: &RepoCoords,
        credential: &DelegatedCredential,
    ) -> HostingResult<()> {
        let response = self
            .http_client
            .post(format!("{}/pages", self.repo_url(repo)))
            .bearer_auth(&credential.token)
            .header("accept", "application/vnd.github+json")
            .json(&json!({
                "source": { "branch": self.config.commit_branch, "path": "/" }
            }))
            .send()
            .await?;

        // Conflict means pages hosting is already enabled.
        if response.status() == StatusCode::CONFLICT {
            debug!(repo = %repo, "pages already enabled");
            return Ok(());
        }
        if !response.status().is_success() {
            return Err(Self::classify_failure(response));
        }
        debug!(repo = %repo, "pages enabled");
        Ok(())
    }

    async fn published_digest(
        &self,
        repo: &RepoCoords,
        credential: &DelegatedCredential,
    ) -> HostingResult<Option<ContentDigest>> {
        let marker = self.get_file(repo, credential, DIGEST_MARKER_PATH).await?;
        Ok(marker
            .and_then(|m| m.content)
            .as_deref()
            .and_then(decode_marker))
    }
}

/// Parse a `Retry-After` header in seconds.
fn parse_retry_after(response: &Response) -> Option<Duration> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Decode a base64 contents payload into a digest. The provider wraps
/// base64 bodies across lines, so whitespace is stripped first.
fn decode_marker(encoded: &str) -> Option<ContentDigest> {
    let compact: String = encoded.split_whitespace().collect();
    let bytes = BASE64.decode(compact).ok()?;
    let text = String::from_utf8(bytes).ok()?;
    ContentDigest::try_from(text.trim().to_string()).ok()
}
