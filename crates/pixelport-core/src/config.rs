//! Injected policy configuration.
//!
//! The banned-format list, the link-host allow-list, and all size caps are
//! policy data handed to the pipeline, never hard-coded in the rules.
//! Environment-variable construction follows the usual `from_env` pattern;
//! unset variables fall back to the defaults.

use std::time::Duration;

/// Limits and policy lists applied by the relay validator.
#[derive(Debug, Clone)]
pub struct ValidationLimits {
    /// Maximum size of the uploaded archive itself.
    pub max_archive_bytes: u64,
    /// Maximum total uncompressed size across all entries.
    pub max_total_bytes: u64,
    /// Maximum uncompressed size of a single entry.
    pub max_entry_bytes: u64,
    /// Maximum number of entries.
    pub max_entries: usize,
    /// Extensions accepted for publishing (lowercase, no dot).
    pub allowed_extensions: Vec<String>,
    /// Extensions always rejected, regardless of the allow list.
    /// Vector image formats live here: they can embed script.
    pub banned_extensions: Vec<String>,
    /// Hosts external resource URLs may point at. Entries match the host
    /// exactly or as a parent domain (`github.io` covers `alice.github.io`).
    pub allowed_link_hosts: Vec<String>,
}

impl Default for ValidationLimits {
    fn default() -> Self {
        ValidationLimits {
            max_archive_bytes: 32 * 1024 * 1024,
            max_total_bytes: 64 * 1024 * 1024,
            max_entry_bytes: 8 * 1024 * 1024,
            max_entries: 512,
            allowed_extensions: [
                "png", "gif", "jpg", "jpeg", "webp", "bmp", "ico", "html", "css", "js", "json",
                "txt", "md",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            banned_extensions: ["svg", "svgz"].iter().map(|s| s.to_string()).collect(),
            allowed_link_hosts: ["raw.githubusercontent.com", "github.io"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl ValidationLimits {
    /// Create limits from environment variables, falling back to defaults.
    ///
    /// Recognized: `PIXELPORT_MAX_ARCHIVE_BYTES`, `PIXELPORT_MAX_ENTRIES`,
    /// `PIXELPORT_ALLOWED_LINK_HOSTS` (comma-separated).
    pub fn from_env() -> Self {
        let mut limits = Self::default();
        if let Some(v) = env_u64("PIXELPORT_MAX_ARCHIVE_BYTES") {
            limits.max_archive_bytes = v;
        }
        if let Some(v) = env_u64("PIXELPORT_MAX_ENTRIES") {
            limits.max_entries = v as usize;
        }
        if let Ok(hosts) = std::env::var("PIXELPORT_ALLOWED_LINK_HOSTS") {
            limits.allowed_link_hosts = hosts
                .split(',')
                .map(|h| h.trim().to_string())
                .filter(|h| !h.is_empty())
                .collect();
        }
        limits
    }

    /// Whether a URL host is acceptable for embedded resources.
    pub fn host_allowed(&self, host: &str) -> bool {
        self.allowed_link_hosts.iter().any(|allowed| {
            host == allowed || host.ends_with(&format!(".{allowed}"))
        })
    }
}

/// Worker pool sizing and per-job budgets.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Number of concurrent workers.
    pub workers: usize,
    /// Wall-clock budget per job; exceeded jobs fail with `Timeout`.
    pub job_timeout: Duration,
    /// Queued-job channel depth.
    pub queue_depth: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            workers: 4,
            job_timeout: Duration::from_secs(300),
            queue_depth: 64,
        }
    }
}

impl SchedulerConfig {
    /// Create a config from environment variables
    /// (`PIXELPORT_WORKERS`, `PIXELPORT_JOB_TIMEOUT_SECS`).
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(v) = env_u64("PIXELPORT_WORKERS") {
            config.workers = (v as usize).max(1);
        }
        if let Some(v) = env_u64("PIXELPORT_JOB_TIMEOUT_SECS") {
            config.job_timeout = Duration::from_secs(v);
        }
        config
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
