//! Schema definitions for Pixelport SurrealDB tables
//!
//! Tables:
//! - publish_jobs: Durable publish-job records
//! - publish_job_events: Append-only per-job transition log
//! - installations: Delegated-credential bindings
//! - audit_log: Append-only consistency-check records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Module for serializing chrono DateTime to SurrealDB datetime format
mod surreal_datetime {
    use chrono::{DateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};
    use surrealdb::sql::Datetime as SurrealDatetime;

    pub fn serialize<S>(date: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let sd = SurrealDatetime::from(*date);
        serde::Serialize::serialize(&sd, serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let sd = SurrealDatetime::deserialize(deserializer)?;
        Ok(DateTime::from(sd))
    }
}

/// Publish job row stored in SurrealDB.
///
/// Commit fields are flattened; they are only populated once the provider
/// commit succeeds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRow {
    pub job_id: String,
    pub post_id: String,
    pub installation_id: String,
    pub archive_digest: String,
    pub content_digest: Option<String>,
    pub state: String,
    pub attempts: u32,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
    pub cancel_requested: bool,
    pub commit_revision: Option<String>,
    pub commit_file_count: Option<u64>,
    pub commit_public: Option<bool>,
    pub commit_pages: Option<bool>,
    #[serde(with = "surreal_datetime")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "surreal_datetime")]
    pub transitioned_at: DateTime<Utc>,
}

/// One transition-log row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEventRow {
    pub job_id: String,
    pub seq: u64,
    pub from_state: String,
    pub to_state: String,
    #[serde(with = "surreal_datetime")]
    pub at: DateTime<Utc>,
}

/// Installation binding row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallationRow {
    pub installation_id: String,
    pub user_id: String,
    pub repo_owner: String,
    pub repo_name: String,
    pub token: String,
    #[serde(with = "surreal_datetime")]
    pub expires_at: DateTime<Utc>,
    pub scopes: Vec<String>,
    pub revoked: bool,
    pub needs_revalidation: bool,
    #[serde(with = "surreal_datetime")]
    pub created_at: DateTime<Utc>,
}

/// Audit log row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRow {
    pub job_id: String,
    pub post_id: String,
    pub expected_digest: String,
    pub observed_digest: Option<String>,
    pub action: String,
    #[serde(with = "surreal_datetime")]
    pub recorded_at: DateTime<Utc>,
}
