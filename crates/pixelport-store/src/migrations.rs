//! SurrealDB schema migrations and initialization
//!
//! This module provides initialization functions to set up all tables
//! with proper constraints and indexes.

use crate::Result;
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

/// Initialize all Pixelport tables in SurrealDB
///
/// This should be called once on first connection to set up the schema.
/// Safe to call multiple times (idempotent).
pub async fn init_schema(db: &Surreal<Any>) -> Result<()> {
    info!("Initializing Pixelport SurrealDB schema");

    init_publish_jobs_table(db).await?;
    init_job_events_table(db).await?;
    init_installations_table(db).await?;
    init_audit_log_table(db).await?;

    info!("Pixelport schema initialization complete");
    Ok(())
}

/// Initialize `publish_jobs` table with constraints and indexes
///
/// Constraints:
/// - `job_id` is unique
/// - `state` transitions: queued -> validating -> committing -> publishing
///   -> committed, failed reachable from any non-terminal state
///   (enforced via app logic)
/// - Terminal jobs are immutable (enforced via app logic)
async fn init_publish_jobs_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing publish_jobs table");

    let sql = r#"
        DEFINE TABLE publish_jobs AS
            SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR read FULL
                FOR update FULL
                FOR delete NONE;

        -- Ensure job_id is unique
        DEFINE INDEX idx_job_id ON TABLE publish_jobs COLUMNS job_id UNIQUE;

        -- Index (installation_id, post_id) for the in-flight uniqueness probe
        DEFINE INDEX idx_installation_post ON TABLE publish_jobs COLUMNS installation_id, post_id;

        -- Index state for worker and sweep queries
        DEFINE INDEX idx_state ON TABLE publish_jobs COLUMNS state;

        -- Index created_at for newest-first listings
        DEFINE INDEX idx_created_at ON TABLE publish_jobs COLUMNS created_at DESC;
    "#;

    db.query(sql).await?;
    info!("✓ publish_jobs table initialized");
    Ok(())
}

/// Initialize `publish_job_events` table
///
/// Constraints:
/// - `(job_id, seq)` is unique; seq is 1-indexed and monotonic per job
///   (computed during append)
async fn init_job_events_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing publish_job_events table");

    let sql = r#"
        DEFINE TABLE publish_job_events AS
            SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR read FULL
                FOR update NONE
                FOR delete NONE;

        -- Composite unique index: no duplicate sequences per job
        DEFINE INDEX idx_job_id_seq ON TABLE publish_job_events COLUMNS job_id, seq UNIQUE;

        -- Index job_id for fast retrieval
        DEFINE INDEX idx_job_id ON TABLE publish_job_events COLUMNS job_id;
    "#;

    db.query(sql).await?;
    info!("✓ publish_job_events table initialized");
    Ok(())
}

/// Initialize `installations` table
///
/// Semantics:
/// - One active (non-revoked) binding per (user_id, repo_owner, repo_name);
///   rebinding revokes the predecessor (enforced during bind)
async fn init_installations_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing installations table");

    let sql = r#"
        DEFINE TABLE installations AS
            SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR read FULL
                FOR update FULL
                FOR delete NONE;

        DEFINE INDEX idx_installation_id ON TABLE installations COLUMNS installation_id UNIQUE;

        -- Index (user_id, repo_owner, repo_name) for the upsert probe
        DEFINE INDEX idx_user_repo ON TABLE installations COLUMNS user_id, repo_owner, repo_name;

        -- Index revoked for active-binding scans
        DEFINE INDEX idx_revoked ON TABLE installations COLUMNS revoked;
    "#;

    db.query(sql).await?;
    info!("✓ installations table initialized");
    Ok(())
}

/// Initialize `audit_log` table (append-only)
async fn init_audit_log_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing audit_log table");

    let sql = r#"
        DEFINE TABLE audit_log AS
            SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR read FULL
                FOR update NONE
                FOR delete NONE;

        DEFINE INDEX idx_post_id ON TABLE audit_log COLUMNS post_id;
        DEFINE INDEX idx_recorded_at ON TABLE audit_log COLUMNS recorded_at DESC;
    "#;

    db.query(sql).await?;
    info!("✓ audit_log table initialized");
    Ok(())
}
