//! Pixelport - Artwork Publishing Pipeline CLI
//!
//! The `pixelport` command drives the publishing pipeline from a terminal.
//!
//! ## Commands
//!
//! - `bind`: Bind a user's delegated credential to a target repository
//! - `submit`: Validate and publish a pixel-art archive
//! - `status` / `jobs`: Inspect publish jobs
//! - `cancel`: Request cancellation of an in-flight job
//! - `verify`: Re-run the consistency check for a committed job
//! - `audit`: Show the append-only consistency audit log

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{Duration as ChronoDuration, Utc};
use clap::{Parser, Subcommand};
use tracing::{info, Level};

use pixelport_core::{
    ConsistencyMonitor, PipelineDeps, RetryPolicy, Scheduler, SchedulerConfig, TracingNotifier,
    ValidationLimits, VerifyOutcome,
};
use pixelport_hosting::{FakeHostingClient, HostingClient, RestHostingClient};
use pixelport_store::fakes::{MemoryArchiveStore, MemoryPostStore};
use pixelport_store::{
    connect_from_env, ArchiveStore, AuditLog, DelegatedCredential, InstallationId,
    InstallationRegistry, JobId, JobStore, PostId, PublishJob, RepoCoords,
    SurrealAuditLog, SurrealInstallationRegistry, SurrealJobStore, UserId,
};

#[derive(Parser)]
#[command(name = "pixelport")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Artwork publishing pipeline", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Use the in-memory fake provider instead of the real hosting API
    #[arg(long, global = true)]
    dry_run: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Bind a delegated credential to a target repository
    Bind {
        /// Owning user identifier
        #[arg(long)]
        user: String,

        /// Target repository as owner/name
        #[arg(long)]
        repo: String,

        /// Delegated token issued by the provider
        #[arg(long, env = "PIXELPORT_TOKEN")]
        token: String,

        /// Hours until the credential expires
        #[arg(long, default_value_t = 8)]
        expires_hours: i64,

        /// Permission scopes captured at delegation time
        #[arg(long, value_delimiter = ',', default_value = "contents:write,pages:write")]
        scopes: Vec<String>,
    },

    /// List installation bindings
    Installations,

    /// Validate and publish a pixel-art archive
    Submit {
        /// Target post identifier
        #[arg(long)]
        post: String,

        /// Installation to publish through
        #[arg(long)]
        installation: String,

        /// Path to the archive (zip)
        archive: PathBuf,

        /// Return immediately instead of waiting for the job to finish
        #[arg(long)]
        no_wait: bool,
    },

    /// Show one publish job
    Status {
        /// Job identifier
        job: String,
    },

    /// List publish jobs, newest first
    Jobs,

    /// Request cancellation of an in-flight job
    Cancel {
        /// Job identifier
        job: String,
    },

    /// Re-run the consistency check for a committed job
    Verify {
        /// Job identifier
        job: String,
    },

    /// Show the consistency audit log
    Audit,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    pixelport_core::init_tracing(cli.json, level);

    let db = connect_from_env()
        .await
        .context("Failed to connect to the Pixelport database")?;
    let jobs = Arc::new(SurrealJobStore::new(db.clone()));
    let registry = Arc::new(SurrealInstallationRegistry::new(db.clone()));
    let audit = Arc::new(SurrealAuditLog::new(db));

    let hosting: Arc<dyn HostingClient> = if cli.dry_run {
        info!("dry run: using the in-memory fake provider");
        Arc::new(FakeHostingClient::new())
    } else {
        Arc::new(RestHostingClient::from_env().context("Failed to build hosting client")?)
    };

    match cli.command {
        Commands::Bind {
            user,
            repo,
            token,
            expires_hours,
            scopes,
        } => cmd_bind(&*registry, &user, &repo, token, expires_hours, scopes).await,
        Commands::Installations => cmd_installations(&*registry).await,
        Commands::Submit {
            post,
            installation,
            archive,
            no_wait,
        } => {
            cmd_submit(
                jobs,
                registry,
                audit,
                hosting,
                &post,
                &installation,
                &archive,
                no_wait,
            )
            .await
        }
        Commands::Status { job } => cmd_status(&*jobs, &job).await,
        Commands::Jobs => cmd_jobs(&*jobs).await,
        Commands::Cancel { job } => cmd_cancel(&*jobs, &job).await,
        Commands::Verify { job } => cmd_verify(jobs, registry, audit, hosting, &job).await,
        Commands::Audit => cmd_audit(&*audit).await,
    }
}

/// Bind a delegated credential to a target repository
async fn cmd_bind(
    registry: &SurrealInstallationRegistry,
    user: &str,
    repo: &str,
    token: String,
    expires_hours: i64,
    scopes: Vec<String>,
) -> Result<()> {
    let repo: RepoCoords = repo
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid repository coordinates: {e}"))?;

    let installation = registry
        .bind(
            &UserId::from(user),
            repo,
            DelegatedCredential {
                token,
                expires_at: Utc::now() + ChronoDuration::hours(expires_hours),
                scopes,
            },
        )
        .await
        .context("Failed to bind installation")?;

    println!("Bound installation {}", installation.id);
    println!("  repository: {}", installation.repo);
    println!("  expires:    {}", installation.credential.expires_at);
    Ok(())
}

/// List installation bindings
async fn cmd_installations(registry: &SurrealInstallationRegistry) -> Result<()> {
    let installations = registry.list().await?;
    if installations.is_empty() {
        println!("No installations bound yet");
        return Ok(());
    }

    for installation in installations {
        let mut flags = Vec::new();
        if installation.revoked {
            flags.push("revoked");
        }
        if installation.needs_revalidation {
            flags.push("needs re-validation");
        }
        let suffix = if flags.is_empty() {
            String::new()
        } else {
            format!(" ({})", flags.join(", "))
        };
        println!(
            "{}  {}  user={}{}",
            installation.id, installation.repo, installation.user, suffix
        );
    }
    Ok(())
}

/// Validate and publish an archive
#[allow(clippy::too_many_arguments)]
async fn cmd_submit(
    jobs: Arc<SurrealJobStore>,
    registry: Arc<SurrealInstallationRegistry>,
    audit: Arc<SurrealAuditLog>,
    hosting: Arc<dyn HostingClient>,
    post: &str,
    installation: &str,
    archive_path: &PathBuf,
    no_wait: bool,
) -> Result<()> {
    let archive_bytes = std::fs::read(archive_path)
        .context(format!("Failed to read archive: {archive_path:?}"))?;

    // Archive content and the post record come from external collaborators
    // in production; the CLI stands them in per invocation.
    let archives = Arc::new(MemoryArchiveStore::new());
    let posts = Arc::new(MemoryPostStore::new());
    let post_id = PostId::from(post);
    posts.insert_post(&post_id, post);

    let archive_digest = archives.put(&archive_bytes).await?;
    info!("archive stored as {}", archive_digest.short());

    let deps = PipelineDeps {
        jobs,
        installations: registry,
        archives,
        posts,
        audit,
        hosting,
        notifier: Arc::new(TracingNotifier),
    };
    let scheduler = Scheduler::start(
        deps,
        ValidationLimits::from_env(),
        RetryPolicy::default(),
        SchedulerConfig::from_env(),
    );

    let job = scheduler
        .submit(&post_id, &InstallationId::from(installation), &archive_digest)
        .await?;
    println!("Job {} queued", job.id);

    if no_wait {
        scheduler.shutdown().await;
        return Ok(());
    }

    let done = scheduler
        .wait_for_terminal(&job.id, Duration::from_secs(600))
        .await?;
    scheduler.shutdown().await;

    print_job(&done);
    if done.state != pixelport_store::JobState::Committed {
        anyhow::bail!("publish did not complete");
    }
    Ok(())
}

/// Show one publish job
async fn cmd_status(jobs: &SurrealJobStore, job: &str) -> Result<()> {
    let job = jobs.get_job(&JobId::from(job)).await?;
    print_job(&job);
    Ok(())
}

/// List publish jobs, newest first
async fn cmd_jobs(jobs: &SurrealJobStore) -> Result<()> {
    let records = jobs.list_jobs().await?;
    if records.is_empty() {
        println!("No publish jobs yet");
        return Ok(());
    }
    for job in records {
        println!(
            "{}  {}  post={}  attempts={}",
            job.id, job.state, job.post, job.attempts
        );
    }
    Ok(())
}

/// Request cancellation of an in-flight job
async fn cmd_cancel(jobs: &SurrealJobStore, job: &str) -> Result<()> {
    let id = JobId::from(job);
    match jobs.request_cancel(&id).await {
        Ok(_) => {
            println!("Cancellation accepted for {id}");
            Ok(())
        }
        Err(pixelport_store::StorageError::TerminalJob { state, .. }) => {
            println!("Too late: job {id} already {state}");
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}

/// Re-run the consistency check for a committed job
async fn cmd_verify(
    jobs: Arc<SurrealJobStore>,
    registry: Arc<SurrealInstallationRegistry>,
    audit: Arc<SurrealAuditLog>,
    hosting: Arc<dyn HostingClient>,
    job: &str,
) -> Result<()> {
    let job = jobs.get_job(&JobId::from(job)).await?;

    let posts = Arc::new(MemoryPostStore::new());
    posts.insert_post(&job.post, "post");

    let deps = PipelineDeps {
        jobs,
        installations: registry,
        archives: Arc::new(MemoryArchiveStore::new()),
        posts,
        audit,
        hosting,
        notifier: Arc::new(TracingNotifier),
    };
    let monitor = ConsistencyMonitor::new(deps);

    match monitor.verify_job(&job).await? {
        VerifyOutcome::Match => {
            println!("Published digest matches the expected hash");
        }
        VerifyOutcome::Mismatch { expected, observed } => {
            println!("MISMATCH - the post has been hidden");
            println!("  expected: {expected}");
            match observed {
                Some(observed) => println!("  observed: {observed}"),
                None => println!("  observed: <no digest marker>"),
            }
        }
    }
    Ok(())
}

/// Show the consistency audit log
async fn cmd_audit(audit: &SurrealAuditLog) -> Result<()> {
    let entries = audit.list().await?;
    if entries.is_empty() {
        println!("Audit log is empty");
        return Ok(());
    }
    for entry in entries {
        println!(
            "{}  job={}  post={}  expected={}  observed={}",
            entry.recorded_at,
            entry.job,
            entry.post,
            entry.expected.short(),
            entry
                .observed
                .as_ref()
                .map(|d| d.short().to_string())
                .unwrap_or_else(|| "<missing>".to_string()),
        );
    }
    Ok(())
}

fn print_job(job: &PublishJob) {
    println!("Job {}", job.id);
    println!("  state:    {}", job.state);
    println!("  post:     {}", job.post);
    println!("  attempts: {}", job.attempts);
    if let Some(digest) = &job.content_digest {
        println!("  digest:   {digest}");
    }
    if let Some(commit) = &job.commit {
        println!("  revision: {}", commit.revision);
        println!("  files:    {}", commit.file_count);
        println!("  public:   {}", commit.visibility_public);
        println!("  pages:    {}", commit.pages_enabled);
    }
    if let Some(error) = &job.last_error {
        println!("  error:    {} ({})", error.message, error.kind);
    }
}
