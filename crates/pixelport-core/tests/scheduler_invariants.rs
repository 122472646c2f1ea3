//! Scheduler invariants: duplicate submits, cancellation windows, and the
//! per-job wall-clock budget.

use std::io::{Cursor, Write};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

use pixelport_core::{
    CancelOutcome, PipelineDeps, PublishError, RecordingNotifier, RetryPolicy, Scheduler,
    SchedulerConfig, ValidationLimits,
};
use pixelport_hosting::{FakeHostingClient, HostingError};
use pixelport_store::fakes::{
    MemoryArchiveStore, MemoryAuditLog, MemoryInstallationRegistry, MemoryJobStore,
    MemoryPostStore,
};
use pixelport_store::{
    ArchiveStore, ContentDigest, DelegatedCredential, Installation, InstallationRegistry, JobId,
    JobErrorKind, JobState, PostId, RepoCoords, UserId,
};

struct Rig {
    scheduler: Arc<Scheduler>,
    registry: Arc<MemoryInstallationRegistry>,
    archives: Arc<MemoryArchiveStore>,
    posts: Arc<MemoryPostStore>,
    hosting: Arc<FakeHostingClient>,
}

fn start_rig(retry: RetryPolicy, config: SchedulerConfig) -> Rig {
    let jobs = Arc::new(MemoryJobStore::new());
    let registry = Arc::new(MemoryInstallationRegistry::new());
    let archives = Arc::new(MemoryArchiveStore::new());
    let posts = Arc::new(MemoryPostStore::new());
    let audit = Arc::new(MemoryAuditLog::new());
    let hosting = Arc::new(FakeHostingClient::new());
    let notifier = Arc::new(RecordingNotifier::new());

    let deps = PipelineDeps {
        jobs,
        installations: registry.clone(),
        archives: archives.clone(),
        posts: posts.clone(),
        audit,
        hosting: hosting.clone(),
        notifier,
    };
    let scheduler = Scheduler::start(deps, ValidationLimits::default(), retry, config);

    Rig {
        scheduler,
        registry,
        archives,
        posts,
        hosting,
    }
}

fn make_zip(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default();
    for (name, content) in entries {
        writer.start_file(name.to_string(), options).unwrap();
        writer.write_all(content).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

async fn bind(rig: &Rig, user: &str, owner: &str, name: &str) -> Installation {
    rig.registry
        .bind(
            &UserId::from(user),
            RepoCoords::new(owner, name),
            DelegatedCredential {
                token: format!("ghs_{user}"),
                expires_at: Utc::now() + chrono::Duration::hours(1),
                scopes: vec![],
            },
        )
        .await
        .unwrap()
}

async fn archive(rig: &Rig) -> ContentDigest {
    rig.archives
        .put(&make_zip(&[("index.html", b"<html>pixels</html>")]))
        .await
        .unwrap()
}

/// Poll until the job reaches `state` (or panic after the deadline).
async fn wait_for_state(rig: &Rig, id: &JobId, state: JobState) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let job = rig.scheduler.job(id).await.unwrap();
        if job.state == state {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "job never reached {state}, stuck in {}",
            job.state
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn second_submit_while_committing_returns_conflict() {
    let rig = start_rig(
        RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(50),
            max_jitter: Duration::ZERO,
        },
        SchedulerConfig {
            workers: 2,
            job_timeout: Duration::from_secs(10),
            queue_depth: 8,
        },
    );
    let installation = bind(&rig, "alice", "alice", "pixels").await;
    let post = PostId::from("post-1");
    rig.posts.insert_post(&post, "conflict test");

    // Keep the first job in COMMITTING for a few retry rounds.
    for _ in 0..4 {
        rig.hosting
            .push_commit_failure(HostingError::RateLimited { retry_after: None });
    }

    let digest = archive(&rig).await;
    let first = rig
        .scheduler
        .submit(&post, &installation.id, &digest)
        .await
        .unwrap();
    wait_for_state(&rig, &first.id, JobState::Committing).await;

    // Same (installation, post) while in flight: rejected, not queued twice.
    let err = rig
        .scheduler
        .submit(&post, &installation.id, &digest)
        .await
        .unwrap_err();
    assert!(matches!(err, PublishError::Conflict { .. }));

    // The first job is unaffected and still completes.
    let done = rig
        .scheduler
        .wait_for_terminal(&first.id, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(done.state, JobState::Committed);

    // Once terminal, a new submit for the pair is accepted again.
    rig.scheduler
        .submit(&post, &installation.id, &digest)
        .await
        .unwrap();
}

#[tokio::test]
async fn queued_job_cancels_before_any_side_effect() {
    let rig = start_rig(
        RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(40),
            max_delay: Duration::from_millis(40),
            max_jitter: Duration::ZERO,
        },
        SchedulerConfig {
            workers: 1,
            job_timeout: Duration::from_secs(10),
            queue_depth: 8,
        },
    );
    let installation = bind(&rig, "bob", "bob", "sprites").await;
    let blocker_post = PostId::from("post-blocker");
    let queued_post = PostId::from("post-queued");
    rig.posts.insert_post(&blocker_post, "blocker");
    rig.posts.insert_post(&queued_post, "queued");

    // The single worker is busy retrying the blocker.
    for _ in 0..3 {
        rig.hosting
            .push_commit_failure(HostingError::RateLimited { retry_after: None });
    }

    let digest = archive(&rig).await;
    let blocker = rig
        .scheduler
        .submit(&blocker_post, &installation.id, &digest)
        .await
        .unwrap();
    wait_for_state(&rig, &blocker.id, JobState::Committing).await;

    let queued = rig
        .scheduler
        .submit(&queued_post, &installation.id, &digest)
        .await
        .unwrap();
    let outcome = rig.scheduler.cancel(&queued.id).await.unwrap();
    assert_eq!(outcome, CancelOutcome::Accepted);

    let done = rig
        .scheduler
        .wait_for_terminal(&queued.id, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(done.state, JobState::Failed);
    assert_eq!(done.last_error.unwrap().kind, JobErrorKind::Canceled);
}

#[tokio::test]
async fn committing_job_cancels_at_the_retry_boundary() {
    let rig = start_rig(
        RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(40),
            max_delay: Duration::from_millis(40),
            max_jitter: Duration::ZERO,
        },
        SchedulerConfig {
            workers: 1,
            job_timeout: Duration::from_secs(10),
            queue_depth: 8,
        },
    );
    let installation = bind(&rig, "carol", "carol", "tiles").await;
    let post = PostId::from("post-2");
    rig.posts.insert_post(&post, "deferred cancel");

    for _ in 0..6 {
        rig.hosting
            .push_commit_failure(HostingError::Unavailable { status: 503 });
    }

    let digest = archive(&rig).await;
    let job = rig
        .scheduler
        .submit(&post, &installation.id, &digest)
        .await
        .unwrap();
    wait_for_state(&rig, &job.id, JobState::Committing).await;

    let outcome = rig.scheduler.cancel(&job.id).await.unwrap();
    assert_eq!(outcome, CancelOutcome::Accepted);

    let done = rig
        .scheduler
        .wait_for_terminal(&job.id, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(done.state, JobState::Failed);
    assert_eq!(done.last_error.unwrap().kind, JobErrorKind::Canceled);

    // Nothing was ever committed or published.
    assert_eq!(rig.hosting.effective_commits(), 0);
    assert!(!rig.hosting.is_public(&installation.repo));
}

#[tokio::test]
async fn cancel_after_terminal_is_too_late() {
    let rig = start_rig(
        RetryPolicy::default(),
        SchedulerConfig {
            workers: 1,
            job_timeout: Duration::from_secs(10),
            queue_depth: 8,
        },
    );
    let installation = bind(&rig, "dave", "dave", "art").await;
    let post = PostId::from("post-3");
    rig.posts.insert_post(&post, "too late");

    let digest = archive(&rig).await;
    let job = rig
        .scheduler
        .submit(&post, &installation.id, &digest)
        .await
        .unwrap();
    rig.scheduler
        .wait_for_terminal(&job.id, Duration::from_secs(5))
        .await
        .unwrap();

    let outcome = rig.scheduler.cancel(&job.id).await.unwrap();
    assert_eq!(outcome, CancelOutcome::TooLate);
}

#[tokio::test]
async fn wall_clock_budget_fails_the_job_with_timeout() {
    let rig = start_rig(
        RetryPolicy {
            max_attempts: 20,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(50),
            max_jitter: Duration::ZERO,
        },
        SchedulerConfig {
            workers: 1,
            job_timeout: Duration::from_millis(80),
            queue_depth: 8,
        },
    );
    let installation = bind(&rig, "erin", "erin", "pix").await;
    let post = PostId::from("post-4");
    rig.posts.insert_post(&post, "timeout");

    // Enough retries to blow well past the 80ms budget.
    for _ in 0..10 {
        rig.hosting
            .push_commit_failure(HostingError::Unavailable { status: 503 });
    }

    let digest = archive(&rig).await;
    let job = rig
        .scheduler
        .submit(&post, &installation.id, &digest)
        .await
        .unwrap();
    let done = rig
        .scheduler
        .wait_for_terminal(&job.id, Duration::from_secs(5))
        .await
        .unwrap();

    assert_eq!(done.state, JobState::Failed);
    assert_eq!(done.last_error.unwrap().kind, JobErrorKind::Timeout);
}
