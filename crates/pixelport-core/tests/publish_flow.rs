//! End-to-end publish scenarios against the in-memory fakes.

use std::io::{Cursor, Write};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

use pixelport_core::{
    PipelineDeps, RecordingNotifier, RetryPolicy, Scheduler, SchedulerConfig, ValidationLimits,
};
use pixelport_hosting::FakeHostingClient;
use pixelport_store::fakes::{
    MemoryArchiveStore, MemoryAuditLog, MemoryInstallationRegistry, MemoryJobStore,
    MemoryPostStore,
};
use pixelport_store::{
    ArchiveStore, AuditLog, ContentDigest, DelegatedCredential, Installation,
    InstallationRegistry, JobState, JobStore, PostId, PostStore, RepoCoords, UserId,
};

const PNG_BYTES: &[u8] = &[
    0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x48, 0x44,
    0x52, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x06, 0x00, 0x00, 0x00,
];

struct Harness {
    scheduler: Arc<Scheduler>,
    jobs: Arc<MemoryJobStore>,
    registry: Arc<MemoryInstallationRegistry>,
    archives: Arc<MemoryArchiveStore>,
    posts: Arc<MemoryPostStore>,
    audit: Arc<MemoryAuditLog>,
    hosting: Arc<FakeHostingClient>,
    notifier: Arc<RecordingNotifier>,
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 5,
        base_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(20),
        max_jitter: Duration::ZERO,
    }
}

fn start_harness() -> Harness {
    let jobs = Arc::new(MemoryJobStore::new());
    let registry = Arc::new(MemoryInstallationRegistry::new());
    let archives = Arc::new(MemoryArchiveStore::new());
    let posts = Arc::new(MemoryPostStore::new());
    let audit = Arc::new(MemoryAuditLog::new());
    let hosting = Arc::new(FakeHostingClient::new());
    let notifier = Arc::new(RecordingNotifier::new());

    let deps = PipelineDeps {
        jobs: jobs.clone(),
        installations: registry.clone(),
        archives: archives.clone(),
        posts: posts.clone(),
        audit: audit.clone(),
        hosting: hosting.clone(),
        notifier: notifier.clone(),
    };
    let scheduler = Scheduler::start(
        deps,
        ValidationLimits::default(),
        fast_retry(),
        SchedulerConfig {
            workers: 2,
            job_timeout: Duration::from_secs(10),
            queue_depth: 16,
        },
    );

    Harness {
        scheduler,
        jobs,
        registry,
        archives,
        posts,
        audit,
        hosting,
        notifier,
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

async fn bind_installation(harness: &Harness, user: &str, repo: &str) -> Installation {
    harness
        .registry
        .bind(
            &UserId::from(user),
            repo.parse::<RepoCoords>().unwrap(),
            DelegatedCredential {
                token: format!("ghs_{user}"),
                expires_at: Utc::now() + chrono::Duration::hours(1),
                scopes: vec!["contents:write".to_string(), "pages:write".to_string()],
            },
        )
        .await
        .unwrap()
}

async fn store_archive(harness: &Harness, entries: &[(&str, &[u8])]) -> ContentDigest {
    harness.archives.put(&make_zip(entries)).await.unwrap()
}

#[tokio::test]
async fn two_file_archive_reaches_committed() {
    let harness = start_harness();
    let installation = bind_installation(&harness, "alice", "alice/pixels").await;
    let post = PostId::from("post-1");
    harness.posts.insert_post(&post, "sunset sprites");

    let archive = store_archive(
        &harness,
        &[
            ("index.html", b"<html><body>sprites</body></html>"),
            ("art/hero.png", PNG_BYTES),
        ],
    )
    .await;

    let job = harness
        .scheduler
        .submit(&post, &installation.id, &archive)
        .await
        .unwrap();
    assert_eq!(job.state, JobState::Queued);

    let done = harness
        .scheduler
        .wait_for_terminal(&job.id, Duration::from_secs(5))
        .await
        .unwrap();

    assert_eq!(done.state, JobState::Committed);
    let commit = done.commit.expect("committed job carries a commit record");
    assert!(!commit.revision.is_empty());
    assert_eq!(commit.file_count, 2);
    assert!(commit.visibility_public);
    assert!(commit.pages_enabled);

    // Expected hash is recorded for the consistency monitor.
    assert!(done.content_digest.is_some());

    // The post record was reconciled.
    let post_record = harness.posts.get_post(&post).await.unwrap();
    assert!(post_record.published);
    assert_eq!(post_record.published_digest, done.content_digest);

    // The repository is public with pages enabled.
    assert!(harness.hosting.is_public(&installation.repo));
    assert!(harness.hosting.pages_enabled(&installation.repo));

    // A clean run produces no audit entries.
    assert!(harness.audit.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn get_job_snapshot_reports_committed_state() {
    let harness = start_harness();
    let installation = bind_installation(&harness, "bob", "bob/sprites").await;
    let post = PostId::from("post-2");
    harness.posts.insert_post(&post, "tileset");

    let archive = store_archive(&harness, &[("tiles.png", PNG_BYTES)]).await;
    let job = harness
        .scheduler
        .submit(&post, &installation.id, &archive)
        .await
        .unwrap();
    harness
        .scheduler
        .wait_for_terminal(&job.id, Duration::from_secs(5))
        .await
        .unwrap();

    let snapshot = harness.scheduler.job(&job.id).await.unwrap();
    assert_eq!(snapshot.state, JobState::Committed);
    assert!(!snapshot.commit.unwrap().revision.is_empty());
}

#[tokio::test]
async fn every_transition_is_notified_and_logged() {
    let harness = start_harness();
    let installation = bind_installation(&harness, "carol", "carol/tiles").await;
    let post = PostId::from("post-3");
    harness.posts.insert_post(&post, "palette study");

    let archive = store_archive(&harness, &[("index.html", b"<html></html>")]).await;
    let job = harness
        .scheduler
        .submit(&post, &installation.id, &archive)
        .await
        .unwrap();
    harness
        .scheduler
        .wait_for_terminal(&job.id, Duration::from_secs(5))
        .await
        .unwrap();

    let states = harness.notifier.states_for(&job.id);
    assert_eq!(
        states,
        vec![
            JobState::Queued,
            JobState::Validating,
            JobState::Committing,
            JobState::Publishing,
            JobState::Committed,
        ]
    );

    let events = harness.jobs.events(&job.id).await.unwrap();
    assert_eq!(events.len(), 4);
    assert_eq!(events[0].from, JobState::Queued);
    assert_eq!(events[3].to, JobState::Committed);
}

#[tokio::test]
async fn republishing_identical_content_is_a_noop_commit() {
    let harness = start_harness();
    let installation = bind_installation(&harness, "dave", "dave/art").await;
    let archive = store_archive(&harness, &[("index.html", b"<html>v1</html>")]).await;

    for post_name in ["post-4a", "post-4b"] {
        let post = PostId::from(post_name);
        harness.posts.insert_post(&post, post_name);
        let job = harness
            .scheduler
            .submit(&post, &installation.id, &archive)
            .await
            .unwrap();
        let done = harness
            .scheduler
            .wait_for_terminal(&job.id, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(done.state, JobState::Committed);
    }

    // Same content digest: the second publish changed nothing repo-side.
    assert_eq!(harness.hosting.commit_calls(), 2);
    assert_eq!(harness.hosting.effective_commits(), 1);
}

#[tokio::test]
async fn scheduler_shutdown_drains_workers() {
    let harness = start_harness();
    let installation = bind_installation(&harness, "erin", "erin/pix").await;
    let post = PostId::from("post-5");
    harness.posts.insert_post(&post, "drain test");

    let archive = store_archive(&harness, &[("a.png", PNG_BYTES)]).await;
    let job = harness
        .scheduler
        .submit(&post, &installation.id, &archive)
        .await
        .unwrap();
    harness
        .scheduler
        .wait_for_terminal(&job.id, Duration::from_secs(5))
        .await
        .unwrap();

    harness.scheduler.shutdown().await;

    let err = harness
        .scheduler
        .submit(&post, &installation.id, &archive)
        .await
        .unwrap_err();
    assert!(matches!(err, pixelport_core::PublishError::Shutdown));
}
