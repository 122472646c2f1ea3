//! Consistency monitor scenarios: digest read-back, auto-hide, audit trail.

use std::io::{Cursor, Write};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

use pixelport_core::{
    ConsistencyMonitor, PipelineDeps, RecordingNotifier, RetryPolicy, Scheduler, SchedulerConfig,
    ValidationLimits, VerifyOutcome,
};
use pixelport_hosting::FakeHostingClient;
use pixelport_store::fakes::{
    MemoryArchiveStore, MemoryAuditLog, MemoryInstallationRegistry, MemoryJobStore,
    MemoryPostStore,
};
use pixelport_store::{
    ArchiveStore, AuditLog, ContentDigest, DelegatedCredential, Installation,
    InstallationRegistry, JobState, PostId, PostStore, PublishJob, RepoCoords, UserId,
    AUDIT_ACTION_AUTO_HIDE,
};

struct Rig {
    scheduler: Arc<Scheduler>,
    monitor: ConsistencyMonitor,
    registry: Arc<MemoryInstallationRegistry>,
    archives: Arc<MemoryArchiveStore>,
    posts: Arc<MemoryPostStore>,
    audit: Arc<MemoryAuditLog>,
    hosting: Arc<FakeHostingClient>,
}

fn start_rig() -> Rig {
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
        audit: audit.clone(),
        hosting: hosting.clone(),
        notifier,
    };
    let monitor = ConsistencyMonitor::new(deps.clone());
    let scheduler = Scheduler::start(
        deps,
        ValidationLimits::default(),
        RetryPolicy::default(),
        SchedulerConfig {
            workers: 1,
            job_timeout: Duration::from_secs(10),
            queue_depth: 8,
        },
    );

    Rig {
        scheduler,
        monitor,
        registry,
        archives,
        posts,
        audit,
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

async fn publish(rig: &Rig, installation: &Installation, post: &PostId) -> PublishJob {
    rig.posts.insert_post(post, "artwork");
    let digest = rig
        .archives
        .put(&make_zip(&[("index.html", b"<html>pixels</html>")]))
        .await
        .unwrap();
    let job = rig
        .scheduler
        .submit(post, &installation.id, &digest)
        .await
        .unwrap();
    let done = rig
        .scheduler
        .wait_for_terminal(&job.id, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(done.state, JobState::Committed);
    done
}

#[tokio::test]
async fn clean_publish_verifies_as_match() {
    let rig = start_rig();
    let installation = bind(&rig, "alice", "alice", "pixels").await;
    let post = PostId::from("post-1");
    let job = publish(&rig, &installation, &post).await;

    let outcome = rig.monitor.verify_job(&job).await.unwrap();
    assert_eq!(outcome, VerifyOutcome::Match);

    // No corrective action, no audit entry, post still published.
    assert!(rig.audit.list().await.unwrap().is_empty());
    assert!(rig.posts.get_post(&post).await.unwrap().published);
}

#[tokio::test]
async fn tampered_content_hides_the_post_with_one_audit_entry() {
    let rig = start_rig();
    let installation = bind(&rig, "bob", "bob", "sprites").await;
    let post = PostId::from("post-2");
    let job = publish(&rig, &installation, &post).await;
    let expected = job.content_digest.clone().unwrap();

    // Someone rewrote the published content behind our back.
    let tampered = ContentDigest::from_bytes(b"tampered content");
    rig.hosting
        .set_published_digest(&installation.repo, Some(tampered.clone()));

    let outcome = rig.monitor.verify_job(&job).await.unwrap();
    assert_eq!(
        outcome,
        VerifyOutcome::Mismatch {
            expected: expected.clone(),
            observed: Some(tampered.clone()),
        }
    );

    // The post is hidden and exactly one audit entry records both hashes.
    let post_record = rig.posts.get_post(&post).await.unwrap();
    assert!(!post_record.published);
    assert!(post_record.hidden_reason.is_some());

    let entries = rig.audit.list().await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].job, job.id);
    assert_eq!(entries[0].expected, expected);
    assert_eq!(entries[0].observed, Some(tampered));
    assert_eq!(entries[0].action, AUDIT_ACTION_AUTO_HIDE);
}

#[tokio::test]
async fn missing_marker_counts_as_mismatch() {
    let rig = start_rig();
    let installation = bind(&rig, "carol", "carol", "tiles").await;
    let post = PostId::from("post-3");
    let job = publish(&rig, &installation, &post).await;

    rig.hosting.set_published_digest(&installation.repo, None);

    let outcome = rig.monitor.verify_job(&job).await.unwrap();
    assert!(matches!(
        outcome,
        VerifyOutcome::Mismatch { observed: None, .. }
    ));
    assert_eq!(rig.audit.list().await.unwrap().len(), 1);
}

#[tokio::test]
async fn sweep_reverifies_all_committed_jobs() {
    let rig = start_rig();
    let good_installation = bind(&rig, "dave", "dave", "art").await;
    let bad_installation = bind(&rig, "erin", "erin", "pix").await;

    let good_post = PostId::from("post-4");
    let bad_post = PostId::from("post-5");
    publish(&rig, &good_installation, &good_post).await;
    publish(&rig, &bad_installation, &bad_post).await;

    rig.hosting.set_published_digest(
        &bad_installation.repo,
        Some(ContentDigest::from_bytes(b"corrupted")),
    );

    let outcomes = rig.monitor.sweep().await.unwrap();
    assert_eq!(outcomes.len(), 2);

    let matches = outcomes
        .iter()
        .filter(|(_, o)| *o == VerifyOutcome::Match)
        .count();
    assert_eq!(matches, 1);

    assert!(rig.posts.get_post(&good_post).await.unwrap().published);
    assert!(!rig.posts.get_post(&bad_post).await.unwrap().published);
    assert_eq!(rig.audit.list().await.unwrap().len(), 1);
}

#[tokio::test]
async fn pipeline_runs_the_check_as_its_final_step() {
    let rig = start_rig();
    let installation = bind(&rig, "frank", "frank", "dots").await;
    let post = PostId::from("post-6");

    // Force the read-back to disagree before the publish even starts: the
    // pipeline's own synchronous verification must then hide the post.
    rig.hosting.set_published_digest(
        &installation.repo,
        Some(ContentDigest::from_bytes(b"poisoned")),
    );

    let job = publish(&rig, &installation, &post).await;
    assert_eq!(job.state, JobState::Committed);

    let post_record = rig.posts.get_post(&post).await.unwrap();
    assert!(!post_record.published);
    assert_eq!(rig.audit.list().await.unwrap().len(), 1);
    assert_eq!(rig.audit.list().await.unwrap()[0].job, job.id);
}
