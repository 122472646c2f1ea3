//! Fire-and-forget job state notifications.
//!
//! The pipeline pings the notifier on every state transition; delivery and
//! fan-out are the transport's responsibility. Implementations must never
//! fail the pipeline.

use std::sync::Mutex;

use async_trait::async_trait;

use pixelport_store::{JobId, JobState};

use crate::obs;

/// Receives a ping on every job state transition.
#[async_trait]
pub trait JobNotifier: Send + Sync {
    async fn job_state_changed(&self, job: &JobId, state: JobState);
}

/// Default notifier: emits a structured tracing event and nothing else.
#[derive(Debug, Default)]
pub struct TracingNotifier;

#[async_trait]
impl JobNotifier for TracingNotifier {
    async fn job_state_changed(&self, job: &JobId, state: JobState) {
        obs::emit_job_state_changed(&job.0, state);
    }
}

/// Test notifier that records every ping.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    seen: Mutex<Vec<(JobId, JobState)>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// All (job, state) pings in arrival order.
    pub fn seen(&self) -> Vec<(JobId, JobState)> {
        self.seen.lock().unwrap().clone()
    }

    /// States seen for one job, in order.
    pub fn states_for(&self, job: &JobId) -> Vec<JobState> {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id == job)
            .map(|(_, state)| *state)
            .collect()
    }
}

#[async_trait]
impl JobNotifier for RecordingNotifier {
    async fn job_state_changed(&self, job: &JobId, state: JobState) {
        self.seen.lock().unwrap().push((job.clone(), state));
    }
}
