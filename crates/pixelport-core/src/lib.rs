//! Pixelport Core Library
//!
//! The artwork publishing pipeline: validates uploaded pixel-art archives,
//! commits their contents to the bound repository under delegated
//! installation credentials, flips visibility and static-page hosting, and
//! reconciles the published content hash back against the post record.
//!
//! ## Key Components
//!
//! - `validator`: pure security/format gate in front of every publish
//! - `pipeline`: the job state machine driver
//! - `scheduler`: worker pool, submit/cancel surface, per-target invariants
//! - `monitor`: post-commit hash verification with auto-hide
//! - `retry`: bounded backoff with deterministic jitter

pub mod config;
pub mod error;
pub mod monitor;
pub mod notify;
pub mod obs;
pub mod pipeline;
pub mod retry;
pub mod scheduler;
pub mod telemetry;
pub mod validator;

pub use config::{SchedulerConfig, ValidationLimits};
pub use error::{PublishError, Result};
pub use monitor::{ConsistencyMonitor, VerifyOutcome};
pub use notify::{JobNotifier, RecordingNotifier, TracingNotifier};
pub use pipeline::{InstallationLocks, PipelineDeps, PublishPipeline};
pub use retry::RetryPolicy;
pub use scheduler::{CancelOutcome, Scheduler};
pub use telemetry::init_tracing;
pub use validator::{
    file_set_digest, validate, RelayFile, RelayRule, RelayViolation, ValidationResult,
};

/// Pixelport version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
