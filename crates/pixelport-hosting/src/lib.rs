//! Pixelport-Hosting: Git-hosting provider client
//!
//! Wraps the provider's HTTP API behind the [`HostingClient`] trait:
//! committing validated file sets, flipping repository visibility, and
//! enabling static-page hosting. Encodes the provider's rate-limit and
//! transient-failure semantics in [`HostingError`] so the scheduler can
//! retry the right things.

pub mod client;
mod error;
pub mod fake;
mod rest;

pub use client::{CommitFile, HostingClient, HostingResult, DIGEST_MARKER_PATH};
pub use error::HostingError;
pub use fake::FakeHostingClient;
pub use rest::{HostingConfig, RestHostingClient};
