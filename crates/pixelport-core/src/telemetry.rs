//! Tracing setup for Pixelport binaries.
//!
//! [`init_tracing`] wires up the global subscriber once per process:
//! `RUST_LOG` wins when set, the caller's default level applies otherwise,
//! and `json = true` switches to newline-delimited JSON for log shippers.
//! Repeat calls are no-ops, so library consumers and tests can call it
//! without coordinating.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Install the global tracing subscriber, if none is installed yet.
pub fn init_tracing(json: bool, default_level: Level) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level.as_str()));

    let registry = tracing_subscriber::registry().with(filter);
    let result = if json {
        registry
            .with(fmt::layer().with_target(false).json())
            .try_init()
    } else {
        registry.with(fmt::layer().with_target(false)).try_init()
    };
    // Err means a subscriber is already set; keep the existing one.
    result.ok();
}
