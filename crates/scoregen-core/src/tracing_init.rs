//! Shared tracing/logging initialization.
//!
//! The `scoregen` binary and any embedding shell use the same pattern for
//! setting up `tracing_subscriber` with an env-filter and optional JSON output.
//! Logs always go to stderr: stdout belongs to command results.

use std::io;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialise the global tracing subscriber.
///
/// * `default_filter` -- default `RUST_LOG` value when the env-var is not set
///   (e.g. `"scoregen_bridge=info"`).
/// * `log_json` -- when `true`, emit structured JSON log lines instead of the
///   human-readable format.
pub fn init_tracing(default_filter: &str, log_json: bool) {
    let env_filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.into()),
    );
    if log_json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json().with_writer(io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
            .init();
    }
}

/// Build the default filter directive for all `ScoreGen` crates at `level`.
pub fn default_filter(level: &str) -> String {
    ["scoregen", "scoregen_core", "scoregen_bridge"]
        .iter()
        .map(|target| format!("{target}={level}"))
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_filter_covers_every_crate() {
        let filter = default_filter("debug");
        assert_eq!(
            filter,
            "scoregen=debug,scoregen_core=debug,scoregen_bridge=debug"
        );
    }
}
