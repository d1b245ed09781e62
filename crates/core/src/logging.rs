//! Logging and observability
//!
//! Structured logging setup for the orchestrator. Supports text and JSON
//! formats, controlled at runtime via environment variables and an optional
//! format argument. All log output goes to stderr so stdout stays free for
//! command output and streamed phase logs.

use std::{io, sync::Once};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static INIT: Once = Once::new();

/// Initialize the logging system.
///
/// Sets up tracing-subscriber with either JSON or text formatting. Safe to
/// call multiple times; subsequent calls are no-ops.
///
/// Environment variables:
/// * `KILN_LOG_FORMAT` - "json" for JSON output, anything else for text
/// * `KILN_LOG` - logging filter (falls back to `RUST_LOG`, then "info")
pub fn init(format: Option<&str>) {
    INIT.call_once(|| {
        let filter = create_env_filter(None);

        let env_format = std::env::var("KILN_LOG_FORMAT").ok();
        let effective_format = format.or(env_format.as_deref()).unwrap_or("text");

        if effective_format == "json" {
            let layer = fmt::layer()
                .json()
                .with_writer(io::stderr)
                .with_target(true)
                .with_current_span(true);
            tracing_subscriber::registry().with(filter).with(layer).init();
        } else {
            let layer = fmt::layer()
                .with_writer(io::stderr)
                .with_target(false)
                .without_time();
            tracing_subscriber::registry().with(filter).with(layer).init();
        }
    });
}

/// Build the env filter from `KILN_LOG`, falling back to `RUST_LOG`,
/// then to the provided default (or "info").
fn create_env_filter(default_directive: Option<&str>) -> EnvFilter {
    let default = default_directive.unwrap_or("info");

    if let Ok(kiln_log) = std::env::var("KILN_LOG") {
        if !kiln_log.is_empty() {
            return EnvFilter::try_new(kiln_log).unwrap_or_else(|_| EnvFilter::new(default));
        }
    }

    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_env_filter_default() {
        std::env::remove_var("KILN_LOG");
        std::env::remove_var("RUST_LOG");
        let filter = create_env_filter(None);
        assert_eq!(filter.to_string(), "info");
    }

    #[test]
    fn test_create_env_filter_explicit_default() {
        std::env::remove_var("KILN_LOG");
        std::env::remove_var("RUST_LOG");
        let filter = create_env_filter(Some("debug"));
        assert_eq!(filter.to_string(), "debug");
    }

    #[test]
    fn test_init_is_idempotent() {
        init(None);
        init(Some("json"));
    }
}
