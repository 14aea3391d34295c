//! # Structured Logging Module
//!
//! Environment-aware structured logging for debugging long-running pipeline
//! executions and remote command fan-out.

use std::sync::OnceLock;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize structured logging with environment-specific configuration.
///
/// Safe to call more than once; only the first call installs a subscriber.
pub fn init_structured_logging() {
    LOGGER_INITIALIZED.get_or_init(|| {
        let environment = get_environment();
        let log_level = get_log_level(&environment);

        let subscriber = tracing_subscriber::registry().with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_level(true)
                .with_filter(EnvFilter::new(log_level)),
        );

        // Use try_init to avoid panic if a global subscriber already exists
        if subscriber.try_init().is_err() {
            tracing::debug!("global tracing subscriber already initialized");
        }

        tracing::info!(environment = %environment, "structured logging initialized");
    });
}

/// Get current environment from environment variables
fn get_environment() -> String {
    std::env::var("DBFLOW_ENV")
        .or_else(|_| std::env::var("APP_ENV"))
        .unwrap_or_else(|_| "development".to_string())
}

/// Get log level based on environment
fn get_log_level(environment: &str) -> String {
    match environment {
        "production" => "info".to_string(),
        _ => "debug".to_string(),
    }
}

/// Log structured data for pipeline node transitions
pub fn log_node_transition(
    root_id: &str,
    node_id: &str,
    node_name: &str,
    from: Option<&str>,
    to: &str,
) {
    tracing::info!(
        root_id = %root_id,
        node_id = %node_id,
        node_name = %node_name,
        from = from,
        to = %to,
        "NODE_TRANSITION"
    );
}

/// Log structured data for remote command dispatch
pub fn log_remote_dispatch(root_id: &str, node_id: &str, addresses: &[String], cloud_id: i64) {
    tracing::info!(
        root_id = %root_id,
        node_id = %node_id,
        addresses = ?addresses,
        cloud_id = cloud_id,
        "REMOTE_DISPATCH"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_mapping() {
        assert_eq!(get_log_level("production"), "info");
        assert_eq!(get_log_level("development"), "debug");
        assert_eq!(get_log_level("test"), "debug");
    }
}
